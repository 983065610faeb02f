use log::info;
use squadup_realtime::server::calls::CallRegistry;
use squadup_realtime::server::config::ServerConfig;
use squadup_realtime::server::conversations::ConversationStore;
use squadup_realtime::server::database::Database;
use squadup_realtime::server::http::{self, AppState};
use squadup_realtime::server::live_channel::LiveChannel;
use squadup_realtime::server::pipeline::{MessagePipeline, RetryPolicy};
use squadup_realtime::server::rooms::RoomRegistry;
use squadup_realtime::server::socket::{self, SocketServer};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.log_level.clone()),
    )
    .init();

    info!("[MAIN] Starting SquadUp real-time server");

    let db = Arc::new(Database::connect(&config.database_url).await?);
    db.migrate().await?;
    info!("[MAIN] Database ready at {}", config.database_url);

    let live = match &config.redis_url {
        Some(url) => {
            let channel = Arc::new(LiveChannel::with_redis(url).await?);
            channel.start_redis_bridge();
            info!("[MAIN] Live channel mirrored through Redis at {}", url);
            channel
        }
        None => {
            info!("[MAIN] Live channel running in-process, no Redis configured");
            Arc::new(LiveChannel::in_process())
        }
    };

    let store = ConversationStore::new(&db);
    let pipeline = Arc::new(MessagePipeline::new(
        live.clone(),
        Arc::new(store.clone()),
        RetryPolicy {
            attempts: config.index_retry_attempts,
            base_delay: config.index_retry_base_delay,
        },
        config.max_message_length,
    ));

    let rooms = RoomRegistry::new();
    let calls = CallRegistry::new(rooms.clone(), config.ring_timeout);

    // Committed live messages flow into the per-user and per-project rooms
    // for as long as the server runs.
    let _fanout = socket::spawn_message_fanout(&live, rooms.clone());

    let ws_addr = format!("{}:{}", config.host, config.ws_port);
    let socket_server = Arc::new(SocketServer::new(
        db.clone(),
        rooms,
        pipeline.clone(),
        calls.clone(),
        config.clone(),
    ));
    tokio::spawn(async move {
        if let Err(e) = socket_server.run(&ws_addr).await {
            log::error!("[MAIN] Signaling server exited: {}", e);
        }
    });

    let state = AppState {
        db,
        store,
        pipeline,
        calls,
        config: config.clone(),
        upstream: reqwest::Client::new(),
    };
    let http_addr = format!("{}:{}", config.host, config.http_port);
    let listener = tokio::net::TcpListener::bind(&http_addr).await?;
    info!("[MAIN] HTTP API listening on {}", http_addr);
    axum::serve(listener, http::router(state)).await?;
    Ok(())
}
