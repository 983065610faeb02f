//! Manual end-to-end probe against a running squadup-server: exchanges a
//! direct message over the socket, then walks a full call through initiate,
//! accept, signal relay and end over the HTTP API.
//!
//! Run the server first, then: cargo run --bin signal_probe

use anyhow::{bail, Context};
use log::info;
use serde_json::json;
use squadup_realtime::client::signaling::{ReconnectPolicy, SignalingClient, SignalingEvent};
use squadup_realtime::common::models::{ClientEvent, ServerEvent, SignalPayload};
use squadup_realtime::server::auth;
use squadup_realtime::server::config::ServerConfig;
use squadup_realtime::server::database::Database;
use std::time::Duration;
use tokio::sync::mpsc;

async fn expect_event<F>(
    rx: &mut mpsc::UnboundedReceiver<SignalingEvent>,
    what: &str,
    matches: F,
) -> anyhow::Result<ServerEvent>
where
    F: Fn(&ServerEvent) -> bool,
{
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .with_context(|| format!("timed out waiting for {}", what))?
            .context("event stream closed")?;
        if let SignalingEvent::Server(event) = event {
            if matches(&event) {
                return Ok(event);
            }
            info!("[PROBE] skipping {:?} while waiting for {}", event, what);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let config = ServerConfig::from_env();

    // Seed two probe identities straight into the server's session table.
    let db = Database::connect(&config.database_url).await?;
    db.migrate().await?;
    let token_a = auth::create_session(&db, "probe-alice", "Probe Alice", 3600).await?;
    let token_b = auth::create_session(&db, "probe-bob", "Probe Bob", 3600).await?;

    let ws_url = format!("ws://{}:{}", config.host, config.ws_port);
    let http_base = format!("http://{}:{}", config.host, config.http_port);
    info!("[PROBE] Connecting to {} and {}", ws_url, http_base);

    let (alice, _events_a) =
        SignalingClient::connect(&ws_url, &token_a, ReconnectPolicy::default()).await?;
    let (bob, mut events_b) =
        SignalingClient::connect(&ws_url, &token_b, ReconnectPolicy::default()).await?;
    alice.send(ClientEvent::JoinUser)?;
    bob.send(ClientEvent::JoinUser)?;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Direct message over the socket.
    alice.send(ClientEvent::SendPrivateMessage {
        receiver_id: "probe-bob".to_string(),
        content: "probe ping".to_string(),
    })?;
    let got = expect_event(&mut events_b, "new-message", |e| {
        matches!(e, ServerEvent::NewMessage { .. })
    })
    .await?;
    info!("[PROBE] Message delivered: {:?}", got);

    // Full call lifecycle over HTTP, watching bob's socket for the pushes.
    let http = reqwest::Client::new();
    let session: serde_json::Value = http
        .post(format!("{}/video-calls/initiate", http_base))
        .bearer_auth(&token_a)
        .json(&json!({ "receiver_id": "probe-bob", "call_type": "one-on-one" }))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    let session_id = session["id"]
        .as_str()
        .context("initiate response had no session id")?
        .to_string();
    info!("[PROBE] Call {} ringing", session_id);

    expect_event(&mut events_b, "incoming-call", |e| {
        matches!(e, ServerEvent::IncomingCall { .. })
    })
    .await?;

    http.put(format!("{}/video-calls/{}/accept", http_base, session_id))
        .bearer_auth(&token_b)
        .send()
        .await?
        .error_for_status()?;
    info!("[PROBE] Call accepted");

    let delivered: serde_json::Value = http
        .post(format!("{}/video-calls/{}/signal", http_base, session_id))
        .bearer_auth(&token_a)
        .json(&SignalPayload::Offer { sdp: "v=0 probe".to_string() })
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
    if delivered["delivered"] != json!(true) {
        bail!("offer was not delivered: {}", delivered);
    }
    expect_event(&mut events_b, "call-signal", |e| {
        matches!(e, ServerEvent::CallSignal { .. })
    })
    .await?;
    info!("[PROBE] Offer relayed to callee");

    http.put(format!("{}/video-calls/{}/end", http_base, session_id))
        .bearer_auth(&token_a)
        .send()
        .await?
        .error_for_status()?;
    expect_event(&mut events_b, "call-ended", |e| {
        matches!(e, ServerEvent::CallEnded { .. })
    })
    .await?;
    info!("[PROBE] Call ended cleanly; all checks passed");

    alice.disconnect();
    bob.disconnect();
    Ok(())
}
