use crate::common::models::{
    AuthRequest, AuthResponse, ClientEvent, ConversationKey, LiveMessage, ServerEvent,
};
use crate::server::auth;
use crate::server::calls::CallRegistry;
use crate::server::config::ServerConfig;
use crate::server::database::Database;
use crate::server::live_channel::{LiveChannel, SubscriptionHandle};
use crate::server::pipeline::MessagePipeline;
use crate::server::rooms::{project_room, user_room, ConnectionId, RoomRegistry};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{tungstenite::Message, WebSocketStream};

/// The signaling channel: one long-lived WebSocket per client, the
/// substrate for room-scoped broadcast and call signaling. Clients
/// authenticate with their first message; everything after that is a
/// `ClientEvent`.
pub struct SocketServer {
    db: Arc<Database>,
    rooms: RoomRegistry,
    pipeline: Arc<MessagePipeline>,
    calls: CallRegistry,
    config: ServerConfig,
}

/// Bridge committed live-channel messages into the room registry. A single
/// forwarder task drains the tap in commit order, so per-connection
/// delivery order matches the live channel's.
pub fn spawn_message_fanout(live: &LiveChannel, rooms: RoomRegistry) -> SubscriptionHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<LiveMessage>();
    let handle = live.tap(move |msg| {
        let _ = tx.send(msg.clone());
    });

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let event = ServerEvent::NewMessage {
                conversation_key: msg.conversation_key.clone(),
                message: msg.clone(),
            };
            match msg.conversation_key.parse::<ConversationKey>() {
                Ok(ConversationKey::Direct { a, b }) => {
                    rooms.send_to_user(&a, &event).await;
                    rooms.send_to_user(&b, &event).await;
                }
                Ok(ConversationKey::Squad { project_id }) => {
                    rooms.broadcast(&project_room(&project_id), &event, None).await;
                }
                Err(e) => warn!("[WS] Unroutable live message {}: {}", msg.id, e),
            }
        }
    });

    handle
}

impl SocketServer {
    pub fn new(
        db: Arc<Database>,
        rooms: RoomRegistry,
        pipeline: Arc<MessagePipeline>,
        calls: CallRegistry,
        config: ServerConfig,
    ) -> Self {
        Self { db, rooms, pipeline, calls, config }
    }

    pub async fn run(self: Arc<Self>, addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("[WS] Signaling server listening on {}", addr);
        self.serve(listener).await
    }

    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        while let Ok((stream, peer)) = listener.accept().await {
            debug!("[WS] New connection from {}", peer);
            let server = self.clone();
            tokio::spawn(async move {
                match tokio_tungstenite::accept_async(stream).await {
                    Ok(ws_stream) => {
                        if let Err(e) = server.handle_connection(ws_stream).await {
                            warn!("[WS] Connection from {} closed with error: {}", peer, e);
                        }
                    }
                    Err(e) => error!("[WS] Handshake with {} failed: {}", peer, e),
                }
            });
        }
        Ok(())
    }

    /// Authenticate the first message, then hand off to the event loop.
    /// A bad or missing token fails the connection attempt, not silently.
    async fn handle_connection(
        &self,
        ws_stream: WebSocketStream<TcpStream>,
    ) -> anyhow::Result<()> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let auth_message = match tokio::time::timeout(
            self.config.auth_handshake_timeout,
            ws_receiver.next(),
        )
        .await
        {
            Ok(Some(Ok(Message::Text(text)))) => match serde_json::from_str::<AuthRequest>(&text) {
                Ok(req) if req.message_type == "auth" => req,
                _ => {
                    let response = AuthResponse {
                        message_type: "auth_response".to_string(),
                        success: false,
                        user_id: None,
                        error: Some("expected an auth message first".to_string()),
                    };
                    let _ = ws_sender.send(Message::Text(serde_json::to_string(&response)?)).await;
                    anyhow::bail!("client did not authenticate");
                }
            },
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => return Ok(()),
            Ok(Some(Ok(_))) | Ok(Some(Err(_))) => anyhow::bail!("bad message during auth"),
            Err(_) => {
                let response = AuthResponse {
                    message_type: "auth_response".to_string(),
                    success: false,
                    user_id: None,
                    error: Some("authentication timeout".to_string()),
                };
                let _ = ws_sender.send(Message::Text(serde_json::to_string(&response)?)).await;
                anyhow::bail!("authentication timeout");
            }
        };

        let user_id = match auth::validate_token(&self.db, &auth_message.token).await {
            Ok(user_id) => user_id,
            Err(e) => {
                let response = AuthResponse {
                    message_type: "auth_response".to_string(),
                    success: false,
                    user_id: None,
                    error: Some(e.to_string()),
                };
                let _ = ws_sender.send(Message::Text(serde_json::to_string(&response)?)).await;
                anyhow::bail!("authentication failed: {}", e);
            }
        };

        let response = AuthResponse {
            message_type: "auth_response".to_string(),
            success: true,
            user_id: Some(user_id.clone()),
            error: None,
        };
        ws_sender.send(Message::Text(serde_json::to_string(&response)?)).await?;
        info!("[WS] Authenticated connection for user {}", user_id);

        let ws_stream = ws_sender
            .reunite(ws_receiver)
            .map_err(|e| anyhow::anyhow!("failed to reunite stream: {}", e))?;
        self.serve_events(ws_stream, user_id).await
    }

    async fn serve_events(
        &self,
        ws_stream: WebSocketStream<TcpStream>,
        user_id: String,
    ) -> anyhow::Result<()> {
        let conn_id: ConnectionId = uuid::Uuid::new_v4().to_string();
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

        let send_task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(_) => continue,
                };
                if ws_sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        });

        while let Some(message) = ws_receiver.next().await {
            match message {
                Ok(Message::Text(text)) => match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => self.dispatch(&conn_id, &user_id, &tx, event).await,
                    Err(e) => warn!("[WS] Unparseable event from {}: {}", user_id, e),
                },
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }

        // Memberships are ephemeral; everything this connection joined dies
        // with it and clients re-join after reconnecting.
        self.rooms.leave_all(&conn_id).await;
        send_task.abort();

        if self.rooms.room_size(&user_room(&user_id)).await == 0 {
            let _ = sqlx::query("UPDATE users SET is_online = 0 WHERE id = ?")
                .bind(&user_id)
                .execute(&self.db.pool)
                .await;
            debug!("[WS] User {} offline, last connection closed", user_id);
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        conn_id: &ConnectionId,
        user_id: &str,
        tx: &mpsc::UnboundedSender<ServerEvent>,
        event: ClientEvent,
    ) {
        match event {
            ClientEvent::JoinUser => {
                self.rooms.join(&user_room(user_id), conn_id, tx.clone()).await;
                // Presence follows the user room: online while at least one
                // connection has joined it.
                let _ = sqlx::query("UPDATE users SET is_online = 1 WHERE id = ?")
                    .bind(user_id)
                    .execute(&self.db.pool)
                    .await;
            }
            ClientEvent::JoinProject { project_id } => {
                self.rooms.join(&project_room(&project_id), conn_id, tx.clone()).await;
            }
            ClientEvent::LeaveProject { project_id } => {
                self.rooms.leave(&project_room(&project_id), conn_id).await;
            }
            ClientEvent::SendPrivateMessage { receiver_id, content } => {
                let key = ConversationKey::direct(user_id, &receiver_id);
                let sender_name = auth::display_name(&self.db, user_id).await;
                let participants = vec![user_id.to_string(), receiver_id.clone()];
                if let Err(e) = self
                    .pipeline
                    .send(&key, user_id, &sender_name, &content, &participants)
                    .await
                {
                    warn!("[WS] Private send from {} rejected: {}", user_id, e);
                }
            }
            ClientEvent::SendProjectMessage { project_id, content } => {
                let key = ConversationKey::squad(&project_id);
                let sender_name = auth::display_name(&self.db, user_id).await;
                let participants = vec![user_id.to_string()];
                if let Err(e) = self
                    .pipeline
                    .send(&key, user_id, &sender_name, &content, &participants)
                    .await
                {
                    warn!("[WS] Squad send from {} rejected: {}", user_id, e);
                }
            }
            ClientEvent::CallSignal { session_id, signal } => {
                // Drops are logged, never reported back to the sender.
                if let Err(e) = self.calls.relay_signal(&session_id, user_id, signal).await {
                    info!("[WS] {}", e);
                }
            }
        }
    }
}
