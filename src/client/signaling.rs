use crate::common::error::RealtimeError;
use crate::common::models::{AuthRequest, AuthResponse, ClientEvent, ServerEvent};
use futures_util::{SinkExt, StreamExt};
use log::{info, warn};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What the driver task reports back to the application.
#[derive(Debug, Clone)]
pub enum SignalingEvent {
    /// Connection (or reconnection) established and authenticated. Room
    /// memberships do not survive a reconnect; re-join on this event.
    Connected { user_id: String },
    Disconnected,
    Server(ServerEvent),
}

/// Bounded exponential backoff for reconnection attempts.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    fn delay_before(&self, attempt: u32) -> Duration {
        let delay = self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1));
        delay.min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 6,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

enum SessionEnd {
    Transport,
    Shutdown,
}

/// Handle to one signaling connection. Construction is explicit: `connect`
/// performs the WebSocket handshake and token authentication before
/// returning, so a bad token fails the call instead of surfacing later.
/// Server pushes arrive on the receiver returned alongside the handle.
pub struct SignalingClient {
    user_id: String,
    outbound: mpsc::UnboundedSender<ClientEvent>,
    shutdown: watch::Sender<bool>,
}

impl SignalingClient {
    pub async fn connect(
        ws_url: &str,
        token: &str,
        policy: ReconnectPolicy,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalingEvent>), RealtimeError> {
        let (stream, user_id) = connect_and_authenticate(ws_url, token).await?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let _ = events_tx.send(SignalingEvent::Connected { user_id: user_id.clone() });
        tokio::spawn(drive(
            ws_url.to_string(),
            token.to_string(),
            policy,
            stream,
            outbound_rx,
            shutdown_rx,
            events_tx,
        ));

        Ok((
            Self { user_id, outbound: outbound_tx, shutdown: shutdown_tx },
            events_rx,
        ))
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Queue an event for the server. Fails only once the connection is
    /// shut down for good; during a reconnect the queue keeps events.
    pub fn send(&self, event: ClientEvent) -> Result<(), RealtimeError> {
        self.outbound
            .send(event)
            .map_err(|_| RealtimeError::DeliveryDrop("signaling connection is closed".to_string()))
    }

    /// Tear the connection down. The driver sends a close frame and stops
    /// reconnecting.
    pub fn disconnect(&self) {
        let _ = self.shutdown.send(true);
    }
}

async fn connect_and_authenticate(
    ws_url: &str,
    token: &str,
) -> Result<(WsStream, String), RealtimeError> {
    let (mut stream, _) = tokio_tungstenite::connect_async(ws_url)
        .await
        .map_err(|e| RealtimeError::DeliveryDrop(format!("connect to {} failed: {}", ws_url, e)))?;

    let auth = AuthRequest { message_type: "auth".to_string(), token: token.to_string() };
    let json = serde_json::to_string(&auth)
        .map_err(|e| RealtimeError::AuthenticationFailure(e.to_string()))?;
    stream
        .send(Message::Text(json))
        .await
        .map_err(|e| RealtimeError::AuthenticationFailure(e.to_string()))?;

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let response: AuthResponse = serde_json::from_str(&text)
                    .map_err(|e| RealtimeError::AuthenticationFailure(e.to_string()))?;
                return match (response.success, response.user_id) {
                    (true, Some(user_id)) => Ok((stream, user_id)),
                    _ => Err(RealtimeError::AuthenticationFailure(
                        response.error.unwrap_or_else(|| "authentication rejected".to_string()),
                    )),
                };
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => return Err(RealtimeError::AuthenticationFailure(e.to_string())),
        }
    }
    Err(RealtimeError::AuthenticationFailure(
        "connection closed during authentication".to_string(),
    ))
}

/// Owns the socket for the lifetime of the client: pumps outbound events,
/// surfaces server pushes, and reconnects with backoff when the transport
/// drops underneath it.
async fn drive(
    ws_url: String,
    token: String,
    policy: ReconnectPolicy,
    stream: WsStream,
    mut outbound: mpsc::UnboundedReceiver<ClientEvent>,
    mut shutdown: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<SignalingEvent>,
) {
    let mut current = stream;
    loop {
        let end = run_session(current, &mut outbound, &mut shutdown, &events).await;
        let _ = events.send(SignalingEvent::Disconnected);
        if matches!(end, SessionEnd::Shutdown) {
            return;
        }

        let mut reconnected = None;
        for attempt in 1..=policy.max_attempts {
            tokio::time::sleep(policy.delay_before(attempt)).await;
            if *shutdown.borrow() {
                return;
            }
            match connect_and_authenticate(&ws_url, &token).await {
                Ok((new_stream, user_id)) => {
                    info!("[SIGNALING] Reconnected to {} on attempt {}", ws_url, attempt);
                    let _ = events.send(SignalingEvent::Connected { user_id });
                    reconnected = Some(new_stream);
                    break;
                }
                Err(e) => warn!(
                    "[SIGNALING] Reconnect attempt {}/{} failed: {}",
                    attempt, policy.max_attempts, e
                ),
            }
        }
        match reconnected {
            Some(new_stream) => current = new_stream,
            None => {
                warn!("[SIGNALING] Giving up on {} after {} attempts", ws_url, policy.max_attempts);
                return;
            }
        }
    }
}

async fn run_session(
    stream: WsStream,
    outbound: &mut mpsc::UnboundedReceiver<ClientEvent>,
    shutdown: &mut watch::Receiver<bool>,
    events: &mpsc::UnboundedSender<SignalingEvent>,
) -> SessionEnd {
    let (mut sink, mut source) = stream.split();
    loop {
        tokio::select! {
            command = outbound.recv() => match command {
                Some(event) => {
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(_) => continue,
                    };
                    if sink.send(Message::Text(json)).await.is_err() {
                        return SessionEnd::Transport;
                    }
                }
                // All client handles dropped.
                None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
            },
            incoming = source.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            if events.send(SignalingEvent::Server(event)).is_err() {
                                return SessionEnd::Shutdown;
                            }
                        }
                        Err(e) => warn!("[SIGNALING] Unparseable server event: {}", e),
                    }
                }
                Some(Ok(Message::Close(_))) | None => return SessionEnd::Transport,
                Some(Ok(_)) => {}
                Some(Err(_)) => return SessionEnd::Transport,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::models::{CallType, SignalPayload};
    use crate::server::auth;
    use crate::server::calls::CallRegistry;
    use crate::server::config::ServerConfig;
    use crate::server::conversations::ConversationStore;
    use crate::server::database::Database;
    use crate::server::live_channel::LiveChannel;
    use crate::server::pipeline::{MessagePipeline, RetryPolicy};
    use crate::server::rooms::{user_room, RoomRegistry};
    use crate::server::socket::{spawn_message_fanout, SocketServer};
    use std::sync::Arc;

    struct Harness {
        ws_url: String,
        db: Arc<Database>,
        rooms: RoomRegistry,
        calls: CallRegistry,
        _fanout: crate::server::live_channel::SubscriptionHandle,
    }

    async fn start_server() -> Harness {
        let db = Arc::new(Database::connect_in_memory().await.unwrap());
        db.migrate().await.unwrap();

        let live = Arc::new(LiveChannel::in_process());
        let store = ConversationStore::new(&db);
        let pipeline = Arc::new(MessagePipeline::new(
            live.clone(),
            Arc::new(store),
            RetryPolicy { attempts: 3, base_delay: Duration::from_millis(1) },
            2048,
        ));
        let rooms = RoomRegistry::new();
        let calls = CallRegistry::new(rooms.clone(), Duration::from_secs(30));
        let fanout = spawn_message_fanout(&live, rooms.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(SocketServer::new(
            db.clone(),
            rooms.clone(),
            pipeline,
            calls.clone(),
            ServerConfig::from_env(),
        ));
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        Harness { ws_url: format!("ws://{}", addr), db, rooms, calls, _fanout: fanout }
    }

    async fn login(harness: &Harness, user_id: &str) -> String {
        auth::create_session(&harness.db, user_id, user_id, 3600).await.unwrap()
    }

    async fn wait_for_room(harness: &Harness, room: &str) {
        for _ in 0..200 {
            if harness.rooms.room_size(room).await > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("room {} never got a member", room);
    }

    async fn next_server_event(
        rx: &mut mpsc::UnboundedReceiver<SignalingEvent>,
    ) -> ServerEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for server event")
                .expect("event stream closed");
            if let SignalingEvent::Server(event) = event {
                return event;
            }
        }
    }

    #[tokio::test]
    async fn connect_fails_loudly_on_a_bad_token() {
        let harness = start_server().await;
        let result =
            SignalingClient::connect(&harness.ws_url, "not-a-token", ReconnectPolicy::default())
                .await;
        assert!(matches!(result, Err(RealtimeError::AuthenticationFailure(_))));
    }

    #[tokio::test]
    async fn private_messages_reach_both_sides_over_the_socket() {
        let harness = start_server().await;
        let token_a = login(&harness, "alice").await;
        let token_b = login(&harness, "bob").await;

        let (alice, mut events_a) =
            SignalingClient::connect(&harness.ws_url, &token_a, ReconnectPolicy::default())
                .await
                .unwrap();
        let (bob, mut events_b) =
            SignalingClient::connect(&harness.ws_url, &token_b, ReconnectPolicy::default())
                .await
                .unwrap();
        assert_eq!(alice.user_id(), "alice");

        alice.send(ClientEvent::JoinUser).unwrap();
        bob.send(ClientEvent::JoinUser).unwrap();
        wait_for_room(&harness, &user_room("alice")).await;
        wait_for_room(&harness, &user_room("bob")).await;

        alice
            .send(ClientEvent::SendPrivateMessage {
                receiver_id: "bob".to_string(),
                content: "hey bob".to_string(),
            })
            .unwrap();

        match next_server_event(&mut events_b).await {
            ServerEvent::NewMessage { message, .. } => {
                assert_eq!(message.sender_id, "alice");
                assert_eq!(message.text, "hey bob");
            }
            other => panic!("expected new-message, got {:?}", other),
        }
        // The sender's own user room gets it too.
        match next_server_event(&mut events_a).await {
            ServerEvent::NewMessage { message, .. } => assert_eq!(message.text, "hey bob"),
            other => panic!("expected new-message, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn call_signals_flow_through_the_socket() {
        let harness = start_server().await;
        let token_a = login(&harness, "alice").await;
        let token_b = login(&harness, "bob").await;

        let (alice, mut events_a) =
            SignalingClient::connect(&harness.ws_url, &token_a, ReconnectPolicy::default())
                .await
                .unwrap();
        let (_bob, mut events_b) =
            SignalingClient::connect(&harness.ws_url, &token_b, ReconnectPolicy::default())
                .await
                .unwrap();
        alice.send(ClientEvent::JoinUser).unwrap();
        _bob.send(ClientEvent::JoinUser).unwrap();
        wait_for_room(&harness, &user_room("alice")).await;
        wait_for_room(&harness, &user_room("bob")).await;

        let session = harness
            .calls
            .initiate("alice", "bob", CallType::OneOnOne, None, None)
            .await
            .unwrap();
        match next_server_event(&mut events_b).await {
            ServerEvent::IncomingCall { session_id, initiator_id, .. } => {
                assert_eq!(session_id, session.id);
                assert_eq!(initiator_id, "alice");
            }
            other => panic!("expected incoming-call, got {:?}", other),
        }

        harness.calls.accept(&session.id, "bob").await.unwrap();
        // Both sides are told about the acceptance.
        assert!(matches!(
            next_server_event(&mut events_a).await,
            ServerEvent::CallAccepted { .. }
        ));
        assert!(matches!(
            next_server_event(&mut events_b).await,
            ServerEvent::CallAccepted { .. }
        ));

        alice
            .send(ClientEvent::CallSignal {
                session_id: session.id.clone(),
                signal: SignalPayload::Offer { sdp: "v=0".to_string() },
            })
            .unwrap();
        match next_server_event(&mut events_b).await {
            ServerEvent::CallSignal { from_user_id, signal, .. } => {
                assert_eq!(from_user_id, "alice");
                assert!(matches!(signal, SignalPayload::Offer { .. }));
            }
            other => panic!("expected call-signal, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn disconnect_emits_a_disconnected_event() {
        let harness = start_server().await;
        let token = login(&harness, "alice").await;
        let (client, mut events) =
            SignalingClient::connect(&harness.ws_url, &token, ReconnectPolicy::default())
                .await
                .unwrap();

        // Skip the initial Connected.
        let first = events.recv().await.unwrap();
        assert!(matches!(first, SignalingEvent::Connected { .. }));

        client.disconnect();
        let next = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(next, SignalingEvent::Disconnected));
    }
}
