use crate::common::error::RealtimeError;
use crate::common::models::{CallType, ServerEvent, SignalPayload};
use crate::server::rooms::RoomRegistry;
use log::{info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// How long a terminal session stays queryable before being swept.
const SWEEP_AFTER: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Initiated,
    Ringing,
    Accepted,
    Active,
    Rejected,
    TimedOut,
    Ended,
}

impl CallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::TimedOut | Self::Ended)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Ringing => "ringing",
            Self::Accepted => "accepted",
            Self::Active => "active",
            Self::Rejected => "rejected",
            Self::TimedOut => "timed_out",
            Self::Ended => "ended",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CallSession {
    pub id: String,
    pub initiator_id: String,
    pub receiver_id: String,
    pub call_type: CallType,
    /// Platform context the call was started from, echoed back untouched.
    pub booking_id: Option<String>,
    pub squad_id: Option<String>,
    pub status: CallStatus,
    pub created_at: i64,
    pub ended_at: Option<i64>,
}

impl CallSession {
    fn is_participant(&self, user_id: &str) -> bool {
        self.initiator_id == user_id || self.receiver_id == user_id
    }

    fn other_participant(&self, user_id: &str) -> &str {
        if self.initiator_id == user_id {
            &self.receiver_id
        } else {
            &self.initiator_id
        }
    }
}

/// In-memory call-session table. Every status change is a compare-and-set
/// inside the table lock, so concurrent accept/reject/timeout produce
/// exactly one winner; the losers get `InvalidTransition`. In-memory is
/// fine for a single process; a multi-instance deployment must move this
/// table to a shared store with conditional updates keyed by session id so
/// transitions stay linearizable across processes.
#[derive(Clone)]
pub struct CallRegistry {
    sessions: Arc<Mutex<HashMap<String, CallSession>>>,
    rooms: RoomRegistry,
    ring_timeout: Duration,
}

impl CallRegistry {
    pub fn new(rooms: RoomRegistry, ring_timeout: Duration) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            rooms,
            ring_timeout,
        }
    }

    /// Create a session and start it ringing: the receiver's user room gets
    /// an `incoming-call` event and a server-side ring timeout is armed.
    /// Timeout enforcement is server-side so stale ringing sessions cannot
    /// accumulate; the timeout loses harmlessly to an earlier accept or
    /// reject.
    pub async fn initiate(
        &self,
        initiator_id: &str,
        receiver_id: &str,
        call_type: CallType,
        booking_id: Option<String>,
        squad_id: Option<String>,
    ) -> Result<CallSession, RealtimeError> {
        let session = CallSession {
            id: uuid::Uuid::new_v4().to_string(),
            initiator_id: initiator_id.to_string(),
            receiver_id: receiver_id.to_string(),
            call_type,
            booking_id,
            squad_id,
            status: CallStatus::Initiated,
            created_at: chrono::Utc::now().timestamp_millis(),
            ended_at: None,
        };
        self.sessions.lock().await.insert(session.id.clone(), session.clone());

        let ringing = self
            .transition(&session.id, &[CallStatus::Initiated], CallStatus::Ringing)
            .await?;

        let delivered = self
            .rooms
            .send_to_user(
                receiver_id,
                &ServerEvent::IncomingCall {
                    session_id: ringing.id.clone(),
                    initiator_id: initiator_id.to_string(),
                    call_type,
                },
            )
            .await;
        if delivered == 0 {
            // Receiver offline: the ring timeout will close the session.
            warn!("[CALL] incoming-call for {} dropped, receiver {} not connected", ringing.id, receiver_id);
        }
        info!("[CALL] {} ringing {} -> {}", ringing.id, initiator_id, receiver_id);

        self.arm_ring_timeout(ringing.id.clone());
        Ok(ringing)
    }

    fn arm_ring_timeout(&self, session_id: String) {
        let registry = self.clone();
        let timeout = self.ring_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            match registry
                .transition(&session_id, &[CallStatus::Ringing], CallStatus::TimedOut)
                .await
            {
                Ok(session) => {
                    info!("[CALL] {} timed out after {:?} of ringing", session_id, timeout);
                    let event = ServerEvent::CallTimedOut { session_id: session_id.clone() };
                    registry.rooms.send_to_user(&session.initiator_id, &event).await;
                    registry.rooms.send_to_user(&session.receiver_id, &event).await;
                    registry.schedule_sweep(session_id);
                }
                // Accept or reject won the race; nothing to do.
                Err(_) => {}
            }
        });
    }

    fn schedule_sweep(&self, session_id: String) {
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            tokio::time::sleep(SWEEP_AFTER).await;
            let mut table = sessions.lock().await;
            if table.get(&session_id).map_or(false, |s| s.status.is_terminal()) {
                table.remove(&session_id);
            }
        });
    }

    /// Compare-and-set on session status; the single place state changes.
    async fn transition(
        &self,
        session_id: &str,
        allowed_from: &[CallStatus],
        to: CallStatus,
    ) -> Result<CallSession, RealtimeError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| RealtimeError::SessionNotFound(session_id.to_string()))?;
        if !allowed_from.contains(&session.status) {
            return Err(RealtimeError::InvalidTransition {
                session_id: session_id.to_string(),
                expected: allowed_from.first().map(|s| s.as_str()).unwrap_or("?"),
                actual: session.status.as_str().to_string(),
            });
        }
        session.status = to;
        if to == CallStatus::Ended {
            session.ended_at = Some(chrono::Utc::now().timestamp_millis());
        }
        Ok(session.clone())
    }

    async fn require_participant(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<CallSession, RealtimeError> {
        let sessions = self.sessions.lock().await;
        let session = sessions
            .get(session_id)
            .ok_or_else(|| RealtimeError::SessionNotFound(session_id.to_string()))?;
        if !session.is_participant(user_id) {
            return Err(RealtimeError::AuthenticationFailure(format!(
                "user {} is not a participant of call {}",
                user_id, session_id
            )));
        }
        Ok(session.clone())
    }

    /// Only the receiver may accept, and only while ringing.
    pub async fn accept(&self, session_id: &str, user_id: &str) -> Result<CallSession, RealtimeError> {
        let session = self.require_participant(session_id, user_id).await?;
        if session.receiver_id != user_id {
            return Err(RealtimeError::AuthenticationFailure(format!(
                "only the callee may accept call {}",
                session_id
            )));
        }
        let accepted = self
            .transition(session_id, &[CallStatus::Ringing], CallStatus::Accepted)
            .await?;
        info!("[CALL] {} accepted by {}", session_id, user_id);
        let event = ServerEvent::CallAccepted { session_id: session_id.to_string() };
        self.rooms.send_to_user(&accepted.initiator_id, &event).await;
        self.rooms.send_to_user(&accepted.receiver_id, &event).await;
        Ok(accepted)
    }

    pub async fn reject(&self, session_id: &str, user_id: &str) -> Result<CallSession, RealtimeError> {
        let session = self.require_participant(session_id, user_id).await?;
        if session.receiver_id != user_id {
            return Err(RealtimeError::AuthenticationFailure(format!(
                "only the callee may reject call {}",
                session_id
            )));
        }
        let rejected = self
            .transition(session_id, &[CallStatus::Ringing], CallStatus::Rejected)
            .await?;
        info!("[CALL] {} rejected by {}", session_id, user_id);
        self.rooms
            .send_to_user(
                &rejected.initiator_id,
                &ServerEvent::CallRejected { session_id: session_id.to_string() },
            )
            .await;
        self.schedule_sweep(session_id.to_string());
        Ok(rejected)
    }

    /// Either participant may hang up. Ending an already-ended session is a
    /// no-op, not an error, and a session already swept from the table
    /// counts as ended too (`None`). The idempotency check and the state
    /// change happen under one lock acquisition, so both sides hanging up
    /// at once each get a success.
    pub async fn end(
        &self,
        session_id: &str,
        user_id: &str,
    ) -> Result<Option<CallSession>, RealtimeError> {
        let ended = {
            let mut sessions = self.sessions.lock().await;
            let Some(session) = sessions.get_mut(session_id) else {
                return Ok(None);
            };
            if !session.is_participant(user_id) {
                return Err(RealtimeError::AuthenticationFailure(format!(
                    "user {} is not a participant of call {}",
                    user_id, session_id
                )));
            }
            match session.status {
                CallStatus::Ended => return Ok(Some(session.clone())),
                CallStatus::Accepted | CallStatus::Active => {
                    session.status = CallStatus::Ended;
                    session.ended_at = Some(chrono::Utc::now().timestamp_millis());
                    session.clone()
                }
                other => {
                    return Err(RealtimeError::InvalidTransition {
                        session_id: session_id.to_string(),
                        expected: CallStatus::Accepted.as_str(),
                        actual: other.as_str().to_string(),
                    })
                }
            }
        };
        info!("[CALL] {} ended by {}", session_id, user_id);
        let event = ServerEvent::CallEnded { session_id: session_id.to_string() };
        self.rooms.send_to_user(&ended.initiator_id, &event).await;
        self.rooms.send_to_user(&ended.receiver_id, &event).await;
        self.schedule_sweep(session_id.to_string());
        Ok(Some(ended))
    }

    /// Relay a WebRTC handshake payload to the other participant. Valid only
    /// while the session is ringing, accepted, or active; anything terminal
    /// drops the signal. The Accepted -> Active step is advisory: the first
    /// relayed signal after acceptance flips it, the server never verifies
    /// the peer link itself.
    pub async fn relay_signal(
        &self,
        session_id: &str,
        from_user_id: &str,
        signal: SignalPayload,
    ) -> Result<(), RealtimeError> {
        let session = self.require_participant(session_id, from_user_id).await?;
        if session.status.is_terminal() {
            return Err(RealtimeError::DeliveryDrop(format!(
                "signal for call {} dropped: session is {}",
                session_id,
                session.status.as_str()
            )));
        }

        if session.status == CallStatus::Accepted {
            let _ = self
                .transition(session_id, &[CallStatus::Accepted], CallStatus::Active)
                .await;
        }

        let target = session.other_participant(from_user_id).to_string();
        let delivered = self
            .rooms
            .send_to_user(
                &target,
                &ServerEvent::CallSignal {
                    session_id: session_id.to_string(),
                    from_user_id: from_user_id.to_string(),
                    signal,
                },
            )
            .await;
        if delivered == 0 {
            // Best-effort at-most-once: the sender is not told either.
            warn!("[CALL] signal for {} dropped, {} not connected", session_id, target);
        }
        Ok(())
    }

    pub async fn get(&self, session_id: &str) -> Option<CallSession> {
        self.sessions.lock().await.get(session_id).cloned()
    }
}
