use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Canonical identifier of a conversation. Direct chats sort the two
/// participant ids so either side derives the same key; squad chats key on
/// the project id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConversationKey {
    Direct { a: String, b: String },
    Squad { project_id: String },
}

impl ConversationKey {
    pub fn direct(x: &str, y: &str) -> Self {
        let (a, b) = if x <= y { (x, y) } else { (y, x) };
        Self::Direct {
            a: a.to_string(),
            b: b.to_string(),
        }
    }

    pub fn squad(project_id: &str) -> Self {
        Self::Squad {
            project_id: project_id.to_string(),
        }
    }

    pub fn kind(&self) -> ConversationKind {
        match self {
            Self::Direct { .. } => ConversationKind::Direct,
            Self::Squad { .. } => ConversationKind::Squad,
        }
    }

    /// For a direct key, the participant that is not `user_id`.
    pub fn other_participant(&self, user_id: &str) -> Option<&str> {
        match self {
            Self::Direct { a, b } if a == user_id => Some(b),
            Self::Direct { a, b } if b == user_id => Some(a),
            _ => None,
        }
    }
}

// User ids may contain '-' (uuids), so the direct form separates the pair
// with '|', which cannot appear in an id.
impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct { a, b } => write!(f, "direct:{}|{}", a, b),
            Self::Squad { project_id } => write!(f, "squad:{}", project_id),
        }
    }
}

impl FromStr for ConversationKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("direct:") {
            let (a, b) = rest
                .split_once('|')
                .ok_or_else(|| anyhow::anyhow!("malformed direct conversation key: {}", s))?;
            Ok(Self::direct(a, b))
        } else if let Some(project_id) = s.strip_prefix("squad:") {
            Ok(Self::squad(project_id))
        } else {
            Err(anyhow::anyhow!("unknown conversation key format: {}", s))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Direct,
    Squad,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Squad => "squad",
        }
    }
}

/// A message as committed to the live channel. `seq` is assigned at commit
/// time and is monotonic within one conversation; `origin` identifies the
/// publishing server instance so the Redis bridge can skip its own echoes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveMessage {
    pub id: String,
    pub conversation_key: String,
    pub sender_id: String,
    pub sender_name: String,
    pub text: String,
    pub seq: u64,
    pub created_at: i64,
    pub origin: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallType {
    #[serde(rename = "one-on-one")]
    OneOnOne,
    #[serde(rename = "group")]
    Group,
}

/// WebRTC handshake payload, relayed verbatim and never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalPayload {
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate { candidate: serde_json::Value },
    Hangup,
}

/// First message a client must send after the WebSocket handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    pub message_type: String, // "auth"
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub message_type: String, // "auth_response"
    pub success: bool,
    pub user_id: Option<String>,
    pub error: Option<String>,
}

/// Events a connected client may send over the signaling channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ClientEvent {
    JoinUser,
    JoinProject { project_id: String },
    LeaveProject { project_id: String },
    SendProjectMessage { project_id: String, content: String },
    SendPrivateMessage { receiver_id: String, content: String },
    CallSignal { session_id: String, signal: SignalPayload },
}

/// Events the server pushes to connected clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ServerEvent {
    NewMessage {
        conversation_key: String,
        message: LiveMessage,
    },
    IncomingCall {
        session_id: String,
        initiator_id: String,
        call_type: CallType,
    },
    CallAccepted { session_id: String },
    CallRejected { session_id: String },
    CallTimedOut { session_id: String },
    CallEnded { session_id: String },
    CallSignal {
        session_id: String,
        from_user_id: String,
        signal: SignalPayload,
    },
}
