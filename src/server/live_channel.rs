use crate::common::models::{ConversationKey, LiveMessage};
use futures_util::StreamExt;
use log::{debug, info, warn};
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;

type Callback = Box<dyn Fn(&LiveMessage) + Send + Sync>;

/// A live subscriber. The callback lives behind its own lock; delivery and
/// cancellation serialize on it, which is what makes `cancel` synchronous.
struct Subscriber {
    slot: Arc<StdMutex<Option<Callback>>>,
}

impl Subscriber {
    /// Deliver one message. Returns false once the subscription was
    /// cancelled so the channel can drop the entry.
    fn deliver(&self, msg: &LiveMessage) -> bool {
        let guard = self.slot.lock().unwrap();
        match guard.as_ref() {
            Some(cb) => {
                cb(msg);
                true
            }
            None => false,
        }
    }
}

/// Handle returned by `subscribe`. After `cancel` returns, no further
/// callback invocation starts; an invocation already running on another
/// task may still complete. Callbacks must not call back into the channel.
pub struct SubscriptionHandle {
    slot: Arc<StdMutex<Option<Callback>>>,
}

impl SubscriptionHandle {
    pub fn cancel(&self) {
        self.slot.lock().unwrap().take();
    }
}

struct ChannelState {
    next_seq: u64,
    subscribers: Vec<Subscriber>,
}

/// Ordered, append-only fan-out per conversation. Purely in-process by
/// default; with Redis configured, every publish is also mirrored to a
/// `conversation:{key}` pub/sub channel so other server instances can
/// deliver to their own sockets.
pub struct LiveChannel {
    instance_id: String,
    channels: StdMutex<HashMap<String, ChannelState>>,
    // Taps observe every conversation; the socket fan-out and tests use them.
    taps: StdMutex<Vec<Subscriber>>,
    redis: Option<Arc<Mutex<ConnectionManager>>>,
    redis_url: Option<String>,
}

impl LiveChannel {
    pub fn in_process() -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            channels: StdMutex::new(HashMap::new()),
            taps: StdMutex::new(Vec::new()),
            redis: None,
            redis_url: None,
        }
    }

    pub async fn with_redis(redis_url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;
        let mut channel = Self::in_process();
        channel.redis = Some(Arc::new(Mutex::new(manager)));
        channel.redis_url = Some(redis_url.to_string());
        Ok(channel)
    }

    /// Commit a message to the conversation stream. The sequence number is
    /// assigned and the message handed to every local subscriber under the
    /// channel lock, so all subscribers observe the same relative order.
    pub async fn publish(
        &self,
        key: &ConversationKey,
        sender_id: &str,
        sender_name: &str,
        text: &str,
    ) -> LiveMessage {
        let msg = {
            let mut channels = self.channels.lock().unwrap();
            let state = channels
                .entry(key.to_string())
                .or_insert_with(|| ChannelState { next_seq: 0, subscribers: Vec::new() });
            let msg = LiveMessage {
                id: uuid::Uuid::new_v4().to_string(),
                conversation_key: key.to_string(),
                sender_id: sender_id.to_string(),
                sender_name: sender_name.to_string(),
                text: text.to_string(),
                seq: state.next_seq,
                created_at: chrono::Utc::now().timestamp_millis(),
                origin: self.instance_id.clone(),
            };
            state.next_seq += 1;
            state.subscribers.retain(|s| s.deliver(&msg));
            // Taps are delivered under the channel lock as well so they see
            // the same commit order as per-conversation subscribers.
            self.taps.lock().unwrap().retain(|s| s.deliver(&msg));
            msg
        };

        if let Some(redis) = &self.redis {
            // Fire-and-forget cross-instance mirror; a Redis hiccup must not
            // fail the publish that local subscribers already observed.
            let channel_name = format!("conversation:{}", msg.conversation_key);
            let payload = serde_json::to_string(&msg).unwrap_or_default();
            let mut conn = redis.lock().await;
            let result: Result<(), redis::RedisError> = redis::cmd("PUBLISH")
                .arg(&channel_name)
                .arg(&payload)
                .query_async(&mut *conn)
                .await;
            if let Err(e) = result {
                warn!("[LIVE] Redis mirror publish failed for {}: {}", channel_name, e);
            }
        }

        msg
    }

    /// Live-only subscription: messages from this moment onward, in commit
    /// order, no historical backfill.
    pub fn subscribe<F>(&self, key: &ConversationKey, on_message: F) -> SubscriptionHandle
    where
        F: Fn(&LiveMessage) + Send + Sync + 'static,
    {
        let slot: Arc<StdMutex<Option<Callback>>> = Arc::new(StdMutex::new(Some(Box::new(on_message))));
        let subscriber = Subscriber { slot: slot.clone() };
        let mut channels = self.channels.lock().unwrap();
        channels
            .entry(key.to_string())
            .or_insert_with(|| ChannelState { next_seq: 0, subscribers: Vec::new() })
            .subscribers
            .push(subscriber);
        SubscriptionHandle { slot }
    }

    /// Observe every conversation. Used to bridge committed messages into
    /// the room registry for socket delivery.
    pub fn tap<F>(&self, on_message: F) -> SubscriptionHandle
    where
        F: Fn(&LiveMessage) + Send + Sync + 'static,
    {
        let slot: Arc<StdMutex<Option<Callback>>> = Arc::new(StdMutex::new(Some(Box::new(on_message))));
        self.taps.lock().unwrap().push(Subscriber { slot: slot.clone() });
        SubscriptionHandle { slot }
    }

    /// Hand a message committed on another instance to local subscribers.
    /// The origin instance keeps its own sequence numbers; cross-instance
    /// interleaving is best-effort by arrival, per-origin order preserved.
    fn dispatch_remote(&self, msg: &LiveMessage) {
        let mut channels = self.channels.lock().unwrap();
        if let Some(state) = channels.get_mut(&msg.conversation_key) {
            state.next_seq = state.next_seq.max(msg.seq + 1);
            state.subscribers.retain(|s| s.deliver(msg));
        }
        self.taps.lock().unwrap().retain(|s| s.deliver(msg));
    }

    /// Long-running pub/sub consumer that feeds remote publishes into local
    /// dispatch. Reconnects on failure with a fixed delay.
    pub fn start_redis_bridge(self: &Arc<Self>) {
        let Some(redis_url) = self.redis_url.clone() else {
            debug!("[LIVE] No Redis configured, skipping bridge");
            return;
        };
        let channel = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match redis::Client::open(redis_url.as_str()) {
                    Ok(client) => match client.get_async_connection().await {
                        Ok(conn) => {
                            info!("[LIVE] Redis bridge connected");
                            let mut pubsub = conn.into_pubsub();
                            if let Err(e) = pubsub.psubscribe("conversation:*").await {
                                warn!("[LIVE] psubscribe failed: {}", e);
                            } else {
                                let mut stream = pubsub.on_message();
                                while let Some(msg) = stream.next().await {
                                    let payload: String = match msg.get_payload() {
                                        Ok(p) => p,
                                        Err(_) => continue,
                                    };
                                    if let Ok(live) = serde_json::from_str::<LiveMessage>(&payload) {
                                        if live.origin == channel.instance_id {
                                            continue; // our own mirror
                                        }
                                        channel.dispatch_remote(&live);
                                    }
                                }
                                info!("[LIVE] Redis bridge stream ended");
                            }
                        }
                        Err(e) => warn!("[LIVE] Redis bridge connect failed: {}", e),
                    },
                    Err(e) => warn!("[LIVE] Redis client open failed: {}", e),
                }
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            }
        });
    }
}
