use crate::common::error::RealtimeError;
use crate::common::models::{ConversationKey, LiveMessage};
use crate::server::conversations::ConversationStore;
use crate::server::live_channel::LiveChannel;
use async_trait::async_trait;
use log::{error, warn};
use std::sync::Arc;
use std::time::Duration;

/// The durable side of the dual write. A trait seam so tests can inject
/// stores that fail on demand.
#[async_trait]
pub trait DurableIndex: Send + Sync + 'static {
    async fn index_message(
        &self,
        msg: &LiveMessage,
        participants: &[String],
    ) -> Result<(), RealtimeError>;
}

#[async_trait]
impl DurableIndex for ConversationStore {
    async fn index_message(
        &self,
        msg: &LiveMessage,
        participants: &[String],
    ) -> Result<(), RealtimeError> {
        self.record_message(msg, participants).await
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Exponential backoff: base, 2x, 4x, ...
    fn delay_before(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { attempts: 5, base_delay: Duration::from_millis(200) }
    }
}

/// Makes one logical "send" visible on both sides: the live channel first
/// (latency path, authoritative for perceived ordering), then the durable
/// index (authoritative for history and unread counts), retried in the
/// background. A lagging or failing durable write never blocks the sender
/// and never rolls back the live publish.
pub struct MessagePipeline {
    live: Arc<LiveChannel>,
    index: Arc<dyn DurableIndex>,
    retry: RetryPolicy,
    max_message_length: usize,
}

impl MessagePipeline {
    pub fn new(
        live: Arc<LiveChannel>,
        index: Arc<dyn DurableIndex>,
        retry: RetryPolicy,
        max_message_length: usize,
    ) -> Self {
        Self { live, index, retry, max_message_length }
    }

    pub fn live(&self) -> &Arc<LiveChannel> {
        &self.live
    }

    /// Send a message. Returns as soon as the live publish committed; the
    /// durable write continues in the background. The returned message id
    /// is shared by both representations.
    pub async fn send(
        &self,
        key: &ConversationKey,
        sender_id: &str,
        sender_name: &str,
        content: &str,
        participants: &[String],
    ) -> Result<LiveMessage, RealtimeError> {
        if content.chars().count() > self.max_message_length {
            return Err(RealtimeError::MessageTooLong { max: self.max_message_length });
        }

        let msg = self.live.publish(key, sender_id, sender_name, content).await;

        let index = self.index.clone();
        let retry = self.retry;
        let background_msg = msg.clone();
        let background_participants = participants.to_vec();
        tokio::spawn(async move {
            index_with_retry(index, background_msg, background_participants, retry).await;
        });

        Ok(msg)
    }
}

/// Bounded-retry durable indexing. Exhaustion is logged and counted, never
/// surfaced to the sender; the live message already succeeded from their
/// point of view.
async fn index_with_retry(
    index: Arc<dyn DurableIndex>,
    msg: LiveMessage,
    participants: Vec<String>,
    retry: RetryPolicy,
) {
    for attempt in 1..=retry.attempts.max(1) {
        match index.index_message(&msg, &participants).await {
            Ok(()) => return,
            Err(e) if attempt < retry.attempts => {
                warn!(
                    "[PIPELINE] Durable index attempt {}/{} failed for message {}: {}",
                    attempt, retry.attempts, msg.id, e
                );
                tokio::time::sleep(retry.delay_before(attempt)).await;
            }
            Err(e) => {
                error!(
                    "[PIPELINE] Durable index gave up after {} attempts for message {} in {}: {}",
                    retry.attempts, msg.id, msg.conversation_key, e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::database::Database;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails the first `failures` calls, then delegates to the real store.
    struct FlakyIndex {
        inner: ConversationStore,
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl DurableIndex for FlakyIndex {
        async fn index_message(
            &self,
            msg: &LiveMessage,
            participants: &[String],
        ) -> Result<(), RealtimeError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.failures {
                return Err(RealtimeError::TransientStoreFailure(anyhow::anyhow!(
                    "simulated outage (call {})",
                    call
                )));
            }
            self.inner.index_message(msg, participants).await
        }
    }

    async fn test_store() -> ConversationStore {
        let db = Database::connect_in_memory().await.unwrap();
        db.migrate().await.unwrap();
        ConversationStore::new(&db)
    }

    async fn wait_for_messages(store: &ConversationStore, key: &str, user: &str, n: usize) {
        for _ in 0..200 {
            if store.messages_for(key, user).await.unwrap().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("durable store never reached {} messages for {}", n, key);
    }

    #[tokio::test]
    async fn live_delivery_precedes_durable_visibility() {
        let store = test_store().await;
        let live = Arc::new(LiveChannel::in_process());
        let pipeline = MessagePipeline::new(
            live.clone(),
            Arc::new(store.clone()),
            RetryPolicy { attempts: 3, base_delay: Duration::from_millis(1) },
            2048,
        );

        let key = ConversationKey::direct("alice", "bob");
        let (seen, cb) = {
            let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
            let sink = seen.clone();
            (seen, move |m: &LiveMessage| sink.lock().unwrap().push(m.text.clone()))
        };
        let _sub = live.subscribe(&key, cb);

        let sent = pipeline
            .send(&key, "alice", "Alice", "hello", &["alice".into(), "bob".into()])
            .await
            .unwrap();

        // Subscriber saw it synchronously with the publish.
        assert_eq!(seen.lock().unwrap().as_slice(), ["hello"]);

        wait_for_messages(&store, &key.to_string(), "bob", 1).await;
        assert_eq!(store.unread_count(&key.to_string(), "bob").await.unwrap(), 1);
        let records = store.messages_for(&key.to_string(), "bob").await.unwrap();
        assert_eq!(records[0].id, sent.id);
    }

    #[tokio::test]
    async fn durable_write_retries_through_simulated_outage() {
        let store = test_store().await;
        let flaky = Arc::new(FlakyIndex {
            inner: store.clone(),
            failures: 3,
            calls: AtomicU32::new(0),
        });
        let live = Arc::new(LiveChannel::in_process());
        let pipeline = MessagePipeline::new(
            live,
            flaky.clone(),
            RetryPolicy { attempts: 5, base_delay: Duration::from_millis(1) },
            2048,
        );

        let key = ConversationKey::direct("alice", "bob");
        // Sender is never told about the outage.
        let result = pipeline
            .send(&key, "alice", "Alice", "eventually durable", &["alice".into(), "bob".into()])
            .await;
        assert!(result.is_ok());

        wait_for_messages(&store, &key.to_string(), "bob", 1).await;
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 4); // 3 failures + 1 success
        assert_eq!(store.unread_count(&key.to_string(), "bob").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_leave_live_side_intact() {
        let store = test_store().await;
        let flaky = Arc::new(FlakyIndex {
            inner: store.clone(),
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let live = Arc::new(LiveChannel::in_process());
        let pipeline = MessagePipeline::new(
            live.clone(),
            flaky,
            RetryPolicy { attempts: 2, base_delay: Duration::from_millis(1) },
            2048,
        );

        let key = ConversationKey::direct("alice", "bob");
        let (seen, cb) = {
            let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
            let sink = seen.clone();
            (seen, move |m: &LiveMessage| sink.lock().unwrap().push(m.text.clone()))
        };
        let _sub = live.subscribe(&key, cb);

        pipeline
            .send(&key, "alice", "Alice", "ghost", &["alice".into(), "bob".into()])
            .await
            .unwrap();

        assert_eq!(seen.lock().unwrap().len(), 1);
        tokio::time::sleep(Duration::from_millis(30)).await;
        // Absent from the durable side until a reconciliation pass; the
        // sender was still told the send succeeded.
        assert!(store.messages_for(&key.to_string(), "bob").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversized_messages_are_rejected_before_publish() {
        let store = test_store().await;
        let live = Arc::new(LiveChannel::in_process());
        let pipeline =
            MessagePipeline::new(live, Arc::new(store), RetryPolicy::default(), 8);

        let key = ConversationKey::direct("alice", "bob");
        let result = pipeline
            .send(&key, "alice", "Alice", "way too long for this limit", &[])
            .await;
        assert!(matches!(result, Err(RealtimeError::MessageTooLong { max: 8 })));
    }

    #[tokio::test]
    async fn live_and_durable_agree_on_relative_order() {
        let store = test_store().await;
        let live = Arc::new(LiveChannel::in_process());
        let pipeline = MessagePipeline::new(
            live.clone(),
            Arc::new(store.clone()),
            RetryPolicy { attempts: 3, base_delay: Duration::from_millis(1) },
            2048,
        );

        let key = ConversationKey::direct("alice", "bob");
        let (seen, cb) = {
            let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
            let sink = seen.clone();
            (seen, move |m: &LiveMessage| sink.lock().unwrap().push(m.id.clone()))
        };
        let _sub = live.subscribe(&key, cb);

        let participants = vec!["alice".to_string(), "bob".to_string()];
        for text in ["one", "two", "three", "four"] {
            pipeline.send(&key, "alice", "Alice", text, &participants).await.unwrap();
        }

        wait_for_messages(&store, &key.to_string(), "bob", 4).await;
        let durable_ids: Vec<String> = store
            .messages_for(&key.to_string(), "bob")
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(*seen.lock().unwrap(), durable_ids);
    }
}
