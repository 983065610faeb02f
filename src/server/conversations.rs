use crate::common::error::RealtimeError;
use crate::common::models::{ConversationKey, LiveMessage};
use crate::server::database::Database;
use log::debug;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

/// Durable record of who talked to whom and when, independent of the live
/// transport. Backfill and unread counts come from here; real-time ordering
/// does not.
#[derive(Clone)]
pub struct ConversationStore {
    pool: SqlitePool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageRecord {
    pub id: String,
    pub conversation_key: String,
    pub sender_id: String,
    pub content: String,
    pub seq: i64,
    pub sent_at: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    pub is_online: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversationSummary {
    pub conversation_key: String,
    pub kind: String,
    /// The peer for direct conversations; absent for squad chats.
    pub other_participant: Option<Participant>,
    pub last_message: Option<String>,
    pub last_sender_id: Option<String>,
    pub last_message_at: Option<i64>,
    pub unread_count: i64,
}

impl ConversationStore {
    pub fn new(db: &Database) -> Self {
        Self { pool: db.pool.clone() }
    }

    /// Append a committed live message to the durable log and roll the
    /// conversation summary forward. Keyed on the live message id, so a
    /// retried call for the same message is a no-op rather than a duplicate
    /// row or a double-counted unread.
    pub async fn record_message(
        &self,
        msg: &LiveMessage,
        participants: &[String],
    ) -> Result<(), RealtimeError> {
        let key: ConversationKey = msg
            .conversation_key
            .parse()
            .map_err(RealtimeError::TransientStoreFailure)?;

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO messages (id, conversation_key, sender_id, content, seq, sent_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&msg.id)
        .bind(&msg.conversation_key)
        .bind(&msg.sender_id)
        .bind(&msg.text)
        .bind(msg.seq as i64)
        .bind(msg.created_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            debug!("[STORE] Message {} already indexed, skipping", msg.id);
            return Ok(());
        }

        sqlx::query(
            "INSERT INTO conversations (conversation_key, kind, last_message, last_sender_id, last_message_at) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(conversation_key) DO UPDATE SET \
               last_message = excluded.last_message, \
               last_sender_id = excluded.last_sender_id, \
               last_message_at = excluded.last_message_at",
        )
        .bind(&msg.conversation_key)
        .bind(key.kind().as_str())
        .bind(&msg.text)
        .bind(&msg.sender_id)
        .bind(msg.created_at)
        .execute(&self.pool)
        .await?;

        for user_id in participants {
            sqlx::query(
                "INSERT OR IGNORE INTO conversation_members (conversation_key, user_id, unread_count) \
                 VALUES (?, ?, 0)",
            )
            .bind(&msg.conversation_key)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        }

        sqlx::query(
            "UPDATE conversation_members SET unread_count = unread_count + 1 \
             WHERE conversation_key = ? AND user_id != ?",
        )
        .bind(&msg.conversation_key)
        .bind(&msg.sender_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Inbox listing: most recently active conversation first.
    pub async fn list_conversations(
        &self,
        user_id: &str,
    ) -> Result<Vec<ConversationSummary>, RealtimeError> {
        let rows = sqlx::query(
            "SELECT c.conversation_key, c.kind, c.last_message, c.last_sender_id, \
                    c.last_message_at, m.unread_count \
             FROM conversations c \
             JOIN conversation_members m ON m.conversation_key = c.conversation_key \
             WHERE m.user_id = ? \
             ORDER BY c.last_message_at DESC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut summaries = Vec::with_capacity(rows.len());
        for row in rows {
            let conversation_key: String = row.get("conversation_key");
            let other_participant = match conversation_key.parse::<ConversationKey>() {
                Ok(key) => match key.other_participant(user_id) {
                    Some(other) => Some(self.participant(other).await?),
                    None => None,
                },
                Err(_) => None,
            };
            summaries.push(ConversationSummary {
                conversation_key,
                kind: row.get("kind"),
                other_participant,
                last_message: row.get("last_message"),
                last_sender_id: row.get("last_sender_id"),
                last_message_at: row.get("last_message_at"),
                unread_count: row.get("unread_count"),
            });
        }
        Ok(summaries)
    }

    async fn participant(&self, user_id: &str) -> Result<Participant, RealtimeError> {
        let row = sqlx::query("SELECT display_name, is_online FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(match row {
            Some(row) => Participant {
                id: user_id.to_string(),
                display_name: row.get("display_name"),
                is_online: row.get::<i64, _>("is_online") != 0,
            },
            None => Participant {
                id: user_id.to_string(),
                display_name: user_id.to_string(),
                is_online: false,
            },
        })
    }

    /// Reset the unread counter; message records are untouched. For squad
    /// conversations this is also where membership accrues: the platform
    /// backend owns project rosters, so the store learns a member exists on
    /// their first read and counts unread from then on.
    pub async fn mark_read(&self, conversation_key: &str, user_id: &str) -> Result<(), RealtimeError> {
        sqlx::query(
            "INSERT INTO conversation_members (conversation_key, user_id, unread_count) \
             VALUES (?, ?, 0) \
             ON CONFLICT(conversation_key, user_id) DO UPDATE SET unread_count = 0",
        )
        .bind(conversation_key)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn unread_count(&self, conversation_key: &str, user_id: &str) -> Result<i64, RealtimeError> {
        let row = sqlx::query(
            "SELECT unread_count FROM conversation_members \
             WHERE conversation_key = ? AND user_id = ?",
        )
        .bind(conversation_key)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("unread_count")).unwrap_or(0))
    }

    /// History backfill in commit order, honoring the caller's soft-clear
    /// watermark.
    pub async fn messages_for(
        &self,
        conversation_key: &str,
        user_id: &str,
    ) -> Result<Vec<MessageRecord>, RealtimeError> {
        let rows = sqlx::query(
            "SELECT id, conversation_key, sender_id, content, seq, sent_at FROM messages \
             WHERE conversation_key = ? \
               AND sent_at > COALESCE((SELECT cleared_at FROM conversation_members \
                                       WHERE conversation_key = ? AND user_id = ?), 0) \
             ORDER BY seq ASC",
        )
        .bind(conversation_key)
        .bind(conversation_key)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| MessageRecord {
                id: row.get("id"),
                conversation_key: row.get("conversation_key"),
                sender_id: row.get("sender_id"),
                content: row.get("content"),
                seq: row.get("seq"),
                sent_at: row.get("sent_at"),
            })
            .collect())
    }

    /// Soft clear: the conversation and its records survive, but history
    /// before the watermark disappears from this user's view. Conversations
    /// are never hard-deleted.
    pub async fn clear_for_user(&self, conversation_key: &str, user_id: &str) -> Result<(), RealtimeError> {
        let now = chrono::Utc::now().timestamp_millis();
        sqlx::query(
            "INSERT INTO conversation_members (conversation_key, user_id, unread_count, cleared_at) \
             VALUES (?, ?, 0, ?) \
             ON CONFLICT(conversation_key, user_id) DO UPDATE SET \
               cleared_at = excluded.cleared_at, unread_count = 0",
        )
        .bind(conversation_key)
        .bind(user_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::models::ConversationKey;

    async fn test_store() -> ConversationStore {
        let db = Database::connect_in_memory().await.unwrap();
        db.migrate().await.unwrap();
        ConversationStore::new(&db)
    }

    fn msg(key: &ConversationKey, id: &str, sender: &str, text: &str, seq: u64, at: i64) -> LiveMessage {
        LiveMessage {
            id: id.to_string(),
            conversation_key: key.to_string(),
            sender_id: sender.to_string(),
            sender_name: sender.to_string(),
            text: text.to_string(),
            seq,
            created_at: at,
            origin: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn record_updates_summary_and_unread_for_receiver_only() {
        let store = test_store().await;
        let key = ConversationKey::direct("alice", "bob");
        let participants = vec!["alice".to_string(), "bob".to_string()];

        store
            .record_message(&msg(&key, "m1", "alice", "hello", 0, 100), &participants)
            .await
            .unwrap();

        assert_eq!(store.unread_count(&key.to_string(), "bob").await.unwrap(), 1);
        assert_eq!(store.unread_count(&key.to_string(), "alice").await.unwrap(), 0);

        let inbox = store.list_conversations("bob").await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].last_message.as_deref(), Some("hello"));
        assert_eq!(inbox[0].unread_count, 1);
        assert_eq!(
            inbox[0].other_participant.as_ref().map(|p| p.id.as_str()),
            Some("alice")
        );
    }

    #[tokio::test]
    async fn reindexing_the_same_message_is_a_noop() {
        let store = test_store().await;
        let key = ConversationKey::direct("alice", "bob");
        let participants = vec!["alice".to_string(), "bob".to_string()];
        let m = msg(&key, "m1", "alice", "hello", 0, 100);

        store.record_message(&m, &participants).await.unwrap();
        store.record_message(&m, &participants).await.unwrap();

        assert_eq!(store.unread_count(&key.to_string(), "bob").await.unwrap(), 1);
        assert_eq!(store.messages_for(&key.to_string(), "bob").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mark_read_resets_counter_but_keeps_messages() {
        let store = test_store().await;
        let key = ConversationKey::direct("alice", "bob");
        let participants = vec!["alice".to_string(), "bob".to_string()];
        for (i, id) in ["m1", "m2"].iter().enumerate() {
            store
                .record_message(&msg(&key, id, "alice", "hi", i as u64, 100 + i as i64), &participants)
                .await
                .unwrap();
        }

        assert_eq!(store.unread_count(&key.to_string(), "bob").await.unwrap(), 2);
        store.mark_read(&key.to_string(), "bob").await.unwrap();
        assert_eq!(store.unread_count(&key.to_string(), "bob").await.unwrap(), 0);
        assert_eq!(store.messages_for(&key.to_string(), "bob").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn listing_orders_by_most_recent_activity() {
        let store = test_store().await;
        let with_bob = ConversationKey::direct("alice", "bob");
        let with_carol = ConversationKey::direct("alice", "carol");

        store
            .record_message(
                &msg(&with_bob, "m1", "bob", "old", 0, 100),
                &["alice".to_string(), "bob".to_string()],
            )
            .await
            .unwrap();
        store
            .record_message(
                &msg(&with_carol, "m2", "carol", "new", 0, 200),
                &["alice".to_string(), "carol".to_string()],
            )
            .await
            .unwrap();

        let inbox = store.list_conversations("alice").await.unwrap();
        assert_eq!(inbox.len(), 2);
        assert_eq!(inbox[0].conversation_key, with_carol.to_string());
        assert_eq!(inbox[1].conversation_key, with_bob.to_string());
    }

    #[tokio::test]
    async fn squad_membership_accrues_on_first_read() {
        let store = test_store().await;
        let key = ConversationKey::squad("p1");
        let sender_only = vec!["alice".to_string()];

        store
            .record_message(&msg(&key, "m1", "alice", "kickoff", 0, 100), &sender_only)
            .await
            .unwrap();
        // No row for bob yet, so the squad is not in his inbox.
        assert!(store.list_conversations("bob").await.unwrap().is_empty());

        // First read enrolls him; traffic counts from here on.
        store.mark_read(&key.to_string(), "bob").await.unwrap();
        store
            .record_message(&msg(&key, "m2", "alice", "update", 1, 200), &sender_only)
            .await
            .unwrap();

        let inbox = store.list_conversations("bob").await.unwrap();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].conversation_key, key.to_string());
        assert_eq!(inbox[0].unread_count, 1);
        assert!(inbox[0].other_participant.is_none());
    }

    #[tokio::test]
    async fn soft_clear_hides_history_for_one_user_only() {
        let store = test_store().await;
        let key = ConversationKey::direct("alice", "bob");
        let participants = vec!["alice".to_string(), "bob".to_string()];
        store
            .record_message(&msg(&key, "m1", "alice", "before", 0, 100), &participants)
            .await
            .unwrap();

        store.clear_for_user(&key.to_string(), "bob").await.unwrap();
        assert!(store.messages_for(&key.to_string(), "bob").await.unwrap().is_empty());
        assert_eq!(store.messages_for(&key.to_string(), "alice").await.unwrap().len(), 1);

        // New traffic shows up again after the watermark.
        let later = chrono::Utc::now().timestamp_millis() + 1000;
        store
            .record_message(&msg(&key, "m2", "alice", "after", 1, later), &participants)
            .await
            .unwrap();
        let visible = store.messages_for(&key.to_string(), "bob").await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].content, "after");
    }
}
