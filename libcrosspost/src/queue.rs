//! At-least-once message queues
//!
//! Messages become invisible for a visibility timeout when dequeued and
//! reappear unless acknowledged with the pop receipt from that dequeue. Every
//! dequeue increments the message's dequeue count, which consumers use to
//! bound retries.

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use sqlx::Row;
use std::time::Duration;

use crate::db::Database;
use crate::error::{DbError, Result};

/// Queue carrying serialized delivery jobs
pub const DELIVERY_QUEUE: &str = "postingqueue";
/// Queue carrying trigger events from webhooks
pub const TRIGGER_QUEUE: &str = "generatequeue";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub id: i64,
    pub pop_receipt: String,
    pub dequeue_count: u32,
    pub payload: String,
    pub inserted_at: i64,
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Add a message that becomes visible after `delay`.
    async fn enqueue(&self, payload: &str, delay: Duration) -> Result<i64>;

    /// Take up to `max` visible messages, hiding them for `visibility_timeout`.
    async fn dequeue(&self, max: usize, visibility_timeout: Duration) -> Result<Vec<QueueMessage>>;

    /// Delete a message. `false` if the receipt is stale (someone else dequeued it since).
    async fn ack(&self, message: &QueueMessage) -> Result<bool>;

    /// Make the message visible again after `delay`.
    ///
    /// With `count_attempt = false` the dequeue that returned it is not
    /// counted, for deferrals that are not delivery attempts.
    async fn defer(
        &self,
        message: &QueueMessage,
        delay: Duration,
        count_attempt: bool,
    ) -> Result<bool>;

    /// Messages currently stored, visible or not
    async fn len(&self) -> Result<u64>;
}

/// Serialize `value` as JSON and enqueue it.
pub async fn enqueue_json<T: Serialize + Sync>(
    queue: &dyn MessageQueue,
    value: &T,
    delay: Duration,
) -> Result<i64> {
    let payload = serde_json::to_string(value)?;
    queue.enqueue(&payload, delay).await
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// Queue stored in the `queue_messages` table, partitioned by name.
#[derive(Clone)]
pub struct SqliteQueue {
    db: Database,
    name: String,
}

impl SqliteQueue {
    pub fn new(db: Database, name: impl Into<String>) -> Self {
        Self {
            db,
            name: name.into(),
        }
    }

    pub fn delivery(db: Database) -> Self {
        Self::new(db, DELIVERY_QUEUE)
    }

    pub fn triggers(db: Database) -> Self {
        Self::new(db, TRIGGER_QUEUE)
    }
}

#[async_trait]
impl MessageQueue for SqliteQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn enqueue(&self, payload: &str, delay: Duration) -> Result<i64> {
        let now = Utc::now().timestamp_millis();
        let visible_at = now.saturating_add(millis(delay));

        let result = sqlx::query(
            r#"
            INSERT INTO queue_messages (queue_name, payload, visible_at, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&self.name)
        .bind(payload)
        .bind(visible_at)
        .bind(now)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.last_insert_rowid())
    }

    async fn dequeue(&self, max: usize, visibility_timeout: Duration) -> Result<Vec<QueueMessage>> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now().timestamp_millis();
        let hidden_until = now.saturating_add(millis(visibility_timeout));
        let receipt = uuid::Uuid::new_v4().simple().to_string();

        // Single statement: selection and hiding happen atomically.
        let rows = sqlx::query(
            r#"
            UPDATE queue_messages
            SET visible_at = ?, dequeue_count = dequeue_count + 1, pop_receipt = ?
            WHERE id IN (
                SELECT id FROM queue_messages
                WHERE queue_name = ? AND visible_at <= ?
                ORDER BY visible_at, id
                LIMIT ?
            )
            RETURNING id, payload, dequeue_count, pop_receipt, created_at
            "#,
        )
        .bind(hidden_until)
        .bind(&receipt)
        .bind(&self.name)
        .bind(now)
        .bind(max as i64)
        .fetch_all(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        let mut messages: Vec<QueueMessage> = rows
            .into_iter()
            .map(|r| QueueMessage {
                id: r.get("id"),
                pop_receipt: r.get("pop_receipt"),
                dequeue_count: r.get::<i64, _>("dequeue_count").max(0) as u32,
                payload: r.get("payload"),
                inserted_at: r.get("created_at"),
            })
            .collect();
        messages.sort_by_key(|m| m.id);

        Ok(messages)
    }

    async fn ack(&self, message: &QueueMessage) -> Result<bool> {
        let result = sqlx::query("DELETE FROM queue_messages WHERE id = ? AND pop_receipt = ?")
            .bind(message.id)
            .bind(&message.pop_receipt)
            .execute(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    async fn defer(
        &self,
        message: &QueueMessage,
        delay: Duration,
        count_attempt: bool,
    ) -> Result<bool> {
        let visible_at = Utc::now().timestamp_millis().saturating_add(millis(delay));
        let refund: i64 = if count_attempt { 0 } else { 1 };

        let result = sqlx::query(
            r#"
            UPDATE queue_messages
            SET visible_at = ?, dequeue_count = MAX(dequeue_count - ?, 0)
            WHERE id = ? AND pop_receipt = ?
            "#,
        )
        .bind(visible_at)
        .bind(refund)
        .bind(message.id)
        .bind(&message.pop_receipt)
        .execute(self.db.pool())
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    async fn len(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM queue_messages WHERE queue_name = ?")
            .bind(&self.name)
            .fetch_one(self.db.pool())
            .await
            .map_err(DbError::SqlxError)?;

        Ok(row.get::<i64, _>("n").max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Database, SqliteQueue) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("queue.db");
        let db = Database::new(&db_path.to_string_lossy()).await.unwrap();
        let queue = SqliteQueue::delivery(db.clone());
        (temp_dir, db, queue)
    }

    const HIDE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_enqueue_dequeue_ack() {
        let (_temp, _db, queue) = setup().await;
        queue.enqueue("a", Duration::ZERO).await.unwrap();
        queue.enqueue("b", Duration::ZERO).await.unwrap();

        let messages = queue.dequeue(10, HIDE).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].payload, "a");
        assert_eq!(messages[0].dequeue_count, 1);

        // Hidden while in flight
        assert!(queue.dequeue(10, HIDE).await.unwrap().is_empty());

        assert!(queue.ack(&messages[0]).await.unwrap());
        assert!(!queue.ack(&messages[0]).await.unwrap());
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unacked_message_is_redelivered() {
        let (_temp, _db, queue) = setup().await;
        queue.enqueue("job", Duration::ZERO).await.unwrap();

        let first = queue.dequeue(1, Duration::ZERO).await.unwrap();
        assert_eq!(first.len(), 1);

        let second = queue.dequeue(1, HIDE).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, first[0].id);
        assert_eq!(second[0].dequeue_count, 2);

        // The earlier receipt is stale now
        assert!(!queue.ack(&first[0]).await.unwrap());
        assert!(queue.ack(&second[0]).await.unwrap());
    }

    #[tokio::test]
    async fn test_delayed_message_not_visible() {
        let (_temp, _db, queue) = setup().await;
        queue
            .enqueue("later", Duration::from_secs(3600))
            .await
            .unwrap();

        assert!(queue.dequeue(10, HIDE).await.unwrap().is_empty());
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_defer_with_and_without_counting() {
        let (_temp, _db, queue) = setup().await;
        queue.enqueue("job", Duration::ZERO).await.unwrap();

        let msg = queue.dequeue(1, HIDE).await.unwrap().remove(0);
        assert!(queue.defer(&msg, Duration::ZERO, false).await.unwrap());

        let msg = queue.dequeue(1, HIDE).await.unwrap().remove(0);
        assert_eq!(msg.dequeue_count, 1, "uncounted deferral refunds the dequeue");

        assert!(queue.defer(&msg, Duration::ZERO, true).await.unwrap());
        let msg = queue.dequeue(1, HIDE).await.unwrap().remove(0);
        assert_eq!(msg.dequeue_count, 2);

        assert!(queue.defer(&msg, Duration::from_secs(3600), true).await.unwrap());
        assert!(queue.dequeue(1, HIDE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queues_are_isolated_by_name() {
        let (_temp, db, delivery) = setup().await;
        let triggers = SqliteQueue::triggers(db);

        delivery.enqueue("d", Duration::ZERO).await.unwrap();
        triggers.enqueue("t", Duration::ZERO).await.unwrap();

        let msgs = triggers.dequeue(10, HIDE).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].payload, "t");
        assert_eq!(delivery.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_json() {
        let (_temp, _db, queue) = setup().await;
        enqueue_json(&queue, &serde_json::json!({"k": 1}), Duration::ZERO)
            .await
            .unwrap();

        let msg = queue.dequeue(1, HIDE).await.unwrap().remove(0);
        let value: serde_json::Value = serde_json::from_str(&msg.payload).unwrap();
        assert_eq!(value["k"], 1);
    }

    #[tokio::test]
    async fn test_concurrent_dequeues_do_not_share_messages() {
        let (_temp, _db, queue) = setup().await;
        for i in 0..20 {
            queue.enqueue(&i.to_string(), Duration::ZERO).await.unwrap();
        }

        let takers = (0..4).map(|_| {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(10, HIDE).await.unwrap() })
        });
        let mut ids: Vec<i64> = futures::future::join_all(takers)
            .await
            .into_iter()
            .flat_map(|r| r.unwrap())
            .map(|m| m.id)
            .collect();

        let total = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(total, 20);
        assert_eq!(ids.len(), 20);
    }
}
