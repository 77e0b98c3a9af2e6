//! Per-target posting budgets
//!
//! Counts deliveries per target platform in fixed one-hour windows. The
//! worker checks the budget before claiming a job and defers the message to
//! the next window when it is spent.

use std::collections::HashMap;

use crate::error::{DbError, Result};
use crate::Database;

const WINDOW_SECS: i64 = 3600;

#[derive(Debug, Clone, Default)]
pub struct RateLimiter {
    /// Posts per hour by target id; targets without an entry are unlimited
    limits: HashMap<String, u32>,
}

impl RateLimiter {
    pub fn new(limits: HashMap<String, u32>) -> Self {
        Self { limits }
    }

    pub fn limit_for(&self, target: &str) -> Option<u32> {
        self.limits.get(target).copied()
    }

    /// Deliveries still allowed in the window containing `now`, `None` if unlimited
    pub async fn remaining(&self, db: &Database, target: &str, now: i64) -> Result<Option<u32>> {
        let Some(limit) = self.limit_for(target) else {
            return Ok(None);
        };
        let used = window_count(db, target, window_start(now)).await?;
        Ok(Some(limit.saturating_sub(used)))
    }

    /// Whether another delivery to `target` fits in the current window
    pub async fn check(&self, db: &Database, target: &str, now: i64) -> Result<bool> {
        Ok(self
            .remaining(db, target, now)
            .await?
            .map_or(true, |left| left > 0))
    }

    /// Count one delivery against the current window
    pub async fn record(&self, db: &Database, target: &str, now: i64) -> Result<()> {
        if self.limit_for(target).is_none() {
            return Ok(());
        }
        increment_window(db, target, window_start(now)).await
    }

    /// Check and, if allowed, record in one call
    pub async fn check_and_record(&self, db: &Database, target: &str, now: i64) -> Result<bool> {
        if !self.check(db, target, now).await? {
            return Ok(false);
        }
        self.record(db, target, now).await?;
        Ok(true)
    }

    /// Drop windows that ended before `cutoff`
    pub async fn cleanup_old_windows(&self, db: &Database, cutoff: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM rate_limits WHERE window_start < ?")
            .bind(window_start(cutoff))
            .execute(db.pool())
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected())
    }
}

/// Floor `timestamp` to its hour
pub fn window_start(timestamp: i64) -> i64 {
    timestamp.div_euclid(WINDOW_SECS) * WINDOW_SECS
}

/// Start of the window after the one containing `timestamp`
pub fn next_window_start(timestamp: i64) -> i64 {
    window_start(timestamp) + WINDOW_SECS
}

async fn window_count(db: &Database, target: &str, start: i64) -> Result<u32> {
    let row = sqlx::query_as::<_, (i64,)>(
        r#"
        SELECT post_count FROM rate_limits
        WHERE platform = ? AND window_start = ?
        "#,
    )
    .bind(target)
    .bind(start)
    .fetch_optional(db.pool())
    .await
    .map_err(DbError::SqlxError)?;

    Ok(row.map_or(0, |r| r.0.max(0) as u32))
}

async fn increment_window(db: &Database, target: &str, start: i64) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO rate_limits (platform, window_start, post_count)
        VALUES (?, ?, 1)
        ON CONFLICT(platform, window_start)
        DO UPDATE SET post_count = post_count + 1
        "#,
    )
    .bind(target)
    .bind(start)
    .execute(db.pool())
    .await
    .map_err(DbError::SqlxError)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup_test_db() -> (TempDir, Database) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(&db_path.to_string_lossy()).await.unwrap();
        (temp_dir, db)
    }

    fn limiter(target: &str, limit: u32) -> RateLimiter {
        RateLimiter::new(HashMap::from([(target.to_string(), limit)]))
    }

    #[test]
    fn test_window_boundaries() {
        assert_eq!(window_start(7199), 3600);
        assert_eq!(window_start(7200), 7200);
        assert_eq!(next_window_start(7199), 7200);
        assert_eq!(next_window_start(7200), 10800);
    }

    #[tokio::test]
    async fn test_blocks_after_limit() {
        let (_temp, db) = setup_test_db().await;
        let limiter = limiter("discord", 3);
        let now = 1_000_000;

        for i in 0..3 {
            assert!(
                limiter.check_and_record(&db, "discord", now).await.unwrap(),
                "delivery {} should fit",
                i + 1
            );
        }
        assert!(!limiter.check_and_record(&db, "discord", now).await.unwrap());
        assert_eq!(limiter.remaining(&db, "discord", now).await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn test_next_window_resets_budget() {
        let (_temp, db) = setup_test_db().await;
        let limiter = limiter("discord", 1);
        let now = 1_000_000;

        assert!(limiter.check_and_record(&db, "discord", now).await.unwrap());
        assert!(!limiter.check(&db, "discord", now + 10).await.unwrap());
        assert!(limiter
            .check(&db, "discord", next_window_start(now))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_targets_are_independent_and_unlimited_by_default() {
        let (_temp, db) = setup_test_db().await;
        let limiter = limiter("discord", 1);
        let now = 1_000_000;

        limiter.record(&db, "discord", now).await.unwrap();
        assert!(!limiter.check(&db, "discord", now).await.unwrap());

        for _ in 0..50 {
            assert!(limiter.check_and_record(&db, "telegram", now).await.unwrap());
        }
        assert_eq!(limiter.remaining(&db, "telegram", now).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cleanup_old_windows() {
        let (_temp, db) = setup_test_db().await;
        let limiter = limiter("discord", 1);
        let old = 1_000_000;
        let current = old + 7200;

        limiter.record(&db, "discord", old).await.unwrap();
        limiter.record(&db, "discord", current).await.unwrap();

        assert_eq!(limiter.cleanup_old_windows(&db, current).await.unwrap(), 1);
        assert!(!limiter.check(&db, "discord", current).await.unwrap());
    }
}
