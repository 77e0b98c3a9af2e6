//! Database operations for crosspost
//!
//! One SQLite file holds API keys, delivery job records, the message queues,
//! the webhook dedup ledger, the trigger registry, templates and rate-limit
//! windows. The API server and the worker open the same file; WAL mode lets
//! them do so concurrently.

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqliteRow};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;

use crate::error::{DbError, Result};
use crate::types::{
    ApiKeyRecord, ExternalTriggerRecord, JobRecord, JobStatus, PartFailure, PostTemplateRecord,
};

/// Final state written when a job leaves `Posting`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobCompletion {
    pub status: JobStatus,
    pub platform_post_id: Option<String>,
    pub failed_parts: Vec<PartFailure>,
    pub last_error: Option<String>,
}

impl JobCompletion {
    pub fn faulted(error: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Faulted,
            platform_post_id: None,
            failed_parts: Vec::new(),
            last_error: Some(error.into()),
        }
    }
}

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `db_path` and run migrations
    pub async fn new(db_path: &str) -> Result<Self> {
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        // Forward slashes keep the URL valid on Windows too
        let db_url = format!("sqlite://{}", expanded_path.replace('\\', "/"));
        let options = SqliteConnectOptions::from_str(&db_url)
            .map_err(DbError::SqlxError)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(options)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ========================================================================
    // API keys
    // ========================================================================

    pub async fn insert_api_key(
        &self,
        user_id: &str,
        key_id: &str,
        token: &str,
        created_at: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO api_keys (user_id, key_id, secret_token, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(key_id)
        .bind(token)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// The stored token for `(user_id, key_id)`, if the key exists
    pub async fn get_api_key_token(&self, user_id: &str, key_id: &str) -> Result<Option<String>> {
        let row = sqlx::query(
            r#"
            SELECT secret_token FROM api_keys WHERE user_id = ? AND key_id = ?
            "#,
        )
        .bind(user_id)
        .bind(key_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| r.get("secret_token")))
    }

    pub async fn list_api_keys(&self, user_id: Option<&str>) -> Result<Vec<ApiKeyRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, key_id, created_at FROM api_keys
            WHERE (? IS NULL OR user_id = ?)
            ORDER BY user_id, created_at
            "#,
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows
            .into_iter()
            .map(|r| ApiKeyRecord {
                user_id: r.get("user_id"),
                key_id: r.get("key_id"),
                created_at: r.get("created_at"),
            })
            .collect())
    }

    pub async fn delete_api_key(&self, user_id: &str, key_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM api_keys WHERE user_id = ? AND key_id = ?")
            .bind(user_id)
            .bind(key_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // Delivery jobs
    // ========================================================================

    pub async fn insert_job(&self, job: &JobRecord) -> Result<()> {
        let failed_parts = encode_parts(&job.failed_parts)?;

        sqlx::query(
            r#"
            INSERT INTO delivery_jobs (
                job_id, root_post_id, user_id, target_platform_id, post_at, status,
                attempts, last_error, failed_parts, platform_post_id, lease_until,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.job_id)
        .bind(&job.root_post_id)
        .bind(&job.user_id)
        .bind(&job.target_platform_id)
        .bind(job.post_at)
        .bind(i64::from(job.status.code()))
        .bind(i64::from(job.attempts))
        .bind(&job.last_error)
        .bind(failed_parts)
        .bind(&job.platform_post_id)
        .bind(job.lease_until)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>> {
        let row = sqlx::query(&format!("{} WHERE job_id = ?", JOB_SELECT))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        row.as_ref().map(row_to_job).transpose()
    }

    /// Most recent jobs first, optionally filtered by user and status
    pub async fn list_jobs(
        &self,
        user_id: Option<&str>,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobRecord>> {
        let status_code = status.map(|s| i64::from(s.code()));
        let rows = sqlx::query(&format!(
            "{} WHERE (? IS NULL OR user_id = ?) AND (? IS NULL OR status = ?) \
             ORDER BY created_at DESC, job_id LIMIT ?",
            JOB_SELECT
        ))
        .bind(user_id)
        .bind(user_id)
        .bind(status_code)
        .bind(status_code)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_job).collect()
    }

    pub async fn jobs_for_root(&self, root_post_id: &str) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query(&format!(
            "{} WHERE root_post_id = ? ORDER BY target_platform_id",
            JOB_SELECT
        ))
        .bind(root_post_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        rows.iter().map(row_to_job).collect()
    }

    /// Move a job to `Posting` under a lease.
    ///
    /// Succeeds only from `Queued`, or from `Posting` whose lease has expired.
    /// Returns whether this caller now owns the job.
    pub async fn claim_job(&self, job_id: &str, now: i64, lease_until: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET status = 1, attempts = attempts + 1, lease_until = ?, updated_at = ?
            WHERE job_id = ?
              AND (status = 0 OR (status = 1 AND (lease_until IS NULL OR lease_until <= ?)))
            "#,
        )
        .bind(lease_until)
        .bind(now)
        .bind(job_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// `Posting -> Queued` after a transient failure
    pub async fn release_job(&self, job_id: &str, error: &str, now: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET status = 0, last_error = ?, lease_until = NULL, updated_at = ?
            WHERE job_id = ? AND status = 1
            "#,
        )
        .bind(error)
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Write a terminal state. Terminal rows are never overwritten.
    pub async fn finish_job(
        &self,
        job_id: &str,
        completion: &JobCompletion,
        now: i64,
    ) -> Result<bool> {
        let failed_parts = encode_parts(&completion.failed_parts)?;

        let result = sqlx::query(
            r#"
            UPDATE delivery_jobs
            SET status = ?, platform_post_id = ?, failed_parts = ?, last_error = ?,
                lease_until = NULL, updated_at = ?
            WHERE job_id = ? AND status IN (0, 1)
            "#,
        )
        .bind(i64::from(completion.status.code()))
        .bind(&completion.platform_post_id)
        .bind(failed_parts)
        .bind(&completion.last_error)
        .bind(now)
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    // ========================================================================
    // Webhook dedup ledger
    // ========================================================================

    /// Atomically record `(source, message_id)`. Returns `false` for duplicates.
    pub async fn record_webhook_message(
        &self,
        source: &str,
        message_id: &str,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO webhook_messages (source, message_id, seen_at)
            VALUES (?, ?, ?)
            ON CONFLICT(source, message_id) DO NOTHING
            "#,
        )
        .bind(source)
        .bind(message_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Undo a ledger entry whose downstream hand-off failed, so a redelivery is processed.
    pub async fn forget_webhook_message(&self, source: &str, message_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM webhook_messages WHERE source = ? AND message_id = ?")
            .bind(source)
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(())
    }

    /// Delete ledger rows and trigger notification markers older than `cutoff`
    pub async fn prune_webhook_messages(&self, cutoff: i64) -> Result<u64> {
        let messages = sqlx::query("DELETE FROM webhook_messages WHERE seen_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        let markers = sqlx::query("DELETE FROM trigger_notifications WHERE notified_at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(DbError::SqlxError)?;

        Ok(messages.rows_affected() + markers.rows_affected())
    }

    /// Atomically mark `trigger_id` as fired for one webhook message.
    ///
    /// Returns `false` when an earlier run of the same event already fired it.
    pub async fn record_trigger_notification(
        &self,
        source: &str,
        message_id: &str,
        user_id: &str,
        trigger_id: &str,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO trigger_notifications (source, message_id, user_id, trigger_id, notified_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(source, message_id, user_id, trigger_id) DO NOTHING
            "#,
        )
        .bind(source)
        .bind(message_id)
        .bind(user_id)
        .bind(trigger_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Drop a marker whose submission failed, so a retry of the event fires it again.
    pub async fn forget_trigger_notification(
        &self,
        source: &str,
        message_id: &str,
        user_id: &str,
        trigger_id: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM trigger_notifications
            WHERE source = ? AND message_id = ? AND user_id = ? AND trigger_id = ?
            "#,
        )
        .bind(source)
        .bind(message_id)
        .bind(user_id)
        .bind(trigger_id)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    // ========================================================================
    // External triggers
    // ========================================================================

    /// Insert a trigger and add its user to the account's interest set
    pub async fn insert_trigger(&self, trigger: &ExternalTriggerRecord) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        sqlx::query(
            r#"
            INSERT INTO external_triggers (
                user_id, trigger_id, external_account_id, external_account_type,
                post_template_id, target_platform_id, notify_frequency_hours,
                last_notified_at, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&trigger.user_id)
        .bind(&trigger.trigger_id)
        .bind(&trigger.external_account_id)
        .bind(&trigger.external_account_type)
        .bind(&trigger.post_template_id)
        .bind(&trigger.target_platform_id)
        .bind(i64::from(trigger.notify_frequency_hours))
        .bind(trigger.last_notified_at)
        .bind(trigger.created_at)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        sqlx::query(
            r#"
            INSERT INTO external_interests (external_account_type, external_account_id, user_id)
            VALUES (?, ?, ?)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&trigger.external_account_type)
        .bind(&trigger.external_account_id)
        .bind(&trigger.user_id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(())
    }

    /// Remove a trigger; drop the interest entry once the user has no other
    /// trigger on the same account. Returns whether the trigger existed.
    pub async fn delete_trigger(&self, user_id: &str, trigger_id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await.map_err(DbError::SqlxError)?;

        let row = sqlx::query(
            r#"
            SELECT external_account_type, external_account_id FROM external_triggers
            WHERE user_id = ? AND trigger_id = ?
            "#,
        )
        .bind(user_id)
        .bind(trigger_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        let Some(row) = row else {
            return Ok(false);
        };
        let account_type: String = row.get("external_account_type");
        let account_id: String = row.get("external_account_id");

        sqlx::query("DELETE FROM external_triggers WHERE user_id = ? AND trigger_id = ?")
            .bind(user_id)
            .bind(trigger_id)
            .execute(&mut *tx)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::query(
            r#"
            DELETE FROM external_interests
            WHERE external_account_type = ? AND external_account_id = ? AND user_id = ?
              AND NOT EXISTS (
                  SELECT 1 FROM external_triggers
                  WHERE user_id = ? AND external_account_type = ? AND external_account_id = ?
              )
            "#,
        )
        .bind(&account_type)
        .bind(&account_id)
        .bind(user_id)
        .bind(user_id)
        .bind(&account_type)
        .bind(&account_id)
        .execute(&mut *tx)
        .await
        .map_err(DbError::SqlxError)?;

        tx.commit().await.map_err(DbError::SqlxError)?;
        Ok(true)
    }

    pub async fn get_trigger(
        &self,
        user_id: &str,
        trigger_id: &str,
    ) -> Result<Option<ExternalTriggerRecord>> {
        let row = sqlx::query(&format!(
            "{} WHERE user_id = ? AND trigger_id = ?",
            TRIGGER_SELECT
        ))
        .bind(user_id)
        .bind(trigger_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.as_ref().map(row_to_trigger))
    }

    pub async fn list_triggers(&self, user_id: &str) -> Result<Vec<ExternalTriggerRecord>> {
        let rows = sqlx::query(&format!(
            "{} WHERE user_id = ? ORDER BY created_at, trigger_id",
            TRIGGER_SELECT
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows.iter().map(row_to_trigger).collect())
    }

    /// Users with at least one trigger on the given external account
    pub async fn interested_users(
        &self,
        account_type: &str,
        account_id: &str,
    ) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id FROM external_interests
            WHERE external_account_type = ? AND external_account_id = ?
            ORDER BY user_id
            "#,
        )
        .bind(account_type)
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows.into_iter().map(|r| r.get("user_id")).collect())
    }

    pub async fn triggers_for_account(
        &self,
        user_id: &str,
        account_type: &str,
        account_id: &str,
    ) -> Result<Vec<ExternalTriggerRecord>> {
        let rows = sqlx::query(&format!(
            "{} WHERE user_id = ? AND external_account_type = ? AND external_account_id = ? \
             ORDER BY trigger_id",
            TRIGGER_SELECT
        ))
        .bind(user_id)
        .bind(account_type)
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(rows.iter().map(row_to_trigger).collect())
    }

    /// Stamp `last_notified_at = now` if the trigger's notification gap has elapsed.
    ///
    /// Returns `false` when the trigger notified too recently (or no longer exists).
    pub async fn try_mark_trigger_notified(
        &self,
        user_id: &str,
        trigger_id: &str,
        now: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE external_triggers SET last_notified_at = ?
            WHERE user_id = ? AND trigger_id = ?
              AND (last_notified_at IS NULL
                   OR last_notified_at + notify_frequency_hours * 3600 <= ?)
            "#,
        )
        .bind(now)
        .bind(user_id)
        .bind(trigger_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(result.rows_affected() == 1)
    }

    /// Put back the previous `last_notified_at` after a failed notification.
    pub async fn restore_trigger_notified(
        &self,
        user_id: &str,
        trigger_id: &str,
        stamped: i64,
        previous: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE external_triggers SET last_notified_at = ?
            WHERE user_id = ? AND trigger_id = ? AND last_notified_at = ?
            "#,
        )
        .bind(previous)
        .bind(user_id)
        .bind(trigger_id)
        .bind(stamped)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    // ========================================================================
    // Post templates
    // ========================================================================

    pub async fn upsert_template(
        &self,
        user_id: &str,
        template_id: &str,
        title: &str,
        body: &str,
        now: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO post_templates (user_id, template_id, title, body, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(user_id, template_id)
            DO UPDATE SET title = excluded.title, body = excluded.body,
                          updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(template_id)
        .bind(title)
        .bind(body)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(())
    }

    pub async fn get_template(
        &self,
        user_id: &str,
        template_id: &str,
    ) -> Result<Option<PostTemplateRecord>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, template_id, title, body, updated_at FROM post_templates
            WHERE user_id = ? AND template_id = ?
            "#,
        )
        .bind(user_id)
        .bind(template_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::SqlxError)?;

        Ok(row.map(|r| PostTemplateRecord {
            user_id: r.get("user_id"),
            template_id: r.get("template_id"),
            title: r.get("title"),
            body: r.get("body"),
            updated_at: r.get("updated_at"),
        }))
    }
}

const JOB_SELECT: &str = r#"
    SELECT job_id, root_post_id, user_id, target_platform_id, post_at, status, attempts,
           last_error, failed_parts, platform_post_id, lease_until, created_at, updated_at
    FROM delivery_jobs
"#;

const TRIGGER_SELECT: &str = r#"
    SELECT user_id, trigger_id, external_account_id, external_account_type, post_template_id,
           target_platform_id, notify_frequency_hours, last_notified_at, created_at
    FROM external_triggers
"#;

fn encode_parts(parts: &[PartFailure]) -> Result<Option<String>> {
    if parts.is_empty() {
        Ok(None)
    } else {
        Ok(Some(serde_json::to_string(parts)?))
    }
}

fn row_to_job(r: &SqliteRow) -> Result<JobRecord> {
    let code: i64 = r.get("status");
    let status = u8::try_from(code)
        .map_err(|e| e.to_string())
        .and_then(JobStatus::try_from)
        .map_err(|e| DbError::SqlxError(sqlx::Error::Decode(e.into())))?;

    let failed_parts = match r.get::<Option<String>, _>("failed_parts") {
        Some(json) => serde_json::from_str(&json)?,
        None => Vec::new(),
    };

    Ok(JobRecord {
        job_id: r.get("job_id"),
        root_post_id: r.get("root_post_id"),
        user_id: r.get("user_id"),
        target_platform_id: r.get("target_platform_id"),
        post_at: r.get("post_at"),
        status,
        attempts: r.get::<i64, _>("attempts").max(0) as u32,
        last_error: r.get("last_error"),
        failed_parts,
        platform_post_id: r.get("platform_post_id"),
        lease_until: r.get("lease_until"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

fn row_to_trigger(r: &SqliteRow) -> ExternalTriggerRecord {
    ExternalTriggerRecord {
        user_id: r.get("user_id"),
        trigger_id: r.get("trigger_id"),
        external_account_id: r.get("external_account_id"),
        external_account_type: r.get("external_account_type"),
        post_template_id: r.get("post_template_id"),
        target_platform_id: r.get("target_platform_id"),
        notify_frequency_hours: r.get::<i64, _>("notify_frequency_hours").max(0) as u32,
        last_notified_at: r.get("last_notified_at"),
        created_at: r.get("created_at"),
    }
}
