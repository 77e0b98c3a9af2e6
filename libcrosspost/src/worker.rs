//! Delivery worker
//!
//! Consumes the delivery queue and drives each job through
//! `Queued -> Posting -> {Posted | Faulted | SomeFaults}`.
//!
//! The queue is at-least-once, so [`DeliveryWorker::handle`] must tolerate
//! seeing the same job again after a crash or a lost acknowledgement:
//!
//! - a terminal record is acknowledged without calling the platform, and its
//!   lock marker is removed again in case the previous run died before that
//! - a job is only delivered by the worker that moved it to `Posting`; an
//!   expired lease lets another worker take over
//! - a platform call is abandoned after `delivery_timeout`, which is shorter
//!   than the lease, and the job is faulted; a call still running when the
//!   lease expires would otherwise be made a second time
//! - transient failures go back to `Queued` and reappear after a backoff
//!   until the dequeue count reaches `max_attempts`

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::config::{Config, QueueConfig};
use crate::db::{Database, JobCompletion};
use crate::error::Result;
use crate::platforms::{DeliveryContext, PlatformRegistry};
use crate::queue::{MessageQueue, QueueMessage};
use crate::rate_limiter::{next_window_start, RateLimiter};
use crate::retry::RetryPolicy;
use crate::session::SessionRegistry;
use crate::staging::{ContentStaging, SweepReport};
use crate::types::{DeliveryJob, JobStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSettings {
    pub visibility_timeout: Duration,
    /// Upper bound on one platform call; must stay below `visibility_timeout`
    pub delivery_timeout: Duration,
    pub max_attempts: u32,
    pub batch_size: usize,
    pub retry: RetryPolicy,
}

impl WorkerSettings {
    pub fn from_config(queue: &QueueConfig) -> Self {
        Self {
            visibility_timeout: queue.visibility_timeout(),
            delivery_timeout: delivery_deadline(queue.visibility_timeout()),
            max_attempts: queue.max_attempts,
            batch_size: queue.batch_size,
            retry: RetryPolicy::from_config(queue),
        }
    }
}

/// Four fifths of the lease, leaving time to record the outcome before it expires.
pub fn delivery_deadline(visibility_timeout: Duration) -> Duration {
    visibility_timeout.saturating_sub(visibility_timeout / 5)
}

/// Lease end in whole seconds, rounded up so the lease never ends before
/// `visibility_timeout` has passed.
fn lease_deadline(now_millis: i64, visibility_timeout: Duration) -> i64 {
    let visibility = i64::try_from(visibility_timeout.as_millis()).unwrap_or(i64::MAX);
    let end = now_millis.saturating_add(visibility);
    end.div_euclid(1000) + i64::from(end.rem_euclid(1000) != 0)
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(&QueueConfig::default())
    }
}

/// What happened to one queue message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Message acknowledged without a job to act on
    Dropped(String),
    /// Record was already terminal; acknowledged, platform not called
    AlreadyFinished(JobStatus),
    /// Not due yet or over budget; made visible again later
    Deferred(Duration),
    /// Another worker holds the job; message left for redelivery
    Busy,
    /// Transient failure; job back to `Queued`, message visible after the delay
    Retrying(Duration),
    /// Job reached a terminal state
    Finished(JobStatus),
}

#[derive(Clone)]
pub struct DeliveryWorker {
    db: Database,
    staging: ContentStaging,
    queue: Arc<dyn MessageQueue>,
    platforms: Arc<PlatformRegistry>,
    sessions: Arc<SessionRegistry>,
    rate_limiter: RateLimiter,
    settings: WorkerSettings,
}

impl DeliveryWorker {
    pub fn new(
        db: Database,
        staging: ContentStaging,
        queue: Arc<dyn MessageQueue>,
        platforms: Arc<PlatformRegistry>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            db,
            staging,
            queue,
            platforms,
            sessions,
            rate_limiter: RateLimiter::default(),
            settings: WorkerSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: WorkerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_rate_limiter(mut self, rate_limiter: RateLimiter) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Dequeue one batch and handle it concurrently. Returns the batch size.
    pub async fn run_once(&self) -> Result<usize> {
        let messages = self
            .queue
            .dequeue(self.settings.batch_size, self.settings.visibility_timeout)
            .await?;

        if messages.is_empty() {
            return Ok(0);
        }

        debug!(queue = self.queue.name(), count = messages.len(), "dequeued delivery batch");

        let results = join_all(messages.iter().map(|m| self.handle(m))).await;
        for (message, result) in messages.iter().zip(results) {
            if let Err(e) = result {
                // Left unacknowledged; the queue redelivers it after the visibility timeout.
                warn!(message_id = message.id, error = %e, "failed to handle delivery message");
            }
        }

        Ok(messages.len())
    }

    /// Handle one delivery message.
    pub async fn handle(&self, message: &QueueMessage) -> Result<HandleOutcome> {
        let job: DeliveryJob = match serde_json::from_str(&message.payload) {
            Ok(job) => job,
            Err(e) => {
                warn!(message_id = message.id, error = %e, "dropping unparseable delivery message");
                self.queue.ack(message).await?;
                return Ok(HandleOutcome::Dropped(format!("invalid payload: {}", e)));
            }
        };

        let Some(record) = self.db.get_job(&job.job_id).await? else {
            warn!(job_id = %job.job_id, "dropping message for unknown job");
            self.queue.ack(message).await?;
            return Ok(HandleOutcome::Dropped(format!("job {} not found", job.job_id)));
        };

        if record.status.is_terminal() {
            debug!(job_id = %job.job_id, status = %record.status, "job already finished");
            self.release_lock(&job).await?;
            self.queue.ack(message).await?;
            return Ok(HandleOutcome::AlreadyFinished(record.status));
        }

        let now_millis = Utc::now().timestamp_millis();
        let now = now_millis.div_euclid(1000);

        if let Some(post_at) = record.post_at.filter(|at| *at > now) {
            let delay = Duration::from_secs((post_at - now) as u64);
            self.queue.defer(message, delay, false).await?;
            debug!(job_id = %job.job_id, delay_secs = delay.as_secs(), "job not due yet");
            return Ok(HandleOutcome::Deferred(delay));
        }

        let target = job.target_platform_id.as_str();
        if !self.rate_limiter.check(&self.db, target, now).await? {
            let delay = Duration::from_secs((next_window_start(now) - now).max(1) as u64);
            self.queue.defer(message, delay, false).await?;
            info!(
                job_id = %job.job_id,
                target = %target,
                delay_secs = delay.as_secs(),
                "rate limit reached, deferring"
            );
            return Ok(HandleOutcome::Deferred(delay));
        }

        let lease_until = lease_deadline(now_millis, self.settings.visibility_timeout);
        if !self.db.claim_job(&job.job_id, now, lease_until).await? {
            debug!(job_id = %job.job_id, "job claimed by another worker");
            return Ok(HandleOutcome::Busy);
        }

        if message.dequeue_count > self.settings.max_attempts {
            return self
                .finish(&job, message, JobCompletion::faulted("retries exhausted"))
                .await;
        }

        let Some(content) = self.staging.load(&job.root_post_id).await? else {
            return self
                .finish(&job, message, JobCompletion::faulted("content bundle missing"))
                .await;
        };

        let Some(platform) = self.platforms.get(target) else {
            return self
                .finish(
                    &job,
                    message,
                    JobCompletion::faulted(format!("no delivery platform for target '{}'", target)),
                )
                .await;
        };

        self.rate_limiter.record(&self.db, target, now).await?;

        let ctx = DeliveryContext {
            job: DeliveryJob {
                status: JobStatus::Posting,
                ..job.clone()
            },
            content,
            sessions: self.sessions.clone(),
            attempt: message.dequeue_count,
        };

        let delivery = tokio::time::timeout(self.settings.delivery_timeout, platform.deliver(&ctx));
        let Ok(result) = delivery.await else {
            warn!(
                job_id = %job.job_id,
                target = %target,
                timeout_ms = self.settings.delivery_timeout.as_millis() as u64,
                "delivery timed out"
            );
            let error = format!(
                "delivery timed out after {} ms",
                self.settings.delivery_timeout.as_millis()
            );
            return self.finish(&job, message, JobCompletion::faulted(error)).await;
        };

        let completion = match result {
            Ok(report) => JobCompletion {
                status: report.status(),
                platform_post_id: report.platform_post_id,
                failed_parts: report.failed_parts,
                last_error: None,
            },
            Err(e) if e.is_transient() && message.dequeue_count < self.settings.max_attempts => {
                let delay = self.settings.retry.retry_interval(message.dequeue_count);
                warn!(
                    job_id = %job.job_id,
                    target = %target,
                    attempt = message.dequeue_count,
                    retry_in_secs = delay.as_secs(),
                    error = %e,
                    "transient delivery failure"
                );
                self.db
                    .release_job(&job.job_id, &e.to_string(), Utc::now().timestamp())
                    .await?;
                self.queue.defer(message, delay, true).await?;
                return Ok(HandleOutcome::Retrying(delay));
            }
            Err(e) => {
                warn!(job_id = %job.job_id, target = %target, error = %e, "delivery failed");
                JobCompletion::faulted(e.to_string())
            }
        };

        self.finish(&job, message, completion).await
    }

    async fn finish(
        &self,
        job: &DeliveryJob,
        message: &QueueMessage,
        completion: JobCompletion,
    ) -> Result<HandleOutcome> {
        let status = completion.status;
        let written = self
            .db
            .finish_job(&job.job_id, &completion, Utc::now().timestamp())
            .await?;
        if !written {
            debug!(job_id = %job.job_id, "job was finished elsewhere");
        }

        self.release_lock(job).await?;
        self.queue.ack(message).await?;

        info!(
            job_id = %job.job_id,
            root_post_id = %job.root_post_id,
            target = %job.target_platform_id,
            status = %status,
            "delivery finished"
        );
        Ok(HandleOutcome::Finished(status))
    }

    async fn release_lock(&self, job: &DeliveryJob) -> Result<()> {
        self.staging
            .remove_lock(&job.root_post_id, &job.target_platform_id)
            .await?;
        Ok(())
    }
}

/// What one maintenance pass removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub bundles: SweepReport,
    pub ledger_rows: u64,
    pub rate_windows: u64,
}

/// Collect finished bundles and prune the dedup ledger and old rate windows.
pub async fn run_maintenance(
    db: &Database,
    staging: &ContentStaging,
    rate_limiter: &RateLimiter,
    retention: Duration,
) -> Result<MaintenanceReport> {
    let now = Utc::now().timestamp();
    let cutoff = now - retention.as_secs() as i64;

    let bundles = staging.sweep().await?;
    let ledger_rows = db.prune_webhook_messages(cutoff).await?;
    // Rate windows older than the current hour no longer count.
    let rate_windows = rate_limiter.cleanup_old_windows(db, now).await?;

    info!(
        collected = bundles.collected,
        still_locked = bundles.locked,
        ledger_rows,
        rate_windows,
        "maintenance pass complete"
    );

    Ok(MaintenanceReport {
        bundles,
        ledger_rows,
        rate_windows,
    })
}

/// Retention of the dedup ledger from configuration.
pub fn ledger_retention(config: &Config) -> Duration {
    Duration::from_secs(config.webhooks.retention_hours.saturating_mul(3600))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth;
    use crate::platforms::mock::{MockBehavior, MockPlatform};
    use crate::producer::Producer;
    use crate::queue::{enqueue_json, SqliteQueue};
    use crate::staging::CollectOutcome;
    use crate::storage::{MemoryObjectStore, ObjectStore};
    use crate::types::{JobRecord, PartFailure, PostContent};
    use std::collections::HashMap;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        db: Database,
        store: Arc<MemoryObjectStore>,
        staging: ContentStaging,
        queue: Arc<SqliteQueue>,
        producer: Producer,
        sessions: Arc<SessionRegistry>,
    }

    async fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let db = Database::new(&temp.path().join("t.db").to_string_lossy())
            .await
            .unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        let staging = ContentStaging::new(store.clone());
        let queue = Arc::new(SqliteQueue::delivery(db.clone()));
        let producer = Producer::new(db.clone(), staging.clone(), queue.clone());
        let sessions = SessionRegistry::new(store.clone());
        Fixture {
            _temp: temp,
            db,
            store,
            staging,
            queue,
            producer,
            sessions,
        }
    }

    fn fast_settings(max_attempts: u32) -> WorkerSettings {
        WorkerSettings {
            visibility_timeout: Duration::from_secs(30),
            delivery_timeout: Duration::from_secs(20),
            max_attempts,
            batch_size: 16,
            retry: RetryPolicy::new(1, Duration::ZERO),
        }
    }

    fn worker(f: &Fixture, platforms: Vec<MockPlatform>) -> DeliveryWorker {
        let mut registry = PlatformRegistry::new();
        for platform in platforms {
            registry.register(Arc::new(platform));
        }
        DeliveryWorker::new(
            f.db.clone(),
            f.staging.clone(),
            f.queue.clone(),
            Arc::new(registry),
            f.sessions.clone(),
        )
        .with_settings(fast_settings(3))
    }

    fn content() -> PostContent {
        PostContent {
            description: "hi".into(),
            tags: vec!["a".into()],
            ..Default::default()
        }
    }

    async fn submit(f: &Fixture, targets: &[&str]) -> crate::types::SubmitReceipt {
        let targets: Vec<String> = targets.iter().map(|t| t.to_string()).collect();
        f.producer
            .submit_for_user("alice", &targets, &content(), None)
            .await
            .unwrap()
    }

    async fn status_of(f: &Fixture, job_id: &str) -> JobStatus {
        f.db.get_job(job_id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_two_targets_are_posted_and_bundle_unlocked() {
        let f = fixture().await;
        let key = auth::generate_api_key(&f.db, "alice").await.unwrap();
        let telegram = MockPlatform::success("telegram");
        let discord = MockPlatform::success("discord");
        let w = worker(&f, vec![telegram.clone(), discord.clone()]);

        let request = crate::types::PostRequest {
            api_key: crate::types::ApiKeyRef {
                user_id: key.user_id.clone(),
                key_id: key.key_id.clone(),
                token: None,
            },
            target_platforms: vec!["telegram".into(), "discord".into()],
            media: vec![],
            title: String::new(),
            description: "hi".into(),
            html_description: String::new(),
            tags: vec!["a".into()],
            post_at: None,
        };
        let receipt = f.producer.submit(&request).await.unwrap();
        let root = receipt.root_post_id.clone();

        let mut locks = f.staging.locks(&root).await.unwrap();
        locks.sort();
        assert_eq!(locks, vec!["discord".to_string(), "telegram".to_string()]);
        for job in &receipt.jobs {
            assert_eq!(status_of(&f, &job.job_id).await, JobStatus::Queued);
        }

        assert_eq!(w.run_once().await.unwrap(), 2);

        for job in &receipt.jobs {
            assert_eq!(status_of(&f, &job.job_id).await, JobStatus::Posted);
        }
        assert_eq!(telegram.call_count(), 1);
        assert_eq!(discord.call_count(), 1);
        assert!(f.staging.locks(&root).await.unwrap().is_empty());
        assert_eq!(f.queue.len().await.unwrap(), 0);
        assert!(matches!(
            f.staging.collect(&root).await.unwrap(),
            CollectOutcome::Collected(_)
        ));
    }

    #[tokio::test]
    async fn test_redelivered_terminal_job_is_not_delivered_again() {
        let f = fixture().await;
        let telegram = MockPlatform::success("telegram");
        let w = worker(&f, vec![telegram.clone()]);

        let receipt = submit(&f, &["telegram"]).await;
        w.run_once().await.unwrap();
        assert_eq!(telegram.call_count(), 1);

        let record = f.db.get_job(&receipt.jobs[0].job_id).await.unwrap().unwrap();
        let job = DeliveryJob {
            root_post_id: record.root_post_id.clone(),
            job_id: record.job_id.clone(),
            user_id: record.user_id.clone(),
            target_platform_id: record.target_platform_id.clone(),
            post_at: None,
            status: JobStatus::Queued,
            media: vec![],
        };
        enqueue_json(f.queue.as_ref(), &job, Duration::ZERO).await.unwrap();

        let message = f
            .queue
            .dequeue(1, Duration::from_secs(30))
            .await
            .unwrap()
            .pop()
            .unwrap();
        let outcome = w.handle(&message).await.unwrap();

        assert_eq!(outcome, HandleOutcome::AlreadyFinished(JobStatus::Posted));
        assert_eq!(telegram.call_count(), 1);
        assert_eq!(status_of(&f, &job.job_id).await, JobStatus::Posted);
        assert_eq!(f.queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_future_post_at_is_deferred_without_attempt() {
        let f = fixture().await;
        let telegram = MockPlatform::success("telegram");
        let w = worker(&f, vec![telegram.clone()]);

        let post_at = Utc::now() + chrono::Duration::hours(1);
        let job = DeliveryJob {
            root_post_id: "root1".into(),
            job_id: "job1".into(),
            user_id: "alice".into(),
            target_platform_id: "telegram".into(),
            post_at: Some(post_at),
            status: JobStatus::Queued,
            media: vec![],
        };
        f.db.insert_job(&JobRecord::queued(&job, Utc::now().timestamp()))
            .await
            .unwrap();
        // Enqueued visible immediately, as if the clock moved backwards.
        enqueue_json(f.queue.as_ref(), &job, Duration::ZERO).await.unwrap();

        let message = f
            .queue
            .dequeue(1, Duration::from_secs(30))
            .await
            .unwrap()
            .pop()
            .unwrap();
        let outcome = w.handle(&message).await.unwrap();

        match outcome {
            HandleOutcome::Deferred(delay) => assert!(delay > Duration::from_secs(3500)),
            other => panic!("expected deferral, got {:?}", other),
        }
        assert_eq!(telegram.call_count(), 0);
        assert_eq!(status_of(&f, "job1").await, JobStatus::Queued);
        assert_eq!(f.queue.len().await.unwrap(), 1);
        assert_eq!(w.run_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_retries_then_posts() {
        let f = fixture().await;
        let flaky = MockPlatform::with_behavior("telegram", MockBehavior::FailTransiently(1));
        let w = worker(&f, vec![flaky.clone()]);

        let receipt = submit(&f, &["telegram"]).await;
        let job_id = receipt.jobs[0].job_id.clone();

        w.run_once().await.unwrap();
        let record = f.db.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Queued);
        assert!(record.last_error.unwrap().contains("mock network failure"));
        assert_eq!(f.staging.locks(&receipt.root_post_id).await.unwrap().len(), 1);

        w.run_once().await.unwrap();
        assert_eq!(status_of(&f, &job_id).await, JobStatus::Posted);
        assert_eq!(flaky.call_count(), 2);
        assert!(f.staging.locks(&receipt.root_post_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retries_are_bounded_by_max_attempts() {
        let f = fixture().await;
        let down =
            MockPlatform::with_behavior("telegram", MockBehavior::AlwaysTransient("down".into()));
        let w = worker(&f, vec![down.clone()]).with_settings(fast_settings(2));

        let receipt = submit(&f, &["telegram"]).await;
        let job_id = receipt.jobs[0].job_id.clone();

        w.run_once().await.unwrap();
        assert_eq!(status_of(&f, &job_id).await, JobStatus::Queued);

        w.run_once().await.unwrap();
        let record = f.db.get_job(&job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Faulted);
        assert_eq!(record.attempts, 2);
        assert_eq!(down.call_count(), 2);
        assert_eq!(f.queue.len().await.unwrap(), 0);
        assert!(f.staging.locks(&receipt.root_post_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_permanent_failure_faults_immediately() {
        let f = fixture().await;
        let broken = MockPlatform::permanent_failure("telegram", "rejected");
        let w = worker(&f, vec![broken.clone()]);

        let receipt = submit(&f, &["telegram"]).await;
        w.run_once().await.unwrap();

        let record = f.db.get_job(&receipt.jobs[0].job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Faulted);
        assert!(record.last_error.unwrap().contains("rejected"));
        assert_eq!(broken.call_count(), 1);
        assert!(f.staging.locks(&receipt.root_post_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partial_delivery_records_failed_parts() {
        let f = fixture().await;
        let failed = vec![PartFailure {
            part: "media:0".into(),
            error: "too large".into(),
        }];
        let partial =
            MockPlatform::with_behavior("telegram", MockBehavior::Partial(failed.clone()));
        let w = worker(&f, vec![partial]);

        let receipt = submit(&f, &["telegram"]).await;
        w.run_once().await.unwrap();

        let record = f.db.get_job(&receipt.jobs[0].job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::SomeFaults);
        assert_eq!(record.failed_parts, failed);
        assert!(record.platform_post_id.is_some());
    }

    #[tokio::test]
    async fn test_unknown_target_faults_job() {
        let f = fixture().await;
        let w = worker(&f, vec![]);

        let receipt = submit(&f, &["nowhere"]).await;
        w.run_once().await.unwrap();

        let record = f.db.get_job(&receipt.jobs[0].job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Faulted);
        assert!(record.last_error.unwrap().contains("no delivery platform"));
    }

    #[tokio::test]
    async fn test_missing_bundle_faults_job() {
        let f = fixture().await;
        let telegram = MockPlatform::success("telegram");
        let w = worker(&f, vec![telegram.clone()]);

        let receipt = submit(&f, &["telegram"]).await;
        for key in f.store.list("post/").await.unwrap() {
            if !key.contains("/lock-") {
                f.store.delete(&key).await.unwrap();
            }
        }

        w.run_once().await.unwrap();
        let record = f.db.get_job(&receipt.jobs[0].job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Faulted);
        assert_eq!(telegram.call_count(), 0);
    }

    #[tokio::test]
    async fn test_rate_limited_job_waits_for_next_window() {
        let f = fixture().await;
        let telegram = MockPlatform::success("telegram");
        let limits = HashMap::from([("telegram".to_string(), 1)]);
        let w = worker(&f, vec![telegram.clone()]).with_rate_limiter(RateLimiter::new(limits));

        submit(&f, &["telegram"]).await;
        w.run_once().await.unwrap();
        assert_eq!(telegram.call_count(), 1);

        let second = submit(&f, &["telegram"]).await;
        w.run_once().await.unwrap();

        assert_eq!(telegram.call_count(), 1);
        assert_eq!(status_of(&f, &second.jobs[0].job_id).await, JobStatus::Queued);
        assert_eq!(f.queue.len().await.unwrap(), 1);
    }

    #[test]
    fn test_lease_outlasts_visibility_and_delivery_deadline() {
        assert_eq!(lease_deadline(10_000, Duration::from_secs(1)), 11);
        assert_eq!(lease_deadline(10_999, Duration::from_secs(1)), 12);
        assert_eq!(delivery_deadline(Duration::from_secs(300)), Duration::from_secs(240));
        assert!(delivery_deadline(Duration::from_secs(1)) < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_slow_delivery_is_faulted_before_lease_expires() {
        let f = fixture().await;
        let slow = MockPlatform::with_delay("telegram", Duration::from_millis(3500));
        let w = worker(&f, vec![slow.clone()]).with_settings(WorkerSettings {
            visibility_timeout: Duration::from_secs(1),
            delivery_timeout: delivery_deadline(Duration::from_secs(1)),
            ..fast_settings(3)
        });

        let receipt = submit(&f, &["telegram"]).await;

        // A second poll once the first dequeue's visibility has run out
        let (first, second) = tokio::join!(w.run_once(), async {
            tokio::time::sleep(Duration::from_millis(2200)).await;
            w.run_once().await
        });
        assert_eq!(first.unwrap(), 1);
        assert_eq!(second.unwrap(), 0);

        assert_eq!(slow.call_count(), 1);
        let record = f.db.get_job(&receipt.jobs[0].job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Faulted);
        assert!(record.last_error.unwrap().contains("timed out"));
        assert!(f.staging.locks(&receipt.root_post_id).await.unwrap().is_empty());
        assert_eq!(f.queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unparseable_message_is_dropped() {
        let f = fixture().await;
        let w = worker(&f, vec![]);

        f.queue.enqueue("not json", Duration::ZERO).await.unwrap();
        let message = f
            .queue
            .dequeue(1, Duration::from_secs(30))
            .await
            .unwrap()
            .pop()
            .unwrap();

        assert!(matches!(
            w.handle(&message).await.unwrap(),
            HandleOutcome::Dropped(_)
        ));
        assert_eq!(f.queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_platform_session_is_persisted() {
        let f = fixture().await;
        let telegram = MockPlatform::success("telegram").recording_sessions();
        let w = worker(&f, vec![telegram.clone()]);

        let receipt = submit(&f, &["telegram"]).await;
        w.run_once().await.unwrap();

        let stored = f
            .store
            .get(&SessionRegistry::storage_key(&telegram.session_key()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, format!("{}\n", receipt.jobs[0].job_id).into_bytes());
    }

    #[tokio::test]
    async fn test_maintenance_collects_finished_bundles_only() {
        let f = fixture().await;
        let w = worker(&f, vec![MockPlatform::success("telegram")]);

        let done = submit(&f, &["telegram"]).await;
        w.run_once().await.unwrap();
        let pending = submit(&f, &["discord"]).await;

        f.db.record_webhook_message("twitch", "old", 0).await.unwrap();

        let limiter = RateLimiter::default();
        let report = run_maintenance(&f.db, &f.staging, &limiter, Duration::from_secs(3600))
            .await
            .unwrap();

        assert_eq!(report.bundles.collected, 1);
        assert_eq!(report.bundles.locked, 1);
        assert_eq!(report.ledger_rows, 1);
        assert_eq!(
            f.staging.collect(&done.root_post_id).await.unwrap(),
            CollectOutcome::Missing
        );
        assert!(f.staging.load(&pending.root_post_id).await.unwrap().is_some());
    }
}
