//! Mock delivery platform
//!
//! Simulates successes, partial deliveries, transient and permanent failures
//! and latency. Clones share their counters, so a test can keep one clone and
//! register another with the worker.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

use crate::error::{PlatformError, Result};
use crate::platforms::{DeliveryContext, DeliveryPlatform};
use crate::types::{DeliveryReport, PartFailure};

/// What the mock does when asked to deliver
#[derive(Debug, Clone)]
pub enum MockBehavior {
    Succeed,
    /// Succeed, but report these parts as failed
    Partial(Vec<PartFailure>),
    /// Fail with a network error the first `n` calls, then succeed
    FailTransiently(usize),
    /// Always fail with a network error
    AlwaysTransient(String),
    /// Always fail with a permanent posting error
    Permanent(String),
}

#[derive(Debug, Clone)]
pub struct MockConfig {
    pub id: String,
    pub behavior: MockBehavior,
    /// Simulated network latency
    pub delay: Duration,
    /// Append each delivered job id to the `mock/{id}` session
    pub record_in_session: bool,
    pub call_count: Arc<AtomicUsize>,
    /// Job ids delivered successfully
    pub delivered: Arc<Mutex<Vec<String>>>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            id: "mock".to_string(),
            behavior: MockBehavior::Succeed,
            delay: Duration::ZERO,
            record_in_session: false,
            call_count: Arc::new(AtomicUsize::new(0)),
            delivered: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MockPlatform {
    config: MockConfig,
}

impl MockPlatform {
    pub fn new(config: MockConfig) -> Self {
        Self { config }
    }

    /// A platform that accepts every delivery
    pub fn success(id: &str) -> Self {
        Self::with_behavior(id, MockBehavior::Succeed)
    }

    pub fn with_behavior(id: &str, behavior: MockBehavior) -> Self {
        Self::new(MockConfig {
            id: id.to_string(),
            behavior,
            ..Default::default()
        })
    }

    pub fn permanent_failure(id: &str, error: &str) -> Self {
        Self::with_behavior(id, MockBehavior::Permanent(error.to_string()))
    }

    pub fn with_delay(id: &str, delay: Duration) -> Self {
        Self::new(MockConfig {
            id: id.to_string(),
            delay,
            ..Default::default()
        })
    }

    pub fn recording_sessions(mut self) -> Self {
        self.config.record_in_session = true;
        self
    }

    /// Session key the mock writes to when recording
    pub fn session_key(&self) -> String {
        format!("mock/{}", self.config.id)
    }

    pub fn call_count(&self) -> usize {
        self.config.call_count.load(Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<String> {
        self.config
            .delivered
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    fn remember(&self, job_id: &str) {
        if let Ok(mut delivered) = self.config.delivered.lock() {
            delivered.push(job_id.to_string());
        }
    }
}

#[async_trait]
impl DeliveryPlatform for MockPlatform {
    fn id(&self) -> &str {
        &self.config.id
    }

    async fn deliver(&self, ctx: &DeliveryContext) -> Result<DeliveryReport> {
        let call = self.config.call_count.fetch_add(1, Ordering::SeqCst) + 1;

        if !self.config.delay.is_zero() {
            sleep(self.config.delay).await;
        }

        let report = match &self.config.behavior {
            MockBehavior::Succeed => {
                DeliveryReport::posted(format!("{}:{}", self.config.id, ctx.job.job_id))
            }
            MockBehavior::Partial(failed) => DeliveryReport {
                platform_post_id: Some(format!("{}:{}", self.config.id, ctx.job.job_id)),
                failed_parts: failed.clone(),
            },
            MockBehavior::FailTransiently(n) if call <= *n => {
                return Err(PlatformError::Network(format!(
                    "mock network failure {} of {}",
                    call, n
                ))
                .into());
            }
            MockBehavior::FailTransiently(_) => {
                DeliveryReport::posted(format!("{}:{}", self.config.id, ctx.job.job_id))
            }
            MockBehavior::AlwaysTransient(message) => {
                return Err(PlatformError::Network(message.clone()).into());
            }
            MockBehavior::Permanent(message) => {
                return Err(PlatformError::Posting(message.clone()).into());
            }
        };

        if self.config.record_in_session {
            let session = ctx.sessions.open(&self.session_key()).await?;
            session.append(ctx.job.job_id.as_bytes()).await;
            session.append(b"\n").await;
            session.flush().await?;
        }

        self.remember(&ctx.job.job_id);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionRegistry;
    use crate::storage::MemoryObjectStore;
    use crate::types::{DeliveryJob, JobStatus, PostContent};

    fn context(job_id: &str) -> DeliveryContext {
        DeliveryContext {
            job: DeliveryJob {
                root_post_id: "root".into(),
                job_id: job_id.into(),
                user_id: "user".into(),
                target_platform_id: "mock".into(),
                post_at: None,
                status: JobStatus::Posting,
                media: vec![],
            },
            content: PostContent::default(),
            sessions: SessionRegistry::new(Arc::new(MemoryObjectStore::new())),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn test_mock_success() {
        let platform = MockPlatform::success("telegram");
        let observer = platform.clone();

        let report = platform.deliver(&context("j1")).await.unwrap();
        assert_eq!(report.platform_post_id.as_deref(), Some("telegram:j1"));
        assert_eq!(observer.call_count(), 1);
        assert_eq!(observer.delivered(), vec!["j1"]);
    }

    #[tokio::test]
    async fn test_mock_partial() {
        let platform = MockPlatform::with_behavior(
            "discord",
            MockBehavior::Partial(vec![PartFailure {
                part: "media:0".into(),
                error: "unsupported".into(),
            }]),
        );
        let report = platform.deliver(&context("j1")).await.unwrap();
        assert_eq!(report.status(), JobStatus::SomeFaults);
    }

    #[tokio::test]
    async fn test_mock_fails_transiently_then_succeeds() {
        let platform = MockPlatform::with_behavior("x", MockBehavior::FailTransiently(2));

        for _ in 0..2 {
            let err = platform.deliver(&context("j1")).await.unwrap_err();
            assert!(err.is_transient());
        }
        assert!(platform.deliver(&context("j1")).await.is_ok());
        assert_eq!(platform.call_count(), 3);
        assert_eq!(platform.delivered().len(), 1);
    }

    #[tokio::test]
    async fn test_mock_permanent_failure() {
        let platform = MockPlatform::permanent_failure("x", "rejected");
        let err = platform.deliver(&context("j1")).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("rejected"));
        assert!(platform.delivered().is_empty());
    }

    #[tokio::test]
    async fn test_mock_with_delay() {
        let platform = MockPlatform::with_delay("x", Duration::from_millis(50));
        let start = std::time::Instant::now();
        platform.deliver(&context("j1")).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_mock_records_in_session() {
        let platform = MockPlatform::success("tg").recording_sessions();
        let ctx = context("j1");
        platform.deliver(&ctx).await.unwrap();
        platform.deliver(&context_with(&ctx, "j2")).await.unwrap();

        let session = ctx.sessions.open("mock/tg").await.unwrap();
        assert_eq!(session.contents().await, b"j1\nj2\n".to_vec());
    }

    fn context_with(base: &DeliveryContext, job_id: &str) -> DeliveryContext {
        let mut ctx = base.clone();
        ctx.job.job_id = job_id.to_string();
        ctx
    }
}
