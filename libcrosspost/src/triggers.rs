//! External triggers
//!
//! Users register interest in an external account ("post to discord using
//! template T when twitch account X goes live"). The [`TriggerProcessor`]
//! consumes trigger events produced by webhooks and submits one synthetic
//! post per matching trigger.
//!
//! An event is retried when some of its submissions fail. Every trigger that
//! fired for a webhook message is recorded, so a retry only fires the rest.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::error::{CrosspostError, Result};
use crate::producer::Producer;
use crate::queue::{MessageQueue, QueueMessage};
use crate::types::{
    is_path_safe_id, new_id, ExternalTriggerRecord, PostContent, PostTemplateRecord, TriggerEvent,
};
use crate::worker::WorkerSettings;

/// Fields a user supplies when registering a trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTrigger {
    pub user_id: String,
    pub external_account_type: String,
    pub external_account_id: String,
    pub post_template_id: String,
    pub target_platform_id: String,
    pub notify_frequency_hours: u32,
}

#[derive(Clone)]
pub struct TriggerRegistry {
    db: Database,
}

impl TriggerRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn register(&self, trigger: NewTrigger) -> Result<ExternalTriggerRecord> {
        if trigger.user_id.is_empty()
            || trigger.external_account_type.is_empty()
            || trigger.external_account_id.is_empty()
            || trigger.post_template_id.is_empty()
        {
            return Err(CrosspostError::InvalidInput(
                "user, account type, account id and template are required".to_string(),
            ));
        }
        if !is_path_safe_id(&trigger.target_platform_id) {
            return Err(CrosspostError::InvalidInput(format!(
                "invalid target platform id '{}'",
                trigger.target_platform_id
            )));
        }

        let record = ExternalTriggerRecord {
            user_id: trigger.user_id,
            trigger_id: new_id(),
            external_account_id: trigger.external_account_id,
            external_account_type: trigger.external_account_type.to_ascii_lowercase(),
            post_template_id: trigger.post_template_id,
            target_platform_id: trigger.target_platform_id,
            notify_frequency_hours: trigger.notify_frequency_hours,
            last_notified_at: None,
            created_at: Utc::now().timestamp(),
        };
        self.db.insert_trigger(&record).await?;

        info!(
            user_id = %record.user_id,
            trigger_id = %record.trigger_id,
            account = %record.external_account_id,
            "registered trigger"
        );
        Ok(record)
    }

    /// Returns whether the trigger existed.
    pub async fn remove(&self, user_id: &str, trigger_id: &str) -> Result<bool> {
        self.db.delete_trigger(user_id, trigger_id).await
    }

    pub async fn list(&self, user_id: &str) -> Result<Vec<ExternalTriggerRecord>> {
        self.db.list_triggers(user_id).await
    }

    pub async fn interested_users(
        &self,
        account_type: &str,
        account_id: &str,
    ) -> Result<Vec<String>> {
        self.db
            .interested_users(&account_type.to_ascii_lowercase(), account_id)
            .await
    }

    pub async fn set_template(
        &self,
        user_id: &str,
        template_id: &str,
        title: &str,
        body: &str,
    ) -> Result<()> {
        if user_id.is_empty() || template_id.is_empty() {
            return Err(CrosspostError::InvalidInput(
                "user and template id are required".to_string(),
            ));
        }
        self.db
            .upsert_template(user_id, template_id, title, body, Utc::now().timestamp())
            .await
    }

    pub async fn template(
        &self,
        user_id: &str,
        template_id: &str,
    ) -> Result<Option<PostTemplateRecord>> {
        self.db.get_template(user_id, template_id).await
    }
}

/// Substitute `{{account}}`, `{{title}}`, `{{category}}`, `{{url}}` and `{{kind}}`.
pub fn render_template(template: &str, event: &TriggerEvent) -> String {
    let account = if event.account_name.is_empty() {
        event.external_account_id.as_str()
    } else {
        event.account_name.as_str()
    };

    template
        .replace("{{account}}", account)
        .replace("{{title}}", event.title.as_deref().unwrap_or_default())
        .replace("{{category}}", event.category.as_deref().unwrap_or_default())
        .replace("{{url}}", event.url.as_deref().unwrap_or_default())
        .replace("{{kind}}", &event.kind)
}

/// Outcome of one trigger event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerReport {
    pub submitted: usize,
    /// Triggers inside their notification gap
    pub throttled: usize,
    /// Triggers already fired by an earlier run of the same event
    pub already_fired: usize,
    /// Submissions that may succeed on retry
    pub failed: usize,
}

#[derive(Clone)]
pub struct TriggerProcessor {
    db: Database,
    queue: Arc<dyn MessageQueue>,
    producer: Producer,
    settings: WorkerSettings,
}

impl TriggerProcessor {
    pub fn new(db: Database, queue: Arc<dyn MessageQueue>, producer: Producer) -> Self {
        Self {
            db,
            queue,
            producer,
            settings: WorkerSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: WorkerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub async fn run_once(&self) -> Result<usize> {
        let messages = self
            .queue
            .dequeue(self.settings.batch_size, self.settings.visibility_timeout)
            .await?;

        let results = join_all(messages.iter().map(|m| self.handle(m))).await;
        for (message, result) in messages.iter().zip(results) {
            if let Err(e) = result {
                warn!(message_id = message.id, error = %e, "failed to handle trigger message");
            }
        }

        Ok(messages.len())
    }

    pub async fn handle(&self, message: &QueueMessage) -> Result<TriggerReport> {
        let event: TriggerEvent = match serde_json::from_str(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(message_id = message.id, error = %e, "dropping unparseable trigger message");
                self.queue.ack(message).await?;
                return Ok(TriggerReport::default());
            }
        };

        let report = self.process(&event).await?;

        if report.failed > 0 && message.dequeue_count < self.settings.max_attempts {
            let delay = self.settings.retry.retry_interval(message.dequeue_count);
            warn!(
                message_id = %event.message_id,
                failed = report.failed,
                retry_in_secs = delay.as_secs(),
                "trigger fan-out incomplete, retrying"
            );
            self.queue.defer(message, delay, true).await?;
        } else {
            self.queue.ack(message).await?;
        }

        Ok(report)
    }

    /// Submit one post per matching trigger of every interested user.
    pub async fn process(&self, event: &TriggerEvent) -> Result<TriggerReport> {
        let account_type = event.external_account_type.to_ascii_lowercase();
        let users = self
            .db
            .interested_users(&account_type, &event.external_account_id)
            .await?;

        let mut report = TriggerReport::default();
        for user in users {
            let triggers = self
                .db
                .triggers_for_account(&user, &account_type, &event.external_account_id)
                .await?;

            for trigger in triggers {
                let now = Utc::now().timestamp();
                if !self
                    .db
                    .record_trigger_notification(
                        &event.source,
                        &event.message_id,
                        &user,
                        &trigger.trigger_id,
                        now,
                    )
                    .await?
                {
                    debug!(trigger_id = %trigger.trigger_id, "trigger already fired for event");
                    report.already_fired += 1;
                    continue;
                }

                if !self
                    .db
                    .try_mark_trigger_notified(&user, &trigger.trigger_id, now)
                    .await?
                {
                    debug!(trigger_id = %trigger.trigger_id, "trigger notified recently, skipping");
                    self.forget_fired(event, &user, &trigger.trigger_id).await?;
                    report.throttled += 1;
                    continue;
                }

                match self.fire(&trigger, event).await {
                    Ok(()) => report.submitted += 1,
                    Err(e) => {
                        warn!(
                            user_id = %user,
                            trigger_id = %trigger.trigger_id,
                            error = %e,
                            "trigger submission failed"
                        );
                        self.db
                            .restore_trigger_notified(
                                &user,
                                &trigger.trigger_id,
                                now,
                                trigger.last_notified_at,
                            )
                            .await?;
                        self.forget_fired(event, &user, &trigger.trigger_id).await?;
                        let retryable = !matches!(
                            e,
                            CrosspostError::InvalidInput(_) | CrosspostError::NotFound(_)
                        );
                        if retryable {
                            report.failed += 1;
                        }
                    }
                }
            }
        }

        info!(
            source = %event.source,
            message_id = %event.message_id,
            submitted = report.submitted,
            throttled = report.throttled,
            already_fired = report.already_fired,
            failed = report.failed,
            "processed trigger event"
        );
        Ok(report)
    }

    async fn forget_fired(
        &self,
        event: &TriggerEvent,
        user_id: &str,
        trigger_id: &str,
    ) -> Result<()> {
        self.db
            .forget_trigger_notification(&event.source, &event.message_id, user_id, trigger_id)
            .await
    }

    async fn fire(&self, trigger: &ExternalTriggerRecord, event: &TriggerEvent) -> Result<()> {
        let template = self
            .db
            .get_template(&trigger.user_id, &trigger.post_template_id)
            .await?
            .ok_or_else(|| {
                CrosspostError::NotFound(format!("template {}", trigger.post_template_id))
            })?;

        let content = PostContent {
            title: render_template(&template.title, event),
            description: render_template(&template.body, event),
            ..Default::default()
        };

        self.producer
            .submit_for_user(
                &trigger.user_id,
                std::slice::from_ref(&trigger.target_platform_id),
                &content,
                None,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{enqueue_json, SqliteQueue};
    use crate::retry::RetryPolicy;
    use crate::staging::ContentStaging;
    use crate::storage::MemoryObjectStore;
    use crate::types::{DeliveryJob, JobStatus};
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        db: Database,
        registry: TriggerRegistry,
        triggers: Arc<SqliteQueue>,
        deliveries: Arc<SqliteQueue>,
        processor: TriggerProcessor,
    }

    async fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let db = Database::new(&temp.path().join("t.db").to_string_lossy())
            .await
            .unwrap();
        let deliveries = Arc::new(SqliteQueue::delivery(db.clone()));
        let triggers = Arc::new(SqliteQueue::triggers(db.clone()));
        let staging = ContentStaging::new(Arc::new(MemoryObjectStore::new()));
        let producer = Producer::new(db.clone(), staging, deliveries.clone());
        let processor = TriggerProcessor::new(db.clone(), triggers.clone(), producer);
        Fixture {
            _temp: temp,
            registry: TriggerRegistry::new(db.clone()),
            db,
            triggers,
            deliveries,
            processor,
        }
    }

    /// Delivery queue that refuses jobs for one target.
    struct RefusingQueue {
        inner: SqliteQueue,
        refused_target: String,
    }

    #[async_trait]
    impl MessageQueue for RefusingQueue {
        fn name(&self) -> &str {
            self.inner.name()
        }

        async fn enqueue(&self, payload: &str, delay: Duration) -> Result<i64> {
            let job: DeliveryJob = serde_json::from_str(payload)?;
            if job.target_platform_id == self.refused_target {
                return Err(CrosspostError::Queue("queue unavailable".into()));
            }
            self.inner.enqueue(payload, delay).await
        }

        async fn dequeue(&self, max: usize, visibility: Duration) -> Result<Vec<QueueMessage>> {
            self.inner.dequeue(max, visibility).await
        }

        async fn ack(&self, message: &QueueMessage) -> Result<bool> {
            self.inner.ack(message).await
        }

        async fn defer(&self, message: &QueueMessage, wait: Duration, count: bool) -> Result<bool> {
            self.inner.defer(message, wait, count).await
        }

        async fn len(&self) -> Result<u64> {
            self.inner.len().await
        }
    }

    fn event(message_id: &str) -> TriggerEvent {
        TriggerEvent {
            source: "twitch".into(),
            message_id: message_id.into(),
            external_account_type: "twitch".into(),
            external_account_id: "1337".into(),
            account_name: "Cooler_User".into(),
            kind: "stream.online".into(),
            title: None,
            category: None,
            url: Some("https://twitch.tv/cooler_user".into()),
            occurred_at: Utc::now(),
        }
    }

    fn new_trigger(user: &str, target: &str, hours: u32) -> NewTrigger {
        NewTrigger {
            user_id: user.into(),
            external_account_type: "Twitch".into(),
            external_account_id: "1337".into(),
            post_template_id: "live".into(),
            target_platform_id: target.into(),
            notify_frequency_hours: hours,
        }
    }

    #[test]
    fn test_render_template() {
        let mut e = event("m");
        e.title = Some("Speedruns".into());
        let rendered = render_template("{{account}} is live: {{title}} {{category}}{{url}}", &e);
        assert_eq!(rendered, "Cooler_User is live: Speedruns https://twitch.tv/cooler_user");

        e.account_name.clear();
        assert_eq!(render_template("{{account}}", &e), "1337");
    }

    #[tokio::test]
    async fn test_registry_round_trip() {
        let f = fixture().await;
        let record = f.registry.register(new_trigger("alice", "discord", 1)).await.unwrap();
        assert_eq!(record.external_account_type, "twitch");

        assert_eq!(f.registry.list("alice").await.unwrap().len(), 1);
        assert_eq!(
            f.registry.interested_users("TWITCH", "1337").await.unwrap(),
            vec!["alice".to_string()]
        );

        assert!(f.registry.remove("alice", &record.trigger_id).await.unwrap());
        assert!(!f.registry.remove("alice", &record.trigger_id).await.unwrap());
        assert!(f.registry.interested_users("twitch", "1337").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_register_rejects_bad_target() {
        let f = fixture().await;
        let err = f
            .registry
            .register(new_trigger("alice", "../etc", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, CrosspostError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_event_submits_post_per_trigger() {
        let f = fixture().await;
        f.registry.register(new_trigger("alice", "discord", 1)).await.unwrap();
        f.registry.register(new_trigger("bob", "telegram", 1)).await.unwrap();
        f.registry
            .set_template("alice", "live", "", "{{account}} is live at {{url}}")
            .await
            .unwrap();
        f.registry.set_template("bob", "live", "Live!", "{{account}}").await.unwrap();

        enqueue_json(f.triggers.as_ref(), &event("m1"), Duration::ZERO).await.unwrap();
        assert_eq!(f.processor.run_once().await.unwrap(), 1);

        assert_eq!(f.triggers.len().await.unwrap(), 0);
        assert_eq!(f.deliveries.len().await.unwrap(), 2);

        let alice_jobs = f.db.list_jobs(Some("alice"), Some(JobStatus::Queued), 10).await.unwrap();
        assert_eq!(alice_jobs.len(), 1);
        assert_eq!(alice_jobs[0].target_platform_id, "discord");
    }

    #[tokio::test]
    async fn test_notify_frequency_throttles_second_event() {
        let f = fixture().await;
        f.registry.register(new_trigger("alice", "discord", 6)).await.unwrap();
        f.registry.set_template("alice", "live", "", "{{account}} is live").await.unwrap();

        let first = f.processor.process(&event("m1")).await.unwrap();
        let second = f.processor.process(&event("m2")).await.unwrap();

        assert_eq!(first.submitted, 1);
        assert_eq!(second.submitted, 0);
        assert_eq!(second.throttled, 1);
        assert_eq!(f.deliveries.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_missing_template_restores_notify_stamp() {
        let f = fixture().await;
        let record = f.registry.register(new_trigger("alice", "discord", 6)).await.unwrap();

        let report = f.processor.process(&event("m1")).await.unwrap();
        assert_eq!(report, TriggerReport::default());

        let trigger = f.db.get_trigger("alice", &record.trigger_id).await.unwrap().unwrap();
        assert_eq!(trigger.last_notified_at, None);
        assert_eq!(f.deliveries.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_uninterested_account_is_ignored() {
        let f = fixture().await;
        let mut e = event("m1");
        e.external_account_id = "nobody".into();

        let report = f.processor.process(&e).await.unwrap();
        assert_eq!(report, TriggerReport::default());
    }

    #[tokio::test]
    async fn test_same_event_fires_trigger_once() {
        let f = fixture().await;
        f.registry.register(new_trigger("alice", "discord", 0)).await.unwrap();
        f.registry.set_template("alice", "live", "", "{{account}} is live").await.unwrap();

        let first = f.processor.process(&event("m1")).await.unwrap();
        let second = f.processor.process(&event("m1")).await.unwrap();

        assert_eq!(first.submitted, 1);
        assert_eq!(second.submitted, 0);
        assert_eq!(second.already_fired, 1);
        assert_eq!(f.deliveries.len().await.unwrap(), 1);

        // A different message from the same account still fires.
        let third = f.processor.process(&event("m2")).await.unwrap();
        assert_eq!(third.submitted, 1);
    }

    #[tokio::test]
    async fn test_retried_event_only_refires_failed_triggers() {
        let f = fixture().await;
        f.registry.register(new_trigger("alice", "telegram", 0)).await.unwrap();
        let bob = f.registry.register(new_trigger("bob", "discord", 0)).await.unwrap();
        f.registry.set_template("alice", "live", "", "{{account}} is live").await.unwrap();
        f.registry.set_template("bob", "live", "", "{{account}} is live").await.unwrap();

        let refusing = Arc::new(RefusingQueue {
            inner: SqliteQueue::delivery(f.db.clone()),
            refused_target: "discord".into(),
        });
        let staging = ContentStaging::new(Arc::new(MemoryObjectStore::new()));
        let producer = Producer::new(f.db.clone(), staging, refusing);
        let processor = TriggerProcessor::new(f.db.clone(), f.triggers.clone(), producer)
            .with_settings(WorkerSettings {
                visibility_timeout: Duration::from_secs(30),
                delivery_timeout: Duration::from_secs(20),
                max_attempts: 2,
                batch_size: 16,
                retry: RetryPolicy::new(1, Duration::ZERO),
            });

        enqueue_json(f.triggers.as_ref(), &event("m1"), Duration::ZERO).await.unwrap();
        assert_eq!(processor.run_once().await.unwrap(), 1);
        assert_eq!(f.triggers.len().await.unwrap(), 1);
        assert_eq!(processor.run_once().await.unwrap(), 1);
        assert_eq!(f.triggers.len().await.unwrap(), 0);

        let alice_jobs = f.db.list_jobs(Some("alice"), Some(JobStatus::Queued), 10).await.unwrap();
        assert_eq!(alice_jobs.len(), 1);
        assert_eq!(f.deliveries.len().await.unwrap(), 1);

        // Bob's failed trigger was attempted on both runs and left unstamped.
        let bob_jobs = f.db.list_jobs(Some("bob"), Some(JobStatus::Faulted), 10).await.unwrap();
        assert_eq!(bob_jobs.len(), 2);
        let bob = f.db.get_trigger("bob", &bob.trigger_id).await.unwrap().unwrap();
        assert_eq!(bob.last_notified_at, None);
    }
}
