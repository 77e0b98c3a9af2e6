//! Job fan-out
//!
//! Turns one post request into one staged content bundle and one queued
//! delivery job per target. Order of effects:
//!
//! 1. validate the request, then the caller's API key
//! 2. write a lock marker per target, then the content bundle
//! 3. per target: insert the `Queued` job record, enqueue the job
//!
//! Locks go down before content so a concurrent sweep never sees an unlocked
//! bundle that is still being submitted. A target whose enqueue fails gets its
//! lock removed and its record faulted; other targets are unaffected.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::auth;
use crate::db::{Database, JobCompletion};
use crate::error::{CrosspostError, Result};
use crate::queue::{enqueue_json, MessageQueue};
use crate::staging::ContentStaging;
use crate::types::{
    is_path_safe_id, new_id, DeliveryJob, JobRecord, JobStatus, PostContent, PostRequest,
    SubmitReceipt, TargetOutcome,
};

#[derive(Clone)]
pub struct Producer {
    db: Database,
    staging: ContentStaging,
    queue: Arc<dyn MessageQueue>,
}

/// Reject requests that cannot produce any delivery.
pub fn validate_submission(targets: &[String], content: &PostContent) -> Result<()> {
    if targets.is_empty() {
        return Err(CrosspostError::InvalidInput(
            "at least one target platform is required".to_string(),
        ));
    }

    let mut seen = HashSet::new();
    for target in targets {
        if !is_path_safe_id(target) {
            return Err(CrosspostError::InvalidInput(format!(
                "invalid target platform id '{}'",
                target
            )));
        }
        if !seen.insert(target.as_str()) {
            return Err(CrosspostError::InvalidInput(format!(
                "duplicate target platform id '{}'",
                target
            )));
        }
    }

    if content.is_empty() {
        return Err(CrosspostError::InvalidInput(
            "post has no content".to_string(),
        ));
    }

    Ok(())
}

/// Delay before a job scheduled for `post_at` may be delivered. Past times are due now.
pub fn visibility_delay(post_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
    post_at
        .and_then(|at| (at - now).to_std().ok())
        .unwrap_or(Duration::ZERO)
}

impl Producer {
    pub fn new(db: Database, staging: ContentStaging, queue: Arc<dyn MessageQueue>) -> Self {
        Self { db, staging, queue }
    }

    /// Authenticate and fan out a client request.
    pub async fn submit(&self, request: &PostRequest) -> Result<SubmitReceipt> {
        auth::authenticate(&self.db, &request.api_key).await?;
        let content = request.content();
        validate_submission(&request.target_platforms, &content)?;

        self.fan_out(
            &request.api_key.user_id,
            &request.target_platforms,
            &content,
            request.post_at,
        )
        .await
    }

    /// Fan out on behalf of an already-resolved user (synthetic requests).
    pub async fn submit_for_user(
        &self,
        user_id: &str,
        targets: &[String],
        content: &PostContent,
        post_at: Option<DateTime<Utc>>,
    ) -> Result<SubmitReceipt> {
        validate_submission(targets, content)?;
        if user_id.is_empty() {
            return Err(CrosspostError::InvalidInput("user id is required".to_string()));
        }
        self.fan_out(user_id, targets, content, post_at).await
    }

    async fn fan_out(
        &self,
        user_id: &str,
        targets: &[String],
        content: &PostContent,
        post_at: Option<DateTime<Utc>>,
    ) -> Result<SubmitReceipt> {
        let root_post_id = new_id();
        let jobs: Vec<DeliveryJob> = targets
            .iter()
            .map(|target| DeliveryJob {
                root_post_id: root_post_id.clone(),
                job_id: new_id(),
                user_id: user_id.to_string(),
                target_platform_id: target.clone(),
                post_at,
                status: JobStatus::Queued,
                media: content.media.clone(),
            })
            .collect();

        if let Err(e) = self.stage(&root_post_id, &jobs, content).await {
            self.release_locks(&root_post_id, &jobs).await;
            return Err(e);
        }

        let now = Utc::now();
        let delay = visibility_delay(post_at, now);
        let mut outcomes = Vec::with_capacity(jobs.len());

        for job in &jobs {
            let outcome = match self.enqueue_job(job, now.timestamp(), delay).await {
                Ok(()) => TargetOutcome {
                    target_platform_id: job.target_platform_id.clone(),
                    job_id: job.job_id.clone(),
                    enqueued: true,
                    error: None,
                },
                Err(e) => {
                    warn!(
                        root_post_id = %root_post_id,
                        job_id = %job.job_id,
                        target = %job.target_platform_id,
                        error = %e,
                        "failed to enqueue delivery job"
                    );
                    self.abandon(job, &e).await;
                    TargetOutcome {
                        target_platform_id: job.target_platform_id.clone(),
                        job_id: job.job_id.clone(),
                        enqueued: false,
                        error: Some(e.to_string()),
                    }
                }
            };
            outcomes.push(outcome);
        }

        let receipt = SubmitReceipt {
            root_post_id,
            jobs: outcomes,
        };

        if receipt.enqueued_count() == 0 {
            return Err(CrosspostError::Queue(format!(
                "no delivery job could be enqueued for post {}",
                receipt.root_post_id
            )));
        }

        info!(
            root_post_id = %receipt.root_post_id,
            user_id = %user_id,
            targets = receipt.jobs.len(),
            enqueued = receipt.enqueued_count(),
            delay_secs = delay.as_secs(),
            "submitted post"
        );
        Ok(receipt)
    }

    async fn stage(
        &self,
        root_post_id: &str,
        jobs: &[DeliveryJob],
        content: &PostContent,
    ) -> Result<()> {
        for job in jobs {
            self.staging
                .create_lock(root_post_id, &job.target_platform_id, &job.job_id)
                .await?;
        }
        self.staging.stage(root_post_id, content).await
    }

    async fn release_locks(&self, root_post_id: &str, jobs: &[DeliveryJob]) {
        for job in jobs {
            if let Err(e) = self
                .staging
                .remove_lock(root_post_id, &job.target_platform_id)
                .await
            {
                warn!(root_post_id = %root_post_id, error = %e, "failed to release lock");
            }
        }
    }

    async fn enqueue_job(&self, job: &DeliveryJob, now: i64, delay: Duration) -> Result<()> {
        self.db.insert_job(&JobRecord::queued(job, now)).await?;
        enqueue_json(self.queue.as_ref(), job, delay).await?;
        Ok(())
    }

    /// Undo a target that could not be enqueued so the bundle stays collectable.
    async fn abandon(&self, job: &DeliveryJob, error: &CrosspostError) {
        let completion = JobCompletion::faulted(format!("enqueue failed: {}", error));
        if let Err(e) = self
            .db
            .finish_job(&job.job_id, &completion, Utc::now().timestamp())
            .await
        {
            warn!(job_id = %job.job_id, error = %e, "failed to fault unenqueued job");
        }
        if let Err(e) = self
            .staging
            .remove_lock(&job.root_post_id, &job.target_platform_id)
            .await
        {
            warn!(job_id = %job.job_id, error = %e, "failed to release lock of unenqueued job");
        }
    }
}
