//! Core types for crosspost

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generate a path-safe identifier (dash-less UUID v4)
pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Ids that become part of storage paths: non-empty, no `/`, `\`, `..` or whitespace.
pub fn is_path_safe_id(id: &str) -> bool {
    !id.is_empty()
        && !id.contains("..")
        && !id.chars().any(|c| c == '/' || c == '\\' || c.is_whitespace() || c.is_control())
}

// ============================================================================
// Inbound post requests
// ============================================================================

/// Caller credential carried in a post request.
///
/// Older clients send `{UserID, ID, APIKey}`; both spellings are accepted.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyRef {
    #[serde(alias = "UserID", alias = "userID")]
    pub user_id: String,
    #[serde(alias = "ID", alias = "id")]
    pub key_id: String,
    #[serde(rename = "apiKey", alias = "APIKey", default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl std::fmt::Debug for ApiKeyRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyRef")
            .field("user_id", &self.user_id)
            .field("key_id", &self.key_id)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Shared content of a post, identical for every target.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostContent {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub html_description: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub media: Vec<String>,
}

impl PostContent {
    /// True when there is nothing to deliver.
    pub fn is_empty(&self) -> bool {
        self.title.trim().is_empty()
            && self.description.trim().is_empty()
            && self.html_description.trim().is_empty()
            && self.media.is_empty()
    }
}

/// Body of `POST /post`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostRequest {
    #[serde(alias = "APIKey")]
    pub api_key: ApiKeyRef,
    #[serde(alias = "TargetPlatforms", default)]
    pub target_platforms: Vec<String>,
    #[serde(alias = "Media", default)]
    pub media: Vec<String>,
    #[serde(alias = "Title", default)]
    pub title: String,
    #[serde(alias = "Description", default)]
    pub description: String,
    #[serde(alias = "HTMLDescription", default)]
    pub html_description: String,
    #[serde(alias = "Tags", default)]
    pub tags: Vec<String>,
    #[serde(alias = "PostAt", default, skip_serializing_if = "Option::is_none")]
    pub post_at: Option<DateTime<Utc>>,
}

impl PostRequest {
    pub fn content(&self) -> PostContent {
        PostContent {
            title: self.title.clone(),
            description: self.description.clone(),
            html_description: self.html_description.clone(),
            tags: self.tags.clone(),
            media: self.media.clone(),
        }
    }
}

// ============================================================================
// Delivery jobs
// ============================================================================

/// Delivery job lifecycle. Serialized as its integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum JobStatus {
    Queued,
    Posting,
    Posted,
    Faulted,
    SomeFaults,
}

impl JobStatus {
    pub fn code(self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Posting => 1,
            JobStatus::Posted => 2,
            JobStatus::Faulted => 3,
            JobStatus::SomeFaults => 4,
        }
    }

    /// Posted, Faulted and SomeFaults never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Posted | JobStatus::Faulted | JobStatus::SomeFaults
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Posting => "posting",
            JobStatus::Posted => "posted",
            JobStatus::Faulted => "faulted",
            JobStatus::SomeFaults => "some_faults",
        }
    }
}

impl From<JobStatus> for u8 {
    fn from(status: JobStatus) -> Self {
        status.code()
    }
}

impl TryFrom<u8> for JobStatus {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(JobStatus::Queued),
            1 => Ok(JobStatus::Posting),
            2 => Ok(JobStatus::Posted),
            3 => Ok(JobStatus::Faulted),
            4 => Ok(JobStatus::SomeFaults),
            other => Err(format!("unknown job status code {}", other)),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "queued" => Ok(JobStatus::Queued),
            "posting" => Ok(JobStatus::Posting),
            "posted" => Ok(JobStatus::Posted),
            "faulted" => Ok(JobStatus::Faulted),
            "some_faults" | "somefaults" => Ok(JobStatus::SomeFaults),
            other => Err(format!(
                "unknown job status '{}' \
                 (expected queued, posting, posted, faulted or some_faults)",
                other
            )),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue payload for one target of one post.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryJob {
    pub root_post_id: String,
    #[serde(rename = "postId")]
    pub job_id: String,
    #[serde(rename = "user")]
    pub user_id: String,
    #[serde(rename = "targetPlatformServiceId")]
    pub target_platform_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    #[serde(default)]
    pub media: Vec<String>,
}

/// A part of a delivery that the platform could not complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartFailure {
    pub part: String,
    pub error: String,
}

/// What a platform reports back after a delivery call that did not error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReport {
    #[serde(default)]
    pub platform_post_id: Option<String>,
    #[serde(default)]
    pub failed_parts: Vec<PartFailure>,
}

impl DeliveryReport {
    pub fn posted(platform_post_id: impl Into<String>) -> Self {
        Self {
            platform_post_id: Some(platform_post_id.into()),
            failed_parts: Vec::new(),
        }
    }

    pub fn status(&self) -> JobStatus {
        if self.failed_parts.is_empty() {
            JobStatus::Posted
        } else {
            JobStatus::SomeFaults
        }
    }
}

/// Durable status row of a delivery job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub job_id: String,
    pub root_post_id: String,
    pub user_id: String,
    pub target_platform_id: String,
    pub post_at: Option<i64>,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub failed_parts: Vec<PartFailure>,
    pub platform_post_id: Option<String>,
    pub lease_until: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl JobRecord {
    /// A fresh `Queued` record for `job`.
    pub fn queued(job: &DeliveryJob, now: i64) -> Self {
        Self {
            job_id: job.job_id.clone(),
            root_post_id: job.root_post_id.clone(),
            user_id: job.user_id.clone(),
            target_platform_id: job.target_platform_id.clone(),
            post_at: job.post_at.map(|t| t.timestamp()),
            status: JobStatus::Queued,
            attempts: 0,
            last_error: None,
            failed_parts: Vec::new(),
            platform_post_id: None,
            lease_until: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Per-target outcome of a submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetOutcome {
    pub target_platform_id: String,
    pub job_id: String,
    pub enqueued: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a submission: one bundle, one job per target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitReceipt {
    pub root_post_id: String,
    pub jobs: Vec<TargetOutcome>,
}

impl SubmitReceipt {
    pub fn enqueued_count(&self) -> usize {
        self.jobs.iter().filter(|j| j.enqueued).count()
    }
}

// ============================================================================
// Registry records
// ============================================================================

/// Listing view of an API key; the token itself is never read back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyRecord {
    pub user_id: String,
    pub key_id: String,
    pub created_at: i64,
}

/// Returned exactly once, when a key is generated.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedApiKey {
    pub user_id: String,
    pub key_id: String,
    pub token: String,
}

impl std::fmt::Debug for GeneratedApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeneratedApiKey")
            .field("user_id", &self.user_id)
            .field("key_id", &self.key_id)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalTriggerRecord {
    pub user_id: String,
    pub trigger_id: String,
    pub external_account_id: String,
    pub external_account_type: String,
    pub post_template_id: String,
    pub target_platform_id: String,
    pub notify_frequency_hours: u32,
    pub last_notified_at: Option<i64>,
    pub created_at: i64,
}

impl ExternalTriggerRecord {
    /// Earliest time the trigger may notify again.
    pub fn next_allowed_at(&self) -> Option<i64> {
        self.last_notified_at
            .map(|last| last + i64::from(self.notify_frequency_hours) * 3600)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PostTemplateRecord {
    pub user_id: String,
    pub template_id: String,
    pub title: String,
    pub body: String,
    pub updated_at: i64,
}

/// Something happened on an external account; carried on the trigger queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerEvent {
    /// Webhook provider that reported the event
    pub source: String,
    pub message_id: String,
    pub external_account_type: String,
    pub external_account_id: String,
    /// Display name of the account, when known
    #[serde(default)]
    pub account_name: String,
    pub kind: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    pub occurred_at: DateTime<Utc>,
}
