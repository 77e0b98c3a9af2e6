//! Generic outbound HTTP delivery
//!
//! POSTs `{job, content, attempt}` as JSON to a configured URL. A 2xx
//! response may carry a [`DeliveryReport`] body (`platformPostId`,
//! `failedParts`); an empty 2xx body counts as full success. A 2xx body that
//! is not a report is recorded as a failed `response` part.
//!
//! Status mapping: 408, 429 and 5xx are transient; 401/403 are
//! authentication failures; other 4xx are permanent. A request that hits the
//! client timeout may already have been posted, so it is permanent too.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{PlatformError, Result};
use crate::platforms::{DeliveryContext, DeliveryPlatform};
use crate::types::{DeliveryJob, DeliveryReport, PartFailure, PostContent};

#[derive(Serialize)]
struct HookPayload<'a> {
    job: &'a DeliveryJob,
    content: &'a PostContent,
    attempt: u32,
}

pub struct HttpPlatform {
    id: String,
    url: String,
    client: reqwest::Client,
}

impl HttpPlatform {
    pub fn new(id: &str, url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("crosspost/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PlatformError::Network(format!("failed to build http client: {}", e)))?;

        Ok(Self {
            id: id.to_string(),
            url: url.to_string(),
            client,
        })
    }
}

/// Map a non-success status to a platform error
pub fn classify_status(status: StatusCode, body: &str) -> PlatformError {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body.chars().take(200).collect::<String>())
    };

    match status {
        StatusCode::TOO_MANY_REQUESTS => PlatformError::RateLimit(detail),
        StatusCode::REQUEST_TIMEOUT => PlatformError::Network(detail),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PlatformError::Authentication(detail),
        s if s.is_server_error() => PlatformError::Network(detail),
        _ => PlatformError::Posting(detail),
    }
}

#[async_trait]
impl DeliveryPlatform for HttpPlatform {
    fn id(&self) -> &str {
        &self.id
    }

    async fn deliver(&self, ctx: &DeliveryContext) -> Result<DeliveryReport> {
        let payload = HookPayload {
            job: &ctx.job,
            content: &ctx.content,
            attempt: ctx.attempt,
        };

        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PlatformError::Posting(format!("{} request timed out: {}", self.id, e))
                } else {
                    PlatformError::Network(format!("{} request failed: {}", self.id, e))
                }
            })?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(classify_status(status, &body).into());
        }

        debug!(platform = %self.id, job_id = %ctx.job.job_id, %status, "hook accepted delivery");
        Ok(parse_report(&self.id, &body))
    }
}

/// Read the report from a 2xx body.
pub fn parse_report(platform: &str, body: &str) -> DeliveryReport {
    if body.trim().is_empty() {
        return DeliveryReport::default();
    }

    match serde_json::from_str::<DeliveryReport>(body) {
        Ok(report) => report,
        Err(e) => {
            warn!(platform = %platform, error = %e, "hook returned an unreadable delivery report");
            DeliveryReport {
                platform_post_id: None,
                failed_parts: vec![PartFailure {
                    part: "response".to_string(),
                    error: format!("unreadable delivery report: {}", e),
                }],
            }
        }
    }
}
