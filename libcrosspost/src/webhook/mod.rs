//! Inbound webhooks
//!
//! A provider callback is authenticated, deduplicated by `(provider,
//! message id)` in the ledger, and turned into a [`TriggerEvent`] on the
//! trigger queue. The HTTP response never waits for the fan-out.

pub mod twitch;

use chrono::Utc;
use reqwest::header::HeaderMap;
use secrecy::ExposeSecret;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::WebhooksConfig;
use crate::db::Database;
use crate::error::{ConfigError, CrosspostError};
use crate::queue::{enqueue_json, MessageQueue};
use crate::secrets::SecretStore;
use crate::types::TriggerEvent;

#[derive(Error, Debug)]
pub enum WebhookError {
    #[error("unauthorized webhook: {0}")]
    Unauthorized(String),

    #[error("bad webhook request: {0}")]
    BadRequest(String),

    #[error("unknown webhook provider: {0}")]
    UnknownProvider(String),

    #[error(transparent)]
    Internal(#[from] CrosspostError),
}

/// How an authenticated callback was acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookAck {
    /// Subscription verification; respond with this text
    Challenge(String),
    /// New notification; trigger event enqueued
    Queued,
    /// Message id already seen
    Duplicate,
    /// Authenticated but nothing to do
    Ignored(String),
}

#[derive(Clone)]
pub struct WebhookIngestor {
    db: Database,
    triggers: Arc<dyn MessageQueue>,
    secrets: Arc<dyn SecretStore>,
    config: WebhooksConfig,
}

impl WebhookIngestor {
    pub fn new(
        db: Database,
        triggers: Arc<dyn MessageQueue>,
        secrets: Arc<dyn SecretStore>,
        config: WebhooksConfig,
    ) -> Self {
        Self {
            db,
            triggers,
            secrets,
            config,
        }
    }

    pub async fn ingest(
        &self,
        provider: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<WebhookAck, WebhookError> {
        match provider {
            twitch::SOURCE => self.ingest_twitch(headers, body).await,
            other => Err(WebhookError::UnknownProvider(other.to_string())),
        }
    }

    async fn ingest_twitch(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<WebhookAck, WebhookError> {
        let headers = twitch::EventSubHeaders::from_headers(headers)?;

        let secret_name = &self.config.twitch.secret_name;
        let secret = self
            .secrets
            .get_secret(secret_name)
            .await?
            .ok_or_else(|| {
                CrosspostError::from(ConfigError::MissingField(format!("secret {}", secret_name)))
            })?;

        if !twitch::verify_signature(
            secret.expose_secret().as_bytes(),
            &headers.message_id,
            &headers.timestamp,
            body,
            &headers.signature,
        ) {
            warn!(message_id = %headers.message_id, "rejecting Twitch callback with bad signature");
            return Err(WebhookError::Unauthorized("signature mismatch".to_string()));
        }

        let sent_at = twitch::check_freshness(
            &headers.timestamp,
            Utc::now(),
            self.config.max_message_age_secs,
        )?;

        match twitch::parse_callback(&headers, sent_at, body)? {
            twitch::Callback::Challenge(challenge) => Ok(WebhookAck::Challenge(challenge)),
            twitch::Callback::Revoked { subscription, reason } => Ok(WebhookAck::Ignored(format!(
                "subscription {} revoked: {}",
                subscription, reason
            ))),
            twitch::Callback::Unknown(kind) => {
                debug!(message_type = %kind, "ignoring unknown EventSub message type");
                Ok(WebhookAck::Ignored(format!("message type {}", kind)))
            }
            twitch::Callback::Notification(event) => {
                self.accept_notification(twitch::SOURCE, &headers.message_id, event)
                    .await
            }
        }
    }

    /// Record the message id and enqueue its event, exactly once per id.
    async fn accept_notification(
        &self,
        source: &str,
        message_id: &str,
        event: Option<TriggerEvent>,
    ) -> Result<WebhookAck, WebhookError> {
        let now = Utc::now().timestamp();
        if !self.db.record_webhook_message(source, message_id, now).await? {
            debug!(source, message_id, "duplicate webhook message");
            return Ok(WebhookAck::Duplicate);
        }

        let Some(event) = event else {
            return Ok(WebhookAck::Ignored("event type does not trigger posts".to_string()));
        };

        if let Err(e) = enqueue_json(self.triggers.as_ref(), &event, Duration::ZERO).await {
            // Forget the id so the provider's redelivery is not mistaken for a duplicate.
            if let Err(forget) = self.db.forget_webhook_message(source, message_id).await {
                warn!(source, message_id, error = %forget, "failed to forget webhook message");
            }
            return Err(e.into());
        }

        info!(
            source,
            message_id,
            account = %event.external_account_id,
            kind = %event.kind,
            "queued trigger event"
        );
        Ok(WebhookAck::Queued)
    }
}
