//! Twitch EventSub callbacks
//!
//! Twitch signs `message_id || timestamp || body` with HMAC-SHA256 and sends
//! the result as `sha256=<hex>` in `Twitch-Eventsub-Message-Signature`.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use tracing::{info, warn};

use crate::types::TriggerEvent;
use crate::webhook::WebhookError;

type HmacSha256 = Hmac<Sha256>;

pub const SOURCE: &str = "twitch";

pub const MESSAGE_ID: &str = "twitch-eventsub-message-id";
pub const MESSAGE_TIMESTAMP: &str = "twitch-eventsub-message-timestamp";
pub const MESSAGE_SIGNATURE: &str = "twitch-eventsub-message-signature";
pub const MESSAGE_TYPE: &str = "twitch-eventsub-message-type";

pub const TYPE_NOTIFICATION: &str = "notification";
pub const TYPE_VERIFICATION: &str = "webhook_callback_verification";
pub const TYPE_REVOCATION: &str = "revocation";

/// The four EventSub headers every callback carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSubHeaders {
    pub message_id: String,
    pub timestamp: String,
    pub signature: String,
    pub message_type: String,
}

impl EventSubHeaders {
    pub fn from_headers(headers: &HeaderMap) -> Result<Self, WebhookError> {
        Ok(Self {
            message_id: header(headers, MESSAGE_ID)?,
            timestamp: header(headers, MESSAGE_TIMESTAMP)?,
            signature: header(headers, MESSAGE_SIGNATURE)?,
            message_type: header(headers, MESSAGE_TYPE)?.to_ascii_lowercase(),
        })
    }
}

fn header(headers: &HeaderMap, name: &str) -> Result<String, WebhookError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| WebhookError::BadRequest(format!("missing header {}", name)))
}

pub fn compute_signature(secret: &[u8], message_id: &str, timestamp: &str, body: &[u8]) -> Vec<u8> {
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        // HMAC accepts keys of any length
        Err(_) => return Vec::new(),
    };
    mac.update(message_id.as_bytes());
    mac.update(timestamp.as_bytes());
    mac.update(body);
    mac.finalize().into_bytes().to_vec()
}

pub fn format_signature_header(signature: &[u8]) -> String {
    format!("sha256={}", hex::encode(signature))
}

/// Constant-time check of a `sha256=<hex>` header.
pub fn verify_signature(
    secret: &[u8],
    message_id: &str,
    timestamp: &str,
    body: &[u8],
    signature_header: &str,
) -> bool {
    let Some(expected) = signature_header
        .strip_prefix("sha256=")
        .and_then(|h| hex::decode(h).ok())
    else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(message_id.as_bytes());
    mac.update(timestamp.as_bytes());
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Reject timestamps older than `max_age_secs` relative to `now`.
pub fn check_freshness(
    timestamp: &str,
    now: DateTime<Utc>,
    max_age_secs: i64,
) -> Result<DateTime<Utc>, WebhookError> {
    let sent = DateTime::parse_from_rfc3339(timestamp)
        .map_err(|e| WebhookError::BadRequest(format!("invalid message timestamp: {}", e)))?
        .with_timezone(&Utc);

    if (now - sent).num_seconds() > max_age_secs {
        return Err(WebhookError::Unauthorized(format!(
            "message timestamp {} is older than {} seconds",
            timestamp, max_age_secs
        )));
    }
    Ok(sent)
}

#[derive(Debug, Deserialize)]
struct Subscription {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    subscription: Subscription,
    #[serde(default)]
    challenge: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Notification<E> {
    event: E,
}

#[derive(Debug, Deserialize)]
struct StreamOnline {
    broadcaster_user_id: String,
    broadcaster_user_login: String,
    #[serde(default)]
    broadcaster_user_name: String,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct ChannelUpdate {
    broadcaster_user_id: String,
    broadcaster_user_login: String,
    #[serde(default)]
    broadcaster_user_name: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    category_name: Option<String>,
}

/// What a verified callback asks of us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callback {
    Challenge(String),
    Revoked { subscription: String, reason: String },
    /// A notification; `None` for event types that never trigger posts
    Notification(Option<TriggerEvent>),
    Unknown(String),
}

fn parse<T: DeserializeOwned>(body: &[u8]) -> Result<T, WebhookError> {
    serde_json::from_slice(body)
        .map_err(|e| WebhookError::BadRequest(format!("invalid EventSub payload: {}", e)))
}

fn display_name(name: String, login: &str) -> String {
    if name.is_empty() {
        login.to_string()
    } else {
        name
    }
}

fn channel_url(login: &str) -> String {
    format!("https://twitch.tv/{}", login)
}

/// Interpret an authenticated callback body.
pub fn parse_callback(
    headers: &EventSubHeaders,
    sent_at: DateTime<Utc>,
    body: &[u8],
) -> Result<Callback, WebhookError> {
    match headers.message_type.as_str() {
        TYPE_VERIFICATION => {
            let envelope: Envelope = parse(body)?;
            let challenge = envelope.challenge.ok_or_else(|| {
                WebhookError::BadRequest("verification without challenge".to_string())
            })?;
            info!(subscription = %envelope.subscription.kind, "answering EventSub verification");
            Ok(Callback::Challenge(challenge))
        }
        TYPE_REVOCATION => {
            let envelope: Envelope = parse(body)?;
            let reason = envelope.subscription.status.unwrap_or_default();
            warn!(
                subscription = %envelope.subscription.kind,
                reason = %reason,
                "EventSub subscription revoked"
            );
            Ok(Callback::Revoked {
                subscription: envelope.subscription.kind,
                reason,
            })
        }
        TYPE_NOTIFICATION => {
            let envelope: Envelope = parse(body)?;
            let event = match envelope.subscription.kind.as_str() {
                "stream.online" => {
                    let event = parse::<Notification<StreamOnline>>(body)?.event;
                    Some(TriggerEvent {
                        source: SOURCE.to_string(),
                        message_id: headers.message_id.clone(),
                        external_account_type: SOURCE.to_string(),
                        external_account_id: event.broadcaster_user_id,
                        account_name: display_name(
                            event.broadcaster_user_name,
                            &event.broadcaster_user_login,
                        ),
                        kind: envelope.subscription.kind.clone(),
                        title: None,
                        category: None,
                        url: Some(channel_url(&event.broadcaster_user_login)),
                        occurred_at: event.started_at,
                    })
                }
                "channel.update" => {
                    let event = parse::<Notification<ChannelUpdate>>(body)?.event;
                    Some(TriggerEvent {
                        source: SOURCE.to_string(),
                        message_id: headers.message_id.clone(),
                        external_account_type: SOURCE.to_string(),
                        external_account_id: event.broadcaster_user_id,
                        account_name: display_name(
                            event.broadcaster_user_name,
                            &event.broadcaster_user_login,
                        ),
                        kind: envelope.subscription.kind.clone(),
                        title: event.title,
                        category: event.category_name,
                        url: Some(channel_url(&event.broadcaster_user_login)),
                        occurred_at: sent_at,
                    })
                }
                _ => None,
            };
            Ok(Callback::Notification(event))
        }
        other => Ok(Callback::Unknown(other.to_string())),
    }
}
