//! Delivery platforms
//!
//! The pipeline does not know how to talk to any particular service. A target
//! platform id resolves to a [`DeliveryPlatform`], which receives the job, the
//! staged content and the session registry, and reports what happened.
//!
//! Errors returned from [`DeliveryPlatform::deliver`] are classified by
//! [`PlatformError::is_transient`](crate::error::PlatformError::is_transient):
//! network and rate-limit errors are retried through queue redelivery,
//! everything else faults the job.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, PlatformKind};
use crate::error::{ConfigError, Result};
use crate::secrets::SecretStore;
use crate::session::SessionRegistry;
use crate::types::{DeliveryJob, DeliveryReport, PostContent};

pub mod http;
pub mod mock;

/// Everything a platform needs for one delivery attempt.
#[derive(Clone)]
pub struct DeliveryContext {
    pub job: DeliveryJob,
    pub content: PostContent,
    pub sessions: Arc<SessionRegistry>,
    /// 1 for the first delivery of the message
    pub attempt: u32,
}

#[async_trait]
pub trait DeliveryPlatform: Send + Sync {
    /// Target platform id this capability serves
    fn id(&self) -> &str;

    /// Deliver the job. `Ok` with failed parts means partial delivery.
    async fn deliver(&self, ctx: &DeliveryContext) -> Result<DeliveryReport>;
}

/// Target platform id -> delivery capability
#[derive(Default, Clone)]
pub struct PlatformRegistry {
    platforms: HashMap<String, Arc<dyn DeliveryPlatform>>,
}

impl PlatformRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, platform: Arc<dyn DeliveryPlatform>) {
        self.platforms.insert(platform.id().to_string(), platform);
    }

    pub fn with(mut self, platform: Arc<dyn DeliveryPlatform>) -> Self {
        self.register(platform);
        self
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn DeliveryPlatform>> {
        self.platforms.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.platforms.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.platforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.platforms.is_empty()
    }

    /// Build the registry from `[[platforms]]`, resolving hook URLs from the secret store.
    pub async fn from_config(config: &Config, secrets: &dyn SecretStore) -> Result<Self> {
        let mut registry = Self::new();

        for platform in &config.platforms {
            match platform.kind {
                PlatformKind::Mock => {
                    registry.register(Arc::new(mock::MockPlatform::success(&platform.id)));
                }
                PlatformKind::Http => {
                    let secret_name = platform.url_secret.as_deref().ok_or_else(|| {
                        ConfigError::MissingField(format!("platforms[{}].url_secret", platform.id))
                    })?;
                    let url = secrets.get_secret(secret_name).await?.ok_or_else(|| {
                        ConfigError::MissingField(format!("secret '{}'", secret_name))
                    })?;
                    let http = http::HttpPlatform::new(
                        &platform.id,
                        url.expose_secret(),
                        Duration::from_secs(platform.timeout_secs),
                    )?;
                    registry.register(Arc::new(http));
                }
            }
            tracing::debug!(
                platform = %platform.id,
                kind = ?platform.kind,
                "registered delivery platform"
            );
        }

        Ok(registry)
    }
}
