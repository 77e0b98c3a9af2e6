//! Service facade
//!
//! `CrosspostService` opens the shared resources named by a [`Config`]
//! (database, object store, queues, secret store) once and hands out the
//! components built on them. The API server, the worker daemon and the admin
//! CLI all start from here.
//!
//! # Example
//!
//! ```no_run
//! use libcrosspost::service::CrosspostService;
//!
//! # async fn example() -> libcrosspost::Result<()> {
//! let service = CrosspostService::new().await?;
//! let worker = service.delivery_worker().await?;
//! worker.run_once().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use crate::platforms::PlatformRegistry;
use crate::producer::Producer;
use crate::queue::{MessageQueue, SqliteQueue};
use crate::rate_limiter::RateLimiter;
use crate::secrets::{EnvSecretStore, SecretStore};
use crate::session::SessionRegistry;
use crate::staging::ContentStaging;
use crate::storage::{FsObjectStore, ObjectStore};
use crate::triggers::{TriggerProcessor, TriggerRegistry};
use crate::webhook::WebhookIngestor;
use crate::worker::{
    ledger_retention, run_maintenance, DeliveryWorker, MaintenanceReport, WorkerSettings,
};
use crate::{Config, Database, Result};

#[derive(Clone)]
pub struct CrosspostService {
    config: Arc<Config>,
    db: Database,
    store: Arc<dyn ObjectStore>,
    staging: ContentStaging,
    sessions: Arc<SessionRegistry>,
    deliveries: Arc<dyn MessageQueue>,
    triggers: Arc<dyn MessageQueue>,
    secrets: Arc<dyn SecretStore>,
}

impl CrosspostService {
    /// Load configuration from the default location and open everything it names.
    pub async fn new() -> Result<Self> {
        let config = Config::load()?;
        Self::from_config(config).await
    }

    /// Open resources for `config`. Secrets come from the environment.
    pub async fn from_config(config: Config) -> Result<Self> {
        let secrets: Arc<dyn SecretStore> =
            Arc::new(EnvSecretStore::new(config.secrets.env_prefix.clone()));
        let store: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(&config.storage.root).await?);
        let db = Database::new(&config.database.path).await?;
        Ok(Self::from_parts(config, db, store, secrets))
    }

    /// Assemble a service from already-open resources.
    pub fn from_parts(
        config: Config,
        db: Database,
        store: Arc<dyn ObjectStore>,
        secrets: Arc<dyn SecretStore>,
    ) -> Self {
        let staging = ContentStaging::new(store.clone());
        let sessions = SessionRegistry::new(store.clone());
        let deliveries: Arc<dyn MessageQueue> = Arc::new(SqliteQueue::delivery(db.clone()));
        let triggers: Arc<dyn MessageQueue> = Arc::new(SqliteQueue::triggers(db.clone()));

        Self {
            config: Arc::new(config),
            db,
            store,
            staging,
            sessions,
            deliveries,
            triggers,
            secrets,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    pub fn staging(&self) -> &ContentStaging {
        &self.staging
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn delivery_queue(&self) -> &Arc<dyn MessageQueue> {
        &self.deliveries
    }

    pub fn trigger_queue(&self) -> &Arc<dyn MessageQueue> {
        &self.triggers
    }

    pub fn producer(&self) -> Producer {
        Producer::new(self.db.clone(), self.staging.clone(), self.deliveries.clone())
    }

    pub fn trigger_registry(&self) -> TriggerRegistry {
        TriggerRegistry::new(self.db.clone())
    }

    pub fn webhooks(&self) -> WebhookIngestor {
        WebhookIngestor::new(
            self.db.clone(),
            self.triggers.clone(),
            self.secrets.clone(),
            self.config.webhooks.clone(),
        )
    }

    pub fn rate_limiter(&self) -> RateLimiter {
        RateLimiter::new(self.config.rate_limits.clone())
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings::from_config(&self.config.queue)
    }

    /// Delivery worker with the platforms from configuration.
    ///
    /// Fails if a platform's URL secret is missing.
    pub async fn delivery_worker(&self) -> Result<DeliveryWorker> {
        let platforms = PlatformRegistry::from_config(&self.config, self.secrets.as_ref()).await?;
        Ok(self.delivery_worker_with(platforms))
    }

    pub fn delivery_worker_with(&self, platforms: PlatformRegistry) -> DeliveryWorker {
        DeliveryWorker::new(
            self.db.clone(),
            self.staging.clone(),
            self.deliveries.clone(),
            Arc::new(platforms),
            self.sessions.clone(),
        )
        .with_settings(self.worker_settings())
        .with_rate_limiter(self.rate_limiter())
    }

    pub fn trigger_processor(&self) -> TriggerProcessor {
        TriggerProcessor::new(self.db.clone(), self.triggers.clone(), self.producer())
            .with_settings(self.worker_settings())
    }

    /// One maintenance pass with the configured ledger retention.
    pub async fn maintain(&self) -> Result<MaintenanceReport> {
        self.maintain_with_retention(ledger_retention(&self.config)).await
    }

    pub async fn maintain_with_retention(
        &self,
        retention: std::time::Duration,
    ) -> Result<MaintenanceReport> {
        run_maintenance(&self.db, &self.staging, &self.rate_limiter(), retention).await
    }
}
