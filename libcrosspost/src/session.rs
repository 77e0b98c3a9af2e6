//! Per-account session buffers
//!
//! Platform integrations keep opaque state (login sessions, cursors) between
//! deliveries. Each session key maps to one byte buffer stored at
//! `session/{key}`. The [`SessionRegistry`] hands out at most one live
//! [`SessionHandle`] per key: concurrent opens of the same key share one load,
//! opens of different keys proceed independently.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

use crate::error::Result;
use crate::storage::ObjectStore;

const SESSION_PREFIX: &str = "session/";

type Slot = Arc<OnceCell<Arc<SessionHandle>>>;

pub struct SessionRegistry {
    store: Arc<dyn ObjectStore>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn ObjectStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            slots: Mutex::new(HashMap::new()),
        })
    }

    pub fn storage_key(session_key: &str) -> String {
        format!("{}{}", SESSION_PREFIX, session_key)
    }

    /// Return the live handle for `session_key`, loading it on first use.
    ///
    /// The map lock is only held to find or create the slot; the load itself
    /// runs outside it. A failed load leaves the slot empty so the next open
    /// retries.
    pub async fn open(self: &Arc<Self>, session_key: &str) -> Result<Arc<SessionHandle>> {
        let storage_key = Self::storage_key(session_key);
        crate::storage::validate_key(&storage_key)?;

        let slot = {
            let mut slots = self.slots.lock().await;
            slots
                .entry(session_key.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let handle = slot
            .get_or_try_init(|| async {
                let data = self.store.get(&storage_key).await?.unwrap_or_default();
                debug!(session_key = %session_key, bytes = data.len(), "loaded session");
                Ok::<_, crate::error::CrosspostError>(Arc::new(SessionHandle {
                    key: session_key.to_string(),
                    storage_key: storage_key.clone(),
                    store: self.store.clone(),
                    buffer: Mutex::new(data),
                    registry: Arc::downgrade(self),
                }))
            })
            .await?;

        Ok(handle.clone())
    }

    /// Flush and drop the live handle for `session_key`, if any.
    ///
    /// A session that is still loading is left registered; its opener gets
    /// the one live handle.
    pub async fn close(&self, session_key: &str) -> Result<()> {
        let Some(slot) = self.slots.lock().await.get(session_key).cloned() else {
            return Ok(());
        };
        let Some(handle) = slot.get() else {
            debug!(session_key = %session_key, "session still loading, not closing");
            return Ok(());
        };
        handle.flush().await?;
        self.evict(session_key, &slot).await;
        Ok(())
    }

    /// Remove the map entry, but only if it is still `expected`.
    async fn evict(&self, session_key: &str, expected: &Slot) {
        let mut slots = self.slots.lock().await;
        if slots
            .get(session_key)
            .is_some_and(|current| Arc::ptr_eq(current, expected))
        {
            slots.remove(session_key);
        }
    }

    /// Flush every live buffer. Used on shutdown.
    pub async fn flush_all(&self) -> Result<usize> {
        let handles: Vec<Arc<SessionHandle>> = self
            .slots
            .lock()
            .await
            .values()
            .filter_map(|slot| slot.get().cloned())
            .collect();

        for handle in &handles {
            handle.flush().await?;
        }
        Ok(handles.len())
    }

    /// Number of live buffers.
    pub async fn live_count(&self) -> usize {
        self.slots
            .lock()
            .await
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }
}

/// In-memory view of one session. Reads and writes never touch storage;
/// only [`flush`](SessionHandle::flush) and [`close`](SessionHandle::close) do.
pub struct SessionHandle {
    key: String,
    storage_key: String,
    store: Arc<dyn ObjectStore>,
    buffer: Mutex<Vec<u8>>,
    registry: Weak<SessionRegistry>,
}

impl SessionHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn contents(&self) -> Vec<u8> {
        self.buffer.lock().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.buffer.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.buffer.lock().await.is_empty()
    }

    pub async fn set_contents(&self, data: Vec<u8>) {
        *self.buffer.lock().await = data;
    }

    pub async fn append(&self, data: &[u8]) {
        self.buffer.lock().await.extend_from_slice(data);
    }

    /// Overwrite the stored value with the whole buffer. Empty buffers are not written.
    pub async fn flush(&self) -> Result<()> {
        let data = self.buffer.lock().await.clone();
        if data.is_empty() {
            return Ok(());
        }
        self.store.put(&self.storage_key, data).await?;
        debug!(session_key = %self.key, "flushed session");
        Ok(())
    }

    /// Flush, then release the registry entry so the next open reloads.
    pub async fn close(&self) -> Result<()> {
        match self.registry.upgrade() {
            Some(registry) => registry.close(&self.key).await,
            None => self.flush().await,
        }
    }
}
