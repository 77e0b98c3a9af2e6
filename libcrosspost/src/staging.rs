//! Content staging
//!
//! A submitted post's shared content is written once under
//! `post/{rootPostId}/` and read by every delivery job derived from it:
//!
//! | key                  | value                   |
//! |----------------------|-------------------------|
//! | `title`              | UTF-8 text              |
//! | `description`        | UTF-8 text              |
//! | `description-html`   | UTF-8 text              |
//! | `tags`               | JSON array of strings   |
//! | `media`              | JSON array of strings   |
//! | `lock-{target}`      | job id holding the lock |
//!
//! Each target holds a lock marker until its job is terminal. A bundle is only
//! collected once no lock marker remains.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{CrosspostError, Result};
use crate::storage::ObjectStore;
use crate::types::{is_path_safe_id, PostContent};

const POST_PREFIX: &str = "post/";
const LOCK_PREFIX: &str = "lock-";

const TITLE: &str = "title";
const DESCRIPTION: &str = "description";
const DESCRIPTION_HTML: &str = "description-html";
const TAGS: &str = "tags";
const MEDIA: &str = "media";

/// Outcome of collecting one bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectOutcome {
    /// Blobs deleted
    Collected(usize),
    /// Lock markers still present; nothing deleted
    Locked(usize),
    /// No blobs under this root
    Missing,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub collected: usize,
    pub locked: usize,
}

#[derive(Clone)]
pub struct ContentStaging {
    store: Arc<dyn ObjectStore>,
}

impl ContentStaging {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    fn key(root_post_id: &str, name: &str) -> String {
        format!("{}{}/{}", POST_PREFIX, root_post_id, name)
    }

    fn lock_key(root_post_id: &str, target: &str) -> String {
        Self::key(root_post_id, &format!("{}{}", LOCK_PREFIX, target))
    }

    fn check_root(root_post_id: &str) -> Result<()> {
        if is_path_safe_id(root_post_id) {
            Ok(())
        } else {
            Err(CrosspostError::InvalidInput(format!(
                "invalid root post id '{}'",
                root_post_id
            )))
        }
    }

    /// Write every part of `content` under `root_post_id`.
    pub async fn stage(&self, root_post_id: &str, content: &PostContent) -> Result<()> {
        Self::check_root(root_post_id)?;

        let parts: [(&str, Vec<u8>); 5] = [
            (TITLE, content.title.clone().into_bytes()),
            (DESCRIPTION, content.description.clone().into_bytes()),
            (DESCRIPTION_HTML, content.html_description.clone().into_bytes()),
            (TAGS, serde_json::to_vec(&content.tags)?),
            (MEDIA, serde_json::to_vec(&content.media)?),
        ];

        for (name, data) in parts {
            self.store.put(&Self::key(root_post_id, name), data).await?;
        }

        debug!(root_post_id = %root_post_id, "staged content bundle");
        Ok(())
    }

    /// Read a staged bundle back. `None` when nothing was staged under the id.
    pub async fn load(&self, root_post_id: &str) -> Result<Option<PostContent>> {
        Self::check_root(root_post_id)?;

        let title = self.get_text(root_post_id, TITLE).await?;
        let description = self.get_text(root_post_id, DESCRIPTION).await?;
        let html_description = self.get_text(root_post_id, DESCRIPTION_HTML).await?;
        let tags = self.get_list(root_post_id, TAGS).await?;
        let media = self.get_list(root_post_id, MEDIA).await?;

        if title.is_none()
            && description.is_none()
            && html_description.is_none()
            && tags.is_none()
            && media.is_none()
        {
            return Ok(None);
        }

        Ok(Some(PostContent {
            title: title.unwrap_or_default(),
            description: description.unwrap_or_default(),
            html_description: html_description.unwrap_or_default(),
            tags: tags.unwrap_or_default(),
            media: media.unwrap_or_default(),
        }))
    }

    async fn get_text(&self, root_post_id: &str, name: &str) -> Result<Option<String>> {
        Ok(self
            .store
            .get(&Self::key(root_post_id, name))
            .await?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    async fn get_list(&self, root_post_id: &str, name: &str) -> Result<Option<Vec<String>>> {
        match self.store.get(&Self::key(root_post_id, name)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Mark `target` as still needing the bundle.
    pub async fn create_lock(&self, root_post_id: &str, target: &str, job_id: &str) -> Result<()> {
        Self::check_root(root_post_id)?;
        self.store
            .put(
                &Self::lock_key(root_post_id, target),
                job_id.as_bytes().to_vec(),
            )
            .await
    }

    /// Release `target`'s lock. Idempotent.
    pub async fn remove_lock(&self, root_post_id: &str, target: &str) -> Result<bool> {
        Self::check_root(root_post_id)?;
        self.store
            .delete(&Self::lock_key(root_post_id, target))
            .await
    }

    /// Targets currently holding a lock on the bundle.
    pub async fn locks(&self, root_post_id: &str) -> Result<Vec<String>> {
        Self::check_root(root_post_id)?;
        let lock_prefix = Self::key(root_post_id, LOCK_PREFIX);
        Ok(self
            .store
            .list(&lock_prefix)
            .await?
            .into_iter()
            .filter_map(|k| k.strip_prefix(&lock_prefix).map(str::to_string))
            .collect())
    }

    /// Delete every blob of the bundle, unless a lock marker exists.
    pub async fn collect(&self, root_post_id: &str) -> Result<CollectOutcome> {
        Self::check_root(root_post_id)?;
        let prefix = format!("{}{}/", POST_PREFIX, root_post_id);
        let keys = self.store.list(&prefix).await?;

        if keys.is_empty() {
            return Ok(CollectOutcome::Missing);
        }

        let lock_prefix = format!("{}{}", prefix, LOCK_PREFIX);
        let locked = keys.iter().filter(|k| k.starts_with(&lock_prefix)).count();
        if locked > 0 {
            return Ok(CollectOutcome::Locked(locked));
        }

        let mut deleted = 0;
        for key in &keys {
            if self.store.delete(key).await? {
                deleted += 1;
            }
        }

        info!(root_post_id = %root_post_id, blobs = deleted, "collected content bundle");
        Ok(CollectOutcome::Collected(deleted))
    }

    /// All root post ids with at least one blob in the store.
    pub async fn bundles(&self) -> Result<Vec<String>> {
        let roots: BTreeSet<String> = self
            .store
            .list(POST_PREFIX)
            .await?
            .into_iter()
            .filter_map(|k| {
                k.strip_prefix(POST_PREFIX)
                    .and_then(|rest| rest.split('/').next())
                    .map(str::to_string)
            })
            .collect();
        Ok(roots.into_iter().collect())
    }

    /// Collect every bundle whose jobs are all terminal.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        for root in self.bundles().await? {
            match self.collect(&root).await {
                Ok(CollectOutcome::Collected(_)) => report.collected += 1,
                Ok(CollectOutcome::Locked(_)) => report.locked += 1,
                Ok(CollectOutcome::Missing) => {}
                Err(e) => warn!(root_post_id = %root, error = %e, "failed to collect bundle"),
            }
        }

        Ok(report)
    }
}
