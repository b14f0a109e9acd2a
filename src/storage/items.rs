//! Item store: one document per work item.
//!
//! Items are addressed by `(stage, partition, key)` and stored at
//! `stages/{stage}/{YYYY-MM-DD}/{key}.md`. Writing the same address again
//! replaces the previous document; listing never yields duplicates.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::NaiveDate;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};

use crate::error::{AppError, Result};
use crate::models::{StageId, WorkItem};
use crate::storage::BlobStore;

const STAGES_DIR: &str = "stages";
const QUARANTINE_DIR: &str = "quarantine";
const ITEM_EXT: &str = ".md";
const DATE_FORMAT: &str = "%Y-%m-%d";

/// Work item persistence on top of a blob store.
#[derive(Clone)]
pub struct ItemStore {
    blobs: Arc<dyn BlobStore>,
}

impl ItemStore {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self { blobs }
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    /// Prefix holding all items of one stage and partition.
    pub fn partition_prefix(stage: StageId, partition: NaiveDate) -> String {
        format!(
            "{STAGES_DIR}/{}/{}/",
            stage.dir_name(),
            partition.format(DATE_FORMAT)
        )
    }

    /// Storage path of one item.
    pub fn item_path(stage: StageId, partition: NaiveDate, key: &str) -> String {
        format!("{}{key}{ITEM_EXT}", Self::partition_prefix(stage, partition))
    }

    /// Keys must be usable as file names on every backend.
    pub fn validate_key(key: &str) -> Result<()> {
        let valid = !key.is_empty()
            && !key.starts_with('.')
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if valid {
            Ok(())
        } else {
            Err(AppError::validation(format!("Invalid item key '{key}'")))
        }
    }

    /// Persist an item, replacing any previous version at the same address.
    pub async fn write(&self, item: &WorkItem) -> Result<()> {
        let meta = &item.metadata;
        Self::validate_key(&meta.key)?;
        meta.validate(meta.stage).map_err(AppError::validation)?;

        let path = Self::item_path(meta.stage, meta.partition, &meta.key);
        let document = item.to_document()?;
        WorkItem::parse(&path, &document, meta.stage)
            .map_err(|e| AppError::validation(format!("unreadable document: {e}")))?;
        self.blobs.put(&path, document.as_bytes()).await?;
        log::debug!("Committed {}", self.blobs.location(&path));
        Ok(())
    }

    /// Read one item. `Ok(None)` means it was never committed.
    pub async fn read(
        &self,
        stage: StageId,
        partition: NaiveDate,
        key: &str,
    ) -> Result<Option<WorkItem>> {
        let path = Self::item_path(stage, partition, key);
        self.read_path(stage, path).await
    }

    async fn read_path(&self, stage: StageId, path: String) -> Result<Option<WorkItem>> {
        let Some(bytes) = self.blobs.get(&path).await? else {
            return Ok(None);
        };
        let text = String::from_utf8(bytes).map_err(|e| AppError::malformed(&path, e))?;
        let item = WorkItem::parse(&path, &text, stage)?;

        let expected = Self::item_path(stage, item.metadata.partition, &item.metadata.key);
        if expected != path {
            return Err(AppError::malformed(
                &path,
                format!("metadata addresses {expected}"),
            ));
        }
        Ok(Some(item))
    }

    /// Keys committed for a stage and partition, sorted.
    pub async fn list_keys(&self, stage: StageId, partition: NaiveDate) -> Result<Vec<String>> {
        let prefix = Self::partition_prefix(stage, partition);
        let keys = self
            .blobs
            .list(&prefix)
            .await?
            .into_iter()
            .filter_map(|path| {
                path.strip_prefix(&prefix)
                    .and_then(|name| name.strip_suffix(ITEM_EXT))
                    .filter(|name| !name.contains('/'))
                    .map(str::to_string)
            })
            .collect();
        Ok(keys)
    }

    /// Lazily enumerate the items committed for a stage and partition.
    ///
    /// Every call re-lists the backend. Malformed documents surface as
    /// `AppError::MalformedItem` entries so the caller can quarantine them
    /// and keep going.
    pub fn list(&self, stage: StageId, partition: NaiveDate) -> BoxStream<'_, Result<WorkItem>> {
        stream::once(async move { self.list_keys(stage, partition).await })
            .map_ok(|keys| stream::iter(keys.into_iter().map(Ok::<_, AppError>)))
            .try_flatten()
            .try_filter_map(move |key| self.read_path(stage, Self::item_path(stage, partition, &key)))
            .boxed()
    }

    /// Whether an item is committed at this address, without parsing it.
    pub async fn exists(&self, stage: StageId, partition: NaiveDate, key: &str) -> Result<bool> {
        Ok(self
            .blobs
            .get(&Self::item_path(stage, partition, key))
            .await?
            .is_some())
    }

    /// Delete one item. Returns `false` if it did not exist.
    pub async fn remove(&self, stage: StageId, partition: NaiveDate, key: &str) -> Result<bool> {
        self.blobs
            .delete(&Self::item_path(stage, partition, key))
            .await
    }

    /// Move a document that failed validation out of the stage directory.
    pub async fn quarantine(&self, path: &str) -> Result<Option<String>> {
        let Some(rest) = path.strip_prefix(&format!("{STAGES_DIR}/")) else {
            return Ok(None);
        };
        let Some(bytes) = self.blobs.get(path).await? else {
            return Ok(None);
        };

        let target = format!("{QUARANTINE_DIR}/{rest}");
        self.blobs.put(&target, &bytes).await?;
        self.blobs.delete(path).await?;
        log::warn!("Quarantined {} -> {}", path, self.blobs.location(&target));
        Ok(Some(target))
    }

    /// Partitions that hold at least one item for a stage, ascending.
    pub async fn partitions(&self, stage: StageId) -> Result<Vec<NaiveDate>> {
        let prefix = format!("{STAGES_DIR}/{}/", stage.dir_name());
        let dates: BTreeSet<NaiveDate> = self
            .blobs
            .list(&prefix)
            .await?
            .iter()
            .filter_map(|path| path.strip_prefix(&prefix)?.split('/').next())
            .filter_map(|dir| NaiveDate::parse_from_str(dir, DATE_FORMAT).ok())
            .collect();
        Ok(dates.into_iter().collect())
    }
}
