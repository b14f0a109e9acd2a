//! Stage abstraction.
//!
//! A stage knows two things: how to discover work units for a partition,
//! and how to transform one unit into output. Everything else (skipping,
//! concurrency, timeouts, classification, persistence and registry
//! updates) belongs to the [`StageRunner`](super::StageRunner).

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use futures::StreamExt;

use crate::error::{AppError, ProcessError, Result};
use crate::models::{RawPost, StageDetails, StageId, WorkItem};
use crate::storage::ItemStore;

/// What a unit carries into `transform`.
#[derive(Debug, Clone)]
pub enum UnitInput {
    /// A post from the post source
    Post(Box<RawPost>),
    /// A link to fetch
    Link(String),
    /// A committed upstream item
    Item(Box<WorkItem>),
    /// All upstream items of a reporting window
    Window {
        start: NaiveDate,
        end: NaiveDate,
        items: Vec<WorkItem>,
    },
}

/// A discovered, not yet processed candidate for a stage.
#[derive(Debug, Clone)]
pub struct WorkUnit {
    /// Canonical dedup key
    pub identity: String,
    /// Item key the output is stored under
    pub key: String,
    /// Upstream references that produced this unit
    pub source_refs: Vec<String>,
    pub published_hint: Option<DateTime<Utc>>,
    pub input: UnitInput,
}

/// Successful result of a transform.
#[derive(Debug, Clone)]
pub struct StageOutput {
    pub details: StageDetails,
    pub body: String,
}

/// One phase of the pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    fn id(&self) -> StageId;

    /// Enumerate the work units for `partition`.
    async fn discover(&self, store: &ItemStore, partition: NaiveDate) -> Result<Vec<WorkUnit>>;

    /// Process one unit.
    async fn transform(&self, unit: &WorkUnit) -> std::result::Result<StageOutput, ProcessError>;

    /// Details recorded on an error item for `unit`.
    fn failure_details(&self, unit: &WorkUnit) -> StageDetails;
}

/// Committed upstream items of a partition.
#[derive(Debug, Default)]
pub struct UpstreamItems {
    pub items: Vec<WorkItem>,
    pub quarantined: usize,
}

/// Read the committed items of `stage` for `partition`, moving malformed
/// documents to quarantine. With `success_only`, error items are dropped.
pub async fn upstream_items(
    store: &ItemStore,
    stage: StageId,
    partition: NaiveDate,
    success_only: bool,
) -> Result<UpstreamItems> {
    let mut upstream = UpstreamItems::default();
    let mut stream = store.list(stage, partition);

    while let Some(result) = stream.next().await {
        match result {
            Ok(item) if success_only && !item.is_success() => {}
            Ok(item) => upstream.items.push(item),
            Err(AppError::MalformedItem { path, message }) => {
                log::warn!("Skipping malformed item {}: {}", path, message);
                store.quarantine(&path).await?;
                upstream.quarantined += 1;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(upstream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ArticleDetails, ErrorClass, ItemFailure, ItemMetadata, ItemStatus};
    use crate::storage::LocalBlobStore;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    fn fetched(key: &str, status: ItemStatus) -> WorkItem {
        let now = Utc::now();
        let error = (status == ItemStatus::Error).then(|| ItemFailure {
            class: ErrorClass::Permanent,
            kind: "http_404".into(),
            message: "gone".into(),
            attempts: 1,
        });
        WorkItem::new(
            ItemMetadata {
                stage: StageId::Fetched,
                key: key.into(),
                partition: date(),
                identity: format!("https://example.com/{key}"),
                status,
                created_at: now,
                processed_at: now,
                source_refs: vec!["post_1".into()],
                error,
                details: StageDetails::Article(ArticleDetails::failed(format!(
                    "https://example.com/{key}"
                ))),
            },
            "",
        )
    }

    #[tokio::test]
    async fn test_upstream_items_filters_and_quarantines() {
        let tmp = TempDir::new().unwrap();
        let store = ItemStore::new(Arc::new(LocalBlobStore::new(tmp.path())));

        store.write(&fetched("url_a", ItemStatus::Success)).await.unwrap();
        store.write(&fetched("url_b", ItemStatus::Error)).await.unwrap();
        let bad = ItemStore::item_path(StageId::Fetched, date(), "url_c");
        store.blobs().put(&bad, b"+++\nnot toml\n+++\n").await.unwrap();

        let all = upstream_items(&store, StageId::Fetched, date(), false)
            .await
            .unwrap();
        assert_eq!(all.items.len(), 2);
        assert_eq!(all.quarantined, 1);

        let ok = upstream_items(&store, StageId::Fetched, date(), true)
            .await
            .unwrap();
        assert_eq!(ok.items.len(), 1);
        assert_eq!(ok.items[0].key(), "url_a");
        assert_eq!(ok.quarantined, 0);
    }
}
