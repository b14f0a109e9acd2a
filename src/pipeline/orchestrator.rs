// src/pipeline/orchestrator.rs

//! Orchestrator: stage wiring and operator commands.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::NaiveDate;
use futures::StreamExt;

use super::collect::CollectStage;
use super::evaluate::EvaluateStage;
use super::fetch::FetchStage;
use super::report::ReportStage;
use super::runner::{StageRunReport, StageRunner};
use super::stage::Stage;
use crate::error::{AppError, Result};
use crate::models::{Config, ErrorClass, ItemStatus, PostSourceKind, StageId, WorkItem};
use crate::services::{
    AnthropicEvaluator, BlueskySearch, HttpArticleFetcher, HttpLinkExpander, InboxPostSource,
    MarkdownDigestRenderer, PostSource,
};
use crate::storage::{BlobStore, ItemStore, Registry, RegistryCounts, StageLock};
use crate::utils::http::create_async_client;

/// Item counts of one stage and partition.
#[derive(Debug, Clone, PartialEq)]
pub struct StageStatus {
    pub stage: StageId,
    pub partition: NaiveDate,
    pub total: usize,
    pub success: usize,
    pub transient_failure: usize,
    pub permanent_failure: usize,
    pub malformed: usize,
    /// Registry state across all partitions
    pub registry: RegistryCounts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanSummary {
    pub removed: usize,
    pub forgotten: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySummary {
    pub identity: Option<String>,
    pub partition: NaiveDate,
    pub removed_item: bool,
}

/// Runs stages and answers operator queries over the store.
pub struct Orchestrator {
    config: Arc<Config>,
    store: ItemStore,
    stages: BTreeMap<StageId, Arc<dyn Stage>>,
    cancel: Arc<AtomicBool>,
}

impl Orchestrator {
    /// An orchestrator without stages; add them with [`Orchestrator::with_stage`].
    pub fn new(config: Config, blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            config: Arc::new(config),
            store: ItemStore::new(blobs),
            stages: BTreeMap::new(),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// An orchestrator wired with the shipped adapters.
    pub fn from_config(config: Config, blobs: Arc<dyn BlobStore>) -> Result<Self> {
        config.validate()?;
        let client = create_async_client(&config.fetch)?;

        let source: Arc<dyn PostSource> = match config.collect.source {
            PostSourceKind::Inbox => Arc::new(InboxPostSource::new(Arc::clone(&blobs))),
            PostSourceKind::Bluesky => Arc::new(BlueskySearch::new(client.clone(), &config.collect)),
        };
        let mut collect = CollectStage::new(source, config.collect.max_posts)
            .with_languages(config.collect.languages.clone());
        if config.collect.expand_links {
            collect = collect.with_expander(Arc::new(HttpLinkExpander::new(
                client.clone(),
                config.collect.shortener_domains.clone(),
            )));
        }
        let fetch = FetchStage::new(
            Arc::new(HttpArticleFetcher::new(
                client.clone(),
                config.fetch.max_body_bytes,
            )),
            config.collect.exclude_domains.clone(),
            &config.fetch,
        );
        let evaluate = EvaluateStage::new(
            Arc::new(AnthropicEvaluator::from_env(client, &config.evaluate)),
            &config.evaluate,
        );
        let report = ReportStage::new(
            Arc::new(MarkdownDigestRenderer::new(config.evaluate.topic.clone())),
            &config.report,
        );

        Ok(Self::new(config, blobs)
            .with_stage(Arc::new(collect))
            .with_stage(Arc::new(fetch))
            .with_stage(Arc::new(evaluate))
            .with_stage(Arc::new(report)))
    }

    pub fn with_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.insert(stage.id(), stage);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &ItemStore {
        &self.store
    }

    /// Flag that stops dispatching new units when set.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    fn stage(&self, id: StageId) -> Result<&Arc<dyn Stage>> {
        self.stages
            .get(&id)
            .ok_or_else(|| AppError::config(format!("No implementation registered for stage {id}")))
    }

    fn runner(&self) -> StageRunner {
        StageRunner::new(
            self.store.clone(),
            Arc::clone(&self.config),
            Arc::clone(&self.cancel),
        )
    }

    fn stale_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            i64::try_from(self.config.pipeline.lock_stale_secs).unwrap_or(i64::MAX),
        )
    }

    /// Run one stage for one partition.
    pub async fn run_stage(&self, id: StageId, partition: NaiveDate) -> Result<StageRunReport> {
        let stage = self.stage(id)?;
        self.runner().run(stage.as_ref(), partition).await
    }

    /// Run stages in `order` for one partition, stopping at the first abort
    /// or on cancellation. Downstream stages do not run after an abort.
    pub async fn run_pipeline(
        &self,
        partition: NaiveDate,
        order: &[StageId],
    ) -> Result<Vec<StageRunReport>> {
        let mut reports = Vec::with_capacity(order.len());
        for id in order {
            if self.cancel.load(Ordering::SeqCst) {
                log::warn!("Pipeline cancelled before stage {}", id);
                break;
            }
            let report = self.run_stage(*id, partition).await?;
            let cancelled = report.cancelled;
            reports.push(report);
            if cancelled {
                break;
            }
        }
        Ok(reports)
    }

    /// Item counts per stage for a partition.
    pub async fn status(&self, partition: NaiveDate) -> Result<Vec<StageStatus>> {
        let mut statuses = Vec::with_capacity(StageId::ALL.len());
        for stage in StageId::ALL {
            let registry =
                Registry::load(self.store.blobs().as_ref(), stage, self.config.retry.max_attempts)
                    .await?;
            let mut status = StageStatus {
                stage,
                partition,
                total: 0,
                success: 0,
                transient_failure: 0,
                permanent_failure: 0,
                malformed: 0,
                registry: registry.counts(),
            };

            let mut items = self.store.list(stage, partition);
            while let Some(result) = items.next().await {
                status.total += 1;
                match result {
                    Ok(item) => match (&item.metadata.status, &item.metadata.error) {
                        (ItemStatus::Success, _) => status.success += 1,
                        (ItemStatus::Error, Some(f)) if f.class == ErrorClass::Transient => {
                            status.transient_failure += 1
                        }
                        _ => status.permanent_failure += 1,
                    },
                    Err(AppError::MalformedItem { .. }) => status.malformed += 1,
                    Err(e) => return Err(e),
                }
            }
            statuses.push(status);
        }
        Ok(statuses)
    }

    /// Up to `limit` committed items of a stage, in key order. Malformed
    /// documents are left in place and skipped.
    pub async fn list(
        &self,
        stage: StageId,
        partition: NaiveDate,
        limit: usize,
    ) -> Result<Vec<WorkItem>> {
        let mut items = Vec::new();
        let mut stream = self.store.list(stage, partition);
        while let Some(result) = stream.next().await {
            if items.len() >= limit {
                break;
            }
            match result {
                Ok(item) => items.push(item),
                Err(AppError::MalformedItem { path, message }) => {
                    log::warn!("Skipping malformed item {}: {}", path, message);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(items)
    }

    /// Remove every item of a stage partition and forget their identities,
    /// so the next run processes them from scratch.
    pub async fn clean(&self, stage: StageId, partition: NaiveDate) -> Result<CleanSummary> {
        let blobs = Arc::clone(self.store.blobs());
        let lock = StageLock::acquire(Arc::clone(&blobs), stage, self.stale_after()).await?;
        let result = self.clean_locked(stage, partition).await;
        lock.release().await?;
        result
    }

    async fn clean_locked(&self, stage: StageId, partition: NaiveDate) -> Result<CleanSummary> {
        let blobs = self.store.blobs();
        let mut registry =
            Registry::load(blobs.as_ref(), stage, self.config.retry.max_attempts).await?;
        let mut summary = CleanSummary {
            removed: 0,
            forgotten: 0,
        };

        for key in self.store.list_keys(stage, partition).await? {
            let identity = match self.store.read(stage, partition, &key).await {
                Ok(Some(item)) => Some(item.metadata.identity),
                Ok(None) => None,
                Err(AppError::MalformedItem { .. }) => None,
                Err(e) => return Err(e),
            };
            if self.store.remove(stage, partition, &key).await? {
                summary.removed += 1;
            }
            if let Some(identity) = identity {
                if registry.forget(&identity) {
                    summary.forgotten += 1;
                }
            }
        }

        // Identities recorded for the partition that never produced an item
        let orphans: Vec<String> = registry
            .entries()
            .filter(|e| e.partition == partition)
            .map(|e| e.identity.clone())
            .collect();
        for identity in orphans {
            if registry.forget(&identity) {
                summary.forgotten += 1;
            }
        }

        registry.persist(blobs.as_ref()).await?;
        log::info!(
            "Cleaned stage {} for {}: {} items removed, {} identities forgotten",
            stage,
            partition,
            summary.removed,
            summary.forgotten
        );
        Ok(summary)
    }

    /// Make one item eligible again: reset its registry entry to pending and
    /// remove the committed item. `partition` defaults to where the registry
    /// says the item was committed.
    pub async fn retry(
        &self,
        stage: StageId,
        key: &str,
        partition: Option<NaiveDate>,
    ) -> Result<RetrySummary> {
        ItemStore::validate_key(key)?;
        let blobs = Arc::clone(self.store.blobs());
        let lock = StageLock::acquire(Arc::clone(&blobs), stage, self.stale_after()).await?;
        let result = self.retry_locked(stage, key, partition).await;
        lock.release().await?;
        result
    }

    async fn retry_locked(
        &self,
        stage: StageId,
        key: &str,
        partition: Option<NaiveDate>,
    ) -> Result<RetrySummary> {
        let blobs = self.store.blobs();
        let mut registry =
            Registry::load(blobs.as_ref(), stage, self.config.retry.max_attempts).await?;

        let entry = registry
            .find_by_key(key)
            .map(|e| (e.identity.clone(), e.partition));
        let partition = match (partition, &entry) {
            (Some(p), _) => p,
            (None, Some((_, p))) => *p,
            (None, None) => {
                return Err(AppError::validation(format!(
                    "Key '{key}' is unknown to stage {stage}; pass --partition"
                )));
            }
        };

        let identity = entry.map(|(identity, _)| identity);
        if identity.is_none() && !self.store.exists(stage, partition, key).await? {
            return Err(AppError::validation(format!(
                "No item '{key}' in stage {stage} for {partition}"
            )));
        }
        if let Some(identity) = &identity {
            registry.reset(identity);
        }
        let removed_item = self.store.remove(stage, partition, key).await?;

        registry.persist(blobs.as_ref()).await?;
        log::info!(
            "Reset {} in stage {} ({}); item removed: {}",
            key,
            stage,
            partition,
            removed_item
        );
        Ok(RetrySummary {
            identity,
            partition,
            removed_item,
        })
    }

    /// Write the columnar snapshot of a stage.
    #[cfg(feature = "export")]
    pub async fn export(
        &self,
        stage: StageId,
        run_date: NaiveDate,
        days: Option<u32>,
    ) -> Result<super::export::ExportSummary> {
        let days = days.unwrap_or(self.config.export.days);
        super::export::export_stage(&self.store, stage, run_date, days).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ItemMetadata, PostDetails, StageDetails};
    use crate::storage::LocalBlobStore;
    use chrono::Utc;
    use tempfile::TempDir;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    fn post(key: &str) -> WorkItem {
        let now = Utc::now();
        WorkItem::new(
            ItemMetadata {
                stage: StageId::Collected,
                key: key.into(),
                partition: date(),
                identity: format!("at://{key}"),
                status: ItemStatus::Success,
                created_at: now,
                processed_at: now,
                source_refs: vec!["inbox".into()],
                error: None,
                details: StageDetails::Post(PostDetails {
                    post_id: format!("at://{key}"),
                    author: "bob.bsky.social".into(),
                    posted_at: now,
                    links: vec![],
                    likes: 0,
                    reposts: 0,
                    replies: 0,
                    language: None,
                }),
            },
            "hello",
        )
    }

    #[tokio::test]
    async fn test_status_and_list_skip_malformed() {
        let tmp = TempDir::new().unwrap();
        let orchestrator =
            Orchestrator::new(Config::default(), Arc::new(LocalBlobStore::new(tmp.path())));
        let store = orchestrator.store();
        for key in ["post_a", "post_b", "post_c"] {
            store.write(&post(key)).await.unwrap();
        }
        let bad = ItemStore::item_path(StageId::Collected, date(), "post_0");
        store.blobs().put(&bad, b"garbage").await.unwrap();

        let status = orchestrator.status(date()).await.unwrap();
        assert_eq!(status.len(), 4);
        assert_eq!(status[0].stage, StageId::Collected);
        assert_eq!(status[0].total, 4);
        assert_eq!(status[0].success, 3);
        assert_eq!(status[0].malformed, 1);
        assert_eq!(status[1].total, 0);

        let listed = orchestrator
            .list(StageId::Collected, date(), 2)
            .await
            .unwrap();
        let keys: Vec<_> = listed.iter().map(|i| i.key()).collect();
        assert_eq!(keys, vec!["post_a", "post_b"]);

        // Listing never moves anything
        assert!(store.exists(StageId::Collected, date(), "post_0").await.unwrap());
    }

    #[tokio::test]
    async fn test_unregistered_stage_is_a_config_error() {
        let tmp = TempDir::new().unwrap();
        let orchestrator =
            Orchestrator::new(Config::default(), Arc::new(LocalBlobStore::new(tmp.path())));
        assert!(matches!(
            orchestrator.run_stage(StageId::Fetched, date()).await,
            Err(AppError::Config(_))
        ));
    }
}
