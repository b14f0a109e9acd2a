//! Generic stage runner.
//!
//! Per unit: `Discovered -> InFlight -> Committed-Success | Committed-Error`.
//! `InFlight` is never persisted; a crash loses at most the units that were
//! in flight, and they are rediscovered on the next run. The registry only
//! records an outcome after its item has been written.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use futures::stream::{self, StreamExt};

use super::classify::{RetryPolicy, classify};
use super::stage::{Stage, StageOutput, WorkUnit};
use crate::error::{AppError, ProcessError, Result};
use crate::models::{
    Config, ErrorClass, ItemFailure, ItemMetadata, ItemStatus, StageDetails, StageId, WorkItem,
};
use crate::storage::{ItemStore, Outcome, ProcessingState, Registry, StageLock};

/// Summary of one stage run.
#[derive(Debug, Clone, PartialEq)]
pub struct StageRunReport {
    pub stage: StageId,
    pub partition: NaiveDate,
    /// Units found by discovery
    pub discovered: usize,
    /// Units whose result was committed in this run
    pub processed: usize,
    /// Units skipped because they already reached a terminal state
    pub skipped: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub transient: usize,
    pub permanent: usize,
    /// Malformed committed items moved aside during the run
    pub quarantined: usize,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl StageRunReport {
    fn new(stage: StageId, partition: NaiveDate) -> Self {
        Self {
            stage,
            partition,
            discovered: 0,
            processed: 0,
            skipped: 0,
            succeeded: 0,
            failed: 0,
            transient: 0,
            permanent: 0,
            quarantined: 0,
            cancelled: false,
            elapsed: Duration::ZERO,
        }
    }
}

impl fmt::Display for StageRunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stage={} partition={} discovered={} processed={} skipped={} succeeded={} \
             failed={} transient={} permanent={} quarantined={} cancelled={} elapsed={:.1}s",
            self.stage,
            self.partition,
            self.discovered,
            self.processed,
            self.skipped,
            self.succeeded,
            self.failed,
            self.transient,
            self.permanent,
            self.quarantined,
            self.cancelled,
            self.elapsed.as_secs_f64()
        )
    }
}

/// Runs one stage for one partition.
pub struct StageRunner {
    store: ItemStore,
    config: Arc<Config>,
    cancel: Arc<AtomicBool>,
}

/// A unit that passed the skip check.
struct Pending {
    unit: WorkUnit,
    created_at: Option<DateTime<Utc>>,
}

impl StageRunner {
    pub fn new(store: ItemStore, config: Arc<Config>, cancel: Arc<AtomicBool>) -> Self {
        Self {
            store,
            config,
            cancel,
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Run `stage` for `partition` under the stage lock.
    ///
    /// Transient and permanent unit failures are recorded and the run
    /// continues. A fatal failure stops the run with `StageAborted` after
    /// the registry has been persisted.
    pub async fn run(&self, stage: &dyn Stage, partition: NaiveDate) -> Result<StageRunReport> {
        let id = stage.id();
        let started = Instant::now();
        let stale_after = chrono::Duration::seconds(
            i64::try_from(self.config.pipeline.lock_stale_secs).unwrap_or(i64::MAX),
        );

        let lock = StageLock::acquire(self.store.blobs().clone(), id, stale_after).await?;
        let mut report = StageRunReport::new(id, partition);
        let result = self.run_locked(stage, partition, &mut report).await;
        if let Err(e) = lock.release().await {
            log::warn!("Failed to release lock for stage {}: {}", id, e);
        }

        report.elapsed = started.elapsed();
        match result {
            Ok(()) => {
                log::info!("Stage finished: {}", report);
                Ok(report)
            }
            Err(e) => {
                log::error!("Stage aborted: {} ({})", report, e);
                Err(AppError::aborted(id, partition, e))
            }
        }
    }

    async fn run_locked(
        &self,
        stage: &dyn Stage,
        partition: NaiveDate,
        report: &mut StageRunReport,
    ) -> Result<()> {
        let id = stage.id();
        let blobs = self.store.blobs().clone();
        let policy = RetryPolicy::from_config(&self.config);
        let mut registry = Registry::load(blobs.as_ref(), id, policy.max_attempts).await?;

        let units = stage.discover(&self.store, partition).await?;
        report.discovered = units.len();
        log::info!(
            "Stage {} discovered {} units for {}",
            id,
            units.len(),
            partition
        );

        let pending = self
            .select_pending(id, partition, units, &mut registry, report)
            .await?;
        log::info!(
            "Stage {}: {} to process, {} skipped",
            id,
            pending.len(),
            report.skipped
        );

        let concurrency = self.config.pipeline.max_concurrent.max(1);
        let item_timeout = Duration::from_secs(self.config.pipeline.item_timeout_secs);
        let delay = Duration::from_millis(self.config.pipeline.request_delay_ms);
        let checkpoint_every = self.config.pipeline.checkpoint_every.max(1);
        let cancel = Arc::clone(&self.cancel);

        let mut results = stream::iter(pending)
            .take_while(move |_| futures::future::ready(!cancel.load(Ordering::SeqCst)))
            .map(|pending| async move {
                let result = match tokio::time::timeout(item_timeout, stage.transform(&pending.unit))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ProcessError::Timeout(item_timeout)),
                };
                (pending, result)
            })
            .buffer_unordered(concurrency);

        let mut fatal: Option<AppError> = None;
        while let Some((pending, result)) = results.next().await {
            let committed = match result {
                Ok(output) => {
                    self.commit_success(id, partition, pending, output, &mut registry, report)
                        .await
                }
                Err(error) => {
                    self.commit_failure(
                        stage, partition, pending, error, &policy, &mut registry, report,
                    )
                    .await
                }
            };
            if let Err(e) = committed {
                fatal = Some(e);
                break;
            }

            if registry.dirty() >= checkpoint_every {
                if let Err(e) = registry.persist(blobs.as_ref()).await {
                    fatal = Some(e);
                    break;
                }
                log::debug!("Checkpointed registry for stage {}", id);
            }

            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        // In-flight transforms are dropped here without being committed
        drop(results);

        report.cancelled = self.cancelled();
        if report.cancelled {
            log::warn!("Stage {} cancelled; in-flight units left for the next run", id);
        }

        let persisted = registry.persist(blobs.as_ref()).await;
        match fatal {
            Some(e) => {
                if let Err(p) = persisted {
                    log::error!("Registry for stage {} not persisted: {}", id, p);
                }
                Err(e)
            }
            None => persisted,
        }
    }

    /// Record sightings and drop units that already reached a terminal state.
    async fn select_pending(
        &self,
        id: StageId,
        partition: NaiveDate,
        units: Vec<WorkUnit>,
        registry: &mut Registry,
        report: &mut StageRunReport,
    ) -> Result<Vec<Pending>> {
        let mut pending = Vec::new();
        let mut seen_keys: HashMap<String, String> = HashMap::new();

        for unit in units {
            if let Some(previous) = seen_keys.insert(unit.key.clone(), unit.identity.clone()) {
                log::warn!(
                    "Key {} produced by both {} and {}; keeping the first",
                    unit.key,
                    previous,
                    unit.identity
                );
                continue;
            }

            for source_ref in &unit.source_refs {
                registry.record_seen(
                    &unit.identity,
                    &unit.key,
                    partition,
                    source_ref,
                    unit.published_hint,
                );
            }
            if unit.source_refs.is_empty() {
                registry.record_seen(
                    &unit.identity,
                    &unit.key,
                    partition,
                    &unit.key,
                    unit.published_hint,
                );
            }

            if registry
                .lookup(&unit.identity)
                .is_some_and(|e| e.processing_state.is_terminal())
            {
                log::debug!("Skipping {} ({}): already terminal", unit.key, unit.identity);
                report.skipped += 1;
                continue;
            }

            let committed = match self.store.read(id, partition, &unit.key).await {
                Ok(item) => item,
                Err(AppError::MalformedItem { path, message }) => {
                    log::warn!("Replacing malformed item {}: {}", path, message);
                    self.store.quarantine(&path).await?;
                    report.quarantined += 1;
                    None
                }
                Err(e) => return Err(e),
            };

            let committed = committed.filter(|item| item.metadata.identity == unit.identity);
            if let Some(item) = &committed {
                if item.metadata.is_terminal() {
                    let attempts = item.metadata.error.as_ref().map_or(1, |f| f.attempts);
                    registry.repair_terminal(
                        &unit.identity,
                        item.is_success(),
                        attempts,
                        partition,
                    );
                    log::debug!("Skipping {}: committed item is terminal", unit.key);
                    report.skipped += 1;
                    continue;
                }
            }

            pending.push(Pending {
                created_at: committed.map(|item| item.metadata.created_at),
                unit,
            });
        }
        Ok(pending)
    }

    #[allow(clippy::too_many_arguments)]
    fn metadata(
        &self,
        id: StageId,
        partition: NaiveDate,
        pending: &Pending,
        registry: &Registry,
        status: ItemStatus,
        error: Option<ItemFailure>,
        details: StageDetails,
    ) -> ItemMetadata {
        let now = Utc::now();
        let source_refs = registry
            .lookup(&pending.unit.identity)
            .map(|e| e.source_refs.iter().cloned().collect())
            .unwrap_or_else(|| pending.unit.source_refs.clone());

        ItemMetadata {
            stage: id,
            key: pending.unit.key.clone(),
            partition,
            identity: pending.unit.identity.clone(),
            status,
            created_at: pending.created_at.unwrap_or(now),
            processed_at: now,
            source_refs,
            error,
            details,
        }
    }

    async fn commit_success(
        &self,
        id: StageId,
        partition: NaiveDate,
        pending: Pending,
        output: StageOutput,
        registry: &mut Registry,
        report: &mut StageRunReport,
    ) -> Result<()> {
        let metadata = self.metadata(
            id,
            partition,
            &pending,
            registry,
            ItemStatus::Success,
            None,
            output.details,
        );
        self.store.write(&WorkItem::new(metadata, output.body)).await?;
        registry.mark_result(&pending.unit.identity, Outcome::Success, partition);

        report.processed += 1;
        report.succeeded += 1;
        log::debug!("Committed {} ({})", pending.unit.key, pending.unit.identity);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn commit_failure(
        &self,
        stage: &dyn Stage,
        partition: NaiveDate,
        pending: Pending,
        error: ProcessError,
        policy: &RetryPolicy,
        registry: &mut Registry,
        report: &mut StageRunReport,
    ) -> Result<()> {
        let Some(outcome) = policy.outcome(&error) else {
            log::error!("Fatal failure on {}: {}", pending.unit.key, error);
            return Err(AppError::Fatal {
                key: pending.unit.key,
                error,
            });
        };

        let (attempts, state) = registry
            .next_state(&pending.unit.identity, &outcome)
            .unwrap_or((1, ProcessingState::PermanentFailure));
        let class = match state {
            ProcessingState::TransientFailure { .. } => ErrorClass::Transient,
            _ => policy.effective_class(classify(&error), attempts),
        };

        let failure = ItemFailure {
            class,
            kind: error.kind(),
            message: error.to_string(),
            attempts,
        };
        let metadata = self.metadata(
            stage.id(),
            partition,
            &pending,
            registry,
            ItemStatus::Error,
            Some(failure),
            stage.failure_details(&pending.unit),
        );
        self.store.write(&WorkItem::new(metadata, "")).await?;
        registry.mark_result(&pending.unit.identity, outcome, partition);

        report.processed += 1;
        report.failed += 1;
        match class {
            ErrorClass::Transient => report.transient += 1,
            _ => report.permanent += 1,
        }
        log::warn!(
            "{} failed ({:?}, attempt {}): {}",
            pending.unit.key,
            class,
            attempts,
            error
        );
        Ok(())
    }
}
