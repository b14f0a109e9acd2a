//! Identity registry: cross-run deduplication and processing state.
//!
//! One registry exists per stage, persisted as `registry/{stage}.json`.
//! It is loaded once at the start of a stage run, mutated in memory on the
//! runner's control flow, and checkpointed back. It is the sole authority
//! for "should this identity be processed again".
//!
//! ```text
//! pending ──success──────────────▶ success            (terminal)
//!    │    ──permanent────────────▶ permanent_failure  (terminal)
//!    └────transient──▶ transient_failure{n} ──(n == budget)──▶ permanent_failure
//! ```

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::StageId;
use crate::storage::BlobStore;

/// Processing state of one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProcessingState {
    Pending,
    Success,
    PermanentFailure,
    /// Failed transiently and still within the retry budget
    TransientFailure { attempts: u32 },
}

impl ProcessingState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::PermanentFailure)
    }
}

/// Result of one processing attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success,
    PermanentFailure { kind: String },
    TransientFailure { kind: String },
}

/// Registry record for one canonical identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub identity: String,
    /// Item key the identity is stored under in this stage
    pub item_key: String,
    /// Partition of the last committed item, or of the first sighting
    pub partition: NaiveDate,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_hint: Option<DateTime<Utc>>,
    pub seen_count: u32,
    #[serde(default)]
    pub source_refs: BTreeSet<String>,
    #[serde(default)]
    pub attempts: u32,
    pub processing_state: ProcessingState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    stage: Option<StageId>,
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    entries: BTreeMap<String, RegistryEntry>,
}

/// Counts of entries by processing state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryCounts {
    pub pending: usize,
    pub success: usize,
    pub permanent_failure: usize,
    pub transient_failure: usize,
}

/// In-memory registry for one stage.
#[derive(Debug, Clone)]
pub struct Registry {
    stage: StageId,
    max_attempts: u32,
    entries: BTreeMap<String, RegistryEntry>,
    dirty: usize,
}

impl Registry {
    /// Storage path of a stage registry.
    pub fn path(stage: StageId) -> String {
        format!("registry/{}.json", stage.dir_name())
    }

    /// An empty registry.
    pub fn new(stage: StageId, max_attempts: u32) -> Self {
        Self {
            stage,
            max_attempts: max_attempts.max(1),
            entries: BTreeMap::new(),
            dirty: 0,
        }
    }

    /// Load the registry of a stage. A missing file yields an empty registry;
    /// an undecodable one is `RegistryCorrupt`.
    pub async fn load(blobs: &dyn BlobStore, stage: StageId, max_attempts: u32) -> Result<Self> {
        let mut registry = Self::new(stage, max_attempts);
        let Some(bytes) = blobs.get(&Self::path(stage)).await? else {
            return Ok(registry);
        };

        let file: RegistryFile =
            serde_json::from_slice(&bytes).map_err(|e| AppError::RegistryCorrupt {
                stage,
                message: e.to_string(),
            })?;
        if let Some(found) = file.stage {
            if found != stage {
                return Err(AppError::RegistryCorrupt {
                    stage,
                    message: format!("file belongs to stage {found}"),
                });
            }
        }
        for (identity, entry) in &file.entries {
            if identity != &entry.identity {
                return Err(AppError::RegistryCorrupt {
                    stage,
                    message: format!("entry '{}' filed under '{}'", entry.identity, identity),
                });
            }
        }

        registry.entries = file.entries;
        Ok(registry)
    }

    /// Write the whole registry back.
    pub async fn persist(&mut self, blobs: &dyn BlobStore) -> Result<()> {
        let file = RegistryFile {
            stage: Some(self.stage),
            updated_at: Some(Utc::now()),
            entries: self.entries.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;
        blobs.put(&Self::path(self.stage), &bytes).await?;
        self.dirty = 0;
        Ok(())
    }

    pub fn stage(&self) -> StageId {
        self.stage
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Number of mutations since the last persist.
    pub fn dirty(&self) -> usize {
        self.dirty
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.values()
    }

    pub fn lookup(&self, identity: &str) -> Option<&RegistryEntry> {
        self.entries.get(identity)
    }

    /// Find the entry stored under an item key. Several identities can share
    /// a key over time (a digest is rewritten per window); the most recently
    /// seen one wins.
    pub fn find_by_key(&self, item_key: &str) -> Option<&RegistryEntry> {
        self.entries
            .values()
            .filter(|e| e.item_key == item_key)
            .max_by_key(|e| e.last_seen_at)
    }

    /// Record a sighting of `identity` from `source_ref`.
    ///
    /// Creates the entry on first sight. Repeated calls with the same
    /// `source_ref` do not inflate `seen_count`. Terminal states are never
    /// reopened.
    pub fn record_seen(
        &mut self,
        identity: &str,
        item_key: &str,
        partition: NaiveDate,
        source_ref: &str,
        published_hint: Option<DateTime<Utc>>,
    ) -> &RegistryEntry {
        let now = Utc::now();
        self.dirty += 1;

        let entry = self
            .entries
            .entry(identity.to_string())
            .or_insert_with(|| RegistryEntry {
                identity: identity.to_string(),
                item_key: item_key.to_string(),
                partition,
                first_seen_at: now,
                last_seen_at: now,
                published_hint,
                seen_count: 0,
                source_refs: BTreeSet::new(),
                attempts: 0,
                processing_state: ProcessingState::Pending,
                last_error: None,
            });

        entry.last_seen_at = now;
        if entry.published_hint.is_none() {
            entry.published_hint = published_hint;
        }
        if entry.source_refs.insert(source_ref.to_string()) {
            entry.seen_count = entry.source_refs.len() as u32;
        }
        entry
    }

    /// Attempt count and state that `outcome` would produce, without
    /// applying it. `None` for an unknown identity.
    pub fn next_state(
        &self,
        identity: &str,
        outcome: &Outcome,
    ) -> Option<(u32, ProcessingState)> {
        let entry = self.entries.get(identity)?;
        if entry.processing_state.is_terminal() {
            return Some((entry.attempts, entry.processing_state));
        }

        let attempts = entry.attempts + 1;
        let state = match outcome {
            Outcome::Success => ProcessingState::Success,
            Outcome::PermanentFailure { .. } => ProcessingState::PermanentFailure,
            Outcome::TransientFailure { .. } if attempts >= self.max_attempts => {
                ProcessingState::PermanentFailure
            }
            Outcome::TransientFailure { .. } => ProcessingState::TransientFailure { attempts },
        };
        Some((attempts, state))
    }

    /// Apply the result of a processing attempt whose item was committed
    /// under `partition`.
    ///
    /// Returns `None` for an identity that was never recorded.
    pub fn mark_result(
        &mut self,
        identity: &str,
        outcome: Outcome,
        partition: NaiveDate,
    ) -> Option<&RegistryEntry> {
        let (attempts, state) = self.next_state(identity, &outcome)?;
        let entry = self.entries.get_mut(identity)?;
        self.dirty += 1;

        if entry.processing_state.is_terminal() {
            log::debug!(
                "Ignoring {:?} for {}: already {:?}",
                outcome,
                identity,
                entry.processing_state
            );
            return Some(entry);
        }

        entry.attempts = attempts;
        entry.processing_state = state;
        entry.partition = partition;
        entry.last_error = match outcome {
            Outcome::Success => None,
            Outcome::PermanentFailure { kind } | Outcome::TransientFailure { kind } => Some(kind),
        };
        Some(entry)
    }

    /// Bring an entry in line with a committed terminal item found in the
    /// item store under `partition` (the run that wrote it stopped before
    /// persisting).
    pub fn repair_terminal(
        &mut self,
        identity: &str,
        success: bool,
        attempts: u32,
        partition: NaiveDate,
    ) {
        if let Some(entry) = self.entries.get_mut(identity) {
            if entry.processing_state.is_terminal() {
                return;
            }
            entry.attempts = entry.attempts.max(attempts);
            entry.partition = partition;
            entry.processing_state = if success {
                ProcessingState::Success
            } else {
                ProcessingState::PermanentFailure
            };
            self.dirty += 1;
        }
    }

    /// Operator override: make an identity eligible again regardless of state.
    pub fn reset(&mut self, identity: &str) -> bool {
        match self.entries.get_mut(identity) {
            Some(entry) => {
                entry.processing_state = ProcessingState::Pending;
                entry.attempts = 0;
                entry.last_error = None;
                self.dirty += 1;
                true
            }
            None => false,
        }
    }

    /// Drop an identity entirely.
    pub fn forget(&mut self, identity: &str) -> bool {
        let removed = self.entries.remove(identity).is_some();
        if removed {
            self.dirty += 1;
        }
        removed
    }

    pub fn counts(&self) -> RegistryCounts {
        let mut counts = RegistryCounts::default();
        for entry in self.entries.values() {
            match entry.processing_state {
                ProcessingState::Pending => counts.pending += 1,
                ProcessingState::Success => counts.success += 1,
                ProcessingState::PermanentFailure => counts.permanent_failure += 1,
                ProcessingState::TransientFailure { .. } => counts.transient_failure += 1,
            }
        }
        counts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalBlobStore;
    use tempfile::TempDir;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    fn transient() -> Outcome {
        Outcome::TransientFailure {
            kind: "timeout".into(),
        }
    }

    #[test]
    fn test_seen_count_tracks_distinct_refs() {
        let mut registry = Registry::new(StageId::Fetched, 3);
        for _ in 0..5 {
            registry.record_seen("https://a.example", "url_a", date(), "p1", None);
            registry.record_seen("https://a.example", "url_a", date(), "p2", None);
        }
        registry.record_seen("https://a.example", "url_a", date(), "p3", None);

        let entry = registry.lookup("https://a.example").unwrap();
        assert_eq!(entry.seen_count, 3);
        assert_eq!(entry.source_refs.len(), 3);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_transient_until_budget_then_permanent() {
        let mut registry = Registry::new(StageId::Fetched, 3);
        registry.record_seen("u", "url_u", date(), "p1", None);

        let state = registry.mark_result("u", transient(), date()).unwrap().processing_state;
        assert_eq!(state, ProcessingState::TransientFailure { attempts: 1 });
        assert!(!state.is_terminal());

        registry.mark_result("u", transient(), date());
        let entry = registry.mark_result("u", transient(), date()).unwrap();
        assert_eq!(entry.processing_state, ProcessingState::PermanentFailure);
        assert_eq!(entry.attempts, 3);
    }

    #[test]
    fn test_terminal_states_do_not_reopen() {
        let mut registry = Registry::new(StageId::Fetched, 3);
        registry.record_seen("u", "url_u", date(), "p1", None);
        registry.mark_result("u", Outcome::Success, date());

        registry.record_seen("u", "url_u", date(), "p2", None);
        registry.mark_result("u", transient(), date());

        let entry = registry.lookup("u").unwrap();
        assert_eq!(entry.processing_state, ProcessingState::Success);
        assert_eq!(entry.seen_count, 2);
        assert_eq!(entry.attempts, 1);
    }

    #[test]
    fn test_reset_and_forget() {
        let mut registry = Registry::new(StageId::Fetched, 3);
        registry.record_seen("u", "url_u", date(), "p1", None);
        registry.mark_result(
            "u",
            Outcome::PermanentFailure {
                kind: "http_404".into(),
            },
            date(),
        );

        assert!(registry.reset("u"));
        let entry = registry.find_by_key("url_u").unwrap();
        assert_eq!(entry.processing_state, ProcessingState::Pending);
        assert_eq!(entry.attempts, 0);

        assert!(registry.forget("u"));
        assert!(!registry.forget("u"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unknown_identity_mark_is_none() {
        let mut registry = Registry::new(StageId::Evaluated, 3);
        assert!(registry.mark_result("ghost", Outcome::Success, date()).is_none());
    }

    #[test]
    fn test_next_state_does_not_mutate() {
        let mut registry = Registry::new(StageId::Fetched, 2);
        registry.record_seen("u", "url_u", date(), "p1", None);
        registry.mark_result("u", transient(), date());
        let dirty = registry.dirty();

        let (attempts, state) = registry.next_state("u", &transient()).unwrap();
        assert_eq!(attempts, 2);
        assert_eq!(state, ProcessingState::PermanentFailure);

        let entry = registry.lookup("u").unwrap();
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.processing_state, ProcessingState::TransientFailure { attempts: 1 });
        assert_eq!(registry.dirty(), dirty);
    }

    #[test]
    fn test_commit_moves_entry_partition() {
        let later = date().succ_opt().unwrap();
        let mut registry = Registry::new(StageId::Fetched, 3);
        registry.record_seen("u", "url_u", date(), "p1", None);
        registry.mark_result("u", transient(), date());
        assert_eq!(registry.lookup("u").unwrap().partition, date());

        registry.record_seen("u", "url_u", later, "p2", None);
        assert_eq!(registry.lookup("u").unwrap().partition, date());
        registry.mark_result("u", Outcome::Success, later);
        assert_eq!(registry.find_by_key("url_u").unwrap().partition, later);

        registry.record_seen("v", "url_v", date(), "p1", None);
        registry.repair_terminal("v", false, 3, later);
        let entry = registry.lookup("v").unwrap();
        assert_eq!(entry.partition, later);
        assert_eq!(entry.processing_state, ProcessingState::PermanentFailure);
    }

    #[tokio::test]
    async fn test_persist_and_load() {
        let tmp = TempDir::new().unwrap();
        let blobs = LocalBlobStore::new(tmp.path());

        let mut registry = Registry::new(StageId::Fetched, 3);
        registry.record_seen("u", "url_u", date(), "p1", None);
        registry.mark_result("u", transient(), date());
        registry.persist(&blobs).await.unwrap();
        assert_eq!(registry.dirty(), 0);

        let loaded = Registry::load(&blobs, StageId::Fetched, 3).await.unwrap();
        assert_eq!(loaded.lookup("u"), registry.lookup("u"));
        assert_eq!(loaded.counts().transient_failure, 1);

        let empty = Registry::load(&blobs, StageId::Evaluated, 3).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_reported() {
        let tmp = TempDir::new().unwrap();
        let blobs = LocalBlobStore::new(tmp.path());
        blobs
            .put(&Registry::path(StageId::Fetched), b"{ not json")
            .await
            .unwrap();

        let err = Registry::load(&blobs, StageId::Fetched, 3).await.unwrap_err();
        assert!(matches!(err, AppError::RegistryCorrupt { .. }));
    }
}
