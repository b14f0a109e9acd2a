//! Report stage: one digest per partition over a window of evaluated days.
//!
//! The digest identity includes a digest of the evaluated keys it covers, so
//! new evaluations in the window make the report eligible again while an
//! unchanged window is skipped.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Days, NaiveDate};

use super::stage::{Stage, StageOutput, UnitInput, WorkUnit, upstream_items};
use crate::error::{ProcessError, Result};
use crate::models::{MAX_WINDOW_DAYS, ReportConfig, ReportDetails, StageDetails, StageId, WorkItem};
use crate::services::{DigestEntry, ReportRenderer};
use crate::storage::ItemStore;
use crate::utils::hash_key;

pub const DIGEST_KEY: &str = "digest";

pub struct ReportStage {
    renderer: Arc<dyn ReportRenderer>,
    window_days: u32,
    min_relevance: f64,
}

impl ReportStage {
    pub fn new(renderer: Arc<dyn ReportRenderer>, config: &ReportConfig) -> Self {
        Self {
            renderer,
            window_days: config.window_days.clamp(1, MAX_WINDOW_DAYS),
            min_relevance: config.min_relevance,
        }
    }

    fn window(&self, partition: NaiveDate) -> (NaiveDate, NaiveDate) {
        let start = partition
            .checked_sub_days(Days::new(u64::from(self.window_days - 1)))
            .unwrap_or(NaiveDate::MIN);
        (start, partition)
    }

    fn entries(&self, items: &[WorkItem]) -> Vec<DigestEntry> {
        items
            .iter()
            .filter_map(|item| match &item.metadata.details {
                StageDetails::Evaluation(e)
                    if e.is_relevant && e.relevance_score >= self.min_relevance =>
                {
                    Some(DigestEntry {
                        key: item.metadata.key.clone(),
                        url: e.url.clone(),
                        title: e.title.clone(),
                        relevance_score: e.relevance_score,
                        summary: e.summary.clone(),
                        key_topics: e.key_topics.clone(),
                    })
                }
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl Stage for ReportStage {
    fn id(&self) -> StageId {
        StageId::Reported
    }

    async fn discover(&self, store: &ItemStore, partition: NaiveDate) -> Result<Vec<WorkUnit>> {
        let (start, end) = self.window(partition);
        let mut items = Vec::new();
        for day in start.iter_days().take_while(|d| *d <= end) {
            items.extend(
                upstream_items(store, StageId::Evaluated, day, true)
                    .await?
                    .items,
            );
        }
        if items.is_empty() {
            log::info!("No evaluated articles between {} and {}", start, end);
            return Ok(Vec::new());
        }

        let mut keys: Vec<String> = items.iter().map(|i| i.metadata.key.clone()).collect();
        keys.sort();
        keys.dedup();
        let fingerprint = hash_key("set", &keys.join(","));

        Ok(vec![WorkUnit {
            identity: format!("{DIGEST_KEY}:{start}..{end}:{fingerprint}"),
            key: DIGEST_KEY.to_string(),
            source_refs: keys,
            published_hint: None,
            input: UnitInput::Window { start, end, items },
        }])
    }

    async fn transform(&self, unit: &WorkUnit) -> std::result::Result<StageOutput, ProcessError> {
        let UnitInput::Window { start, end, items } = &unit.input else {
            return Err(ProcessError::InvalidIdentity(format!(
                "{} is not a report window",
                unit.identity
            )));
        };
        let entries = self.entries(items);
        let body = self.renderer.render(*start, *end, &entries)?;

        Ok(StageOutput {
            details: StageDetails::Report(ReportDetails {
                window_start: *start,
                window_end: *end,
                article_count: items.len(),
                relevant_count: entries.len(),
                entries: entries.into_iter().map(|e| e.key).collect(),
            }),
            body,
        })
    }

    fn failure_details(&self, unit: &WorkUnit) -> StageDetails {
        let (start, end, count) = match &unit.input {
            UnitInput::Window { start, end, items } => (*start, *end, items.len()),
            _ => {
                let day = chrono::Utc::now().date_naive();
                (day, day, 0)
            }
        };
        StageDetails::Report(ReportDetails {
            window_start: start,
            window_end: end,
            article_count: count,
            relevant_count: 0,
            entries: Vec::new(),
        })
    }
}
