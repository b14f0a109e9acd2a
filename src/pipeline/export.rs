//! Columnar snapshots of committed items.
//!
//! One Parquet file per stage covering the last N partitions ending at the
//! run date, written to `exports/{stage}/{run_date}_last_{N}_days.parquet`.

use std::sync::Arc;

use arrow_array::{
    ArrayRef, BooleanArray, Float64Array, RecordBatch, StringArray, UInt32Array, UInt64Array,
};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{Days, NaiveDate};
use futures::StreamExt;
use parquet::arrow::ArrowWriter;

use crate::error::{AppError, Result};
use crate::models::{ItemStatus, MAX_WINDOW_DAYS, StageDetails, StageId, WorkItem};
use crate::storage::ItemStore;

/// Where a snapshot landed.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportSummary {
    pub stage: StageId,
    pub path: String,
    pub location: String,
    pub rows: usize,
    pub partitions: usize,
    pub skipped_malformed: usize,
}

pub fn export_path(stage: StageId, run_date: NaiveDate, days: u32) -> String {
    format!(
        "exports/{}/{}_last_{}_days.parquet",
        stage.dir_name(),
        run_date.format("%Y-%m-%d"),
        days
    )
}

/// Write the snapshot of `stage` for the `days` partitions ending at `run_date`.
pub async fn export_stage(
    store: &ItemStore,
    stage: StageId,
    run_date: NaiveDate,
    days: u32,
) -> Result<ExportSummary> {
    if !(1..=MAX_WINDOW_DAYS).contains(&days) {
        return Err(AppError::validation(format!(
            "export days must be between 1 and {MAX_WINDOW_DAYS}"
        )));
    }
    let start = run_date
        .checked_sub_days(Days::new(u64::from(days - 1)))
        .unwrap_or(NaiveDate::MIN);

    let mut items = Vec::new();
    let mut partitions = 0;
    let mut skipped_malformed = 0;
    for partition in store
        .partitions(stage)
        .await?
        .into_iter()
        .filter(|p| *p >= start && *p <= run_date)
    {
        partitions += 1;
        let mut stream = store.list(stage, partition);
        while let Some(result) = stream.next().await {
            match result {
                Ok(item) => items.push(item),
                Err(AppError::MalformedItem { path, message }) => {
                    log::warn!("Export skips malformed item {}: {}", path, message);
                    skipped_malformed += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    let batch = record_batch(&items)?;
    let bytes = write_parquet(&batch)?;
    let path = export_path(stage, run_date, days);
    store.blobs().put(&path, &bytes).await?;

    let location = store.blobs().location(&path);
    log::info!(
        "Exported {} {} items from {} partitions to {}",
        items.len(),
        stage,
        partitions,
        location
    );
    Ok(ExportSummary {
        stage,
        path,
        location,
        rows: items.len(),
        partitions,
        skipped_malformed,
    })
}

fn write_parquet(batch: &RecordBatch) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buffer, batch.schema(), None)
        .map_err(|e| AppError::Export(format!("opening parquet writer: {e}")))?;
    writer
        .write(batch)
        .map_err(|e| AppError::Export(format!("writing record batch: {e}")))?;
    writer
        .close()
        .map_err(|e| AppError::Export(format!("closing parquet writer: {e}")))?;
    Ok(buffer)
}

fn schema() -> Schema {
    Schema::new(vec![
        ArrowField::new("key", DataType::Utf8, false),
        ArrowField::new("identity", DataType::Utf8, false),
        ArrowField::new("partition", DataType::Utf8, false),
        ArrowField::new("stage", DataType::Utf8, false),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("error_class", DataType::Utf8, true),
        ArrowField::new("error_kind", DataType::Utf8, true),
        ArrowField::new("processed_at", DataType::Utf8, false),
        ArrowField::new("found_in", DataType::Utf8, false),
        ArrowField::new("found_in_count", DataType::UInt32, false),
        ArrowField::new("title", DataType::Utf8, true),
        ArrowField::new("domain", DataType::Utf8, true),
        ArrowField::new("word_count", DataType::UInt64, true),
        ArrowField::new("relevance_score", DataType::Float64, true),
        ArrowField::new("is_relevant", DataType::Boolean, true),
        ArrowField::new("author", DataType::Utf8, true),
        ArrowField::new("links_count", DataType::UInt32, true),
    ])
}

fn strings<'a>(items: &'a [WorkItem], f: impl Fn(&'a WorkItem) -> Option<String>) -> ArrayRef {
    Arc::new(StringArray::from(items.iter().map(f).collect::<Vec<_>>()))
}

fn record_batch(items: &[WorkItem]) -> Result<RecordBatch> {
    let title = |item: &WorkItem| match &item.metadata.details {
        StageDetails::Article(a) => a.title.clone(),
        StageDetails::Evaluation(e) => e.title.clone(),
        _ => None,
    };
    let domain = |item: &WorkItem| match &item.metadata.details {
        StageDetails::Article(a) => a.domain.clone(),
        _ => None,
    };
    let author = |item: &WorkItem| match &item.metadata.details {
        StageDetails::Post(p) => Some(p.author.clone()),
        StageDetails::Article(a) => a.author.clone(),
        _ => None,
    };

    let mut found_in = Vec::with_capacity(items.len());
    for item in items {
        found_in.push(Some(serde_json::to_string(&item.metadata.source_refs)?));
    }

    let columns: Vec<ArrayRef> = vec![
        strings(items, |i| Some(i.metadata.key.clone())),
        strings(items, |i| Some(i.metadata.identity.clone())),
        strings(items, |i| Some(i.metadata.partition.to_string())),
        strings(items, |i| Some(i.metadata.stage.to_string())),
        strings(items, |i| {
            Some(match i.metadata.status {
                ItemStatus::Success => "success".to_string(),
                ItemStatus::Error => "error".to_string(),
            })
        }),
        strings(items, |i| {
            i.metadata
                .error
                .as_ref()
                .map(|f| format!("{:?}", f.class).to_lowercase())
        }),
        strings(items, |i| i.metadata.error.as_ref().map(|f| f.kind.clone())),
        strings(items, |i| Some(i.metadata.processed_at.to_rfc3339())),
        Arc::new(StringArray::from(found_in)),
        Arc::new(UInt32Array::from(
            items
                .iter()
                .map(|i| u32::try_from(i.metadata.source_refs.len()).unwrap_or(u32::MAX))
                .collect::<Vec<_>>(),
        )),
        strings(items, title),
        strings(items, domain),
        Arc::new(UInt64Array::from(
            items
                .iter()
                .map(|i| match &i.metadata.details {
                    StageDetails::Article(a) if i.is_success() => Some(a.word_count as u64),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        Arc::new(Float64Array::from(
            items
                .iter()
                .map(|i| match &i.metadata.details {
                    StageDetails::Evaluation(e) if i.is_success() => Some(e.relevance_score),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        Arc::new(BooleanArray::from(
            items
                .iter()
                .map(|i| match &i.metadata.details {
                    StageDetails::Evaluation(e) if i.is_success() => Some(e.is_relevant),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
        strings(items, author),
        Arc::new(UInt32Array::from(
            items
                .iter()
                .map(|i| match &i.metadata.details {
                    StageDetails::Post(p) => Some(u32::try_from(p.links.len()).unwrap_or(u32::MAX)),
                    _ => None,
                })
                .collect::<Vec<_>>(),
        )),
    ];

    RecordBatch::try_new(Arc::new(schema()), columns)
        .map_err(|e| AppError::Export(format!("building record batch: {e}")))
}
