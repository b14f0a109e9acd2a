//! Work items: the persisted unit of stage output.
//!
//! Each item is stored as one self-describing document:
//!
//! ```text
//! +++
//! stage = "fetched"
//! key = "url_3f2a9c0d11e4b7a2"
//! ...
//! [details]
//! kind = "article"
//! ...
//! +++
//!
//! <body, preserved verbatim>
//! ```

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::models::StageId;

const FENCE: &str = "+++";

/// Outcome recorded for an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Success,
    Error,
}

/// Classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Retry later
    Transient,
    /// Never retry
    Permanent,
    /// Abort the stage run
    Fatal,
}

/// Error block of an item with `status = "error"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub class: ErrorClass,
    pub kind: String,
    pub message: String,
    #[serde(default)]
    pub attempts: u32,
}

/// Details of a collected post.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostDetails {
    pub post_id: String,
    pub author: String,
    pub posted_at: DateTime<Utc>,
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default)]
    pub likes: u32,
    #[serde(default)]
    pub reposts: u32,
    #[serde(default)]
    pub replies: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Details of a fetched article.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArticleDetails {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub word_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

impl ArticleDetails {
    /// Details carried by a fetch item that failed.
    pub fn failed(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: None,
            author: None,
            domain: None,
            language: None,
            word_count: 0,
            published_at: None,
        }
    }
}

/// Details of an LLM relevance judgment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationDetails {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub is_relevant: bool,
    pub relevance_score: f64,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub key_topics: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default)]
    pub model: String,
}

/// Details of a rendered digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportDetails {
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub article_count: usize,
    pub relevant_count: usize,
    #[serde(default)]
    pub entries: Vec<String>,
}

/// Stage-specific metadata, tagged so that a record is self-describing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageDetails {
    Post(PostDetails),
    Article(ArticleDetails),
    Evaluation(EvaluationDetails),
    Report(ReportDetails),
}

impl StageDetails {
    /// The only stage allowed to carry this variant.
    pub fn stage(&self) -> StageId {
        match self {
            StageDetails::Post(_) => StageId::Collected,
            StageDetails::Article(_) => StageId::Fetched,
            StageDetails::Evaluation(_) => StageId::Evaluated,
            StageDetails::Report(_) => StageId::Reported,
        }
    }

    /// The URL an item refers to, if any.
    pub fn url(&self) -> Option<&str> {
        match self {
            StageDetails::Article(a) => Some(&a.url),
            StageDetails::Evaluation(e) => Some(&e.url),
            _ => None,
        }
    }
}

/// Metadata block of a work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemMetadata {
    pub stage: StageId,
    pub key: String,
    pub partition: NaiveDate,
    pub identity: String,
    pub status: ItemStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
    #[serde(default)]
    pub source_refs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ItemFailure>,
    pub details: StageDetails,
}

impl ItemMetadata {
    /// Check structural invariants that serde alone cannot express.
    pub fn validate(&self, expected: StageId) -> std::result::Result<(), String> {
        if self.stage != expected {
            return Err(format!(
                "stage '{}' stored under '{}'",
                self.stage, expected
            ));
        }
        if self.details.stage() != self.stage {
            return Err(format!(
                "details of stage '{}' on a '{}' item",
                self.details.stage(),
                self.stage
            ));
        }
        if self.key.trim().is_empty() {
            return Err("empty key".into());
        }
        match (self.status, &self.error) {
            (ItemStatus::Success, Some(_)) => {
                return Err("success item carries an error block".into());
            }
            (ItemStatus::Error, None) => return Err("error item without error block".into()),
            (ItemStatus::Error, Some(failure)) if failure.class == ErrorClass::Fatal => {
                return Err("fatal failures are never persisted".into());
            }
            _ => {}
        }
        if let StageDetails::Evaluation(eval) = &self.details {
            if !(0.0..=1.0).contains(&eval.relevance_score) {
                return Err(format!(
                    "relevance_score {} outside 0.0..=1.0",
                    eval.relevance_score
                ));
            }
        }
        Ok(())
    }

    /// True when the item reached a state that is never reprocessed.
    pub fn is_terminal(&self) -> bool {
        match (&self.status, &self.error) {
            (ItemStatus::Success, _) => true,
            (ItemStatus::Error, Some(f)) => f.class == ErrorClass::Permanent,
            (ItemStatus::Error, None) => false,
        }
    }
}

/// A work item: metadata plus opaque body.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItem {
    pub metadata: ItemMetadata,
    pub body: String,
}

impl WorkItem {
    pub fn new(metadata: ItemMetadata, body: impl Into<String>) -> Self {
        Self {
            metadata,
            body: body.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.metadata.key
    }

    pub fn is_success(&self) -> bool {
        self.metadata.status == ItemStatus::Success
    }

    /// Render the item as a fenced document.
    pub fn to_document(&self) -> Result<String> {
        let block = toml::to_string(&self.metadata)?;
        Ok(format!("{FENCE}\n{block}{FENCE}\n\n{}", self.body))
    }

    /// Parse and validate a fenced document read from `path`.
    pub fn parse(path: &str, text: &str, expected: StageId) -> Result<Self> {
        let rest = text
            .strip_prefix(FENCE)
            .and_then(|r| r.strip_prefix('\n'))
            .ok_or_else(|| AppError::malformed(path, "missing opening fence"))?;

        // A fence line can also sit inside a multi-line metadata string; the
        // closing fence is the first one whose preceding block parses.
        let mut last_error = None;
        let mut found = None;
        for (idx, _) in rest.match_indices(FENCE) {
            let at_line_start = idx == 0 || rest.as_bytes()[idx - 1] == b'\n';
            let tail = &rest[idx + FENCE.len()..];
            if !at_line_start || !(tail.is_empty() || tail.starts_with('\n')) {
                continue;
            }
            match toml::from_str::<ItemMetadata>(&rest[..idx]) {
                Ok(metadata) => {
                    found = Some((metadata, tail.strip_prefix('\n').unwrap_or(tail)));
                    break;
                }
                Err(e) => last_error = Some(e),
            }
        }
        let (metadata, after) = match (found, last_error) {
            (Some(found), _) => found,
            (None, Some(e)) => return Err(AppError::malformed(path, e)),
            (None, None) => return Err(AppError::malformed(path, "missing closing fence")),
        };
        metadata
            .validate(expected)
            .map_err(|e| AppError::malformed(path, e))?;

        let body = after.strip_prefix('\n').unwrap_or(after);
        Ok(Self::new(metadata, body))
    }
}
