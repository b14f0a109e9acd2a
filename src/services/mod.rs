//! External collaborators of the pipeline.
//!
//! Stages only talk to the outside world through these traits:
//! - [`PostSource`]: social-network posts for a partition
//! - [`LinkExpander`]: shortened-link resolution
//! - [`ArticleFetcher`]: linked article download and text extraction
//! - [`Evaluator`]: LLM relevance judgment
//! - [`ReportRenderer`]: digest rendering
//!
//! Adapters are thin; the engine never depends on their internals.

mod anthropic;
mod articles;
mod bluesky;
mod digest;
mod inbox;
mod links;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ProcessError;
use crate::models::RawPost;

pub use anthropic::AnthropicEvaluator;
pub use articles::HttpArticleFetcher;
pub use bluesky::BlueskySearch;
pub use digest::MarkdownDigestRenderer;
pub use inbox::InboxPostSource;
pub use links::HttpLinkExpander;

/// Supplies the posts published on a given day.
#[async_trait]
pub trait PostSource: Send + Sync {
    /// Stable description of the source, recorded as the sighting reference.
    fn name(&self) -> String;

    async fn posts(&self, partition: NaiveDate, limit: usize)
    -> Result<Vec<RawPost>, ProcessError>;
}

/// Resolves a possibly shortened link to its destination.
#[async_trait]
pub trait LinkExpander: Send + Sync {
    async fn expand(&self, url: &str) -> Result<String, ProcessError>;
}

/// Article extracted from a web page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedArticle {
    /// URL after redirects
    pub final_url: String,
    pub title: Option<String>,
    pub author: Option<String>,
    pub language: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    /// Main text as Markdown
    pub text: String,
}

/// Downloads a link and extracts its readable text.
#[async_trait]
pub trait ArticleFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedArticle, ProcessError>;
}

/// Article handed to an evaluator.
#[derive(Debug, Clone, Copy)]
pub struct ArticleInput<'a> {
    pub url: &'a str,
    pub title: Option<&'a str>,
    pub text: &'a str,
}

/// Relevance judgment returned by an evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub is_relevant: bool,
    pub relevance_score: f64,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub key_topics: Vec<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    /// Model that produced the judgment
    #[serde(default)]
    pub model: String,
}

/// Scores an article for relevance.
#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, article: ArticleInput<'_>) -> Result<Evaluation, ProcessError>;
}

/// One article as it appears in a digest.
#[derive(Debug, Clone, PartialEq)]
pub struct DigestEntry {
    pub key: String,
    pub url: String,
    pub title: Option<String>,
    pub relevance_score: f64,
    pub summary: String,
    pub key_topics: Vec<String>,
}

/// Renders digest entries for a window of days into a document body.
pub trait ReportRenderer: Send + Sync {
    fn render(
        &self,
        window_start: NaiveDate,
        window_end: NaiveDate,
        entries: &[DigestEntry],
    ) -> Result<String, ProcessError>;
}
