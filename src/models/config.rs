//! Application configuration structures.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Upper bound for report and export windows, in days.
pub const MAX_WINDOW_DAYS: u32 = 366;

/// Root application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Stage runner behavior
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Retry budget for transient failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// Post collection settings
    #[serde(default)]
    pub collect: CollectConfig,

    /// Article fetching settings
    #[serde(default)]
    pub fetch: FetchConfig,

    /// LLM evaluation settings
    #[serde(default)]
    pub evaluate: EvaluateConfig,

    /// Digest settings
    #[serde(default)]
    pub report: ReportConfig,

    /// Columnar snapshot settings
    #[serde(default)]
    pub export: ExportConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Load configuration or return default if loading fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(&path).unwrap_or_else(|e| {
            log::warn!(
                "Config load failed from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Self::default()
        })
    }

    /// Validate configuration values for basic sanity.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.max_concurrent == 0 {
            return Err(AppError::validation("pipeline.max_concurrent must be > 0"));
        }
        if self.pipeline.item_timeout_secs == 0 {
            return Err(AppError::validation(
                "pipeline.item_timeout_secs must be > 0",
            ));
        }
        if self.pipeline.checkpoint_every == 0 {
            return Err(AppError::validation(
                "pipeline.checkpoint_every must be > 0",
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(AppError::validation("retry.max_attempts must be > 0"));
        }
        if self.fetch.user_agent.trim().is_empty() {
            return Err(AppError::validation("fetch.user_agent is empty"));
        }
        if self.fetch.timeout_secs == 0 {
            return Err(AppError::validation("fetch.timeout_secs must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.evaluate.relevance_threshold) {
            return Err(AppError::validation(
                "evaluate.relevance_threshold must be within 0.0..=1.0",
            ));
        }
        if self.collect.source == PostSourceKind::Bluesky && self.collect.query.trim().is_empty()
        {
            return Err(AppError::validation(
                "collect.query is required for the bluesky source",
            ));
        }
        if !(1..=MAX_WINDOW_DAYS).contains(&self.report.window_days) {
            return Err(AppError::validation(format!(
                "report.window_days must be between 1 and {MAX_WINDOW_DAYS}"
            )));
        }
        if !(1..=MAX_WINDOW_DAYS).contains(&self.export.days) {
            return Err(AppError::validation(format!(
                "export.days must be between 1 and {MAX_WINDOW_DAYS}"
            )));
        }
        Ok(())
    }
}

/// Stage runner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Maximum work units transformed concurrently
    #[serde(default = "defaults::max_concurrent")]
    pub max_concurrent: usize,

    /// Timeout applied to each transform
    #[serde(default = "defaults::item_timeout")]
    pub item_timeout_secs: u64,

    /// Delay after each completed unit in milliseconds
    #[serde(default = "defaults::request_delay")]
    pub request_delay_ms: u64,

    /// Persist the registry after this many results
    #[serde(default = "defaults::checkpoint_every")]
    pub checkpoint_every: usize,

    /// Age after which a stage lock is considered abandoned
    #[serde(default = "defaults::lock_stale")]
    pub lock_stale_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: defaults::max_concurrent(),
            item_timeout_secs: defaults::item_timeout(),
            request_delay_ms: defaults::request_delay(),
            checkpoint_every: defaults::checkpoint_every(),
            lock_stale_secs: defaults::lock_stale(),
        }
    }
}

/// Retry budget for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per identity before a transient failure becomes permanent
    #[serde(default = "defaults::max_attempts")]
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: defaults::max_attempts(),
        }
    }
}

/// Where posts come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PostSourceKind {
    /// JSON drop files under `inbox/`
    #[default]
    Inbox,
    /// Bluesky public search
    Bluesky,
}

/// Post collection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectConfig {
    #[serde(default)]
    pub source: PostSourceKind,

    /// Search query for network sources
    #[serde(default)]
    pub query: String,

    /// Upper bound of posts per collection run
    #[serde(default = "defaults::max_posts")]
    pub max_posts: usize,

    #[serde(default = "defaults::bluesky_api_url")]
    pub bluesky_api_url: String,

    /// Link domains never handed to the fetch stage
    #[serde(default = "defaults::exclude_domains")]
    pub exclude_domains: Vec<String>,

    /// Resolve shortened links before posts are committed
    #[serde(default = "defaults::expand_links")]
    pub expand_links: bool,

    #[serde(default = "defaults::shortener_domains")]
    pub shortener_domains: Vec<String>,

    /// Keep only posts tagged with one of these languages; empty keeps all
    #[serde(default)]
    pub languages: Vec<String>,
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            source: PostSourceKind::default(),
            query: String::new(),
            max_posts: defaults::max_posts(),
            bluesky_api_url: defaults::bluesky_api_url(),
            exclude_domains: defaults::exclude_domains(),
            expand_links: defaults::expand_links(),
            shortener_domains: defaults::shortener_domains(),
            languages: Vec::new(),
        }
    }
}

/// HTTP article fetching settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// User-Agent header for HTTP requests
    #[serde(default = "defaults::user_agent")]
    pub user_agent: String,

    /// Request timeout in seconds
    #[serde(default = "defaults::fetch_timeout")]
    pub timeout_secs: u64,

    /// Bodies larger than this are rejected as permanent failures
    #[serde(default = "defaults::max_body_bytes")]
    pub max_body_bytes: usize,

    /// Extracted text shorter than this is treated as unparseable
    #[serde(default = "defaults::min_word_count")]
    pub min_word_count: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: defaults::user_agent(),
            timeout_secs: defaults::fetch_timeout(),
            max_body_bytes: defaults::max_body_bytes(),
            min_word_count: defaults::min_word_count(),
        }
    }
}

/// LLM evaluation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluateConfig {
    #[serde(default = "defaults::model")]
    pub model: String,

    #[serde(default = "defaults::api_url")]
    pub api_url: String,

    #[serde(default = "defaults::max_tokens")]
    pub max_tokens: u32,

    /// Article text is truncated to this many characters before evaluation
    #[serde(default = "defaults::max_input_chars")]
    pub max_input_chars: usize,

    /// Score at or above which an article counts as relevant
    #[serde(default = "defaults::relevance_threshold")]
    pub relevance_threshold: f64,

    /// Subject the digest is about
    #[serde(default = "defaults::topic")]
    pub topic: String,
}

impl Default for EvaluateConfig {
    fn default() -> Self {
        Self {
            model: defaults::model(),
            api_url: defaults::api_url(),
            max_tokens: defaults::max_tokens(),
            max_input_chars: defaults::max_input_chars(),
            relevance_threshold: defaults::relevance_threshold(),
            topic: defaults::topic(),
        }
    }
}

/// Digest settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Number of partitions (days) aggregated into one digest
    #[serde(default = "defaults::window_days")]
    pub window_days: u32,

    /// Articles below this score are left out of the digest
    #[serde(default = "defaults::min_relevance")]
    pub min_relevance: f64,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            window_days: defaults::window_days(),
            min_relevance: defaults::min_relevance(),
        }
    }
}

/// Columnar snapshot settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Rolling window of partitions per snapshot
    #[serde(default = "defaults::export_days")]
    pub days: u32,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            days: defaults::export_days(),
        }
    }
}

mod defaults {
    // Pipeline defaults
    pub fn max_concurrent() -> usize {
        5
    }
    pub fn item_timeout() -> u64 {
        60
    }
    pub fn request_delay() -> u64 {
        0
    }
    pub fn checkpoint_every() -> usize {
        25
    }
    pub fn lock_stale() -> u64 {
        6 * 60 * 60
    }
    pub fn max_attempts() -> u32 {
        3
    }

    // Collect defaults
    pub fn max_posts() -> usize {
        200
    }
    pub fn bluesky_api_url() -> String {
        "https://public.api.bsky.app".into()
    }
    pub fn exclude_domains() -> Vec<String> {
        vec!["bsky.app".into(), "bsky.social".into()]
    }
    pub fn expand_links() -> bool {
        true
    }
    pub fn shortener_domains() -> Vec<String> {
        [
            "bit.ly", "bitly.com", "tinyurl.com", "t.co", "goo.gl", "ow.ly", "tiny.cc", "is.gd",
            "buff.ly", "ift.tt", "dlvr.it", "fb.me", "amzn.to", "lnkd.in", "rebrand.ly",
            "cutt.ly", "bl.ink", "v.gd", "x.co", "shor.by",
        ]
        .map(String::from)
        .to_vec()
    }

    // Fetch defaults
    pub fn user_agent() -> String {
        "Mozilla/5.0 (compatible; digestline/0.1)".into()
    }
    pub fn fetch_timeout() -> u64 {
        30
    }
    pub fn max_body_bytes() -> usize {
        5 * 1024 * 1024
    }
    pub fn min_word_count() -> usize {
        50
    }

    // Evaluate defaults
    pub fn model() -> String {
        "claude-3-haiku-20240307".into()
    }
    pub fn api_url() -> String {
        "https://api.anthropic.com/v1/messages".into()
    }
    pub fn max_tokens() -> u32 {
        1024
    }
    pub fn max_input_chars() -> usize {
        12_000
    }
    pub fn relevance_threshold() -> f64 {
        0.5
    }
    pub fn topic() -> String {
        "the Model Context Protocol (MCP)".into()
    }

    // Report defaults
    pub fn window_days() -> u32 {
        1
    }
    pub fn min_relevance() -> f64 {
        0.5
    }
    pub fn export_days() -> u32 {
        7
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_default_config_ok() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_concurrency() {
        let mut config = Config::default();
        config.pipeline.max_concurrent = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_retry_budget() {
        let mut config = Config::default();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_bounds_windows() {
        let mut config = Config::default();
        config.report.window_days = u32::MAX;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.export.days = MAX_WINDOW_DAYS + 1;
        assert!(config.validate().is_err());

        config.export.days = MAX_WINDOW_DAYS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_requires_query_for_bluesky() {
        let mut config = Config::default();
        config.collect.source = PostSourceKind::Bluesky;
        assert!(config.validate().is_err());

        config.collect.query = "#mcp".into();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [retry]
            max_attempts = 5

            [collect]
            source = "bluesky"
            query = "mcp"
            "#,
        )
        .unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.collect.source, PostSourceKind::Bluesky);
        assert_eq!(config.pipeline.max_concurrent, 5);
        assert_eq!(config.fetch.min_word_count, 50);
    }
}
