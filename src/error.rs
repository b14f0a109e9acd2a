// src/error.rs

//! Unified error handling for the pipeline.
//!
//! Two layers:
//! - [`ProcessError`] is what a collaborator returns for a single work unit.
//!   The classifier decides whether it is retried, recorded, or aborts the run.
//! - [`AppError`] is everything the engine itself can fail with.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::models::StageId;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, AppError>;

/// Unified application error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parsing failed
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// TOML serialization failed
    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    /// The durable medium could not be reached
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Registry file exists but cannot be decoded
    #[error("Registry for stage {stage} is corrupt: {message}")]
    RegistryCorrupt { stage: StageId, message: String },

    /// A persisted work item failed validation
    #[error("Malformed item at {path}: {message}")]
    MalformedItem { path: String, message: String },

    /// Another writer holds the stage lock
    #[error("Stage {stage} is locked by another run (since {since})")]
    LockHeld { stage: StageId, since: String },

    /// A stage run was aborted by a fatal condition
    #[error("Stage {stage} aborted for {partition}: {source}")]
    StageAborted {
        stage: StageId,
        partition: String,
        #[source]
        source: Box<AppError>,
    },

    /// Work units for a stage could not be enumerated
    #[error("Discovery failed for stage {stage}: {error}")]
    Discovery { stage: StageId, error: ProcessError },

    /// A work unit failed in a way that invalidates the whole run
    #[error("Fatal error on {key}: {error}")]
    Fatal { key: String, error: ProcessError },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Data validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Columnar export failed
    #[error("Export error: {0}")]
    Export(String),
}

impl AppError {
    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Create a storage error.
    pub fn storage(message: impl fmt::Display) -> Self {
        Self::StorageUnavailable(message.to_string())
    }

    /// Create a malformed item error.
    pub fn malformed(path: impl Into<String>, message: impl fmt::Display) -> Self {
        Self::MalformedItem {
            path: path.into(),
            message: message.to_string(),
        }
    }

    /// Wrap an error as the abort reason of a stage run.
    pub fn aborted(stage: StageId, partition: impl fmt::Display, source: AppError) -> Self {
        Self::StageAborted {
            stage,
            partition: partition.to_string(),
            source: Box::new(source),
        }
    }
}

/// Failure of a single work unit, as reported by a collaborator.
///
/// Variants describe the cause; [`crate::pipeline::classify`] turns a cause
/// into a retry decision. Message text is never inspected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProcessError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unparseable content: {0}")]
    Unparseable(String),

    #[error("unsupported content type: {0}")]
    UnsupportedContent(String),

    #[error("content too large: {0} bytes")]
    TooLarge(usize),

    #[error("invalid identity: {0}")]
    InvalidIdentity(String),

    #[error("upstream failure: {0}")]
    Upstream(String),

    #[error("local state unreadable: {0}")]
    LocalState(String),

    #[error("configuration invalid: {0}")]
    Configuration(String),
}

impl ProcessError {
    /// Short machine-readable tag stored in the item's error block.
    pub fn kind(&self) -> String {
        match self {
            Self::Timeout(_) => "timeout".into(),
            Self::Network(_) => "network".into(),
            Self::Http { status, .. } => format!("http_{status}"),
            Self::RateLimited { .. } => "rate_limited".into(),
            Self::NotFound(_) => "not_found".into(),
            Self::Unparseable(_) => "unparseable".into(),
            Self::UnsupportedContent(_) => "content_type".into(),
            Self::TooLarge(_) => "size".into(),
            Self::InvalidIdentity(_) => "invalid_identity".into(),
            Self::Upstream(_) => "upstream".into(),
            Self::LocalState(_) => "local_state".into(),
            Self::Configuration(_) => "configuration".into(),
        }
    }
}

impl From<reqwest::Error> for ProcessError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return Self::Timeout(Duration::ZERO);
        }
        if let Some(status) = error.status() {
            let url = error.url().map(|u| u.to_string()).unwrap_or_default();
            if status.as_u16() == 429 {
                return Self::RateLimited { retry_after: None };
            }
            return Self::Http {
                status: status.as_u16(),
                url,
            };
        }
        if error.is_decode() || error.is_body() {
            return Self::Unparseable(error.to_string());
        }
        if error.is_builder() {
            return Self::InvalidIdentity(error.to_string());
        }
        Self::Network(error.to_string())
    }
}

impl From<AppError> for ProcessError {
    fn from(error: AppError) -> Self {
        match error {
            AppError::Config(message) => Self::Configuration(message),
            AppError::Http(e) => Self::from(e),
            other => Self::LocalState(other.to_string()),
        }
    }
}
