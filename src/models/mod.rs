// src/models/mod.rs

//! Domain models for the pipeline.
//!
//! This module contains the data structures shared by storage, stages and
//! the orchestrator, organized by their primary purpose.

mod config;
mod item;
mod post;
mod stage;

// Re-export all public types
pub use config::{
    CollectConfig, Config, EvaluateConfig, ExportConfig, FetchConfig, MAX_WINDOW_DAYS,
    PipelineConfig, PostSourceKind, ReportConfig, RetryConfig,
};
pub use item::{
    ArticleDetails, ErrorClass, EvaluationDetails, ItemFailure, ItemMetadata, ItemStatus,
    PostDetails, ReportDetails, StageDetails, WorkItem,
};
pub use post::RawPost;
pub use stage::StageId;
