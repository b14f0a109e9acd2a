//! Stage pipeline engine.
//!
//! - [`Stage`]: discover work units and transform one unit
//! - [`StageRunner`]: skip, dispatch, classify, persist
//! - [`Orchestrator`]: stage sequencing and operator commands
//! - [`classify`]: error classification and retry budget

pub mod classify;
pub mod collect;
pub mod evaluate;
#[cfg(feature = "export")]
pub mod export;
pub mod fetch;
pub mod orchestrator;
pub mod report;
pub mod runner;
pub mod stage;

pub use classify::{RetryPolicy, classify};
pub use collect::CollectStage;
pub use evaluate::EvaluateStage;
#[cfg(feature = "export")]
pub use export::{ExportSummary, export_stage};
pub use fetch::FetchStage;
pub use orchestrator::{CleanSummary, Orchestrator, RetrySummary, StageStatus};
pub use report::ReportStage;
pub use runner::{StageRunReport, StageRunner};
pub use stage::{Stage, StageOutput, UnitInput, WorkUnit, upstream_items};
