//! Batch pipeline for JBES: lifecycle tracking, repost detection, aggregation,
//! scoring, trend analysis, and the phase orchestrator that ties them together.

use std::time::Duration;

use chrono::{DateTime, Utc};
use jbes_adapters::ScrapeError;
use jbes_core::BoardId;
use jbes_storage::StoreError;
use thiserror::Error;

pub mod aggregates;
pub mod config;
pub mod ingest;
pub mod lifecycle;
pub mod pipeline;
pub mod reports;
pub mod reposts;
pub mod scheduler;
pub mod scoring;
mod stats;
pub mod trends;

pub use config::{BoardEntry, BoardsFile, SyncConfig};
pub use lifecycle::LifecycleTracker;
pub use pipeline::{
    build_orchestrator, run_pipeline_from_env, PipelineOrchestrator, PipelineSettings,
    PipelineStats, RunSummary,
};
pub use reposts::RepostDetector;
pub use scoring::EfficiencyScorer;
pub use trends::TrendDetector;

pub const CRATE_NAME: &str = "jbes-sync";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline already running (lease held by {holder} until {expires_at})")]
    AlreadyRunning {
        holder: String,
        expires_at: DateTime<Utc>,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Scrape(#[from] ScrapeError),
    #[error("no scraper registered for board {board_id}")]
    NoScraper { board_id: BoardId },
    #[error("{what} timed out after {after:?}")]
    Timeout { what: String, after: Duration },
    #[error("{what} panicked: {message}")]
    Panicked { what: String, message: String },
    #[error("serializing job result: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("{0}")]
    Fatal(String),
}
