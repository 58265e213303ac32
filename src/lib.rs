// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod alerts;
pub mod clock;
pub mod config;
pub mod market_time;
pub mod metrics;

// Ingestion: conditional HTTP fetchers, coordinator, dedup helpers
pub mod ingest;

// Normalize, tag, score and select
pub mod analyze;

// Plan, persistence and the run orchestrator
pub mod pipeline;
pub mod plan;
pub mod storage;

// Job registry, scheduler and the intraday watcher seam
pub mod intraday;
pub mod jobs;
pub mod scheduler;

// ---- Re-exports for stable public API ----
pub use crate::config::AppConfig;
pub use crate::jobs::{JobRegistry, TriggerRequest};
pub use crate::pipeline::{PipelineRunner, PreopenPipeline, RunOutcome};
pub use crate::scheduler::{Scheduler, SchedulerHandle};
