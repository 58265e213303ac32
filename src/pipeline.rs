// src/pipeline.rs
//! Pre-open pipeline: ingest → normalize → score → select top-N → plan →
//! persist, with progress checkpoints between stages.
//!
//! Each checkpoint asks the [`ProgressSink`] whether to continue; a `Break`
//! turns into [`StageError::Cancelled`] and unwinds the run through `?`.
//! `Done` is reported after the body regardless of how it ended, and every
//! run (including failed and cancelled ones) leaves a [`RunSummary`] behind.

use std::collections::{BTreeMap, HashSet};
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use crate::analyze::entities::EntityResolver;
use crate::analyze::normalize::{normalize_items, NormalizedItem};
use crate::analyze::round_to;
use crate::analyze::scoring::{score_items, ScoredItem};
use crate::analyze::select::select_top_n;
use crate::analyze::tagger::Tagger;
use crate::clock::Clock;
use crate::config::AppConfig;
use crate::ingest::canon::make_dedup_key;
use crate::ingest::types::SourceIngestStat;
use crate::ingest::Ingestor;
use crate::market_time::DeadlineSchedule;
use crate::metrics::{DedupeRates, DiversitySnapshot, RunCounts, RunMetrics, RunSummary, StageTimings};
use crate::plan::{generate_plan, PlanValidation};
use crate::storage::PipelineStore;

const UNKNOWN_SECTOR: &str = "unknown";

fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("pipeline_runs_total", "Pipeline runs by outcome.");
        describe_histogram!("pipeline_stage_ms", "Per-stage pipeline time in milliseconds.");
    });
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Scheduler,
    Ingestion,
    Normalize,
    Score,
    SelectTopN,
    Plan,
    Done,
}

impl Stage {
    pub fn percent(self) -> u8 {
        match self {
            Stage::Scheduler => 10,
            Stage::Ingestion => 20,
            Stage::Normalize => 40,
            Stage::Score => 60,
            Stage::SelectTopN => 75,
            Stage::Plan => 90,
            Stage::Done => 100,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Scheduler => "Scheduler",
            Stage::Ingestion => "Ingestion",
            Stage::Normalize => "Normalize",
            Stage::Score => "Score",
            Stage::SelectTopN => "SelectTopN",
            Stage::Plan => "Plan",
            Stage::Done => "Done",
        }
    }
}

pub trait ProgressSink: Send + Sync {
    /// `Break` requests cancellation.
    fn on_stage(&self, stage: Stage) -> ControlFlow<()>;
}

/// Sink that never cancels.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_stage(&self, _stage: Stage) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

fn checkpoint(sink: &dyn ProgressSink, stage: Stage) -> Result<(), StageError> {
    match sink.on_stage(stage) {
        ControlFlow::Continue(()) => Ok(()),
        ControlFlow::Break(()) => Err(StageError::Cancelled),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRequest {
    pub market: String,
    pub trade_date: String,
    pub deadlines: DeadlineSchedule,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanSummary {
    pub entries: usize,
    pub validation: PlanValidation,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunReport {
    pub market: String,
    pub trade_date: String,
    pub deadlines: DeadlineSchedule,
    pub counts: RunCounts,
    pub timings_ms: StageTimings,
    pub top_titles: Vec<String>,
    pub plan: PlanSummary,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed(RunReport),
    Cancelled,
    Failed(String),
}

impl RunOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Completed(_) => "completed",
            RunOutcome::Cancelled => "cancelled",
            RunOutcome::Failed(_) => "failed",
        }
    }
}

#[async_trait]
pub trait PipelineRunner: Send + Sync {
    async fn run(&self, req: &RunRequest, progress: &dyn ProgressSink) -> RunOutcome;
}

/// `1 − unique/total`, rounded to 4; 0 for an empty set.
fn repeat_rate(unique: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round_to((1.0 - unique as f64 / total as f64).max(0.0), 4)
}

/// Ingestion repeat rate from per-source fetched/kept totals, plus link and
/// content repeats among normalized items.
fn dedupe_rates(
    per_source: &BTreeMap<String, SourceIngestStat>,
    normalized: &[NormalizedItem],
) -> (f64, DedupeRates) {
    let fetched: usize = per_source.values().map(|s| s.fetched).sum();
    let kept: usize = per_source.values().map(|s| s.kept).sum();
    let links: HashSet<&str> = normalized
        .iter()
        .filter_map(|n| n.link_canon_hash.as_deref())
        .collect();
    let contents: HashSet<&str> = normalized.iter().map(|n| n.content_hash.as_str()).collect();
    (
        repeat_rate(kept, fetched),
        DedupeRates {
            link: repeat_rate(links.len(), normalized.len()),
            content: repeat_rate(contents.len(), normalized.len()),
        },
    )
}

fn tally<'a>(keys: impl Iterator<Item = &'a str>) -> BTreeMap<String, usize> {
    let mut m = BTreeMap::new();
    for k in keys {
        *m.entry(k.to_string()).or_insert(0) += 1;
    }
    m
}

fn sector_of(s: &ScoredItem) -> &str {
    s.first_sector().unwrap_or(UNKNOWN_SECTOR)
}

pub struct PreopenPipeline {
    cfg: Arc<AppConfig>,
    ingestor: Arc<Ingestor>,
    resolver: Arc<dyn EntityResolver>,
    tagger: Arc<dyn Tagger>,
    store: Arc<dyn PipelineStore>,
    metrics: Arc<RunMetrics>,
    clock: Arc<dyn Clock>,
}

impl PreopenPipeline {
    pub fn new(
        cfg: Arc<AppConfig>,
        ingestor: Arc<Ingestor>,
        resolver: Arc<dyn EntityResolver>,
        tagger: Arc<dyn Tagger>,
        store: Arc<dyn PipelineStore>,
        metrics: Arc<RunMetrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            cfg,
            ingestor,
            resolver,
            tagger,
            store,
            metrics,
            clock,
        }
    }

    async fn run_stages(
        &self,
        req: &RunRequest,
        progress: &dyn ProgressSink,
    ) -> Result<(RunReport, RunSummary), StageError> {
        let cfg = &self.cfg;
        let market = req.market.as_str();
        let trade_date = req.trade_date.as_str();
        let as_of = self.clock.now_utc();
        let mut timings = StageTimings::default();

        checkpoint(progress, Stage::Scheduler)?;

        checkpoint(progress, Stage::Ingestion)?;
        let t = Instant::now();
        let raw = self.ingestor.fetch_from_all_sources(cfg, market, trade_date).await;
        timings.ingestion = t.elapsed().as_millis() as u64;
        histogram!("pipeline_stage_ms", "stage" => "ingestion").record(timings.ingestion as f64);
        let ingestion_per_source = self.ingestor.source_stats().snapshot();

        checkpoint(progress, Stage::Normalize)?;
        let t = Instant::now();
        let normalized = normalize_items(&raw, self.resolver.as_ref());
        let (dedupe_rate, dedupe) = dedupe_rates(&ingestion_per_source, &normalized);
        timings.normalize = t.elapsed().as_millis() as u64;
        histogram!("pipeline_stage_ms", "stage" => "normalize").record(timings.normalize as f64);

        checkpoint(progress, Stage::Score)?;
        let t = Instant::now();
        let normalized_count = normalized.len();
        self.store
            .save_normalized(&normalized)
            .await
            .context("persisting normalized items")?;
        let scored = score_items(
            normalized,
            self.tagger.as_ref(),
            &cfg.scoring.weights,
            &cfg.scoring.source_trust,
            as_of,
        )
        .await;
        timings.score = t.elapsed().as_millis() as u64;
        histogram!("pipeline_stage_ms", "stage" => "score").record(timings.score as f64);

        checkpoint(progress, Stage::SelectTopN)?;
        let t = Instant::now();
        let sector_cap = cfg.scoring.diversity.sector_cap_pct;
        let top = select_top_n(&scored, cfg.scoring.top_n, cfg.scoring.threshold(), sector_cap);
        timings.select = t.elapsed().as_millis() as u64;
        histogram!("pipeline_stage_ms", "stage" => "select").record(timings.select as f64);

        checkpoint(progress, Stage::Plan)?;
        let rendered = generate_plan(top.first(), market, trade_date, as_of);

        for r in &raw {
            let key = make_dedup_key(r.url.as_deref(), r.title.as_deref());
            self.store
                .insert_raw_if_absent(&r.source_id, &key, r)
                .await
                .context("persisting raw items")?;
        }
        self.store
            .save_candidates(trade_date, market, &cfg.scoring.version, &top)
            .await
            .context("persisting candidates")?;
        self.store
            .save_plan(&rendered)
            .await
            .context("persisting plan")?;

        let counts = RunCounts {
            ingested: raw.len(),
            normalized: normalized_count,
            topn: top.len(),
        };
        let summary = RunSummary {
            market: market.to_string(),
            trade_date: trade_date.to_string(),
            as_of,
            counts,
            dedupe_rate,
            dedupe,
            timings_ms: Some(timings),
            ingestion_per_source,
            diversity: DiversitySnapshot {
                pre: tally(scored.iter().map(sector_of)),
                post: tally(top.iter().map(sector_of)),
                sector_cap_pct: sector_cap,
            },
            source_diversity: DiversitySnapshot {
                pre: tally(scored.iter().map(ScoredItem::source_id)),
                post: tally(top.iter().map(ScoredItem::source_id)),
                sector_cap_pct: None,
            },
            http_cache: self.ingestor.http_cache_summary(),
            error: None,
        };
        let report = RunReport {
            market: market.to_string(),
            trade_date: trade_date.to_string(),
            deadlines: req.deadlines.clone(),
            counts,
            timings_ms: timings,
            top_titles: top.iter().map(|s| s.normalized.title.clone()).collect(),
            plan: PlanSummary {
                entries: rendered.plan.entries.len(),
                validation: rendered.plan.validation.clone(),
            },
        };
        Ok((report, summary))
    }
}

#[async_trait]
impl PipelineRunner for PreopenPipeline {
    async fn run(&self, req: &RunRequest, progress: &dyn ProgressSink) -> RunOutcome {
        ensure_metrics_described();
        let started = Instant::now();
        let result = self.run_stages(req, progress).await;
        let _ = progress.on_stage(Stage::Done);

        let outcome = match result {
            Ok((report, summary)) => {
                self.metrics.record_run(summary);
                RunOutcome::Completed(report)
            }
            Err(e) => {
                let msg = match &e {
                    StageError::Cancelled => "cancelled".to_string(),
                    StageError::Failed(err) => format!("{err:#}"),
                };
                self.metrics.record_run(RunSummary::failed(
                    &req.market,
                    &req.trade_date,
                    self.clock.now_utc(),
                    msg.clone(),
                ));
                match e {
                    StageError::Cancelled => RunOutcome::Cancelled,
                    StageError::Failed(_) => RunOutcome::Failed(msg),
                }
            }
        };

        counter!("pipeline_runs_total", "outcome" => outcome.label()).increment(1);
        tracing::info!(
            target: "pipeline",
            market = %req.market,
            trade_date = %req.trade_date,
            outcome = outcome.label(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "pre-open run finished"
        );
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        seen: Mutex<Vec<Stage>>,
        stop_at: Option<Stage>,
    }

    impl ProgressSink for Recorder {
        fn on_stage(&self, stage: Stage) -> ControlFlow<()> {
            self.seen.lock().unwrap().push(stage);
            if self.stop_at == Some(stage) {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        }
    }

    #[test]
    fn stage_percents_are_monotonic() {
        let stages = [
            Stage::Scheduler,
            Stage::Ingestion,
            Stage::Normalize,
            Stage::Score,
            Stage::SelectTopN,
            Stage::Plan,
            Stage::Done,
        ];
        let p: Vec<u8> = stages.iter().map(|s| s.percent()).collect();
        assert_eq!(p, vec![10, 20, 40, 60, 75, 90, 100]);
    }

    #[test]
    fn checkpoint_break_is_cancel() {
        let r = Recorder {
            seen: Mutex::new(vec![]),
            stop_at: Some(Stage::Score),
        };
        assert!(checkpoint(&r, Stage::Normalize).is_ok());
        assert!(matches!(checkpoint(&r, Stage::Score), Err(StageError::Cancelled)));
    }

    #[test]
    fn repeat_rate_bounds() {
        assert_eq!(repeat_rate(0, 0), 0.0);
        assert_eq!(repeat_rate(3, 4), 0.25);
        assert_eq!(repeat_rate(4, 4), 0.0);
    }

    #[test]
    fn ingest_dedupe_rate_uses_fetched_and_kept_totals() {
        let stat = |fetched, kept| SourceIngestStat {
            fetched,
            kept,
            ..SourceIngestStat::default()
        };
        let per_source = BTreeMap::from([
            ("wire-a".to_string(), stat(2, 2)),
            ("wire-b".to_string(), stat(2, 1)),
        ]);
        let (rate, _) = dedupe_rates(&per_source, &[]);
        assert_eq!(rate, 0.25);
        assert_eq!(dedupe_rates(&BTreeMap::new(), &[]).0, 0.0);
    }
}
