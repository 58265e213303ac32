// src/jobs.rs
//! Job registry for pre-open runs.
//!
//! Every run, whether triggered by the scheduler or by hand, goes through
//! [`JobRegistry::trigger`]. The dedupe lookup and the insert happen under
//! the same lock, so two racing triggers for the same key create one job.
//! A forced trigger replaces the record under the same id with a new
//! generation; progress from the older generation is dropped.

use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::config::PreopenConfig;
use crate::market_time::{compute_deadlines, parse_trade_date, DeadlineSchedule, DeadlinesSpec, MarketTimeError};
use crate::pipeline::{PipelineRunner, ProgressSink, RunOutcome, RunReport, RunRequest, Stage};
use crate::scheduler::RunTrigger;

pub const SCHEDULER_CALLER: &str = "scheduler";
const CANCELLED: &str = "cancelled";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("task not found: {0}")]
    NotFound(String),
    #[error("cannot infer market/trade_date from task {0}")]
    Uninferable(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error(transparent)]
    TradeDate(#[from] MarketTimeError),
}

#[derive(Debug, Clone, Default)]
pub struct TriggerRequest {
    pub market: String,
    pub trade_date: String,
    /// Falls back to the configured pre-open offsets.
    pub deadlines: Option<DeadlinesSpec>,
    /// Defaults to the task id.
    pub dedupe_key: Option<String>,
    pub force: bool,
    pub async_run: bool,
    pub caller: String,
    pub env: String,
}

impl TriggerRequest {
    pub fn new(market: impl Into<String>, trade_date: impl Into<String>) -> Self {
        Self {
            market: market.into(),
            trade_date: trade_date.into(),
            ..Self::default()
        }
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    pub fn background(mut self) -> Self {
        self.async_run = true;
        self
    }

    pub fn with_dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    pub fn with_deadlines(mut self, spec: DeadlinesSpec) -> Self {
        self.deadlines = Some(spec);
        self
    }

    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = caller.into();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRequest {
    pub market: String,
    pub trade_date: String,
    pub deadlines: DeadlinesSpec,
    pub dedupe_key: Option<String>,
    pub async_run: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobMetrics {
    pub elapsed_ms: u64,
    pub caller: String,
    pub env: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_of: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    pub task_id: String,
    pub status: JobStatus,
    pub stage: Stage,
    pub percent: u8,
    pub started_at: DateTime<Utc>,
    pub errors: Vec<String>,
    pub metrics: JobMetrics,
    pub request: JobRequest,
    pub deadlines: DeadlineSchedule,
    pub retry_of: Option<String>,
    pub report: Option<RunReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Accepted {
    pub task_id: String,
    pub status: JobStatus,
    pub deadlines: DeadlineSchedule,
    /// `false` when an existing job was returned for the dedupe key.
    pub created: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CancelResponse {
    pub task_id: String,
    pub previous_status: JobStatus,
    pub new_status: JobStatus,
    pub accepted: bool,
}

pub fn task_id_for(market: &str, trade_date: &str) -> String {
    format!("preopen_{market}_{trade_date}")
}

fn task_id_re() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"^preopen_(.+)_(\d{4}-\d{2}-\d{2})$").expect("valid task id regex"))
}

struct Slot {
    record: JobRecord,
    generation: u64,
    cancel: Arc<AtomicBool>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, Slot>,
    dedupe: HashMap<String, String>,
    generation: u64,
}

type Shared = Arc<Mutex<Inner>>;

fn lock(inner: &Shared) -> std::sync::MutexGuard<'_, Inner> {
    inner.lock().expect("job registry mutex poisoned")
}

/// Writes stage/percent into the job while its generation is current.
struct JobProgress {
    inner: Shared,
    task_id: String,
    generation: u64,
    cancel: Arc<AtomicBool>,
}

impl ProgressSink for JobProgress {
    fn on_stage(&self, stage: Stage) -> ControlFlow<()> {
        let cancelled = self.cancel.load(Ordering::SeqCst);
        let mut g = lock(&self.inner);
        if let Some(slot) = g.jobs.get_mut(&self.task_id) {
            if slot.generation == self.generation && !cancelled {
                slot.record.stage = stage;
                slot.record.percent = stage.percent();
                if slot.record.status == JobStatus::Pending {
                    slot.record.status = JobStatus::Running;
                }
            }
        }
        if cancelled {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }
}

fn finish(inner: &Shared, task_id: &str, generation: u64, started: Instant, outcome: RunOutcome) {
    let mut g = lock(inner);
    let Some(slot) = g.jobs.get_mut(task_id) else { return };
    if slot.generation != generation {
        tracing::debug!(target: "jobs", task_id, "superseded run finished; result dropped");
        return;
    }
    let rec = &mut slot.record;
    rec.metrics.elapsed_ms = started.elapsed().as_millis() as u64;
    match outcome {
        RunOutcome::Completed(report) => {
            if rec.status != JobStatus::Failed {
                rec.status = JobStatus::Completed;
                rec.stage = Stage::Done;
                rec.percent = Stage::Done.percent();
            }
            rec.report = Some(report);
        }
        RunOutcome::Cancelled => {
            rec.status = JobStatus::Failed;
            if !rec.errors.iter().any(|e| e == CANCELLED) {
                rec.errors.push(CANCELLED.to_string());
            }
        }
        RunOutcome::Failed(msg) => {
            rec.status = JobStatus::Failed;
            rec.errors.push(msg);
        }
    }
    tracing::info!(
        target: "jobs",
        task_id,
        status = ?rec.status,
        elapsed_ms = rec.metrics.elapsed_ms,
        "job finished"
    );
}

fn fail_panicked(inner: &Shared, task_id: &str, generation: u64, err: String) {
    let mut g = lock(inner);
    if let Some(slot) = g.jobs.get_mut(task_id) {
        if slot.generation == generation {
            slot.record.status = JobStatus::Failed;
            slot.record.errors.push(err);
        }
    }
}

pub struct JobRegistry {
    inner: Shared,
    runner: Arc<dyn PipelineRunner>,
    preopen: PreopenConfig,
    clock: Arc<dyn Clock>,
}

impl JobRegistry {
    pub fn new(runner: Arc<dyn PipelineRunner>, preopen: PreopenConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            runner,
            preopen,
            clock,
        }
    }

    pub async fn trigger(&self, req: TriggerRequest) -> Result<Accepted, JobError> {
        let market = req.market.trim().to_string();
        if market.is_empty() {
            return Err(JobError::Invalid("market is empty".into()));
        }
        let date = parse_trade_date(&req.trade_date)?;
        let trade_date = req.trade_date.trim().to_string();
        let spec = req.deadlines.unwrap_or_else(|| self.preopen.default_deadlines());
        let deadlines = compute_deadlines(&market, date, &spec);
        let task_id = task_id_for(&market, &trade_date);
        let key = req.dedupe_key.clone().unwrap_or_else(|| task_id.clone());

        let (generation, cancel) = {
            let mut g = lock(&self.inner);
            if !req.force {
                let existing = g
                    .dedupe
                    .get(&key)
                    .and_then(|id| g.jobs.get(id))
                    .map(|slot| Accepted {
                        task_id: slot.record.task_id.clone(),
                        status: slot.record.status,
                        deadlines: slot.record.deadlines.clone(),
                        created: false,
                    });
                if let Some(acc) = existing {
                    tracing::info!(target: "jobs", task_id = %acc.task_id, dedupe_key = %key, "deduplicated trigger");
                    return Ok(acc);
                }
            }
            g.generation += 1;
            let generation = g.generation;
            let cancel = Arc::new(AtomicBool::new(false));
            let record = JobRecord {
                task_id: task_id.clone(),
                status: JobStatus::Pending,
                stage: Stage::Scheduler,
                percent: Stage::Scheduler.percent(),
                started_at: self.clock.now_utc(),
                errors: Vec::new(),
                metrics: JobMetrics {
                    elapsed_ms: 0,
                    caller: req.caller.clone(),
                    env: req.env.clone(),
                    retry_of: None,
                },
                request: JobRequest {
                    market: market.clone(),
                    trade_date: trade_date.clone(),
                    deadlines: spec,
                    dedupe_key: Some(key.clone()),
                    async_run: req.async_run,
                },
                deadlines: deadlines.clone(),
                retry_of: None,
                report: None,
            };
            g.jobs.insert(
                task_id.clone(),
                Slot {
                    record,
                    generation,
                    cancel: cancel.clone(),
                },
            );
            g.dedupe.insert(key, task_id.clone());
            (generation, cancel)
        };

        tracing::info!(
            target: "jobs",
            task_id = %task_id,
            market = %market,
            trade_date = %trade_date,
            caller = %req.caller,
            force = req.force,
            generation,
            "job accepted"
        );

        let run_req = RunRequest {
            market,
            trade_date,
            deadlines: deadlines.clone(),
        };
        self.launch(task_id.clone(), generation, cancel, run_req, req.async_run)
            .await;

        Ok(Accepted {
            status: self.status_of(&task_id).unwrap_or(JobStatus::Pending),
            task_id,
            deadlines,
            created: true,
        })
    }

    /// New job `{id}_retry{N}` from the original request. Not deduplicated.
    pub async fn retry(&self, task_id: &str, async_run: bool) -> Result<Accepted, JobError> {
        let (new_id, generation, cancel, run_req) = {
            let mut g = lock(&self.inner);
            let orig = g
                .jobs
                .get(task_id)
                .map(|s| s.record.clone())
                .ok_or_else(|| JobError::NotFound(task_id.to_string()))?;

            let mut market = orig.request.market.clone();
            let mut trade_date = orig.request.trade_date.clone();
            if market.is_empty() || trade_date.is_empty() {
                let caps = task_id_re()
                    .captures(task_id)
                    .ok_or_else(|| JobError::Uninferable(task_id.to_string()))?;
                if market.is_empty() {
                    market = caps[1].to_string();
                }
                if trade_date.is_empty() {
                    trade_date = caps[2].to_string();
                }
            }
            let date = parse_trade_date(&trade_date)?;
            let spec = orig.request.deadlines;
            let deadlines = compute_deadlines(&market, date, &spec);

            let mut n = 1u32;
            while g.jobs.contains_key(&format!("{task_id}_retry{n}")) {
                n += 1;
            }
            let new_id = format!("{task_id}_retry{n}");

            g.generation += 1;
            let generation = g.generation;
            let cancel = Arc::new(AtomicBool::new(false));
            let record = JobRecord {
                task_id: new_id.clone(),
                status: JobStatus::Pending,
                stage: Stage::Scheduler,
                percent: Stage::Scheduler.percent(),
                started_at: self.clock.now_utc(),
                errors: Vec::new(),
                metrics: JobMetrics {
                    elapsed_ms: 0,
                    caller: orig.metrics.caller.clone(),
                    env: orig.metrics.env.clone(),
                    retry_of: Some(task_id.to_string()),
                },
                request: JobRequest {
                    market: market.clone(),
                    trade_date: trade_date.clone(),
                    deadlines: spec,
                    dedupe_key: None,
                    async_run,
                },
                deadlines: deadlines.clone(),
                retry_of: Some(task_id.to_string()),
                report: None,
            };
            g.jobs.insert(
                new_id.clone(),
                Slot {
                    record,
                    generation,
                    cancel: cancel.clone(),
                },
            );
            let run_req = RunRequest {
                market,
                trade_date,
                deadlines,
            };
            (new_id, generation, cancel, run_req)
        };

        tracing::info!(target: "jobs", task_id = %new_id, retry_of = task_id, "retry accepted");
        let deadlines = run_req.deadlines.clone();
        self.launch(new_id.clone(), generation, cancel, run_req, async_run)
            .await;

        Ok(Accepted {
            status: self.status_of(&new_id).unwrap_or(JobStatus::Pending),
            task_id: new_id,
            deadlines,
            created: true,
        })
    }

    /// Cooperative cancel. A job still at its first checkpoint fails right away.
    pub fn cancel(&self, task_id: &str, force: bool) -> Result<CancelResponse, JobError> {
        let mut g = lock(&self.inner);
        let slot = g
            .jobs
            .get_mut(task_id)
            .ok_or_else(|| JobError::NotFound(task_id.to_string()))?;
        let prev = slot.record.status;
        if prev.is_terminal() && !force {
            return Ok(CancelResponse {
                task_id: task_id.to_string(),
                previous_status: prev,
                new_status: prev,
                accepted: false,
            });
        }
        slot.cancel.store(true, Ordering::SeqCst);
        if slot.record.stage == Stage::Scheduler {
            slot.record.status = JobStatus::Failed;
            if !slot.record.errors.iter().any(|e| e == CANCELLED) {
                slot.record.errors.push(CANCELLED.to_string());
            }
        }
        tracing::info!(target: "jobs", task_id, force, "cancel requested");
        Ok(CancelResponse {
            task_id: task_id.to_string(),
            previous_status: prev,
            new_status: slot.record.status,
            accepted: true,
        })
    }

    pub fn get(&self, task_id: &str) -> Option<JobRecord> {
        lock(&self.inner).jobs.get(task_id).map(|s| s.record.clone())
    }

    /// All jobs, oldest first.
    pub fn list(&self) -> Vec<JobRecord> {
        let mut v: Vec<JobRecord> = lock(&self.inner)
            .jobs
            .values()
            .map(|s| s.record.clone())
            .collect();
        v.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.task_id.cmp(&b.task_id)));
        v
    }

    pub fn has_job_for(&self, market: &str, trade_date: &str) -> bool {
        let id = task_id_for(market, trade_date);
        let g = lock(&self.inner);
        g.dedupe.contains_key(&id) || g.jobs.contains_key(&id)
    }

    fn status_of(&self, task_id: &str) -> Option<JobStatus> {
        lock(&self.inner).jobs.get(task_id).map(|s| s.record.status)
    }

    /// Runs the pipeline on its own task so a panic is caught by the join.
    /// Inline runs wait for it; background runs return immediately.
    async fn launch(
        &self,
        task_id: String,
        generation: u64,
        cancel: Arc<AtomicBool>,
        run_req: RunRequest,
        async_run: bool,
    ) {
        let inner = self.inner.clone();
        let runner = self.runner.clone();
        let started = Instant::now();

        let sink = JobProgress {
            inner: inner.clone(),
            task_id: task_id.clone(),
            generation,
            cancel,
        };
        let worker = {
            let inner = inner.clone();
            let task_id = task_id.clone();
            tokio::spawn(async move {
                let outcome = runner.run(&run_req, &sink).await;
                finish(&inner, &task_id, generation, started, outcome);
            })
        };
        let guard = async move {
            if let Err(e) = worker.await {
                tracing::error!(target: "jobs", task_id = %task_id, error = ?e, "pipeline worker panicked");
                fail_panicked(&inner, &task_id, generation, format!("worker panicked: {e}"));
            }
        };
        if async_run {
            tokio::spawn(guard);
        } else {
            guard.await;
        }
    }
}

#[async_trait]
impl RunTrigger for JobRegistry {
    async fn trigger_run(&self, market: &str, trade_date: &str) -> anyhow::Result<String> {
        let acc = self
            .trigger(
                TriggerRequest::new(market, trade_date)
                    .background()
                    .with_caller(SCHEDULER_CALLER),
            )
            .await?;
        Ok(acc.task_id)
    }

    fn has_job_for(&self, market: &str, trade_date: &str) -> bool {
        JobRegistry::has_job_for(self, market, trade_date)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::metrics::{RunCounts, StageTimings};
    use crate::plan::PlanValidation;
    use crate::pipeline::PlanSummary;
    use std::sync::atomic::AtomicUsize;

    /// Walks every checkpoint and completes with an empty report.
    struct Walker {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl PipelineRunner for Walker {
        async fn run(&self, req: &RunRequest, progress: &dyn ProgressSink) -> RunOutcome {
            self.runs.fetch_add(1, Ordering::SeqCst);
            for s in [Stage::Scheduler, Stage::Ingestion, Stage::Plan] {
                if progress.on_stage(s).is_break() {
                    let _ = progress.on_stage(Stage::Done);
                    return RunOutcome::Cancelled;
                }
            }
            let _ = progress.on_stage(Stage::Done);
            RunOutcome::Completed(RunReport {
                market: req.market.clone(),
                trade_date: req.trade_date.clone(),
                deadlines: req.deadlines.clone(),
                counts: RunCounts::default(),
                timings_ms: StageTimings::default(),
                top_titles: vec![],
                plan: PlanSummary {
                    entries: 0,
                    validation: PlanValidation::default(),
                },
            })
        }
    }

    fn registry() -> (JobRegistry, Arc<Walker>) {
        let w = Arc::new(Walker {
            runs: AtomicUsize::new(0),
        });
        let reg = JobRegistry::new(w.clone(), PreopenConfig::default(), Arc::new(SystemClock::default()));
        (reg, w)
    }

    #[tokio::test]
    async fn inline_run_completes_with_default_deadlines() {
        let (reg, _) = registry();
        let acc = reg.trigger(TriggerRequest::new("SSE", "2025-01-06")).await.unwrap();
        assert_eq!(acc.task_id, "preopen_SSE_2025-01-06");
        assert!(acc.created);
        assert_eq!(acc.status, JobStatus::Completed);
        assert_eq!(acc.deadlines.fetch, "T-45");
        let job = reg.get(&acc.task_id).unwrap();
        assert_eq!(job.percent, 100);
        assert!(job.report.is_some());
        assert!(reg.has_job_for("SSE", "2025-01-06"));
        assert!(!reg.has_job_for("SSE", "2025-01-07"));
    }

    #[tokio::test]
    async fn bad_trade_date_is_rejected() {
        let (reg, _) = registry();
        let err = reg.trigger(TriggerRequest::new("SSE", "06/01/2025")).await.unwrap_err();
        assert!(matches!(err, JobError::TradeDate(_)));
        let err = reg.trigger(TriggerRequest::new(" ", "2025-01-06")).await.unwrap_err();
        assert!(matches!(err, JobError::Invalid(_)));
    }

    #[tokio::test]
    async fn retry_ids_take_smallest_free_suffix() {
        let (reg, w) = registry();
        let orig = reg.trigger(TriggerRequest::new("SSE", "2025-01-06")).await.unwrap();
        let r1 = reg.retry(&orig.task_id, false).await.unwrap();
        let r2 = reg.retry(&orig.task_id, false).await.unwrap();
        assert_eq!(r1.task_id, "preopen_SSE_2025-01-06_retry1");
        assert_eq!(r2.task_id, "preopen_SSE_2025-01-06_retry2");
        assert_eq!(reg.get(&r1.task_id).unwrap().retry_of.as_deref(), Some(orig.task_id.as_str()));
        assert_eq!(w.runs.load(Ordering::SeqCst), 3);
        assert!(matches!(reg.retry("nope", false).await, Err(JobError::NotFound(_))));
        assert_eq!(reg.list().len(), 3);
    }

    #[tokio::test]
    async fn cancel_terminal_job_without_force_is_noop() {
        let (reg, _) = registry();
        let acc = reg.trigger(TriggerRequest::new("SSE", "2025-01-06")).await.unwrap();
        let c = reg.cancel(&acc.task_id, false).unwrap();
        assert!(!c.accepted);
        assert_eq!(c.new_status, JobStatus::Completed);
        let c = reg.cancel(&acc.task_id, true).unwrap();
        assert!(c.accepted);
        assert!(reg.cancel("missing", false).is_err());
    }
}
