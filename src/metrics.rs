// src/metrics.rs
//! Run-level metrics: the Prometheus exporter behind `/metrics`, and the
//! in-process `RunMetrics` collector (recent runs, totals, latency
//! percentiles, classifier call stats).

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use anyhow::Context;
use axum::{routing::get, Router};
use chrono::{DateTime, Utc};
use metrics::gauge;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};

use crate::ingest::types::SourceIngestStat;
use crate::ingest::HttpCacheSummary;

pub const DEFAULT_RECENT_RUNS: usize = 10;

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder. Fails if one is already installed.
    pub fn init(top_n: usize) -> anyhow::Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("prometheus: install recorder")?;

        gauge!("preopen_config_top_n").set(top_n as f64);

        Ok(Self { handle })
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunCounts {
    pub ingested: usize,
    pub normalized: usize,
    pub topn: usize,
}

/// Share of normalized items whose link / content hash repeated an earlier one.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct DedupeRates {
    pub link: f64,
    pub content: f64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageTimings {
    pub ingestion: u64,
    pub normalize: u64,
    pub score: u64,
    pub select: u64,
}

impl StageTimings {
    pub fn total(&self) -> u64 {
        self.ingestion + self.normalize + self.score + self.select
    }
}

/// Group → item count, before and after selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DiversitySnapshot {
    pub pre: BTreeMap<String, usize>,
    pub post: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sector_cap_pct: Option<u32>,
}

/// Flat per-run record handed to the collector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub market: String,
    pub trade_date: String,
    pub as_of: DateTime<Utc>,
    pub counts: RunCounts,
    pub dedupe_rate: f64,
    pub dedupe: DedupeRates,
    pub timings_ms: Option<StageTimings>,
    pub ingestion_per_source: BTreeMap<String, SourceIngestStat>,
    pub diversity: DiversitySnapshot,
    pub source_diversity: DiversitySnapshot,
    pub http_cache: HttpCacheSummary,
    pub error: Option<String>,
}

impl RunSummary {
    /// Summary for a run that never produced counts.
    pub fn failed(market: &str, trade_date: &str, as_of: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            market: market.to_string(),
            trade_date: trade_date.to_string(),
            as_of,
            counts: RunCounts::default(),
            dedupe_rate: 0.0,
            dedupe: DedupeRates::default(),
            timings_ms: None,
            ingestion_per_source: BTreeMap::new(),
            diversity: DiversitySnapshot::default(),
            source_diversity: DiversitySnapshot::default(),
            http_cache: HttpCacheSummary::default(),
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Percentiles {
    pub p50: u64,
    pub p90: u64,
    pub p99: u64,
}

impl Percentiles {
    /// Nearest-rank: `idx = ceil(p·len) − 1`, clamped into range.
    pub fn nearest_rank(values: &[u64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let mut v = values.to_vec();
        v.sort_unstable();
        let pick = |p: f64| {
            let idx = ((p * v.len() as f64).ceil() as usize).saturating_sub(1);
            v[idx.min(v.len() - 1)]
        };
        Self {
            p50: pick(0.5),
            p90: pick(0.9),
            p99: pick(0.99),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClassifierSnapshot {
    pub calls: u64,
    pub success: u64,
    pub failure: u64,
    pub cache_hits: u64,
    pub latency_ms: Percentiles,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MetricsSnapshot {
    pub runs: u64,
    pub success: u64,
    pub failure: u64,
    pub recent_runs: usize,
    pub last: Option<RunSummary>,
    pub latency_ms: Percentiles,
    pub classifier: ClassifierSnapshot,
}

#[derive(Debug, Default)]
struct Inner {
    recent: VecDeque<RunSummary>,
    runs: u64,
    success: u64,
    failure: u64,
    classifier_calls: u64,
    classifier_success: u64,
    classifier_failure: u64,
    classifier_cache_hits: u64,
    classifier_latencies: Vec<u64>,
}

/// Most recent runs (bounded), process totals and classifier stats.
#[derive(Debug)]
pub struct RunMetrics {
    inner: Mutex<Inner>,
    cap: usize,
}

impl Default for RunMetrics {
    fn default() -> Self {
        Self::new(DEFAULT_RECENT_RUNS)
    }
}

impl RunMetrics {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            cap: cap.max(1),
        }
    }

    pub fn record_run(&self, summary: RunSummary) {
        let mut g = self.inner.lock().expect("run metrics mutex poisoned");
        g.runs += 1;
        if summary.error.is_some() {
            g.failure += 1;
        } else {
            g.success += 1;
        }
        g.recent.push_back(summary);
        while g.recent.len() > self.cap {
            g.recent.pop_front();
        }
    }

    pub fn record_classifier_call(&self, outcome: CallOutcome, duration_ms: u64, cache_hit: bool) {
        let mut g = self.inner.lock().expect("run metrics mutex poisoned");
        g.classifier_calls += 1;
        if cache_hit {
            g.classifier_cache_hits += 1;
        }
        match outcome {
            CallOutcome::Success => g.classifier_success += 1,
            CallOutcome::Failure => g.classifier_failure += 1,
        }
        g.classifier_latencies.push(duration_ms);
        // keep memory flat on long-lived processes
        if g.classifier_latencies.len() > 10_000 {
            let excess = g.classifier_latencies.len() - 10_000;
            g.classifier_latencies.drain(0..excess);
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let g = self.inner.lock().expect("run metrics mutex poisoned");
        let run_latencies: Vec<u64> = g
            .recent
            .iter()
            .filter_map(|r| r.timings_ms.map(|t| t.total()))
            .collect();
        MetricsSnapshot {
            runs: g.runs,
            success: g.success,
            failure: g.failure,
            recent_runs: g.recent.len(),
            last: g.recent.back().cloned(),
            latency_ms: Percentiles::nearest_rank(&run_latencies),
            classifier: ClassifierSnapshot {
                calls: g.classifier_calls,
                success: g.classifier_success,
                failure: g.classifier_failure,
                cache_hits: g.classifier_cache_hits,
                latency_ms: Percentiles::nearest_rank(&g.classifier_latencies),
            },
        }
    }
}
