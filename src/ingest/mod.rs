// src/ingest/mod.rs
pub mod canon;
pub mod http;
pub mod http_cache;
pub mod providers;
pub mod types;

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::clock::Clock;
use crate::config::{AppConfig, NetworkConfig};
use crate::ingest::canon::make_dedup_key;
use crate::ingest::http::ConditionalClient;
use crate::ingest::http_cache::{CacheStatsSnapshot, ConditionalCache};
use crate::ingest::providers::{rest::RestFetcher, rss::RssFetcher};
use crate::ingest::types::{FetchRequest, RawItem, SourceFetcher, SourceIngestStat, SourceKind};

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_runs_total", "Ingestion runs across all sources.");
        describe_counter!(
            "ingest_kept_total",
            "Items kept after cross-source deduplication."
        );
        describe_counter!(
            "ingest_dedup_total",
            "Items dropped as duplicates of an earlier item."
        );
        describe_counter!(
            "ingest_provider_errors_total",
            "Sources that ended a run with an error."
        );
        describe_counter!(
            "http_conditional_sent_total",
            "Requests sent with If-None-Match / If-Modified-Since."
        );
        describe_counter!("http_not_modified_total", "HTTP 304 responses.");
        describe_counter!("http_ok_total", "HTTP 2xx responses.");
        describe_histogram!("ingest_parse_ms", "Feed parse time in milliseconds.");
        describe_histogram!("ingest_fetch_ms", "Per-source fetch time in milliseconds.");
        describe_gauge!(
            "ingest_pipeline_last_run_ts",
            "Unix ts when ingestion last ran."
        );
    });
}

/// Per-source stats of the most recent run only; each run replaces the map.
#[derive(Debug, Default)]
pub struct SourceStatsStore {
    inner: RwLock<BTreeMap<String, SourceIngestStat>>,
}

impl SourceStatsStore {
    pub fn replace(&self, stats: BTreeMap<String, SourceIngestStat>) {
        *self.inner.write().expect("source stats lock poisoned") = stats;
    }

    pub fn snapshot(&self) -> BTreeMap<String, SourceIngestStat> {
        self.inner.read().expect("source stats lock poisoned").clone()
    }
}

/// Conditional-cache counters per protocol plus the combined view.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct HttpCacheSummary {
    pub rss: CacheStatsSnapshot,
    pub rest: CacheStatsSnapshot,
    pub total: CacheStatsSnapshot,
}

pub fn build_http_client(net: &NetworkConfig) -> anyhow::Result<reqwest::Client> {
    use anyhow::Context;
    reqwest::Client::builder()
        .user_agent(net.user_agent.clone())
        .connect_timeout(Duration::from_secs(4))
        .timeout(Duration::from_secs_f64(net.timeout_sec.clamp(0.1, 300.0)))
        .build()
        .context("building reqwest client")
}

/// Fans out over configured sources with bounded concurrency and shared dedup.
pub struct Ingestor {
    rss: Arc<dyn SourceFetcher>,
    rest: Arc<dyn SourceFetcher>,
    stats: Arc<SourceStatsStore>,
}

impl Ingestor {
    pub fn new(rss: Arc<dyn SourceFetcher>, rest: Arc<dyn SourceFetcher>) -> Self {
        Self {
            rss,
            rest,
            stats: Arc::new(SourceStatsStore::default()),
        }
    }

    /// Production wiring: both protocols share one HTTP client and one validator cache.
    pub fn with_http(
        http: reqwest::Client,
        cache: Arc<ConditionalCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let rss = RssFetcher::new(ConditionalClient::new(http.clone(), cache.clone(), clock.clone()));
        let rest = RestFetcher::new(ConditionalClient::new(http, cache, clock));
        Self::new(Arc::new(rss), Arc::new(rest))
    }

    pub fn source_stats(&self) -> &Arc<SourceStatsStore> {
        &self.stats
    }

    pub fn http_cache_summary(&self) -> HttpCacheSummary {
        let rss = self.rss.cache_stats();
        let rest = self.rest.cache_stats();
        HttpCacheSummary {
            rss,
            rest,
            total: CacheStatsSnapshot::combine([&rss, &rest]),
        }
    }

    fn fetcher_for(&self, kind: SourceKind) -> Arc<dyn SourceFetcher> {
        match kind {
            SourceKind::Rss => self.rss.clone(),
            SourceKind::Rest => self.rest.clone(),
        }
    }

    /// Fetch every configured source, dedup across sources (first wins) and
    /// replace the per-source stats. Never fails: broken sources contribute
    /// nothing and carry their error in the stats.
    pub async fn fetch_from_all_sources(
        &self,
        cfg: &AppConfig,
        market: &str,
        trade_date: &str,
    ) -> Vec<RawItem> {
        ensure_metrics_described();
        let t0 = Instant::now();

        let sem = Arc::new(Semaphore::new(cfg.network.concurrency.max(1)));
        let seen: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));

        let mut handles = Vec::with_capacity(cfg.sources.len());
        for src in &cfg.sources {
            let req = FetchRequest::from_source(src, &cfg.network);
            let sid = req.source_id.clone();
            let fetcher = self.fetcher_for(src.kind);
            let sem = sem.clone();
            let seen = seen.clone();
            let handle = tokio::spawn(async move {
                // permits are never closed, so acquire only fails if the semaphore is dropped
                let _permit = sem.acquire_owned().await.ok();
                let started = Instant::now();
                let outcome = fetcher.fetch(&req).await;
                let fetched = outcome.items.len();

                let mut kept = Vec::with_capacity(fetched);
                {
                    let mut seen = seen.lock().expect("seen set mutex poisoned");
                    for it in outcome.items {
                        let key = make_dedup_key(it.url.as_deref(), it.title.as_deref());
                        if key.is_empty() || !seen.insert(key) {
                            continue;
                        }
                        kept.push(RawItem {
                            source_id: req.source_id.clone(),
                            url: it.url,
                            title: it.title,
                            published_at: it.published_at,
                        });
                    }
                }

                let ms = started.elapsed().as_millis() as u64;
                histogram!("ingest_fetch_ms").record(ms as f64);
                let stat = SourceIngestStat {
                    attempted: 1,
                    fetched,
                    kept: kept.len(),
                    duration_ms: ms,
                    fallback_used: false,
                    error: outcome.error,
                };
                (kept, stat)
            });
            handles.push((sid, handle));
        }

        let mut out = Vec::new();
        let mut stats = BTreeMap::new();
        for (sid, handle) in handles {
            let (mut kept, stat) = match handle.await {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = ?e, source = %sid, "fetch task failed");
                    (
                        Vec::new(),
                        SourceIngestStat {
                            attempted: 1,
                            error: Some(format!("fetch task failed: {e}")),
                            ..SourceIngestStat::default()
                        },
                    )
                }
            };
            if let Some(err) = &stat.error {
                tracing::warn!(error = %err, provider = %sid, "provider error");
                counter!("ingest_provider_errors_total").increment(1);
            }
            out.append(&mut kept);
            stats.insert(sid, stat);
        }

        let fetched_total: usize = stats.values().map(|s| s.fetched).sum();
        let dedup_total = fetched_total.saturating_sub(out.len());

        counter!("ingest_runs_total").increment(1);
        counter!("ingest_kept_total").increment(out.len() as u64);
        counter!("ingest_dedup_total").increment(dedup_total as u64);
        gauge!("ingest_pipeline_last_run_ts").set(chrono::Utc::now().timestamp() as f64);

        tracing::info!(
            target: "ingest",
            market,
            trade_date,
            sources = stats.len(),
            fetched = fetched_total,
            kept = out.len(),
            dedup = dedup_total,
            elapsed_ms = t0.elapsed().as_millis() as u64,
            "ingestion run finished"
        );

        self.stats.replace(stats);
        out
    }
}
