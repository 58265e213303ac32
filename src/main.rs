//! Pre-open news service binary entrypoint.
//! Loads config, wires the stores and the pipeline, starts the scheduler and
//! serves `/health` and `/metrics`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{extract::State, routing::get, Json, Router};
use serde_json::json;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use preopen_news::alerts::AlertLog;
use preopen_news::analyze::entities::{DictionaryResolver, EntityResolver};
use preopen_news::analyze::tagger::build_tagger;
use preopen_news::clock::{Clock, SystemClock};
use preopen_news::config::AppConfig;
use preopen_news::ingest::http_cache::ConditionalCache;
use preopen_news::ingest::{build_http_client, Ingestor};
use preopen_news::intraday::TradingHoursGate;
use preopen_news::jobs::JobRegistry;
use preopen_news::market_time::{TradingCalendar, WeekdayCalendar};
use preopen_news::metrics::{Metrics, RunMetrics};
use preopen_news::pipeline::PreopenPipeline;
use preopen_news::scheduler::{Scheduler, SchedulerView};
use preopen_news::storage::{MemoryStore, PipelineStore};

/// Compact logs by default; `LOG_FORMAT=json` switches to JSON lines.
/// Filter comes from `RUST_LOG`, falling back to `info`.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

#[derive(Clone)]
struct AppState {
    scheduler: Option<SchedulerView>,
    run_metrics: Arc<RunMetrics>,
    alerts: Arc<AlertLog>,
    ingestor: Arc<Ingestor>,
    jobs: Arc<JobRegistry>,
}

async fn health(State(app): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "scheduler": app.scheduler.as_ref().map(SchedulerView::snapshot),
        "metrics": app.run_metrics.snapshot(),
        "ingestion_per_source": app.ingestor.source_stats().snapshot(),
        "http_cache": app.ingestor.http_cache_summary(),
        "jobs": app.jobs.list().len(),
        "alerts": app.alerts.recent(),
    }))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = ?e, "ctrl_c handler failed");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let cfg = Arc::new(AppConfig::load_default()?);
    tracing::info!(market = %cfg.market, sources = cfg.sources.len(), "config loaded");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(cfg.utc_offset_minutes));
    let calendar: Arc<dyn TradingCalendar> = Arc::new(WeekdayCalendar::from_config(&cfg.market_calendar));
    let metrics = Metrics::init(cfg.scoring.top_n)?;
    let run_metrics = Arc::new(RunMetrics::default());
    let alerts = Arc::new(AlertLog::with_capacity(cfg.alerts.max_events));

    let http = build_http_client(&cfg.network)?;
    let cache = Arc::new(ConditionalCache::load(cfg.storage.http_cache_path.clone()));
    let ingestor = Arc::new(Ingestor::with_http(http, cache, clock.clone()));

    let resolver = DictionaryResolver::load(&cfg.storage.entities_path);
    tracing::info!(symbols = resolver.len(), "entity dictionary loaded");
    let resolver: Arc<dyn EntityResolver> = Arc::new(resolver);
    let tagger = build_tagger(&cfg.llm, &cfg.tagging, run_metrics.clone());
    let store: Arc<dyn PipelineStore> = Arc::new(MemoryStore::new());

    let pipeline = Arc::new(PreopenPipeline::new(
        cfg.clone(),
        ingestor.clone(),
        resolver,
        tagger,
        store,
        run_metrics.clone(),
        clock.clone(),
    ));
    let jobs = Arc::new(JobRegistry::new(pipeline, cfg.preopen.clone(), clock.clone()));

    let scheduler = if cfg.scheduler.enabled {
        let watcher = Arc::new(TradingHoursGate::new(calendar.clone()));
        Some(
            Scheduler::new(
                cfg.market.clone(),
                cfg.preopen.first_fetch_minutes_before_open,
                cfg.scheduler.clone(),
                clock.clone(),
                calendar,
                jobs.clone(),
                watcher,
                alerts.clone(),
            )
            .spawn(),
        )
    } else {
        tracing::info!("scheduler disabled");
        None
    };

    let state = AppState {
        scheduler: scheduler.as_ref().map(|h| h.view()),
        run_metrics,
        alerts,
        ingestor,
        jobs,
    };
    let app = Router::new()
        .route("/health", get(health))
        .with_state(state)
        .merge(metrics.router());

    let listener = tokio::net::TcpListener::bind(&cfg.server.bind)
        .await
        .with_context(|| format!("binding {}", cfg.server.bind))?;
    tracing::info!(bind = %cfg.server.bind, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving http")?;

    if let Some(handle) = scheduler {
        if !handle.stop(Duration::from_secs(5)).await {
            tracing::warn!("scheduler did not stop within 5s");
        }
    }
    Ok(())
}
