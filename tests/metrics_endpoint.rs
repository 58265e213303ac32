// tests/metrics_endpoint.rs
//
// The Prometheus recorder is process-global, so this file installs it once
// and drives a single empty pipeline run before scraping /metrics.

use std::sync::Arc;

use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use chrono::NaiveDate;
use tower::ServiceExt;

use preopen_news::analyze::entities::DictionaryResolver;
use preopen_news::analyze::tagger::RuleTagger;
use preopen_news::clock::ManualClock;
use preopen_news::config::AppConfig;
use preopen_news::ingest::http_cache::ConditionalCache;
use preopen_news::ingest::Ingestor;
use preopen_news::market_time::{compute_deadlines, DeadlinesSpec};
use preopen_news::metrics::{Metrics, RunMetrics};
use preopen_news::pipeline::{NoProgress, PipelineRunner, PreopenPipeline, RunOutcome, RunRequest};
use preopen_news::storage::MemoryStore;

#[tokio::test]
async fn metrics_endpoint_exposes_pipeline_series() {
    let metrics = Metrics::init(7).expect("recorder installs once per process");

    let date = NaiveDate::from_ymd_opt(2025, 1, 6).unwrap();
    let clock = Arc::new(ManualClock::new(date.and_hms_opt(8, 30, 0).unwrap()));
    let ingestor = Ingestor::with_http(
        reqwest::Client::new(),
        Arc::new(ConditionalCache::in_memory()),
        clock.clone(),
    );
    let pipeline = PreopenPipeline::new(
        Arc::new(AppConfig::default()),
        Arc::new(ingestor),
        Arc::new(DictionaryResolver::default()),
        Arc::new(RuleTagger::default()),
        Arc::new(MemoryStore::new()),
        Arc::new(RunMetrics::default()),
        clock,
    );
    let req = RunRequest {
        market: "SSE".into(),
        trade_date: "2025-01-06".into(),
        deadlines: compute_deadlines("SSE", date, &DeadlinesSpec::default()),
    };
    assert!(matches!(
        pipeline.run(&req, &NoProgress).await,
        RunOutcome::Completed(_)
    ));

    let resp = metrics
        .router()
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = body::to_bytes(resp.into_body(), 1_048_576).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();

    for needle in [
        "preopen_config_top_n",
        "ingest_runs_total",
        "pipeline_runs_total{outcome=\"completed\"}",
        "pipeline_stage_ms",
    ] {
        assert!(text.contains(needle), "missing {needle:?} in:\n{text}");
    }
}
