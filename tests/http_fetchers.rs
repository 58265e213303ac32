// tests/http_fetchers.rs
//
// Conditional-request fetchers against a local axum server on 127.0.0.1:0.
// A ManualClock stands in for real sleeps so Retry-After and backoff are
// observed without waiting.
//
// Covered:
// - ETag round trip: 200 then 304, counters, persisted validators
// - 429 + Retry-After honored before the retry
// - exhausted retries report the last status
// - absurd Retry-After values are clamped instead of crashing the fetch
// - REST query params, item path and field mapping
// - malformed REST payload is not retried

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::Query,
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use chrono::NaiveDate;
use serde_json::json;

use preopen_news::clock::ManualClock;
use preopen_news::config::{NetworkConfig, SourceConfig};
use preopen_news::ingest::http::{ConditionalClient, MAX_RETRY_AFTER_SECS};
use preopen_news::ingest::http_cache::ConditionalCache;
use preopen_news::ingest::providers::{rest::RestFetcher, rss::RssFetcher};
use preopen_news::ingest::types::{FetchRequest, SourceFetcher, SourceKind};

const FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0"><channel><title>Local wire</title>
<item><title>Chipmaker wins contract</title><link>https://news.example.com/a</link><pubDate>Mon, 06 Jan 2025 08:00:00 +0800</pubDate></item>
<item><title>Bank shares fall</title><link>https://news.example.com/b</link></item>
</channel></rss>"#;

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind local listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

fn manual_clock() -> Arc<ManualClock> {
    let start = NaiveDate::from_ymd_opt(2025, 1, 6)
        .unwrap()
        .and_hms_opt(8, 0, 0)
        .unwrap();
    Arc::new(ManualClock::new(start))
}

fn client(cache: Arc<ConditionalCache>, clock: Arc<ManualClock>) -> ConditionalClient {
    ConditionalClient::new(reqwest::Client::new(), cache, clock)
}

fn request(kind: SourceKind, url: String, retries: u32) -> FetchRequest {
    let net = NetworkConfig {
        retries,
        ..NetworkConfig::default()
    };
    FetchRequest::from_source(&SourceConfig::new(kind, "local", url), &net)
}

async fn etag_feed(headers: HeaderMap) -> Response {
    let matches = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "\"v1\"");
    if matches {
        return StatusCode::NOT_MODIFIED.into_response();
    }
    (
        [(header::ETAG, "\"v1\""), (header::CONTENT_TYPE, "application/rss+xml")],
        FEED,
    )
        .into_response()
}

#[tokio::test]
async fn etag_round_trip_yields_not_modified() {
    let base = serve(Router::new().route("/feed.xml", get(etag_feed))).await;
    let dir = tempfile::tempdir().unwrap();
    let cache_path = dir.path().join("http_cache.json");
    let cache = Arc::new(ConditionalCache::load(cache_path.clone()));
    let fetcher = RssFetcher::new(client(cache.clone(), manual_clock()));
    let req = request(SourceKind::Rss, format!("{base}/feed.xml"), 0);

    let first = fetcher.fetch(&req).await;
    assert_eq!(first.items.len(), 2);
    assert!(!first.not_modified);
    assert_eq!(first.error, None);
    assert_eq!(
        first.items[0].published_at.as_deref(),
        Some("2025-01-06T00:00:00Z")
    );

    let second = fetcher.fetch(&req).await;
    assert!(second.items.is_empty());
    assert!(second.not_modified);
    assert_eq!(second.error, None, "304 is not an error");

    let stats = fetcher.cache_stats();
    assert_eq!(stats.ok, 1);
    assert_eq!(stats.sent, 1);
    assert_eq!(stats.not_modified, 1);
    assert_eq!(stats.hit_rate, 1.0);

    // validators survive a reload from disk
    let reloaded = ConditionalCache::load(cache_path);
    assert_eq!(
        reloaded.validators(&req.url).etag.as_deref(),
        Some("\"v1\"")
    );
}

#[tokio::test]
async fn retry_after_is_honored_before_next_attempt() {
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let app = Router::new().route(
        "/limited.xml",
        get(move || {
            let h = h.clone();
            async move {
                if h.fetch_add(1, Ordering::SeqCst) == 0 {
                    (StatusCode::TOO_MANY_REQUESTS, [(header::RETRY_AFTER, "2")], "slow down")
                        .into_response()
                } else {
                    FEED.into_response()
                }
            }
        }),
    );
    let base = serve(app).await;
    let clock = manual_clock();
    let fetcher = RssFetcher::new(client(Arc::new(ConditionalCache::in_memory()), clock.clone()));

    let out = fetcher
        .fetch(&request(SourceKind::Rss, format!("{base}/limited.xml"), 1))
        .await;

    assert_eq!(out.error, None);
    assert_eq!(out.items.len(), 2);
    assert_eq!(hits.load(Ordering::SeqCst), 2);
    assert!(
        clock.sleeps().iter().any(|d| *d >= Duration::from_secs(2)),
        "expected a >=2s Retry-After sleep, got {:?}",
        clock.sleeps()
    );
}

#[tokio::test]
async fn exhausted_retries_report_last_status() {
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let app = Router::new().route(
        "/down.xml",
        get(move || {
            let h = h.clone();
            async move {
                h.fetch_add(1, Ordering::SeqCst);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }),
    );
    let base = serve(app).await;
    let clock = manual_clock();
    let fetcher = RssFetcher::new(client(Arc::new(ConditionalCache::in_memory()), clock.clone()));

    let out = fetcher
        .fetch(&request(SourceKind::Rss, format!("{base}/down.xml"), 2))
        .await;

    assert!(out.items.is_empty());
    assert!(out.error.as_deref().is_some_and(|e| e.contains("500")));
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    // backoff between attempts only, each within its jitter cap
    let sleeps = clock.sleeps();
    assert_eq!(sleeps.len(), 2);
    assert!(sleeps[0] <= Duration::from_secs_f64(0.5));
    assert!(sleeps[1] <= Duration::from_secs_f64(1.0));
}

#[tokio::test]
async fn oversized_retry_after_is_clamped_for_both_protocols() {
    let hits = Arc::new(AtomicUsize::new(0));
    let h = hits.clone();
    let app = Router::new().route(
        "/flood",
        get(move || {
            let h = h.clone();
            async move {
                h.fetch_add(1, Ordering::SeqCst);
                (StatusCode::TOO_MANY_REQUESTS, [(header::RETRY_AFTER, "1e30")], "later")
            }
        }),
    );
    let base = serve(app).await;
    let ceiling = Duration::from_secs_f64(MAX_RETRY_AFTER_SECS);

    let clock = manual_clock();
    let rss = RssFetcher::new(client(Arc::new(ConditionalCache::in_memory()), clock.clone()));
    let out = rss
        .fetch(&request(SourceKind::Rss, format!("{base}/flood"), 1))
        .await;
    assert!(out.items.is_empty());
    assert!(out.error.as_deref().is_some_and(|e| e.contains("429")), "{:?}", out.error);
    assert_eq!(clock.sleeps(), vec![ceiling]);

    let clock = manual_clock();
    let rest = RestFetcher::new(client(Arc::new(ConditionalCache::in_memory()), clock.clone()));
    let out = rest
        .fetch(&request(SourceKind::Rest, format!("{base}/flood"), 1))
        .await;
    assert!(out.error.as_deref().is_some_and(|e| e.contains("429")), "{:?}", out.error);
    assert_eq!(clock.sleeps(), vec![ceiling]);

    assert_eq!(hits.load(Ordering::SeqCst), 4);
}

async fn rest_news(Query(q): Query<HashMap<String, String>>) -> Response {
    if q.get("q").map(String::as_str) != Some("markets") {
        return axum::Json(json!({ "data": { "items": [] } })).into_response();
    }
    axum::Json(json!({
        "data": {
            "items": [
                { "headline": "Merger announced", "link": "https://x.example.com/m", "ts": "2025-01-06T00:30:00Z" },
                { "headline": "Second story", "link": "https://x.example.com/s", "ts": 1736123400 },
                { "headline": "Over the limit", "link": "https://x.example.com/o" }
            ]
        }
    }))
    .into_response()
}

#[tokio::test]
async fn rest_maps_fields_and_applies_limit() {
    let base = serve(
        Router::new()
            .route("/news", get(rest_news))
            .route("/broken", get(|| async { "{not json" })),
    )
    .await;
    let fetcher = RestFetcher::new(client(Arc::new(ConditionalCache::in_memory()), manual_clock()));

    let mut src = SourceConfig::new(SourceKind::Rest, "rest_wire", format!("{base}/news"));
    src.item_path = Some("data.items".into());
    src.title_field = Some("headline".into());
    src.url_field = Some("link".into());
    src.published_at_field = Some("ts".into());
    src.limit = Some(2);
    src.params.insert("q".into(), json!("markets"));
    let req = FetchRequest::from_source(&src, &NetworkConfig::default());

    let out = fetcher.fetch(&req).await;
    assert_eq!(out.error, None);
    assert_eq!(out.items.len(), 2);
    assert_eq!(out.items[0].title.as_deref(), Some("Merger announced"));
    assert_eq!(out.items[0].url.as_deref(), Some("https://x.example.com/m"));
    assert_eq!(out.items[1].published_at.as_deref(), Some("1736123400"));

    // malformed body: one attempt, error recorded, nothing returned
    let hits_before = fetcher.cache_stats().ok;
    let broken = request(SourceKind::Rest, format!("{base}/broken"), 3);
    let out = fetcher.fetch(&broken).await;
    assert!(out.items.is_empty());
    assert!(out
        .error
        .as_deref()
        .is_some_and(|e| e.starts_with("malformed payload")));
    assert_eq!(fetcher.cache_stats().ok, hits_before + 1);
}
