// src/ingest/http.rs
//! Conditional GET/POST with pacing, Retry-After and jittered backoff.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, RETRY_AFTER};
use reqwest::{Method, StatusCode};

use crate::clock::Clock;
use crate::ingest::http_cache::{CacheStats, ConditionalCache};

const BACKOFF_BASE_SECS: f64 = 0.5;
const BACKOFF_CAP_SECS: f64 = 8.0;
/// Ceiling for a server-supplied Retry-After.
pub const MAX_RETRY_AFTER_SECS: f64 = 300.0;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum FetchError {
    #[error("http status {status}")]
    Status {
        status: u16,
        retry_after: Option<f64>,
    },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed payload: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchBody {
    Body(String),
    NotModified,
}

/// One logical request; the client owns the retry loop around it.
#[derive(Debug, Clone)]
pub struct HttpRequestSpec<'a> {
    pub url: &'a str,
    pub method: Method,
    pub headers: &'a BTreeMap<String, String>,
    pub query: Vec<(String, String)>,
    pub json_body: Option<serde_json::Value>,
    pub timeout: Duration,
    pub retries: u32,
    pub qps: Option<f64>,
}

impl<'a> HttpRequestSpec<'a> {
    pub fn get(url: &'a str, headers: &'a BTreeMap<String, String>, timeout: Duration) -> Self {
        Self {
            url,
            method: Method::GET,
            headers,
            query: Vec::new(),
            json_body: None,
            timeout,
            retries: 0,
            qps: None,
        }
    }
}

/// Full-jitter backoff ceiling for a zero-based attempt.
pub fn backoff_cap(attempt: u32) -> f64 {
    (BACKOFF_BASE_SECS * 2f64.powi(attempt.min(30) as i32)).min(BACKOFF_CAP_SECS)
}

fn parse_retry_after(v: Option<&reqwest::header::HeaderValue>) -> Option<f64> {
    v.and_then(|h| h.to_str().ok())
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|s| s.is_finite() && *s >= 0.0)
}

/// Seconds to a sleep duration, clamped to `ceiling`. `None` for negatives.
fn bounded_delay(secs: f64, ceiling: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs.min(ceiling)).ok()
}

fn header_string(resp: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[derive(Clone)]
pub struct ConditionalClient {
    http: reqwest::Client,
    cache: Arc<ConditionalCache>,
    stats: Arc<CacheStats>,
    clock: Arc<dyn Clock>,
}

impl ConditionalClient {
    pub fn new(http: reqwest::Client, cache: Arc<ConditionalCache>, clock: Arc<dyn Clock>) -> Self {
        Self {
            http,
            cache,
            stats: Arc::new(CacheStats::default()),
            clock,
        }
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Runs up to `retries + 1` attempts. 304 is `Ok(NotModified)`; the last
    /// error is returned once attempts are exhausted.
    pub async fn send(&self, spec: &HttpRequestSpec<'_>) -> Result<FetchBody, FetchError> {
        let attempts = spec.retries.saturating_add(1);
        let mut last_err = FetchError::Transport("no attempt made".to_string());

        for attempt in 0..attempts {
            let has_next = attempt + 1 < attempts;
            if let Some(pace) = spec
                .qps
                .filter(|q| *q > 0.0)
                .and_then(|q| bounded_delay(1.0 / q, spec.timeout.as_secs_f64()))
            {
                self.clock.sleep(pace).await;
            }

            let mut rb = self
                .http
                .request(spec.method.clone(), spec.url)
                .timeout(spec.timeout);
            for (k, v) in spec.headers {
                rb = rb.header(k.as_str(), v.as_str());
            }
            if !spec.query.is_empty() {
                rb = rb.query(&spec.query);
            }
            if let Some(body) = &spec.json_body {
                rb = rb.json(body);
            }
            let v = self.cache.validators(spec.url);
            if !v.is_empty() {
                if let Some(e) = &v.etag {
                    rb = rb.header(IF_NONE_MATCH, e.as_str());
                }
                if let Some(lm) = &v.last_modified {
                    rb = rb.header(IF_MODIFIED_SINCE, lm.as_str());
                }
                self.stats.on_conditional_sent();
            }

            match rb.send().await {
                Ok(resp) if resp.status() == StatusCode::NOT_MODIFIED => {
                    self.stats.on_not_modified();
                    return Ok(FetchBody::NotModified);
                }
                Ok(resp) if resp.status().is_success() => {
                    self.cache.record(
                        spec.url,
                        header_string(&resp, ETAG),
                        header_string(&resp, LAST_MODIFIED),
                    );
                    self.stats.on_ok();
                    match resp.text().await {
                        Ok(body) => return Ok(FetchBody::Body(body)),
                        Err(e) => last_err = FetchError::Transport(e.to_string()),
                    }
                }
                Ok(resp) => {
                    let status = resp.status();
                    let retry_after = if matches!(
                        status,
                        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE
                    ) {
                        parse_retry_after(resp.headers().get(RETRY_AFTER))
                    } else {
                        None
                    };
                    last_err = FetchError::Status {
                        status: status.as_u16(),
                        retry_after,
                    };
                    if let Some(delay) =
                        retry_after.and_then(|s| bounded_delay(s, MAX_RETRY_AFTER_SECS))
                    {
                        tracing::debug!(url = spec.url, attempt, secs = delay.as_secs_f64(), "honoring Retry-After");
                        if has_next {
                            self.clock.sleep(delay).await;
                        }
                        continue;
                    }
                }
                Err(e) => last_err = FetchError::Transport(e.to_string()),
            }

            if has_next {
                let cap = backoff_cap(attempt);
                let secs = rand::rng().random_range(0.0..=cap);
                tracing::debug!(url = spec.url, attempt, error = %last_err, secs, "retrying after backoff");
                if let Some(delay) = bounded_delay(secs, BACKOFF_CAP_SECS) {
                    self.clock.sleep(delay).await;
                }
            }
        }

        Err(last_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_cap_doubles_then_saturates() {
        assert_eq!(backoff_cap(0), 0.5);
        assert_eq!(backoff_cap(1), 1.0);
        assert_eq!(backoff_cap(3), 4.0);
        assert_eq!(backoff_cap(4), 8.0);
        assert_eq!(backoff_cap(10), 8.0);
    }

    #[test]
    fn retry_after_parses_seconds_only() {
        let h = reqwest::header::HeaderValue::from_static("2");
        assert_eq!(parse_retry_after(Some(&h)), Some(2.0));
        let h = reqwest::header::HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT");
        assert_eq!(parse_retry_after(Some(&h)), None);
        assert_eq!(parse_retry_after(None), None);
    }

    #[test]
    fn bounded_delay_clamps_huge_values() {
        assert_eq!(bounded_delay(2.0, MAX_RETRY_AFTER_SECS), Some(Duration::from_secs(2)));
        assert_eq!(
            bounded_delay(1e30, MAX_RETRY_AFTER_SECS),
            Some(Duration::from_secs(300))
        );
        assert_eq!(bounded_delay(f64::INFINITY, 10.0), Some(Duration::from_secs(10)));
        assert_eq!(bounded_delay(-1.0, 10.0), None);
    }
}
