// src/ingest/providers/rest.rs
use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;

use crate::ingest::http::{ConditionalClient, FetchBody, FetchError, HttpRequestSpec};
use crate::ingest::http_cache::CacheStatsSnapshot;
use crate::ingest::types::{FetchOutcome, FetchRequest, FetchedItem, RestMapping, SourceFetcher};

/// Scalar JSON field as text; strings are trimmed, numbers/bools stringified.
fn field_text(obj: &Value, key: &str) -> Option<String> {
    match obj.get(key)? {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Walk a dot-separated path of object keys down to the item array.
fn items_at<'a>(root: &'a Value, path: &str) -> Result<&'a Vec<Value>, FetchError> {
    let mut cur = root;
    for seg in path.split('.').map(str::trim).filter(|s| !s.is_empty()) {
        cur = cur
            .get(seg)
            .ok_or_else(|| FetchError::Malformed(format!("missing key {seg:?} in item path {path:?}")))?;
    }
    cur.as_array()
        .ok_or_else(|| FetchError::Malformed(format!("item path {path:?} is not an array")))
}

pub fn parse_payload(body: &str, mapping: &RestMapping, limit: usize) -> Result<Vec<FetchedItem>, FetchError> {
    let root: Value =
        serde_json::from_str(body).map_err(|e| FetchError::Malformed(e.to_string()))?;
    let items = items_at(&root, &mapping.item_path)?;
    Ok(items
        .iter()
        .filter(|v| v.is_object())
        .map(|v| FetchedItem {
            title: field_text(v, &mapping.title_field),
            url: field_text(v, &mapping.url_field),
            published_at: field_text(v, &mapping.published_at_field),
        })
        .filter(|it| it.title.is_some() || it.url.is_some())
        .take(limit)
        .collect())
}

fn param_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub struct RestFetcher {
    client: ConditionalClient,
}

impl RestFetcher {
    pub fn new(client: ConditionalClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SourceFetcher for RestFetcher {
    async fn fetch(&self, req: &FetchRequest) -> FetchOutcome {
        let m = &req.rest;
        let method = Method::from_bytes(m.method.as_bytes()).unwrap_or(Method::GET);
        let mut spec = HttpRequestSpec::get(&req.url, &m.headers, req.timeout);
        spec.retries = req.retries;
        spec.qps = req.qps;
        if method == Method::GET {
            spec.query = m.params.iter().map(|(k, v)| (k.clone(), param_text(v))).collect();
        } else if !m.params.is_empty() {
            spec.json_body = Some(Value::Object(m.params.clone()));
        }
        spec.method = method;

        match self.client.send(&spec).await {
            Ok(FetchBody::NotModified) => FetchOutcome::not_modified(),
            Ok(FetchBody::Body(body)) => match parse_payload(&body, m, req.limit) {
                Ok(items) => FetchOutcome::items(items),
                Err(e) => {
                    tracing::warn!(error = %e, source = %req.source_id, "rest payload rejected");
                    FetchOutcome::failed(e)
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, source = %req.source_id, url = %req.url, "rest fetch failed");
                FetchOutcome::failed(e)
            }
        }
    }


    fn cache_stats(&self) -> CacheStatsSnapshot {
        self.client.stats().snapshot()
    }
}
