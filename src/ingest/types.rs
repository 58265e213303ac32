// src/ingest/types.rs
use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{NetworkConfig, SourceConfig, DEFAULT_SOURCE_LIMIT};
use crate::ingest::http_cache::CacheStatsSnapshot;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Rss,
    Rest,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Rss => "rss",
            SourceKind::Rest => "rest",
        }
    }
}

/// Item as parsed by a fetcher, before source attribution.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FetchedItem {
    pub title: Option<String>,
    pub url: Option<String>,
    pub published_at: Option<String>, // RFC 3339 when parseable
}

/// Item emitted by the coordinator after cross-source dedup.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RawItem {
    pub source_id: String,
    pub url: Option<String>,
    pub title: Option<String>,
    pub published_at: Option<String>,
}

/// Field mapping for structured-API sources.
#[derive(Debug, Clone, PartialEq)]
pub struct RestMapping {
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub params: serde_json::Map<String, serde_json::Value>,
    pub item_path: String,
    pub title_field: String,
    pub url_field: String,
    pub published_at_field: String,
}

impl Default for RestMapping {
    fn default() -> Self {
        Self {
            method: "GET".to_string(),
            headers: BTreeMap::new(),
            params: serde_json::Map::new(),
            item_path: "items".to_string(),
            title_field: "title".to_string(),
            url_field: "url".to_string(),
            published_at_field: "published_at".to_string(),
        }
    }
}

/// Fully resolved request for one source (overrides already merged with defaults).
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub source_id: String,
    pub url: String,
    pub limit: usize,
    pub timeout: Duration,
    pub retries: u32,
    pub qps: Option<f64>,
    pub rest: RestMapping,
}

impl FetchRequest {
    pub fn from_source(src: &SourceConfig, net: &NetworkConfig) -> Self {
        let timeout_sec = src.timeout_sec.unwrap_or(net.timeout_sec);
        let defaults = RestMapping::default();
        let pick = |v: &Option<String>, d: String| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .unwrap_or(d)
        };
        Self {
            source_id: src.source_id(),
            url: src.url.trim().to_string(),
            limit: src.limit.unwrap_or(DEFAULT_SOURCE_LIMIT),
            timeout: Duration::from_secs_f64(timeout_sec.clamp(0.1, 300.0)),
            retries: src.retries.unwrap_or(net.retries),
            qps: src.qps.or(net.qps),
            rest: RestMapping {
                method: pick(&src.method, defaults.method).to_ascii_uppercase(),
                headers: src.headers.clone(),
                params: src.params.clone(),
                item_path: pick(&src.item_path, defaults.item_path),
                title_field: pick(&src.title_field, defaults.title_field),
                url_field: pick(&src.url_field, defaults.url_field),
                published_at_field: pick(&src.published_at_field, defaults.published_at_field),
            },
        }
    }
}

/// Result of one fetch call. Never an `Err`: failures land in `error`.
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    pub items: Vec<FetchedItem>,
    pub not_modified: bool,
    pub error: Option<String>,
}

impl FetchOutcome {
    pub fn items(items: Vec<FetchedItem>) -> Self {
        Self {
            items,
            ..Self::default()
        }
    }

    pub fn not_modified() -> Self {
        Self {
            not_modified: true,
            ..Self::default()
        }
    }

    pub fn failed(err: impl ToString) -> Self {
        Self {
            error: Some(err.to_string()),
            ..Self::default()
        }
    }
}

/// Per-source outcome of the most recent ingestion run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceIngestStat {
    pub attempted: u32,
    pub fetched: usize,
    pub kept: usize,
    pub duration_ms: u64,
    pub fallback_used: bool,
    pub error: Option<String>,
}

#[async_trait::async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, req: &FetchRequest) -> FetchOutcome;
    fn cache_stats(&self) -> CacheStatsSnapshot;
}
