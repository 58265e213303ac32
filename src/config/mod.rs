// src/config/mod.rs
//! Application configuration (TOML).
//!
//! Lookup order:
//! 1) `$APP_CONFIG_PATH` (must exist when set)
//! 2) `config/config.toml`
//! 3) built-in defaults
//!
//! Environment overrides are applied last: `APP_CACHE_PATH`, `DEEPSEEK_API_KEY`,
//! `DEEPSEEK_BASE_URL`, `DISABLE_SCHEDULER`, `BIND_ADDR`.

pub mod llm;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::analyze::rules::KeywordRules;
use crate::analyze::scoring::ScoreWeights;
use crate::analyze::source_trust::SourceTrustConfig;
use crate::ingest::types::SourceKind;
use crate::market_time::{DeadlinesSpec, DEFAULT_MARKET};

pub use llm::LlmConfig;

pub const ENV_CONFIG_PATH: &str = "APP_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/config.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub market: String,
    /// Fixed UTC offset of the market's local zone; host zone when absent.
    pub utc_offset_minutes: Option<i32>,
    pub preopen: PreopenConfig,
    pub network: NetworkConfig,
    pub sources: Vec<SourceConfig>,
    pub scoring: ScoringConfig,
    pub tagging: KeywordRules,
    pub llm: LlmConfig,
    pub scheduler: SchedulerConfig,
    pub alerts: AlertsConfig,
    pub market_calendar: MarketCalendarConfig,
    pub storage: StorageConfig,
    pub server: ServerConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            market: DEFAULT_MARKET.to_string(),
            utc_offset_minutes: None,
            preopen: PreopenConfig::default(),
            network: NetworkConfig::default(),
            sources: Vec::new(),
            scoring: ScoringConfig::default(),
            tagging: KeywordRules::default(),
            llm: LlmConfig::default(),
            scheduler: SchedulerConfig::default(),
            alerts: AlertsConfig::default(),
            market_calendar: MarketCalendarConfig::default(),
            storage: StorageConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreopenConfig {
    pub first_fetch_minutes_before_open: u32,
    pub topn_minutes_before_open: u32,
    pub plan_minutes_before_open: u32,
}

impl Default for PreopenConfig {
    fn default() -> Self {
        Self {
            first_fetch_minutes_before_open: 60,
            topn_minutes_before_open: 35,
            plan_minutes_before_open: 30,
        }
    }
}

impl PreopenConfig {
    /// Deadlines used when a trigger does not supply its own. The fetch
    /// deadline sits 15 minutes after the scheduler's first fetch.
    pub fn default_deadlines(&self) -> DeadlinesSpec {
        DeadlinesSpec {
            fetch_min_before_open: self.first_fetch_minutes_before_open.saturating_sub(15),
            topn_min_before_open: self.topn_minutes_before_open,
            plan_min_before_open: self.plan_minutes_before_open,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub timeout_sec: f64,
    pub retries: u32,
    pub qps: Option<f64>,
    pub concurrency: usize,
    pub user_agent: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            timeout_sec: 10.0,
            retries: 0,
            qps: None,
            concurrency: 1,
            user_agent: concat!("preopen-news/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

pub const DEFAULT_SOURCE_LIMIT: usize = 30;

/// One news source. Optional fields fall back to `[network]` defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: SourceKind,
    pub url: String,
    #[serde(default)]
    pub timeout_sec: Option<f64>,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub qps: Option<f64>,
    #[serde(default)]
    pub limit: Option<usize>,

    // structured-API mapping (ignored for feeds)
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub item_path: Option<String>,
    #[serde(default)]
    pub title_field: Option<String>,
    #[serde(default)]
    pub url_field: Option<String>,
    #[serde(default)]
    pub published_at_field: Option<String>,
}

impl SourceConfig {
    pub fn new(kind: SourceKind, id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            kind,
            url: url.into(),
            timeout_sec: None,
            retries: None,
            qps: None,
            limit: None,
            method: None,
            headers: BTreeMap::new(),
            params: serde_json::Map::new(),
            item_path: None,
            title_field: None,
            url_field: None,
            published_at_field: None,
        }
    }

    /// Stats/attribution key: explicit id, else the protocol name.
    pub fn source_id(&self) -> String {
        match self.id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => self.kind.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub weights: ScoreWeights,
    pub min_aggregate_score: Option<f64>,
    pub score_threshold: Option<f64>,
    pub top_n: usize,
    pub diversity: DiversityConfig,
    /// Weight-set version stamped onto persisted scores.
    pub version: String,
    pub source_trust: SourceTrustConfig,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: ScoreWeights::default(),
            min_aggregate_score: None,
            score_threshold: None,
            top_n: 10,
            diversity: DiversityConfig::default(),
            version: "v1.0.0".to_string(),
            source_trust: SourceTrustConfig::default(),
        }
    }
}

impl ScoringConfig {
    /// `min_aggregate_score`, else `score_threshold`, else 0.
    pub fn threshold(&self) -> f64 {
        self.min_aggregate_score
            .or(self.score_threshold)
            .unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiversityConfig {
    pub sector_cap_pct: Option<u32>,
}

impl Default for DiversityConfig {
    fn default() -> Self {
        Self {
            sector_cap_pct: Some(60),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub circuit_cooldown_minutes: u32,
    pub error_backoff_secs: u64,
    pub poll_secs: u64,
    pub post_open_buffer_minutes: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 3,
            circuit_cooldown_minutes: 15,
            error_backoff_secs: 60,
            poll_secs: 60,
            post_open_buffer_minutes: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub max_events: usize,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self { max_events: 100 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketCalendarConfig {
    pub holidays: Vec<NaiveDate>,
    pub markets: BTreeMap<String, MarketHolidays>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketHolidays {
    pub holidays: Vec<NaiveDate>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub http_cache_path: PathBuf,
    pub entities_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            http_cache_path: PathBuf::from("data/http_cache.json"),
            entities_path: PathBuf::from("config/entities.json"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

impl AppConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).context("parsing app config toml")
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading app config from {}", path.display()))?;
        Self::from_toml_str(&content)
    }

    /// Env path, then `config/config.toml`, then defaults; env overrides on top.
    pub fn load_default() -> Result<Self> {
        let mut cfg = if let Ok(p) = std::env::var(ENV_CONFIG_PATH) {
            let pb = PathBuf::from(p);
            if !pb.exists() {
                return Err(anyhow!("{ENV_CONFIG_PATH} points to non-existent path"));
            }
            Self::load_from(&pb)?
        } else {
            let p = PathBuf::from(DEFAULT_CONFIG_PATH);
            if p.exists() {
                Self::load_from(&p)?
            } else {
                Self::default()
            }
        };
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(p) = env_non_empty("APP_CACHE_PATH") {
            self.storage.http_cache_path = PathBuf::from(p);
        }
        if let Some(k) = env_non_empty("DEEPSEEK_API_KEY") {
            self.llm.api_key = Some(k);
        }
        if let Some(u) = env_non_empty("DEEPSEEK_BASE_URL") {
            self.llm.base_url = u;
        }
        if env_non_empty("DISABLE_SCHEDULER").is_some_and(|v| v == "1" || v == "true") {
            self.scheduler.enabled = false;
        }
        if let Some(b) = env_non_empty("BIND_ADDR") {
            self.server.bind = b;
        }
        self.llm.resolve_env_key();
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, fs};

    const SAMPLE: &str = r#"
market = "NYSE"

[preopen]
first_fetch_minutes_before_open = 90

[network]
concurrency = 4
retries = 2

[[sources]]
id = "rss_wire"
type = "rss"
url = "https://example.com/feed.xml"
limit = 5

[[sources]]
type = "rest"
url = "https://api.example.com/news"
item_path = "data.items"
params = { q = "markets", page = 1 }

[scoring]
score_threshold = 0.4

[scoring.diversity]
sector_cap_pct = 50

[market_calendar]
holidays = ["2025-01-01"]
"#;

    #[test]
    fn parses_sections_and_fills_defaults() {
        let cfg = AppConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(cfg.market, "NYSE");
        assert_eq!(cfg.network.concurrency, 4);
        assert_eq!(cfg.network.timeout_sec, 10.0);
        assert_eq!(cfg.sources.len(), 2);
        assert_eq!(cfg.sources[0].source_id(), "rss_wire");
        assert_eq!(cfg.sources[1].source_id(), "rest");
        assert_eq!(cfg.sources[1].params.len(), 2);
        assert_eq!(cfg.scoring.threshold(), 0.4);
        assert_eq!(cfg.scoring.top_n, 10);
        assert_eq!(cfg.scoring.diversity.sector_cap_pct, Some(50));
        assert_eq!(cfg.market_calendar.holidays.len(), 1);
        assert_eq!(cfg.preopen.default_deadlines().fetch_min_before_open, 75);
    }

    #[test]
    fn min_aggregate_score_wins_over_legacy_threshold() {
        let mut s = ScoringConfig::default();
        assert_eq!(s.threshold(), 0.0);
        s.score_threshold = Some(0.3);
        s.min_aggregate_score = Some(0.5);
        assert_eq!(s.threshold(), 0.5);
    }

    #[serial_test::serial]
    #[test]
    fn default_uses_env_then_fallbacks() {
        let old = env::current_dir().unwrap();
        let tmp = tempfile::tempdir().unwrap();
        env::set_current_dir(tmp.path()).unwrap();
        env::remove_var(ENV_CONFIG_PATH);
        env::remove_var("APP_CACHE_PATH");

        // nothing on disk -> defaults
        let cfg = AppConfig::load_default().unwrap();
        assert_eq!(cfg.market, DEFAULT_MARKET);

        let p = tmp.path().join("custom.toml");
        fs::write(&p, "market = \"HKEX\"\n").unwrap();
        env::set_var(ENV_CONFIG_PATH, p.display().to_string());
        env::set_var("APP_CACHE_PATH", "/tmp/cache.json");
        let cfg = AppConfig::load_default().unwrap();
        assert_eq!(cfg.market, "HKEX");
        assert_eq!(cfg.storage.http_cache_path, PathBuf::from("/tmp/cache.json"));

        env::set_var(ENV_CONFIG_PATH, tmp.path().join("missing.toml").display().to_string());
        assert!(AppConfig::load_default().is_err());

        env::remove_var(ENV_CONFIG_PATH);
        env::remove_var("APP_CACHE_PATH");
        env::set_current_dir(&old).unwrap();
    }
}
