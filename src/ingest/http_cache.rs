// src/ingest/http_cache.rs
//! ETag / Last-Modified validators per exact request URL, persisted as JSON:
//! `{"etag": {url: value}, "last_modified": {url: value}}`.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
struct CacheFile {
    #[serde(default)]
    etag: BTreeMap<String, String>,
    #[serde(default)]
    last_modified: BTreeMap<String, String>,
}

/// Validators to send with the next request to a URL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validators {
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

impl Validators {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

/// Shared across all fetchers; one lock guards the map and the file write.
#[derive(Debug)]
pub struct ConditionalCache {
    path: Option<PathBuf>,
    inner: Mutex<CacheFile>,
}

impl ConditionalCache {
    /// Load from `path`; a missing or unreadable file starts empty.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let inner = match fs::read_to_string(&path) {
            Ok(s) => serde_json::from_str(&s).unwrap_or_else(|e| {
                tracing::warn!(error = ?e, path = %path.display(), "http cache file invalid, starting empty");
                CacheFile::default()
            }),
            Err(_) => CacheFile::default(),
        };
        Self {
            path: Some(path),
            inner: Mutex::new(inner),
        }
    }

    /// Non-persistent cache (tests, dry runs).
    pub fn in_memory() -> Self {
        Self {
            path: None,
            inner: Mutex::new(CacheFile::default()),
        }
    }

    pub fn validators(&self, url: &str) -> Validators {
        let g = self.inner.lock().expect("http cache mutex poisoned");
        Validators {
            etag: g.etag.get(url).cloned(),
            last_modified: g.last_modified.get(url).cloned(),
        }
    }

    /// Store validators from a 2xx response and persist. Persist errors are logged.
    pub fn record(&self, url: &str, etag: Option<String>, last_modified: Option<String>) {
        if etag.is_none() && last_modified.is_none() {
            return;
        }
        let mut g = self.inner.lock().expect("http cache mutex poisoned");
        if let Some(e) = etag {
            g.etag.insert(url.to_string(), e);
        }
        if let Some(lm) = last_modified {
            g.last_modified.insert(url.to_string(), lm);
        }
        if let Some(path) = &self.path {
            if let Err(e) = write_atomic(path, &g) {
                tracing::warn!(error = ?e, path = %path.display(), "http cache persist failed");
            }
        }
    }

    pub fn len(&self) -> usize {
        let g = self.inner.lock().expect("http cache mutex poisoned");
        g.etag.len().max(g.last_modified.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn write_atomic(path: &Path, data: &CacheFile) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_string(data).context("serializing http cache")?;
    let mut f = fs::File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
    f.write_all(json.as_bytes())?;
    fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

/// Running conditional-request counters for one fetcher.
#[derive(Debug, Default)]
pub struct CacheStats {
    sent: AtomicU64,
    not_modified: AtomicU64,
    ok: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct CacheStatsSnapshot {
    pub sent: u64,
    pub not_modified: u64,
    pub ok: u64,
    pub hit_rate: f64,
}

impl CacheStatsSnapshot {
    pub fn new(sent: u64, not_modified: u64, ok: u64) -> Self {
        let hit_rate = if sent == 0 {
            0.0
        } else {
            crate::analyze::round_to(not_modified as f64 / sent as f64, 4)
        };
        Self {
            sent,
            not_modified,
            ok,
            hit_rate,
        }
    }

    /// Sum of several snapshots with the hit rate recomputed.
    pub fn combine<'a, I: IntoIterator<Item = &'a CacheStatsSnapshot>>(it: I) -> Self {
        let (s, n, o) = it.into_iter().fold((0, 0, 0), |(s, n, o), x| {
            (s + x.sent, n + x.not_modified, o + x.ok)
        });
        Self::new(s, n, o)
    }
}

impl CacheStats {
    pub fn on_conditional_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("http_conditional_sent_total").increment(1);
    }

    pub fn on_not_modified(&self) {
        self.not_modified.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("http_not_modified_total").increment(1);
    }

    pub fn on_ok(&self) {
        self.ok.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("http_ok_total").increment(1);
    }

    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot::new(
            self.sent.load(Ordering::Relaxed),
            self.not_modified.load(Ordering::Relaxed),
            self.ok.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_persists_and_reloads() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested/http_cache.json");
        let cache = ConditionalCache::load(&path);
        assert!(cache.validators("https://a/feed").is_empty());

        cache.record("https://a/feed", Some("\"v1\"".into()), None);
        cache.record("https://b/api", None, Some("Mon, 06 Jan 2025 08:00:00 GMT".into()));

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["etag"]["https://a/feed"], "\"v1\"");
        assert_eq!(
            raw["last_modified"]["https://b/api"],
            "Mon, 06 Jan 2025 08:00:00 GMT"
        );

        let reloaded = ConditionalCache::load(&path);
        assert_eq!(reloaded.validators("https://a/feed").etag.as_deref(), Some("\"v1\""));
        assert!(reloaded.validators("https://a/feed?x=1").is_empty());
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("http_cache.json");
        fs::write(&path, "{not json").unwrap();
        assert!(ConditionalCache::load(&path).is_empty());
    }

    #[test]
    fn hit_rate_is_rounded_ratio() {
        let s = CacheStatsSnapshot::new(3, 1, 2);
        assert_eq!(s.hit_rate, 0.3333);
        assert_eq!(CacheStatsSnapshot::new(0, 0, 5).hit_rate, 0.0);
        let total = CacheStatsSnapshot::combine(&[s, CacheStatsSnapshot::new(1, 1, 0)]);
        assert_eq!((total.sent, total.not_modified), (4, 2));
        assert_eq!(total.hit_rate, 0.5);
    }
}
