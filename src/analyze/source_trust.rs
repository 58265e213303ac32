//! # Source Trust
//!
//! Maps a source id to a coarse trust constant in `[0.0, 1.0]` by prefix.
//!
//! - Case-insensitive prefix match on the source id (e.g. `rss_reuters` → `rss`).
//! - The longest matching prefix wins.
//! - Fallback is `default_trust`.
//!
//! Configured under `[scoring.source_trust]`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::analyze::clamp01;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SourceTrustConfig {
    /// Trust for ids that match no prefix.
    pub default_trust: f64,
    /// Prefix (lowercase) → trust.
    pub prefixes: BTreeMap<String, f64>,
}

impl Default for SourceTrustConfig {
    fn default() -> Self {
        let mut prefixes = BTreeMap::new();
        prefixes.insert("rss".to_string(), 0.8);
        Self {
            default_trust: 0.7,
            prefixes,
        }
    }
}

impl SourceTrustConfig {
    pub fn trust_for(&self, source_id: &str) -> f64 {
        let s = source_id.trim().to_ascii_lowercase();
        self.prefixes
            .iter()
            .filter(|(p, _)| !p.is_empty() && s.starts_with(&p.to_ascii_lowercase()))
            .max_by_key(|(p, _)| p.len())
            .map(|(_, &w)| clamp01(w))
            .unwrap_or_else(|| clamp01(self.default_trust))
    }
}
