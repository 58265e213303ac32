//! Deterministic headline keyword rules (the tagger's always-available fallback).
//!
//! Matching is a case-insensitive substring test on the title:
//! - any `event_keywords` hit → `event_weight = event_hit` (else `event_default`)
//! - any `positive_keywords` hit → `sentiment = positive` (checked first)
//! - any `negative_keywords` hit → `sentiment = negative`
//! - otherwise neutral
//!
//! Configured under `[tagging]` in the app config.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KeywordRules {
    pub event_keywords: Vec<String>,
    pub positive_keywords: Vec<String>,
    pub negative_keywords: Vec<String>,
    pub event_hit: f64,
    pub event_default: f64,
    pub positive: f64,
    pub negative: f64,
    pub neutral: f64,
}

fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for KeywordRules {
    fn default() -> Self {
        Self {
            event_keywords: words(&["earnings", "contract", "merger", "m&a"]),
            positive_keywords: words(&["up", "surge", "beat", "win"]),
            negative_keywords: words(&["down", "fall", "miss", "loss"]),
            event_hit: 0.8,
            event_default: 0.5,
            positive: 0.6,
            negative: 0.4,
            neutral: 0.5,
        }
    }
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
    needles
        .iter()
        .map(|n| n.trim().to_lowercase())
        .any(|n| !n.is_empty() && haystack.contains(&n))
}

impl KeywordRules {
    /// `(event_weight, sentiment_strength)` for a title.
    pub fn apply(&self, title: &str) -> (f64, f64) {
        let t = title.to_lowercase();
        let event = if contains_any(&t, &self.event_keywords) {
            self.event_hit
        } else {
            self.event_default
        };
        let sentiment = if contains_any(&t, &self.positive_keywords) {
            self.positive
        } else if contains_any(&t, &self.negative_keywords) {
            self.negative
        } else {
            self.neutral
        };
        (event, sentiment)
    }
}
