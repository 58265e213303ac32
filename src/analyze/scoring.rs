//! Weighted scoring of normalized items.
//!
//! `total = w_rel·relevance + w_sent·sentiment + w_evt·event + w_rec·recency + w_src·source_trust`
//!
//! - `relevance`: quality, +0.1 when any entity was resolved, capped at 1
//! - `recency`: 1.0 for now/future, linear decay over 180 minutes, floor 0.2,
//!   0.5 when the timestamp is missing or unparseable
//! - `source_trust`: prefix table from `[scoring.source_trust]`
//!
//! Components are clamped to [0,1] and rounded to 3 decimals; `total` to 4.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analyze::normalize::NormalizedItem;
use crate::analyze::source_trust::SourceTrustConfig;
use crate::analyze::tagger::{TagMeta, Tagger};
use crate::analyze::{clamp01, round_to};

const RECENCY_HORIZON_MIN: f64 = 180.0;
const RECENCY_FLOOR: f64 = 0.2;
const RECENCY_UNKNOWN: f64 = 0.5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ScoreWeights {
    pub relevance: f64,
    pub sentiment: f64,
    pub event: f64,
    pub recency: f64,
    pub source: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            relevance: 0.25,
            sentiment: 0.20,
            event: 0.25,
            recency: 0.20,
            source: 0.10,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ScoreComponents {
    pub relevance: f64,
    pub sentiment_strength: f64,
    pub event_weight: f64,
    pub recency: f64,
    pub source_trust: f64,
}

impl ScoreComponents {
    pub fn total(&self, w: &ScoreWeights) -> f64 {
        round_to(
            w.relevance * self.relevance
                + w.sentiment * self.sentiment_strength
                + w.event * self.event_weight
                + w.recency * self.recency
                + w.source * self.source_trust,
            4,
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredItem {
    pub normalized: NormalizedItem,
    pub components: ScoreComponents,
    pub total: f64,
    pub tag_meta: TagMeta,
}

impl ScoredItem {
    pub fn source_id(&self) -> &str {
        &self.normalized.source_id
    }

    pub fn first_sector(&self) -> Option<&str> {
        self.normalized.first_sector()
    }
}

/// RFC 3339 first, then RFC 2822.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    DateTime::parse_from_rfc3339(s)
        .or_else(|_| DateTime::parse_from_rfc2822(s))
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

pub fn compute_recency(published_at: Option<&str>, as_of: DateTime<Utc>) -> f64 {
    let Some(published) = published_at.and_then(parse_timestamp) else {
        return RECENCY_UNKNOWN;
    };
    let minutes = ((as_of - published).num_seconds() as f64 / 60.0).max(0.0);
    if minutes <= 0.0 {
        return 1.0;
    }
    round_to((1.0 - minutes / RECENCY_HORIZON_MIN).max(RECENCY_FLOOR), 3)
}

pub fn relevance(item: &NormalizedItem) -> f64 {
    let bonus = if item.entities.is_empty() { 0.0 } else { 0.1 };
    (item.quality + bonus).min(1.0)
}

fn component(x: f64) -> f64 {
    round_to(clamp01(x), 3)
}

pub async fn score_item(
    item: NormalizedItem,
    tagger: &dyn Tagger,
    weights: &ScoreWeights,
    trust: &SourceTrustConfig,
    as_of: DateTime<Utc>,
) -> ScoredItem {
    let tag = tagger.tag(&item.title).await;
    let components = ScoreComponents {
        relevance: component(relevance(&item)),
        sentiment_strength: component(tag.sentiment_strength),
        event_weight: component(tag.event_weight),
        recency: component(compute_recency(item.published_at.as_deref(), as_of)),
        source_trust: component(trust.trust_for(&item.source_id)),
    };
    ScoredItem {
        total: components.total(weights),
        components,
        normalized: item,
        tag_meta: tag.meta,
    }
}

pub async fn score_items(
    items: Vec<NormalizedItem>,
    tagger: &dyn Tagger,
    weights: &ScoreWeights,
    trust: &SourceTrustConfig,
    as_of: DateTime<Utc>,
) -> Vec<ScoredItem> {
    let mut out = Vec::with_capacity(items.len());
    for it in items {
        out.push(score_item(it, tagger, weights, trust, as_of).await);
    }
    let degraded = out.iter().filter(|s| s.tag_meta.degraded).count();
    if degraded > 0 {
        tracing::info!(target: "score", degraded, total = out.len(), "tagger fell back to rules");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::entities::Entities;
    use crate::analyze::normalize::Language;
    use crate::analyze::tagger::RuleTagger;
    use chrono::TimeZone;

    fn as_of() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 6, 1, 0, 0).unwrap()
    }

    fn item(title: &str, source: &str, published: Option<&str>, sectors: &[&str]) -> NormalizedItem {
        NormalizedItem {
            source_id: source.into(),
            url: None,
            title: title.into(),
            text: title.into(),
            published_at: published.map(Into::into),
            quality: 0.6,
            language: Language::En,
            entities: Entities {
                symbols: vec![],
                sectors: sectors.iter().map(|s| s.to_string()).collect(),
            },
            content_hash: String::new(),
            link_canon_hash: None,
        }
    }

    #[test]
    fn recency_decays_and_floors() {
        let now = as_of();
        assert_eq!(compute_recency(None, now), 0.5);
        assert_eq!(compute_recency(Some("yesterday-ish"), now), 0.5);
        assert_eq!(compute_recency(Some("2025-01-06T01:30:00Z"), now), 1.0);
        assert_eq!(compute_recency(Some("2025-01-06T00:00:00Z"), now), 0.667);
        assert_eq!(compute_recency(Some("2025-01-05T00:00:00Z"), now), 0.2);
        assert_eq!(compute_recency(Some("Mon, 06 Jan 2025 08:30:00 +0800"), now), 0.833);
    }

    #[tokio::test]
    async fn weighted_total_uses_all_components() {
        let tagger = RuleTagger::default();
        let s = score_item(
            item("Earnings beat", "rss_wire", Some("2025-01-06T01:00:00Z"), &["tech"]),
            &tagger,
            &ScoreWeights::default(),
            &SourceTrustConfig::default(),
            as_of(),
        )
        .await;
        assert_eq!(s.components.relevance, 0.7);
        assert_eq!(s.components.event_weight, 0.8);
        assert_eq!(s.components.sentiment_strength, 0.6);
        assert_eq!(s.components.recency, 1.0);
        assert_eq!(s.components.source_trust, 0.8);
        // 0.25*0.7 + 0.2*0.6 + 0.25*0.8 + 0.2*1.0 + 0.1*0.8
        assert_eq!(s.total, 0.775);
    }
}
