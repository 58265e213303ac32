// src/analyze/mod.rs
//! Normalize → tag → score → select for one batch of ingested items.

pub mod entities;
pub mod normalize;
pub mod rules;
pub mod scoring;
pub mod select;
pub mod source_trust;
pub mod tagger;

// Re-export convenient types.
pub use crate::analyze::entities::{DictionaryResolver, Entities, EntityResolver};
pub use crate::analyze::normalize::{normalize_items, Language, NormalizedItem};
pub use crate::analyze::rules::KeywordRules;
pub use crate::analyze::scoring::{score_items, ScoreComponents, ScoreWeights, ScoredItem};
pub use crate::analyze::select::select_top_n;
pub use crate::analyze::tagger::{TagMeta, TagResult, Tagger};

/// Round half away from zero to `places` decimals.
pub fn round_to(x: f64, places: i32) -> f64 {
    let m = 10f64.powi(places);
    (x * m).round() / m
}

pub(crate) fn clamp01(x: f64) -> f64 {
    if x.is_nan() {
        0.0
    } else {
        x.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding_and_clamp() {
        assert_eq!(round_to(0.123456, 4), 0.1235);
        assert_eq!(round_to(0.6667, 3), 0.667);
        assert_eq!(clamp01(1.7), 1.0);
        assert_eq!(clamp01(f64::NAN), 0.0);
    }
}
