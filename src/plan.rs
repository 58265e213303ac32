// src/plan.rs
//! Trade plan generation (seeded by the best candidate) and validation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::analyze::round_to;
use crate::analyze::scoring::ScoredItem;

pub const PLAN_VERSION: &str = "v1";
pub const NO_CANDIDATE: &str = "no candidate above threshold";
const FALLBACK_SYMBOL: &str = "DEMO1";
const MIN_RISK_REWARD: f64 = 1.5;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Long,
    Short,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanEntry {
    pub symbol: String,
    pub direction: Direction,
    pub entry: f64,
    pub stop: f64,
    pub take_profit: f64,
    pub rationale: String,
    pub evidence_source: Option<String>,
    pub confidence: f64,
    pub position_limit_pct: u32,
    pub execution_window_min: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlanValidation {
    pub passed: bool,
    pub issues: Vec<String>,
    pub severity: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradePlan {
    pub trade_date: String,
    pub market: String,
    pub version: String,
    pub generated_at: DateTime<Utc>,
    pub entries: Vec<PlanEntry>,
    pub validation: PlanValidation,
}

/// Plan plus its markdown rendering.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderedPlan {
    pub plan: TradePlan,
    pub markdown: String,
}

/// Build the plan from the best candidate. No candidate yields an empty,
/// failed-validation plan rather than an error.
pub fn generate_plan(
    top: Option<&ScoredItem>,
    market: &str,
    trade_date: &str,
    now: DateTime<Utc>,
) -> RenderedPlan {
    let Some(top) = top else {
        let plan = TradePlan {
            trade_date: trade_date.to_string(),
            market: market.to_string(),
            version: PLAN_VERSION.to_string(),
            generated_at: now,
            entries: Vec::new(),
            validation: PlanValidation {
                passed: false,
                issues: vec![NO_CANDIDATE.to_string()],
                severity: Some("error".to_string()),
            },
        };
        let markdown = format!("# Plan {trade_date} {market}\n\n- No entry ({NO_CANDIDATE})\n");
        return RenderedPlan { plan, markdown };
    };

    // Static price levels until market features are wired in.
    let item = &top.normalized;
    let entry = PlanEntry {
        symbol: item
            .entities
            .symbols
            .first()
            .cloned()
            .unwrap_or_else(|| FALLBACK_SYMBOL.to_string()),
        direction: Direction::Long,
        entry: 100.0,
        stop: 95.0,
        take_profit: 110.0,
        rationale: item.title.clone(),
        evidence_source: item.url.clone(),
        confidence: round_to(top.total, 3),
        position_limit_pct: 10,
        execution_window_min: 30,
    };
    let markdown = format!(
        "# Plan {trade_date} {market}\n\n- Symbol: {}\n- Entry: {}\n- Stop: {}\n- Take Profit: {}\n- Rationale: {}\n",
        entry.symbol, entry.entry, entry.stop, entry.take_profit, entry.rationale
    );
    let mut plan = TradePlan {
        trade_date: trade_date.to_string(),
        market: market.to_string(),
        version: PLAN_VERSION.to_string(),
        generated_at: now,
        entries: vec![entry],
        validation: PlanValidation::default(),
    };
    plan.validation = validate_plan(&plan);
    RenderedPlan { plan, markdown }
}

/// Price ordering per direction and a minimum 1.5 reward/risk.
pub fn validate_plan(plan: &TradePlan) -> PlanValidation {
    let mut issues = Vec::new();
    if plan.trade_date.trim().is_empty() {
        issues.push("missing field: trade_date".to_string());
    }
    if plan.market.trim().is_empty() {
        issues.push("missing field: market".to_string());
    }
    for (idx, e) in plan.entries.iter().enumerate() {
        if e.symbol.trim().is_empty() {
            issues.push(format!("entries[{idx}].symbol missing"));
        }
        if ![e.entry, e.stop, e.take_profit].iter().all(|x| x.is_finite()) {
            issues.push(format!("entries[{idx}] numeric fields must be numbers"));
            continue;
        }
        let ordered = match e.direction {
            Direction::Long => e.stop < e.entry && e.entry < e.take_profit,
            Direction::Short => e.take_profit < e.entry && e.entry < e.stop,
        };
        if !ordered {
            issues.push(match e.direction {
                Direction::Long => format!("entries[{idx}] LONG requires stop < entry < take_profit"),
                Direction::Short => {
                    format!("entries[{idx}] SHORT requires take_profit < entry < stop")
                }
            });
        }
        let risk = (e.entry - e.stop).abs();
        let reward = (e.take_profit - e.entry).abs();
        if risk <= 0.0 || reward / risk < MIN_RISK_REWARD {
            issues.push(format!("entries[{idx}] risk-reward must be >= {MIN_RISK_REWARD}"));
        }
    }
    PlanValidation {
        passed: issues.is_empty(),
        severity: (!issues.is_empty()).then(|| "error".to_string()),
        issues,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::entities::Entities;
    use crate::analyze::normalize::{Language, NormalizedItem};
    use crate::analyze::scoring::ScoreComponents;
    use crate::analyze::tagger::TagMeta;

    fn top(symbols: &[&str]) -> ScoredItem {
        ScoredItem {
            normalized: NormalizedItem {
                source_id: "rss".into(),
                url: Some("https://x.com/a".into()),
                title: "Chipmaker wins contract".into(),
                text: "Chipmaker wins contract".into(),
                published_at: None,
                quality: 0.7,
                language: Language::En,
                entities: Entities {
                    symbols: symbols.iter().map(|s| s.to_string()).collect(),
                    sectors: vec![],
                },
                content_hash: "h".into(),
                link_canon_hash: None,
            },
            components: ScoreComponents::default(),
            total: 0.71234,
            tag_meta: TagMeta::default(),
        }
    }

    #[test]
    fn empty_top_gives_failed_empty_plan() {
        let r = generate_plan(None, "SSE", "2025-01-06", Utc::now());
        assert!(r.plan.entries.is_empty());
        assert!(!r.plan.validation.passed);
        assert_eq!(r.plan.validation.issues, vec![NO_CANDIDATE.to_string()]);
        assert!(r.markdown.contains("No entry"));
    }

    #[test]
    fn best_candidate_seeds_single_long_entry() {
        let r = generate_plan(Some(&top(&["AAPL", "MSFT"])), "NASDAQ", "2025-01-06", Utc::now());
        let e = &r.plan.entries[0];
        assert_eq!(e.symbol, "AAPL");
        assert_eq!(e.direction, Direction::Long);
        assert_eq!(e.confidence, 0.712);
        assert!(r.plan.validation.passed);
        assert!(r.markdown.starts_with("# Plan 2025-01-06 NASDAQ"));

        let r = generate_plan(Some(&top(&[])), "NASDAQ", "2025-01-06", Utc::now());
        assert_eq!(r.plan.entries[0].symbol, FALLBACK_SYMBOL);
    }

    #[test]
    fn validation_checks_ordering_and_reward() {
        let mut p = generate_plan(Some(&top(&["X"])), "SSE", "2025-01-06", Utc::now()).plan;
        p.entries[0].direction = Direction::Short;
        let v = validate_plan(&p);
        assert!(!v.passed);
        assert_eq!(v.severity.as_deref(), Some("error"));
        assert!(v.issues[0].contains("SHORT requires"));

        p.entries[0].direction = Direction::Long;
        p.entries[0].take_profit = 104.0;
        let v = validate_plan(&p);
        assert_eq!(v.issues, vec!["entries[0] risk-reward must be >= 1.5".to_string()]);
    }
}
