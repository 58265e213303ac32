// src/analyze/select.rs
//! Diversity-capped top-N selection.

use std::collections::{HashMap, VecDeque};

use crate::analyze::scoring::ScoredItem;

const UNKNOWN_GROUP: &str = "unknown";

/// Grouping key: first sector when any item has one, else the source id.
fn group_key(item: &ScoredItem, by_sector: bool) -> String {
    if by_sector {
        item.first_sector().unwrap_or(UNKNOWN_GROUP).to_string()
    } else {
        item.source_id().to_string()
    }
}

/// `max(1, floor(n · clamp(cap_pct, 1, 100) / 100))`; no cap means 100%.
pub fn max_per_group(n: usize, sector_cap_pct: Option<u32>) -> usize {
    let cap = sector_cap_pct.unwrap_or(100).clamp(1, 100) as usize;
    (n * cap / 100).max(1)
}

/// Items with `total >= threshold`, best first, with no group holding more
/// than its cap share. When the filtered set already fits in `n` it is
/// returned whole.
pub fn select_top_n(
    scored: &[ScoredItem],
    n: usize,
    threshold: f64,
    sector_cap_pct: Option<u32>,
) -> Vec<ScoredItem> {
    let mut filtered: Vec<&ScoredItem> = scored.iter().filter(|s| s.total >= threshold).collect();
    // stable: equal totals keep input order
    filtered.sort_by(|a, b| b.total.total_cmp(&a.total));
    if filtered.len() <= n {
        return filtered.into_iter().cloned().collect();
    }

    let by_sector = filtered.iter().any(|s| s.first_sector().is_some());
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, VecDeque<&ScoredItem>> = HashMap::new();
    for &s in &filtered {
        let k = group_key(s, by_sector);
        groups
            .entry(k.clone())
            .or_insert_with(|| {
                order.push(k);
                VecDeque::new()
            })
            .push_back(s);
    }

    let limit = max_per_group(n, sector_cap_pct);
    let mut taken: HashMap<&str, usize> = HashMap::new();
    let mut out: Vec<ScoredItem> = Vec::with_capacity(n);

    // round-robin: one per group per pass until n, or a pass adds nothing
    while out.len() < n {
        let mut progressed = false;
        for k in &order {
            if out.len() >= n {
                break;
            }
            let used = taken.entry(k.as_str()).or_insert(0);
            if *used >= limit {
                continue;
            }
            if let Some(item) = groups.get_mut(k).and_then(VecDeque::pop_front) {
                out.push(item.clone());
                *used += 1;
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }

    // leftovers in group order, same caps
    if out.len() < n {
        'fill: for k in &order {
            let Some(rest) = groups.get_mut(k) else { continue };
            while let Some(item) = rest.pop_front() {
                if out.len() >= n {
                    break 'fill;
                }
                let used = taken.entry(k.as_str()).or_insert(0);
                if *used >= limit {
                    break;
                }
                out.push(item.clone());
                *used += 1;
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::entities::Entities;
    use crate::analyze::normalize::{Language, NormalizedItem};
    use crate::analyze::scoring::ScoreComponents;
    use crate::analyze::tagger::TagMeta;

    fn scored(title: &str, source: &str, sector: Option<&str>, total: f64) -> ScoredItem {
        ScoredItem {
            normalized: NormalizedItem {
                source_id: source.into(),
                url: None,
                title: title.into(),
                text: title.into(),
                published_at: None,
                quality: 0.5,
                language: Language::En,
                entities: Entities {
                    symbols: vec![],
                    sectors: sector.map(|s| vec![s.to_string()]).unwrap_or_default(),
                },
                content_hash: title.into(),
                link_canon_hash: None,
            },
            components: ScoreComponents::default(),
            total,
            tag_meta: TagMeta::default(),
        }
    }

    fn count_sector(v: &[ScoredItem], s: &str) -> usize {
        v.iter().filter(|i| i.first_sector() == Some(s)).count()
    }

    #[test]
    fn sector_cap_bounds_each_group() {
        let mut items = Vec::new();
        for i in 0..5 {
            items.push(scored(&format!("a{i}"), "rss", Some("S1"), 0.9 - i as f64 * 0.01));
            items.push(scored(&format!("b{i}"), "rss", Some("S2"), 0.5 - i as f64 * 0.01));
        }
        let out = select_top_n(&items, 6, 0.0, Some(50));
        assert_eq!(out.len(), 6);
        assert_eq!(count_sector(&out, "S1"), 3);
        assert_eq!(count_sector(&out, "S2"), 3);
        assert_eq!(out[0].normalized.title, "a0");
    }

    #[test]
    fn fits_under_n_returns_sorted() {
        let items = vec![
            scored("low", "x", None, 0.2),
            scored("high", "x", None, 0.8),
            scored("below", "x", None, 0.05),
        ];
        let out = select_top_n(&items, 10, 0.1, Some(10));
        let titles: Vec<_> = out.iter().map(|s| s.normalized.title.as_str()).collect();
        assert_eq!(titles, vec!["high", "low"]);
    }

    #[test]
    fn caps_can_leave_slots_empty_without_looping() {
        let items: Vec<_> = (0..8)
            .map(|i| scored(&format!("s{i}"), "only_source", None, 0.5))
            .collect();
        let out = select_top_n(&items, 4, 0.0, Some(50));
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn items_without_sector_group_as_unknown() {
        let mut items = vec![scored("t0", "a", Some("tech"), 0.9)];
        for i in 0..4 {
            items.push(scored(&format!("u{i}"), "b", None, 0.8));
        }
        let out = select_top_n(&items, 4, 0.0, Some(50));
        assert_eq!(out.len(), 3);
        assert_eq!(out.iter().filter(|s| s.first_sector().is_none()).count(), 2);
    }

    #[test]
    fn source_grouping_when_no_sectors() {
        let mut items = Vec::new();
        for i in 0..4 {
            items.push(scored(&format!("x{i}"), "src_x", None, 0.9));
            items.push(scored(&format!("y{i}"), "src_y", None, 0.4));
        }
        let out = select_top_n(&items, 4, 0.0, None);
        // no cap: round-robin alternates sources
        assert_eq!(out.iter().filter(|s| s.source_id() == "src_y").count(), 2);
        assert_eq!(max_per_group(10, Some(0)), 1);
        assert_eq!(max_per_group(10, Some(250)), 10);
    }
}
