// src/storage.rs
//! Persistence seam for pipeline output. `MemoryStore` keeps everything in
//! process; a database-backed store would implement the same trait.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::analyze::normalize::NormalizedItem;
use crate::analyze::scoring::ScoredItem;
use crate::ingest::types::RawItem;
use crate::plan::RenderedPlan;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidateRecord {
    pub trade_date: String,
    pub market: String,
    pub rank: usize,
    pub weight_version: String,
    pub item: ScoredItem,
}

#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Returns `true` when the row was new.
    async fn insert_raw_if_absent(
        &self,
        source_id: &str,
        dedupe_key: &str,
        item: &RawItem,
    ) -> anyhow::Result<bool>;

    async fn save_normalized(&self, items: &[NormalizedItem]) -> anyhow::Result<usize>;

    /// Replaces the ranked list for `(trade_date, market)`.
    async fn save_candidates(
        &self,
        trade_date: &str,
        market: &str,
        weight_version: &str,
        ranked: &[ScoredItem],
    ) -> anyhow::Result<()>;

    async fn save_plan(&self, plan: &RenderedPlan) -> anyhow::Result<()>;

    async fn latest_plan(&self, trade_date: &str, market: &str) -> anyhow::Result<Option<RenderedPlan>>;
}

#[derive(Debug, Default)]
struct Tables {
    raw_keys: HashSet<(String, String)>,
    raw: Vec<RawItem>,
    normalized: Vec<NormalizedItem>,
    candidates: BTreeMap<(String, String), Vec<CandidateRecord>>,
    plans: BTreeMap<(String, String), Vec<RenderedPlan>>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raw_count(&self) -> usize {
        self.inner.lock().expect("store mutex poisoned").raw.len()
    }

    pub fn normalized_count(&self) -> usize {
        self.inner.lock().expect("store mutex poisoned").normalized.len()
    }

    pub fn candidates(&self, trade_date: &str, market: &str) -> Vec<CandidateRecord> {
        self.inner
            .lock()
            .expect("store mutex poisoned")
            .candidates
            .get(&(trade_date.to_string(), market.to_string()))
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl PipelineStore for MemoryStore {
    async fn insert_raw_if_absent(
        &self,
        source_id: &str,
        dedupe_key: &str,
        item: &RawItem,
    ) -> anyhow::Result<bool> {
        let mut t = self.inner.lock().expect("store mutex poisoned");
        if !t.raw_keys.insert((source_id.to_string(), dedupe_key.to_string())) {
            return Ok(false);
        }
        t.raw.push(item.clone());
        Ok(true)
    }

    async fn save_normalized(&self, items: &[NormalizedItem]) -> anyhow::Result<usize> {
        let mut t = self.inner.lock().expect("store mutex poisoned");
        t.normalized.extend_from_slice(items);
        Ok(items.len())
    }

    async fn save_candidates(
        &self,
        trade_date: &str,
        market: &str,
        weight_version: &str,
        ranked: &[ScoredItem],
    ) -> anyhow::Result<()> {
        let rows = ranked
            .iter()
            .enumerate()
            .map(|(i, item)| CandidateRecord {
                trade_date: trade_date.to_string(),
                market: market.to_string(),
                rank: i + 1,
                weight_version: weight_version.to_string(),
                item: item.clone(),
            })
            .collect();
        self.inner
            .lock()
            .expect("store mutex poisoned")
            .candidates
            .insert((trade_date.to_string(), market.to_string()), rows);
        Ok(())
    }

    async fn save_plan(&self, plan: &RenderedPlan) -> anyhow::Result<()> {
        let key = (plan.plan.trade_date.clone(), plan.plan.market.clone());
        self.inner
            .lock()
            .expect("store mutex poisoned")
            .plans
            .entry(key)
            .or_default()
            .push(plan.clone());
        Ok(())
    }

    async fn latest_plan(&self, trade_date: &str, market: &str) -> anyhow::Result<Option<RenderedPlan>> {
        Ok(self
            .inner
            .lock()
            .expect("store mutex poisoned")
            .plans
            .get(&(trade_date.to_string(), market.to_string()))
            .and_then(|v| v.last().cloned()))
    }
}
