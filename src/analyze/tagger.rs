//! Headline tagger: classifier abstraction + in-memory TTL cache + rules fallback.
//!
//! The scorer only ever sees a `(event_weight, sentiment_strength)` pair;
//! whether it came from the classifier, the cache, or the keyword rules is
//! reported through [`TagMeta`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::analyze::clamp01;
use crate::analyze::rules::KeywordRules;
use crate::config::LlmConfig;
use crate::ingest::canon::sha256_hex;
use crate::metrics::{CallOutcome, RunMetrics};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TagMeta {
    /// Keyword rules were used because the classifier failed.
    pub degraded: bool,
    pub from_cache: bool,
    pub prompt_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TagResult {
    pub event_weight: f64,
    pub sentiment_strength: f64,
    pub meta: TagMeta,
}

#[async_trait::async_trait]
pub trait Tagger: Send + Sync {
    async fn tag(&self, title: &str) -> TagResult;
    fn name(&self) -> &'static str;
}

/// Keyword rules only.
#[derive(Debug, Clone, Default)]
pub struct RuleTagger {
    rules: KeywordRules,
}

impl RuleTagger {
    pub fn new(rules: KeywordRules) -> Self {
        Self { rules }
    }
}

#[async_trait::async_trait]
impl Tagger for RuleTagger {
    async fn tag(&self, title: &str) -> TagResult {
        let (event_weight, sentiment_strength) = self.rules.apply(title);
        TagResult {
            event_weight,
            sentiment_strength,
            meta: TagMeta {
                prompt_version: "rules".to_string(),
                ..TagMeta::default()
            },
        }
    }
    fn name(&self) -> &'static str {
        "rules"
    }
}

// ------------------------------------------------------------
// Classifier abstraction + concrete providers
// ------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Classification {
    #[serde(default = "half")]
    pub event_weight: f64,
    #[serde(default = "half")]
    pub sentiment_strength: f64,
}

fn half() -> f64 {
    0.5
}

/// Low-level provider: does the real remote call.
#[async_trait::async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, title: &str) -> Result<Classification>;
    fn name(&self) -> &'static str;
}

/// OpenAI-compatible chat completions endpoint (DeepSeek by default).
pub struct ChatClassifier {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
}

impl ChatClassifier {
    pub fn new(cfg: &LlmConfig, api_key: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("preopen-news/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_millis(cfg.timeout_ms.max(1_000)))
            .build()
            .context("building classifier http client")?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: cfg.model.clone(),
            temperature: cfg.temperature,
        })
    }
}

#[async_trait::async_trait]
impl Classifier for ChatClassifier {
    async fn classify(&self, title: &str) -> Result<Classification> {
        #[derive(Serialize)]
        struct Msg<'a> {
            role: &'a str,
            content: &'a str,
        }
        #[derive(Serialize)]
        struct Req<'a> {
            model: &'a str,
            messages: Vec<Msg<'a>>,
            temperature: f32,
        }
        #[derive(Deserialize)]
        struct Resp {
            choices: Vec<Choice>,
        }
        #[derive(Deserialize)]
        struct Choice {
            message: ChoiceMsg,
        }
        #[derive(Deserialize)]
        struct ChoiceMsg {
            content: Option<String>,
        }

        let sys = "Extract event_weight (0..1) and sentiment_strength (0..1) from the title. Reply JSON only.";
        let req = Req {
            model: &self.model,
            messages: vec![
                Msg {
                    role: "system",
                    content: sys,
                },
                Msg {
                    role: "user",
                    content: title,
                },
            ],
            temperature: self.temperature,
        };

        let resp = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&req)
            .send()
            .await
            .context("classifier request")?
            .error_for_status()
            .context("classifier status")?;
        let body: Resp = resp.json().await.context("classifier response body")?;
        let content = body
            .choices
            .first()
            .and_then(|c| c.message.content.as_deref())
            .unwrap_or_default();
        parse_classification(content)
    }

    fn name(&self) -> &'static str {
        "chat"
    }
}

/// Pull the JSON object out of a reply (tolerates code fences and chatter).
pub fn parse_classification(content: &str) -> Result<Classification> {
    let start = content.find('{').ok_or_else(|| anyhow!("no json object in reply"))?;
    let end = content.rfind('}').ok_or_else(|| anyhow!("no json object in reply"))?;
    if end < start {
        return Err(anyhow!("no json object in reply"));
    }
    let c: Classification =
        serde_json::from_str(&content[start..=end]).context("classifier json")?;
    if !c.event_weight.is_finite() || !c.sentiment_strength.is_finite() {
        return Err(anyhow!("non-finite classifier output"));
    }
    Ok(Classification {
        event_weight: clamp01(c.event_weight),
        sentiment_strength: clamp01(c.sentiment_strength),
    })
}

/// Deterministic classifier for tests/local runs. `None` simulates an outage.
#[derive(Debug, Default)]
pub struct MockClassifier {
    pub fixed: Option<Classification>,
    calls: std::sync::atomic::AtomicUsize,
}

impl MockClassifier {
    pub fn new(fixed: Option<Classification>) -> Self {
        Self {
            fixed,
            calls: Default::default(),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl Classifier for MockClassifier {
    async fn classify(&self, _title: &str) -> Result<Classification> {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.fixed.ok_or_else(|| anyhow!("mock classifier unavailable"))
    }
    fn name(&self) -> &'static str {
        "mock"
    }
}

// ------------------------------------------------------------
// Caching tagger (TTL cache + rules fallback)
// ------------------------------------------------------------

pub struct ClassifierTagger<C: Classifier> {
    inner: C,
    rules: KeywordRules,
    prompt_version: String,
    ttl: Duration,
    cache: Mutex<HashMap<String, (Instant, Classification)>>,
    metrics: Option<Arc<RunMetrics>>,
}

impl<C: Classifier> ClassifierTagger<C> {
    pub fn new(inner: C, rules: KeywordRules, prompt_version: impl Into<String>, ttl: Duration) -> Self {
        Self {
            inner,
            rules,
            prompt_version: prompt_version.into(),
            ttl,
            cache: Mutex::new(HashMap::new()),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<RunMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn cache_key(&self, title: &str) -> String {
        format!("tagger:{}:{}", sha256_hex(title), self.prompt_version)
    }

    fn cached(&self, key: &str) -> Option<Classification> {
        let mut g = self.cache.lock().expect("tagger cache mutex poisoned");
        match g.get(key) {
            Some((expires, c)) if *expires > Instant::now() => Some(*c),
            Some(_) => {
                g.remove(key);
                None
            }
            None => None,
        }
    }

    /// Inserts a fresh entry and evicts everything already past its TTL.
    fn store(&self, key: String, c: Classification) {
        let now = Instant::now();
        let mut g = self.cache.lock().expect("tagger cache mutex poisoned");
        g.retain(|_, (expires, _)| *expires > now);
        g.insert(key, (now + self.ttl, c));
    }

    #[cfg(test)]
    fn cache_len(&self) -> usize {
        self.cache.lock().expect("tagger cache mutex poisoned").len()
    }

    fn record(&self, outcome: CallOutcome, started: Instant, cache_hit: bool) {
        if let Some(m) = &self.metrics {
            m.record_classifier_call(outcome, started.elapsed().as_millis() as u64, cache_hit);
        }
    }

    fn result(&self, c: Classification, degraded: bool, from_cache: bool) -> TagResult {
        TagResult {
            event_weight: c.event_weight,
            sentiment_strength: c.sentiment_strength,
            meta: TagMeta {
                degraded,
                from_cache,
                prompt_version: self.prompt_version.clone(),
            },
        }
    }
}

#[async_trait::async_trait]
impl<C: Classifier> Tagger for ClassifierTagger<C> {
    async fn tag(&self, title: &str) -> TagResult {
        let started = Instant::now();
        let key = self.cache_key(title);

        if let Some(hit) = self.cached(&key) {
            self.record(CallOutcome::Success, started, true);
            return self.result(hit, false, true);
        }

        match self.inner.classify(title).await {
            Ok(c) => {
                self.store(key, c);
                self.record(CallOutcome::Success, started, false);
                self.result(c, false, false)
            }
            Err(e) => {
                tracing::debug!(error = ?e, classifier = self.inner.name(), "classifier failed, using rules");
                self.record(CallOutcome::Failure, started, false);
                let (event_weight, sentiment_strength) = self.rules.apply(title);
                self.result(
                    Classification {
                        event_weight,
                        sentiment_strength,
                    },
                    true,
                    false,
                )
            }
        }
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

/// Factory: classifier-backed tagger when enabled and keyed, else rules only.
pub fn build_tagger(
    llm: &LlmConfig,
    rules: &KeywordRules,
    metrics: Arc<RunMetrics>,
) -> Arc<dyn Tagger> {
    if !llm.tagger_enabled {
        return Arc::new(RuleTagger::new(rules.clone()));
    }
    let Some(key) = llm.api_key.clone() else {
        tracing::warn!("llm tagger enabled without api key, using keyword rules");
        return Arc::new(RuleTagger::new(rules.clone()));
    };
    match ChatClassifier::new(llm, key) {
        Ok(c) => Arc::new(
            ClassifierTagger::new(c, rules.clone(), llm.prompt_version.clone(), llm.cache_ttl())
                .with_metrics(metrics),
        ),
        Err(e) => {
            tracing::warn!(error = ?e, "classifier init failed, using keyword rules");
            Arc::new(RuleTagger::new(rules.clone()))
        }
    }
}
