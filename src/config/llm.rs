// src/config/llm.rs
use serde::{Deserialize, Serialize};
use std::env;

fn default_base_url() -> String {
    "https://api.deepseek.com".to_string()
}
fn default_model() -> String {
    "deepseek-chat".to_string()
}

/// Classifier settings for the headline tagger.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub tagger_enabled: bool,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// "ENV" means: read from DEEPSEEK_API_KEY
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    pub timeout_ms: u64,
    pub cache_ttl_minutes: u64,
    pub prompt_version: String,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            tagger_enabled: false,
            base_url: default_base_url(),
            api_key: None,
            model: default_model(),
            timeout_ms: 12_000,
            cache_ttl_minutes: 1_440,
            prompt_version: "v1".to_string(),
            temperature: 0.3,
        }
    }
}

impl LlmConfig {
    /// Resolve an `"ENV"` placeholder key and normalize blanks to `None`.
    pub fn resolve_env_key(&mut self) {
        let placeholder = self
            .api_key
            .as_deref()
            .is_some_and(|k| k.trim().eq_ignore_ascii_case("env"));
        if placeholder {
            self.api_key = env::var("DEEPSEEK_API_KEY").ok();
        }
        if self.api_key.as_deref().is_some_and(|k| k.trim().is_empty()) {
            self.api_key = None;
        }
        if self.prompt_version.trim().is_empty() {
            self.prompt_version = "v1".to_string();
        }
    }

    /// Cache lifetime, floored at one minute.
    pub fn cache_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.cache_ttl_minutes.saturating_mul(60).max(60))
    }
}
