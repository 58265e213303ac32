// src/analyze/entities.rs
//! Symbol/sector extraction from a JSON dictionary (default `config/entities.json`).
//!
//! File shape:
//! `{"symbols": [{"exchange": "SSE", "code": "600519", "name": "...", "aliases": [...], "sectors": [...]}]}`
//!
//! Aliases containing ASCII letters or digits match case-insensitively on word
//! boundaries; other aliases (e.g. CJK) match as plain substrings. A missing or
//! invalid file yields an empty resolver, never an error.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entities {
    pub symbols: Vec<String>,
    pub sectors: Vec<String>,
}

impl Entities {
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty() && self.sectors.is_empty()
    }
}

/// Pure, infallible text → entities lookup.
pub trait EntityResolver: Send + Sync {
    fn resolve(&self, text: &str) -> Entities;
}

#[derive(Debug, Deserialize)]
struct DictFile {
    #[serde(default)]
    symbols: Vec<SymbolEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SymbolEntry {
    #[serde(default)]
    pub exchange: String,
    pub code: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub sectors: Vec<String>,
}

#[derive(Debug)]
enum Matcher {
    Word(Regex),
    Substring(String),
}

impl Matcher {
    fn is_match(&self, lowered: &str) -> bool {
        match self {
            Matcher::Word(re) => re.is_match(lowered),
            Matcher::Substring(s) => lowered.contains(s.as_str()),
        }
    }
}

#[derive(Debug)]
struct Compiled {
    code: String,
    sectors: Vec<String>,
    matchers: Vec<Matcher>,
}

#[derive(Debug, Default)]
pub struct DictionaryResolver {
    entries: Vec<Compiled>,
}

impl DictionaryResolver {
    pub fn new(symbols: Vec<SymbolEntry>) -> Self {
        let mut entries = Vec::with_capacity(symbols.len());
        for s in symbols {
            let code = s.code.trim().to_string();
            if code.is_empty() {
                continue;
            }
            let matchers = s
                .aliases
                .iter()
                .map(|a| a.trim().to_lowercase())
                .filter(|a| !a.is_empty())
                .filter_map(|a| {
                    if a.chars().any(|c| c.is_ascii_alphanumeric()) {
                        Regex::new(&format!(r"\b{}\b", regex::escape(&a)))
                            .ok()
                            .map(Matcher::Word)
                    } else {
                        Some(Matcher::Substring(a))
                    }
                })
                .collect();
            entries.push(Compiled {
                code,
                sectors: s.sectors,
                matchers,
            });
        }
        Self { entries }
    }

    pub fn from_json_str(s: &str) -> anyhow::Result<Self> {
        let f: DictFile = serde_json::from_str(s)?;
        Ok(Self::new(f.symbols))
    }

    /// Load from disk; missing or invalid files give an empty dictionary.
    pub fn load(path: &Path) -> Self {
        let Ok(content) = fs::read_to_string(path) else {
            tracing::debug!(path = %path.display(), "entity dictionary not found");
            return Self::default();
        };
        Self::from_json_str(&content).unwrap_or_else(|e| {
            tracing::warn!(error = ?e, path = %path.display(), "entity dictionary invalid");
            Self::default()
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl EntityResolver for DictionaryResolver {
    fn resolve(&self, text: &str) -> Entities {
        let lowered = text.to_lowercase();
        let mut symbols = BTreeSet::new();
        let mut sectors = BTreeSet::new();
        for e in &self.entries {
            if e.matchers.iter().any(|m| m.is_match(&lowered)) {
                symbols.insert(e.code.clone());
                sectors.extend(e.sectors.iter().cloned());
            }
        }
        Entities {
            symbols: symbols.into_iter().collect(),
            sectors: sectors.into_iter().collect(),
        }
    }
}
