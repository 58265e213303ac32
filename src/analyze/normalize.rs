// src/analyze/normalize.rs
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::analyze::entities::{Entities, EntityResolver};
use crate::analyze::round_to;
use crate::ingest::canon::{canonicalize_url, sha256_hex};
use crate::ingest::types::RawItem;

const QUALITY_FULL_LEN: f64 = 140.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Zh,
    En,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NormalizedItem {
    pub source_id: String,
    pub url: Option<String>,
    pub title: String,
    pub text: String,
    pub published_at: Option<String>,
    pub quality: f64,
    pub language: Language,
    pub entities: Entities,
    pub content_hash: String,
    pub link_canon_hash: Option<String>,
}

impl NormalizedItem {
    pub fn first_sector(&self) -> Option<&str> {
        self.entities.sectors.first().map(String::as_str)
    }
}

/// Strip script/style blocks and tags, decode entities, collapse whitespace.
pub fn clean_text(s: &str) -> String {
    static RE_BLOCKS: OnceCell<Regex> = OnceCell::new();
    static RE_TAGS: OnceCell<Regex> = OnceCell::new();
    static RE_WS: OnceCell<Regex> = OnceCell::new();
    let re_blocks = RE_BLOCKS.get_or_init(|| {
        Regex::new(r"(?is)<script\b[^>]*>.*?</script\s*>|<style\b[^>]*>.*?</style\s*>")
            .expect("valid block regex")
    });
    let re_tags = RE_TAGS.get_or_init(|| Regex::new(r"(?s)<[^>]+>").expect("valid tag regex"));
    let re_ws = RE_WS.get_or_init(|| Regex::new(r"\s+").expect("valid whitespace regex"));

    let out = re_blocks.replace_all(s, " ");
    let out = re_tags.replace_all(&out, " ");
    let out = html_escape::decode_html_entities(&out);
    re_ws.replace_all(&out, " ").trim().to_string()
}

pub fn detect_language(s: &str) -> Language {
    if s.chars().any(|c| ('\u{4E00}'..='\u{9FFF}').contains(&c)) {
        Language::Zh
    } else if s.chars().any(|c| c.is_ascii_alphabetic()) {
        Language::En
    } else {
        Language::Unknown
    }
}

/// `min(1, 0.5 + 0.5·min(chars/140, 1) + 0.05 if language detected)`, 3 decimals.
pub fn quality_score(text: &str, lang: Language) -> f64 {
    let len_part = (text.chars().count() as f64 / QUALITY_FULL_LEN).min(1.0);
    let bonus = if lang == Language::Unknown { 0.0 } else { 0.05 };
    round_to((0.5 + 0.5 * len_part + bonus).min(1.0), 3)
}

pub fn normalize_item(raw: &RawItem, resolver: &dyn EntityResolver) -> NormalizedItem {
    let cleaned = clean_text(raw.title.as_deref().unwrap_or_default());
    let title = if cleaned.is_empty() {
        "Untitled".to_string()
    } else {
        cleaned
    };
    let text = title.clone();
    let language = detect_language(&text);
    let quality = quality_score(&text, language);
    let entities = resolver.resolve(&text);

    let url = raw
        .url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(str::to_string);
    let canon = url.as_deref().map(canonicalize_url).filter(|c| !c.is_empty());
    let hash_src = canon.as_deref().or(url.as_deref()).unwrap_or_default();

    NormalizedItem {
        source_id: raw.source_id.clone(),
        content_hash: sha256_hex(&format!("{title}\n{hash_src}")),
        link_canon_hash: canon.as_deref().map(sha256_hex),
        url,
        title,
        text,
        published_at: raw.published_at.clone(),
        quality,
        language,
        entities,
    }
}

pub fn normalize_items(raw: &[RawItem], resolver: &dyn EntityResolver) -> Vec<NormalizedItem> {
    raw.iter().map(|r| normalize_item(r, resolver)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::entities::DictionaryResolver;

    fn raw(title: Option<&str>, url: Option<&str>) -> RawItem {
        RawItem {
            source_id: "rss_a".into(),
            url: url.map(Into::into),
            title: title.map(Into::into),
            published_at: None,
        }
    }

    #[test]
    fn strips_markup_and_scripts() {
        let s = "<p>Rates <b>hold</b></p><script>alert(1)</script>&amp; markets\n\tcalm";
        assert_eq!(clean_text(s), "Rates hold & markets calm");
    }

    #[test]
    fn language_and_quality() {
        assert_eq!(detect_language("央行降准"), Language::Zh);
        assert_eq!(detect_language("Fed holds"), Language::En);
        assert_eq!(detect_language("1234 !!"), Language::Unknown);
        assert_eq!(quality_score(&"a".repeat(140), Language::En), 1.0);
        assert_eq!(quality_score("1234", Language::Unknown), 0.514);
        assert_eq!(quality_score(&"x".repeat(70), Language::En), 0.8);
    }

    #[test]
    fn hashes_follow_url_presence() {
        let r = DictionaryResolver::default();
        let with_url = normalize_item(&raw(Some("T"), Some("https://A.com/x?utm_source=1")), &r);
        assert_eq!(with_url.content_hash, sha256_hex("T\nhttps://a.com/x"));
        assert_eq!(
            with_url.link_canon_hash.as_deref(),
            Some(sha256_hex("https://a.com/x").as_str())
        );

        let no_url = normalize_item(&raw(Some("  "), None), &r);
        assert_eq!(no_url.title, "Untitled");
        assert!(no_url.link_canon_hash.is_none());
        assert_eq!(no_url.content_hash, sha256_hex("Untitled\n"));
    }
}
