// src/ingest/canon.rs
//! URL canonicalization and dedup keys shared by ingestion and normalization.

use once_cell::sync::OnceCell;
use regex::Regex;
use sha2::{Digest, Sha256};
use url::Url;

const TRACKING_PARAMS: &[&str] = &["gclid", "fbclid", "igshid", "msclkid", "ref", "ref_src"];

fn is_tracking_param(key: &str) -> bool {
    let k = key.to_ascii_lowercase();
    k.starts_with("utm_") || TRACKING_PARAMS.contains(&k.as_str())
}

/// Canonical form of a URL for dedup and hashing.
///
/// Scheme/host are lowercased, userinfo, default ports, fragments, tracking
/// params and blank-valued params are dropped, and the remaining query pairs
/// are sorted. Strings without a scheme or host come back trimmed.
pub fn canonicalize_url(raw: &str) -> String {
    let s = raw.trim();
    if s.is_empty() {
        return String::new();
    }
    let Ok(mut u) = Url::parse(s) else {
        return s.to_string();
    };
    if u.host_str().map_or(true, str::is_empty) {
        return s.to_string();
    }

    let _ = u.set_username("");
    let _ = u.set_password(None);
    u.set_fragment(None);

    let mut pairs: Vec<(String, String)> = u
        .query_pairs()
        .filter(|(k, v)| !v.trim().is_empty() && !is_tracking_param(k))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();
    if pairs.is_empty() {
        u.set_query(None);
    } else {
        u.query_pairs_mut().clear().extend_pairs(pairs);
    }

    u.to_string()
}

fn tags_re() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"(?s)<[^>]+>").expect("valid tag regex"))
}

fn ws_re() -> &'static Regex {
    static RE: OnceCell<Regex> = OnceCell::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("valid whitespace regex"))
}

/// Lowercased title with markup removed and whitespace collapsed.
pub fn normalize_text_for_key(s: &str) -> String {
    let no_tags = tags_re().replace_all(s, " ");
    ws_re().replace_all(&no_tags, " ").trim().to_lowercase()
}

/// Canonical URL when present, else the normalized title, else `""`.
pub fn make_dedup_key(url: Option<&str>, title: Option<&str>) -> String {
    if let Some(u) = url.map(str::trim).filter(|u| !u.is_empty()) {
        let c = canonicalize_url(u);
        if !c.is_empty() {
            return c;
        }
    }
    title.map(normalize_text_for_key).unwrap_or_default()
}

pub fn sha256_hex(s: &str) -> String {
    format!("{:x}", Sha256::digest(s.as_bytes()))
}
