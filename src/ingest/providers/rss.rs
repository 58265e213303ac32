// src/ingest/providers/rss.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use metrics::histogram;
use quick_xml::de::from_str;
use serde::Deserialize;
use time::{
    format_description::well_known::{Rfc2822, Rfc3339},
    OffsetDateTime, UtcOffset,
};

use crate::ingest::http::{ConditionalClient, FetchBody, FetchError, HttpRequestSpec};
use crate::ingest::http_cache::CacheStatsSnapshot;
use crate::ingest::types::{FetchOutcome, FetchRequest, FetchedItem, SourceFetcher};

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}
#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}
#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
}

/// RFC 2822 feed date to RFC 3339 UTC; unparseable input is kept verbatim.
pub fn rfc2822_to_rfc3339(ts: &str) -> String {
    OffsetDateTime::parse(ts.trim(), &Rfc2822)
        .ok()
        .and_then(|dt| dt.to_offset(UtcOffset::UTC).format(&Rfc3339).ok())
        .unwrap_or_else(|| ts.trim().to_string())
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Parse `channel/item` entries, keeping those with a title or a link.
pub fn parse_feed(s: &str, limit: usize) -> Result<Vec<FetchedItem>> {
    let t0 = std::time::Instant::now();
    let xml_clean = scrub_html_entities_for_xml(s);
    let rss: Rss = from_str(&xml_clean).context("parsing rss xml")?;

    let mut out = Vec::with_capacity(rss.channel.item.len().min(limit));
    for it in rss.channel.item {
        if out.len() >= limit {
            break;
        }
        let title = non_empty(it.title);
        let url = non_empty(it.link);
        if title.is_none() && url.is_none() {
            continue;
        }
        out.push(FetchedItem {
            title,
            url,
            published_at: non_empty(it.pub_date).map(|d| rfc2822_to_rfc3339(&d)),
        });
    }

    let ms = t0.elapsed().as_secs_f64() * 1_000.0;
    histogram!("ingest_parse_ms").record(ms);
    Ok(out)
}

pub struct RssFetcher {
    client: ConditionalClient,
}

impl RssFetcher {
    pub fn new(client: ConditionalClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SourceFetcher for RssFetcher {
    async fn fetch(&self, req: &FetchRequest) -> FetchOutcome {
        let mut spec = HttpRequestSpec::get(&req.url, &req.rest.headers, req.timeout);
        spec.retries = req.retries;
        spec.qps = req.qps;

        match self.client.send(&spec).await {
            Ok(FetchBody::NotModified) => FetchOutcome::not_modified(),
            Ok(FetchBody::Body(body)) => match parse_feed(&body, req.limit) {
                Ok(items) => FetchOutcome::items(items),
                Err(e) => {
                    tracing::warn!(error = ?e, source = %req.source_id, "rss payload rejected");
                    FetchOutcome::failed(FetchError::Malformed(format!("{e:#}")))
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, source = %req.source_id, url = %req.url, "rss fetch failed");
                FetchOutcome::failed(e)
            }
        }
    }


    fn cache_stats(&self) -> CacheStatsSnapshot {
        self.client.stats().snapshot()
    }
}

fn scrub_html_entities_for_xml(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&ndash;", "-")
        .replace("&mdash;", "-")
        .replace("&ldquo;", "\"")
        .replace("&rdquo;", "\"")
        .replace("&lsquo;", "'")
        .replace("&rsquo;", "'")
}
