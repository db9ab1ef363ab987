//! `bsi_cert` source (spec §4.2, §6): a daily RSS snapshot of BSI CERT
//! advisories. No RSS or XML parsing crate appears anywhere in the
//! source codebase or its dependency graph, so this scrapes `<item>`
//! blocks and CVE IDs with `regex` rather than introducing an unfounded
//! dependency. The feed only needs to yield CVE IDs and a due date hint,
//! not a faithful RSS object model.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell_fallback::OnceLockRegex;

use crate::error::{OpenThreatError, Result};
use crate::fetchers::{Fetcher, FetchOutput, RetryPolicy};
use crate::models::NormalizedRecord;
use crate::worker::CancelToken;

const BSI_FEED_URL: &str = "https://wid.cert-bund.de/content/public/securityAdvisory/rss";

static ITEM_RE: OnceLockRegex = OnceLockRegex::new(r"(?is)<item>(.*?)</item>");
static CVE_RE: OnceLockRegex = OnceLockRegex::new(r"CVE-\d{4}-\d{4,}");
static LINK_RE: OnceLockRegex = OnceLockRegex::new(r"(?is)<link>\s*(.*?)\s*</link>");
static PUBDATE_RE: OnceLockRegex = OnceLockRegex::new(r"(?is)<pubDate>\s*(.*?)\s*</pubDate>");

/// Extracts every distinct CVE ID referenced inside one `<item>` block,
/// along with the advisory link and `pubDate` if present, so each CVE can
/// carry a reference back to the advisory it was scraped from and the feed
/// can checkpoint on the newest `pubDate` seen.
fn extract_cve_ids(item_body: &str) -> (Vec<String>, Option<String>, Option<DateTime<Utc>>) {
    let mut seen = std::collections::HashSet::new();
    let mut ids = Vec::new();
    for m in CVE_RE.get().find_iter(item_body) {
        let id = m.as_str().to_string();
        if seen.insert(id.clone()) {
            ids.push(id);
        }
    }
    let link = LINK_RE
        .get()
        .captures(item_body)
        .map(|c| c[1].trim().to_string());
    let pub_date = PUBDATE_RE
        .get()
        .captures(item_body)
        .and_then(|c| DateTime::parse_from_rfc2822(c[1].trim()).ok())
        .map(|dt| dt.with_timezone(&Utc));
    (ids, link, pub_date)
}

pub struct BsiCertFetcher {
    http: reqwest::Client,
    feed_url: String,
}

impl BsiCertFetcher {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            feed_url: BSI_FEED_URL.to_string(),
        }
    }

    pub fn with_feed_url(feed_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            feed_url: feed_url.into(),
        }
    }

    async fn fetch_body(&self, cancel: &CancelToken) -> Result<String> {
        RetryPolicy::HTTP_DEFAULT
            .run(cancel, || async {
                let resp = self
                    .http
                    .get(&self.feed_url)
                    .send()
                    .await
                    .map_err(|e| OpenThreatError::TransientUpstream(e.to_string()))?;
                if resp.status().is_server_error() {
                    return Err(OpenThreatError::TransientUpstream(format!(
                        "bsi_cert returned {}",
                        resp.status()
                    )));
                }
                if !resp.status().is_success() {
                    return Err(OpenThreatError::MalformedRecord(format!(
                        "bsi_cert returned {}",
                        resp.status()
                    )));
                }
                resp.text()
                    .await
                    .map_err(|e| OpenThreatError::MalformedRecord(e.to_string()))
            })
            .await
    }
}

impl Default for BsiCertFetcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses a raw RSS document into normalized records, one per distinct CVE
/// ID found across `<item>` blocks published strictly after `since`. Items
/// that name no CVE are dropped; they carry nothing this catalog tracks.
/// Returns the records alongside the newest `pubDate` seen across the whole
/// document, regardless of `since`, so the checkpoint always advances to
/// the feed's current high-water mark even when every item is filtered out.
fn parse_feed(body: &str, source_tag: &str, since: Option<DateTime<Utc>>) -> (Vec<NormalizedRecord>, Option<DateTime<Utc>>) {
    let mut by_id: std::collections::HashMap<String, NormalizedRecord> = std::collections::HashMap::new();
    let mut newest = since;
    for item_match in ITEM_RE.get().captures_iter(body) {
        let item_body = &item_match[1];
        let (cve_ids, link, pub_date) = extract_cve_ids(item_body);
        if let Some(pub_date) = pub_date {
            newest = Some(newest.map_or(pub_date, |n| n.max(pub_date)));
        }
        if let Some(since) = since {
            if pub_date.is_none_or(|pd| pd <= since) {
                continue;
            }
        }
        for cve_id in cve_ids {
            let record = by_id
                .entry(cve_id.clone())
                .or_insert_with(|| NormalizedRecord::new(cve_id.clone(), source_tag));
            if let Some(url) = &link {
                if !record.references.iter().any(|r| &r.url == url) {
                    record
                        .references
                        .push(crate::models::Reference::new(url.clone(), source_tag));
                }
            }
        }
    }
    (by_id.into_values().map(|r| r.normalize()).collect(), newest)
}

#[async_trait]
impl Fetcher for BsiCertFetcher {
    fn source_tag(&self) -> &'static str {
        "bsi_cert"
    }

    async fn fetch(&self, checkpoint: Option<String>, cancel: &CancelToken) -> Result<FetchOutput> {
        let since = checkpoint
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));
        let body = self.fetch_body(cancel).await?;
        let (records, newest) = parse_feed(&body, self.source_tag(), since);
        Ok(FetchOutput {
            records,
            new_checkpoint: newest.map(|dt| dt.to_rfc3339()).or(checkpoint),
        })
    }
}

/// Tiny lazily-initialized regex wrapper. `regex::Regex::new` can't run in
/// a `static` initializer without `OnceLock`, and no `once_cell` or
/// `lazy_static` crate is available anywhere in the dependency graph.
mod once_cell_fallback {
    use regex::Regex;
    use std::sync::OnceLock;

    pub struct OnceLockRegex {
        pattern: &'static str,
        cell: OnceLock<Regex>,
    }

    impl OnceLockRegex {
        pub const fn new(pattern: &'static str) -> Self {
            Self {
                pattern,
                cell: OnceLock::new(),
            }
        }

        pub fn get(&self) -> &Regex {
            self.cell.get_or_init(|| Regex::new(self.pattern).expect("static regex is valid"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_FEED: &str = r#"<rss><channel>
        <item>
            <title>WID-SEC-2024-0001</title>
            <link>https://wid.cert-bund.de/portal/wid/securityadvisory?name=WID-SEC-2024-0001</link>
            <pubDate>Mon, 01 Jan 2024 08:00:00 GMT</pubDate>
            <description>Affects CVE-2024-1234 and also CVE-2024-1234 again, plus CVE-2024-5678.</description>
        </item>
        <item>
            <title>No CVE here</title>
            <link>https://wid.cert-bund.de/portal/wid/securityadvisory?name=WID-SEC-2024-0002</link>
            <pubDate>Tue, 02 Jan 2024 08:00:00 GMT</pubDate>
            <description>Nothing relevant.</description>
        </item>
    </channel></rss>"#;

    #[test]
    fn extracts_distinct_cve_ids_per_item() {
        let (records, _) = parse_feed(SAMPLE_FEED, "bsi_cert", None);
        let ids: std::collections::HashSet<_> = records.iter().map(|r| r.cve_id.clone()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains("CVE-2024-1234"));
        assert!(ids.contains("CVE-2024-5678"));
    }

    #[test]
    fn attaches_advisory_link_as_reference() {
        let (records, _) = parse_feed(SAMPLE_FEED, "bsi_cert", None);
        let record = records.iter().find(|r| r.cve_id == "CVE-2024-1234").unwrap();
        assert_eq!(record.references.len(), 1);
        assert!(record.references[0].url.contains("WID-SEC-2024-0001"));
    }

    #[test]
    fn items_without_a_cve_are_dropped() {
        let (records, _) = parse_feed(SAMPLE_FEED, "bsi_cert", None);
        assert!(records.iter().all(|r| !r.cve_id.is_empty()));
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn checkpoint_advances_to_newest_pub_date_seen() {
        let (_, newest) = parse_feed(SAMPLE_FEED, "bsi_cert", None);
        assert_eq!(newest.unwrap().to_rfc3339(), "2024-01-02T08:00:00+00:00");
    }

    #[test]
    fn since_filters_out_items_published_at_or_before_the_checkpoint() {
        let since = DateTime::parse_from_rfc3339("2024-01-01T08:00:00+00:00")
            .unwrap()
            .with_timezone(&Utc);
        let (records, newest) = parse_feed(SAMPLE_FEED, "bsi_cert", Some(since));
        let ids: std::collections::HashSet<_> = records.iter().map(|r| r.cve_id.clone()).collect();
        assert!(!ids.contains("CVE-2024-1234"), "item published at the checkpoint must not re-emit");
        assert_eq!(newest.unwrap().to_rfc3339(), "2024-01-02T08:00:00+00:00");
    }
}
