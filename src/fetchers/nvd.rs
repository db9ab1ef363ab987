//! NVD API 2.0 client and wire types, shared by the `nvd_recent` and
//! `nvd_complete` fetchers and by `cisa_kev` (which queries NVD's
//! `hasKev` filter rather than CISA's own feed; spec §4.2).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;

use crate::error::{OpenThreatError, Result};
use crate::fetchers::{Fetcher, FetchOutput, RetryPolicy, TokenBucket};
use crate::models::{NormalizedRecord, Reference};
use crate::worker::CancelToken;

const NVD_BASE_URL: &str = "https://services.nvd.nist.gov/rest/json/cves/2.0";
const PAGE_SIZE: u32 = 2000;

#[derive(Debug, Deserialize)]
pub struct ApiResponse {
    #[serde(rename = "resultsPerPage")]
    pub results_per_page: u32,
    #[serde(rename = "startIndex")]
    pub start_index: u32,
    #[serde(rename = "totalResults")]
    pub total_results: u32,
    pub vulnerabilities: Vec<VulnerabilityItem>,
}

#[derive(Debug, Deserialize)]
pub struct VulnerabilityItem {
    pub cve: Cve,
}

#[derive(Debug, Deserialize)]
pub struct Cve {
    pub id: String,
    pub published: String,
    #[serde(rename = "lastModified")]
    pub last_modified: String,
    pub descriptions: Vec<CveDescription>,
    #[serde(default)]
    pub weaknesses: Vec<Weakness>,
    #[serde(default)]
    pub metrics: CveMetrics,
    #[serde(default)]
    pub references: Vec<CveReference>,
}

#[derive(Debug, Deserialize)]
pub struct CveDescription {
    pub lang: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct Weakness {
    pub description: Vec<CveDescription>,
}

#[derive(Debug, Deserialize)]
pub struct CveReference {
    pub url: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct CveMetrics {
    #[serde(rename = "cvssMetricV31", default)]
    pub cvss_metric_v31: Vec<CvssMetric>,
    #[serde(rename = "cvssMetricV30", default)]
    pub cvss_metric_v30: Vec<CvssMetric>,
}

#[derive(Debug, Deserialize)]
pub struct CvssMetric {
    #[serde(rename = "cvssData")]
    pub cvss_data: CvssData,
}

#[derive(Debug, Deserialize)]
pub struct CvssData {
    #[serde(rename = "vectorString")]
    pub vector_string: String,
    #[serde(rename = "baseScore")]
    pub base_score: f64,
}

impl Cve {
    fn english_description(&self) -> Option<String> {
        self.descriptions
            .iter()
            .find(|d| d.lang == "en")
            .map(|d| d.value.clone())
    }

    fn cvss(&self) -> (Option<f64>, Option<String>) {
        let metric = self
            .metrics
            .cvss_metric_v31
            .first()
            .or_else(|| self.metrics.cvss_metric_v30.first());
        match metric {
            Some(m) => (Some(m.cvss_data.base_score), Some(m.cvss_data.vector_string.clone())),
            None => (None, None),
        }
    }

    fn cwe_ids(&self) -> Vec<String> {
        self.weaknesses
            .iter()
            .flat_map(|w| w.description.iter())
            .filter(|d| d.value.starts_with("CWE-"))
            .map(|d| d.value.clone())
            .collect()
    }
}

/// Converts one NVD CVE entry into a normalized record, applying the
/// fetcher-side normalization rules of spec §4.2 (date parsing, reference
/// dedup, CVSS rounding happens in `NormalizedRecord::normalize`).
pub fn to_normalized_record(item: VulnerabilityItem, source_tag: &str) -> Option<NormalizedRecord> {
    let cve = item.cve;
    if cve.id.is_empty() {
        return None;
    }
    let (cvss_score, cvss_vector) = cve.cvss();
    let published_at = parse_nvd_timestamp(&cve.published);
    let modified_at = parse_nvd_timestamp(&cve.last_modified);

    let mut record = NormalizedRecord::new(cve.id.clone(), source_tag);
    record.description = cve.english_description();
    record.cvss_score = cvss_score;
    record.cvss_vector = cvss_vector;
    record.cwe_ids = cve.cwe_ids();
    record.references = cve
        .references
        .into_iter()
        .map(|r| Reference::new(r.url, source_tag))
        .collect();
    record.published_at = published_at;
    record.modified_at = modified_at;
    Some(record.normalize())
}

fn parse_nvd_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

pub struct NvdClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    bucket: Arc<TokenBucket>,
}

impl NvdClient {
    pub fn new(api_key: Option<String>) -> Self {
        let bucket = Arc::new(TokenBucket::nvd(api_key.is_some()));
        Self {
            http: reqwest::Client::new(),
            base_url: NVD_BASE_URL.to_string(),
            api_key,
            bucket,
        }
    }

    #[cfg(test)]
    fn with_base_url(api_key: Option<String>, base_url: impl Into<String>) -> Self {
        let mut client = Self::new(api_key);
        client.base_url = base_url.into();
        client
    }

    async fn fetch_page(&self, params: &[(&str, String)], cancel: &CancelToken) -> Result<ApiResponse> {
        self.bucket.acquire().await;
        RetryPolicy::HTTP_DEFAULT
            .run(cancel, || async {
                let mut req = self.http.get(&self.base_url).query(params);
                if let Some(key) = &self.api_key {
                    req = req.header("apiKey", key);
                }
                let resp = req
                    .send()
                    .await
                    .map_err(|e| OpenThreatError::TransientUpstream(e.to_string()))?;

                if resp.status().as_u16() == 429 {
                    let retry_after = resp
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok());
                    return Err(OpenThreatError::RateLimited {
                        retry_after_secs: retry_after,
                    });
                }
                if resp.status().is_server_error() {
                    return Err(OpenThreatError::TransientUpstream(format!(
                        "nvd returned {}",
                        resp.status()
                    )));
                }
                if !resp.status().is_success() {
                    return Err(OpenThreatError::MalformedRecord(format!(
                        "nvd returned {}",
                        resp.status()
                    )));
                }

                resp.json::<ApiResponse>()
                    .await
                    .map_err(|e| OpenThreatError::MalformedRecord(e.to_string()))
            })
            .await
    }

    /// Pages through the NVD API until exhaustion, checking `cancel`
    /// between pages (spec §5: iteration boundaries are cancellation
    /// checkpoints).
    async fn fetch_all(
        &self,
        mut params: Vec<(&'static str, String)>,
        cancel: &CancelToken,
    ) -> Result<Vec<VulnerabilityItem>> {
        let mut start_index = 0u32;
        let mut collected = Vec::new();

        loop {
            if cancel.is_cancelled() {
                return Err(OpenThreatError::Cancelled);
            }
            params.retain(|(k, _)| *k != "startIndex");
            params.push(("startIndex", start_index.to_string()));
            let page = self.fetch_page(&params, cancel).await?;
            let page_len = page.vulnerabilities.len() as u32;
            collected.extend(page.vulnerabilities);

            if page.results_per_page == 0 || start_index + page.results_per_page >= page.total_results {
                break;
            }
            start_index += page_len.max(1);
        }
        Ok(collected)
    }
}

/// Incremental fetch by `lastModStartDate` (spec §4.2: `nvd_recent`).
pub struct NvdRecentFetcher {
    client: NvdClient,
}

impl NvdRecentFetcher {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: NvdClient::new(api_key),
        }
    }

    #[cfg(test)]
    fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            client: NvdClient::with_base_url(None, base_url),
        }
    }
}

#[async_trait]
impl Fetcher for NvdRecentFetcher {
    fn source_tag(&self) -> &'static str {
        "nvd_recent"
    }

    async fn fetch(&self, checkpoint: Option<String>, cancel: &CancelToken) -> Result<FetchOutput> {
        let now = Utc::now();
        let start = checkpoint
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(now - chrono::Duration::hours(2));

        let params = vec![
            ("lastModStartDate", start.to_rfc3339()),
            ("lastModEndDate", now.to_rfc3339()),
            ("resultsPerPage", PAGE_SIZE.to_string()),
        ];
        let items = self.client.fetch_all(params, cancel).await?;
        let mut newest = start;
        let records = items
            .into_iter()
            .filter_map(|item| {
                if let Some(modified) = parse_nvd_timestamp(&item.cve.last_modified) {
                    newest = newest.max(modified);
                }
                to_normalized_record(item, self.source_tag())
            })
            .collect();

        Ok(FetchOutput {
            records,
            new_checkpoint: Some(newest.to_rfc3339()),
        })
    }
}

/// Historical pagination by `startIndex`, manual bulk only (spec §4.2:
/// `nvd_complete`).
pub struct NvdCompleteFetcher {
    client: NvdClient,
}

impl NvdCompleteFetcher {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: NvdClient::new(api_key),
        }
    }
}

#[async_trait]
impl Fetcher for NvdCompleteFetcher {
    fn source_tag(&self) -> &'static str {
        "nvd_complete"
    }

    async fn fetch(&self, checkpoint: Option<String>, cancel: &CancelToken) -> Result<FetchOutput> {
        let start_index: u32 = checkpoint.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0);
        let params = vec![
            ("resultsPerPage", PAGE_SIZE.to_string()),
            ("startIndex", start_index.to_string()),
        ];
        let items = self.client.fetch_all(params, cancel).await?;
        let count = items.len();
        let records = items
            .into_iter()
            .filter_map(|item| to_normalized_record(item, self.source_tag()))
            .collect();

        Ok(FetchOutput {
            records,
            new_checkpoint: Some((start_index + count as u32).to_string()),
        })
    }
}

/// Full exploited-in-the-wild snapshot via NVD's `hasKev` filter (spec
/// §4.2: `cisa_kev`). Unlike the other sources this never checkpoints;
/// the Merger treats the result as a snapshot replacing the prior
/// `exploited_in_the_wild=true` set contributed by this source.
pub struct CisaKevFetcher {
    client: NvdClient,
}

impl CisaKevFetcher {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: NvdClient::new(api_key),
        }
    }
}

#[async_trait]
impl Fetcher for CisaKevFetcher {
    fn source_tag(&self) -> &'static str {
        "cisa_kev"
    }

    async fn fetch(&self, _checkpoint: Option<String>, cancel: &CancelToken) -> Result<FetchOutput> {
        let params = vec![("hasKev", String::new()), ("resultsPerPage", PAGE_SIZE.to_string())];
        let items = self.client.fetch_all(params, cancel).await?;
        let records = items
            .into_iter()
            .filter_map(|item| {
                let mut record = to_normalized_record(item, self.source_tag())?;
                record.exploited_in_the_wild = true;
                Some(record)
            })
            .collect();

        Ok(FetchOutput {
            records,
            new_checkpoint: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_item(id: &str) -> VulnerabilityItem {
        VulnerabilityItem {
            cve: Cve {
                id: id.to_string(),
                published: "2024-01-01T00:00:00.000".to_string(),
                last_modified: "2024-01-02T00:00:00.000".to_string(),
                descriptions: vec![CveDescription {
                    lang: "en".to_string(),
                    value: "A description".to_string(),
                }],
                weaknesses: vec![],
                metrics: CveMetrics {
                    cvss_metric_v31: vec![CvssMetric {
                        cvss_data: CvssData {
                            vector_string: "CVSS:3.1/AV:N/AC:L/PR:N/UI:N/S:U/C:H/I:H/A:H".to_string(),
                            base_score: 9.8,
                        },
                    }],
                    cvss_metric_v30: vec![],
                },
                references: vec![CveReference {
                    url: "https://example.com/advisory".to_string(),
                }],
            },
        }
    }

    #[test]
    fn converts_wire_item_to_normalized_record() {
        let record = to_normalized_record(sample_item("CVE-2024-0001"), "nvd_recent").unwrap();
        assert_eq!(record.cve_id, "CVE-2024-0001");
        assert_eq!(record.cvss_score, Some(9.8));
        assert_eq!(record.description.as_deref(), Some("A description"));
        assert_eq!(record.sources, vec!["nvd_recent"]);
    }

    #[test]
    fn drops_records_missing_cve_id() {
        let mut item = sample_item("");
        item.cve.id = String::new();
        assert!(to_normalized_record(item, "nvd_recent").is_none());
    }

    #[test]
    fn parses_nvd_timestamp_format() {
        let parsed = parse_nvd_timestamp("2018-01-18T23:29:00.213");
        assert!(parsed.is_some());
    }

    #[tokio::test]
    async fn fetch_exhausts_a_single_page_and_advances_checkpoint() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        let body = serde_json::json!({
            "resultsPerPage": 1,
            "startIndex": 0,
            "totalResults": 1,
            "vulnerabilities": [{
                "cve": {
                    "id": "CVE-2024-9001",
                    "published": "2024-01-01T00:00:00.000",
                    "lastModified": "2024-01-02T00:00:00.000",
                    "descriptions": [{"lang": "en", "value": "A description"}],
                    "metrics": {
                        "cvssMetricV31": [{
                            "cvssData": {
                                "vectorString": "CVSS:3.1/AV:N/AC:L/PR:N/UI:N/S:U/C:H/I:H/A:H",
                                "baseScore": 9.8
                            }
                        }]
                    },
                    "references": [{"url": "https://example.com/advisory"}],
                }
            }],
        });
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let fetcher = NvdRecentFetcher::with_base_url(server.uri());
        let output = fetcher.fetch(None, &CancelToken::new()).await.unwrap();

        assert_eq!(output.records.len(), 1);
        assert_eq!(output.records[0].cve_id, "CVE-2024-9001");
        assert!(output.new_checkpoint.is_some());
    }

    #[tokio::test]
    async fn fetch_surfaces_client_errors_as_malformed_record() {
        use wiremock::matchers::method;
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fetcher = NvdRecentFetcher::with_base_url(server.uri());
        let err = fetcher.fetch(None, &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, OpenThreatError::MalformedRecord(_)));
    }
}
