use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::Reference;

/// A per-source record emitted by a fetcher (spec §4.2), not yet merged
/// into the catalog. Fetchers produce these and discard them once handed
/// to the Merger; they are never persisted as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub cve_id: String,

    pub title: Option<String>,
    pub description: Option<String>,
    pub cvss_score: Option<f64>,
    pub cvss_vector: Option<String>,
    pub exploited_in_the_wild: bool,
    pub cisa_due_date: Option<NaiveDate>,

    pub sources: Vec<String>,
    pub cwe_ids: Vec<String>,
    pub vendors: Vec<String>,
    pub products: Vec<String>,
    pub affected_products: Vec<String>,
    pub references: Vec<Reference>,

    pub published_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
}

impl NormalizedRecord {
    pub fn new(cve_id: impl Into<String>, source_tag: &str) -> Self {
        Self {
            cve_id: cve_id.into(),
            title: None,
            description: None,
            cvss_score: None,
            cvss_vector: None,
            exploited_in_the_wild: false,
            cisa_due_date: None,
            sources: vec![source_tag.to_string()],
            cwe_ids: Vec::new(),
            vendors: Vec::new(),
            products: Vec::new(),
            affected_products: Vec::new(),
            references: Vec::new(),
            published_at: None,
            modified_at: None,
        }
    }

    /// Lowercases vendor/product tokens and rounds `cvss_score` to one
    /// decimal, per the normalization rules a fetcher must apply before
    /// emission (spec §4.2).
    pub fn normalize(mut self) -> Self {
        self.vendors = self.vendors.into_iter().map(|v| v.to_lowercase()).collect();
        self.products = self
            .products
            .into_iter()
            .map(|p| p.to_lowercase())
            .collect();
        self.affected_products = self
            .affected_products
            .into_iter()
            .map(|p| p.to_lowercase())
            .collect();
        if let Some(score) = self.cvss_score {
            let clamped = score.clamp(0.0, 10.0);
            self.cvss_score = Some((clamped * 10.0).round() / 10.0);
        }
        let mut seen = std::collections::HashSet::new();
        self.references.retain(|r| seen.insert(r.url.clone()));
        if let Some(vector) = &self.cvss_vector {
            if crate::cvss::parse_vector(vector).is_none() {
                tracing::warn!(cve_id = %self.cve_id, vector, "malformed cvss vector, keeping opaque string as-is");
            }
        }
        self
    }
}
