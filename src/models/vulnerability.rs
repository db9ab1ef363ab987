use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::{Reference, Severity};

/// Caps applied to multi-valued fields on merge (spec §4.1).
pub const REFERENCES_CAP: usize = 200;
pub const CWE_IDS_CAP: usize = 100;
pub const VENDORS_CAP: usize = 100;
pub const PRODUCTS_CAP: usize = 100;

/// The central catalog record (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vulnerability {
    pub cve_id: String,

    pub title: Option<String>,
    pub description: Option<String>,
    pub cvss_score: Option<f64>,
    pub cvss_vector: Option<String>,
    pub severity: Severity,
    pub exploited_in_the_wild: bool,
    pub cisa_due_date: Option<NaiveDate>,

    pub sources: Vec<String>,
    pub cwe_ids: Vec<String>,
    pub vendors: Vec<String>,
    pub products: Vec<String>,
    pub affected_products: Vec<String>,
    pub references: Vec<Reference>,
    pub source_tags: Vec<String>,

    pub simple_title: Option<String>,
    pub simple_description: Option<String>,
    pub llm_processed: bool,
    pub llm_processed_at: Option<DateTime<Utc>>,

    pub upvotes: i64,
    pub downvotes: i64,

    pub priority_score: f64,

    pub published_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Vulnerability {
    /// Builds a brand-new row from a merged record, at the moment of first
    /// insert. `now` is supplied by the caller so the function stays pure.
    pub fn new_at(cve_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            cve_id: cve_id.into(),
            title: None,
            description: None,
            cvss_score: None,
            cvss_vector: None,
            severity: Severity::Unknown,
            exploited_in_the_wild: false,
            cisa_due_date: None,
            sources: Vec::new(),
            cwe_ids: Vec::new(),
            vendors: Vec::new(),
            products: Vec::new(),
            affected_products: Vec::new(),
            references: Vec::new(),
            source_tags: Vec::new(),
            simple_title: None,
            simple_description: None,
            llm_processed: false,
            llm_processed_at: None,
            upvotes: 0,
            downvotes: 0,
            priority_score: 0.0,
            published_at: None,
            modified_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The date the Scorer uses as "reference date": `published_at`, falling
    /// back to `modified_at` when absent (spec §4.4).
    pub fn reference_date(&self) -> Option<DateTime<Utc>> {
        self.published_at.or(self.modified_at)
    }
}
