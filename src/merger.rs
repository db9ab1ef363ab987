//! Per-CVE dedup and fusion of fetcher output into the catalog (spec §4.3).
//!
//! The Merger never propagates per-record errors: a malformed incoming
//! record is dropped and counted, and only run-terminal conditions bubble
//! up to the Worker.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::models::{
    llm_task::PriorityClass,
    ordered_set::OrderedCappedSet,
    vulnerability::{CWE_IDS_CAP, PRODUCTS_CAP, REFERENCES_CAP, VENDORS_CAP},
    NormalizedRecord, Severity, Vulnerability,
};

/// Outcome of a single-record merge, as reported up to the IngestionRun
/// counters (spec §4.3 step 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Updated,
    Unchanged,
}

/// Which source last won a scalar field, so a later lower-precedence
/// source cannot clobber a higher-precedence value it didn't assert.
/// Kept alongside the row by the Store; not part of the public data
/// model in spec §3, which treats persistence as abstract.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldProvenance {
    pub title: Option<String>,
    pub description: Option<String>,
    pub cvss_score: Option<String>,
    pub cvss_vector: Option<String>,
    pub cisa_due_date: Option<String>,
    pub published_at: Option<String>,
    pub modified_at: Option<String>,
}

/// A Vulnerability row bundled with the provenance the Merger needs to
/// enforce field-level precedence on the next merge.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub vulnerability: Vulnerability,
    pub provenance: FieldProvenance,
}

fn precedence_rank(source: &str) -> u8 {
    match source {
        "nvd_complete" | "nvd_recent" => 3,
        "cisa_kev" => 2,
        "bsi_cert" => 1,
        _ => 0,
    }
}

/// Resolves one scalar field under the precedence rule: the incoming
/// value is adopted only if its source's rank is >= the rank that set the
/// value currently on the row, or if the row has no value at all.
fn merge_field<T: Clone>(
    prior_value: Option<T>,
    prior_source: Option<&str>,
    incoming_value: Option<T>,
    incoming_source: &str,
) -> (Option<T>, Option<String>) {
    let Some(incoming_value) = incoming_value else {
        return (prior_value, prior_source.map(str::to_string));
    };
    match (prior_value, prior_source) {
        (Some(prior), Some(prior_source))
            if precedence_rank(prior_source) > precedence_rank(incoming_source) =>
        {
            (Some(prior), Some(prior_source.to_string()))
        }
        _ => (Some(incoming_value), Some(incoming_source.to_string())),
    }
}

fn union_into(existing: Vec<String>, incoming: Vec<String>, cap: Option<usize>) -> Vec<String> {
    let mut set = OrderedCappedSet::from_vec(existing, cap);
    set.extend(incoming);
    set.into_vec()
}

/// Merges one incoming record into the prior row (if any), applying
/// precedence, set-union-with-cap, the monotonic exploitation flag, and
/// invoking the Scorer. Returns the new row and the outcome to report.
///
/// `source_tag` is the single tag the fetcher stamped on the record
/// (spec §4.2: "a fetcher MUST set `sources := {its_tag}`").
pub fn merge_one(
    prior: Option<StoredRow>,
    incoming: NormalizedRecord,
    source_tag: &str,
    now: DateTime<Utc>,
) -> (StoredRow, MergeOutcome) {
    let is_new = prior.is_none();
    let (mut vuln, mut provenance) = match prior {
        Some(row) => (row.vulnerability, row.provenance),
        None => (Vulnerability::new_at(incoming.cve_id.clone(), now), FieldProvenance::default()),
    };

    let before = vuln.clone();

    let (title, title_source) = merge_field(
        vuln.title.clone(),
        provenance.title.as_deref(),
        incoming.title.clone(),
        source_tag,
    );
    vuln.title = title;
    provenance.title = title_source;

    let (description, description_source) = merge_field(
        vuln.description.clone(),
        provenance.description.as_deref(),
        incoming.description.clone(),
        source_tag,
    );
    vuln.description = description;
    provenance.description = description_source;

    let (cvss_score, cvss_score_source) = merge_field(
        vuln.cvss_score,
        provenance.cvss_score.as_deref(),
        incoming.cvss_score,
        source_tag,
    );
    vuln.cvss_score = cvss_score;
    provenance.cvss_score = cvss_score_source;

    let (cvss_vector, cvss_vector_source) = merge_field(
        vuln.cvss_vector.clone(),
        provenance.cvss_vector.as_deref(),
        incoming.cvss_vector.clone(),
        source_tag,
    );
    vuln.cvss_vector = cvss_vector;
    provenance.cvss_vector = cvss_vector_source;

    let (cisa_due_date, cisa_due_date_source) = merge_field::<NaiveDate>(
        vuln.cisa_due_date,
        provenance.cisa_due_date.as_deref(),
        incoming.cisa_due_date,
        source_tag,
    );
    vuln.cisa_due_date = cisa_due_date;
    provenance.cisa_due_date = cisa_due_date_source;

    let (published_at, published_at_source) = merge_field(
        vuln.published_at,
        provenance.published_at.as_deref(),
        incoming.published_at,
        source_tag,
    );
    vuln.published_at = published_at;
    provenance.published_at = published_at_source;

    let (modified_at, modified_at_source) = merge_field(
        vuln.modified_at,
        provenance.modified_at.as_deref(),
        incoming.modified_at,
        source_tag,
    );
    vuln.modified_at = modified_at;
    provenance.modified_at = modified_at_source;

    vuln.sources = union_into(vuln.sources, incoming.sources.clone(), None);
    vuln.cwe_ids = union_into(vuln.cwe_ids, incoming.cwe_ids, Some(CWE_IDS_CAP));
    vuln.vendors = union_into(vuln.vendors, incoming.vendors, Some(VENDORS_CAP));
    vuln.products = union_into(vuln.products, incoming.products, Some(PRODUCTS_CAP));
    vuln.affected_products = union_into(vuln.affected_products, incoming.affected_products, Some(PRODUCTS_CAP));

    let mut refs = OrderedCappedSet::from_vec(vuln.references.clone(), Some(REFERENCES_CAP));
    refs.extend(incoming.references);
    vuln.references = refs.into_vec();

    if incoming.exploited_in_the_wild {
        vuln.exploited_in_the_wild = true;
    }

    vuln.severity = Severity::from_cvss_score(vuln.cvss_score);

    vuln.priority_score = crate::scorer::score(
        crate::scorer::ScoreInputs {
            cvss_score: vuln.cvss_score,
            exploited_in_the_wild: vuln.exploited_in_the_wild,
            reference_date: vuln.reference_date(),
        },
        now,
    );

    let outcome = if is_new {
        MergeOutcome::Inserted
    } else if fields_changed(&before, &vuln) {
        vuln.updated_at = now;
        MergeOutcome::Updated
    } else {
        MergeOutcome::Unchanged
    };

    (
        StoredRow {
            vulnerability: vuln,
            provenance,
        },
        outcome,
    )
}

fn fields_changed(before: &Vulnerability, after: &Vulnerability) -> bool {
    let mut a = before.clone();
    let mut b = after.clone();
    a.updated_at = b.updated_at;
    a != b
}

/// Full-snapshot reconciliation for the `cisa_kev` source (spec §3, §4.3):
/// any row whose only exploitation signal came from `cisa_kev`, and which
/// is absent from a successfully-completed KEV snapshot, has its flag
/// cleared. Rows with exploitation asserted by another source are left
/// alone, matching the "no other source asserts exploitation" clause.
pub fn reset_kev_absentees(
    rows: &mut [StoredRow],
    snapshot_cve_ids: &HashSet<String>,
    now: DateTime<Utc>,
) {
    for row in rows.iter_mut() {
        let v = &mut row.vulnerability;
        if !v.exploited_in_the_wild {
            continue;
        }
        if snapshot_cve_ids.contains(&v.cve_id) {
            continue;
        }
        let other_sources_present = v.sources.iter().any(|s| s != "cisa_kev");
        if other_sources_present {
            continue;
        }
        v.exploited_in_the_wild = false;
        v.priority_score = crate::scorer::score(
            crate::scorer::ScoreInputs {
                cvss_score: v.cvss_score,
                exploited_in_the_wild: false,
                reference_date: v.reference_date(),
            },
            now,
        );
        v.updated_at = now;
    }
}

/// Whether a merge outcome should enqueue an LLM task, and at what class
/// (spec §4.3 step 6, §4.7).
pub fn llm_enqueue_decision(
    outcome: MergeOutcome,
    before: Option<&Vulnerability>,
    after: &Vulnerability,
    now: DateTime<Utc>,
) -> Option<PriorityClass> {
    let text_changed = match before {
        Some(before) => before.title != after.title || before.description != after.description,
        None => true,
    };
    if !matches!(outcome, MergeOutcome::Inserted) && !text_changed {
        return None;
    }
    Some(crate::models::LlmTask::classify(
        after.exploited_in_the_wild,
        after.severity,
        after.published_at,
        now,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Reference;

    fn record(cve_id: &str, source: &str) -> NormalizedRecord {
        NormalizedRecord::new(cve_id, source)
    }

    #[test]
    fn scenario_one_insert_sets_severity_and_score() {
        let now = Utc::now();
        let mut rec = record("CVE-2024-0001", "nvd_recent");
        rec.cvss_score = Some(9.8);
        rec.published_at = Some(now - chrono::Duration::days(1));

        let (row, outcome) = merge_one(None, rec, "nvd_recent", now);
        assert_eq!(outcome, MergeOutcome::Inserted);
        assert_eq!(row.vulnerability.severity, Severity::Critical);

        let decision = llm_enqueue_decision(outcome, None, &row.vulnerability, now);
        assert_eq!(decision, Some(PriorityClass::High));
    }

    #[test]
    fn scenario_two_kev_flips_exploitation_without_touching_cvss() {
        let now = Utc::now();
        let mut base = StoredRow {
            vulnerability: Vulnerability::new_at("CVE-2024-0002", now),
            provenance: FieldProvenance::default(),
        };
        base.vulnerability.cvss_score = Some(7.5);
        base.vulnerability.severity = Severity::High;
        base.vulnerability.sources = vec!["nvd_recent".to_string()];
        base.provenance.cvss_score = Some("nvd_recent".to_string());

        let before_score = base.vulnerability.priority_score;
        let rec = record("CVE-2024-0002", "cisa_kev");
        let (row, outcome) = merge_one(Some(base), rec, "cisa_kev", now);

        assert_eq!(outcome, MergeOutcome::Updated);
        assert!(row.vulnerability.exploited_in_the_wild);
        assert_eq!(row.vulnerability.cvss_score, Some(7.5));
        assert_eq!(row.vulnerability.severity, Severity::High);
        assert!((row.vulnerability.priority_score - before_score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn scenario_three_precedence_on_title_conflict() {
        let now = Utc::now();
        let mut base = StoredRow {
            vulnerability: Vulnerability::new_at("CVE-2024-0003", now),
            provenance: FieldProvenance::default(),
        };
        base.vulnerability.title = Some("Old (from bsi_cert)".to_string());
        base.vulnerability.sources = vec!["bsi_cert".to_string()];
        base.provenance.title = Some("bsi_cert".to_string());

        let mut rec = record("CVE-2024-0003", "nvd_recent");
        rec.title = Some("New".to_string());

        let (row, _) = merge_one(Some(base), rec, "nvd_recent", now);
        assert_eq!(row.vulnerability.title.as_deref(), Some("New"));
        assert_eq!(row.vulnerability.sources, vec!["bsi_cert", "nvd_recent"]);
    }

    #[test]
    fn lower_precedence_cannot_override_higher() {
        let now = Utc::now();
        let mut base = StoredRow {
            vulnerability: Vulnerability::new_at("CVE-2024-0004", now),
            provenance: FieldProvenance::default(),
        };
        base.vulnerability.title = Some("Authoritative".to_string());
        base.provenance.title = Some("nvd_recent".to_string());

        let mut rec = record("CVE-2024-0004", "bsi_cert");
        rec.title = Some("Unreliable".to_string());

        let (row, _) = merge_one(Some(base), rec, "bsi_cert", now);
        assert_eq!(row.vulnerability.title.as_deref(), Some("Authoritative"));
    }

    #[test]
    fn scenario_four_references_union_capped_drops_new_tail() {
        let now = Utc::now();
        let existing: Vec<Reference> = (0..80)
            .map(|i| Reference::new(format!("https://existing/{i}"), "nvd_recent"))
            .collect();
        let mut base = StoredRow {
            vulnerability: Vulnerability::new_at("CVE-2024-0005", now),
            provenance: FieldProvenance::default(),
        };
        base.vulnerability.references = existing.clone();

        let mut rec = record("CVE-2024-0005", "nvd_recent");
        rec.references = (0..150)
            .map(|i| Reference::new(format!("https://new/{i}"), "nvd_recent"))
            .collect();

        let (row, _) = merge_one(Some(base), rec, "nvd_recent", now);
        assert_eq!(row.vulnerability.references.len(), 200);
        for r in &existing {
            assert!(row.vulnerability.references.contains(r));
        }
        assert!(row
            .vulnerability
            .references
            .iter()
            .any(|r| r.url == "https://new/119"));
        assert!(!row
            .vulnerability
            .references
            .iter()
            .any(|r| r.url == "https://new/120"));
    }

    #[test]
    fn merger_idempotence_second_run_is_unchanged() {
        let now = Utc::now();
        let mut rec = record("CVE-2024-0006", "nvd_recent");
        rec.cvss_score = Some(5.0);

        let (row1, outcome1) = merge_one(None, rec.clone(), "nvd_recent", now);
        assert_eq!(outcome1, MergeOutcome::Inserted);

        let (_row2, outcome2) = merge_one(Some(row1), rec, "nvd_recent", now);
        assert_eq!(outcome2, MergeOutcome::Unchanged);
    }

    #[test]
    fn kev_reset_clears_flag_when_absent_and_sole_source() {
        let now = Utc::now();
        let mut row = StoredRow {
            vulnerability: Vulnerability::new_at("CVE-2024-0007", now),
            provenance: FieldProvenance::default(),
        };
        row.vulnerability.exploited_in_the_wild = true;
        row.vulnerability.sources = vec!["cisa_kev".to_string()];

        let mut rows = vec![row];
        reset_kev_absentees(&mut rows, &HashSet::new(), now);
        assert!(!rows[0].vulnerability.exploited_in_the_wild);
    }

    #[test]
    fn kev_reset_preserves_flag_when_another_source_asserts_it() {
        let now = Utc::now();
        let mut row = StoredRow {
            vulnerability: Vulnerability::new_at("CVE-2024-0008", now),
            provenance: FieldProvenance::default(),
        };
        row.vulnerability.exploited_in_the_wild = true;
        row.vulnerability.sources = vec!["cisa_kev".to_string(), "nvd_recent".to_string()];

        let mut rows = vec![row];
        reset_kev_absentees(&mut rows, &HashSet::new(), now);
        assert!(rows[0].vulnerability.exploited_in_the_wild);
    }
}
