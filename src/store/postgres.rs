//! Postgres-backed `Store` (spec §4.1). Queries are issued with the
//! runtime-checked `sqlx::query`/`query_as` API rather than the
//! `query!`/`query_as!` macros, since the compile-time variants require a
//! prepared `.sqlx` cache or a live database at build time.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value as Json;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{OpenThreatError, Result};
use crate::merger::{FieldProvenance, MergeOutcome, StoredRow};
use crate::models::{
    IngestionRun, IngestionRunStatus, LlmTask, LlmTaskState, PriorityClass, Reference, Severity,
    StatsCache, Vulnerability,
};

use super::{IngestionCounts, LlmCandidateFilter, MergeFn, SearchFilter, SortKey, Store};

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| OpenThreatError::StoreUnavailable(e.to_string()))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| OpenThreatError::StoreUnavailable(e.to_string()))
    }
}

fn json_strings(value: &Json) -> Vec<String> {
    value
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn json_references(value: &Json) -> Vec<Reference> {
    serde_json::from_value(value.clone()).unwrap_or_default()
}

fn row_to_stored_row(row: &sqlx::postgres::PgRow) -> Result<StoredRow> {
    let severity_str: String = row.try_get("severity").map_err(store_err)?;
    let severity: Severity = severity_str.parse().unwrap_or(Severity::Unknown);

    let vulnerability = Vulnerability {
        cve_id: row.try_get("cve_id").map_err(store_err)?,
        title: row.try_get("title").map_err(store_err)?,
        description: row.try_get("description").map_err(store_err)?,
        cvss_score: row.try_get("cvss_score").map_err(store_err)?,
        cvss_vector: row.try_get("cvss_vector").map_err(store_err)?,
        severity,
        exploited_in_the_wild: row.try_get("exploited_in_the_wild").map_err(store_err)?,
        cisa_due_date: row.try_get::<Option<NaiveDate>, _>("cisa_due_date").map_err(store_err)?,
        sources: json_strings(&row.try_get::<Json, _>("sources").map_err(store_err)?),
        cwe_ids: json_strings(&row.try_get::<Json, _>("cwe_ids").map_err(store_err)?),
        vendors: json_strings(&row.try_get::<Json, _>("vendors").map_err(store_err)?),
        products: json_strings(&row.try_get::<Json, _>("products").map_err(store_err)?),
        affected_products: json_strings(&row.try_get::<Json, _>("affected_products").map_err(store_err)?),
        references: json_references(&row.try_get::<Json, _>("reference_list").map_err(store_err)?),
        source_tags: json_strings(&row.try_get::<Json, _>("source_tags").map_err(store_err)?),
        simple_title: row.try_get("simple_title").map_err(store_err)?,
        simple_description: row.try_get("simple_description").map_err(store_err)?,
        llm_processed: row.try_get("llm_processed").map_err(store_err)?,
        llm_processed_at: row.try_get("llm_processed_at").map_err(store_err)?,
        upvotes: row.try_get("upvotes").map_err(store_err)?,
        downvotes: row.try_get("downvotes").map_err(store_err)?,
        priority_score: row.try_get("priority_score").map_err(store_err)?,
        published_at: row.try_get("published_at").map_err(store_err)?,
        modified_at: row.try_get("modified_at").map_err(store_err)?,
        created_at: row.try_get("created_at").map_err(store_err)?,
        updated_at: row.try_get("updated_at").map_err(store_err)?,
    };

    let provenance: Json = row.try_get("field_provenance").map_err(store_err)?;
    let provenance: FieldProvenance = serde_json::from_value(provenance).unwrap_or_default();

    Ok(StoredRow {
        vulnerability,
        provenance,
    })
}

fn store_err(e: sqlx::Error) -> OpenThreatError {
    OpenThreatError::StoreUnavailable(e.to_string())
}

#[async_trait]
impl Store for PostgresStore {
    async fn upsert_vulnerability(&self, cve_id: &str, merge: MergeFn) -> Result<MergeOutcome> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;

        let existing = sqlx::query("SELECT * FROM vulnerabilities WHERE cve_id = $1 FOR UPDATE")
            .bind(cve_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(store_err)?;
        let prior = existing.as_ref().map(row_to_stored_row).transpose()?;

        let (new_row, outcome) = merge(prior);
        let v = &new_row.vulnerability;

        sqlx::query(
            r"
            INSERT INTO vulnerabilities (
                cve_id, title, description, cvss_score, cvss_vector, severity,
                exploited_in_the_wild, cisa_due_date, sources, cwe_ids, vendors,
                products, affected_products, reference_list, source_tags,
                simple_title, simple_description, llm_processed, llm_processed_at,
                upvotes, downvotes, priority_score, published_at, modified_at,
                created_at, updated_at, field_provenance
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                $16, $17, $18, $19, $20, $21, $22, $23, $24, $25, $26, $27
            )
            ON CONFLICT (cve_id) DO UPDATE SET
                title = EXCLUDED.title,
                description = EXCLUDED.description,
                cvss_score = EXCLUDED.cvss_score,
                cvss_vector = EXCLUDED.cvss_vector,
                severity = EXCLUDED.severity,
                exploited_in_the_wild = EXCLUDED.exploited_in_the_wild,
                cisa_due_date = EXCLUDED.cisa_due_date,
                sources = EXCLUDED.sources,
                cwe_ids = EXCLUDED.cwe_ids,
                vendors = EXCLUDED.vendors,
                products = EXCLUDED.products,
                affected_products = EXCLUDED.affected_products,
                reference_list = EXCLUDED.reference_list,
                source_tags = EXCLUDED.source_tags,
                priority_score = EXCLUDED.priority_score,
                published_at = EXCLUDED.published_at,
                modified_at = EXCLUDED.modified_at,
                updated_at = EXCLUDED.updated_at,
                field_provenance = EXCLUDED.field_provenance
            ",
        )
        .bind(&v.cve_id)
        .bind(&v.title)
        .bind(&v.description)
        .bind(v.cvss_score)
        .bind(&v.cvss_vector)
        .bind(v.severity.to_string())
        .bind(v.exploited_in_the_wild)
        .bind(v.cisa_due_date)
        .bind(serde_json::to_value(&v.sources).unwrap_or_default())
        .bind(serde_json::to_value(&v.cwe_ids).unwrap_or_default())
        .bind(serde_json::to_value(&v.vendors).unwrap_or_default())
        .bind(serde_json::to_value(&v.products).unwrap_or_default())
        .bind(serde_json::to_value(&v.affected_products).unwrap_or_default())
        .bind(serde_json::to_value(&v.references).unwrap_or_default())
        .bind(serde_json::to_value(&v.source_tags).unwrap_or_default())
        .bind(&v.simple_title)
        .bind(&v.simple_description)
        .bind(v.llm_processed)
        .bind(v.llm_processed_at)
        .bind(v.upvotes)
        .bind(v.downvotes)
        .bind(v.priority_score)
        .bind(v.published_at)
        .bind(v.modified_at)
        .bind(v.created_at)
        .bind(v.updated_at)
        .bind(serde_json::to_value(&new_row.provenance).unwrap_or_default())
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        tx.commit().await.map_err(store_err)?;
        Ok(outcome)
    }

    async fn get_vulnerability(&self, cve_id: &str) -> Result<Option<StoredRow>> {
        let row = sqlx::query("SELECT * FROM vulnerabilities WHERE cve_id = $1")
            .bind(cve_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref().map(row_to_stored_row).transpose()
    }

    async fn search(&self, filter: &SearchFilter) -> Result<Vec<StoredRow>> {
        let order_by = match filter.sort {
            Some(SortKey::PriorityScore) => "priority_score DESC",
            Some(SortKey::PublishedAt) => "published_at DESC",
            Some(SortKey::ModifiedAt) => "modified_at DESC",
            None => "priority_score DESC",
        };
        let limit = if filter.limit > 0 { filter.limit } else { 50 };

        let sql = format!(
            r"
            SELECT * FROM vulnerabilities
            WHERE ($1::text IS NULL OR cve_id LIKE $1 || '%')
              AND ($2::text IS NULL OR cve_id || ' ' || coalesce(title, '') || ' ' || coalesce(description, '') ILIKE '%' || $2 || '%')
            ORDER BY {order_by}
            LIMIT $3
            "
        );

        let rows = sqlx::query(&sql)
            .bind(&filter.cve_id_prefix)
            .bind(&filter.text)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;

        rows.iter().map(row_to_stored_row).collect()
    }

    async fn list_candidates_for_llm(&self, filter: LlmCandidateFilter) -> Result<Vec<StoredRow>> {
        let class = priority_class_str(filter.priority_class);
        let rows = sqlx::query(
            r"
            SELECT v.* FROM vulnerabilities v
            INNER JOIN llm_tasks t ON t.cve_id = v.cve_id
            WHERE t.priority_class = $1 AND t.state = 'pending'
            LIMIT $2
            ",
        )
        .bind(class)
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter().map(row_to_stored_row).collect()
    }

    async fn mark_llm_processed(
        &self,
        cve_id: &str,
        simple_title: &str,
        simple_description: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(store_err)?;
        sqlx::query(
            r"UPDATE vulnerabilities SET simple_title = $1, simple_description = $2,
               llm_processed = true, llm_processed_at = $3, updated_at = $3 WHERE cve_id = $4",
        )
        .bind(simple_title)
        .bind(simple_description)
        .bind(at)
        .bind(cve_id)
        .execute(&mut *tx)
        .await
        .map_err(store_err)?;

        sqlx::query("UPDATE llm_tasks SET state = 'done' WHERE cve_id = $1")
            .bind(cve_id)
            .execute(&mut *tx)
            .await
            .map_err(store_err)?;

        tx.commit().await.map_err(store_err)
    }

    async fn mark_llm_failed(&self, cve_id: &str, error: &str, at: DateTime<Utc>) -> Result<()> {
        let _ = at;
        sqlx::query(
            r"UPDATE llm_tasks SET attempts = attempts + 1, last_error = $1,
               state = CASE WHEN attempts + 1 >= 3 THEN 'failed' ELSE 'pending' END
               WHERE cve_id = $2",
        )
        .bind(error)
        .bind(cve_id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn enqueue_llm_task(&self, cve_id: &str, priority_class: PriorityClass, at: DateTime<Utc>) -> Result<()> {
        let class = priority_class_str(priority_class);
        sqlx::query(
            r"
            INSERT INTO llm_tasks (cve_id, priority_class, state, attempts, last_error, enqueued_at)
            VALUES ($1, $2, 'pending', 0, NULL, $3)
            ON CONFLICT (cve_id) DO UPDATE SET
                priority_class = CASE
                    WHEN array_position(ARRAY['low','medium','high'], EXCLUDED.priority_class)
                         > array_position(ARRAY['low','medium','high'], llm_tasks.priority_class)
                    THEN EXCLUDED.priority_class ELSE llm_tasks.priority_class END,
                state = CASE WHEN llm_tasks.state IN ('failed', 'done') THEN 'pending' ELSE llm_tasks.state END,
                attempts = CASE WHEN llm_tasks.state IN ('failed', 'done') THEN 0 ELSE llm_tasks.attempts END,
                enqueued_at = CASE WHEN llm_tasks.state IN ('failed', 'done') THEN EXCLUDED.enqueued_at ELSE llm_tasks.enqueued_at END
            ",
        )
        .bind(cve_id)
        .bind(class)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn drain_llm_tasks(&self, priority_class: PriorityClass, limit: i64) -> Result<Vec<LlmTask>> {
        let class = priority_class_str(priority_class);
        let rows = sqlx::query(
            r"
            UPDATE llm_tasks SET state = 'in_progress'
            WHERE cve_id IN (
                SELECT cve_id FROM llm_tasks
                WHERE priority_class = $1 AND state = 'pending'
                ORDER BY enqueued_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING cve_id, priority_class, state, attempts, last_error, enqueued_at
            ",
        )
        .bind(class)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;

        rows.into_iter()
            .map(|row| {
                Ok(LlmTask {
                    cve_id: row.try_get("cve_id").map_err(store_err)?,
                    priority_class,
                    state: LlmTaskState::InProgress,
                    attempts: row.try_get::<i32, _>("attempts").map_err(store_err)? as u32,
                    last_error: row.try_get("last_error").map_err(store_err)?,
                    enqueued_at: row.try_get("enqueued_at").map_err(store_err)?,
                })
            })
            .collect()
    }

    async fn start_ingestion_run(&self, source: &str, id: Uuid, now: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            "INSERT INTO ingestion_runs (id, source, status, started_at) VALUES ($1, $2, 'running', $3)",
        )
        .bind(id)
        .bind(source)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn finish_ingestion_run(
        &self,
        id: Uuid,
        status: IngestionRunStatus,
        counts: IngestionCounts,
        now: DateTime<Utc>,
        error: Option<String>,
    ) -> Result<()> {
        let status_str = match status {
            IngestionRunStatus::Running => "running",
            IngestionRunStatus::Success => "success",
            IngestionRunStatus::Failed => "failed",
        };
        sqlx::query(
            r"UPDATE ingestion_runs SET status = $1, records_fetched = $2, records_inserted = $3,
               records_updated = $4, records_failed = $5, completed_at = $6,
               duration_seconds = EXTRACT(EPOCH FROM ($6 - started_at)), error_summary = $7
               WHERE id = $8",
        )
        .bind(status_str)
        .bind(counts.records_fetched)
        .bind(counts.records_inserted)
        .bind(counts.records_updated)
        .bind(counts.records_failed)
        .bind(now)
        .bind(error)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn get_ingestion_run(&self, id: Uuid) -> Result<Option<IngestionRun>> {
        let row = sqlx::query("SELECT * FROM ingestion_runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        let Some(row) = row else { return Ok(None) };
        let status_str: String = row.try_get("status").map_err(store_err)?;
        let status = match status_str.as_str() {
            "success" => IngestionRunStatus::Success,
            "failed" => IngestionRunStatus::Failed,
            _ => IngestionRunStatus::Running,
        };
        Ok(Some(IngestionRun {
            id: row.try_get("id").map_err(store_err)?,
            source: row.try_get("source").map_err(store_err)?,
            status,
            records_fetched: row.try_get("records_fetched").map_err(store_err)?,
            records_inserted: row.try_get("records_inserted").map_err(store_err)?,
            records_updated: row.try_get("records_updated").map_err(store_err)?,
            records_failed: row.try_get("records_failed").map_err(store_err)?,
            started_at: row.try_get("started_at").map_err(store_err)?,
            completed_at: row.try_get("completed_at").map_err(store_err)?,
            duration_seconds: row.try_get("duration_seconds").map_err(store_err)?,
            error_summary: row.try_get("error_summary").map_err(store_err)?,
        }))
    }

    async fn read_stats(&self) -> Result<StatsCache> {
        let row = sqlx::query("SELECT * FROM stats_cache WHERE id = TRUE")
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        match row {
            Some(row) => Ok(StatsCache {
                total: row.try_get("total").map_err(store_err)?,
                exploited: row.try_get("exploited").map_err(store_err)?,
                critical: row.try_get("critical").map_err(store_err)?,
                high: row.try_get("high").map_err(store_err)?,
                medium: row.try_get("medium").map_err(store_err)?,
                low: row.try_get("low").map_err(store_err)?,
                unknown: row.try_get("unknown").map_err(store_err)?,
                published_last_7_days: row.try_get("published_last_7_days").map_err(store_err)?,
                last_calculated_at: row.try_get("last_calculated_at").map_err(store_err)?,
            }),
            None => Ok(StatsCache::empty(Utc::now())),
        }
    }

    async fn compute_stats(&self, now: DateTime<Utc>) -> Result<StatsCache> {
        let row = sqlx::query(
            r"
            SELECT
                count(*) AS total,
                count(*) FILTER (WHERE exploited_in_the_wild) AS exploited,
                count(*) FILTER (WHERE severity = 'CRITICAL') AS critical,
                count(*) FILTER (WHERE severity = 'HIGH') AS high,
                count(*) FILTER (WHERE severity = 'MEDIUM') AS medium,
                count(*) FILTER (WHERE severity = 'LOW') AS low,
                count(*) FILTER (WHERE severity = 'UNKNOWN') AS unknown,
                count(*) FILTER (WHERE published_at >= $1) AS published_last_7_days
            FROM vulnerabilities
            ",
        )
        .bind(now - chrono::Duration::days(7))
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;

        Ok(StatsCache {
            total: row.try_get("total").map_err(store_err)?,
            exploited: row.try_get("exploited").map_err(store_err)?,
            critical: row.try_get("critical").map_err(store_err)?,
            high: row.try_get("high").map_err(store_err)?,
            medium: row.try_get("medium").map_err(store_err)?,
            low: row.try_get("low").map_err(store_err)?,
            unknown: row.try_get("unknown").map_err(store_err)?,
            published_last_7_days: row.try_get("published_last_7_days").map_err(store_err)?,
            last_calculated_at: now,
        })
    }

    async fn write_stats(&self, stats: StatsCache) -> Result<()> {
        sqlx::query(
            r"
            INSERT INTO stats_cache (
                id, total, exploited, critical, high, medium, low, unknown,
                published_last_7_days, last_calculated_at
            ) VALUES (TRUE, $1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                total = EXCLUDED.total, exploited = EXCLUDED.exploited,
                critical = EXCLUDED.critical, high = EXCLUDED.high,
                medium = EXCLUDED.medium, low = EXCLUDED.low, unknown = EXCLUDED.unknown,
                published_last_7_days = EXCLUDED.published_last_7_days,
                last_calculated_at = EXCLUDED.last_calculated_at
            ",
        )
        .bind(stats.total)
        .bind(stats.exploited)
        .bind(stats.critical)
        .bind(stats.high)
        .bind(stats.medium)
        .bind(stats.low)
        .bind(stats.unknown)
        .bind(stats.published_last_7_days)
        .bind(stats.last_calculated_at)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn get_checkpoint(&self, source: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM fetch_checkpoints WHERE source = $1")
            .bind(source)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.map(|r| r.try_get("value").map_err(store_err)).transpose()
    }

    async fn set_checkpoint(&self, source: &str, value: &str) -> Result<()> {
        sqlx::query(
            r"INSERT INTO fetch_checkpoints (source, value) VALUES ($1, $2)
               ON CONFLICT (source) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(source)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn list_exploited(&self) -> Result<Vec<StoredRow>> {
        let rows = sqlx::query("SELECT * FROM vulnerabilities WHERE exploited_in_the_wild = true")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter().map(row_to_stored_row).collect()
    }

    async fn save_rows(&self, rows: Vec<StoredRow>) -> Result<()> {
        for row in rows {
            let cve_id = row.vulnerability.cve_id.clone();
            self.upsert_vulnerability(&cve_id, Box::new(move |_| (row, MergeOutcome::Updated)))
                .await?;
        }
        Ok(())
    }
}

fn priority_class_str(class: PriorityClass) -> &'static str {
    match class {
        PriorityClass::High => "high",
        PriorityClass::Medium => "medium",
        PriorityClass::Low => "low",
    }
}
