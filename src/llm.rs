//! LLM enrichment queue (spec §4.7): a bounded drain of `LlmTask`s that
//! asks an external generator for `simple_title`/`simple_description` and
//! writes the sanitized result back via the Store. Optional end-to-end:
//! if the generator is unreachable or `LLM_ENABLED=false`, the drain is a
//! no-op and enrichment fields are simply left unset.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{OpenThreatError, Result};
use crate::models::{LlmTask, PriorityClass, Severity};
use crate::store::Store;
use crate::worker::{CancelToken, Job};

const TITLE_MAX_CHARS: usize = 80;
const DESCRIPTION_MAX_CHARS: usize = 500;

/// Batch sizes per tick by priority class (spec §4.7). `llm-drain-new`
/// shares the `high` batch size; it targets the same class at a tighter
/// cadence (spec §4.5 names it separately from `llm-drain-high`).
pub fn batch_size(class: PriorityClass) -> i64 {
    match class {
        PriorityClass::High => 10,
        PriorityClass::Medium => 20,
        PriorityClass::Low => 50,
    }
}

pub struct GenerationContext {
    pub cve_id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub severity: Severity,
    pub cvss_score: Option<f64>,
    pub vendors: Vec<String>,
}

pub struct GeneratedText {
    pub simple_title: String,
    pub simple_description: String,
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, ctx: &GenerationContext) -> Result<GeneratedText>;
}

#[derive(Debug, Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
}

/// `Generator` backed by a local Ollama instance (spec §4.7, §6:
/// `OLLAMA_HOST`/`OLLAMA_MODEL`).
pub struct OllamaGenerator {
    http: reqwest::Client,
    host: String,
    model: String,
}

impl OllamaGenerator {
    pub fn new(host: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            host: host.into(),
            model: model.into(),
        }
    }

    fn prompt_for(ctx: &GenerationContext) -> String {
        format!(
            "Rewrite this vulnerability for a non-expert reader. Respond with exactly two lines, \
            the first beginning \"TITLE:\" (at most {TITLE_MAX_CHARS} characters) and the second \
            beginning \"DESCRIPTION:\" (at most {DESCRIPTION_MAX_CHARS} characters). Do not add \
            any other text.\n\n\
            CVE: {}\nSeverity: {}\nCVSS: {}\nVendors: {}\nTitle: {}\nDescription: {}",
            ctx.cve_id,
            ctx.severity,
            ctx.cvss_score.map(|s| s.to_string()).unwrap_or_else(|| "unknown".to_string()),
            ctx.vendors.join(", "),
            ctx.title.as_deref().unwrap_or(""),
            ctx.description.as_deref().unwrap_or(""),
        )
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    async fn generate(&self, ctx: &GenerationContext) -> Result<GeneratedText> {
        let url = format!("{}/api/generate", self.host.trim_end_matches('/'));
        let body = OllamaRequest {
            model: &self.model,
            prompt: Self::prompt_for(ctx),
            stream: false,
        };

        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| OpenThreatError::TransientUpstream(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(OpenThreatError::TransientUpstream(format!("ollama returned {}", resp.status())));
        }

        let parsed: OllamaResponse = resp
            .json()
            .await
            .map_err(|e| OpenThreatError::MalformedRecord(e.to_string()))?;

        parse_generated_text(&parsed.response)
    }
}

/// Splits the model's two-line `TITLE:`/`DESCRIPTION:` response and
/// sanitizes each field (spec §4.7: strip preambles, quotes, blank lines,
/// enforce length bounds).
fn parse_generated_text(raw: &str) -> Result<GeneratedText> {
    let mut title = None;
    let mut description = None;
    for line in raw.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("TITLE:") {
            title = Some(sanitize(rest, TITLE_MAX_CHARS));
        } else if let Some(rest) = line.strip_prefix("DESCRIPTION:") {
            description = Some(sanitize(rest, DESCRIPTION_MAX_CHARS));
        }
    }
    match (title, description) {
        (Some(simple_title), Some(simple_description)) if !simple_title.is_empty() && !simple_description.is_empty() => {
            Ok(GeneratedText {
                simple_title,
                simple_description,
            })
        }
        _ => Err(OpenThreatError::MalformedRecord("generator response missing TITLE/DESCRIPTION".to_string())),
    }
}

const PREAMBLE_PHRASES: &[&str] = &["here is", "here's", "sure,", "certainly,"];

/// Strips leading preamble phrases, surrounding quotes, and blank lines,
/// then truncates to `max_chars` (spec §4.7).
fn sanitize(raw: &str, max_chars: usize) -> String {
    let mut text = raw.trim().to_string();

    let is_quote = |c: char| c == '"' || c == '\'';
    if text.len() >= 2 && text.starts_with(is_quote) && text.ends_with(is_quote) {
        text = text[1..text.len() - 1].trim().to_string();
    }

    loop {
        let lower = text.to_lowercase();
        if let Some(phrase) = PREAMBLE_PHRASES.iter().find(|p| lower.starts_with(**p)) {
            text = text[phrase.len()..].trim_start().to_string();
        } else {
            break;
        }
    }

    if text.chars().count() > max_chars {
        text = text.chars().take(max_chars).collect();
    }
    text
}

/// A `Job` that drains up to `batch_size(class)` tasks of `class`,
/// generating and persisting enrichment for each (spec §4.7 draining
/// rules). When `generator` is `None` (matches `LLM_ENABLED=false`,
/// spec §6) the job is a documented no-op.
pub struct LlmDrainJob {
    name: &'static str,
    class: PriorityClass,
    store: Arc<dyn Store>,
    generator: Option<Arc<dyn Generator>>,
}

impl LlmDrainJob {
    pub fn new(name: &'static str, class: PriorityClass, store: Arc<dyn Store>, generator: Option<Arc<dyn Generator>>) -> Self {
        Self {
            name,
            class,
            store,
            generator,
        }
    }

    async fn process_task(&self, generator: &Arc<dyn Generator>, task: LlmTask) -> Result<()> {
        let now = Utc::now();
        let row = self.store.get_vulnerability(&task.cve_id).await?;
        let Some(row) = row else {
            return Ok(());
        };
        let v = row.vulnerability;
        let ctx = GenerationContext {
            cve_id: v.cve_id.clone(),
            title: v.title.clone(),
            description: v.description.clone(),
            severity: v.severity,
            cvss_score: v.cvss_score,
            vendors: v.vendors.clone(),
        };

        match generator.generate(&ctx).await {
            Ok(generated) => {
                self.store
                    .mark_llm_processed(&v.cve_id, &generated.simple_title, &generated.simple_description, now)
                    .await?;
            }
            Err(e) => {
                self.store.mark_llm_failed(&v.cve_id, &e.to_string(), now).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Job for LlmDrainJob {
    fn name(&self) -> &str {
        self.name
    }

    async fn run(&self, cancel: &CancelToken) -> Result<()> {
        let Some(generator) = self.generator.clone() else {
            info!(job = self.name, "llm disabled, drain is a no-op");
            return Ok(());
        };

        let limit = batch_size(self.class);
        let tasks = self.store.drain_llm_tasks(self.class, limit).await?;
        info!(job = self.name, class = ?self.class, count = tasks.len(), "draining llm tasks");

        for task in tasks {
            if cancel.is_cancelled() {
                return Err(OpenThreatError::Cancelled);
            }
            if let Err(e) = self.process_task(&generator, task.clone()).await {
                warn!(job = self.name, cve_id = %task.cve_id, error = %e, "llm task failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_preamble_and_quotes() {
        let raw = "\"Here is a summary: A critical flaw in widget.\"";
        assert_eq!(sanitize(raw, 80), "a summary: A critical flaw in widget.");
    }

    #[test]
    fn sanitize_truncates_to_bound() {
        let raw = "x".repeat(120);
        assert_eq!(sanitize(&raw, 80).chars().count(), 80);
    }

    #[test]
    fn parse_generated_text_reads_both_lines() {
        let raw = "TITLE: Critical flaw\nDESCRIPTION: Affects widget versions before 2.0";
        let parsed = parse_generated_text(raw).unwrap();
        assert_eq!(parsed.simple_title, "Critical flaw");
        assert_eq!(parsed.simple_description, "Affects widget versions before 2.0");
    }

    #[test]
    fn parse_generated_text_rejects_missing_fields() {
        let raw = "Just a sentence with no markers.";
        assert!(parse_generated_text(raw).is_err());
    }

    #[test]
    fn batch_sizes_match_spec_table() {
        assert_eq!(batch_size(PriorityClass::High), 10);
        assert_eq!(batch_size(PriorityClass::Medium), 20);
        assert_eq!(batch_size(PriorityClass::Low), 50);
    }

    #[tokio::test]
    async fn drain_is_a_noop_when_llm_disabled() {
        use crate::store::{MemoryStore, Store};
        use crate::worker::CancelToken;
        use chrono::Utc;

        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        store.enqueue_llm_task("CVE-2024-0001", PriorityClass::High, Utc::now()).await.unwrap();

        let job = LlmDrainJob::new("llm-drain-high", PriorityClass::High, store.clone(), None);
        job.run(&CancelToken::new()).await.unwrap();

        let remaining = store.drain_llm_tasks(PriorityClass::High, 10).await.unwrap();
        assert_eq!(remaining.len(), 1, "a disabled drain must leave the task pending, not consume it");
        assert_eq!(remaining[0].cve_id, "CVE-2024-0001");
    }
}
