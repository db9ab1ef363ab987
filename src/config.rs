//! Layered configuration (spec §0.2): a TOML file as the base source,
//! overlaid by `OPENTHREAT__`-prefixed environment variables, composed
//! into one typed struct the way the source codebase's
//! `CrystalForgeConfig::load()` does.

pub mod database;
pub mod fetchers;
pub mod llm;
pub mod scheduler;
pub mod worker;

pub use database::DatabaseConfig;
pub use fetchers::FetcherConfig;
pub use llm::LlmConfig;
pub use scheduler::SchedulerConfig;
pub use worker::WorkerConfig;

use anyhow::{Context, Result};
use config::Config;
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::env;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct OpenThreatConfig {
    pub database: DatabaseConfig,
    pub fetchers: FetcherConfig,
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
    pub llm: LlmConfig,
}

impl OpenThreatConfig {
    pub fn load() -> Result<Self> {
        let config_path = env::var("OPENTHREAT_CONFIG").unwrap_or_else(|_| "/etc/openthreat/config.toml".to_string());

        let settings = Config::builder()
            .add_source(config::File::with_name(&config_path).required(false))
            .add_source(config::Environment::with_prefix("OPENTHREAT").separator("__"))
            .build()
            .context("loading configuration")?;

        let mut cfg: Self = settings.try_deserialize().context("parsing configuration")?;
        cfg.apply_flat_env_overrides();
        Ok(cfg)
    }

    /// A handful of environment variables are documented in their own
    /// right (spec §6) rather than under the `OPENTHREAT__` hierarchy;
    /// these take precedence over whatever the layered sources produced.
    fn apply_flat_env_overrides(&mut self) {
        if let Ok(url) = env::var("DATABASE_URL") {
            self.database.url = url;
        }
        if let Ok(key) = env::var("NVD_API_KEY") {
            self.fetchers.nvd_api_key = Some(key);
        }
        if let Ok(host) = env::var("OLLAMA_HOST") {
            self.llm.ollama_host = host;
        }
        if let Ok(model) = env::var("OLLAMA_MODEL") {
            self.llm.ollama_model = model;
        }
        if let Ok(enabled) = env::var("LLM_ENABLED") {
            if let Ok(parsed) = enabled.parse::<bool>() {
                self.llm.enabled = parsed;
            }
        }
        if let Ok(concurrency) = env::var("WORKER_CONCURRENCY") {
            if let Ok(parsed) = concurrency.parse::<usize>() {
                self.worker.concurrency = parsed;
            }
        }
    }

    pub async fn db_pool(&self) -> Result<PgPool> {
        PgPoolOptions::new()
            .max_connections(self.database.max_connections)
            .connect(&self.database.url)
            .await
            .context("connecting to database")
    }
}
