use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub enabled: bool,
    pub ollama_host: String,
    pub ollama_model: String,

    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ollama_host: "http://localhost:11434".to_string(),
            ollama_model: "llama3".to_string(),
            request_timeout: Duration::from_secs(30),
        }
    }
}
