use serde::{Deserialize, Serialize};

/// A single external reference URL attached to a vulnerability (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    pub url: String,
    pub source: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Reference {
    pub fn new(url: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            source: source.into(),
            tags: Vec::new(),
        }
    }
}
