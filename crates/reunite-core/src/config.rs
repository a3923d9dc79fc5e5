use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{
    COMPLETION_CHANNEL_SIZE, DEFAULT_PREVIEW_CHARS, ENRICHMENT_MAX_ATTEMPTS,
    ENRICHMENT_RETRY_INTERVAL_MS, MISSING_SUBJECT_LABEL, UNKNOWN_USER_LABEL,
};

/// Session configuration, loadable from a camelCase JSON file.
/// Missing fields fall back to the defaults in `constants`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessagingConfig {
    pub unknown_user_label: String,
    pub missing_subject_label: String,
    pub preview_chars: usize,
    pub enrichment_retry_interval_ms: u64,
    pub enrichment_max_attempts: u32,
    pub completion_channel_size: usize,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            unknown_user_label: UNKNOWN_USER_LABEL.to_string(),
            missing_subject_label: MISSING_SUBJECT_LABEL.to_string(),
            preview_chars: DEFAULT_PREVIEW_CHARS,
            enrichment_retry_interval_ms: ENRICHMENT_RETRY_INTERVAL_MS,
            enrichment_max_attempts: ENRICHMENT_MAX_ATTEMPTS,
            completion_channel_size: COMPLETION_CHANNEL_SIZE,
        }
    }
}

impl MessagingConfig {
    /// Load config from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_json(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to deserialize config")
    }

    pub fn enrichment_retry_interval(&self) -> Duration {
        // tokio::time::interval panics on a zero period
        Duration::from_millis(self.enrichment_retry_interval_ms.max(1))
    }
}
