use relaycore::OverduePolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Configuration for the runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub max_parallel_steps: usize,
    pub event_buffer_size: usize,
    /// Route untagged steps to the mock executor
    pub use_mock: bool,
    pub default_approval_timeout_secs: u64,
    pub default_step_timeout_secs: Option<u64>,
    pub overdue: OverduePolicy,
    /// Finished runs kept for lookup; older ones are evicted with their
    /// approval history
    pub max_retained_runs: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_parallel_steps: 10,
            event_buffer_size: 1000,
            use_mock: false,
            default_approval_timeout_secs: 3600,
            default_step_timeout_secs: None,
            overdue: OverduePolicy::default(),
            max_retained_runs: 1000,
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Load a config file; missing keys fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn with_mock(mut self, use_mock: bool) -> Self {
        self.use_mock = use_mock;
        self
    }

    pub fn with_max_retained_runs(mut self, max: usize) -> Self {
        self.max_retained_runs = max;
        self
    }

    pub fn with_max_parallel_steps(mut self, max: usize) -> Self {
        self.max_parallel_steps = max.max(1);
        self
    }
}
