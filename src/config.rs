//! Engine Configuration
//!
//! Loaded from YAML. Every field has a default, so an empty file is a valid
//! configuration.
//!
//! ```yaml
//! max_concurrency: 8
//! default_deadline_ms: 30000
//! retained_runs: 1000
//! circuit:
//!   window_size: 20
//!   cool_down_ms: 10000
//! services:
//!   image_analysis:
//!     kind: http
//!     url: http://vision.internal:8080/analyze
//!   recommendation:
//!     kind: command
//!     program: ./bin/recommend
//!     args: [--model, small]
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::policy::CircuitConfig;

/// How to reach one named service.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServiceConfig {
    Http {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Maximum in-flight steps per run
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Run deadline when the caller sets none; `null` disables it
    #[serde(default = "default_deadline_ms")]
    pub default_deadline_ms: Option<u64>,

    /// Finished runs kept for `status`/`wait` before the oldest are evicted
    #[serde(default = "default_retained_runs")]
    pub retained_runs: usize,

    #[serde(default)]
    pub circuit: CircuitConfig,

    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

fn default_max_concurrency() -> usize {
    4
}

fn default_deadline_ms() -> Option<u64> {
    Some(60_000)
}

fn default_retained_runs() -> usize {
    256
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            default_deadline_ms: default_deadline_ms(),
            retained_runs: default_retained_runs(),
            circuit: CircuitConfig::default(),
            services: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn default_deadline(&self) -> Option<Duration> {
        self.default_deadline_ms.map(Duration::from_millis)
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_retained_runs(mut self, retained_runs: usize) -> Self {
        self.retained_runs = retained_runs;
        self
    }

    pub fn with_default_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.default_deadline_ms = deadline.map(|d| d.as_millis() as u64);
        self
    }
}

/// Parses configuration from YAML text.
pub fn parse_config(yaml: &str) -> Result<EngineConfig, ConfigError> {
    // An empty document deserializes as null, not as an empty mapping.
    if yaml.trim().is_empty() {
        return Ok(EngineConfig::default());
    }
    let config: EngineConfig = serde_yaml::from_str(yaml)?;
    debug!(
        "Parsed config: max_concurrency={}, {} services",
        config.max_concurrency,
        config.services.len()
    );
    Ok(config)
}

/// Loads configuration from a YAML file.
pub fn load_config(path: impl AsRef<Path>) -> Result<EngineConfig, ConfigError> {
    let path = path.as_ref();
    info!("Loading config from: {}", path.display());

    let yaml = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&yaml)
}
