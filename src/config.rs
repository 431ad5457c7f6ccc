//! Configuration System
//!
//! Hierarchical configuration loading from:
//! - groundlog.toml (project configuration)
//! - Environment variables (GROUNDLOG_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # groundlog.toml
//! [analysis]
//! max_refinement_passes = 3
//! relationalize = true
//!
//! [logging]
//! level = "debug"
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! GROUNDLOG_ANALYSIS__MAX_REFINEMENT_PASSES=5
//! GROUNDLOG_LOGGING__LEVEL=trace
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Grounding analysis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Bound on the generator-improvement loop; 0 disables inlining and
    /// improvement. A termination guard, not a correctness parameter.
    #[serde(default = "default_refinement_passes")]
    pub max_refinement_passes: usize,

    /// Enable the query rewrite pass
    #[serde(default = "default_true")]
    pub relationalize: bool,

    /// Pattern-match coverage checking (consumes the same IR; orthogonal to
    /// grounding)
    #[serde(default = "default_true")]
    pub match_coverage: bool,

    /// Affects downstream compilation only
    #[serde(default)]
    pub hybrid_backend: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            max_refinement_passes: 3,
            relationalize: true,
            match_coverage: true,
            hybrid_backend: false,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
        }
    }
}

fn default_refinement_passes() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load from `groundlog.toml` and `GROUNDLOG_*` environment variables
    pub fn load() -> Result<Config, figment::Error> {
        Self::figment(Path::new("groundlog.toml")).extract()
    }

    /// Load from an explicit TOML file path plus environment overrides
    pub fn load_from(path: &Path) -> Result<Config, figment::Error> {
        Self::figment(path).extract()
    }

    fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("GROUNDLOG_").split("__"))
    }
}
