//! TOML configuration for benchtop.
//!
//! Layered like the rest of the appliance tooling: an explicit path wins,
//! then the `BENCHTOP_CONFIG` environment variable, then the system location,
//! then compiled-in defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::executor::{millis, DEFAULT_PHASE_TIMEOUT};

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "BENCHTOP_CONFIG";

/// Standard system location.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/benchtop/benchtop.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BenchtopConfig {
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BenchtopConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Find the effective configuration.
    ///
    /// An explicit path must load. Without one, the path in
    /// `BENCHTOP_CONFIG` and then the system file are tried in turn, and
    /// compiled-in defaults are used when neither works.
    pub fn resolve(explicit: Option<&Path>) -> Result<ResolvedConfig> {
        if let Some(path) = explicit {
            return Ok(ResolvedConfig {
                config: Self::load(path)?,
                source: Some(path.to_path_buf()),
                rejected: Vec::new(),
            });
        }
        let from_env = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        Ok(Self::resolve_from(from_env, Path::new(SYSTEM_CONFIG_PATH)))
    }

    fn resolve_from(from_env: Option<PathBuf>, system: &Path) -> ResolvedConfig {
        let system = Some(system.to_path_buf()).filter(|p| p.exists());
        let mut rejected = Vec::new();
        for path in from_env.into_iter().chain(system) {
            match Self::load(&path) {
                Ok(config) => {
                    return ResolvedConfig {
                        config,
                        source: Some(path),
                        rejected,
                    }
                }
                Err(e) => rejected.push((path, e)),
            }
        }
        ResolvedConfig {
            config: Self::default(),
            source: None,
            rejected,
        }
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize configuration")
    }
}

/// Configuration plus where it came from.
///
/// Resolution happens before logging is set up, so the outcome is kept here
/// and reported through [`ResolvedConfig::log`] afterwards.
#[derive(Debug)]
pub struct ResolvedConfig {
    pub config: BenchtopConfig,
    /// `None` means compiled-in defaults.
    pub source: Option<PathBuf>,
    /// Candidate files that could not be loaded.
    pub rejected: Vec<(PathBuf, anyhow::Error)>,
}

impl ResolvedConfig {
    pub fn log(&self) {
        for (path, error) in &self.rejected {
            warn!(
                path = %path.display(),
                error = %format!("{error:#}"),
                "config file could not be loaded, falling back"
            );
        }
        match &self.source {
            Some(path) => info!(path = %path.display(), "loaded configuration"),
            None => debug!("no config file found, using compiled-in defaults"),
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Deadline for phases that do not set their own. Zero means the
    /// compiled-in default.
    pub phase_default_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            phase_default_timeout_ms: millis(DEFAULT_PHASE_TIMEOUT),
        }
    }
}

impl ExecutorConfig {
    pub fn default_timeout(&self) -> Duration {
        match self.phase_default_timeout_ms {
            0 => DEFAULT_PHASE_TIMEOUT,
            ms => Duration::from_millis(ms),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set (e.g. `"info"`).
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
