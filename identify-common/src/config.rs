//! Service configuration loading
//!
//! Resolution priority, highest first:
//! 1. Command-line argument
//! 2. Environment variable
//! 3. TOML config file
//! 4. Compiled default
//!
//! Levels 1 and 2 are resolved by the server's argument parser and applied
//! through [`ConfigOverrides`]; this module owns levels 3 and 4.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// How the engine elects a primary when an observation touches several groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeStrategy {
    /// Resolve every matched record to its group's true primary and merge
    /// all involved groups under the smallest id
    #[default]
    Transitive,
    /// Elect and relink over the directly matched records only
    Direct,
}

impl FromStr for MergeStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "transitive" => Ok(MergeStrategy::Transitive),
            "direct" => Ok(MergeStrategy::Direct),
            other => Err(Error::Config(format!(
                "Unknown merge strategy '{}' (expected 'transitive' or 'direct')",
                other
            ))),
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeStrategy::Transitive => write!(f, "transitive"),
            MergeStrategy::Direct => write!(f, "direct"),
        }
    }
}

/// Identity service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Interface to bind the HTTP listener to
    pub host: String,
    /// HTTP listener port
    pub port: u16,
    /// SQLite database file
    pub database_path: PathBuf,
    /// Connection pool size
    pub max_connections: u32,
    /// SQLite busy timeout applied to every connection
    pub busy_timeout_ms: u64,
    /// Total time a reconcile call may spend retrying on lock contention
    pub lock_retry_max_wait_ms: u64,
    pub merge_strategy: MergeStrategy,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            database_path: default_database_path(),
            max_connections: 10,
            busy_timeout_ms: 5000,
            lock_retry_max_wait_ms: 2000,
            merge_strategy: MergeStrategy::default(),
        }
    }
}

/// Values supplied on the command line or through the environment
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub database_path: Option<PathBuf>,
    pub merge_strategy: Option<MergeStrategy>,
}

impl ServiceConfig {
    /// Load configuration from a TOML file
    ///
    /// An explicit path must exist. Without one, the platform config file is
    /// used when present and compiled defaults otherwise.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let path = match explicit_path {
            Some(path) => {
                if !path.exists() {
                    return Err(Error::Config(format!(
                        "Config file not found: {}",
                        path.display()
                    )));
                }
                path.to_path_buf()
            }
            None => match default_config_path() {
                Some(path) if path.exists() => path,
                _ => {
                    tracing::debug!("No config file found, using compiled defaults");
                    return Ok(Self::default());
                }
            },
        };

        let content = std::fs::read_to_string(&path)?;
        let config = Self::from_toml(&content)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;

        tracing::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse configuration from TOML text; missing keys take their defaults
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: ServiceConfig =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply command-line / environment values on top of file values
    pub fn apply_overrides(mut self, overrides: ConfigOverrides) -> Result<Self> {
        if let Some(host) = overrides.host {
            self.host = host;
        }
        if let Some(port) = overrides.port {
            self.port = port;
        }
        if let Some(path) = overrides.database_path {
            self.database_path = path;
        }
        if let Some(strategy) = overrides.merge_strategy {
            self.merge_strategy = strategy;
        }
        self.validate()?;
        Ok(self)
    }

    /// Address string for the HTTP listener
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be at least 1".to_string()));
        }
        if self.host.trim().is_empty() {
            return Err(Error::Config("host must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Platform config file location (e.g. ~/.config/identify/config.toml)
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("identify").join("config.toml"))
}

/// OS-dependent default database location
fn default_database_path() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("identify").join("identify.db"))
        .unwrap_or_else(|| PathBuf::from("./identify_data/identify.db"))
}
