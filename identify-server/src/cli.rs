//! Command-line arguments
//!
//! Every argument can also come from the environment; file and compiled
//! defaults fill whatever is left.

use clap::Parser;
use identify_common::config::{ConfigOverrides, MergeStrategy, ServiceConfig};
use std::path::PathBuf;

/// Command-line arguments for identify-server
#[derive(Parser, Debug)]
#[command(name = "identify-server")]
#[command(about = "Contact identity reconciliation service")]
#[command(version)]
pub struct Args {
    /// TOML config file
    #[arg(short, long, env = "IDENTIFY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Interface to listen on
    #[arg(long, env = "IDENTIFY_HOST")]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// SQLite database file
    #[arg(short, long, env = "IDENTIFY_DATABASE")]
    pub database: Option<PathBuf>,

    /// Group merge strategy: transitive or direct
    #[arg(long, env = "IDENTIFY_MERGE_STRATEGY")]
    pub merge_strategy: Option<MergeStrategy>,
}

impl Args {
    /// Resolve the effective configuration (args/env > file > defaults)
    pub fn resolve_config(&self) -> identify_common::Result<ServiceConfig> {
        ServiceConfig::load(self.config.as_deref())?.apply_overrides(ConfigOverrides {
            host: self.host.clone(),
            port: self.port,
            database_path: self.database.clone(),
            merge_strategy: self.merge_strategy,
        })
    }
}
