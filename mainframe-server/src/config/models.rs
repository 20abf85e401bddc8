use std::{path::PathBuf, time::Duration};

use mainframe_core::{MainframeConfig, RulesCatalog};

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    pub rules: RulesConfig,
    pub snapshot_interval: Duration,
    pub mainframe: MainframeConfig,
    pub metadata: ConfigMetadata,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct RulesConfig {
    pub commit: Option<String>,
    pub known: Vec<String>,
}

impl RulesConfig {
    pub fn catalog(&self) -> RulesCatalog {
        RulesCatalog::new(self.commit.clone()).with_rules(self.known.iter().cloned())
    }
}

/// Where the configuration came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}
