use std::{env, path::PathBuf};

use mainframe_core::MainframeConfig;
use serde::{Deserialize, Serialize};

/// Raw configuration as written in `mainframe.toml`.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub database: FileDatabaseConfig,
    #[serde(default)]
    pub rules: FileRulesConfig,
    #[serde(default)]
    pub server: FileServerConfig,
    /// Coordinator knobs, deserialized straight into the core config.
    #[serde(default)]
    pub mainframe: MainframeConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileDatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
    /// Humantime string, e.g. `"5s"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acquire_timeout: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileRulesConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub known: Vec<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileServerConfig {
    /// How often `serve` logs the ledger status counts. Humantime string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_interval: Option<String>,
}

/// Values taken from the process environment.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub config_path: Option<PathBuf>,
    pub database_url: Option<String>,
    pub rules_commit: Option<String>,
}

impl EnvConfig {
    pub fn gather() -> Self {
        Self {
            config_path: non_empty("MAINFRAME_CONFIG_PATH").map(PathBuf::from),
            database_url: non_empty("DATABASE_URL"),
            rules_commit: non_empty("MAINFRAME_RULES_COMMIT"),
        }
    }
}

fn non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
