//! TOML config file: `ClientID`/`Key`, loaded alongside the CLI flags that
//! may override them (spec.md §6).

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// On-disk config shape, matching the Go client's `ClientID`/`Key` TOML
/// keys (`examples/original_source/client.go`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    #[serde(rename = "ClientID")]
    pub client_id: Option<i64>,
    #[serde(rename = "Key")]
    pub key: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}
