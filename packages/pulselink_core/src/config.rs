//! Relay configuration
//!
//! A JSON document, every field optional:
//!
//! ```json
//! {
//!   "store": { "backend": "file", "data_dir": "./relay-data" },
//!   "link": { "latency_ms": 20, "activation_delay_ms": 0 }
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::{FileStore, InMemoryStore, RemoteStore, RestStore};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Cannot open store: {0}")]
    StoreUnavailable(String),
}

/// Which remote store backend to use.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StoreConfig {
    #[default]
    Memory,
    File {
        data_dir: PathBuf,
    },
    Rest {
        url: String,
        #[serde(default)]
        auth: Option<String>,
    },
}

/// Simulated link parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub latency_ms: u64,
    pub activation_delay_ms: u64,
}

impl LinkConfig {
    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms)
    }

    pub fn activation_delay(&self) -> Duration {
        Duration::from_millis(self.activation_delay_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub store: StoreConfig,
    pub link: LinkConfig,
}

impl RelayConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match &self.store {
            StoreConfig::Memory => {}
            StoreConfig::File { data_dir } => {
                if data_dir.as_os_str().is_empty() {
                    return Err(ConfigError::Invalid("store.data_dir is empty".to_string()));
                }
            }
            StoreConfig::Rest { url, .. } => {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(ConfigError::Invalid(format!(
                        "store.url must be http(s), got {:?}",
                        url
                    )));
                }
            }
        }
        Ok(())
    }

    /// Open the configured backend.
    pub fn open_store(&self) -> Result<Arc<dyn RemoteStore>, ConfigError> {
        self.validate()?;
        let store: Arc<dyn RemoteStore> = match &self.store {
            StoreConfig::Memory => Arc::new(InMemoryStore::new()),
            StoreConfig::File { data_dir } => Arc::new(
                FileStore::open(data_dir)
                    .map_err(|e| ConfigError::StoreUnavailable(e.to_string()))?,
            ),
            StoreConfig::Rest { url, auth } => Arc::new(
                RestStore::new(url, auth.clone())
                    .map_err(|e| ConfigError::StoreUnavailable(e.to_string()))?,
            ),
        };
        log::info!("[RelayConfig] Using {} store", self.store.backend_name());
        Ok(store)
    }
}

impl StoreConfig {
    pub fn backend_name(&self) -> &'static str {
        match self {
            StoreConfig::Memory => "memory",
            StoreConfig::File { .. } => "file",
            StoreConfig::Rest { .. } => "rest",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_all_defaults() {
        let config = RelayConfig::from_json_str("{}").unwrap();
        assert_eq!(config, RelayConfig::default());
        assert_eq!(config.store, StoreConfig::Memory);
        assert_eq!(config.link.latency(), Duration::ZERO);
    }

    #[test]
    fn test_tagged_backends() {
        let config = RelayConfig::from_json_str(
            r#"{"store": {"backend": "rest", "url": "https://example.invalid/db"},
                "link": {"latency_ms": 40}}"#,
        )
        .unwrap();
        assert_eq!(
            config.store,
            StoreConfig::Rest {
                url: "https://example.invalid/db".to_string(),
                auth: None
            }
        );
        assert_eq!(config.link.latency(), Duration::from_millis(40));
        assert_eq!(config.link.activation_delay_ms, 0);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            RelayConfig::from_json_str(r#"{"store": {"backend": "rest", "url": "ftp://x"}}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            RelayConfig::from_json_str(r#"{"store": {"backend": "file", "data_dir": ""}}"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            RelayConfig::from_json_str(r#"{"store": {"backend": "carrier-pigeon"}}"#),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[tokio::test]
    async fn test_load_from_file_and_open() {
        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let config_path = dir.path().join("relay.json");
        std::fs::write(
            &config_path,
            serde_json::to_string(&RelayConfig {
                store: StoreConfig::File {
                    data_dir: data_dir.clone(),
                },
                link: LinkConfig::default(),
            })
            .unwrap(),
        )
        .unwrap();

        let config = RelayConfig::load(&config_path).unwrap();
        let store = config.open_store().unwrap();
        assert_eq!(store.push_key().len(), 20);
        assert!(data_dir.join("append_log.jsonl").exists());
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            RelayConfig::load(Path::new("/definitely/not/here.json")),
            Err(ConfigError::IoError(_))
        ));
    }
}
