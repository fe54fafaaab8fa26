//! Process configuration.
//!
//! Loaded once at startup from a TOML file (see [`loader::load_configuration`]) and
//! validated before any component starts.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use serde::Deserialize;
use url::Url;

pub mod loader;
pub use loader::load_configuration;

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_ENV: &str = "INDEXER_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct IndexerConfig {
    /// Emitted as `label` on startup and status log lines.
    #[serde(default = "default_label")]
    pub label: String,
    pub rpc_urls: Vec<String>,
    pub workers: usize,
    pub database_path: PathBuf,
    #[serde(default = "default_timeout")]
    pub rpc_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub rpc_max_retries: u32,
}

fn default_label() -> String {
    "neo".to_string()
}

fn default_timeout() -> u64 {
    crate::rpc::DEFAULT_TIMEOUT_SECS
}

fn default_max_retries() -> u32 {
    crate::rpc::DEFAULT_MAX_RETRIES
}

impl IndexerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            bail!("workers must be at least 1");
        }
        if self.rpc_urls.is_empty() {
            bail!("at least one rpc url is required");
        }
        if self.rpc_timeout_secs == 0 {
            bail!("rpc_timeout_secs must be positive");
        }
        self.endpoints()?;
        Ok(())
    }

    /// Parsed endpoint urls. Each one needs an http(s) scheme and a host; a missing port
    /// falls back to the scheme default.
    pub fn endpoints(&self) -> Result<Vec<Url>> {
        self.rpc_urls
            .iter()
            .map(|raw| {
                let url = Url::parse(raw).map_err(|e| anyhow::anyhow!("invalid rpc url '{}': {}", raw, e))?;
                if !matches!(url.scheme(), "http" | "https") {
                    bail!("rpc url '{}' must use http or https", raw);
                }
                if url.host_str().is_none() {
                    bail!("rpc url '{}' has no host", raw);
                }
                Ok(url)
            })
            .collect()
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }
}

/// Config file location: `$INDEXER_CONFIG` or `config.toml` in the working directory.
pub fn config_path() -> PathBuf {
    std::env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(urls: &[&str], workers: usize) -> IndexerConfig {
        IndexerConfig {
            label: "test".to_string(),
            rpc_urls: urls.iter().map(|u| u.to_string()).collect(),
            workers,
            database_path: PathBuf::from("test.db"),
            rpc_timeout_secs: 20,
            rpc_max_retries: 0,
        }
    }

    #[test]
    fn accepts_a_valid_configuration() {
        let cfg = config(&["http://127.0.0.1:10332", "https://seed.example.org:443"], 4);
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.endpoints().unwrap().len(), 2);
    }

    #[test]
    fn rejects_zero_workers() {
        assert!(config(&["http://127.0.0.1:10332"], 0).validate().is_err());
    }

    #[test]
    fn rejects_missing_or_malformed_urls() {
        assert!(config(&[], 1).validate().is_err());
        assert!(config(&["127.0.0.1:10332"], 1).validate().is_err());
        assert!(config(&["ftp://127.0.0.1:21"], 1).validate().is_err());
        assert!(config(&["http://:10332"], 1).validate().is_err());
    }

    #[test]
    fn writes_and_loads_the_embedded_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let cfg = load_configuration(&path).unwrap();
        assert!(path.exists());
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.rpc_urls.len(), 3);
        assert_eq!(cfg.database_path, PathBuf::from("data/neo-indexer.db"));
    }

    #[test]
    fn rpc_settings_fall_back_to_client_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        loader::write_config_to(
            &path,
            "rpc_urls = [\"http://127.0.0.1:10332\"]\nworkers = 2\ndatabase_path = \"x.db\"",
        )
        .unwrap();

        let cfg = load_configuration(&path).unwrap();
        assert_eq!(cfg.rpc_timeout_secs, crate::rpc::DEFAULT_TIMEOUT_SECS);
        assert_eq!(cfg.rpc_max_retries, crate::rpc::DEFAULT_MAX_RETRIES);
        assert_eq!(cfg.label, "neo");
    }

    #[test]
    fn invalid_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        loader::write_config_to(&path, "rpc_urls = []\nworkers = 2\ndatabase_path = \"x.db\"").unwrap();
        assert!(load_configuration(&path).is_err());
    }
}
