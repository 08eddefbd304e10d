//! Configuration loading.
//!
//! Reads `config.json` from `--config <path>` or the platform config
//! directory (`<config_dir>/bepass-relay/config.json`), then applies
//! `BEPASS_*` environment overrides. A missing file means defaults.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_CONNECT_PATH, DEFAULT_EVENT_QUEUE_CAPACITY, DEFAULT_FALLBACK_EGRESS,
    DEFAULT_LISTEN_ADDR, DEFAULT_REMOTE_QUEUE_CAPACITY, DEFAULT_REPLAY_LIMIT,
};

/// Configuration for the relay.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Address the server listens on.
    pub listen_addr: String,
    /// Request path upgraded into a relay session.
    pub connect_path: String,
    /// Fallback egress addresses; one is picked at startup.
    pub fallback_egress: Vec<String>,
    /// Client event queue capacity, in events.
    pub event_queue_capacity: usize,
    /// Remote queue capacity per direction, in chunks.
    pub remote_queue_capacity: usize,
    /// Client bytes kept for replay onto the fallback egress.
    pub replay_limit: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            connect_path: DEFAULT_CONNECT_PATH.to_string(),
            fallback_egress: DEFAULT_FALLBACK_EGRESS
                .iter()
                .map(ToString::to_string)
                .collect(),
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            remote_queue_capacity: DEFAULT_REMOTE_QUEUE_CAPACITY,
            replay_limit: DEFAULT_REPLAY_LIMIT,
        }
    }
}

impl Config {
    /// Default config file location, if the platform has a config directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("bepass-relay").join("config.json"))
    }

    /// Load configuration from `path` (or the default location), with
    /// environment variable overrides, and validate it.
    ///
    /// An explicit `path` must exist; a missing default file means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::load_from_file(&path)?,
                _ => Self::default(),
            },
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(listen_addr) = var("BEPASS_LISTEN") {
            self.listen_addr = listen_addr;
        }

        if let Some(connect_path) = var("BEPASS_CONNECT_PATH") {
            self.connect_path = connect_path;
        }

        if let Some(egress) = var("BEPASS_FALLBACK_EGRESS") {
            self.fallback_egress = egress
                .split(',')
                .map(str::trim)
                .filter(|addr| !addr.is_empty())
                .map(ToString::to_string)
                .collect();
        }

        if let Some(limit) = var("BEPASS_REPLAY_LIMIT") {
            if let Ok(limit) = limit.parse::<usize>() {
                self.replay_limit = limit;
            }
        }
    }

    /// Check the configuration is usable.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.fallback_egress.is_empty(),
            "fallback_egress must list at least one address"
        );
        ensure!(
            self.connect_path.starts_with('/'),
            "connect_path must start with '/': {}",
            self.connect_path
        );
        ensure!(
            self.event_queue_capacity > 0 && self.remote_queue_capacity > 0,
            "queue capacities must be positive"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.listen_addr, "127.0.0.1:8787");
        assert_eq!(config.connect_path, "/connect");
        assert_eq!(config.fallback_egress.len(), DEFAULT_FALLBACK_EGRESS.len());
        assert_eq!(config.replay_limit, 64 * 1024);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_from_file_with_partial_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"listen_addr": "0.0.0.0:9000", "fallback_egress": ["a.example", "b.example"]}}"#
        )
        .unwrap();

        let config = Config::load_from_file(file.path()).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.fallback_egress, vec!["a.example", "b.example"]);
        // Missing fields fall back to defaults.
        assert_eq!(config.connect_path, "/connect");
        assert_eq!(config.event_queue_capacity, DEFAULT_EVENT_QUEUE_CAPACITY);
    }

    #[test]
    fn test_json_roundtrip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = Config {
            replay_limit: 0,
            ..Config::default()
        };
        fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        assert_eq!(Config::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(Some(dir.path().join("absent.json").as_path())).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_malformed_file_is_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        let err = Config::load_from_file(file.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_env_overrides() {
        let env = vars(&[
            ("BEPASS_LISTEN", "0.0.0.0:80"),
            ("BEPASS_CONNECT_PATH", "/tunnel"),
            ("BEPASS_FALLBACK_EGRESS", " x.example, ,y.example "),
            ("BEPASS_REPLAY_LIMIT", "1024"),
        ]);
        let mut config = Config::default();
        config.apply_overrides(|key| env.get(key).cloned());

        assert_eq!(config.listen_addr, "0.0.0.0:80");
        assert_eq!(config.connect_path, "/tunnel");
        assert_eq!(config.fallback_egress, vec!["x.example", "y.example"]);
        assert_eq!(config.replay_limit, 1024);
    }

    #[test]
    fn test_invalid_numeric_override_is_ignored() {
        let env = vars(&[("BEPASS_REPLAY_LIMIT", "lots")]);
        let mut config = Config::default();
        config.apply_overrides(|key| env.get(key).cloned());
        assert_eq!(config.replay_limit, DEFAULT_REPLAY_LIMIT);
    }

    #[test]
    fn test_empty_fallback_list_rejected() {
        let env = vars(&[("BEPASS_FALLBACK_EGRESS", " , ")]);
        let mut config = Config::default();
        config.apply_overrides(|key| env.get(key).cloned());

        assert!(config.fallback_egress.is_empty());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("fallback_egress"));
    }

    #[test]
    fn test_connect_path_must_be_absolute() {
        let config = Config {
            connect_path: "connect".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
