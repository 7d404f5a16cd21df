//! Configuration for bridged.
//!
//! Settings are read from `~/.bridged/config.toml`:
//!
//! ```toml
//! # Shell for new sessions (optional; defaults to $SHELL or /bin/sh)
//! shell = "/bin/bash"
//!
//! # Log level, overridden by RUST_LOG
//! log_level = "info"
//!
//! [session]
//! cols = 80
//! rows = 24
//! settle_ms = 300
//! scrollback = 1000
//! transcript_limit = 1048576
//! term = "xterm-256color"
//!
//! # Extra environment for new sessions
//! [session.env]
//! LANG = "C.UTF-8"
//!
//! [inference]
//! model_dir = "/opt/models"
//! timeout_ms = 5000
//! accelerators = ["cpu"]
//!
//! [training]
//! epoch_ms = 100
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};
use crate::inference::accelerator::{Accelerator, AcceleratorSet};

/// Main configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default shell command
    pub shell: Option<String>,
    pub log_level: String,
    pub session: SessionConfig,
    pub inference: InferenceConfig,
    pub training: TrainingSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            shell: None,
            log_level: "info".to_string(),
            session: SessionConfig::default(),
            inference: InferenceConfig::default(),
            training: TrainingSettings::default(),
        }
    }
}

/// Session settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub cols: u16,
    pub rows: u16,
    /// Wait after writing a command before capturing output
    pub settle_ms: u64,
    /// Lines kept by the terminal emulator above the screen
    pub scrollback: usize,
    /// Bytes of raw output kept per session; older output is discarded
    pub transcript_limit: usize,
    /// `TERM` for new sessions, left unset when empty
    pub term: String,
    pub env: BTreeMap<String, String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cols: 80,
            rows: 24,
            settle_ms: 300,
            scrollback: 1000,
            transcript_limit: 1 << 20,
            term: "xterm-256color".to_string(),
            env: BTreeMap::new(),
        }
    }
}

impl SessionConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

/// Inference settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Base directory for relative model paths
    pub model_dir: Option<PathBuf>,
    pub timeout_ms: u64,
    /// Accelerators present on this device
    pub accelerators: Vec<Accelerator>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            model_dir: None,
            timeout_ms: 5000,
            accelerators: vec![Accelerator::Cpu],
        }
    }
}

impl InferenceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn available(&self) -> AcceleratorSet {
        AcceleratorSet::from_list(&self.accelerators)
    }
}

/// Training settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingSettings {
    /// Duration of one simulated epoch
    pub epoch_ms: u64,
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self { epoch_ms: 100 }
    }
}

impl TrainingSettings {
    pub fn epoch_interval(&self) -> Duration {
        Duration::from_millis(self.epoch_ms)
    }
}

impl Config {
    /// Load configuration from the default location, falling back to
    /// defaults when the file is missing or unreadable
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            if path.exists() {
                if let Ok(config) = Self::load_from(&path) {
                    return config;
                }
            }
        }
        Self::default()
    }

    /// Load configuration from a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| BridgeError::Config(format!("{}: {}", path.display(), e)))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| BridgeError::Config(e.to_string()))
    }

    /// Save configuration to the default location
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()
            .ok_or_else(|| BridgeError::Config("Could not determine config path".to_string()))?;
        let content = toml::to_string_pretty(self)
            .map_err(|e| BridgeError::Config(format!("Failed to serialize config: {}", e)))?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|e| {
                BridgeError::Config(format!("Failed to create {}: {}", dir.display(), e))
            })?;
        }
        fs::write(&path, content)
            .map_err(|e| BridgeError::Config(format!("Failed to write config: {}", e)))
    }

    /// Get config file path
    pub fn config_path() -> Option<PathBuf> {
        data_dir().map(|dir| dir.join("config.toml"))
    }
}

/// `~/.bridged`
pub fn data_dir() -> Option<PathBuf> {
    home_dir().map(|home| home.join(".bridged"))
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = Config::parse(
            r#"
            shell = "/bin/bash -l"

            [session]
            settle_ms = 50

            [inference]
            accelerators = ["cpu", "gpu"]
            "#,
        )
        .unwrap();

        assert_eq!(config.shell.as_deref(), Some("/bin/bash -l"));
        assert_eq!(config.session.settle(), Duration::from_millis(50));
        assert_eq!(config.session.cols, 80);
        assert_eq!(config.inference.timeout(), Duration::from_secs(5));
        assert!(config.inference.available().contains(AcceleratorSet::GPU));
        assert!(!config.inference.available().contains(AcceleratorSet::NPU));
        assert_eq!(config.training.epoch_interval(), Duration::from_millis(100));
        assert_eq!(config.session.transcript_limit, 1 << 20);
        assert_eq!(config.session.term, "xterm-256color");
    }

    #[test]
    fn test_session_env_table() {
        let config = Config::parse(
            r#"
            [session]
            term = "dumb"
            transcript_limit = 4096

            [session.env]
            LANG = "C.UTF-8"
            "#,
        )
        .unwrap();

        assert_eq!(config.session.term, "dumb");
        assert_eq!(config.session.transcript_limit, 4096);
        assert_eq!(config.session.env.get("LANG").map(String::as_str), Some("C.UTF-8"));
    }

    #[test]
    fn test_invalid_file_is_config_error() {
        let err = Config::parse("[session]\ncols = \"wide\"").unwrap_err();
        assert_eq!(err.code(), "CONFIG");

        let err = Config::parse("[inference]\naccelerators = [\"tpu\"]").unwrap_err();
        assert_eq!(err.code(), "CONFIG");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "log_level = \"debug\"\n[training]\nepoch_ms = 5\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.training.epoch_ms, 5);

        assert!(Config::load_from(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_round_trip_through_toml() {
        let mut config = Config::default();
        config.inference.model_dir = Some(PathBuf::from("/opt/models"));
        config.session.env.insert("LANG".to_string(), "C.UTF-8".to_string());
        let text = toml::to_string_pretty(&config).unwrap();
        assert_eq!(Config::parse(&text).unwrap(), config);
    }
}
