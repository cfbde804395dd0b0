//! # vwd-config
//!
//! Configuration management for vworkdir.
//!
//! Loads configuration from:
//! 1. `~/.vwd/config.toml` (global)
//! 2. `.vwd/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod testing;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use tracing::debug;

use vwd_journal::RetryPolicy;
use vwd_queue::QueueTuning;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get global config (read-only)
pub fn config() -> std::sync::RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap()
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap() = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub state: StateConfig,
    pub retry: RetryConfig,
    pub queue: QueueConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state: StateConfig::default(),
            retry: RetryConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Load global config (~/.vwd/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                let contents = std::fs::read_to_string(&global_path)?;
                config = toml::from_str(&contents)?;
            }
        }

        // 2. Load project config (.vwd/config.toml) - overrides global
        let project_path = Path::new(".vwd/config.toml");
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            let contents = std::fs::read_to_string(project_path)?;
            let project_config: Config = toml::from_str(&contents)?;
            config = project_config;
        }

        // 3. Apply environment variable overrides
        config.apply_env_overrides();

        Ok(config)
    }

    /// Global config path: ~/.vwd/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".vwd/config.toml"))
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var("VWD_STATE_ROOT") {
            self.state.root = PathBuf::from(root);
        }
        if let Ok(delay) = std::env::var("VWD_RETRY_DELAY_MS") {
            if let Ok(ms) = delay.parse() {
                self.retry.delay_ms = ms;
            }
        }
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap()
    }
}

/// Where the durable stores live on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Root directory for all store files
    pub root: PathBuf,
    pub placeholder_file: String,
    pub modified_paths_file: String,
    pub metadata_file: String,
    pub operations_file: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".vwd/state"),
            placeholder_file: "PlaceholderList.dat".to_string(),
            modified_paths_file: "ModifiedPaths.dat".to_string(),
            metadata_file: "RepoMetadata.dat".to_string(),
            operations_file: "BackgroundGitOperations.dat".to_string(),
        }
    }
}

impl StateConfig {
    pub fn placeholder_path(&self) -> PathBuf {
        self.root.join(&self.placeholder_file)
    }

    pub fn modified_paths_path(&self) -> PathBuf {
        self.root.join(&self.modified_paths_file)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.root.join(&self.metadata_file)
    }

    pub fn operations_path(&self) -> PathBuf {
        self.root.join(&self.operations_file)
    }
}

/// Store I/O retry behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Fixed delay between attempts, in milliseconds
    pub delay_ms: u64,
    /// Log one warning per this many consecutive failures
    pub log_sample: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            delay_ms: policy.delay.as_millis() as u64,
            log_sample: policy.log_sample,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            delay: Duration::from_millis(self.delay_ms),
            log_sample: self.log_sample,
        }
    }
}

/// Task queue worker timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub wake_timeout_ms: u64,
    pub retry_backoff_ms: u64,
    pub lock_poll_ms: u64,
    pub gate_attempts: u32,
    pub gate_poll_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        let tuning = QueueTuning::default();
        Self {
            wake_timeout_ms: tuning.wake_timeout.as_millis() as u64,
            retry_backoff_ms: tuning.retry_backoff.as_millis() as u64,
            lock_poll_ms: tuning.lock_poll.as_millis() as u64,
            gate_attempts: tuning.gate_attempts,
            gate_poll_ms: tuning.gate_poll.as_millis() as u64,
        }
    }
}

impl QueueConfig {
    pub fn tuning(&self) -> QueueTuning {
        QueueTuning {
            wake_timeout: Duration::from_millis(self.wake_timeout_ms),
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            lock_poll: Duration::from_millis(self.lock_poll_ms),
            gate_attempts: self.gate_attempts,
            gate_poll: Duration::from_millis(self.gate_poll_ms),
        }
    }
}
