// Copyright (c) 2025 Corynth Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Engine configuration.
//!
//! Loaded from a YAML file, then overridden by `CORYNTH_*` environment
//! variables whose names mirror the configuration tree
//! (e.g. `CORYNTH_STATE_DIR`, `CORYNTH_PLUGINS_AUTO_INSTALL`). All timeouts
//! and delays are expressed in seconds (milliseconds for retry delay).

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A ranked remote plugin repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub name: String,
    pub url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default)]
    pub priority: u32,
    /// Name of the environment variable holding an access token.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
}

fn default_branch() -> String {
    "main".to_string()
}

/// Plugin cache policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub path: PathBuf,
    #[serde(default = "default_cache_ttl")]
    pub ttl_seconds: u64,
    #[serde(default = "default_cache_max_size")]
    pub max_size_bytes: u64,
}

fn default_cache_ttl() -> u64 {
    24 * 3600
}

fn default_cache_max_size() -> u64 {
    1024 * 1024 * 1024
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: default_home_subdir("cache"),
            ttl_seconds: default_cache_ttl(),
            max_size_bytes: default_cache_max_size(),
        }
    }
}

/// Plugin discovery and installation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginsConfig {
    pub local_path: PathBuf,
    #[serde(default)]
    pub auto_install: bool,
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            local_path: default_home_subdir("plugins"),
            auto_install: false,
            repositories: Vec::new(),
            cache: CacheConfig::default(),
        }
    }
}

/// State backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    Local,
    S3,
}

/// State persistence settings. `backend_config` keys are backend-specific
/// (for `s3`: `bucket`, `prefix`, `region`, `lock` = "true"/"false").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default = "default_state_backend")]
    pub backend: StateBackend,
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default)]
    pub backend_config: std::collections::HashMap<String, String>,
}

fn default_state_backend() -> StateBackend {
    StateBackend::Local
}

fn default_state_dir() -> PathBuf {
    default_home_subdir("state")
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: default_state_backend(),
            state_dir: default_state_dir(),
            backend_config: std::collections::HashMap::new(),
        }
    }
}

/// Concurrency caps and per-phase timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_dependencies: usize,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_triggers: usize,
    #[serde(default = "default_timeout_seconds")]
    pub default_timeout_seconds: u64,
    #[serde(default = "default_timeout_seconds")]
    pub dependency_timeout_seconds: u64,
    #[serde(default = "default_timeout_seconds")]
    pub trigger_timeout_seconds: u64,
}

fn default_max_concurrent() -> usize {
    5
}

fn default_timeout_seconds() -> u64 {
    300
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            max_concurrent_dependencies: default_max_concurrent(),
            max_concurrent_triggers: default_max_concurrent(),
            default_timeout_seconds: default_timeout_seconds(),
            dependency_timeout_seconds: default_timeout_seconds(),
            trigger_timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl ExecutionConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_seconds)
    }

    pub fn dependency_timeout(&self) -> Duration {
        Duration::from_secs(self.dependency_timeout_seconds)
    }

    pub fn trigger_timeout(&self) -> Duration {
        Duration::from_secs(self.trigger_timeout_seconds)
    }
}

/// Defaults applied to steps without an explicit retry block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub default_max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub default_delay_ms: u64,
    #[serde(default = "default_backoff")]
    pub default_backoff: String,
    #[serde(default = "default_max_backoff_seconds")]
    pub max_backoff_delay_seconds: u64,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_backoff() -> String {
    "fixed".to_string()
}

fn default_max_backoff_seconds() -> u64 {
    60
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: default_max_attempts(),
            default_delay_ms: default_retry_delay_ms(),
            default_backoff: default_backoff(),
            max_backoff_delay_seconds: default_max_backoff_seconds(),
        }
    }
}

impl RetryConfig {
    pub fn max_backoff_delay(&self) -> Duration {
        Duration::from_secs(self.max_backoff_delay_seconds)
    }
}

/// Cross-workflow orchestration settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub plugins: PluginsConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub orchestration: OrchestrationConfig,
}

impl Config {
    /// Loads configuration: defaults, overlaid by the YAML file when given,
    /// overlaid by environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(file) => {
                let content = std::fs::read_to_string(file).map_err(|err| {
                    EngineError::Config(format!(
                        "cannot read config file '{}': {err}",
                        file.display()
                    ))
                })?;
                serde_yaml::from_str(&content).map_err(|err| {
                    EngineError::Config(format!(
                        "invalid config file '{}': {err}",
                        file.display()
                    ))
                })?
            }
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Applies `CORYNTH_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("CORYNTH_STATE_DIR") {
            self.state.state_dir = PathBuf::from(dir);
        }
        if let Ok(backend) = std::env::var("CORYNTH_STATE_BACKEND") {
            match backend.to_ascii_lowercase().as_str() {
                "local" => self.state.backend = StateBackend::Local,
                "s3" => self.state.backend = StateBackend::S3,
                _ => {}
            }
        }
        if let Ok(path) = std::env::var("CORYNTH_PLUGINS_LOCAL_PATH") {
            self.plugins.local_path = PathBuf::from(path);
        }
        if let Ok(auto) = std::env::var("CORYNTH_PLUGINS_AUTO_INSTALL") {
            self.plugins.auto_install = matches!(auto.to_ascii_lowercase().as_str(), "1" | "true");
        }
        if let Ok(path) = std::env::var("CORYNTH_PLUGINS_CACHE_PATH") {
            self.plugins.cache.path = PathBuf::from(path);
        }
        if let Ok(n) = std::env::var("CORYNTH_ORCHESTRATION_EXECUTION_MAX_CONCURRENT") {
            if let Ok(n) = n.parse() {
                self.orchestration.execution.max_concurrent = n;
            }
        }
        if let Ok(n) = std::env::var("CORYNTH_ORCHESTRATION_EXECUTION_DEFAULT_TIMEOUT") {
            if let Ok(n) = n.parse() {
                self.orchestration.execution.default_timeout_seconds = n;
            }
        }
    }

    fn validate(&self) -> Result<()> {
        if self.orchestration.execution.max_concurrent == 0 {
            return Err(EngineError::Config(
                "orchestration.execution.max_concurrent must be at least 1".into(),
            ));
        }
        if self.orchestration.retry.default_max_attempts == 0 {
            return Err(EngineError::Config(
                "orchestration.retry.default_max_attempts must be at least 1".into(),
            ));
        }
        crate::workflow::BackoffStrategy::parse(&self.orchestration.retry.default_backoff)
            .map_err(|_| {
                EngineError::Config(format!(
                    "unknown orchestration.retry.default_backoff '{}'",
                    self.orchestration.retry.default_backoff
                ))
            })?;
        Ok(())
    }
}

fn default_home_subdir(leaf: &str) -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".corynth")
        .join(leaf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.orchestration.execution.max_concurrent, 5);
        assert_eq!(config.state.backend, StateBackend::Local);
        assert!(!config.plugins.auto_install);
    }

    #[test]
    fn test_load_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            concat!(
                "plugins:\n",
                "  local_path: /opt/corynth/plugins\n",
                "  auto_install: true\n",
                "  repositories:\n",
                "    - name: official\n",
                "      url: https://github.com/corynth/plugins.git\n",
                "      priority: 10\n",
                "state:\n",
                "  backend: local\n",
                "  state_dir: /var/lib/corynth\n",
                "orchestration:\n",
                "  execution:\n",
                "    max_concurrent: 8\n",
            )
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert!(config.plugins.auto_install);
        assert_eq!(config.plugins.repositories.len(), 1);
        assert_eq!(config.plugins.repositories[0].branch, "main");
        assert_eq!(config.orchestration.execution.max_concurrent, 8);
        assert_eq!(config.state.state_dir, PathBuf::from("/var/lib/corynth"));
    }

    #[test]
    fn test_invalid_backoff_rejected() {
        let mut config = Config::default();
        config.orchestration.retry.default_backoff = "cubic".into();
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = Config::load(Some(Path::new("/nonexistent/corynth.yaml"))).unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }
}
