//! Runner configuration.
//!
//! Sources, lowest precedence first: defaults, an optional YAML file, then
//! `CHOREO_*` environment variables.
//!
//! ```yaml
//! lock_warn_after_secs: 60
//! job_timeout_secs: 900
//! log_filter: "choreo_core=debug,info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::env::{Env, EnvError};

pub const ENV_LOCK_WARN_AFTER_SECS: &str = "CHOREO_LOCK_WARN_AFTER_SECS";
pub const ENV_JOB_TIMEOUT_SECS: &str = "CHOREO_JOB_TIMEOUT_SECS";
pub const ENV_LOG: &str = "CHOREO_LOG";

const ENV_PREFIX: &str = "CHOREO_";
const KNOWN_ENV_KEYS: [&str; 3] = [ENV_LOCK_WARN_AFTER_SECS, ENV_JOB_TIMEOUT_SECS, ENV_LOG];

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Env(#[from] EnvError),
}

/// Knobs for one scenario run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// A lock request waiting this long logs a warning (repeats every period).
    /// `0` disables the warning.
    pub lock_warn_after_secs: u64,

    /// Fail a job that runs longer than this. `None` (the default) keeps
    /// jobs unbounded.
    pub job_timeout_secs: Option<u64>,

    /// `tracing` filter used when `RUST_LOG` is not set.
    pub log_filter: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            lock_warn_after_secs: 30,
            job_timeout_secs: None,
            log_filter: "info".to_string(),
        }
    }
}

impl RunnerConfig {
    pub fn lock_warn_after(&self) -> Option<Duration> {
        (self.lock_warn_after_secs > 0).then(|| Duration::from_secs(self.lock_warn_after_secs))
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout_secs
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigLoadError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigLoadError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Defaults overridden by the environment.
    pub fn from_env(env: &Env) -> Result<Self, EnvError> {
        Self::default().apply_env(env)
    }

    /// Override fields that are set in `env`.
    ///
    /// Unrecognized `CHOREO_*` variables (usually typos) are logged and ignored.
    pub fn apply_env(mut self, env: &Env) -> Result<Self, EnvError> {
        for key in unknown_env_keys(env) {
            warn!(key, "ignoring unknown runner variable");
        }
        if let Some(secs) = env.parse::<u64>(ENV_LOCK_WARN_AFTER_SECS)? {
            self.lock_warn_after_secs = secs;
        }
        if let Some(secs) = env.parse::<u64>(ENV_JOB_TIMEOUT_SECS)? {
            self.job_timeout_secs = (secs > 0).then_some(secs);
        }
        if let Some(filter) = env.get(ENV_LOG) {
            self.log_filter = filter.to_string();
        }
        Ok(self)
    }
}

/// `CHOREO_*` keys in `env` that no setting reads.
pub fn unknown_env_keys(env: &Env) -> Vec<&str> {
    env.iter()
        .map(|(key, _)| key)
        .filter(|key| key.starts_with(ENV_PREFIX) && !KNOWN_ENV_KEYS.contains(key))
        .collect()
}
