//! Errors raised by the engine itself.
//!
//! Flow failures are not here: they are `anyhow::Error` values owned by the
//! job that produced them and end up in the run report.

use thiserror::Error;

use crate::env::EnvError;

/// A problem with the declared job graph. Detected before any job runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("dependency cycle: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("duplicate job name '{name}'")]
    DuplicateJob { name: String },

    #[error("job '{name}' has no flows")]
    EmptyJob { name: String },

    #[error("job '{job}' depends on '{dependency}', which belongs to another scenario")]
    ForeignJob { job: String, dependency: String },
}

/// Errors returned by `Scenario::run`.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("invalid scenario configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("scenario builder failed: {0:#}")]
    Builder(anyhow::Error),

    #[error("invalid runner environment: {0}")]
    Env(#[from] EnvError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_names_the_path() {
        let err = ConfigError::Cycle {
            path: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle: a -> b -> a");
    }

    #[test]
    fn config_error_converts_into_scenario_error() {
        let err: ScenarioError = ConfigError::EmptyJob { name: "x".into() }.into();
        assert!(matches!(err, ScenarioError::Config(ConfigError::EmptyJob { .. })));
        assert!(err.to_string().contains("job 'x' has no flows"));
    }
}
