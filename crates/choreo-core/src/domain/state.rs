//! Job state machine and dependency kinds.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Job state.
///
/// State transitions:
/// - Pending -> Ready -> Running -> Succeeded
/// - Pending -> Ready -> Running -> Failed
/// - Pending -> Skipped (a hard dependency did not succeed)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// At least one dependency is not terminal yet.
    Pending,

    /// Every dependency is terminal and every hard dependency succeeded.
    Ready,

    /// Flows are executing.
    Running,

    /// Every flow completed without error.
    Succeeded,

    /// At least one flow failed.
    Failed,

    /// A hard dependency failed or was skipped; flows never ran.
    Skipped,
}

impl JobState {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Skipped
        )
    }

    /// Does this state satisfy a hard (`requires`) edge?
    pub fn satisfies_hard_edge(self) -> bool {
        self == JobState::Succeeded
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Ready => "ready",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Skipped => "skipped",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Kind of a dependency edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyKind {
    /// `requires`: orders execution and propagates failure as a skip.
    Hard,

    /// `after`: orders execution only.
    Soft,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::succeeded(JobState::Succeeded, true)]
    #[case::failed(JobState::Failed, true)]
    #[case::skipped(JobState::Skipped, true)]
    #[case::pending(JobState::Pending, false)]
    #[case::ready(JobState::Ready, false)]
    #[case::running(JobState::Running, false)]
    fn terminal_states(#[case] state: JobState, #[case] terminal: bool) {
        assert_eq!(state.is_terminal(), terminal);
    }

    #[test]
    fn only_success_satisfies_hard_edge() {
        assert!(JobState::Succeeded.satisfies_hard_edge());
        assert!(!JobState::Failed.satisfies_hard_edge());
        assert!(!JobState::Skipped.satisfies_hard_edge());
    }

    #[test]
    fn state_serializes_as_snake_case() {
        let s = serde_json::to_string(&JobState::Succeeded).unwrap();
        assert_eq!(s, "\"succeeded\"");
    }
}
