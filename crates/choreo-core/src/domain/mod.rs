//! Domain model (IDs, job states, errors).

pub mod errors;
pub mod ids;
pub mod state;

pub use errors::{ConfigError, ScenarioError};
pub use ids::{JobId, ParseIdError, RunId};
pub use state::{DependencyKind, JobState};
