//! choreo-core
//!
//! Scenario execution engine for end-to-end test suites.
//!
//! # Modules
//! - **domain**: ids, job states, engine errors
//! - **lock**: named-resource FIFO mutex (`ResourceLock`, `Lease`)
//! - **flow**: the `Flow` trait and the context flows run with
//! - **graph**: declared jobs and their dependency edges
//! - **scenario**: process entry point (`Scenario`, `ScenarioContext`, `JobHandle`)
//! - **scheduler**: runs a validated graph to completion
//! - **report**: per-job outcomes of one run
//! - **env / config / observability**: environment snapshot, runner knobs, logging

pub mod config;
pub mod domain;
pub mod env;
pub mod flow;
pub mod graph;
pub mod lock;
pub mod observability;
pub mod report;
pub mod scenario;
pub mod scheduler;

pub use config::{ConfigLoadError, RunnerConfig};
pub use domain::{ConfigError, DependencyKind, JobId, JobState, RunId, ScenarioError};
pub use env::{Env, EnvError};
pub use flow::{Flow, FlowContext, FlowResult, IntoFlows, Services, flow, flow_fn, named_flow};
pub use lock::{Lease, Resource, ResourceLock};
pub use report::{JobReport, RunCounts, RunReport};
pub use scenario::{JobHandle, Scenario, ScenarioContext};
pub use scheduler::Scheduler;
