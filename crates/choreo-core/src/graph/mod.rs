//! The declared job graph of one scenario run.
//!
//! The graph is a plain value: `Scenario` creates it, the builder fills it
//! through handles, and the `Scheduler` consumes it. Nothing is global.

mod dependency;
mod job;

pub use dependency::DependencyGraph;
pub use job::JobRecord;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::domain::{ConfigError, DependencyKind, JobId};
use crate::flow::{Flow, Services};

/// Jobs plus their dependency edges.
pub struct JobGraph<S: Services> {
    /// All job records (single source of truth for jobs).
    jobs: HashMap<JobId, JobRecord<S>>,

    /// Edges, and the declaration order of jobs.
    dependencies: DependencyGraph,

    /// Problems noticed while declaring (reported by `validate`).
    declaration_errors: Vec<ConfigError>,
}

impl<S: Services> JobGraph<S> {
    pub fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            dependencies: DependencyGraph::new(),
            declaration_errors: Vec::new(),
        }
    }

    /// Register a job. Nothing runs yet.
    pub fn add_job(&mut self, name: impl Into<Arc<str>>, flows: Vec<Arc<dyn Flow<S>>>) -> JobId {
        let id = JobId::generate();
        self.jobs.insert(id, JobRecord::new(id, name, flows));
        self.dependencies.add_node(id);
        id
    }

    /// Add an edge: `job` waits for `depends_on`.
    pub fn add_edge(&mut self, job: JobId, depends_on: JobId, kind: DependencyKind) {
        self.dependencies.add_dependency(job, depends_on, kind);
    }

    /// Remember a declaration problem for `validate`.
    pub fn record_error(&mut self, error: ConfigError) {
        self.declaration_errors.push(error);
    }

    pub fn job(&self, id: JobId) -> Option<&JobRecord<S>> {
        self.jobs.get(&id)
    }

    pub fn name_of(&self, id: JobId) -> &str {
        self.jobs.get(&id).map(|j| &*j.name).unwrap_or("<unknown>")
    }

    /// Jobs in declaration order.
    pub fn jobs(&self) -> impl Iterator<Item = &JobRecord<S>> {
        self.dependencies
            .nodes()
            .iter()
            .filter_map(|id| self.jobs.get(id))
    }

    pub fn dependencies(&self) -> &DependencyGraph {
        &self.dependencies
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Check the graph before anything runs.
    ///
    /// Order of checks: declaration errors, empty jobs, duplicate names, cycles.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(error) = self.declaration_errors.first() {
            return Err(error.clone());
        }

        let mut seen = HashSet::new();
        for job in self.jobs() {
            if job.flows.is_empty() {
                return Err(ConfigError::EmptyJob {
                    name: job.name.to_string(),
                });
            }
            if !seen.insert(&*job.name) {
                return Err(ConfigError::DuplicateJob {
                    name: job.name.to_string(),
                });
            }
        }

        if let Some(cycle) = self.dependencies.detect_cycle() {
            return Err(ConfigError::Cycle {
                path: cycle
                    .into_iter()
                    .map(|id| self.name_of(id).to_string())
                    .collect(),
            });
        }
        Ok(())
    }
}

impl<S: Services> Default for JobGraph<S> {
    fn default() -> Self {
        Self::new()
    }
}
