//! Scenario: the process-level entry point.
//!
//! A builder declares jobs through a `ScenarioContext`; once its future
//! resolves, the graph is sealed and handed to the `Scheduler`.
//!
//! ```ignore
//! let code = Scenario::new("content")
//!     .with_services(clients)
//!     .run_to_exit(|ctx| async move {
//!         let members = ctx.job("members", flow_fn(create_members));
//!         let channels = ctx.job("channels", flow_fn(create_channels)).requires(&members);
//!         ctx.job("videos", [flow_fn(create_videos), flow_fn(check_videos)])
//!             .requires(&channels);
//!         Ok(())
//!     })
//!     .await;
//! ```

use std::fmt;
use std::future::Future;
use std::iter::Once;
use std::process::ExitCode;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{error, info};

use crate::config::RunnerConfig;
use crate::domain::{ConfigError, DependencyKind, JobId, ScenarioError};
use crate::env::Env;
use crate::flow::{IntoFlows, Services};
use crate::graph::JobGraph;
use crate::lock::{Lease, Resource, ResourceLock};
use crate::observability;
use crate::report::RunReport;
use crate::scheduler::Scheduler;

/// One scenario run, configured before `run`.
pub struct Scenario<S: Services = ()> {
    name: String,
    env: Option<Env>,
    config: Option<RunnerConfig>,
    services: Arc<S>,
}

impl Scenario<()> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            env: None,
            config: None,
            services: Arc::new(()),
        }
    }
}

impl<S: Services> Scenario<S> {
    /// Use `env` instead of a snapshot of the process environment.
    pub fn with_env(mut self, env: Env) -> Self {
        self.env = Some(env);
        self
    }

    /// Use `config` instead of reading `CHOREO_*` variables from the env.
    pub fn with_config(mut self, config: RunnerConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Inject the external collaborators every flow receives.
    pub fn with_services<T: Services>(self, services: T) -> Scenario<T> {
        Scenario {
            name: self.name,
            env: self.env,
            config: self.config,
            services: Arc::new(services),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declare the graph with `builder`, then run it.
    ///
    /// A builder error aborts before any job runs. Job failures are not
    /// errors; they are in the returned report.
    pub async fn run<F, Fut>(self, builder: F) -> Result<RunReport, ScenarioError>
    where
        F: FnOnce(ScenarioContext<S>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let (env, config) = self.resolve()?;
        let env = Arc::new(env);
        let lock = ResourceLock::with_warn_after(config.lock_warn_after());
        let declarations = Arc::new(Declarations::new(self.name.clone()));

        let ctx = ScenarioContext {
            declarations: Arc::clone(&declarations),
            env: Arc::clone(&env),
            lock: lock.clone(),
            services: Arc::clone(&self.services),
        };

        let built = builder(ctx).await;
        let graph = declarations.seal();
        if let Err(err) = built {
            error!(scenario = %self.name, error = %format!("{err:#}"), "scenario builder failed");
            return Err(ScenarioError::Builder(err));
        }

        info!(scenario = %self.name, jobs = graph.len(), "scenario graph sealed");
        let report = Scheduler::new(self.name, graph, self.services)
            .with_env(env)
            .with_lock(lock)
            .with_job_timeout(config.job_timeout())
            .run()
            .await?;
        Ok(report)
    }

    /// Run, log the per-job summary, and turn the outcome into an exit code.
    ///
    /// Also installs the `tracing` subscriber if none is installed yet.
    pub async fn run_to_exit<F, Fut>(mut self, builder: F) -> ExitCode
    where
        F: FnOnce(ScenarioContext<S>) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let (env, config) = match self.resolve() {
            Ok(resolved) => resolved,
            Err(err) => {
                observability::init_tracing(&RunnerConfig::default().log_filter);
                error!(scenario = %self.name, error = %err, "scenario aborted");
                return ExitCode::FAILURE;
            }
        };
        observability::init_tracing(&config.log_filter);
        self.env = Some(env);
        self.config = Some(config);

        let name = self.name.clone();
        match self.run(builder).await {
            Ok(report) => {
                report.log_summary();
                ExitCode::from(report.exit_code())
            }
            Err(err) => {
                error!(scenario = %name, error = %err, "scenario aborted");
                ExitCode::FAILURE
            }
        }
    }

    /// Env snapshot and config: explicit values first, else the process.
    fn resolve(&self) -> Result<(Env, RunnerConfig), ScenarioError> {
        let env = self.env.clone().unwrap_or_else(Env::from_process);
        let config = match &self.config {
            Some(config) => config.clone(),
            None => RunnerConfig::from_env(&env)?,
        };
        Ok((env, config))
    }
}

/// The graph under construction, shared by the context and every handle.
struct Declarations<S: Services> {
    scenario: String,
    /// `None` once the builder has finished.
    graph: Mutex<Option<JobGraph<S>>>,
}

impl<S: Services> Declarations<S> {
    fn new(scenario: String) -> Self {
        Self {
            scenario,
            graph: Mutex::new(Some(JobGraph::new())),
        }
    }

    fn graph(&self) -> MutexGuard<'_, Option<JobGraph<S>>> {
        // Only plain inserts happen under this lock; a poisoned graph is still consistent.
        self.graph.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn seal(&self) -> JobGraph<S> {
        self.graph().take().unwrap_or_default()
    }
}

/// What the builder sees: job declaration, the run's lock, env and services.
pub struct ScenarioContext<S: Services> {
    declarations: Arc<Declarations<S>>,
    env: Arc<Env>,
    lock: ResourceLock,
    services: Arc<S>,
}

impl<S: Services> Clone for ScenarioContext<S> {
    fn clone(&self) -> Self {
        Self {
            declarations: Arc::clone(&self.declarations),
            env: Arc::clone(&self.env),
            lock: self.lock.clone(),
            services: Arc::clone(&self.services),
        }
    }
}

impl<S: Services> ScenarioContext<S> {
    /// Declare a job. Nothing runs until the builder has finished.
    pub fn job(&self, name: impl Into<Arc<str>>, flows: impl IntoFlows<S>) -> JobHandle<S> {
        let name = name.into();
        let id = match self.declarations.graph().as_mut() {
            Some(graph) => graph.add_job(Arc::clone(&name), flows.into_flows()),
            None => {
                error!(
                    scenario = %self.declarations.scenario,
                    job = %name,
                    "job declared after the scenario graph was sealed; ignored"
                );
                JobId::generate()
            }
        };
        JobHandle {
            id,
            name,
            owner: Arc::clone(&self.declarations),
        }
    }

    /// Wait for exclusive access to `resource` (same lock the flows use).
    pub async fn lock(&self, resource: impl Into<Resource>) -> Lease {
        self.lock.acquire(resource).await
    }

    pub fn resource_lock(&self) -> &ResourceLock {
        &self.lock
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn services(&self) -> &S {
        &self.services
    }

    pub fn scenario_name(&self) -> &str {
        &self.declarations.scenario
    }
}

/// A declared job, used to wire dependencies.
///
/// `requires` and `after` take anything iterable over `&JobHandle`: a single
/// `&handle`, an array `[&a, &b]`, or `&vec`.
pub struct JobHandle<S: Services> {
    id: JobId,
    name: Arc<str>,
    owner: Arc<Declarations<S>>,
}

impl<S: Services> Clone for JobHandle<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            name: Arc::clone(&self.name),
            owner: Arc::clone(&self.owner),
        }
    }
}

impl<S: Services> JobHandle<S> {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run only after `deps` succeeded; skip if any of them did not.
    pub fn requires<'a>(self, deps: impl IntoIterator<Item = &'a JobHandle<S>>) -> Self {
        self.depend_on(deps, DependencyKind::Hard)
    }

    /// Run after `deps` finished, whatever their outcome.
    pub fn after<'a>(self, deps: impl IntoIterator<Item = &'a JobHandle<S>>) -> Self {
        self.depend_on(deps, DependencyKind::Soft)
    }

    fn depend_on<'a>(
        self,
        deps: impl IntoIterator<Item = &'a JobHandle<S>>,
        kind: DependencyKind,
    ) -> Self {
        let mut guard = self.owner.graph();
        let Some(graph) = guard.as_mut() else {
            error!(
                scenario = %self.owner.scenario,
                job = %self.name,
                "dependency declared after the scenario graph was sealed; ignored"
            );
            drop(guard);
            return self;
        };

        for dep in deps {
            if Arc::ptr_eq(&self.owner, &dep.owner) {
                graph.add_edge(self.id, dep.id, kind);
            } else {
                graph.record_error(ConfigError::ForeignJob {
                    job: self.name.to_string(),
                    dependency: dep.name.to_string(),
                });
            }
        }
        drop(guard);
        self
    }
}

impl<'a, S: Services> IntoIterator for &'a JobHandle<S> {
    type Item = &'a JobHandle<S>;
    type IntoIter = Once<&'a JobHandle<S>>;

    fn into_iter(self) -> Self::IntoIter {
        std::iter::once(self)
    }
}

impl<S: Services> fmt::Debug for JobHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}
