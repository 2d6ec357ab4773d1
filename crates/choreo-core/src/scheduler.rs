//! Scheduler: runs a validated job graph to completion.
//!
//! Design:
//! - A job becomes eligible when every predecessor (hard or soft) is terminal.
//! - An eligible job whose hard predecessors all succeeded runs; otherwise it is
//!   skipped and its flows are never invoked.
//! - Every running job is its own tokio task; there is no global cap.
//! - Flows of one job run concurrently, each in its own task so a panic is
//!   captured as a failure of that job instead of tearing down the run.
//! - Job and flow tasks live in `JoinSet`s: dropping a run aborts them all, so
//!   no flow outlives its run or keeps holding a lease.
//! - A failure never cancels anything. The run ends when every job is terminal.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::{AbortHandle, JoinSet};
use tracing::{Instrument, error, info, info_span, warn};

use crate::domain::{ConfigError, DependencyKind, JobId, JobState, RunId};
use crate::env::Env;
use crate::flow::{Flow, FlowContext, FlowResult, Services};
use crate::graph::JobGraph;
use crate::lock::ResourceLock;
use crate::report::{JobReport, RunReport};

/// Executes one scenario's job graph.
pub struct Scheduler<S: Services> {
    scenario: String,
    run_id: RunId,
    graph: JobGraph<S>,
    services: Arc<S>,
    env: Arc<Env>,
    lock: ResourceLock,
    job_timeout: Option<Duration>,
}

impl<S: Services> Scheduler<S> {
    pub fn new(scenario: impl Into<String>, graph: JobGraph<S>, services: Arc<S>) -> Self {
        Self {
            scenario: scenario.into(),
            run_id: RunId::generate(),
            graph,
            services,
            env: Arc::new(Env::default()),
            lock: ResourceLock::new(),
            job_timeout: None,
        }
    }

    pub fn with_env(mut self, env: Arc<Env>) -> Self {
        self.env = env;
        self
    }

    /// Share a lock with code outside the graph (e.g. the scenario builder).
    pub fn with_lock(mut self, lock: ResourceLock) -> Self {
        self.lock = lock;
        self
    }

    /// Fail jobs that run longer than `timeout`. Unbounded by default.
    pub fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }

    /// Validate the graph, then run every job to a terminal state.
    ///
    /// Only configuration problems are errors; job failures end up in the
    /// report.
    pub async fn run(self) -> Result<RunReport, ConfigError> {
        if let Err(err) = self.graph.validate() {
            error!(scenario = %self.scenario, error = %err, "invalid scenario graph");
            return Err(err);
        }

        let started_at = Utc::now();
        info!(
            scenario = %self.scenario,
            run_id = %self.run_id,
            jobs = self.graph.len(),
            "scenario started"
        );

        let mut progress = Progress::new(&self.graph);
        let mut running: JoinSet<JobReport> = JoinSet::new();
        let mut tasks: HashMap<tokio::task::Id, JobId> = HashMap::new();

        loop {
            while let Some(job) = progress.ready.pop_front() {
                let handle = self.spawn_job(job, &mut running);
                tasks.insert(handle.id(), job);
                progress.states.insert(job, JobState::Running);
            }

            let Some(joined) = running.join_next_with_id().await else {
                break;
            };
            let report = match joined {
                Ok((task, report)) => {
                    tasks.remove(&task);
                    report
                }
                Err(join_err) => {
                    // Flows run in their own tasks, so this is a bug in the
                    // job wrapper itself. Still settle the job so the run ends.
                    let Some(job) = tasks.remove(&join_err.id()) else {
                        error!(error = %join_err, "lost track of a job task");
                        continue;
                    };
                    let now = Utc::now();
                    JobReport::failed(
                        job,
                        self.graph.name_of(job),
                        now,
                        now,
                        vec![format!("job task aborted: {join_err}")],
                    )
                }
            };
            progress.settle(&self.graph, report);
        }

        let report = RunReport {
            run_id: self.run_id,
            scenario: self.scenario,
            started_at,
            finished_at: Utc::now(),
            jobs: progress.into_reports(&self.graph),
        };
        let counts = report.counts();
        info!(
            run_id = %report.run_id,
            succeeded = counts.succeeded,
            failed = counts.failed,
            skipped = counts.skipped,
            "scenario completed"
        );
        Ok(report)
    }

    fn spawn_job(&self, job: JobId, running: &mut JoinSet<JobReport>) -> AbortHandle {
        let (name, flows) = match self.graph.job(job) {
            Some(record) => (Arc::clone(&record.name), record.flows.clone()),
            None => (Arc::from(self.graph.name_of(job)), Vec::new()),
        };
        let ctx = FlowContext::new(
            Arc::clone(&name),
            self.run_id,
            Arc::clone(&self.env),
            self.lock.clone(),
            Arc::clone(&self.services),
        );
        let span = info_span!("job", job = %name);
        running.spawn(execute_job(job, name, flows, ctx, self.job_timeout).instrument(span))
    }
}

/// Bookkeeping for one run.
///
/// `ready` only ever holds jobs that will run: a job whose predecessors are
/// all terminal goes `Pending -> Ready` if its hard predecessors succeeded and
/// `Pending -> Skipped` otherwise.
struct Progress {
    states: HashMap<JobId, JobState>,
    /// Predecessors not yet terminal, per job.
    remaining: HashMap<JobId, usize>,
    ready: VecDeque<JobId>,
    reports: HashMap<JobId, JobReport>,
}

impl Progress {
    fn new<S: Services>(graph: &JobGraph<S>) -> Self {
        let mut states = HashMap::new();
        let mut remaining = HashMap::new();
        let mut ready = VecDeque::new();

        for &job in graph.dependencies().nodes() {
            let count = graph.dependencies().dependencies(job).len();
            if count == 0 {
                states.insert(job, JobState::Ready);
                ready.push_back(job);
            } else {
                states.insert(job, JobState::Pending);
            }
            remaining.insert(job, count);
        }

        Self {
            states,
            remaining,
            ready,
            reports: HashMap::new(),
        }
    }

    /// Record a terminal job and resolve the jobs waiting for it. Skips
    /// cascade here without ever entering `ready`.
    fn settle<S: Services>(&mut self, graph: &JobGraph<S>, report: JobReport) {
        let mut terminal = vec![report];

        while let Some(report) = terminal.pop() {
            let job = report.id;
            self.states.insert(job, report.state);
            self.reports.insert(job, report);

            for dependent in graph.dependencies().dependents(job) {
                let Some(count) = self.remaining.get_mut(&dependent) else {
                    continue;
                };
                *count = count.saturating_sub(1);
                if *count > 0 {
                    continue;
                }

                let blocking = self.failed_hard_dependencies(graph, dependent);
                if blocking.is_empty() {
                    self.states.insert(dependent, JobState::Ready);
                    self.ready.push_back(dependent);
                } else {
                    let name = graph.name_of(dependent);
                    warn!(job = %name, because = %blocking.join(", "), "job skipped");
                    self.states.insert(dependent, JobState::Skipped);
                    terminal.push(JobReport::skipped(dependent, name, blocking));
                }
            }
        }
    }

    /// Names of hard predecessors of `job` that did not succeed.
    fn failed_hard_dependencies<S: Services>(&self, graph: &JobGraph<S>, job: JobId) -> Vec<String> {
        graph
            .dependencies()
            .dependencies(job)
            .iter()
            .filter(|(_, kind)| *kind == DependencyKind::Hard)
            .filter(|(dep, _)| {
                !self
                    .states
                    .get(dep)
                    .is_some_and(|state| state.satisfies_hard_edge())
            })
            .map(|(dep, _)| graph.name_of(*dep).to_string())
            .collect()
    }

    /// Reports in declaration order.
    fn into_reports<S: Services>(mut self, graph: &JobGraph<S>) -> Vec<JobReport> {
        graph
            .dependencies()
            .nodes()
            .iter()
            .filter_map(|job| self.reports.remove(job))
            .collect()
    }
}

/// Run all flows of one job and turn their outcomes into a report.
///
/// Flow tasks belong to a job-local `JoinSet`; if this future is dropped
/// (run cancelled) or the job times out, the remaining flows are aborted.
async fn execute_job<S: Services>(
    job: JobId,
    name: Arc<str>,
    flows: Vec<Arc<dyn Flow<S>>>,
    ctx: FlowContext<S>,
    timeout: Option<Duration>,
) -> JobReport {
    let started_at = Utc::now();
    info!(flows = flows.len(), "job started");

    let mut running: JoinSet<FlowResult> = JoinSet::new();
    let mut flow_names: HashMap<tokio::task::Id, (usize, String)> = HashMap::new();
    for (index, flow) in flows.into_iter().enumerate() {
        let flow_name = flow.name().to_string();
        let ctx = ctx.clone();
        let handle = running.spawn(async move { flow.run(ctx).await }.in_current_span());
        flow_names.insert(handle.id(), (index, flow_name));
    }

    let deadline = timeout.map(|limit| tokio::time::Instant::now() + limit);
    // (declaration index, message), so errors read in flow order.
    let mut errors: Vec<(usize, String)> = Vec::new();
    loop {
        let joined = match deadline {
            None => running.join_next_with_id().await,
            Some(deadline) => {
                let next = tokio::time::timeout_at(deadline, running.join_next_with_id()).await;
                match next {
                    Ok(joined) => joined,
                    Err(_) => {
                        running.abort_all();
                        let limit = timeout.unwrap_or_default();
                        errors.push((
                            usize::MAX,
                            format!("timed out after {}s", limit.as_secs_f64()),
                        ));
                        break;
                    }
                }
            }
        };
        let Some(joined) = joined else {
            break;
        };

        let (task, failure) = match joined {
            Ok((_, Ok(()))) => continue,
            Ok((task, Err(err))) => (task, format!("{err:#}")),
            Err(join_err) if join_err.is_panic() => {
                let task = join_err.id();
                (task, format!("panicked: {}", panic_message(join_err.into_panic())))
            }
            Err(join_err) => (join_err.id(), join_err.to_string()),
        };
        let (index, flow) = flow_names
            .get(&task)
            .map(|(index, flow)| (*index, flow.as_str()))
            .unwrap_or((usize::MAX - 1, "flow"));
        errors.push((index, format!("{flow}: {failure}")));
    }

    let finished_at = Utc::now();
    if errors.is_empty() {
        info!("job succeeded");
        return JobReport::succeeded(job, &*name, started_at, finished_at);
    }

    errors.sort_by_key(|(index, _)| *index);
    let errors: Vec<String> = errors.into_iter().map(|(_, message)| message).collect();
    warn!(error = %errors[0], failed_flows = errors.len(), "job failed");
    JobReport::failed(job, &*name, started_at, finished_at, errors)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowResult, flow_fn, named_flow};
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Barrier;

    type Flows = Vec<Arc<dyn Flow<()>>>;

    fn ok() -> Flows {
        vec![flow_fn(|_ctx: FlowContext<()>| async { Ok(()) })]
    }

    fn fail(message: &'static str) -> Flows {
        vec![named_flow("assert", move |_ctx: FlowContext<()>| async move {
            Err::<(), _>(anyhow::anyhow!(message))
        })]
    }

    fn counted(calls: &Arc<AtomicUsize>) -> Flows {
        let calls = Arc::clone(calls);
        vec![flow_fn(move |_ctx: FlowContext<()>| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })]
    }

    async fn run(graph: JobGraph<()>) -> RunReport {
        Scheduler::new("test", graph, Arc::new(()))
            .run()
            .await
            .expect("valid graph")
    }

    #[tokio::test]
    async fn hard_dependency_failure_skips_without_calling_flows() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut graph = JobGraph::new();
        let a = graph.add_job("a", fail("boom"));
        let b = graph.add_job("b", counted(&calls));
        let c = graph.add_job("c", counted(&calls));
        graph.add_edge(b, a, DependencyKind::Hard);
        graph.add_edge(c, b, DependencyKind::Hard);

        let report = run(graph).await;

        assert_eq!(report.state_of("a"), Some(JobState::Failed));
        assert_eq!(report.state_of("b"), Some(JobState::Skipped));
        assert_eq!(report.state_of("c"), Some(JobState::Skipped));
        assert_eq!(report.job("b").unwrap().skipped_because, vec!["a"]);
        assert_eq!(report.job("c").unwrap().skipped_because, vec!["b"]);
        assert_eq!(report.job("a").unwrap().error(), Some("assert: boom"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn soft_dependency_orders_but_ignores_outcome() {
        let mut graph = JobGraph::new();
        let a = graph.add_job(
            "a",
            vec![flow_fn(|_ctx: FlowContext<()>| async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err::<(), _>(anyhow::anyhow!("boom"))
            })],
        );
        let b = graph.add_job("b", ok());
        graph.add_edge(b, a, DependencyKind::Soft);

        let report = run(graph).await;

        let (a, b) = (report.job("a").unwrap(), report.job("b").unwrap());
        assert_eq!(a.state, JobState::Failed);
        assert_eq!(b.state, JobState::Succeeded);
        assert!(b.started_at.unwrap() >= a.finished_at.unwrap());
    }

    #[tokio::test]
    async fn independent_jobs_run_concurrently() {
        let barrier = Arc::new(Barrier::new(2));
        let meet = |barrier: &Arc<Barrier>| -> Flows {
            let barrier = Arc::clone(barrier);
            vec![flow_fn(move |_ctx: FlowContext<()>| {
                let barrier = Arc::clone(&barrier);
                async move {
                    barrier.wait().await;
                    Ok(())
                }
            })]
        };

        let mut graph = JobGraph::new();
        graph.add_job("left", meet(&barrier));
        graph.add_job("right", meet(&barrier));

        let report = tokio::time::timeout(Duration::from_secs(5), run(graph))
            .await
            .expect("both jobs must reach the barrier together");
        assert_eq!(report.counts().succeeded, 2);
    }

    #[rstest]
    #[case::self_loop(&[(0, 0)])]
    #[case::two_nodes(&[(0, 1), (1, 0)])]
    #[case::long_loop(&[(0, 1), (1, 2), (2, 3), (3, 0)])]
    #[tokio::test]
    async fn cycles_are_rejected_before_any_flow_runs(#[case] edges: &[(usize, usize)]) {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut graph = JobGraph::new();
        let ids: Vec<_> = (0..4)
            .map(|i| graph.add_job(format!("job-{i}"), counted(&calls)))
            .collect();
        for &(job, dep) in edges {
            graph.add_edge(ids[job], ids[dep], DependencyKind::Hard);
        }

        let err = Scheduler::new("cyclic", graph, Arc::new(()))
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, ConfigError::Cycle { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn all_flows_of_a_failing_job_run_to_completion() {
        let finished = Arc::new(AtomicUsize::new(0));
        let slow = {
            let finished = Arc::clone(&finished);
            named_flow("slow", move |_ctx: FlowContext<()>| {
                let finished = Arc::clone(&finished);
                async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };
        let broken = |name: &'static str| {
            named_flow(name, move |_ctx: FlowContext<()>| async move {
                Err::<(), _>(anyhow::anyhow!("{name} broke"))
            })
        };

        let mut graph = JobGraph::new();
        graph.add_job("mixed", vec![broken("first"), slow, broken("second")]);

        let report = run(graph).await;
        let job = report.job("mixed").unwrap();

        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.errors, vec!["first: first broke", "second: second broke"]);
        assert_eq!(finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_flow_fails_only_its_job() {
        let mut graph = JobGraph::new();
        graph.add_job(
            "panics",
            vec![named_flow("explode", |_ctx: FlowContext<()>| async {
                if true {
                    panic!("unexpected state");
                }
                Ok(())
            })],
        );
        graph.add_job("sibling", ok());

        let report = run(graph).await;

        let job = report.job("panics").unwrap();
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error(), Some("explode: panicked: unexpected state"));
        assert_eq!(report.state_of("sibling"), Some(JobState::Succeeded));
    }

    #[tokio::test(start_paused = true)]
    async fn job_timeout_fails_slow_jobs() {
        let mut graph = JobGraph::new();
        let slow = graph.add_job(
            "slow",
            vec![flow_fn(|_ctx: FlowContext<()>| async {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok(())
            })],
        );
        let next = graph.add_job("next", ok());
        graph.add_edge(next, slow, DependencyKind::Hard);

        let report = Scheduler::new("timeouts", graph, Arc::new(()))
            .with_job_timeout(Some(Duration::from_secs(1)))
            .run()
            .await
            .unwrap();

        assert_eq!(report.state_of("slow"), Some(JobState::Failed));
        assert_eq!(report.job("slow").unwrap().error(), Some("timed out after 1s"));
        assert_eq!(report.state_of("next"), Some(JobState::Skipped));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_keeps_errors_of_flows_that_already_failed() {
        let mut graph = JobGraph::new();
        graph.add_job(
            "council",
            vec![
                named_flow("announce", |_ctx: FlowContext<()>| async {
                    Err::<(), _>(anyhow::anyhow!("announcing period not open"))
                }),
                named_flow("elect", |_ctx: FlowContext<()>| async {
                    tokio::time::sleep(Duration::from_secs(600)).await;
                    Ok(())
                }),
            ],
        );

        let report = Scheduler::new("timeouts", graph, Arc::new(()))
            .with_job_timeout(Some(Duration::from_secs(1)))
            .run()
            .await
            .unwrap();

        assert_eq!(
            report.job("council").unwrap().errors,
            vec!["announce: announcing period not open", "timed out after 1s"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_a_run_aborts_flows_and_releases_leases() {
        let lock = ResourceLock::new();
        let finished = Arc::new(AtomicUsize::new(0));
        let holder = {
            let finished = Arc::clone(&finished);
            named_flow("hold-proposals", move |ctx: FlowContext<()>| {
                let finished = Arc::clone(&finished);
                async move {
                    let _lease = ctx.lock("proposals").await;
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
        };
        let mut graph = JobGraph::new();
        graph.add_job("proposals", vec![holder]);

        let run = Scheduler::new("cancelled", graph, Arc::new(()))
            .with_lock(lock.clone())
            .run();
        assert!(tokio::time::timeout(Duration::from_secs(1), run).await.is_err());

        // Aborted tasks are dropped on their next poll.
        for _ in 0..100 {
            if !lock.is_held("proposals") {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!lock.is_held("proposals"));

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn blocked_job_goes_straight_from_pending_to_skipped() {
        let mut graph = JobGraph::new();
        let a = graph.add_job("a", ok());
        let b = graph.add_job("b", ok());
        let c = graph.add_job("c", ok());
        let d = graph.add_job("d", ok());
        graph.add_edge(b, a, DependencyKind::Hard);
        graph.add_edge(c, a, DependencyKind::Soft);
        graph.add_edge(d, b, DependencyKind::Hard);

        let mut progress = Progress::new(&graph);
        assert_eq!(progress.ready.pop_front(), Some(a));
        assert_eq!(progress.states[&b], JobState::Pending);

        let now = Utc::now();
        progress.settle(&graph, JobReport::failed(a, "a", now, now, vec!["boom".into()]));

        assert_eq!(progress.states[&b], JobState::Skipped);
        assert_eq!(progress.states[&d], JobState::Skipped);
        assert_eq!(progress.states[&c], JobState::Ready);
        assert_eq!(progress.ready.iter().copied().collect::<Vec<_>>(), vec![c]);
        assert_eq!(progress.reports[&d].skipped_because, vec!["b"]);
    }

    #[tokio::test]
    async fn flows_share_the_run_lock_and_env() {
        async fn check(ctx: FlowContext<()>) -> FlowResult {
            anyhow::ensure!(ctx.env().get("NODE_URL") == Some("ws://node"), "env missing");
            let lease = ctx.lock("proposals").await;
            anyhow::ensure!(ctx.resource_lock().is_held("proposals"), "lock not held");
            lease.release();
            Ok(())
        }

        let lock = ResourceLock::new();
        let mut graph = JobGraph::new();
        graph.add_job("one", vec![flow_fn(check)]);
        graph.add_job("two", vec![flow_fn(check)]);

        let report = Scheduler::new("shared", graph, Arc::new(()))
            .with_env(Arc::new(Env::from_iter([("NODE_URL", "ws://node")])))
            .with_lock(lock.clone())
            .run()
            .await
            .unwrap();

        assert!(report.is_success(), "{report}");
        assert!(!lock.is_held("proposals"));
    }

    #[tokio::test]
    async fn report_lists_jobs_in_declaration_order() {
        let mut graph = JobGraph::new();
        let late = graph.add_job("declared-first", ok());
        let early = graph.add_job("declared-second", ok());
        graph.add_edge(late, early, DependencyKind::Hard);

        let report = run(graph).await;
        let names: Vec<_> = report.jobs.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["declared-first", "declared-second"]);
    }
}
