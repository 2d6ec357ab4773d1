//! Flows: the opaque async units of work that make up a job's body.
//!
//! A flow receives a `FlowContext` (job name, environment, resource lock and
//! the injected external collaborators) and either succeeds or returns an
//! error. Everything a flow does beyond that is outside the engine.

use std::borrow::Cow;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::RunId;
use crate::env::Env;
use crate::lock::{Lease, Resource, ResourceLock};

/// Result of one flow. Flows are assertion-heavy glue, so any error type goes.
pub type FlowResult = anyhow::Result<()>;

/// Bound for the external collaborators (chain client, query client, ...)
/// shared by every flow of a scenario.
pub trait Services: Send + Sync + 'static {}

impl<T: Send + Sync + 'static> Services for T {}

/// A unit of work executed as (part of) a job.
///
/// # Example
/// ```ignore
/// struct CreateMembers;
///
/// #[async_trait]
/// impl Flow<ChainClients> for CreateMembers {
///     async fn run(&self, ctx: FlowContext<ChainClients>) -> FlowResult {
///         ctx.services().chain.buy_membership("alice").await?;
///         Ok(())
///     }
///
///     fn name(&self) -> &str {
///         "create-members"
///     }
/// }
/// ```
#[async_trait]
pub trait Flow<S: Services>: Send + Sync {
    async fn run(&self, ctx: FlowContext<S>) -> FlowResult;

    /// Name used in logs and failure messages.
    fn name(&self) -> &str {
        "flow"
    }
}

/// Everything a flow gets to work with.
pub struct FlowContext<S> {
    job: Arc<str>,
    run_id: RunId,
    env: Arc<Env>,
    lock: ResourceLock,
    services: Arc<S>,
}

impl<S> Clone for FlowContext<S> {
    fn clone(&self) -> Self {
        Self {
            job: Arc::clone(&self.job),
            run_id: self.run_id,
            env: Arc::clone(&self.env),
            lock: self.lock.clone(),
            services: Arc::clone(&self.services),
        }
    }
}

impl<S: Services> FlowContext<S> {
    /// Build a context by hand, e.g. to run a single flow in a unit test.
    pub fn new(
        job: impl Into<Arc<str>>,
        run_id: RunId,
        env: Arc<Env>,
        lock: ResourceLock,
        services: Arc<S>,
    ) -> Self {
        Self {
            job: job.into(),
            run_id,
            env,
            lock,
            services,
        }
    }

    /// Name of the job this flow belongs to.
    pub fn job_name(&self) -> &str {
        &self.job
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn services(&self) -> &S {
        &self.services
    }

    /// Wait for exclusive access to `resource`. See `ResourceLock::acquire`.
    pub async fn lock(&self, resource: impl Into<Resource>) -> Lease {
        self.lock.acquire(resource).await
    }

    pub fn resource_lock(&self) -> &ResourceLock {
        &self.lock
    }
}

/// Flow backed by an async closure.
pub struct FnFlow<F> {
    name: Cow<'static, str>,
    f: F,
}

#[async_trait]
impl<S, F, Fut> Flow<S> for FnFlow<F>
where
    S: Services,
    F: Fn(FlowContext<S>) -> Fut + Send + Sync,
    Fut: Future<Output = FlowResult> + Send,
{
    async fn run(&self, ctx: FlowContext<S>) -> FlowResult {
        (self.f)(ctx).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Wrap an async closure as a flow.
///
/// ```ignore
/// ctx.job("council", flow_fn(|ctx| async move { elect_council(ctx).await }));
/// ```
pub fn flow_fn<S, F, Fut>(f: F) -> Arc<dyn Flow<S>>
where
    S: Services,
    F: Fn(FlowContext<S>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FlowResult> + Send + 'static,
{
    named_flow("flow", f)
}

/// Wrap an async closure as a flow with a name for logs and failures.
pub fn named_flow<S, F, Fut>(name: impl Into<Cow<'static, str>>, f: F) -> Arc<dyn Flow<S>>
where
    S: Services,
    F: Fn(FlowContext<S>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FlowResult> + Send + 'static,
{
    Arc::new(FnFlow {
        name: name.into(),
        f,
    })
}

/// Box a `Flow` implementation.
pub fn flow<S: Services, T: Flow<S> + 'static>(flow: T) -> Arc<dyn Flow<S>> {
    Arc::new(flow)
}

/// Anything usable as a job body: one flow, an array or a `Vec` of flows.
pub trait IntoFlows<S: Services> {
    fn into_flows(self) -> Vec<Arc<dyn Flow<S>>>;
}

impl<S: Services> IntoFlows<S> for Arc<dyn Flow<S>> {
    fn into_flows(self) -> Vec<Arc<dyn Flow<S>>> {
        vec![self]
    }
}

impl<S: Services> IntoFlows<S> for Vec<Arc<dyn Flow<S>>> {
    fn into_flows(self) -> Vec<Arc<dyn Flow<S>>> {
        self
    }
}

impl<S: Services, const N: usize> IntoFlows<S> for [Arc<dyn Flow<S>>; N] {
    fn into_flows(self) -> Vec<Arc<dyn Flow<S>>> {
        self.into_iter().collect()
    }
}
