//! Job record: a named node of the graph and its body.

use std::fmt;
use std::sync::Arc;

use crate::domain::JobId;
use crate::flow::{Flow, Services};

/// A declared job.
///
/// Design:
/// - The graph owns records; handles and the scheduler refer to them by `JobId`.
/// - Edges live in the `DependencyGraph`, not here.
pub struct JobRecord<S: Services> {
    pub id: JobId,
    pub name: Arc<str>,

    /// Job body. Flows run concurrently when the job runs.
    pub flows: Vec<Arc<dyn Flow<S>>>,
}

impl<S: Services> JobRecord<S> {
    pub fn new(id: JobId, name: impl Into<Arc<str>>, flows: Vec<Arc<dyn Flow<S>>>) -> Self {
        Self {
            id,
            name: name.into(),
            flows,
        }
    }

    /// Flow names, for logs.
    pub fn flow_names(&self) -> Vec<&str> {
        self.flows.iter().map(|f| f.name()).collect()
    }
}

impl<S: Services> fmt::Debug for JobRecord<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("flows", &self.flow_names())
            .finish()
    }
}
