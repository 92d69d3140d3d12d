//! The seams between the scheduler and the outside world: the render server,
//! the workflow builder and artifact storage.

mod http;
mod simulated;
mod storage;
mod template;

use serde::Serialize;

use crate::error::BackendError;
use crate::pool::InstanceTarget;
use crate::state_machine::{ArtifactRef, Category, FailureKind, JobId};

pub use http::HttpRenderBackend;
pub use simulated::SimulatedBackend;
pub use storage::{ArtifactStorage, LocalArtifactStorage};
pub use template::{PassthroughMutator, TemplateMutator, WorkflowMutator};

/// What gets sent to a render instance for one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobDescription {
    pub job_id: JobId,
    pub category: Category,
    pub workflow: serde_json::Value,
}

/// A render server. Implementations must be shareable across the spawned
/// submission tasks.
pub trait RenderBackend: Send + Sync + 'static {
    /// Cheap reachability check.
    fn probe(&self, target: &InstanceTarget) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Runs one job to completion and returns its output artifacts.
    fn submit(
        &self,
        target: &InstanceTarget,
        description: JobDescription,
    ) -> impl Future<Output = Result<Vec<ArtifactRef>, BackendError>> + Send;
}

impl From<BackendError> for FailureKind {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::Unreachable(msg) | BackendError::Protocol(msg) => FailureKind::Transient(msg),
            BackendError::Execution(msg) => FailureKind::Execution(msg),
        }
    }
}
