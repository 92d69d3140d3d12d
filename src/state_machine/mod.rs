mod graph;
mod job;
mod state;

pub use graph::JobGraph;
pub use job::{
    ArtifactRef, Category, FailureKind, Job, JobId, JobOutcome, JobState, JobSummary,
    LedgerEntry, RetryConfig,
};
pub use state::{JobEvent, StateMachine, Transition};
