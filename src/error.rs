use thiserror::Error;

use crate::state_machine::{Category, JobId, JobState};

/// Planning rejected a request. Planning never yields a partial graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("stream `{0}` has zero units to render")]
    ZeroUnits(String),

    #[error("stream `{stream}` has invalid chunk size {chunk_size}")]
    InvalidChunkSize { stream: String, chunk_size: u64 },

    #[error("stream name must not be empty")]
    EmptyStreamName,

    #[error("stream `{0}` is listed more than once")]
    DuplicateStream(String),

    #[error("no streams to plan")]
    NoStreams,

    #[error("stream `{stream}` needs {chunks} chunks; at most 4294967295 are supported")]
    TooManyChunks { stream: String, chunks: u64 },

    #[error("job {0} appears twice in the graph")]
    DuplicateJob(JobId),

    #[error("job {job} depends on unknown job {dependency}")]
    UnknownDependency { job: JobId, dependency: JobId },
}

/// An event was applied to a job in a state that does not accept it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("job {job_id}: event `{event}` is not valid in state {from}")]
pub struct TransitionError {
    pub job_id: JobId,
    pub from: JobState,
    pub event: &'static str,
}

/// Instance topology problems. Always surfaced before any job is dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("no enabled render instances are configured")]
    NoInstances,

    #[error("none of the {0} configured instances is reachable")]
    NoHealthyInstances(usize),

    #[error("no healthy instance accepts {0} jobs and no fallback instance is available")]
    UncoveredCategory(Category),

    #[error("invalid instance `{0}`: {1}")]
    InvalidInstance(String, String),
}

/// Errors raised by a render backend for one call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Connection refused, DNS failure, transport timeout.
    #[error("instance unreachable: {0}")]
    Unreachable(String),

    /// The server answered but not in a way we understand.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server ran the job and reported a failure.
    #[error("execution failed: {0}")]
    Execution(String),
}

#[derive(Debug, Error)]
pub enum MutateError {
    #[error("no workflow template configured for {0} jobs")]
    MissingTemplate(Category),

    #[error("failed to read template {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("template {path} is not valid JSON: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("job {job} references input #{index} but only {available} inputs exist")]
    MissingInput {
        job: JobId,
        index: usize,
        available: usize,
    },
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("artifact {0} is not a local file")]
    NotLocal(String),

    #[error("artifact {0} does not exist")]
    Missing(String),

    #[error("upload of {artifact} failed: {source}")]
    Io {
        artifact: String,
        #[source]
        source: std::io::Error,
    },
}

/// Checkpoint and lease failures. Fatal to a run: resume safety is gone.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no checkpoint found for run `{0}`")]
    NotFound(String),

    #[error("run `{run_id}` is leased by another process (lock file {path})")]
    LeaseHeld { run_id: String, path: String },

    #[error("checkpoint for run `{0}` already exists; use `resume`")]
    AlreadyExists(String),

    #[error("checkpoint does not match the re-planned job graph: {0}")]
    PlanMismatch(String),

    #[error("invalid run id `{0}`")]
    InvalidRunId(String),

    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that end a run without a normal report.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("state store failure: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("no render instance recovered after {rounds} probe rounds; {remaining} jobs left unfinished")]
    PoolExhausted { rounds: u32, remaining: usize },
}
