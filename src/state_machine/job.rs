use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Stable job identifier: `{stream}/{category}/{sequence:03}`.
///
/// Derived from the plan, so re-planning the same request yields the same ids.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(stream: &str, category: Category, sequence: u32) -> Self {
        Self(format!("{stream}/{}/{sequence:03}", category.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

/// The closed set of render stages.
///
/// Declaration order is the execution order: primary before refinement
/// before combine.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// First pass; produces an intermediate artifact.
    #[serde(alias = "high", alias = "HIGH")]
    Primary,
    /// Second pass over a primary artifact; produces a finished segment.
    #[serde(alias = "low", alias = "LOW")]
    Refinement,
    /// Folds a finished segment into the running combined output.
    #[serde(alias = "COMBINE")]
    Combine,
}

/// Per-category scheduling rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CategoryRule {
    /// Position in the primary → refinement → combine order.
    pub rank: u8,
    /// Gated until every non-gated job of the same stream is Completed.
    pub barrier: bool,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Primary, Category::Refinement, Category::Combine];

    pub fn rule(self) -> CategoryRule {
        match self {
            Category::Primary => CategoryRule {
                rank: 0,
                barrier: false,
            },
            Category::Refinement => CategoryRule {
                rank: 1,
                barrier: false,
            },
            Category::Combine => CategoryRule {
                rank: 2,
                barrier: true,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Primary => "primary",
            Category::Refinement => "refinement",
            Category::Combine => "combine",
        }
    }

    /// The category after this one in round-robin order.
    pub fn next(self) -> Category {
        match self {
            Category::Primary => Category::Refinement,
            Category::Refinement => Category::Combine,
            Category::Combine => Category::Primary,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" | "high" => Ok(Category::Primary),
            "refinement" | "low" => Ok(Category::Refinement),
            "combine" => Ok(Category::Combine),
            other => Err(format!("unknown job category `{other}`")),
        }
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Assigned => "assigned",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Location of an artifact produced by the render backend.
///
/// Either a path relative to the backend's output directory, an absolute
/// path, or a `scheme://` reference that is not on the local filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    pub fn new(location: impl Into<String>) -> Self {
        Self(location.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_local(&self) -> bool {
        !self.0.contains("://")
    }

    /// Resolves a local artifact against the backend output root.
    pub fn resolve(&self, root: Option<&Path>) -> Option<PathBuf> {
        if !self.is_local() {
            return None;
        }
        let path = Path::new(&self.0);
        match root {
            Some(root) if path.is_relative() => Some(root.join(path)),
            _ => Some(path.to_path_buf()),
        }
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why an attempt (or a job) failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureKind {
    /// The backend ran the job and reported a failure.
    Execution(String),
    /// The instance could not be reached or answered nonsense.
    Transient(String),
    /// The submission exceeded its time bound.
    Timeout { after_ms: u64 },
    /// A prerequisite failed permanently. Consumes no attempt.
    Propagated { upstream: JobId },
}

impl FailureKind {
    pub fn consumes_attempt(&self) -> bool {
        !matches!(self, FailureKind::Propagated { .. })
    }

    /// Failures that say something about the instance rather than the job.
    pub fn is_instance_fault(&self) -> bool {
        matches!(self, FailureKind::Transient(_) | FailureKind::Timeout { .. })
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Execution(msg) => write!(f, "execution failure: {msg}"),
            FailureKind::Transient(msg) => write!(f, "transient failure: {msg}"),
            FailureKind::Timeout { after_ms } => write!(f, "timed out after {after_ms}ms"),
            FailureKind::Propagated { upstream } => write!(f, "upstream job {upstream} failed"),
        }
    }
}

/// The result of one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Success(Vec<ArtifactRef>),
    Failure(FailureKind),
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries before marking a job as failed.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 5000,
        }
    }
}

impl RetryConfig {
    /// Calculate the delay for a given retry attempt using exponential backoff.
    /// delay = base_delay_ms * 2^(attempt - 1)
    pub fn delay_for_attempt(&self, attempt: u32) -> u64 {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay_ms.saturating_mul(2u64.pow(exp))
    }

    pub fn attempts_remain(&self, attempt_count: u32) -> bool {
        attempt_count <= self.max_retries
    }
}

/// A single unit of render work.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: JobId,
    pub stream: String,
    pub category: Category,
    pub sequence_number: u32,
    /// First unit (frame) of the stream this chunk covers.
    pub start_unit: u64,
    pub unit_count: u64,
    pub depends_on: Vec<JobId>,
    /// Upstream outputs, resolved right before submission.
    pub inputs: Vec<ArtifactRef>,
    pub state: JobState,
    pub state_history: Vec<JobState>,
    pub attempt_count: u32,
    pub last_error: Option<FailureKind>,
    pub output_refs: Vec<ArtifactRef>,
    pub assigned_instance: Option<String>,
    pub retry_config: RetryConfig,
    /// Retry backoff gate.
    #[serde(skip)]
    pub not_before: Option<Instant>,
}

impl Job {
    pub fn new(
        stream: &str,
        category: Category,
        sequence_number: u32,
        start_unit: u64,
        unit_count: u64,
        depends_on: Vec<JobId>,
        retry_config: RetryConfig,
    ) -> Self {
        Self {
            id: JobId::new(stream, category, sequence_number),
            stream: stream.to_string(),
            category,
            sequence_number,
            start_unit,
            unit_count,
            depends_on,
            inputs: Vec::new(),
            state: JobState::Pending,
            state_history: Vec::new(),
            attempt_count: 0,
            last_error: None,
            output_refs: Vec::new(),
            assigned_instance: None,
            retry_config,
            not_before: None,
        }
    }

    /// Pending and past any backoff gate.
    pub fn is_ready_at(&self, now: Instant) -> bool {
        self.state == JobState::Pending && self.not_before.is_none_or(|t| t <= now)
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id.clone(),
            category: self.category,
            sequence_number: self.sequence_number,
            state: self.state,
            attempt_count: self.attempt_count,
            last_error: self.last_error.clone(),
            output_refs: self.output_refs.clone(),
        }
    }
}

/// The persisted view of a job inside a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub category: Category,
    pub sequence_number: u32,
    pub state: JobState,
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<FailureKind>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_refs: Vec<ArtifactRef>,
}

/// One line of the per-job ledger reported at the end of a run.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub job_id: JobId,
    pub stream: String,
    pub category: Category,
    pub sequence_number: u32,
    pub state: JobState,
    pub attempts: u32,
    pub instance: Option<String>,
    pub error: Option<FailureKind>,
    pub outputs: Vec<ArtifactRef>,
}

impl LedgerEntry {
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            stream: job.stream.clone(),
            category: job.category,
            sequence_number: job.sequence_number,
            state: job.state,
            attempts: job.attempt_count,
            instance: job.assigned_instance.clone(),
            error: job.last_error.clone(),
            outputs: job.output_refs.clone(),
        }
    }
}
