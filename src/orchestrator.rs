//! The coordinating loop of a run.
//!
//! One task owns the job graph, the ready queues and the instance pool, so
//! picking a job and marking it Assigned never races. Submissions run as
//! spawned tasks in a [`JoinSet`]; their results come back to the loop,
//! which records them, checkpoints and dispatches whatever became ready.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::{self, JoinError, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backend::{ArtifactStorage, RenderBackend, WorkflowMutator};
use crate::config::{InstanceConfig, RunSettings};
use crate::error::{ConfigError, RunError, StorageError, StoreError};
use crate::planner::{StreamRequest, plan};
use crate::pool::{InstanceOutcome, InstancePool, InstanceStatus, InstanceTarget, PoolMode};
use crate::queue::{Dispatch, QueueManager};
use crate::state_machine::{
    ArtifactRef, FailureKind, Job, JobEvent, JobGraph, JobId, JobOutcome, JobState, LedgerEntry,
    StateMachine, Transition,
};
use crate::store::{RunLease, RunPhase, RunState, StateStore};

/// Cooperative cancellation shared between the run and whoever stops it.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

/// Receives run events for display. Every method defaults to a no-op.
pub trait ProgressSink: Send + Sync {
    fn run_started(&self, _total: usize, _already_completed: usize) {}
    fn job_dispatched(&self, _job: &JobId, _instance: &str) {}
    fn job_retrying(&self, _job: &Job, _delay_ms: u64) {}
    fn job_finished(&self, _job: &Job) {}
    fn jobs_propagated(&self, _failed: &JobId, _dependents: &[JobId]) {}
    fn run_finished(&self, _status: RunStatus) {}
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    PartialFailure,
    FatalConfigError,
    Cancelled,
}

impl RunStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            RunStatus::Completed => 0,
            RunStatus::PartialFailure => 2,
            RunStatus::FatalConfigError => 3,
            RunStatus::Cancelled => 130,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedJob {
    pub job_id: JobId,
    pub error: Option<FailureKind>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Upload {
    pub stream: String,
    pub artifact: ArtifactRef,
    pub location: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadFailure {
    pub stream: String,
    pub artifact: ArtifactRef,
    pub error: String,
}

/// What a run did, for the CLI and for tests.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_error: Option<String>,
    pub degraded_to: Option<String>,
    /// Submissions started by this process.
    pub dispatched: usize,
    /// Jobs that were Running or Assigned in the checkpoint and run again.
    pub requeued_on_resume: Vec<JobId>,
    pub failed: Vec<FailedJob>,
    pub uploaded: Vec<Upload>,
    pub upload_failures: Vec<UploadFailure>,
    /// Instance health and load when the run stopped.
    pub instances: Vec<InstanceStatus>,
    pub ledger: Vec<LedgerEntry>,
}

impl RunReport {
    pub fn completed_jobs(&self) -> usize {
        self.ledger
            .iter()
            .filter(|e| e.state == JobState::Completed)
            .count()
    }
}

type SubmitResult = Result<Vec<ArtifactRef>, FailureKind>;

/// Everything the coordinating loop owns for one run.
struct RunCtx {
    graph: JobGraph,
    pool: InstancePool,
    queue: QueueManager,
    state: RunState,
    tasks: JoinSet<SubmitResult>,
    in_flight: HashMap<task::Id, (JobId, String)>,
    dispatched: usize,
    /// Streams whose final combine just completed, awaiting upload.
    finished_streams: Vec<String>,
    uploaded: Vec<Upload>,
    upload_failures: Vec<UploadFailure>,
    stalled_rounds: u32,
}

enum Wake {
    Joined(Option<Result<(task::Id, SubmitResult), JoinError>>),
    Idle { waiting_on_retry: bool },
    Cancel,
}

pub struct Orchestrator<B> {
    settings: RunSettings,
    instances: Vec<InstanceConfig>,
    backend: Arc<B>,
    mutator: Box<dyn WorkflowMutator>,
    storage: Option<Arc<dyn ArtifactStorage>>,
    store: StateStore,
    progress: Box<dyn ProgressSink>,
}

impl<B: RenderBackend> Orchestrator<B> {
    pub fn new(
        settings: RunSettings,
        instances: Vec<InstanceConfig>,
        backend: Arc<B>,
        mutator: Box<dyn WorkflowMutator>,
        store: StateStore,
    ) -> Self {
        Self {
            settings,
            instances,
            backend,
            mutator,
            storage: None,
            store,
            progress: Box::new(NoProgress),
        }
    }

    pub fn with_storage(mut self, storage: Box<dyn ArtifactStorage>) -> Self {
        self.storage = Some(Arc::from(storage));
        self
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    #[cfg(test)]
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Plans `requests` and runs them as a new run.
    pub async fn start(
        &self,
        run_id: &str,
        requests: Vec<StreamRequest>,
        cancel: &CancelToken,
    ) -> Result<RunReport, RunError> {
        if self.store.exists(run_id) {
            return Err(StoreError::AlreadyExists(run_id.to_string()).into());
        }
        let graph = plan(&requests, self.settings.retry)?;
        info!(run_id, jobs = graph.len(), streams = requests.len(), "run planned");
        self.run(run_id, graph, requests, BTreeSet::new(), Vec::new(), cancel)
            .await
    }

    /// Picks up a checkpointed run. Completed work is reused; jobs whose
    /// outcome was unknown run again; failed jobs run again when attempts
    /// remain.
    pub async fn resume(&self, run_id: &str, cancel: &CancelToken) -> Result<RunReport, RunError> {
        let mut checkpoint = self.store.load(run_id)?;
        if self.settings.verify_outputs_on_resume {
            self.drop_missing_outputs(&mut checkpoint);
        }

        let mut graph = plan(&checkpoint.requests, self.settings.retry)?;
        let requeued = graph.apply_summaries(&checkpoint.jobs)?;

        let now = Instant::now();
        let failed: Vec<JobId> = graph
            .iter()
            .filter(|j| j.state == JobState::Failed)
            .map(|j| j.id.clone())
            .collect();
        let mut revived = 0;
        for id in failed {
            if let Some(job) = graph.get_mut(&id)
                && StateMachine::apply(job, JobEvent::Revive, now).is_ok()
            {
                revived += 1;
            }
        }

        info!(
            run_id,
            requeued = requeued.len(),
            revived,
            completed = graph.iter().filter(|j| j.state == JobState::Completed).count(),
            "resuming run"
        );
        self.run(
            run_id,
            graph,
            checkpoint.requests,
            checkpoint.uploaded_streams,
            requeued,
            cancel,
        )
        .await
    }

    /// Marks Completed jobs whose local outputs vanished as Pending again.
    fn drop_missing_outputs(&self, checkpoint: &mut RunState) {
        let root = self.settings.artifact_root.as_deref();
        for summary in &mut checkpoint.jobs {
            if summary.state != JobState::Completed {
                continue;
            }
            let missing = summary
                .output_refs
                .iter()
                .filter_map(|r| r.resolve(root))
                .any(|path| !path.exists());
            if missing {
                warn!(job_id = %summary.id, "completed job lost its outputs; running it again");
                summary.state = JobState::Pending;
                summary.output_refs.clear();
            }
        }
    }

    async fn run(
        &self,
        run_id: &str,
        graph: JobGraph,
        requests: Vec<StreamRequest>,
        uploaded_streams: BTreeSet<String>,
        requeued_on_resume: Vec<JobId>,
        cancel: &CancelToken,
    ) -> Result<RunReport, RunError> {
        let _lease = RunLease::acquire(self.store.dir(), run_id)?;

        let mut pool = InstancePool::new(&self.instances, self.settings.reprobe_interval);
        let targets = pool.targets();
        self.probe(&mut pool, targets).await;

        let mut state = RunState::new(run_id, requests, graph.summaries());
        state.uploaded_streams = uploaded_streams;
        let mut ctx = RunCtx {
            queue: QueueManager::from_graph(&graph),
            graph,
            pool,
            state,
            tasks: JoinSet::new(),
            in_flight: HashMap::new(),
            dispatched: 0,
            finished_streams: Vec::new(),
            uploaded: Vec::new(),
            upload_failures: Vec::new(),
            stalled_rounds: 0,
        };

        let required: BTreeSet<_> = ctx
            .graph
            .iter()
            .filter(|j| !j.state.is_terminal())
            .map(|j| j.category)
            .collect();
        let mut degraded_to = None;
        if !required.is_empty() {
            match ctx.pool.validate(&required) {
                Ok(PoolMode::Normal) => {}
                Ok(PoolMode::Degraded { catch_all }) => degraded_to = Some(catch_all),
                Err(e) => return self.abort_on_config(ctx, run_id, e, requeued_on_resume),
            }
        }

        self.checkpoint(&mut ctx)?;
        self.fail_carried_over(&mut ctx);
        if self.upload_pending(&mut ctx).await {
            self.checkpoint(&mut ctx)?;
        }
        let already = ctx
            .graph
            .iter()
            .filter(|j| j.state == JobState::Completed)
            .count();
        self.progress.run_started(ctx.graph.len(), already);

        let cancelled = self.drive(&mut ctx, run_id, cancel).await?;

        let status = if ctx.graph.is_finished() {
            if ctx.graph.iter().all(|j| j.state == JobState::Completed) {
                RunStatus::Completed
            } else {
                RunStatus::PartialFailure
            }
        } else if cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::PartialFailure
        };

        ctx.state.status = match status {
            RunStatus::Completed => RunPhase::Completed,
            RunStatus::Cancelled => RunPhase::Cancelled,
            _ => RunPhase::PartialFailure,
        };
        self.checkpoint(&mut ctx)?;
        self.progress.run_finished(status);
        info!(run_id, ?status, dispatched = ctx.dispatched, "run finished");

        let mut report = self.report(&ctx, run_id, status, requeued_on_resume);
        report.degraded_to = degraded_to;
        Ok(report)
    }

    fn abort_on_config(
        &self,
        mut ctx: RunCtx,
        run_id: &str,
        err: ConfigError,
        requeued_on_resume: Vec<JobId>,
    ) -> Result<RunReport, RunError> {
        error!(run_id, error = %err, "instance topology cannot run this plan");
        ctx.state.status = RunPhase::Aborted;
        self.checkpoint(&mut ctx)?;
        let mut report = self.report(&ctx, run_id, RunStatus::FatalConfigError, requeued_on_resume);
        report.config_error = Some(err.to_string());
        Ok(report)
    }

    /// Failed jobs restored from a checkpoint still poison their dependents.
    fn fail_carried_over(&self, ctx: &mut RunCtx) {
        let now = Instant::now();
        let roots: Vec<JobId> = ctx
            .graph
            .iter()
            .filter(|j| j.state == JobState::Failed)
            .filter(|j| !matches!(j.last_error, Some(FailureKind::Propagated { .. })))
            .map(|j| j.id.clone())
            .collect();
        for id in roots {
            let marked = ctx.queue.propagate_failure(&mut ctx.graph, &id, now);
            if !marked.is_empty() {
                self.progress.jobs_propagated(&id, &marked);
            }
        }
    }

    /// Dispatches and collects until every job is terminal, or until
    /// cancellation has drained the in-flight submissions. Returns whether
    /// the run was cancelled.
    async fn drive(&self, ctx: &mut RunCtx, run_id: &str, cancel: &CancelToken) -> Result<bool, RunError> {
        let mut cancelling = false;
        loop {
            if !cancelling && cancel.is_cancelled() {
                cancelling = true;
                info!(
                    run_id,
                    in_flight = ctx.tasks.len(),
                    pending = ctx.queue.pending(),
                    "cancellation requested; draining"
                );
            }
            if !cancelling {
                while let Some(dispatch) = ctx.queue.next_ready(&mut ctx.graph, &mut ctx.pool, Instant::now())? {
                    self.launch(ctx, dispatch)?;
                }
            }
            if ctx.tasks.is_empty() && (cancelling || ctx.graph.is_finished()) {
                return Ok(cancelling);
            }

            let now = Instant::now();
            let retry_at = ctx.queue.earliest_retry(&ctx.graph, now);
            let deadline = retry_at.map_or(now + self.settings.idle_timeout, |t| {
                t.min(now + self.settings.idle_timeout)
            });

            let wake = tokio::select! {
                joined = ctx.tasks.join_next_with_id(), if !ctx.tasks.is_empty() => Wake::Joined(joined),
                _ = tokio::time::sleep_until(deadline) => Wake::Idle { waiting_on_retry: retry_at.is_some() },
                _ = cancel.cancelled(), if !cancelling => Wake::Cancel,
            };

            match wake {
                Wake::Joined(Some(Ok((id, result)))) => {
                    ctx.stalled_rounds = 0;
                    if let Some((job_id, instance)) = ctx.in_flight.remove(&id) {
                        self.record(ctx, &job_id, &instance, result, true)?;
                        self.flush_uploads(ctx).await?;
                    }
                }
                Wake::Joined(Some(Err(join_err))) => {
                    ctx.stalled_rounds = 0;
                    if let Some((job_id, instance)) = ctx.in_flight.remove(&join_err.id()) {
                        error!(job_id = %job_id, error = %join_err, "submission task died");
                        let kind = FailureKind::Transient(format!("submission task died: {join_err}"));
                        self.record(ctx, &job_id, &instance, Err(kind), true)?;
                    }
                }
                Wake::Joined(None) => {}
                Wake::Idle { waiting_on_retry } => self.idle(ctx, run_id, waiting_on_retry).await?,
                Wake::Cancel => {}
            }
        }
    }

    /// Nothing finished within the idle timeout: re-probe instances that
    /// are due, and give up when nothing can make progress for too long.
    async fn idle(&self, ctx: &mut RunCtx, run_id: &str, waiting_on_retry: bool) -> Result<(), RunError> {
        let due = ctx.pool.due_for_probe(Instant::now());
        if !due.is_empty() {
            debug!(run_id, instances = due.len(), "re-probing instances");
            self.probe(&mut ctx.pool, due).await;
        }
        if !ctx.tasks.is_empty() || waiting_on_retry {
            return Ok(());
        }

        ctx.stalled_rounds += 1;
        warn!(
            run_id,
            round = ctx.stalled_rounds,
            limit = self.settings.stall_probe_limit,
            waiting = ?ctx.queue.waiting_categories(),
            unreachable = ?ctx.pool.unhealthy().iter().map(|t| t.id.as_str()).collect::<Vec<_>>(),
            "no job can be dispatched; waiting for instances"
        );
        if ctx.stalled_rounds >= self.settings.stall_probe_limit {
            ctx.state.status = RunPhase::Aborted;
            self.checkpoint(ctx)?;
            return Err(RunError::PoolExhausted {
                rounds: ctx.stalled_rounds,
                remaining: ctx.graph.unfinished(),
            });
        }
        Ok(())
    }

    async fn probe(&self, pool: &mut InstancePool, targets: Vec<InstanceTarget>) {
        for target in targets {
            let outcome = match self.backend.probe(&target).await {
                Ok(()) => InstanceOutcome::Success,
                Err(e) => {
                    debug!(instance = %target.id, error = %e, "probe failed");
                    InstanceOutcome::Unreachable
                }
            };
            pool.report(&target.id, outcome, Instant::now());
        }
    }

    /// Builds the description, marks the job Running, checkpoints and
    /// spawns the bounded submission.
    fn launch(&self, ctx: &mut RunCtx, dispatch: Dispatch) -> Result<(), RunError> {
        let Dispatch { job_id, instance, .. } = dispatch;
        let inputs = ctx.graph.resolve_inputs(&job_id);
        let Some(job) = ctx.graph.get_mut(&job_id) else {
            ctx.pool.release(&instance.id);
            return Ok(());
        };
        job.inputs = inputs;

        let description = match self.mutator.build(job, &job.inputs) {
            Ok(description) => description,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "could not build job description");
                let kind = FailureKind::Execution(e.to_string());
                return self.record(ctx, &job_id, &instance.id, Err(kind), false);
            }
        };

        StateMachine::apply(job, JobEvent::Start, Instant::now())?;
        ctx.dispatched += 1;
        debug!(job_id = %job_id, instance = %instance.id, attempt = job.attempt_count + 1, "job running");
        self.progress.job_dispatched(&job_id, &instance.id);
        self.checkpoint(ctx)?;

        let backend = Arc::clone(&self.backend);
        let bound = self.settings.submit_timeout;
        let instance_id = instance.id.clone();
        let handle = ctx.tasks.spawn(async move {
            match tokio::time::timeout(bound, backend.submit(&instance, description)).await {
                Ok(Ok(outputs)) => Ok(outputs),
                Ok(Err(e)) => Err(FailureKind::from(e)),
                Err(_) => Err(FailureKind::Timeout {
                    after_ms: u64::try_from(bound.as_millis()).unwrap_or(u64::MAX),
                }),
            }
        });
        ctx.in_flight.insert(handle.id(), (job_id, instance_id));
        Ok(())
    }

    /// Applies one attempt's result. `reached_instance` is false when the
    /// attempt failed before anything was sent.
    fn record(
        &self,
        ctx: &mut RunCtx,
        job_id: &JobId,
        instance: &str,
        result: SubmitResult,
        reached_instance: bool,
    ) -> Result<(), RunError> {
        let now = Instant::now();
        ctx.pool.release(instance);
        if reached_instance {
            let health = match &result {
                Err(kind) if kind.is_instance_fault() => InstanceOutcome::Unreachable,
                _ => InstanceOutcome::Success,
            };
            ctx.pool.report(instance, health, now);
        }

        let outcome = match result {
            Ok(outputs) => JobOutcome::Success(outputs),
            Err(kind) => JobOutcome::Failure(kind),
        };
        let Some(job) = ctx.graph.get_mut(job_id) else {
            return Ok(());
        };

        match StateMachine::apply(job, JobEvent::Finish(outcome), now)? {
            Transition::Complete(JobOutcome::Success(outputs)) => {
                info!(job_id = %job_id, instance, outputs = outputs.len(), "job completed");
                self.progress.job_finished(job);
                let stream = job.stream.clone();
                if ctx.graph.final_combine(&stream).is_some_and(|last| &last.id == job_id) {
                    ctx.state.uploaded_streams.remove(&stream);
                    ctx.finished_streams.push(stream);
                }
            }
            Transition::Retry { reason, delay_ms } => {
                warn!(
                    job_id = %job_id,
                    attempt = job.attempt_count,
                    max_retries = job.retry_config.max_retries,
                    delay_ms,
                    reason = %reason,
                    "attempt failed; retrying"
                );
                ctx.queue.enqueue(job);
                self.progress.job_retrying(job, delay_ms);
            }
            Transition::Complete(JobOutcome::Failure(kind)) => {
                error!(job_id = %job_id, attempts = job.attempt_count, error = %kind, "job failed");
                self.progress.job_finished(job);
                let marked = ctx.queue.propagate_failure(&mut ctx.graph, job_id, now);
                if !marked.is_empty() {
                    warn!(job_id = %job_id, dependents = marked.len(), "failure propagated");
                    self.progress.jobs_propagated(job_id, &marked);
                }
            }
            Transition::Next(_) => {}
        }
        self.checkpoint(ctx)?;
        Ok(())
    }

    fn checkpoint(&self, ctx: &mut RunCtx) -> Result<(), StoreError> {
        ctx.state.jobs = ctx.graph.summaries();
        ctx.state.updated_at = Utc::now();
        self.store.save(&ctx.state)
    }

    /// Uploads the streams whose final combine completed since the last
    /// call, then checkpoints which of them made it.
    async fn flush_uploads(&self, ctx: &mut RunCtx) -> Result<(), StoreError> {
        if ctx.finished_streams.is_empty() {
            return Ok(());
        }
        for stream in std::mem::take(&mut ctx.finished_streams) {
            self.upload_stream(ctx, &stream).await;
        }
        self.checkpoint(ctx)
    }

    /// Uploads every finished stream the checkpoint has no upload for, such
    /// as one interrupted between its final combine and the upload. Returns
    /// whether anything was attempted.
    async fn upload_pending(&self, ctx: &mut RunCtx) -> bool {
        if self.storage.is_none() {
            return false;
        }
        let pending: Vec<String> = ctx
            .graph
            .streams()
            .into_iter()
            .filter(|stream| !ctx.state.uploaded_streams.contains(*stream))
            .filter(|stream| {
                ctx.graph
                    .final_combine(stream)
                    .is_some_and(|last| last.state == JobState::Completed)
            })
            .map(str::to_string)
            .collect();
        for stream in &pending {
            info!(stream, "uploading final output left over from an earlier session");
            self.upload_stream(ctx, stream).await;
        }
        !pending.is_empty()
    }

    /// Sends the outputs of `stream`'s final combine to storage. The stream
    /// counts as uploaded only when every artifact made it. Failures are
    /// reported, never fatal.
    async fn upload_stream(&self, ctx: &mut RunCtx, stream: &str) {
        let Some(storage) = &self.storage else {
            return;
        };
        let artifacts = match ctx.graph.final_combine(stream) {
            Some(last) if last.state == JobState::Completed => last.output_refs.clone(),
            _ => return,
        };

        let mut complete = true;
        for artifact in artifacts {
            let storage = Arc::clone(storage);
            let target = artifact.clone();
            let result = tokio::task::spawn_blocking(move || storage.upload(&target))
                .await
                .unwrap_or_else(|e| {
                    Err(StorageError::Io {
                        artifact: artifact.to_string(),
                        source: std::io::Error::other(e.to_string()),
                    })
                });
            match result {
                Ok(location) => {
                    debug!(stream, artifact = %artifact, location, "artifact uploaded");
                    ctx.uploaded.push(Upload {
                        stream: stream.to_string(),
                        artifact,
                        location,
                    });
                }
                Err(e) => {
                    warn!(stream, artifact = %artifact, error = %e, "upload failed");
                    complete = false;
                    ctx.upload_failures.push(UploadFailure {
                        stream: stream.to_string(),
                        artifact,
                        error: e.to_string(),
                    });
                }
            }
        }
        if complete {
            ctx.state.uploaded_streams.insert(stream.to_string());
        }
    }

    fn report(
        &self,
        ctx: &RunCtx,
        run_id: &str,
        status: RunStatus,
        requeued_on_resume: Vec<JobId>,
    ) -> RunReport {
        RunReport {
            run_id: run_id.to_string(),
            status,
            config_error: None,
            degraded_to: None,
            dispatched: ctx.dispatched,
            requeued_on_resume,
            failed: ctx
                .graph
                .iter()
                .filter(|j| j.state == JobState::Failed)
                .map(|j| FailedJob {
                    job_id: j.id.clone(),
                    error: j.last_error.clone(),
                })
                .collect(),
            uploaded: ctx.uploaded.clone(),
            upload_failures: ctx.upload_failures.clone(),
            instances: ctx.pool.snapshot(),
            ledger: ctx.graph.iter().map(LedgerEntry::from_job).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::backend::{LocalArtifactStorage, PassthroughMutator, SimulatedBackend};
    use crate::state_machine::{Category, RetryConfig};

    fn settings(max_retries: u32) -> RunSettings {
        RunSettings {
            retry: RetryConfig {
                max_retries,
                base_delay_ms: 0,
            },
            submit_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_millis(20),
            reprobe_interval: Duration::from_millis(10),
            stall_probe_limit: 5,
            verify_outputs_on_resume: false,
            artifact_root: None,
        }
    }

    fn instance(id: &str, categories: &[Category], max_concurrent: usize) -> InstanceConfig {
        InstanceConfig {
            id: id.into(),
            address: format!("sim://{id}"),
            categories: categories.to_vec(),
            max_concurrent,
            enabled: true,
            fallback: false,
        }
    }

    fn two_instances() -> Vec<InstanceConfig> {
        vec![
            instance("render", &[Category::Primary, Category::Refinement], 1),
            instance("mux", &[Category::Combine], 1),
        ]
    }

    fn orchestrator(
        backend: SimulatedBackend,
        settings: RunSettings,
        instances: Vec<InstanceConfig>,
        dir: &std::path::Path,
    ) -> (Orchestrator<SimulatedBackend>, Arc<SimulatedBackend>) {
        let backend = Arc::new(backend);
        let orch = Orchestrator::new(
            settings,
            instances,
            Arc::clone(&backend),
            Box::new(PassthroughMutator),
            StateStore::new(dir),
        );
        (orch, backend)
    }

    /// Storage that remembers what it was asked to upload.
    #[derive(Clone, Default)]
    struct Recording {
        seen: Arc<Mutex<Vec<String>>>,
        broken: bool,
    }

    impl Recording {
        fn broken() -> Self {
            Self {
                broken: true,
                ..Self::default()
            }
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl ArtifactStorage for Recording {
        fn upload(&self, artifact: &ArtifactRef) -> Result<String, StorageError> {
            if self.broken {
                return Err(StorageError::Missing(artifact.to_string()));
            }
            self.seen.lock().unwrap().push(artifact.to_string());
            Ok(format!("archive/{artifact}"))
        }
    }

    fn position(submissions: &[(JobId, String)], id: &JobId) -> usize {
        submissions
            .iter()
            .position(|(j, _)| j == id)
            .unwrap_or_else(|| panic!("{id} never submitted"))
    }

    #[tokio::test]
    async fn combines_wait_for_every_refinement_and_run_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, backend) = orchestrator(
            SimulatedBackend::new(Duration::from_millis(2)),
            settings(0),
            two_instances(),
            dir.path(),
        );

        let report = orch
            .start("r1", vec![StreamRequest::new("s", 3, 1)], &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.dispatched, 9);
        assert_eq!(report.completed_jobs(), 9);

        let subs = backend.submissions();
        let last_refinement = (1..=3)
            .map(|k| position(&subs, &JobId::new("s", Category::Refinement, k)))
            .max()
            .unwrap();
        let combines: Vec<usize> = (1..=3)
            .map(|k| position(&subs, &JobId::new("s", Category::Combine, k)))
            .collect();
        assert!(combines.iter().all(|&c| c > last_refinement));
        assert!(combines.windows(2).all(|w| w[0] < w[1]));
        for (id, instance) in &subs {
            let expected = if id.as_str().contains("/combine/") { "mux" } else { "render" };
            assert_eq!(instance, expected, "{id}");
        }

        let state = orch.store().load("r1").unwrap();
        assert_eq!(state.status, RunPhase::Completed);
        assert!(state.jobs.iter().all(|j| j.state == JobState::Completed));
    }

    #[tokio::test]
    async fn unreachable_pool_is_fatal_before_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SimulatedBackend::new(Duration::ZERO);
        backend.set_down("render", true);
        backend.set_down("mux", true);
        let (orch, backend) = orchestrator(backend, settings(0), two_instances(), dir.path());

        let report = orch
            .start("r1", vec![StreamRequest::new("s", 2, 1)], &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::FatalConfigError);
        assert_eq!(report.status.exit_code(), 3);
        assert_eq!(report.dispatched, 0);
        assert!(report.config_error.is_some());
        assert!(backend.submissions().is_empty());
        // Resumable once the topology is fixed.
        assert_eq!(orch.store().load("r1").unwrap().status, RunPhase::Aborted);
    }

    #[tokio::test]
    async fn uncovered_category_without_fallback_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, _) = orchestrator(
            SimulatedBackend::new(Duration::ZERO),
            settings(0),
            vec![instance("render", &[Category::Primary, Category::Refinement], 1)],
            dir.path(),
        );
        let report = orch
            .start("r1", vec![StreamRequest::new("s", 1, 1)], &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::FatalConfigError);
        assert_eq!(report.dispatched, 0);
    }

    #[tokio::test]
    async fn degraded_mode_routes_everything_to_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SimulatedBackend::new(Duration::ZERO);
        backend.set_down("render", true);
        let mut instances = two_instances();
        instances[1].fallback = true;
        let (orch, backend) = orchestrator(backend, settings(0), instances, dir.path());

        let report = orch
            .start("r1", vec![StreamRequest::new("s", 2, 1)], &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.degraded_to.as_deref(), Some("mux"));
        assert!(backend.submissions().iter().all(|(_, i)| i == "mux"));
    }

    #[tokio::test]
    async fn exhausted_primary_fails_its_dependents_only() {
        let dir = tempfile::tempdir().unwrap();
        let bad_p1 = JobId::new("bad", Category::Primary, 1);
        let backend = SimulatedBackend::new(Duration::from_millis(1)).fail_job(bad_p1.clone(), 10);
        let (orch, backend) = orchestrator(backend, settings(1), two_instances(), dir.path());

        let report = orch
            .start(
                "r1",
                vec![StreamRequest::new("bad", 3, 1), StreamRequest::new("good", 2, 1)],
                &CancelToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::PartialFailure);
        assert_eq!(report.status.exit_code(), 2);
        let attempts = backend.submissions().iter().filter(|(j, _)| *j == bad_p1).count();
        assert_eq!(attempts, 2, "one try plus one retry");

        let entry = |id: &JobId| report.ledger.iter().find(|e| &e.job_id == id).unwrap().clone();
        assert_eq!(entry(&bad_p1).state, JobState::Failed);
        assert_eq!(entry(&bad_p1).attempts, 2);

        let r1 = entry(&JobId::new("bad", Category::Refinement, 1));
        assert_eq!(r1.state, JobState::Failed);
        assert_eq!(r1.attempts, 0);
        assert_eq!(r1.error, Some(FailureKind::Propagated { upstream: bad_p1.clone() }));
        for k in 1..=3 {
            assert_eq!(entry(&JobId::new("bad", Category::Combine, k)).state, JobState::Failed);
        }
        // Independent chunk of the failed stream still ran.
        assert_eq!(entry(&JobId::new("bad", Category::Refinement, 2)).state, JobState::Completed);
        assert!(
            report
                .ledger
                .iter()
                .filter(|e| e.stream == "good")
                .all(|e| e.state == JobState::Completed)
        );
        assert!(report.failed.iter().any(|f| f.job_id == bad_p1));
    }

    #[tokio::test]
    async fn resume_reruns_interrupted_job_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let requests = vec![StreamRequest::new("s", 2, 1)];
        let mut graph = plan(&requests, RetryConfig::default()).unwrap();
        let p1 = JobId::new("s", Category::Primary, 1);
        let r1 = JobId::new("s", Category::Refinement, 1);
        let p2 = JobId::new("s", Category::Primary, 2);
        {
            let job = graph.get_mut(&p1).unwrap();
            job.state = JobState::Completed;
            job.attempt_count = 1;
            job.output_refs = vec![ArtifactRef::new("sim://render/s/primary/001")];
        }
        graph.get_mut(&r1).unwrap().state = JobState::Running;
        graph.get_mut(&p2).unwrap().state = JobState::Assigned;
        let mut crashed = RunState::new("r1", requests, graph.summaries());
        crashed.status = RunPhase::Running;
        StateStore::new(dir.path()).save(&crashed).unwrap();

        let (orch, backend) = orchestrator(
            SimulatedBackend::new(Duration::from_millis(1)),
            settings(0),
            two_instances(),
            dir.path(),
        );
        let report = orch.resume("r1", &CancelToken::new()).await.unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.requeued_on_resume.len(), 2);
        let subs = backend.submissions();
        assert_eq!(subs.iter().filter(|(j, _)| *j == r1).count(), 1);
        assert_eq!(subs.iter().filter(|(j, _)| *j == p2).count(), 1);
        assert!(!subs.iter().any(|(j, _)| *j == p1), "completed work is reused");
        assert_eq!(report.dispatched, 5);
    }

    #[tokio::test]
    async fn resume_refuses_a_leased_run() {
        let dir = tempfile::tempdir().unwrap();
        let requests = vec![StreamRequest::new("s", 1, 1)];
        let graph = plan(&requests, RetryConfig::default()).unwrap();
        StateStore::new(dir.path())
            .save(&RunState::new("r1", requests, graph.summaries()))
            .unwrap();
        let _held = RunLease::acquire(dir.path(), "r1").unwrap();

        let (orch, _) = orchestrator(
            SimulatedBackend::new(Duration::ZERO),
            settings(0),
            two_instances(),
            dir.path(),
        );
        let err = orch.resume("r1", &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, RunError::Store(StoreError::LeaseHeld { .. })));
    }

    #[tokio::test]
    async fn start_refuses_existing_run() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, _) = orchestrator(
            SimulatedBackend::new(Duration::ZERO),
            settings(0),
            two_instances(),
            dir.path(),
        );
        let requests = vec![StreamRequest::new("s", 1, 1)];
        orch.start("r1", requests.clone(), &CancelToken::new()).await.unwrap();
        let err = orch.start("r1", requests, &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, RunError::Store(StoreError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn resume_after_partial_failure_retries_failed_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let p1 = JobId::new("s", Category::Primary, 1);
        let (orch, _) = orchestrator(
            SimulatedBackend::new(Duration::ZERO).fail_job(p1.clone(), 1),
            settings(0),
            two_instances(),
            dir.path(),
        );
        let first = orch
            .start("r1", vec![StreamRequest::new("s", 1, 1)], &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(first.status, RunStatus::PartialFailure);

        // More retries allowed on the second go; the scripted failure is used up.
        let (orch, backend) = orchestrator(
            SimulatedBackend::new(Duration::ZERO),
            settings(2),
            two_instances(),
            dir.path(),
        );
        let second = orch.resume("r1", &CancelToken::new()).await.unwrap();
        assert_eq!(second.status, RunStatus::Completed);
        assert_eq!(backend.submissions().len(), 3);
    }

    #[tokio::test]
    async fn cancellation_drains_in_flight_and_resumes() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, _) = orchestrator(
            SimulatedBackend::new(Duration::from_millis(50)),
            settings(0),
            two_instances(),
            dir.path(),
        );
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(15)).await;
            trigger.cancel();
        });

        let report = orch
            .start("r1", vec![StreamRequest::new("s", 3, 1)], &cancel)
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Cancelled);
        assert_eq!(report.status.exit_code(), 130);
        // Primary 1 was in flight and got recorded; nothing else started.
        assert_eq!(report.dispatched, 1);
        assert_eq!(report.completed_jobs(), 1);
        let state = orch.store().load("r1").unwrap();
        assert_eq!(state.status, RunPhase::Cancelled);
        assert!(!state.jobs.iter().any(|j| matches!(j.state, JobState::Running | JobState::Assigned)));

        let report = orch.resume("r1", &CancelToken::new()).await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.dispatched, 8);
    }

    #[tokio::test]
    async fn timeout_counts_as_attempt_and_instance_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let p1 = JobId::new("s", Category::Primary, 1);
        let backend = SimulatedBackend::new(Duration::ZERO).slow_job(p1.clone(), Duration::from_secs(10));
        let mut s = settings(0);
        s.submit_timeout = Duration::from_millis(30);
        let (orch, _) = orchestrator(backend, s, two_instances(), dir.path());

        let report = orch
            .start(
                "r1",
                vec![StreamRequest::new("s", 1, 1), StreamRequest::new("t", 1, 1)],
                &CancelToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(report.status, RunStatus::PartialFailure);
        let failed = report.ledger.iter().find(|e| e.job_id == p1).unwrap();
        assert_eq!(failed.error, Some(FailureKind::Timeout { after_ms: 30 }));
        // The render instance was marked unreachable, re-probed and reused.
        assert!(
            report
                .ledger
                .iter()
                .filter(|e| e.stream == "t")
                .all(|e| e.state == JobState::Completed)
        );
    }

    #[tokio::test]
    async fn pool_exhaustion_is_an_error_with_checkpoint_kept() {
        let dir = tempfile::tempdir().unwrap();
        let p1 = JobId::new("s", Category::Primary, 1);
        let backend = SimulatedBackend::new(Duration::ZERO).slow_job(p1, Duration::from_millis(40));
        let (orch, backend) = orchestrator(backend, settings(3), two_instances(), dir.path());

        let cancel = CancelToken::new();
        let run = orch.start("r1", vec![StreamRequest::new("s", 2, 1)], &cancel);
        let outage = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            backend.set_down("render", true);
        };
        let (result, ()) = tokio::join!(run, outage);

        assert!(matches!(result, Err(RunError::PoolExhausted { .. })));
        let state = orch.store().load("r1").unwrap();
        assert_eq!(state.status, RunPhase::Aborted);
    }

    #[tokio::test]
    async fn final_outputs_are_uploaded() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("output");
        std::fs::create_dir_all(&output).unwrap();

        let storage = Recording::default();
        let (orch, _) = orchestrator(
            SimulatedBackend::new(Duration::ZERO),
            settings(0),
            two_instances(),
            &dir.path().join("state"),
        );
        let orch = orch.with_storage(Box::new(storage.clone()));
        let report = orch
            .start(
                "r1",
                vec![StreamRequest::new("a", 2, 1), StreamRequest::new("b", 1, 1)],
                &CancelToken::new(),
            )
            .await
            .unwrap();

        let mut uploaded: Vec<&str> = report.uploaded.iter().map(|u| u.artifact.as_str()).collect();
        uploaded.sort();
        assert_eq!(uploaded, vec!["sim://mux/a/combine/002", "sim://mux/b/combine/001"]);
        assert!(report.upload_failures.is_empty());
        assert_eq!(storage.seen().len(), 2);
        let state = orch.store().load("r1").unwrap();
        assert_eq!(state.uploaded_streams, BTreeSet::from(["a".to_string(), "b".to_string()]));

        // Remote refs cannot be copied locally; the run still completes.
        let dir2 = tempfile::tempdir().unwrap();
        let (orch, _) = orchestrator(
            SimulatedBackend::new(Duration::ZERO),
            settings(0),
            two_instances(),
            dir2.path(),
        );
        let orch = orch.with_storage(Box::new(LocalArtifactStorage::new(Some(output), dir2.path().join("archive"))));
        let report = orch
            .start("r2", vec![StreamRequest::new("a", 1, 1)], &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.upload_failures.len(), 1);
    }

    #[tokio::test]
    async fn random_latencies_never_break_ordering() {
        let mut seed: u64 = 42;
        let mut next = move || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
            (seed >> 33) % 6
        };

        for round in 0..5 {
            let requests = vec![StreamRequest::new("a", 4, 1), StreamRequest::new("b", 3, 1)];
            let graph = plan(&requests, RetryConfig::default()).unwrap();
            let mut backend = SimulatedBackend::new(Duration::ZERO);
            for job in graph.iter() {
                backend = backend.slow_job(job.id.clone(), Duration::from_millis(next()));
            }
            let dir = tempfile::tempdir().unwrap();
            let (orch, backend) = orchestrator(
                backend,
                settings(0),
                vec![
                    instance("x", &[Category::Primary, Category::Refinement], 2),
                    instance("y", &Category::ALL, 2),
                ],
                dir.path(),
            );

            let report = orch.start("r", requests, &CancelToken::new()).await.unwrap();
            assert_eq!(report.status, RunStatus::Completed, "round {round}");
            assert_eq!(report.dispatched, graph.len());

            let subs = backend.submissions();
            for job in graph.iter() {
                let at = position(&subs, &job.id);
                for dep in &job.depends_on {
                    assert!(position(&subs, dep) < at, "{} before {dep}", job.id);
                }
                if job.category == Category::Combine {
                    for other in graph.iter().filter(|j| j.category != Category::Combine) {
                        assert!(position(&subs, &other.id) < at, "{} before {}", job.id, other.id);
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn final_output_finished_before_an_interruption_is_uploaded_on_resume() {
        let dir = tempfile::tempdir().unwrap();
        let requests = vec![StreamRequest::new("a", 1, 1), StreamRequest::new("b", 1, 1)];
        let mut graph = plan(&requests, RetryConfig::default()).unwrap();
        let b_combine = JobId::new("b", Category::Combine, 1);
        let done: Vec<JobId> = graph
            .iter()
            .filter(|j| j.id != b_combine)
            .map(|j| j.id.clone())
            .collect();
        for id in &done {
            let job = graph.get_mut(id).unwrap();
            job.state = JobState::Completed;
            job.attempt_count = 1;
            job.output_refs = vec![ArtifactRef::new(format!("sim://earlier/{id}"))];
        }
        graph.get_mut(&b_combine).unwrap().state = JobState::Running;
        let mut crashed = RunState::new("r1", requests, graph.summaries());
        crashed.status = RunPhase::Running;
        StateStore::new(dir.path()).save(&crashed).unwrap();

        let storage = Recording::default();
        let (orch, backend) = orchestrator(
            SimulatedBackend::new(Duration::ZERO),
            settings(0),
            two_instances(),
            dir.path(),
        );
        let orch = orch.with_storage(Box::new(storage.clone()));
        let report = orch.resume("r1", &CancelToken::new()).await.unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(backend.submissions().len(), 1, "only b's combine runs again");
        assert_eq!(
            storage.seen(),
            vec!["sim://earlier/a/combine/001", "sim://mux/b/combine/001"]
        );
        let state = orch.store().load("r1").unwrap();
        assert_eq!(state.uploaded_streams.len(), 2);

        // Nothing is left to upload, so a further resume sends nothing.
        let again = orch.resume("r1", &CancelToken::new()).await.unwrap();
        assert!(again.uploaded.is_empty());
        assert_eq!(storage.seen().len(), 2);
    }

    #[tokio::test]
    async fn failed_upload_is_retried_on_resume() {
        let dir = tempfile::tempdir().unwrap();
        let (orch, _) = orchestrator(
            SimulatedBackend::new(Duration::ZERO),
            settings(0),
            two_instances(),
            dir.path(),
        );
        let orch = orch.with_storage(Box::new(Recording::broken()));
        let first = orch
            .start("r1", vec![StreamRequest::new("a", 1, 1)], &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(first.status, RunStatus::Completed);
        assert_eq!(first.upload_failures.len(), 1);
        assert!(orch.store().load("r1").unwrap().uploaded_streams.is_empty());

        let storage = Recording::default();
        let (orch, backend) = orchestrator(
            SimulatedBackend::new(Duration::ZERO),
            settings(0),
            two_instances(),
            dir.path(),
        );
        let orch = orch.with_storage(Box::new(storage.clone()));
        let second = orch.resume("r1", &CancelToken::new()).await.unwrap();

        assert!(backend.submissions().is_empty());
        assert_eq!(second.uploaded.len(), 1);
        assert_eq!(storage.seen(), vec!["sim://mux/a/combine/001"]);
        assert!(orch.store().load("r1").unwrap().uploaded_streams.contains("a"));
    }
}
