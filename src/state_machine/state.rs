use std::time::Duration;

use tokio::time::Instant;

use super::job::{FailureKind, Job, JobId, JobOutcome, JobState};
use crate::error::TransitionError;

/// Something that happened to a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    /// The queue handed the job to an instance.
    Assign { instance: String },
    /// The submission to the backend began.
    Start,
    /// The submission ended.
    Finish(JobOutcome),
    /// A prerequisite failed permanently.
    Propagate { upstream: JobId },
    /// Outcome unknown (crash or resume); run it again.
    Requeue,
    /// Bring a Failed job back when its attempts allow it.
    Revive,
}

impl JobEvent {
    fn name(&self) -> &'static str {
        match self {
            JobEvent::Assign { .. } => "assign",
            JobEvent::Start => "start",
            JobEvent::Finish(JobOutcome::Success(_)) => "succeed",
            JobEvent::Finish(JobOutcome::Failure(_)) => "fail",
            JobEvent::Propagate { .. } => "propagate",
            JobEvent::Requeue => "requeue",
            JobEvent::Revive => "revive",
        }
    }
}

/// The result of applying an event.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Moved to a non-terminal state.
    Next(JobState),
    /// The attempt failed and the job is back to Pending after a delay.
    Retry { reason: FailureKind, delay_ms: u64 },
    /// The job reached a terminal state.
    Complete(JobOutcome),
}

/// Drives a `Job` through its lifecycle:
/// Pending → Assigned → Running → Completed | Failed, with Failed → Pending
/// only while attempts remain.
pub struct StateMachine;

impl StateMachine {
    /// Apply `event` to `job`, returning the transition taken.
    ///
    /// Illegal events leave the job untouched and return an error. Completed
    /// jobs accept no event at all, so their outputs never change.
    pub fn apply(job: &mut Job, event: JobEvent, now: Instant) -> Result<Transition, TransitionError> {
        let from = job.state;
        let job_id = job.id.clone();
        let illegal = |event: &JobEvent| TransitionError {
            job_id: job_id.clone(),
            from,
            event: event.name(),
        };

        let transition = match (&event, from) {
            (JobEvent::Assign { instance }, JobState::Pending) => {
                job.assigned_instance = Some(instance.clone());
                job.not_before = None;
                Self::move_to(job, JobState::Assigned);
                Transition::Next(JobState::Assigned)
            }
            (JobEvent::Start, JobState::Assigned) => {
                Self::move_to(job, JobState::Running);
                Transition::Next(JobState::Running)
            }
            (JobEvent::Finish(JobOutcome::Success(outputs)), JobState::Running) => {
                job.output_refs = outputs.clone();
                job.last_error = None;
                Self::move_to(job, JobState::Completed);
                Transition::Complete(JobOutcome::Success(outputs.clone()))
            }
            // A failure while Assigned means description building failed.
            (JobEvent::Finish(JobOutcome::Failure(kind)), JobState::Assigned | JobState::Running)
                if kind.consumes_attempt() =>
            {
                Self::handle_failure(job, kind.clone(), now)
            }
            (JobEvent::Propagate { upstream }, JobState::Pending) => {
                let kind = FailureKind::Propagated {
                    upstream: upstream.clone(),
                };
                job.last_error = Some(kind.clone());
                Self::move_to(job, JobState::Failed);
                Transition::Complete(JobOutcome::Failure(kind))
            }
            (JobEvent::Requeue, JobState::Assigned | JobState::Running) => {
                job.assigned_instance = None;
                Self::move_to(job, JobState::Pending);
                Transition::Next(JobState::Pending)
            }
            (JobEvent::Revive, JobState::Failed) => {
                let revivable = match &job.last_error {
                    Some(FailureKind::Propagated { .. }) => true,
                    _ => job.retry_config.attempts_remain(job.attempt_count),
                };
                if !revivable {
                    return Err(illegal(&event));
                }
                job.last_error = None;
                job.assigned_instance = None;
                Self::move_to(job, JobState::Pending);
                Transition::Next(JobState::Pending)
            }
            _ => return Err(illegal(&event)),
        };

        Ok(transition)
    }

    fn handle_failure(job: &mut Job, kind: FailureKind, now: Instant) -> Transition {
        job.attempt_count += 1;
        job.last_error = Some(kind.clone());
        if job.retry_config.attempts_remain(job.attempt_count) {
            let delay_ms = job.retry_config.delay_for_attempt(job.attempt_count);
            job.not_before = Some(now + Duration::from_millis(delay_ms));
            job.assigned_instance = None;
            // Failed → Pending: the history records both steps.
            job.state_history.push(job.state);
            job.state = JobState::Failed;
            Self::move_to(job, JobState::Pending);
            Transition::Retry {
                reason: kind,
                delay_ms,
            }
        } else {
            Self::move_to(job, JobState::Failed);
            Transition::Complete(JobOutcome::Failure(kind))
        }
    }

    fn move_to(job: &mut Job, next: JobState) {
        job.state_history.push(job.state);
        job.state = next;
    }
}
