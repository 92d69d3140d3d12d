use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use tracing::debug;

use super::{JobDescription, RenderBackend};
use crate::error::BackendError;
use crate::pool::InstanceTarget;
use crate::state_machine::{ArtifactRef, JobId};

/// In-process stand-in for a render server, used by `demo` and tests.
///
/// Every submission sleeps for the configured latency and returns one
/// `sim://` artifact. Failures and outages can be scripted per job or per
/// instance.
#[derive(Debug, Default)]
pub struct SimulatedBackend {
    latency: Duration,
    slow: HashMap<JobId, Duration>,
    failures: Mutex<HashMap<JobId, u32>>,
    down: Mutex<HashSet<String>>,
    submissions: Mutex<Vec<(JobId, String)>>,
}

impl SimulatedBackend {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    /// The next `times` submissions of `job` fail with an execution error.
    pub fn fail_job(self, job: JobId, times: u32) -> Self {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(job, times);
        }
        self
    }

    /// `job` takes `latency` instead of the default.
    pub fn slow_job(mut self, job: JobId, latency: Duration) -> Self {
        self.slow.insert(job, latency);
        self
    }

    /// Takes an instance offline or brings it back.
    #[cfg(test)]
    pub fn set_down(&self, instance: &str, down: bool) {
        if let Ok(mut set) = self.down.lock() {
            if down {
                set.insert(instance.to_string());
            } else {
                set.remove(instance);
            }
        }
    }

    fn is_down(&self, instance: &str) -> bool {
        self.down.lock().map(|set| set.contains(instance)).unwrap_or(false)
    }

    /// Every submission so far, as (job, instance), in start order.
    pub fn submissions(&self) -> Vec<(JobId, String)> {
        self.submissions.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn take_failure(&self, job: &JobId) -> bool {
        let Ok(mut failures) = self.failures.lock() else {
            return false;
        };
        match failures.get_mut(job) {
            Some(left) if *left > 0 => {
                *left -= 1;
                true
            }
            _ => false,
        }
    }
}

impl RenderBackend for SimulatedBackend {
    async fn probe(&self, target: &InstanceTarget) -> Result<(), BackendError> {
        if self.is_down(&target.id) {
            Err(BackendError::Unreachable(format!("{} is down", target.id)))
        } else {
            Ok(())
        }
    }

    async fn submit(
        &self,
        target: &InstanceTarget,
        description: JobDescription,
    ) -> Result<Vec<ArtifactRef>, BackendError> {
        if self.is_down(&target.id) {
            return Err(BackendError::Unreachable(format!("{} is down", target.id)));
        }
        if let Ok(mut submissions) = self.submissions.lock() {
            submissions.push((description.job_id.clone(), target.id.clone()));
        }

        let latency = self.slow.get(&description.job_id).copied().unwrap_or(self.latency);
        tokio::time::sleep(latency).await;

        if self.take_failure(&description.job_id) {
            debug!(job_id = %description.job_id, "simulated failure");
            return Err(BackendError::Execution(format!(
                "simulated failure of {}",
                description.job_id
            )));
        }
        Ok(vec![ArtifactRef::new(format!(
            "sim://{}/{}",
            target.id, description.job_id
        ))])
    }
}
