use std::collections::{HashMap, HashSet};

use tokio::time::Instant;

use super::job::{ArtifactRef, Category, Job, JobId, JobState, JobSummary};
use super::state::{JobEvent, StateMachine};
use crate::error::{PlanError, StoreError};

/// The full set of jobs of a run and the edges between them.
///
/// Jobs keep their plan order; lookups go through an id index.
#[derive(Debug, Clone)]
pub struct JobGraph {
    jobs: Vec<Job>,
    index: HashMap<JobId, usize>,
    dependents: HashMap<JobId, Vec<JobId>>,
}

impl JobGraph {
    /// Builds the graph, rejecting duplicate ids and dangling dependencies.
    pub fn new(jobs: Vec<Job>) -> Result<Self, PlanError> {
        let mut index = HashMap::with_capacity(jobs.len());
        for (i, job) in jobs.iter().enumerate() {
            if index.insert(job.id.clone(), i).is_some() {
                return Err(PlanError::DuplicateJob(job.id.clone()));
            }
        }

        let mut dependents: HashMap<JobId, Vec<JobId>> = HashMap::new();
        for job in &jobs {
            for dep in &job.depends_on {
                if !index.contains_key(dep) {
                    return Err(PlanError::UnknownDependency {
                        job: job.id.clone(),
                        dependency: dep.clone(),
                    });
                }
                dependents.entry(dep.clone()).or_default().push(job.id.clone());
            }
        }

        Ok(Self {
            jobs,
            index,
            dependents,
        })
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn get(&self, id: &JobId) -> Option<&Job> {
        self.index.get(id).map(|&i| &self.jobs[i])
    }

    pub fn get_mut(&mut self, id: &JobId) -> Option<&mut Job> {
        self.index.get(id).map(|&i| &mut self.jobs[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter()
    }

    /// Direct dependents of `id`.
    pub fn dependents(&self, id: &JobId) -> &[JobId] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn stream_jobs<'a>(&'a self, stream: &'a str) -> impl Iterator<Item = &'a Job> + 'a {
        self.jobs.iter().filter(move |job| job.stream == stream)
    }

    /// Stream names in plan order.
    pub fn streams(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.jobs
            .iter()
            .filter(|job| seen.insert(job.stream.as_str()))
            .map(|job| job.stream.as_str())
            .collect()
    }

    pub fn is_finished(&self) -> bool {
        self.jobs.iter().all(|job| job.state.is_terminal())
    }

    pub fn unfinished(&self) -> usize {
        self.jobs.iter().filter(|job| !job.state.is_terminal()).count()
    }

    pub fn dependencies_completed(&self, job: &Job) -> bool {
        job.depends_on
            .iter()
            .all(|dep| self.get(dep).is_some_and(|d| d.state == JobState::Completed))
    }

    /// Whether gated jobs of `stream` may run. The barrier spans the whole
    /// run: every primary and refinement job must be terminal, and those of
    /// `stream` itself must be Completed. A stream with a failed upstream job
    /// has its gated jobs failed by propagation, so it never holds the others
    /// back.
    pub fn barrier_holds(&self, stream: &str) -> bool {
        self.jobs
            .iter()
            .filter(|job| !job.category.rule().barrier)
            .all(|job| {
                if job.stream == stream {
                    job.state == JobState::Completed
                } else {
                    job.state.is_terminal()
                }
            })
    }

    /// Outputs of the dependencies of `id`, in dependency order.
    pub fn resolve_inputs(&self, id: &JobId) -> Vec<ArtifactRef> {
        let Some(job) = self.get(id) else {
            return Vec::new();
        };
        job.depends_on
            .iter()
            .filter_map(|dep| self.get(dep))
            .flat_map(|dep| dep.output_refs.iter().cloned())
            .collect()
    }

    /// The last combine job of `stream`, whose output is the finished artifact.
    pub fn final_combine(&self, stream: &str) -> Option<&Job> {
        self.jobs
            .iter()
            .filter(|job| job.stream == stream && job.category == Category::Combine)
            .max_by_key(|job| job.sequence_number)
    }

    pub fn summaries(&self) -> Vec<JobSummary> {
        self.jobs.iter().map(Job::summary).collect()
    }

    /// Overlays checkpointed job states onto a freshly planned graph.
    ///
    /// Jobs recorded Running or Assigned have an unknown outcome and go back
    /// to Pending. Completed jobs keep their outputs. Returns the ids that
    /// were reset.
    pub fn apply_summaries(&mut self, summaries: &[JobSummary]) -> Result<Vec<JobId>, StoreError> {
        if summaries.len() != self.jobs.len() {
            return Err(StoreError::PlanMismatch(format!(
                "checkpoint has {} jobs, plan has {}",
                summaries.len(),
                self.jobs.len()
            )));
        }

        let now = Instant::now();
        let mut reset = Vec::new();
        for summary in summaries {
            let job = self.get_mut(&summary.id).ok_or_else(|| {
                StoreError::PlanMismatch(format!("job {} is not in the plan", summary.id))
            })?;
            if job.category != summary.category || job.sequence_number != summary.sequence_number {
                return Err(StoreError::PlanMismatch(format!(
                    "job {} changed category or sequence number",
                    summary.id
                )));
            }

            job.state = summary.state;
            job.attempt_count = summary.attempt_count;
            job.last_error = summary.last_error.clone();
            job.output_refs = summary.output_refs.clone();

            if matches!(summary.state, JobState::Running | JobState::Assigned) {
                StateMachine::apply(job, JobEvent::Requeue, now).map_err(|e| StoreError::PlanMismatch(e.to_string()))?;
                reset.push(job.id.clone());
            }
        }
        Ok(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::RetryConfig;

    fn job(seq: u32, category: Category, deps: Vec<JobId>) -> Job {
        Job::new("s", category, seq, 0, 1, deps, RetryConfig::default())
    }

    #[test]
    fn rejects_dangling_dependency() {
        let missing = JobId::new("s", Category::Primary, 9);
        let err = JobGraph::new(vec![job(1, Category::Refinement, vec![missing.clone()])]).unwrap_err();
        assert!(matches!(err, PlanError::UnknownDependency { dependency, .. } if dependency == missing));
    }

    #[test]
    fn rejects_duplicate_ids() {
        let err = JobGraph::new(vec![job(1, Category::Primary, vec![]), job(1, Category::Primary, vec![])]).unwrap_err();
        assert!(matches!(err, PlanError::DuplicateJob(_)));
    }

    #[test]
    fn dependents_and_inputs() {
        let p = job(1, Category::Primary, vec![]);
        let r = job(1, Category::Refinement, vec![p.id.clone()]);
        let (pid, rid) = (p.id.clone(), r.id.clone());
        let mut graph = JobGraph::new(vec![p, r]).unwrap();

        assert_eq!(graph.dependents(&pid), &[rid.clone()]);
        assert!(graph.dependents(&rid).is_empty());
        assert!(!graph.dependencies_completed(graph.get(&rid).unwrap()));

        let p = graph.get_mut(&pid).unwrap();
        p.state = JobState::Completed;
        p.output_refs = vec![ArtifactRef::new("p1.latent")];
        assert!(graph.dependencies_completed(graph.get(&rid).unwrap()));
        assert_eq!(graph.resolve_inputs(&rid), vec![ArtifactRef::new("p1.latent")]);
    }

    #[test]
    fn final_combine_and_run_wide_barrier() {
        let s_p = job(1, Category::Primary, vec![]);
        let s_c1 = job(1, Category::Combine, vec![s_p.id.clone()]);
        let s_c2 = job(2, Category::Combine, vec![s_c1.id.clone()]);
        let t_p = Job::new("t", Category::Primary, 1, 0, 1, vec![], RetryConfig::default());
        let (sp, last, tp) = (s_p.id.clone(), s_c2.id.clone(), t_p.id.clone());
        let mut graph = JobGraph::new(vec![s_p, s_c1, s_c2, t_p]).unwrap();

        assert_eq!(graph.final_combine("s").map(|j| &j.id), Some(&last));
        assert!(graph.final_combine("t").is_none());

        assert!(!graph.barrier_holds("s"));
        graph.get_mut(&sp).unwrap().state = JobState::Completed;
        assert!(!graph.barrier_holds("s"), "t's primary is still pending");
        graph.get_mut(&tp).unwrap().state = JobState::Failed;
        assert!(graph.barrier_holds("s"));
        assert!(!graph.barrier_holds("t"));
    }

    #[test]
    fn apply_summaries_resets_running_jobs() {
        let p = job(1, Category::Primary, vec![]);
        let r = job(1, Category::Refinement, vec![p.id.clone()]);
        let mut graph = JobGraph::new(vec![p, r]).unwrap();
        let mut summaries = graph.summaries();
        summaries[0].state = JobState::Completed;
        summaries[0].attempt_count = 1;
        summaries[0].output_refs = vec![ArtifactRef::new("p1.latent")];
        summaries[1].state = JobState::Running;
        summaries[1].attempt_count = 1;

        let reset = graph.apply_summaries(&summaries).unwrap();
        assert_eq!(reset, vec![summaries[1].id.clone()]);
        let r = graph.get(&summaries[1].id).unwrap();
        assert_eq!(r.state, JobState::Pending);
        assert_eq!(r.attempt_count, 1);
        let p = graph.get(&summaries[0].id).unwrap();
        assert_eq!(p.state, JobState::Completed);
        assert_eq!(p.output_refs, vec![ArtifactRef::new("p1.latent")]);
    }

    #[test]
    fn apply_summaries_rejects_foreign_checkpoint() {
        let mut graph = JobGraph::new(vec![job(1, Category::Primary, vec![])]).unwrap();
        let mut summaries = graph.summaries();
        summaries[0].id = JobId::new("other", Category::Primary, 1);
        assert!(matches!(
            graph.apply_summaries(&summaries),
            Err(StoreError::PlanMismatch(_))
        ));
    }
}
