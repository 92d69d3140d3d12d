//! Per-category ready queues and the dispatch policy.
//!
//! Policy: the lowest sequence number wins across all categories. Equal
//! sequence numbers are broken round-robin by category, starting after the
//! category dispatched last, then by stream name. A category is only
//! considered while the pool has a free slot for it, so one saturated
//! category never blocks another with idle instances. Combine jobs are only
//! offered once every primary and refinement job of the run is terminal and
//! those of their own stream are Completed.

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::TransitionError;
use crate::pool::{InstancePool, InstanceTarget};
use crate::state_machine::{Category, Job, JobEvent, JobGraph, JobId, JobState, StateMachine};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    sequence: u32,
    stream: String,
    id: JobId,
}

impl QueueKey {
    fn of(job: &Job) -> Self {
        Self {
            sequence: job.sequence_number,
            stream: job.stream.clone(),
            id: job.id.clone(),
        }
    }
}

/// A job handed to an instance. The job is already marked Assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub job_id: JobId,
    pub category: Category,
    pub instance: InstanceTarget,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CategoryCounts {
    pub pending: usize,
    pub in_flight: usize,
    pub completed: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
pub struct QueueManager {
    queues: BTreeMap<Category, BTreeSet<QueueKey>>,
    last_category: Option<Category>,
}

impl QueueManager {
    /// Queues every Pending job of `graph`.
    pub fn from_graph(graph: &JobGraph) -> Self {
        let mut manager = Self::default();
        for job in graph.iter().filter(|j| j.state == JobState::Pending) {
            manager.enqueue(job);
        }
        manager
    }

    /// Puts a job (back) on its category queue, e.g. after a retry.
    pub fn enqueue(&mut self, job: &Job) {
        self.queues
            .entry(job.category)
            .or_default()
            .insert(QueueKey::of(job));
    }

    fn remove(&mut self, job: &Job) {
        if let Some(queue) = self.queues.get_mut(&job.category) {
            queue.remove(&QueueKey::of(job));
        }
    }

    pub fn pending(&self) -> usize {
        self.queues.values().map(BTreeSet::len).sum()
    }

    /// Categories in round-robin order, starting after the last dispatch.
    fn rotation(&self) -> [Category; 3] {
        let first = self.last_category.map_or(Category::Primary, Category::next);
        [first, first.next(), first.next().next()]
    }

    fn is_runnable(graph: &JobGraph, job: &Job, now: Instant) -> bool {
        job.is_ready_at(now)
            && graph.dependencies_completed(job)
            && (!job.category.rule().barrier || graph.barrier_holds(&job.stream))
    }

    /// Picks the next job, takes an instance slot for it and marks it
    /// Assigned, as one step.
    pub fn next_ready(
        &mut self,
        graph: &mut JobGraph,
        pool: &mut InstancePool,
        now: Instant,
    ) -> Result<Option<Dispatch>, TransitionError> {
        let mut best: Option<(u32, Category, QueueKey)> = None;
        for category in self.rotation() {
            if !pool.has_capacity_for(category) {
                continue;
            }
            let Some(queue) = self.queues.get(&category) else {
                continue;
            };
            let candidate = queue.iter().find(|key| {
                graph
                    .get(&key.id)
                    .is_some_and(|job| Self::is_runnable(graph, job, now))
            });
            if let Some(key) = candidate
                && best.as_ref().is_none_or(|(seq, _, _)| key.sequence < *seq)
            {
                best = Some((key.sequence, category, key.clone()));
            }
        }

        let Some((_, category, key)) = best else {
            return Ok(None);
        };
        let Some(instance) = pool.acquire(category) else {
            return Ok(None);
        };

        if let Some(queue) = self.queues.get_mut(&category) {
            queue.remove(&key);
        }
        let Some(job) = graph.get_mut(&key.id) else {
            pool.release(&instance.id);
            return Ok(None);
        };
        if let Err(e) = StateMachine::apply(job, JobEvent::Assign { instance: instance.id.clone() }, now) {
            pool.release(&instance.id);
            return Err(e);
        }
        self.last_category = Some(category);
        debug!(job_id = %key.id, instance = %instance.id, "job assigned");

        Ok(Some(Dispatch {
            job_id: key.id,
            category,
            instance,
        }))
    }

    /// Fails everything downstream of a permanently failed job without
    /// consuming attempts. A failed primary or refinement job also fails
    /// every combine job of its stream, since their barrier can never hold.
    /// Other streams only wait for the failed stream's remaining primary and
    /// refinement jobs to settle.
    /// Returns the ids marked Failed.
    pub fn propagate_failure(&mut self, graph: &mut JobGraph, failed: &JobId, now: Instant) -> Vec<JobId> {
        let mut marked = Vec::new();
        let Some(origin) = graph.get(failed) else {
            return marked;
        };

        let mut frontier: VecDeque<(JobId, JobId)> = graph
            .dependents(failed)
            .iter()
            .map(|d| (d.clone(), failed.clone()))
            .collect();
        if !origin.category.rule().barrier {
            let stream = origin.stream.clone();
            let gated: Vec<JobId> = graph
                .stream_jobs(&stream)
                .filter(|j| j.category.rule().barrier)
                .map(|j| j.id.clone())
                .collect();
            frontier.extend(gated.into_iter().map(|id| (id, failed.clone())));
        }

        while let Some((id, upstream)) = frontier.pop_front() {
            let Some(job) = graph.get_mut(&id) else {
                continue;
            };
            if job.state != JobState::Pending {
                if !job.state.is_terminal() {
                    warn!(job_id = %id, state = %job.state, "dependent of failed job is in flight");
                }
                continue;
            }
            self.remove(job);
            if StateMachine::apply(job, JobEvent::Propagate { upstream }, now).is_ok() {
                marked.push(id.clone());
                frontier.extend(graph.dependents(&id).iter().map(|d| (d.clone(), id.clone())));
            }
        }
        marked
    }

    /// The earliest future retry gate among queued jobs.
    pub fn earliest_retry(&self, graph: &JobGraph, now: Instant) -> Option<Instant> {
        self.queues
            .values()
            .flatten()
            .filter_map(|key| graph.get(&key.id)?.not_before)
            .filter(|&t| t > now)
            .min()
    }

    /// Categories that still have queued jobs.
    pub fn waiting_categories(&self) -> Vec<Category> {
        self.queues
            .iter()
            .filter(|(_, q)| !q.is_empty())
            .map(|(&c, _)| c)
            .collect()
    }

    pub fn counts(graph: &JobGraph) -> BTreeMap<Category, CategoryCounts> {
        let mut counts: BTreeMap<Category, CategoryCounts> = BTreeMap::new();
        for job in graph.iter() {
            let entry = counts.entry(job.category).or_default();
            match job.state {
                JobState::Pending => entry.pending += 1,
                JobState::Assigned | JobState::Running => entry.in_flight += 1,
                JobState::Completed => entry.completed += 1,
                JobState::Failed => entry.failed += 1,
            }
        }
        counts
    }
}
