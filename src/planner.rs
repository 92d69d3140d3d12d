//! Turns render requests into the complete job graph before anything runs.
//!
//! Planning is pure: no I/O, no clocks. The same requests always produce the
//! same job ids, which is what lets a resumed run line its checkpoint up with
//! a fresh plan.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::PlanError;
use crate::state_machine::{Category, Job, JobGraph, JobId, RetryConfig};

/// Units (frames) rendered per chunk when a request does not say otherwise.
pub const DEFAULT_CHUNK_SIZE: u64 = 161;

/// One stream to render: `total_units` split into chunks of `chunk_size`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRequest {
    pub name: String,
    pub total_units: u64,
    pub chunk_size: u64,
}

impl StreamRequest {
    pub fn new(name: impl Into<String>, total_units: u64, chunk_size: u64) -> Self {
        Self {
            name: name.into(),
            total_units,
            chunk_size,
        }
    }

    pub fn chunk_count(&self) -> u64 {
        self.total_units.div_ceil(self.chunk_size)
    }
}

/// Plans every stream into one graph.
///
/// Per stream with chunks `1..=n`:
/// - primary *k* has no prerequisite for *k* ≤ 2 and otherwise consumes the
///   reference frame of refinement *k − 2*;
/// - refinement *k* consumes primary *k*;
/// - combine 1 consumes refinement 1, combine *k* folds refinement *k* into
///   combine *k − 1*.
pub fn plan(requests: &[StreamRequest], retry: RetryConfig) -> Result<JobGraph, PlanError> {
    if requests.is_empty() {
        return Err(PlanError::NoStreams);
    }

    let mut seen = HashSet::new();
    let mut chunks = Vec::with_capacity(requests.len());
    for request in requests {
        chunks.push(validate(request)?);
        if !seen.insert(request.name.as_str()) {
            return Err(PlanError::DuplicateStream(request.name.clone()));
        }
    }

    let mut jobs = Vec::new();
    for (request, chunks) in requests.iter().zip(chunks) {
        plan_stream(request, chunks, retry, &mut jobs);
    }
    JobGraph::new(jobs)
}

/// Checks one request and returns its chunk count.
fn validate(request: &StreamRequest) -> Result<u32, PlanError> {
    if request.name.trim().is_empty() {
        return Err(PlanError::EmptyStreamName);
    }
    if request.chunk_size == 0 {
        return Err(PlanError::InvalidChunkSize {
            stream: request.name.clone(),
            chunk_size: request.chunk_size,
        });
    }
    if request.total_units == 0 {
        return Err(PlanError::ZeroUnits(request.name.clone()));
    }
    u32::try_from(request.chunk_count()).map_err(|_| PlanError::TooManyChunks {
        stream: request.name.clone(),
        chunks: request.chunk_count(),
    })
}

fn plan_stream(request: &StreamRequest, chunks: u32, retry: RetryConfig, jobs: &mut Vec<Job>) {
    let name = request.name.as_str();
    let id = |category, k| JobId::new(name, category, k);

    for k in 1..=chunks {
        let start = u64::from(k - 1) * request.chunk_size;
        let count = request.chunk_size.min(request.total_units - start);

        let primary_deps = if k > 2 {
            vec![id(Category::Refinement, k - 2)]
        } else {
            Vec::new()
        };
        jobs.push(Job::new(name, Category::Primary, k, start, count, primary_deps, retry));
        jobs.push(Job::new(
            name,
            Category::Refinement,
            k,
            start,
            count,
            vec![id(Category::Primary, k)],
            retry,
        ));
    }

    for k in 1..=chunks {
        let start = u64::from(k - 1) * request.chunk_size;
        let count = request.chunk_size.min(request.total_units - start);
        let mut deps = Vec::with_capacity(2);
        if k > 1 {
            deps.push(id(Category::Combine, k - 1));
        }
        deps.push(id(Category::Refinement, k));
        jobs.push(Job::new(name, Category::Combine, k, start, count, deps, retry));
    }
}
