// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Contracts the scheduler consumes: job queue, worker registry and executor.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::CoreError;
use crate::models::{Conclusion, Job, Step, WorkflowRun};

/// Errors reported by the job queue or the worker registry.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum CollaboratorError {
    /// The collaborator could not be reached.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// The worker exists but cannot take a job right now.
    #[error("worker '{0}' is not available")]
    WorkerUnavailable(String),

    /// The worker is not registered.
    #[error("unknown worker '{0}'")]
    UnknownWorker(String),
}

impl CollaboratorError {
    /// Wrap into a [`CoreError`] naming the collaborator.
    pub fn into_core(self, collaborator: &'static str) -> CoreError {
        CoreError::Collaborator {
            collaborator,
            details: self.to_string(),
        }
    }
}

/// A job waiting in the job queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedJob {
    /// Job identifier.
    pub job_id: String,
    /// Owning run.
    pub run_id: String,
    /// Labels a worker must carry.
    pub labels: Vec<String>,
    /// Higher runs first.
    pub priority: i64,
    /// Ties on priority are broken by age.
    pub enqueued_at: DateTime<Utc>,
}

impl QueuedJob {
    /// Queue entry for `job`.
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            run_id: job.run_id.clone(),
            labels: job.runs_on.clone(),
            priority: job.priority,
            enqueued_at: job.enqueued_at.unwrap_or_else(Utc::now),
        }
    }

    /// Whether a worker with `worker_labels` satisfies this job.
    pub fn matches(&self, worker_labels: &[String]) -> bool {
        self.labels.iter().all(|l| worker_labels.contains(l))
    }
}

/// Ordered, label-matching job queue.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a ready job.
    async fn enqueue(&self, job: QueuedJob) -> Result<(), CollaboratorError>;

    /// Pop the highest-priority job whose labels are a subset of `labels`.
    async fn dequeue(&self, labels: &[String]) -> Result<Option<QueuedJob>, CollaboratorError>;

    /// Report the final result of a dequeued job.
    async fn complete(
        &self,
        job_id: &str,
        success: bool,
        output: Option<&Value>,
    ) -> Result<(), CollaboratorError>;

    /// Drop a job that will never run. Returns whether it was still queued.
    async fn remove(&self, job_id: &str) -> Result<bool, CollaboratorError>;
}

/// Availability of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerStatus {
    /// Idle and accepting work.
    Online,
    /// Running a job.
    Busy,
    /// Not connected.
    Offline,
}

/// An execution agent as seen by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct Worker {
    /// Worker identifier.
    pub id: String,
    /// Capability labels.
    pub labels: Vec<String>,
    /// Current availability.
    pub status: WorkerStatus,
}

impl Worker {
    /// An online worker.
    pub fn new<I, S>(id: impl Into<String>, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            labels: labels.into_iter().map(Into::into).collect(),
            status: WorkerStatus::Online,
        }
    }
}

/// Registry of execution agents.
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    /// Workers with `status`, or all of them.
    async fn list(&self, status: Option<WorkerStatus>) -> Result<Vec<Worker>, CollaboratorError>;

    /// Mark `worker_id` busy with `job_id`. Fails if the worker is not online.
    async fn assign(&self, job_id: &str, worker_id: &str) -> Result<(), CollaboratorError>;

    /// Return `worker_id` to the available pool.
    async fn release(&self, worker_id: &str) -> Result<(), CollaboratorError>;
}

/// Everything an executor needs to run one job.
#[derive(Debug, Clone)]
pub struct DispatchedJob {
    /// The owning run.
    pub run: WorkflowRun,
    /// The job, already `in_progress`.
    pub job: Job,
    /// Steps in ordinal order.
    pub steps: Vec<Step>,
    /// The worker it was assigned to.
    pub worker: Worker,
}

/// What an executor reports when a job ends.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    /// Final conclusion.
    pub conclusion: Conclusion,
    /// Structured summary.
    pub output: Option<Value>,
    /// Error message for failures.
    pub error: Option<String>,
}

impl JobOutcome {
    /// Successful outcome.
    pub fn success(output: Option<Value>) -> Self {
        Self {
            conclusion: Conclusion::Success,
            output,
            error: None,
        }
    }

    /// Failed outcome.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            conclusion: Conclusion::Failure,
            output: None,
            error: Some(error.into()),
        }
    }

    /// Cancelled outcome.
    pub fn cancelled() -> Self {
        Self {
            conclusion: Conclusion::Cancelled,
            output: None,
            error: None,
        }
    }

    /// Attach an output summary.
    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }
}

/// Runs a dispatched job to completion.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Execute `job` and report its outcome. Step transitions and the job's
    /// final status may be recorded by the executor itself; the scheduler
    /// records the outcome only when the executor did not.
    async fn execute(&self, job: DispatchedJob) -> JobOutcome;

    /// Stop a running job and tear down its execution resources. Must be
    /// idempotent and must not fail when nothing is running.
    async fn cancel(&self, job_id: &str);
}
