// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job scheduler.
//!
//! Promotes ready jobs into the job queue, pairs queued jobs with available
//! workers and drives each dispatched job through the executor. Dependency
//! outcomes propagate from here: a job whose dependency did not succeed is
//! skipped, and a run completes once all of its jobs are terminal.
//!
//! Each wake of the loop performs at most one worker assignment. A
//! successful assignment re-arms the wake so a backlog drains without
//! waiting for the poll interval.

mod collaborators;
mod memory;
mod readiness;

pub use collaborators::{
    CollaboratorError, DispatchedJob, JobExecutor, JobOutcome, JobQueue, QueuedJob, Worker,
    WorkerRegistry, WorkerStatus,
};
pub use memory::{
    CompletedJob, DEFAULT_COMPLETION_HISTORY, InMemoryJobQueue, InMemoryWorkerRegistry,
};
pub use readiness::{JobGraph, Readiness};

use std::env;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::{CoreError, Result};
use crate::events::{RunEvent, RunEventSink};
use crate::models::{Conclusion, Job, Status, WorkflowRun};
use crate::persistence::{Persistence, RunCancellation};
use crate::tasks::{BackgroundTasks, panic_message};

/// Configuration for the job scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between dispatch ticks when nothing wakes the loop.
    pub poll_interval: Duration,
    /// Maximum number of active runs scanned per tick.
    pub active_run_limit: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            active_run_limit: 100,
        }
    }
}

impl SchedulerConfig {
    /// Read `FORGE_DISPATCH_INTERVAL_MS` and `FORGE_ACTIVE_RUN_LIMIT`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            poll_interval: env::var("FORGE_DISPATCH_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            active_run_limit: env::var("FORGE_ACTIVE_RUN_LIMIT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.active_run_limit),
        }
    }
}

/// Result of one promotion pass over a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Promotion {
    /// Jobs handed to the job queue.
    pub enqueued: usize,
    /// Jobs skipped because a dependency did not succeed.
    pub skipped: usize,
}

/// Result of a single dispatch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// No available worker matched a queued job.
    Idle,
    /// A job was assigned and its execution started.
    Dispatched {
        /// The job.
        job_id: String,
        /// The worker it went to.
        worker_id: String,
    },
    /// The popped job was no longer runnable and was dropped.
    Discarded {
        /// The job.
        job_id: String,
    },
    /// The worker refused the assignment; the job went back to the queue.
    Requeued {
        /// The job.
        job_id: String,
    },
}

/// Job scheduler.
pub struct JobScheduler {
    persistence: Arc<dyn Persistence>,
    queue: Arc<dyn JobQueue>,
    workers: Arc<dyn WorkerRegistry>,
    executor: Arc<dyn JobExecutor>,
    events: Arc<dyn RunEventSink>,
    tasks: BackgroundTasks,
    config: SchedulerConfig,
    shutdown: Arc<Notify>,
    wake: Arc<Notify>,
}

impl JobScheduler {
    /// Create a scheduler over the given collaborators.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        queue: Arc<dyn JobQueue>,
        workers: Arc<dyn WorkerRegistry>,
        executor: Arc<dyn JobExecutor>,
        events: Arc<dyn RunEventSink>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            persistence,
            queue,
            workers,
            executor,
            events,
            tasks: BackgroundTasks::new("job-executions"),
            config,
            shutdown: Arc::new(Notify::new()),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Handle that stops [`run`](Self::run).
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Tracker of in-flight job executions.
    pub fn tasks(&self) -> &BackgroundTasks {
        &self.tasks
    }

    /// Request an immediate tick.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Run the dispatch loop until shutdown.
    pub async fn run(self: Arc<Self>) {
        info!(
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Job scheduler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Job scheduler shutting down");
                    break;
                }
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }

            match self.tick().await {
                Ok(DispatchOutcome::Idle) => {}
                Ok(outcome) => {
                    debug!(outcome = ?outcome, "Dispatch tick");
                    self.wake();
                }
                Err(e) => warn!(error = %e, "Dispatch tick failed"),
            }
        }

        info!("Job scheduler stopped");
    }

    /// Initial scheduling for a freshly materialized run.
    pub async fn schedule_run(&self, run_id: &str) -> Result<Promotion> {
        let promotion = self.promote_ready_jobs(run_id).await?;
        self.wake();
        Ok(promotion)
    }

    /// Promote every ready job of active runs, then perform at most one
    /// worker assignment.
    pub async fn tick(self: &Arc<Self>) -> Result<DispatchOutcome> {
        let runs = self
            .persistence
            .list_active_runs(self.config.active_run_limit)
            .await?;

        for run in &runs {
            if let Err(e) = self.promote_ready_jobs(&run.id).await {
                warn!(run_id = %run.id, error = %e, "Failed to promote jobs");
            }
        }

        self.dispatch_one().await
    }

    /// Enqueue ready jobs of `run_id` and skip jobs whose dependencies did
    /// not succeed. Skips cascade to their dependents within the same call.
    /// Completes the run when every job is terminal.
    pub async fn promote_ready_jobs(&self, run_id: &str) -> Result<Promotion> {
        let mut promotion = Promotion::default();
        let mut jobs;

        loop {
            jobs = self.persistence.list_jobs(run_id).await?;
            let graph = JobGraph::new(&jobs);
            let mut skipped_now = 0;

            for job in &jobs {
                match graph.readiness(job) {
                    Readiness::Ready if job.enqueued_at.is_none() => {
                        if self.enqueue(job).await? {
                            promotion.enqueued += 1;
                        }
                    }
                    Readiness::Blocked {
                        dependency,
                        conclusion,
                    } => {
                        let reason = match conclusion {
                            Some(c) => format!("dependency '{}' concluded {}", dependency, c),
                            None => format!("dependency '{}' does not exist", dependency),
                        };
                        if self.persistence.skip_job(&job.id, &reason).await? {
                            debug!(job_id = %job.id, reason = %reason, "Skipped job");
                            skipped_now += 1;
                            self.emit_job_event(run_id, &job.id, "completed").await;
                        }
                    }
                    _ => {}
                }
            }

            if skipped_now == 0 {
                break;
            }
            promotion.skipped += skipped_now;
        }

        if JobGraph::new(&jobs).all_terminal() {
            self.check_run_completion(run_id).await?;
        }

        Ok(promotion)
    }

    /// Mark `job` enqueued and hand it to the queue. Returns `false` when
    /// another pass enqueued it first.
    async fn enqueue(&self, job: &Job) -> Result<bool> {
        if !self.persistence.mark_job_enqueued(&job.id).await? {
            return Ok(false);
        }

        let mut entry = QueuedJob::from_job(job);
        entry.enqueued_at = chrono::Utc::now();

        match self.queue.enqueue(entry).await {
            Ok(()) => {
                debug!(job_id = %job.id, run_id = %job.run_id, "Enqueued job");
                Ok(true)
            }
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Job queue rejected job, will retry");
                self.persistence.clear_job_enqueued(&job.id).await?;
                Ok(false)
            }
        }
    }

    /// Try each available worker in turn and assign the first matching job.
    pub async fn dispatch_one(self: &Arc<Self>) -> Result<DispatchOutcome> {
        let workers = self
            .workers
            .list(Some(WorkerStatus::Online))
            .await
            .map_err(|e| e.into_core("worker registry"))?;

        for worker in workers {
            let queued = self
                .queue
                .dequeue(&worker.labels)
                .await
                .map_err(|e| e.into_core("job queue"))?;

            if let Some(queued) = queued {
                return self.claim(queued, worker).await;
            }
        }

        Ok(DispatchOutcome::Idle)
    }

    async fn claim(self: &Arc<Self>, queued: QueuedJob, worker: Worker) -> Result<DispatchOutcome> {
        let job_id = queued.job_id.clone();
        let discarded = DispatchOutcome::Discarded {
            job_id: job_id.clone(),
        };

        let Some(job) = self.persistence.get_job(&job_id).await? else {
            warn!(job_id = %job_id, "Queued job no longer exists");
            return Ok(discarded);
        };
        if job.status != Status::Queued {
            debug!(job_id = %job_id, status = %job.status, "Queued job is no longer runnable");
            return Ok(discarded);
        }
        let run = self
            .persistence
            .get_run(&job.run_id)
            .await?
            .ok_or_else(|| CoreError::RunNotFound {
                run_id: job.run_id.clone(),
            })?;
        if run.status.is_terminal() {
            return Ok(discarded);
        }

        let siblings = self.persistence.list_jobs(&run.id).await?;
        if JobGraph::new(&siblings).readiness(&job) != Readiness::Ready {
            // Re-evaluated on the next promotion pass.
            self.persistence.clear_job_enqueued(&job_id).await?;
            return Ok(discarded);
        }

        if let Err(e) = self.workers.assign(&job_id, &worker.id).await {
            warn!(job_id = %job_id, worker_id = %worker.id, error = %e, "Worker refused assignment");
            if let Err(e) = self.queue.enqueue(queued).await {
                warn!(job_id = %job_id, error = %e, "Failed to requeue job");
                self.persistence.clear_job_enqueued(&job_id).await?;
            }
            return Ok(DispatchOutcome::Requeued { job_id });
        }

        let started = match self.persistence.start_job(&job_id, &worker.id).await {
            Ok(started) => started,
            Err(e) => {
                self.release_worker(&worker.id, &job_id).await;
                if let Err(e) = self.queue.enqueue(queued).await {
                    warn!(job_id = %job_id, error = %e, "Failed to requeue job");
                    if let Err(e) = self.persistence.clear_job_enqueued(&job_id).await {
                        warn!(job_id = %job_id, error = %e, "Failed to clear enqueued mark");
                    }
                }
                return Err(e);
            }
        };
        if !started {
            // Cancelled between the checks above and the transition.
            self.release_worker(&worker.id, &job_id).await;
            return Ok(discarded);
        }

        let run_id = run.id.clone();
        let worker_id = worker.id.clone();
        let dispatched = match self.load_dispatched(run, &job_id, worker).await {
            Ok(dispatched) => dispatched,
            Err(e) => {
                // The job is in progress on a busy worker with no task to
                // finish it, so both are settled here.
                error!(
                    job_id = %job_id,
                    run_id = %run_id,
                    error = %e,
                    "Failed to prepare dispatched job"
                );
                self.release_worker(&worker_id, &job_id).await;
                let outcome = JobOutcome::failure(format!("failed to dispatch job: {}", e));
                if let Err(e) = self.finish_job(&run_id, &job_id, outcome).await {
                    error!(job_id = %job_id, run_id = %run_id, error = %e, "Failed to finish job");
                }
                return Err(e);
            }
        };

        info!(
            job_id = %job_id,
            run_id = %run_id,
            worker_id = %worker_id,
            steps = dispatched.steps.len(),
            "Dispatched job"
        );

        let scheduler = self.clone();
        self.tasks
            .spawn("execute-job", async move { scheduler.execute(dispatched).await });

        Ok(DispatchOutcome::Dispatched { job_id, worker_id })
    }

    /// Announce a started job and load what its executor needs.
    async fn load_dispatched(
        &self,
        run: WorkflowRun,
        job_id: &str,
        worker: Worker,
    ) -> Result<DispatchedJob> {
        if self.persistence.mark_run_in_progress(&run.id).await?
            && let Some(run) = self.persistence.get_run(&run.id).await?
        {
            self.events
                .emit(RunEvent::workflow_run(&run, "in_progress"))
                .await;
        }

        let job = self
            .persistence
            .get_job(job_id)
            .await?
            .ok_or_else(|| CoreError::JobNotFound {
                job_id: job_id.to_string(),
            })?;
        self.events
            .emit(RunEvent::workflow_job(&run.repository_id, &job, "in_progress"))
            .await;

        let steps = self.persistence.list_steps(job_id).await?;
        Ok(DispatchedJob {
            run,
            job,
            steps,
            worker,
        })
    }

    async fn execute(&self, dispatched: DispatchedJob) {
        let job_id = dispatched.job.id.clone();
        let run_id = dispatched.run.id.clone();
        let worker_id = dispatched.worker.id.clone();

        let outcome = match AssertUnwindSafe(self.executor.execute(dispatched))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(job_id = %job_id, panic = %message, "Job executor panicked");
                JobOutcome::failure(format!("executor panicked: {}", message))
            }
        };

        self.release_worker(&worker_id, &job_id).await;

        if let Err(e) = self.finish_job(&run_id, &job_id, outcome).await {
            error!(job_id = %job_id, run_id = %run_id, error = %e, "Failed to finish job");
        }
        self.wake();
    }

    async fn release_worker(&self, worker_id: &str, job_id: &str) {
        match self.workers.release(worker_id).await {
            Ok(()) => debug!(worker_id = %worker_id, job_id = %job_id, "Released worker"),
            Err(e) => error!(
                worker_id = %worker_id,
                job_id = %job_id,
                error = %e,
                "Failed to release worker"
            ),
        }
    }

    /// Record `outcome` unless the executor already did, report to the
    /// queue and advance the run.
    async fn finish_job(&self, run_id: &str, job_id: &str, outcome: JobOutcome) -> Result<()> {
        let recorded = self
            .persistence
            .complete_job(
                job_id,
                outcome.conclusion,
                outcome.output.as_ref(),
                outcome.error.as_deref(),
            )
            .await?;
        if recorded {
            debug!(job_id = %job_id, conclusion = %outcome.conclusion, "Recorded job outcome");
        }

        let leftover = if outcome.conclusion == Conclusion::Success {
            Conclusion::Success
        } else {
            Conclusion::Failure
        };
        let closed = self
            .persistence
            .finish_pending_steps(job_id, leftover)
            .await?;
        if closed > 0 {
            debug!(job_id = %job_id, steps = closed, "Closed unfinished steps");
        }

        let job = self
            .persistence
            .get_job(job_id)
            .await?
            .ok_or_else(|| CoreError::JobNotFound {
                job_id: job_id.to_string(),
            })?;

        if let Err(e) = self
            .queue
            .complete(job_id, job.succeeded(), job.output.as_ref())
            .await
        {
            warn!(job_id = %job_id, error = %e, "Failed to report job completion to queue");
        }

        info!(
            job_id = %job_id,
            run_id = %run_id,
            status = %job.status,
            conclusion = ?job.conclusion,
            "Job finished"
        );
        self.emit_job_event(run_id, job_id, "completed").await;

        self.promote_ready_jobs(run_id).await?;
        Ok(())
    }

    /// Complete `run_id` if all of its jobs are terminal. Returns the
    /// conclusion when this call completed the run.
    pub async fn check_run_completion(&self, run_id: &str) -> Result<Option<Conclusion>> {
        let jobs = self.persistence.list_jobs(run_id).await?;
        let Some(conclusion) = JobGraph::new(&jobs).run_conclusion() else {
            return Ok(None);
        };

        if !self.persistence.complete_run(run_id, conclusion).await? {
            return Ok(None);
        }

        info!(run_id = %run_id, conclusion = %conclusion, "Workflow run completed");
        if let Some(run) = self.persistence.get_run(run_id).await? {
            self.events
                .emit(RunEvent::workflow_run(&run, "completed"))
                .await;
        }
        Ok(Some(conclusion))
    }

    /// Cancel a run and tear down its in-flight jobs.
    pub async fn cancel_run(&self, run_id: &str) -> Result<RunCancellation> {
        let cancellation = self.persistence.cancel_run(run_id).await?;
        if !cancellation.cancelled {
            debug!(run_id = %run_id, "Run already terminal, nothing to cancel");
            return Ok(cancellation);
        }

        for job_id in &cancellation.in_flight_jobs {
            self.executor.cancel(job_id).await;
        }

        for job in self.persistence.list_jobs(run_id).await? {
            if job.enqueued_at.is_some() && job.started_at.is_none() {
                match self.queue.remove(&job.id).await {
                    Ok(true) => debug!(job_id = %job.id, "Removed cancelled job from queue"),
                    Ok(false) => {}
                    Err(e) => warn!(job_id = %job.id, error = %e, "Failed to remove job from queue"),
                }
            }
        }

        info!(
            run_id = %run_id,
            in_flight = cancellation.in_flight_jobs.len(),
            "Workflow run cancelled"
        );
        if let Some(run) = self.persistence.get_run(run_id).await? {
            self.events
                .emit(RunEvent::workflow_run(&run, "cancelled"))
                .await;
        }
        self.wake();
        Ok(cancellation)
    }

    async fn emit_job_event(&self, run_id: &str, job_id: &str, action: &str) {
        let loaded = async {
            let run = self.persistence.get_run(run_id).await?;
            let job = self.persistence.get_job(job_id).await?;
            Ok::<_, CoreError>(run.zip(job))
        };
        match loaded.await {
            Ok(Some((run, job))) => {
                self.events
                    .emit(RunEvent::workflow_job(&run.repository_id, &job, action))
                    .await
            }
            Ok(None) => {}
            Err(e) => warn!(job_id = %job_id, error = %e, "Failed to load job for event"),
        }
    }
}
