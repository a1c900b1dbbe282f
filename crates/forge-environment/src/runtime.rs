// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for the forge orchestration engine.
//!
//! [`ForgeRuntime`] wires the Run Materializer, Job Scheduler, Log Streaming
//! Hub, webhook dispatcher and backend executor together and runs their
//! background loops inside an existing tokio application.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use forge_environment::backend::ContainerBackend;
//! use forge_environment::runtime::ForgeRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = forge_core::persistence::connect("sqlite:forge.db").await?;
//!
//!     let runtime = ForgeRuntime::builder()
//!         .persistence(persistence)
//!         .backend(Arc::new(ContainerBackend::from_env()))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // runtime.materializer().materialize(&workflow, &trigger).await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use forge_core::events::RunEventSink;
use forge_core::models::{Conclusion, Status};
use forge_core::persistence::Persistence;
use forge_core::scheduler::{
    InMemoryJobQueue, InMemoryWorkerRegistry, JobExecutor, JobQueue, Worker, WorkerRegistry,
};
use forge_core::workflow::YamlWorkflowParser;
use forge_core::{
    JobScheduler, LogHub, LogHubSweeper, LogHubSweeperConfig, RunMaterializer, SchedulerConfig,
};
use forge_webhooks::{
    DeliveryRetryWorker, DeliveryRetryWorkerConfig, DispatcherConfig, WebhookDispatcher,
};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::Backend;
use crate::executor::{BackendExecutor, ExecutorConfig};
use crate::secrets::{InMemorySecretResolver, SecretResolver};

/// Error recorded on jobs that were running when the previous process died.
const ORPHANED_JOB_ERROR: &str = "orchestrator restarted while the job was running";

/// Active runs scanned during startup recovery.
const RECOVERY_RUN_LIMIT: i64 = 1000;

/// Builder for creating a [`ForgeRuntime`].
pub struct ForgeRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    backend: Option<Arc<dyn Backend>>,
    secrets: Option<Arc<dyn SecretResolver>>,
    queue: Option<Arc<dyn JobQueue>>,
    workers: Vec<Worker>,
    scheduler_config: SchedulerConfig,
    executor_config: ExecutorConfig,
    log_buffer: usize,
    sweeper_config: LogHubSweeperConfig,
    dispatcher_config: DispatcherConfig,
    retry_config: DeliveryRetryWorkerConfig,
    shutdown_timeout: Duration,
}

impl Default for ForgeRuntimeBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            backend: None,
            secrets: None,
            queue: None,
            workers: vec![Worker::new("local", ["linux"])],
            scheduler_config: SchedulerConfig::default(),
            executor_config: ExecutorConfig::default(),
            log_buffer: 256,
            sweeper_config: LogHubSweeperConfig::default(),
            dispatcher_config: DispatcherConfig::default(),
            retry_config: DeliveryRetryWorkerConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ForgeRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the orchestration backend (required).
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set the secret resolver.
    ///
    /// Default: an empty [`InMemorySecretResolver`]
    pub fn secrets(mut self, secrets: Arc<dyn SecretResolver>) -> Self {
        self.secrets = Some(secrets);
        self
    }

    /// Set the job queue.
    ///
    /// Default: [`InMemoryJobQueue`]
    pub fn queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Set the execution workers registered at start.
    ///
    /// Default: one worker `local` labelled `linux`
    pub fn workers(mut self, workers: Vec<Worker>) -> Self {
        self.workers = workers;
        self
    }

    /// Set the scheduler configuration.
    pub fn scheduler_config(mut self, config: SchedulerConfig) -> Self {
        self.scheduler_config = config;
        self
    }

    /// Set the executor configuration.
    pub fn executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor_config = config;
        self
    }

    /// Set the per-subscriber live log buffer.
    ///
    /// Default: 256
    pub fn log_buffer(mut self, buffer: usize) -> Self {
        self.log_buffer = buffer;
        self
    }

    /// Set the log hub sweeper configuration.
    pub fn sweeper_config(mut self, config: LogHubSweeperConfig) -> Self {
        self.sweeper_config = config;
        self
    }

    /// Set the webhook dispatcher configuration.
    pub fn dispatcher_config(mut self, config: DispatcherConfig) -> Self {
        self.dispatcher_config = config;
        self
    }

    /// Set the delivery retry worker configuration.
    pub fn retry_config(mut self, config: DeliveryRetryWorkerConfig) -> Self {
        self.retry_config = config;
        self
    }

    /// Set how long shutdown waits for in-flight jobs and deliveries.
    ///
    /// Default: 30 seconds
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<ForgeRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let backend = self
            .backend
            .ok_or_else(|| anyhow::anyhow!("backend is required"))?;

        Ok(ForgeRuntimeConfig {
            persistence,
            backend,
            secrets: self
                .secrets
                .unwrap_or_else(|| Arc::new(InMemorySecretResolver::new())),
            queue: self
                .queue
                .unwrap_or_else(|| Arc::new(InMemoryJobQueue::new())),
            workers: self.workers,
            scheduler_config: self.scheduler_config,
            executor_config: self.executor_config,
            log_buffer: self.log_buffer,
            sweeper_config: self.sweeper_config,
            dispatcher_config: self.dispatcher_config,
            retry_config: self.retry_config,
            shutdown_timeout: self.shutdown_timeout,
        })
    }
}

/// Configuration for a [`ForgeRuntime`].
pub struct ForgeRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    backend: Arc<dyn Backend>,
    secrets: Arc<dyn SecretResolver>,
    queue: Arc<dyn JobQueue>,
    workers: Vec<Worker>,
    scheduler_config: SchedulerConfig,
    executor_config: ExecutorConfig,
    log_buffer: usize,
    sweeper_config: LogHubSweeperConfig,
    dispatcher_config: DispatcherConfig,
    retry_config: DeliveryRetryWorkerConfig,
    shutdown_timeout: Duration,
}

impl ForgeRuntimeConfig {
    /// Start the runtime, recovering orphaned jobs and spawning the
    /// scheduler, log sweeper and delivery retry loops.
    pub async fn start(self) -> Result<ForgeRuntime> {
        if let Err(e) = recover_orphaned_jobs(self.persistence.as_ref(), self.backend.as_ref()).await
        {
            warn!(error = %e, "Failed to recover orphaned jobs");
        }

        let hub = Arc::new(LogHub::new(self.persistence.clone(), self.log_buffer));
        let dispatcher = WebhookDispatcher::new(self.persistence.clone(), self.dispatcher_config)?;
        let events: Arc<dyn RunEventSink> = Arc::new(dispatcher.clone());

        let executor = Arc::new(BackendExecutor::new(
            self.persistence.clone(),
            self.backend.clone(),
            self.secrets,
            hub.clone(),
            self.executor_config,
        ));

        let workers: Arc<dyn WorkerRegistry> =
            Arc::new(InMemoryWorkerRegistry::with_workers(self.workers));
        let scheduler = Arc::new(JobScheduler::new(
            self.persistence.clone(),
            self.queue,
            workers,
            executor.clone() as Arc<dyn JobExecutor>,
            events.clone(),
            self.scheduler_config,
        ));

        let materializer = Arc::new(RunMaterializer::new(
            self.persistence.clone(),
            Arc::new(YamlWorkflowParser),
            scheduler.clone(),
            events,
        ));

        // Scheduler loop
        let scheduler_shutdown = scheduler.shutdown_handle();
        let scheduler_handle = tokio::spawn(scheduler.clone().run());

        // Log hub sweeper
        let sweeper = LogHubSweeper::new(hub.clone(), self.sweeper_config);
        let sweeper_shutdown = sweeper.shutdown_handle();
        let sweeper_handle = tokio::spawn(async move {
            sweeper.run().await;
        });

        // Delivery retry worker
        let retry_worker = DeliveryRetryWorker::new(dispatcher.clone(), self.retry_config);
        let retry_shutdown = retry_worker.shutdown_handle();
        let retry_handle = tokio::spawn(retry_worker.run());

        info!(
            backend = self.backend.backend_type(),
            "ForgeRuntime started"
        );

        Ok(ForgeRuntime {
            scheduler_handle,
            sweeper_handle,
            retry_handle,
            scheduler_shutdown,
            sweeper_shutdown,
            retry_shutdown,
            persistence: self.persistence,
            scheduler,
            materializer,
            hub,
            dispatcher,
            executor,
            shutdown_timeout: self.shutdown_timeout,
        })
    }
}

/// A running forge engine that can be embedded in an application.
///
/// The runtime manages:
/// - Job scheduler loop (promotion, dispatch, run completion)
/// - Log hub sweeper for idle live streams
/// - Delivery retry worker for failed webhook deliveries
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct ForgeRuntime {
    scheduler_handle: JoinHandle<()>,
    sweeper_handle: JoinHandle<()>,
    retry_handle: JoinHandle<()>,
    scheduler_shutdown: Arc<Notify>,
    sweeper_shutdown: Arc<Notify>,
    retry_shutdown: Arc<Notify>,
    persistence: Arc<dyn Persistence>,
    scheduler: Arc<JobScheduler>,
    materializer: Arc<RunMaterializer>,
    hub: Arc<LogHub>,
    dispatcher: WebhookDispatcher,
    executor: Arc<BackendExecutor>,
    shutdown_timeout: Duration,
}

impl ForgeRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> ForgeRuntimeBuilder {
        ForgeRuntimeBuilder::new()
    }

    /// Shared persistence layer.
    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        &self.persistence
    }

    /// Job scheduler.
    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    /// Run materializer.
    pub fn materializer(&self) -> &Arc<RunMaterializer> {
        &self.materializer
    }

    /// Log streaming hub.
    pub fn log_hub(&self) -> &Arc<LogHub> {
        &self.hub
    }

    /// Webhook dispatcher.
    pub fn webhooks(&self) -> &WebhookDispatcher {
        &self.dispatcher
    }

    /// Backend executor.
    pub fn executor(&self) -> &Arc<BackendExecutor> {
        &self.executor
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the background loops, then waits up to the shutdown timeout for
    /// in-flight jobs and webhook deliveries.
    pub async fn shutdown(self) -> Result<()> {
        info!("ForgeRuntime shutting down...");

        self.scheduler_shutdown.notify_one();
        self.sweeper_shutdown.notify_one();
        self.retry_shutdown.notify_one();

        if let Err(e) = self.scheduler_handle.await {
            error!("Job scheduler task panicked: {}", e);
        }
        if let Err(e) = self.sweeper_handle.await {
            error!("Log hub sweeper task panicked: {}", e);
        }
        if let Err(e) = self.retry_handle.await {
            error!("Delivery retry worker task panicked: {}", e);
        }

        let jobs_drained = self
            .scheduler
            .tasks()
            .shutdown(self.shutdown_timeout)
            .await;
        let deliveries_drained = self.dispatcher.shutdown(self.shutdown_timeout).await;

        if jobs_drained && deliveries_drained {
            info!("ForgeRuntime shutdown complete");
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "shutdown timed out (jobs drained: {}, deliveries drained: {})",
                jobs_drained,
                deliveries_drained
            ))
        }
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.scheduler_handle.is_finished()
            && !self.sweeper_handle.is_finished()
            && !self.retry_handle.is_finished()
    }
}

/// Recover jobs left behind by a previous process.
///
/// - `in_progress` jobs have no executor watching them any more: their units
///   are torn down and the jobs fail
/// - `queued` jobs that were enqueued into a volatile queue are un-marked so
///   the scheduler enqueues them again
async fn recover_orphaned_jobs(persistence: &dyn Persistence, backend: &dyn Backend) -> Result<()> {
    let runs = persistence.list_active_runs(RECOVERY_RUN_LIMIT).await?;
    if runs.is_empty() {
        debug!("No active runs to recover");
        return Ok(());
    }

    let mut failed = 0;
    let mut requeued = 0;
    for run in &runs {
        for job in persistence.list_jobs(&run.id).await? {
            match job.status {
                Status::InProgress => {
                    if let Err(e) = backend.teardown(&job.id).await {
                        warn!(job_id = %job.id, error = %e, "Failed to tear down orphaned unit");
                    }
                    if persistence
                        .complete_job(&job.id, Conclusion::Failure, None, Some(ORPHANED_JOB_ERROR))
                        .await?
                    {
                        persistence
                            .finish_pending_steps(&job.id, Conclusion::Failure)
                            .await?;
                        failed += 1;
                    }
                }
                Status::Queued if job.enqueued_at.is_some() => {
                    persistence.clear_job_enqueued(&job.id).await?;
                    requeued += 1;
                }
                _ => {}
            }
        }
    }

    if failed > 0 || requeued > 0 {
        info!(failed, requeued, "Recovered orphaned jobs");
    }
    Ok(())
}
