// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for forge-core.
//!
//! Every state transition is a narrow, row-scoped update guarded by the
//! current status in its `WHERE` clause. Retrying a transition that already
//! happened is a no-op reported as `false`, never an error.

mod postgres;
mod rows;
mod sqlite;

pub use self::postgres::PostgresPersistence;
pub use self::sqlite::SqlitePersistence;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::models::{
    Conclusion, DeliveryAttempt, Job, LogEntry, NewDelivery, NewJob, NewRun, NewWebhook, Step,
    Webhook, WebhookDelivery, WebhookEvent, WebhookUpdate, WorkflowRun,
};

/// Outcome of [`Persistence::cancel_run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunCancellation {
    /// `false` when the run was already terminal and nothing changed.
    pub cancelled: bool,
    /// Jobs that were `in_progress` at the moment of cancellation; their
    /// execution units still need to be torn down.
    pub in_flight_jobs: Vec<String>,
}

/// Durable storage for runs, jobs, steps, logs, webhooks and deliveries.
#[async_trait]
pub trait Persistence: Send + Sync {
    // ------------------------------------------------------------------------
    // Runs
    // ------------------------------------------------------------------------

    /// Create a run with its whole job/step tree in one transaction.
    ///
    /// The run number is `max(existing) + 1` for the repository. A concurrent
    /// insert with the same number fails with [`CoreError::RunNumberConflict`]
    /// and leaves nothing behind.
    async fn create_run(&self, run: &NewRun, jobs: &[NewJob]) -> Result<WorkflowRun>;

    /// Get a run by id.
    async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>>;

    /// Most recent runs of a repository, newest first.
    async fn list_runs(&self, repository_id: &str, limit: i64) -> Result<Vec<WorkflowRun>>;

    /// Runs that are `queued` or `in_progress`, oldest first.
    async fn list_active_runs(&self, limit: i64) -> Result<Vec<WorkflowRun>>;

    /// `queued -> in_progress`.
    async fn mark_run_in_progress(&self, run_id: &str) -> Result<bool>;

    /// Non-terminal -> `completed` with `conclusion`.
    async fn complete_run(&self, run_id: &str, conclusion: Conclusion) -> Result<bool>;

    /// Cancel a run and every non-terminal job and step in one transaction.
    async fn cancel_run(&self, run_id: &str) -> Result<RunCancellation>;

    // ------------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------------

    /// Get a job by id.
    async fn get_job(&self, job_id: &str) -> Result<Option<Job>>;

    /// All jobs of a run in declaration order.
    async fn list_jobs(&self, run_id: &str) -> Result<Vec<Job>>;

    /// Record that a queued job was handed to the job queue. Returns `false`
    /// when it already was, so each job is enqueued at most once.
    async fn mark_job_enqueued(&self, job_id: &str) -> Result<bool>;

    /// Undo [`Persistence::mark_job_enqueued`] after the queue rejected the job.
    async fn clear_job_enqueued(&self, job_id: &str) -> Result<()>;

    /// `queued -> in_progress` on `worker_id`.
    async fn start_job(&self, job_id: &str, worker_id: &str) -> Result<bool>;

    /// `in_progress -> completed`.
    async fn complete_job(
        &self,
        job_id: &str,
        conclusion: Conclusion,
        output: Option<&Value>,
        error: Option<&str>,
    ) -> Result<bool>;

    /// `queued -> completed/skipped`, skipping all of the job's steps too.
    async fn skip_job(&self, job_id: &str, reason: &str) -> Result<bool>;

    // ------------------------------------------------------------------------
    // Steps
    // ------------------------------------------------------------------------

    /// Steps of a job in ordinal order.
    async fn list_steps(&self, job_id: &str) -> Result<Vec<Step>>;

    /// `queued -> in_progress` for step `number`.
    async fn start_step(&self, job_id: &str, number: i64) -> Result<bool>;

    /// `in_progress -> completed` for step `number`.
    async fn complete_step(
        &self,
        job_id: &str,
        number: i64,
        conclusion: Conclusion,
        output: Option<&str>,
    ) -> Result<bool>;

    /// Close out a finished job's leftovers: running steps get
    /// `running_conclusion`, queued steps are skipped. Returns rows touched.
    async fn finish_pending_steps(&self, job_id: &str, running_conclusion: Conclusion)
    -> Result<u64>;

    // ------------------------------------------------------------------------
    // Logs
    // ------------------------------------------------------------------------

    /// Persist one log line.
    async fn append_log(&self, entry: &LogEntry) -> Result<()>;

    /// All lines of a job in publication order.
    async fn get_job_logs(&self, job_id: &str) -> Result<Vec<LogEntry>>;

    /// Lines attributed to step `number` of a job.
    async fn get_step_logs(&self, job_id: &str, number: i64) -> Result<Vec<LogEntry>>;

    // ------------------------------------------------------------------------
    // Webhooks
    // ------------------------------------------------------------------------

    /// Store a new webhook.
    async fn create_webhook(&self, webhook: &NewWebhook) -> Result<Webhook>;

    /// Apply a partial update. Returns `None` when the webhook does not exist.
    async fn update_webhook(&self, webhook_id: &str, update: &WebhookUpdate)
    -> Result<Option<Webhook>>;

    /// Delete a webhook and its deliveries.
    async fn delete_webhook(&self, webhook_id: &str) -> Result<bool>;

    /// Get a webhook by id.
    async fn get_webhook(&self, webhook_id: &str) -> Result<Option<Webhook>>;

    /// All webhooks of a repository.
    async fn list_webhooks(&self, repository_id: &str) -> Result<Vec<Webhook>>;

    /// Active webhooks of a repository subscribed to `event` (or `*`).
    async fn list_active_webhooks_for_event(
        &self,
        repository_id: &str,
        event: &str,
    ) -> Result<Vec<Webhook>> {
        Ok(self
            .list_webhooks(repository_id)
            .await?
            .into_iter()
            .filter(|w| w.active && w.subscribes_to(event))
            .collect())
    }

    /// Durably record a triggered event.
    async fn record_webhook_event(
        &self,
        repository_id: &str,
        event_type: &str,
        action: Option<&str>,
        payload: &Value,
    ) -> Result<WebhookEvent>;

    /// Create a pending delivery.
    async fn create_delivery(&self, delivery: &NewDelivery) -> Result<WebhookDelivery>;

    /// Get a delivery by id.
    async fn get_delivery(&self, delivery_id: &str) -> Result<Option<WebhookDelivery>>;

    /// Delivery history of a webhook, newest first.
    async fn list_deliveries(&self, webhook_id: &str, limit: i64) -> Result<Vec<WebhookDelivery>>;

    /// Write attempt `attempt.attempt` onto the delivery. Only applies when the
    /// delivery is non-terminal and has exactly `attempt - 1` recorded attempts.
    async fn record_delivery_attempt(&self, delivery_id: &str, attempt: &DeliveryAttempt)
    -> Result<bool>;

    /// Non-terminal deliveries whose retry time has elapsed, oldest first.
    async fn list_due_deliveries(
        &self,
        now: DateTime<Utc>,
        max_attempts: i64,
        limit: i64,
    ) -> Result<Vec<WebhookDelivery>>;

    /// Claim a delivery that was due at `now` by moving its retry time to
    /// `until`. Fails when another sweeper got there first.
    async fn lease_delivery(
        &self,
        delivery_id: &str,
        expected_attempts: i64,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<bool>;

    /// Check database connectivity.
    async fn health_check_db(&self) -> Result<bool>;
}

/// Connect to `database_url` and run migrations.
///
/// URLs starting with `sqlite:` select SQLite, everything else PostgreSQL.
pub async fn connect(database_url: &str) -> Result<Arc<dyn Persistence>> {
    if database_url.starts_with("sqlite:") {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: e.to_string(),
            })?;
        crate::migrations::run_sqlite(&pool).await?;
        Ok(Arc::new(SqlitePersistence::new(pool)))
    } else {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: e.to_string(),
            })?;
        crate::migrations::run_postgres(&pool).await?;
        Ok(Arc::new(PostgresPersistence::new(pool)))
    }
}
