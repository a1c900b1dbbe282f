// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::models::{
    Conclusion, DeliveryAttempt, Job, LogEntry, NewDelivery, NewJob, NewRun, NewWebhook, Step,
    Webhook, WebhookDelivery, WebhookEvent, WebhookUpdate, WorkflowRun,
};

use super::rows::{
    DELIVERY_COLUMNS, DeliveryRow, JOB_COLUMNS, JobRow, LogRow, RUN_COLUMNS, RunRow, STEP_COLUMNS,
    StepRow, WEBHOOK_COLUMNS, WebhookRow, convert, is_unique_violation, to_json,
};
use super::{Persistence, RunCancellation};

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open (creating if needed) a database file and run migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {:?}: {}", path, e),
            })?;

        crate::migrations::run_sqlite(&pool).await?;

        Ok(Self { pool })
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn create_run(&self, run: &NewRun, jobs: &[NewJob]) -> Result<WorkflowRun> {
        let now = Utc::now();
        let run_id = Uuid::new_v4().to_string();
        let mut tx = self.pool.begin().await?;

        let run_number: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(run_number), 0) + 1 FROM workflow_runs WHERE repository_id = ?",
        )
        .bind(&run.repository_id)
        .fetch_one(&mut *tx)
        .await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO workflow_runs (id, workflow_id, repository_id, organization_id, run_number,
                                       name, event, head_sha, head_branch, actor, status,
                                       created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'queued', ?, ?)
            "#,
        )
        .bind(&run_id)
        .bind(&run.workflow_id)
        .bind(&run.repository_id)
        .bind(&run.organization_id)
        .bind(run_number)
        .bind(&run.name)
        .bind(&run.event)
        .bind(&run.head_sha)
        .bind(&run.head_branch)
        .bind(&run.actor)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted {
            return Err(if is_unique_violation(&e) {
                CoreError::RunNumberConflict {
                    repository_id: run.repository_id.clone(),
                }
            } else {
                e.into()
            });
        }

        for (position, job) in jobs.iter().enumerate() {
            let job_id = Uuid::new_v4().to_string();
            let strategy = job.strategy.as_ref().map(|s| to_json(s)).transpose()?;

            sqlx::query(
                r#"
                INSERT INTO jobs (id, run_id, name, display_name, position, needs, runs_on, env,
                                  strategy, environment, image, timeout_minutes, priority, status,
                                  created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'queued', ?)
                "#,
            )
            .bind(&job_id)
            .bind(&run_id)
            .bind(&job.name)
            .bind(&job.display_name)
            .bind(position as i64)
            .bind(to_json(&job.needs)?)
            .bind(to_json(&job.runs_on)?)
            .bind(to_json(&job.env)?)
            .bind(strategy)
            .bind(&job.environment)
            .bind(&job.image)
            .bind(job.timeout_minutes)
            .bind(job.priority)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            for (index, step) in job.steps.iter().enumerate() {
                sqlx::query(
                    r#"
                    INSERT INTO steps (id, job_id, number, name, uses, run, params, env, status)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'queued')
                    "#,
                )
                .bind(Uuid::new_v4().to_string())
                .bind(&job_id)
                .bind(index as i64 + 1)
                .bind(&step.name)
                .bind(&step.uses)
                .bind(&step.run)
                .bind(to_json(&step.params)?)
                .bind(to_json(&step.env)?)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;

        self.get_run(&run_id)
            .await?
            .ok_or(CoreError::RunNotFound { run_id })
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>> {
        let row = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {} FROM workflow_runs WHERE id = ?",
            RUN_COLUMNS
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WorkflowRun::try_from).transpose()
    }

    async fn list_runs(&self, repository_id: &str, limit: i64) -> Result<Vec<WorkflowRun>> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {} FROM workflow_runs WHERE repository_id = ? ORDER BY run_number DESC LIMIT ?",
            RUN_COLUMNS
        ))
        .bind(repository_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        convert(rows)
    }

    async fn list_active_runs(&self, limit: i64) -> Result<Vec<WorkflowRun>> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            r#"
            SELECT {} FROM workflow_runs
            WHERE status IN ('queued', 'in_progress')
            ORDER BY created_at ASC
            LIMIT ?
            "#,
            RUN_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        convert(rows)
    }

    async fn mark_run_in_progress(&self, run_id: &str) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'in_progress', started_at = ?, updated_at = ?
            WHERE id = ? AND status = 'queued'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn complete_run(&self, run_id: &str, conclusion: Conclusion) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'completed', conclusion = ?, completed_at = ?, updated_at = ?
            WHERE id = ? AND status IN ('queued', 'in_progress')
            "#,
        )
        .bind(conclusion.as_str())
        .bind(now)
        .bind(now)
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn cancel_run(&self, run_id: &str) -> Result<RunCancellation> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM workflow_runs WHERE id = ?")
                .bind(run_id)
                .fetch_optional(&mut *tx)
                .await?;

        match status.as_deref() {
            None => {
                return Err(CoreError::RunNotFound {
                    run_id: run_id.to_string(),
                });
            }
            Some("completed") | Some("cancelled") => return Ok(RunCancellation::default()),
            Some(_) => {}
        }

        let in_flight_jobs: Vec<String> = sqlx::query_scalar(
            "SELECT id FROM jobs WHERE run_id = ? AND status = 'in_progress' ORDER BY position",
        )
        .bind(run_id)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE steps
            SET status = 'cancelled', conclusion = 'cancelled', completed_at = ?
            WHERE job_id IN (SELECT id FROM jobs WHERE run_id = ?)
              AND status IN ('queued', 'in_progress')
            "#,
        )
        .bind(now)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'cancelled', conclusion = 'cancelled', completed_at = ?
            WHERE run_id = ? AND status IN ('queued', 'in_progress')
            "#,
        )
        .bind(now)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'cancelled', conclusion = 'cancelled', completed_at = ?, updated_at = ?
            WHERE id = ? AND status IN ('queued', 'in_progress')
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(RunCancellation {
            cancelled: true,
            in_flight_jobs,
        })
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM jobs WHERE id = ?",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn list_jobs(&self, run_id: &str) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM jobs WHERE run_id = ? ORDER BY position ASC",
            JOB_COLUMNS
        ))
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        convert(rows)
    }

    async fn mark_job_enqueued(&self, job_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET enqueued_at = ?
            WHERE id = ? AND status = 'queued' AND enqueued_at IS NULL
            "#,
        )
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn clear_job_enqueued(&self, job_id: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET enqueued_at = NULL WHERE id = ? AND status = 'queued'")
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn start_job(&self, job_id: &str, worker_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'in_progress', worker_id = ?, started_at = ?
            WHERE id = ? AND status = 'queued'
            "#,
        )
        .bind(worker_id)
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn complete_job(
        &self,
        job_id: &str,
        conclusion: Conclusion,
        output: Option<&Value>,
        error: Option<&str>,
    ) -> Result<bool> {
        let output = output.map(|o| to_json(o)).transpose()?;
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', conclusion = ?, output = ?, error = ?, completed_at = ?
            WHERE id = ? AND status = 'in_progress'
            "#,
        )
        .bind(conclusion.as_str())
        .bind(output)
        .bind(error)
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn skip_job(&self, job_id: &str, reason: &str) -> Result<bool> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'completed', conclusion = 'skipped', error = ?, completed_at = ?
            WHERE id = ? AND status = 'queued'
            "#,
        )
        .bind(reason)
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE steps
            SET status = 'completed', conclusion = 'skipped', completed_at = ?
            WHERE job_id = ? AND status = 'queued'
            "#,
        )
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn list_steps(&self, job_id: &str) -> Result<Vec<Step>> {
        let rows = sqlx::query_as::<_, StepRow>(&format!(
            "SELECT {} FROM steps WHERE job_id = ? ORDER BY number ASC",
            STEP_COLUMNS
        ))
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        convert(rows)
    }

    async fn start_step(&self, job_id: &str, number: i64) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE steps SET status = 'in_progress', started_at = ?
            WHERE job_id = ? AND number = ? AND status = 'queued'
            "#,
        )
        .bind(Utc::now())
        .bind(job_id)
        .bind(number)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn complete_step(
        &self,
        job_id: &str,
        number: i64,
        conclusion: Conclusion,
        output: Option<&str>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE steps
            SET status = 'completed', conclusion = ?, output = COALESCE(?, output), completed_at = ?
            WHERE job_id = ? AND number = ? AND status = 'in_progress'
            "#,
        )
        .bind(conclusion.as_str())
        .bind(output)
        .bind(Utc::now())
        .bind(job_id)
        .bind(number)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn finish_pending_steps(
        &self,
        job_id: &str,
        running_conclusion: Conclusion,
    ) -> Result<u64> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let running = sqlx::query(
            r#"
            UPDATE steps SET status = 'completed', conclusion = ?, completed_at = ?
            WHERE job_id = ? AND status = 'in_progress'
            "#,
        )
        .bind(running_conclusion.as_str())
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        let queued = sqlx::query(
            r#"
            UPDATE steps SET status = 'completed', conclusion = 'skipped', completed_at = ?
            WHERE job_id = ? AND status = 'queued'
            "#,
        )
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(running.rows_affected() + queued.rows_affected())
    }

    async fn append_log(&self, entry: &LogEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_logs (job_id, step_id, level, source, message, logged_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&entry.job_id)
        .bind(&entry.step_id)
        .bind(entry.level.as_str())
        .bind(entry.source.as_str())
        .bind(&entry.message)
        .bind(entry.timestamp)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_job_logs(&self, job_id: &str) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query_as::<_, LogRow>(
            r#"
            SELECT job_id, step_id, level, source, message, logged_at
            FROM job_logs WHERE job_id = ? ORDER BY id ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;

        convert(rows)
    }

    async fn get_step_logs(&self, job_id: &str, number: i64) -> Result<Vec<LogEntry>> {
        let rows = sqlx::query_as::<_, LogRow>(
            r#"
            SELECT l.job_id, l.step_id, l.level, l.source, l.message, l.logged_at
            FROM job_logs l
            JOIN steps s ON s.id = l.step_id
            WHERE s.job_id = ? AND s.number = ?
            ORDER BY l.id ASC
            "#,
        )
        .bind(job_id)
        .bind(number)
        .fetch_all(&self.pool)
        .await?;

        convert(rows)
    }

    async fn create_webhook(&self, webhook: &NewWebhook) -> Result<Webhook> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO webhooks (id, repository_id, url, secret, events, content_type, active,
                                  created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&webhook.repository_id)
        .bind(&webhook.url)
        .bind(&webhook.secret)
        .bind(to_json(&webhook.events)?)
        .bind(webhook.content_type.as_str())
        .bind(webhook.active)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(Webhook {
            id,
            repository_id: webhook.repository_id.clone(),
            url: webhook.url.clone(),
            secret: webhook.secret.clone(),
            events: webhook.events.clone(),
            content_type: webhook.content_type,
            active: webhook.active,
            created_at: now,
            updated_at: now,
        })
    }

    async fn update_webhook(
        &self,
        webhook_id: &str,
        update: &WebhookUpdate,
    ) -> Result<Option<Webhook>> {
        let Some(mut webhook) = self.get_webhook(webhook_id).await? else {
            return Ok(None);
        };

        if let Some(url) = &update.url {
            webhook.url = url.clone();
        }
        if let Some(secret) = &update.secret {
            webhook.secret = secret.clone();
        }
        if let Some(events) = &update.events {
            webhook.events = events.clone();
        }
        if let Some(content_type) = update.content_type {
            webhook.content_type = content_type;
        }
        if let Some(active) = update.active {
            webhook.active = active;
        }
        webhook.updated_at = Utc::now();

        sqlx::query(
            r#"
            UPDATE webhooks
            SET url = ?, secret = ?, events = ?, content_type = ?, active = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&webhook.url)
        .bind(&webhook.secret)
        .bind(to_json(&webhook.events)?)
        .bind(webhook.content_type.as_str())
        .bind(webhook.active)
        .bind(webhook.updated_at)
        .bind(webhook_id)
        .execute(&self.pool)
        .await?;

        Ok(Some(webhook))
    }

    async fn delete_webhook(&self, webhook_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM webhooks WHERE id = ?")
            .bind(webhook_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_webhook(&self, webhook_id: &str) -> Result<Option<Webhook>> {
        let row = sqlx::query_as::<_, WebhookRow>(&format!(
            "SELECT {} FROM webhooks WHERE id = ?",
            WEBHOOK_COLUMNS
        ))
        .bind(webhook_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Webhook::try_from).transpose()
    }

    async fn list_webhooks(&self, repository_id: &str) -> Result<Vec<Webhook>> {
        let rows = sqlx::query_as::<_, WebhookRow>(&format!(
            "SELECT {} FROM webhooks WHERE repository_id = ? ORDER BY created_at ASC",
            WEBHOOK_COLUMNS
        ))
        .bind(repository_id)
        .fetch_all(&self.pool)
        .await?;

        convert(rows)
    }

    async fn record_webhook_event(
        &self,
        repository_id: &str,
        event_type: &str,
        action: Option<&str>,
        payload: &Value,
    ) -> Result<WebhookEvent> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO webhook_events (id, repository_id, event_type, action, payload, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(repository_id)
        .bind(event_type)
        .bind(action)
        .bind(to_json(payload)?)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(WebhookEvent {
            id,
            repository_id: repository_id.to_string(),
            event_type: event_type.to_string(),
            action: action.map(str::to_string),
            payload: payload.clone(),
            created_at: now,
        })
    }

    async fn create_delivery(&self, delivery: &NewDelivery) -> Result<WebhookDelivery> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let guid = Uuid::new_v4().to_string();

        sqlx::query(
            r#"
            INSERT INTO webhook_deliveries (id, webhook_id, event_id, guid, event_type, url,
                                            payload, request_headers, attempts, success,
                                            next_retry_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, '{}', 0, 0, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&delivery.webhook_id)
        .bind(&delivery.event_id)
        .bind(&guid)
        .bind(&delivery.event_type)
        .bind(&delivery.url)
        .bind(&delivery.payload)
        .bind(delivery.next_retry_at)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_delivery(&id)
            .await?
            .ok_or(CoreError::DeliveryNotFound { delivery_id: id })
    }

    async fn get_delivery(&self, delivery_id: &str) -> Result<Option<WebhookDelivery>> {
        let row = sqlx::query_as::<_, DeliveryRow>(&format!(
            "SELECT {} FROM webhook_deliveries WHERE id = ?",
            DELIVERY_COLUMNS
        ))
        .bind(delivery_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WebhookDelivery::try_from).transpose()
    }

    async fn list_deliveries(&self, webhook_id: &str, limit: i64) -> Result<Vec<WebhookDelivery>> {
        let rows = sqlx::query_as::<_, DeliveryRow>(&format!(
            r#"
            SELECT {} FROM webhook_deliveries
            WHERE webhook_id = ?
            ORDER BY created_at DESC
            LIMIT ?
            "#,
            DELIVERY_COLUMNS
        ))
        .bind(webhook_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        convert(rows)
    }

    async fn record_delivery_attempt(
        &self,
        delivery_id: &str,
        attempt: &DeliveryAttempt,
    ) -> Result<bool> {
        let now = Utc::now();
        let terminal = attempt.is_terminal();
        let response_headers = attempt
            .response_headers
            .as_ref()
            .map(|h| to_json(h))
            .transpose()?;

        let result = sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET attempts = ?, success = ?, status_code = ?, duration_ms = ?,
                request_headers = ?, response_headers = ?, response_body = ?, error = ?,
                next_retry_at = ?, updated_at = ?, completed_at = ?
            WHERE id = ? AND attempts = ? AND completed_at IS NULL
            "#,
        )
        .bind(attempt.attempt)
        .bind(attempt.success)
        .bind(attempt.status_code)
        .bind(attempt.duration_ms)
        .bind(to_json(&attempt.request_headers)?)
        .bind(response_headers)
        .bind(&attempt.response_body)
        .bind(&attempt.error)
        .bind(if terminal { None } else { attempt.next_retry_at })
        .bind(now)
        .bind(if terminal { Some(now) } else { None })
        .bind(delivery_id)
        .bind(attempt.attempt - 1)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_due_deliveries(
        &self,
        now: DateTime<Utc>,
        max_attempts: i64,
        limit: i64,
    ) -> Result<Vec<WebhookDelivery>> {
        let rows = sqlx::query_as::<_, DeliveryRow>(&format!(
            r#"
            SELECT {} FROM webhook_deliveries
            WHERE completed_at IS NULL
              AND next_retry_at IS NOT NULL
              AND next_retry_at <= ?
              AND attempts < ?
            ORDER BY next_retry_at ASC
            LIMIT ?
            "#,
            DELIVERY_COLUMNS
        ))
        .bind(now)
        .bind(max_attempts)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        convert(rows)
    }

    async fn lease_delivery(
        &self,
        delivery_id: &str,
        expected_attempts: i64,
        now: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE webhook_deliveries
            SET next_retry_at = ?, updated_at = ?
            WHERE id = ? AND attempts = ? AND completed_at IS NULL
              AND next_retry_at IS NOT NULL AND next_retry_at <= ?
            "#,
        )
        .bind(until)
        .bind(Utc::now())
        .bind(delivery_id)
        .bind(expected_attempts)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn health_check_db(&self) -> Result<bool> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::models::{ContentType, LogLevel, LogSource, NewStep, Status};

    /// Create an in-memory SQLite pool for testing.
    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");

        crate::migrations::SQLITE
            .run(&pool)
            .await
            .expect("Failed to run migrations");

        pool
    }

    fn new_run(repository_id: &str) -> NewRun {
        NewRun {
            workflow_id: "wf-1".to_string(),
            repository_id: repository_id.to_string(),
            organization_id: Some("org-1".to_string()),
            name: "CI".to_string(),
            event: "push".to_string(),
            head_sha: "abc123".to_string(),
            head_branch: Some("main".to_string()),
            actor: None,
        }
    }

    fn new_job(name: &str, needs: &[&str], steps: usize) -> NewJob {
        NewJob {
            name: name.to_string(),
            display_name: name.to_string(),
            needs: needs.iter().map(|n| n.to_string()).collect(),
            runs_on: vec!["linux".to_string()],
            env: BTreeMap::new(),
            strategy: None,
            environment: None,
            image: None,
            timeout_minutes: None,
            priority: 0,
            steps: (1..=steps)
                .map(|i| NewStep {
                    name: format!("step {}", i),
                    uses: None,
                    run: Some(format!("echo {}", i)),
                    params: BTreeMap::new(),
                    env: BTreeMap::new(),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_create_run_numbers_are_per_repository() {
        let persistence = SqlitePersistence::new(test_pool().await);

        let first = persistence
            .create_run(&new_run("repo-a"), &[new_job("build", &[], 2)])
            .await
            .expect("Failed to create run");
        let second = persistence
            .create_run(&new_run("repo-a"), &[new_job("build", &[], 1)])
            .await
            .expect("Failed to create run");
        let other = persistence
            .create_run(&new_run("repo-b"), &[new_job("build", &[], 1)])
            .await
            .expect("Failed to create run");

        assert_eq!(first.run_number, 1);
        assert_eq!(second.run_number, 2);
        assert_eq!(other.run_number, 1);
        assert_eq!(first.status, Status::Queued);
        assert!(first.conclusion.is_none());

        let jobs = persistence.list_jobs(&first.id).await.expect("list jobs");
        assert_eq!(jobs.len(), 1);
        let steps = persistence.list_steps(&jobs[0].id).await.expect("list steps");
        assert_eq!(
            steps.iter().map(|s| s.number).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }

    #[tokio::test]
    async fn test_create_run_rolls_back_on_failure() {
        let persistence = SqlitePersistence::new(test_pool().await);

        // Duplicate job names violate UNIQUE(run_id, name) after the run row was written.
        let result = persistence
            .create_run(
                &new_run("repo-a"),
                &[new_job("build", &[], 1), new_job("build", &[], 1)],
            )
            .await;
        assert!(result.is_err());

        let runs = persistence.list_runs("repo-a", 10).await.expect("list runs");
        assert!(runs.is_empty(), "partially created run must be discarded");
    }

    #[tokio::test]
    async fn test_job_transitions_are_guarded() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let run = persistence
            .create_run(&new_run("repo"), &[new_job("build", &[], 1)])
            .await
            .expect("create run");
        let job = &persistence.list_jobs(&run.id).await.expect("jobs")[0];

        assert!(persistence.mark_job_enqueued(&job.id).await.expect("enqueue"));
        assert!(!persistence.mark_job_enqueued(&job.id).await.expect("enqueue twice"));

        assert!(
            !persistence
                .complete_job(&job.id, Conclusion::Success, None, None)
                .await
                .expect("complete queued")
        );
        assert!(persistence.start_job(&job.id, "w1").await.expect("start"));
        assert!(!persistence.start_job(&job.id, "w2").await.expect("start twice"));

        let output = serde_json::json!({"exit_code": 0});
        assert!(
            persistence
                .complete_job(&job.id, Conclusion::Success, Some(&output), None)
                .await
                .expect("complete")
        );

        let job = persistence.get_job(&job.id).await.expect("get").expect("exists");
        assert!(job.succeeded());
        assert_eq!(job.worker_id.as_deref(), Some("w1"));
        assert_eq!(job.output, Some(output));
    }

    #[tokio::test]
    async fn test_skip_job_skips_steps() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let run = persistence
            .create_run(
                &new_run("repo"),
                &[new_job("a", &[], 1), new_job("b", &["a"], 2)],
            )
            .await
            .expect("create run");
        let jobs = persistence.list_jobs(&run.id).await.expect("jobs");

        assert!(persistence.skip_job(&jobs[1].id, "needs a").await.expect("skip"));
        assert!(!persistence.skip_job(&jobs[1].id, "needs a").await.expect("skip twice"));

        let job = persistence.get_job(&jobs[1].id).await.expect("get").expect("exists");
        assert_eq!(job.status, Status::Completed);
        assert_eq!(job.conclusion, Some(Conclusion::Skipped));
        assert!(job.started_at.is_none());

        for step in persistence.list_steps(&jobs[1].id).await.expect("steps") {
            assert_eq!(step.conclusion, Some(Conclusion::Skipped));
            assert!(step.started_at.is_none());
        }
    }

    #[tokio::test]
    async fn test_cancel_run_cancels_non_terminal_work() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let run = persistence
            .create_run(
                &new_run("repo"),
                &[new_job("a", &[], 2), new_job("b", &["a"], 1)],
            )
            .await
            .expect("create run");
        let jobs = persistence.list_jobs(&run.id).await.expect("jobs");
        persistence.start_job(&jobs[0].id, "w1").await.expect("start");
        persistence.start_step(&jobs[0].id, 1).await.expect("start step");

        let cancellation = persistence.cancel_run(&run.id).await.expect("cancel");
        assert!(cancellation.cancelled);
        assert_eq!(cancellation.in_flight_jobs, vec![jobs[0].id.clone()]);

        let run = persistence.get_run(&run.id).await.expect("get").expect("exists");
        assert_eq!(run.status, Status::Cancelled);
        assert_eq!(run.conclusion, Some(Conclusion::Cancelled));

        for job in persistence.list_jobs(&run.id).await.expect("jobs") {
            assert_eq!(job.status, Status::Cancelled);
            for step in persistence.list_steps(&job.id).await.expect("steps") {
                assert_eq!(step.status, Status::Cancelled);
            }
        }

        // No step may transition after the cancellation is recorded.
        assert!(
            !persistence
                .complete_step(&jobs[0].id, 1, Conclusion::Success, None)
                .await
                .expect("complete step")
        );

        let again = persistence.cancel_run(&run.id).await.expect("cancel again");
        assert!(!again.cancelled);

        let missing = persistence.cancel_run("nope").await;
        assert!(matches!(missing, Err(CoreError::RunNotFound { .. })));
    }

    #[tokio::test]
    async fn test_step_logs_follow_step_numbers() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let run = persistence
            .create_run(&new_run("repo"), &[new_job("a", &[], 2)])
            .await
            .expect("create run");
        let job = &persistence.list_jobs(&run.id).await.expect("jobs")[0];
        let steps = persistence.list_steps(&job.id).await.expect("steps");

        for (step, message) in [(None, "setup"), (Some(&steps[0]), "one"), (Some(&steps[1]), "two")] {
            persistence
                .append_log(&LogEntry::new(
                    &job.id,
                    step.map(|s| s.id.clone()),
                    LogLevel::Info,
                    LogSource::Remote,
                    message,
                ))
                .await
                .expect("append");
        }

        let all = persistence.get_job_logs(&job.id).await.expect("job logs");
        assert_eq!(
            all.iter().map(|l| l.message.as_str()).collect::<Vec<_>>(),
            vec!["setup", "one", "two"]
        );

        let second = persistence.get_step_logs(&job.id, 2).await.expect("step logs");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].message, "two");
    }

    #[tokio::test]
    async fn test_delivery_attempts_and_due_selection() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let webhook = persistence
            .create_webhook(&NewWebhook {
                repository_id: "repo".to_string(),
                url: "https://example.com/hook".to_string(),
                secret: None,
                events: vec!["push".to_string()],
                content_type: ContentType::Json,
                active: true,
            })
            .await
            .expect("create webhook");

        let delivery = persistence
            .create_delivery(&NewDelivery {
                webhook_id: webhook.id.clone(),
                event_id: None,
                event_type: "push".to_string(),
                url: webhook.url.clone(),
                payload: "{}".to_string(),
                next_retry_at: None,
            })
            .await
            .expect("create delivery");
        assert_eq!(delivery.attempts, 0);

        let retry_at = Utc::now() - chrono::Duration::seconds(1);
        let failed = DeliveryAttempt {
            attempt: 1,
            status_code: Some(500),
            next_retry_at: Some(retry_at),
            ..Default::default()
        };
        assert!(persistence.record_delivery_attempt(&delivery.id, &failed).await.expect("record"));
        // Same attempt number again is rejected.
        assert!(!persistence.record_delivery_attempt(&delivery.id, &failed).await.expect("record"));

        let due = persistence
            .list_due_deliveries(Utc::now(), 5, 10)
            .await
            .expect("due");
        assert_eq!(due.len(), 1);

        let until = Utc::now() + chrono::Duration::minutes(5);
        assert!(persistence.lease_delivery(&delivery.id, 1, Utc::now(), until).await.expect("lease"));
        assert!(!persistence.lease_delivery(&delivery.id, 1, Utc::now(), until).await.expect("lease twice"));

        let delivered = DeliveryAttempt {
            attempt: 2,
            success: true,
            status_code: Some(200),
            next_retry_at: Some(until),
            ..Default::default()
        };
        assert!(persistence.record_delivery_attempt(&delivery.id, &delivered).await.expect("record"));

        let stored = persistence
            .get_delivery(&delivery.id)
            .await
            .expect("get")
            .expect("exists");
        assert_eq!(stored.attempts, 2);
        assert!(stored.success);
        assert!(stored.next_retry_at.is_none());
        assert!(stored.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_update_and_delete_webhook() {
        let persistence = SqlitePersistence::new(test_pool().await);
        let webhook = persistence
            .create_webhook(&NewWebhook {
                repository_id: "repo".to_string(),
                url: "https://example.com/a".to_string(),
                secret: Some("s".to_string()),
                events: vec!["push".to_string()],
                content_type: ContentType::Json,
                active: true,
            })
            .await
            .expect("create");

        let updated = persistence
            .update_webhook(
                &webhook.id,
                &WebhookUpdate {
                    events: Some(vec!["*".to_string()]),
                    secret: Some(None),
                    active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .expect("update")
            .expect("exists");
        assert_eq!(updated.events, vec!["*"]);
        assert!(updated.secret.is_none());
        assert!(!updated.active);

        let matching = persistence
            .list_active_webhooks_for_event("repo", "push")
            .await
            .expect("list");
        assert!(matching.is_empty());

        assert!(persistence.delete_webhook(&webhook.id).await.expect("delete"));
        assert!(persistence.get_webhook(&webhook.id).await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_from_path_creates_database() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("forge.db");

        let persistence = SqlitePersistence::from_path(&path).await.expect("open");
        assert!(path.exists());
        assert!(persistence.health_check_db().await.expect("health"));

        let run = persistence
            .create_run(&new_run("repo"), &[new_job("build", &[], 1)])
            .await
            .expect("create run");
        drop(persistence);

        let reopened = SqlitePersistence::from_path(&path).await.expect("reopen");
        let stored = reopened.get_run(&run.id).await.expect("get").expect("exists");
        assert_eq!(stored.run_number, 1);
    }
}
