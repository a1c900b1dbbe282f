// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed persistence implementation.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
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

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation from a migrated pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl Persistence for PostgresPersistence {
    async fn create_run(&self, run: &NewRun, jobs: &[NewJob]) -> Result<WorkflowRun> {
        let now = Utc::now();
        let run_id = Uuid::new_v4().to_string();
        let mut tx = self.pool.begin().await?;

        let run_number: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(run_number), 0) + 1 FROM workflow_runs WHERE repository_id = $1",
        )
        .bind(&run.repository_id)
        .fetch_one(&mut *tx)
        .await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO workflow_runs (id, workflow_id, repository_id, organization_id, run_number,
                                       name, event, head_sha, head_branch, actor, status,
                                       created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'queued', $11, $12)
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
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, 'queued', $14)
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
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 'queued')
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
            "SELECT {} FROM workflow_runs WHERE id = $1",
            RUN_COLUMNS
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WorkflowRun::try_from).transpose()
    }

    async fn list_runs(&self, repository_id: &str, limit: i64) -> Result<Vec<WorkflowRun>> {
        let rows = sqlx::query_as::<_, RunRow>(&format!(
            "SELECT {} FROM workflow_runs WHERE repository_id = $1 ORDER BY run_number DESC LIMIT $2",
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
            LIMIT $1
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
            SET status = 'in_progress', started_at = $1, updated_at = $2
            WHERE id = $3 AND status = 'queued'
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
            SET status = 'completed', conclusion = $1, completed_at = $2, updated_at = $3
            WHERE id = $4 AND status IN ('queued', 'in_progress')
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
            sqlx::query_scalar("SELECT status FROM workflow_runs WHERE id = $1")
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
            "SELECT id FROM jobs WHERE run_id = $1 AND status = 'in_progress' ORDER BY position",
        )
        .bind(run_id)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE steps
            SET status = 'cancelled', conclusion = 'cancelled', completed_at = $1
            WHERE job_id IN (SELECT id FROM jobs WHERE run_id = $2)
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
            SET status = 'cancelled', conclusion = 'cancelled', completed_at = $1
            WHERE run_id = $2 AND status IN ('queued', 'in_progress')
            "#,
        )
        .bind(now)
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'cancelled', conclusion = 'cancelled', completed_at = $1, updated_at = $2
            WHERE id = $3 AND status IN ('queued', 'in_progress')
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
            "SELECT {} FROM jobs WHERE id = $1",
            JOB_COLUMNS
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn list_jobs(&self, run_id: &str) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM jobs WHERE run_id = $1 ORDER BY position ASC",
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
            UPDATE jobs SET enqueued_at = $1
            WHERE id = $2 AND status = 'queued' AND enqueued_at IS NULL
            "#,
        )
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn clear_job_enqueued(&self, job_id: &str) -> Result<()> {
        sqlx::query("UPDATE jobs SET enqueued_at = NULL WHERE id = $1 AND status = 'queued'")
            .bind(job_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn start_job(&self, job_id: &str, worker_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'in_progress', worker_id = $1, started_at = $2
            WHERE id = $3 AND status = 'queued'
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
            SET status = 'completed', conclusion = $1, output = $2, error = $3, completed_at = $4
            WHERE id = $5 AND status = 'in_progress'
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
            SET status = 'completed', conclusion = 'skipped', error = $1, completed_at = $2
            WHERE id = $3 AND status = 'queued'
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
            SET status = 'completed', conclusion = 'skipped', completed_at = $1
            WHERE job_id = $2 AND status = 'queued'
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
            "SELECT {} FROM steps WHERE job_id = $1 ORDER BY number ASC",
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
            UPDATE steps SET status = 'in_progress', started_at = $1
            WHERE job_id = $2 AND number = $3 AND status = 'queued'
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
            SET status = 'completed', conclusion = $1, output = COALESCE($2, output), completed_at = $3
            WHERE job_id = $4 AND number = $5 AND status = 'in_progress'
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
            UPDATE steps SET status = 'completed', conclusion = $1, completed_at = $2
            WHERE job_id = $3 AND status = 'in_progress'
            "#,
        )
        .bind(running_conclusion.as_str())
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        let queued = sqlx::query(
            r#"
            UPDATE steps SET status = 'completed', conclusion = 'skipped', completed_at = $1
            WHERE job_id = $2 AND status = 'queued'
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
            VALUES ($1, $2, $3, $4, $5, $6)
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
            FROM job_logs WHERE job_id = $1 ORDER BY id ASC
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
            WHERE s.job_id = $1 AND s.number = $2
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
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
            SET url = $1, secret = $2, events = $3, content_type = $4, active = $5, updated_at = $6
            WHERE id = $7
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
        let result = sqlx::query("DELETE FROM webhooks WHERE id = $1")
            .bind(webhook_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_webhook(&self, webhook_id: &str) -> Result<Option<Webhook>> {
        let row = sqlx::query_as::<_, WebhookRow>(&format!(
            "SELECT {} FROM webhooks WHERE id = $1",
            WEBHOOK_COLUMNS
        ))
        .bind(webhook_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Webhook::try_from).transpose()
    }

    async fn list_webhooks(&self, repository_id: &str) -> Result<Vec<Webhook>> {
        let rows = sqlx::query_as::<_, WebhookRow>(&format!(
            "SELECT {} FROM webhooks WHERE repository_id = $1 ORDER BY created_at ASC",
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
            VALUES ($1, $2, $3, $4, $5, $6)
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
            VALUES ($1, $2, $3, $4, $5, $6, $7, '{}', 0, FALSE, $8, $9, $10)
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
            "SELECT {} FROM webhook_deliveries WHERE id = $1",
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
            WHERE webhook_id = $1
            ORDER BY created_at DESC
            LIMIT $2
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
            SET attempts = $1, success = $2, status_code = $3, duration_ms = $4,
                request_headers = $5, response_headers = $6, response_body = $7, error = $8,
                next_retry_at = $9, updated_at = $10, completed_at = $11
            WHERE id = $12 AND attempts = $13 AND completed_at IS NULL
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
              AND next_retry_at <= $1
              AND attempts < $2
            ORDER BY next_retry_at ASC
            LIMIT $3
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
            SET next_retry_at = $1, updated_at = $2
            WHERE id = $3 AND attempts = $4 AND completed_at IS NULL
              AND next_retry_at IS NOT NULL AND next_retry_at <= $5
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
