// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Raw row shapes shared by both backends.
//!
//! Status and JSON columns are stored as text; conversion into the typed
//! models happens here so both backends decode identically.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use crate::error::CoreError;
use crate::models::{
    Conclusion, LogEntry, Job, Step, Webhook, WebhookDelivery, WebhookEvent, WorkflowRun,
};

pub(crate) const RUN_COLUMNS: &str = "id, workflow_id, repository_id, organization_id, run_number, \
     name, event, head_sha, head_branch, actor, status, conclusion, created_at, started_at, \
     completed_at, updated_at";

pub(crate) const JOB_COLUMNS: &str = "id, run_id, name, display_name, position, needs, runs_on, \
     env, strategy, environment, image, timeout_minutes, priority, status, conclusion, worker_id, \
     output, error, enqueued_at, started_at, completed_at, created_at";

pub(crate) const STEP_COLUMNS: &str = "id, job_id, number, name, uses, run, params, env, status, \
     conclusion, output, started_at, completed_at";

pub(crate) const WEBHOOK_COLUMNS: &str =
    "id, repository_id, url, secret, events, content_type, active, created_at, updated_at";

pub(crate) const DELIVERY_COLUMNS: &str = "id, webhook_id, event_id, guid, event_type, url, \
     payload, request_headers, attempts, success, status_code, duration_ms, response_headers, \
     response_body, error, next_retry_at, created_at, updated_at, completed_at";

fn decode_error(what: &str, details: impl std::fmt::Display) -> CoreError {
    CoreError::DatabaseError {
        operation: format!("decode {}", what),
        details: details.to_string(),
    }
}

fn parse<T: std::str::FromStr<Err = String>>(what: &str, value: &str) -> Result<T, CoreError> {
    value.parse().map_err(|e| decode_error(what, e))
}

fn parse_opt_conclusion(value: Option<String>) -> Result<Option<Conclusion>, CoreError> {
    value.map(|c| parse("conclusion", &c)).transpose()
}

fn json<T: DeserializeOwned>(what: &str, value: &str) -> Result<T, CoreError> {
    serde_json::from_str(value).map_err(|e| decode_error(what, e))
}

fn json_opt<T: DeserializeOwned>(what: &str, value: Option<String>) -> Result<Option<T>, CoreError> {
    value.map(|v| json(what, &v)).transpose()
}

#[derive(sqlx::FromRow)]
pub(crate) struct RunRow {
    id: String,
    workflow_id: String,
    repository_id: String,
    organization_id: Option<String>,
    run_number: i64,
    name: String,
    event: String,
    head_sha: String,
    head_branch: Option<String>,
    actor: Option<String>,
    status: String,
    conclusion: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<RunRow> for WorkflowRun {
    type Error = CoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        Ok(WorkflowRun {
            id: row.id,
            workflow_id: row.workflow_id,
            repository_id: row.repository_id,
            organization_id: row.organization_id,
            run_number: row.run_number,
            name: row.name,
            event: row.event,
            head_sha: row.head_sha,
            head_branch: row.head_branch,
            actor: row.actor,
            status: parse("run status", &row.status)?,
            conclusion: parse_opt_conclusion(row.conclusion)?,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct JobRow {
    id: String,
    run_id: String,
    name: String,
    display_name: String,
    position: i64,
    needs: String,
    runs_on: String,
    env: String,
    strategy: Option<String>,
    environment: Option<String>,
    image: Option<String>,
    timeout_minutes: Option<i64>,
    priority: i64,
    status: String,
    conclusion: Option<String>,
    worker_id: Option<String>,
    output: Option<String>,
    error: Option<String>,
    enqueued_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = CoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row.id,
            run_id: row.run_id,
            name: row.name,
            display_name: row.display_name,
            position: row.position,
            needs: json("job needs", &row.needs)?,
            runs_on: json("job runs_on", &row.runs_on)?,
            env: json("job env", &row.env)?,
            strategy: json_opt("job strategy", row.strategy)?,
            environment: row.environment,
            image: row.image,
            timeout_minutes: row.timeout_minutes,
            priority: row.priority,
            status: parse("job status", &row.status)?,
            conclusion: parse_opt_conclusion(row.conclusion)?,
            worker_id: row.worker_id,
            output: json_opt("job output", row.output)?,
            error: row.error,
            enqueued_at: row.enqueued_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct StepRow {
    id: String,
    job_id: String,
    number: i64,
    name: String,
    uses: Option<String>,
    run: Option<String>,
    params: String,
    env: String,
    status: String,
    conclusion: Option<String>,
    output: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<StepRow> for Step {
    type Error = CoreError;

    fn try_from(row: StepRow) -> Result<Self, Self::Error> {
        Ok(Step {
            id: row.id,
            job_id: row.job_id,
            number: row.number,
            name: row.name,
            uses: row.uses,
            run: row.run,
            params: json("step params", &row.params)?,
            env: json("step env", &row.env)?,
            status: parse("step status", &row.status)?,
            conclusion: parse_opt_conclusion(row.conclusion)?,
            output: row.output,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct LogRow {
    job_id: String,
    step_id: Option<String>,
    level: String,
    source: String,
    message: String,
    logged_at: DateTime<Utc>,
}

impl TryFrom<LogRow> for LogEntry {
    type Error = CoreError;

    fn try_from(row: LogRow) -> Result<Self, Self::Error> {
        Ok(LogEntry {
            job_id: row.job_id,
            step_id: row.step_id,
            level: parse("log level", &row.level)?,
            source: parse("log source", &row.source)?,
            message: row.message,
            timestamp: row.logged_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct WebhookRow {
    id: String,
    repository_id: String,
    url: String,
    secret: Option<String>,
    events: String,
    content_type: String,
    active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<WebhookRow> for Webhook {
    type Error = CoreError;

    fn try_from(row: WebhookRow) -> Result<Self, Self::Error> {
        Ok(Webhook {
            id: row.id,
            repository_id: row.repository_id,
            url: row.url,
            secret: row.secret,
            events: json("webhook events", &row.events)?,
            content_type: parse("webhook content type", &row.content_type)?,
            active: row.active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct EventRow {
    id: String,
    repository_id: String,
    event_type: String,
    action: Option<String>,
    payload: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for WebhookEvent {
    type Error = CoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(WebhookEvent {
            id: row.id,
            repository_id: row.repository_id,
            event_type: row.event_type,
            action: row.action,
            payload: json("event payload", &row.payload)?,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
pub(crate) struct DeliveryRow {
    id: String,
    webhook_id: String,
    event_id: Option<String>,
    guid: String,
    event_type: String,
    url: String,
    payload: String,
    request_headers: String,
    attempts: i64,
    success: bool,
    status_code: Option<i64>,
    duration_ms: Option<i64>,
    response_headers: Option<String>,
    response_body: Option<String>,
    error: Option<String>,
    next_retry_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<DeliveryRow> for WebhookDelivery {
    type Error = CoreError;

    fn try_from(row: DeliveryRow) -> Result<Self, Self::Error> {
        Ok(WebhookDelivery {
            id: row.id,
            webhook_id: row.webhook_id,
            event_id: row.event_id,
            guid: row.guid,
            event_type: row.event_type,
            url: row.url,
            payload: row.payload,
            request_headers: json::<BTreeMap<String, String>>("request headers", &row.request_headers)?,
            attempts: row.attempts,
            success: row.success,
            status_code: row.status_code,
            duration_ms: row.duration_ms,
            response_headers: json_opt("response headers", row.response_headers)?,
            response_body: row.response_body,
            error: row.error,
            next_retry_at: row.next_retry_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
            completed_at: row.completed_at,
        })
    }
}

/// Convert a batch of rows, failing on the first undecodable one.
pub(crate) fn convert<R, T>(rows: Vec<R>) -> Result<Vec<T>, CoreError>
where
    T: TryFrom<R, Error = CoreError>,
{
    rows.into_iter().map(T::try_from).collect()
}

/// Serialize a value for a JSON text column.
pub(crate) fn to_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<String, CoreError> {
    serde_json::to_string(value).map_err(CoreError::from)
}

/// Unique-key violation, reported by both backends.
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}
