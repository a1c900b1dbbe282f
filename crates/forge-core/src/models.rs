// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Data model shared by every forge subsystem.
//!
//! Runs own their jobs, jobs own their steps. Webhooks own their deliveries.
//! Status values are stored as lowercase strings (`queued`, `in_progress`, ...)
//! and parsed back into these enums by the persistence layer.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle status shared by runs, jobs and steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Waiting to be scheduled.
    Queued,
    /// Currently executing.
    InProgress,
    /// Finished; see the accompanying conclusion.
    Completed,
    /// Cancelled before finishing.
    Cancelled,
}

impl Status {
    /// Database/wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Queued => "queued",
            Status::InProgress => "in_progress",
            Status::Completed => "completed",
            Status::Cancelled => "cancelled",
        }
    }

    /// Terminal states never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Cancelled)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Status::Queued),
            "in_progress" => Ok(Status::InProgress),
            "completed" => Ok(Status::Completed),
            "cancelled" => Ok(Status::Cancelled),
            other => Err(format!("unknown status '{}'", other)),
        }
    }
}

/// Outcome of a terminal run, job or step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Conclusion {
    /// Finished without error.
    Success,
    /// A step failed, the unit could not be created, or the job timed out.
    Failure,
    /// Cancelled by an operator.
    Cancelled,
    /// Never executed: an earlier step failed or a dependency did not succeed.
    Skipped,
}

impl Conclusion {
    /// Database/wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Conclusion::Success => "success",
            Conclusion::Failure => "failure",
            Conclusion::Cancelled => "cancelled",
            Conclusion::Skipped => "skipped",
        }
    }

    /// Convenience for `success` / `failure` mapping.
    pub fn from_success(success: bool) -> Self {
        if success {
            Conclusion::Success
        } else {
            Conclusion::Failure
        }
    }
}

impl fmt::Display for Conclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Conclusion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Conclusion::Success),
            "failure" => Ok(Conclusion::Failure),
            "cancelled" => Ok(Conclusion::Cancelled),
            "skipped" => Ok(Conclusion::Skipped),
            other => Err(format!("unknown conclusion '{}'", other)),
        }
    }
}

/// One trigger-driven execution attempt of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Run identifier (UUID).
    pub id: String,
    /// Workflow this run was materialized from.
    pub workflow_id: String,
    /// Owning repository.
    pub repository_id: String,
    /// Owning organization, used for secret scoping.
    pub organization_id: Option<String>,
    /// Monotonic per-repository run number, starting at 1.
    pub run_number: i64,
    /// Display name (the workflow's `name`).
    pub name: String,
    /// Trigger event name (`push`, `pull_request`, ...).
    pub event: String,
    /// Commit the run executes against.
    pub head_sha: String,
    /// Branch of the triggering ref, if any.
    pub head_branch: Option<String>,
    /// User that caused the trigger, if known.
    pub actor: Option<String>,
    /// Current status.
    pub status: Status,
    /// Set only once the status is terminal.
    pub conclusion: Option<Conclusion>,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// When the first job was dispatched.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
}

/// One schedulable node of a run's dependency graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job identifier (UUID).
    pub id: String,
    /// Owning run.
    pub run_id: String,
    /// Job key inside the workflow (`build`, `test`, ...); `needs` refers to these.
    pub name: String,
    /// Human readable name (defaults to the key).
    pub display_name: String,
    /// Declaration order inside the workflow.
    pub position: i64,
    /// Names of jobs that must succeed before this one may start.
    pub needs: Vec<String>,
    /// Labels a worker must carry to run this job.
    pub runs_on: Vec<String>,
    /// Job level environment.
    pub env: BTreeMap<String, String>,
    /// Parallelism strategy, kept verbatim.
    pub strategy: Option<Value>,
    /// Deployment environment used for secret scoping.
    pub environment: Option<String>,
    /// Container image override.
    pub image: Option<String>,
    /// Wall-clock limit; the executor default applies when absent.
    pub timeout_minutes: Option<i64>,
    /// Queue priority, higher first.
    pub priority: i64,
    /// Current status.
    pub status: Status,
    /// Set only once the status is terminal.
    pub conclusion: Option<Conclusion>,
    /// Worker the job was assigned to.
    pub worker_id: Option<String>,
    /// Structured completion summary.
    pub output: Option<Value>,
    /// Error recorded on failure.
    pub error: Option<String>,
    /// When the job was handed to the job queue.
    pub enqueued_at: Option<DateTime<Utc>>,
    /// When execution started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// When the job row was created.
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Completed with a `success` conclusion.
    pub fn succeeded(&self) -> bool {
        self.status == Status::Completed && self.conclusion == Some(Conclusion::Success)
    }
}

/// One ordered action inside a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Step identifier (UUID).
    pub id: String,
    /// Owning job.
    pub job_id: String,
    /// 1-based position, unique per job.
    pub number: i64,
    /// Display name.
    pub name: String,
    /// Reusable action reference (`actions/checkout@v4`).
    pub uses: Option<String>,
    /// Shell command.
    pub run: Option<String>,
    /// Action parameters (`with:`).
    pub params: BTreeMap<String, String>,
    /// Step level environment.
    pub env: BTreeMap<String, String>,
    /// Current status.
    pub status: Status,
    /// Set only once the status is terminal.
    pub conclusion: Option<Conclusion>,
    /// Captured output.
    pub output: Option<String>,
    /// When the step started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the step reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Severity of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Verbose diagnostics.
    Debug,
    /// Regular output.
    Info,
    /// Warnings, including stderr output.
    Warn,
    /// Errors.
    Error,
}

impl LogLevel {
    /// Database/wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// Producer of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    /// The worker agent.
    Worker,
    /// The scheduler/executor itself.
    Orchestrator,
    /// Output of the remote execution unit.
    Remote,
}

impl LogSource {
    /// Database/wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSource::Worker => "worker",
            LogSource::Orchestrator => "orchestrator",
            LogSource::Remote => "remote",
        }
    }
}

impl FromStr for LogSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "worker" => Ok(LogSource::Worker),
            "orchestrator" => Ok(LogSource::Orchestrator),
            "remote" => Ok(LogSource::Remote),
            other => Err(format!("unknown log source '{}'", other)),
        }
    }
}

/// A single timestamped output line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Job the line belongs to.
    pub job_id: String,
    /// Step the line belongs to, when attributable.
    pub step_id: Option<String>,
    /// Severity.
    pub level: LogLevel,
    /// Producer.
    pub source: LogSource,
    /// The line itself, without trailing newline.
    pub message: String,
    /// When the line was produced.
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    /// Create an entry stamped with the current time.
    pub fn new(
        job_id: impl Into<String>,
        step_id: Option<String>,
        level: LogLevel,
        source: LogSource,
        message: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            step_id,
            level,
            source,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Body encoding used for webhook requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    /// `application/json`
    #[default]
    Json,
    /// `application/x-www-form-urlencoded` with a `payload` field.
    Form,
}

impl ContentType {
    /// Database representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Json => "json",
            ContentType::Form => "form",
        }
    }

    /// MIME type sent in the `Content-Type` header.
    pub fn mime(&self) -> &'static str {
        match self {
            ContentType::Json => "application/json",
            ContentType::Form => "application/x-www-form-urlencoded",
        }
    }
}

impl FromStr for ContentType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(ContentType::Json),
            "form" => Ok(ContentType::Form),
            other => Err(format!("unknown content type '{}'", other)),
        }
    }
}

/// A per-repository delivery target.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Webhook {
    /// Webhook identifier (UUID).
    pub id: String,
    /// Owning repository.
    pub repository_id: String,
    /// Target URL.
    pub url: String,
    /// Shared secret for HMAC signing.
    #[serde(skip_serializing)]
    pub secret: Option<String>,
    /// Subscribed event names; `*` subscribes to everything.
    pub events: Vec<String>,
    /// Request body encoding.
    pub content_type: ContentType,
    /// Inactive webhooks receive nothing.
    pub active: bool,
    /// When the webhook was created.
    pub created_at: DateTime<Utc>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
}

impl Webhook {
    /// Whether this webhook wants `event`.
    pub fn subscribes_to(&self, event: &str) -> bool {
        self.events.iter().any(|e| e == "*" || e == event)
    }
}

impl fmt::Debug for Webhook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Webhook")
            .field("id", &self.id)
            .field("repository_id", &self.repository_id)
            .field("url", &self.url)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .field("events", &self.events)
            .field("content_type", &self.content_type)
            .field("active", &self.active)
            .finish()
    }
}

/// Fields for creating a webhook.
#[derive(Debug, Clone)]
pub struct NewWebhook {
    /// Owning repository.
    pub repository_id: String,
    /// Target URL.
    pub url: String,
    /// Shared secret.
    pub secret: Option<String>,
    /// Subscribed event names.
    pub events: Vec<String>,
    /// Body encoding.
    pub content_type: ContentType,
    /// Initial active flag.
    pub active: bool,
}

/// Partial update of a webhook; `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct WebhookUpdate {
    /// New URL.
    pub url: Option<String>,
    /// New secret; `Some(None)` clears it.
    pub secret: Option<Option<String>>,
    /// New event set.
    pub events: Option<Vec<String>>,
    /// New body encoding.
    pub content_type: Option<ContentType>,
    /// New active flag.
    pub active: Option<bool>,
}

/// Durable record of a triggered repository/run event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Event identifier (UUID).
    pub id: String,
    /// Repository the event happened in.
    pub repository_id: String,
    /// Event name.
    pub event_type: String,
    /// Optional action (`opened`, `completed`, ...).
    pub action: Option<String>,
    /// Event payload as passed to `trigger`.
    pub payload: Value,
    /// When the event was recorded.
    pub created_at: DateTime<Utc>,
}

/// Observable state of a delivery derived from its stored fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Not attempted yet.
    Pending,
    /// Failed but another attempt is scheduled.
    RetryScheduled,
    /// Delivered with a 2xx response.
    Delivered,
    /// Failed permanently.
    Failed,
}

/// One delivery of an event to one webhook, updated in place across retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookDelivery {
    /// Delivery identifier (UUID).
    pub id: String,
    /// Target webhook.
    pub webhook_id: String,
    /// Event this delivery belongs to (`None` for pings and redeliveries of pings).
    pub event_id: Option<String>,
    /// Correlation key sent as `X-Hub-Delivery`.
    pub guid: String,
    /// Event name.
    pub event_type: String,
    /// Target URL at creation time.
    pub url: String,
    /// Serialized request body.
    pub payload: String,
    /// Headers sent with the last attempt.
    pub request_headers: BTreeMap<String, String>,
    /// Attempts made so far.
    pub attempts: i64,
    /// Whether the last attempt succeeded.
    pub success: bool,
    /// HTTP status of the last attempt.
    pub status_code: Option<i64>,
    /// Duration of the last attempt.
    pub duration_ms: Option<i64>,
    /// Response headers of the last attempt.
    pub response_headers: Option<BTreeMap<String, String>>,
    /// Response body snippet of the last attempt.
    pub response_body: Option<String>,
    /// Error message of the last attempt.
    pub error: Option<String>,
    /// Next scheduled retry; always `None` once terminal.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// When the delivery was created.
    pub created_at: DateTime<Utc>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
    /// When the delivery became terminal.
    pub completed_at: Option<DateTime<Utc>>,
}

impl WebhookDelivery {
    /// Derived delivery state.
    pub fn state(&self) -> DeliveryState {
        if self.success {
            DeliveryState::Delivered
        } else if self.completed_at.is_some() {
            DeliveryState::Failed
        } else if self.attempts > 0 {
            DeliveryState::RetryScheduled
        } else {
            DeliveryState::Pending
        }
    }

    /// Terminal deliveries are never attempted again.
    pub fn is_terminal(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// Fields for creating a delivery record.
#[derive(Debug, Clone)]
pub struct NewDelivery {
    /// Target webhook.
    pub webhook_id: String,
    /// Originating event.
    pub event_id: Option<String>,
    /// Event name.
    pub event_type: String,
    /// Target URL.
    pub url: String,
    /// Serialized request body.
    pub payload: String,
    /// When the retry sweep may pick the delivery up if its first attempt
    /// never runs (for example because the process stopped).
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Result of a single delivery attempt, written back onto the delivery row.
#[derive(Debug, Clone, Default)]
pub struct DeliveryAttempt {
    /// Attempt number (1-based).
    pub attempt: i64,
    /// 2xx response received.
    pub success: bool,
    /// HTTP status, if a response arrived.
    pub status_code: Option<i64>,
    /// Round trip duration.
    pub duration_ms: i64,
    /// Headers sent.
    pub request_headers: BTreeMap<String, String>,
    /// Headers received.
    pub response_headers: Option<BTreeMap<String, String>>,
    /// Body snippet received.
    pub response_body: Option<String>,
    /// Error message.
    pub error: Option<String>,
    /// Next retry, or `None` when this attempt is terminal.
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl DeliveryAttempt {
    /// An attempt is terminal when it succeeded or no retry is scheduled.
    pub fn is_terminal(&self) -> bool {
        self.success || self.next_retry_at.is_none()
    }
}

/// A run to be created by the materializer.
#[derive(Debug, Clone)]
pub struct NewRun {
    /// Source workflow.
    pub workflow_id: String,
    /// Owning repository.
    pub repository_id: String,
    /// Owning organization.
    pub organization_id: Option<String>,
    /// Display name.
    pub name: String,
    /// Trigger event.
    pub event: String,
    /// Commit.
    pub head_sha: String,
    /// Branch.
    pub head_branch: Option<String>,
    /// Actor.
    pub actor: Option<String>,
}

/// A job to be created together with its run.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Job key.
    pub name: String,
    /// Display name.
    pub display_name: String,
    /// Dependencies.
    pub needs: Vec<String>,
    /// Requirement labels.
    pub runs_on: Vec<String>,
    /// Environment.
    pub env: BTreeMap<String, String>,
    /// Strategy.
    pub strategy: Option<Value>,
    /// Deployment environment.
    pub environment: Option<String>,
    /// Image override.
    pub image: Option<String>,
    /// Timeout.
    pub timeout_minutes: Option<i64>,
    /// Priority.
    pub priority: i64,
    /// Steps in execution order.
    pub steps: Vec<NewStep>,
}

/// A step to be created together with its job.
#[derive(Debug, Clone)]
pub struct NewStep {
    /// Display name.
    pub name: String,
    /// Action reference.
    pub uses: Option<String>,
    /// Shell command.
    pub run: Option<String>,
    /// Action parameters.
    pub params: BTreeMap<String, String>,
    /// Environment.
    pub env: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            Status::Queued,
            Status::InProgress,
            Status::Completed,
            Status::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<Status>().unwrap(), status);
        }
        assert!("running".parse::<Status>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!Status::Queued.is_terminal());
        assert!(!Status::InProgress.is_terminal());
        assert!(Status::Completed.is_terminal());
        assert!(Status::Cancelled.is_terminal());
    }

    #[test]
    fn test_webhook_subscription() {
        let now = Utc::now();
        let mut hook = Webhook {
            id: "h".to_string(),
            repository_id: "r".to_string(),
            url: "https://example.com/hook".to_string(),
            secret: Some("s3cret".to_string()),
            events: vec!["push".to_string()],
            content_type: ContentType::Json,
            active: true,
            created_at: now,
            updated_at: now,
        };
        assert!(hook.subscribes_to("push"));
        assert!(!hook.subscribes_to("pull_request"));

        hook.events = vec!["*".to_string()];
        assert!(hook.subscribes_to("pull_request"));

        let debug = format!("{:?}", hook);
        assert!(!debug.contains("s3cret"));
    }

    #[test]
    fn test_delivery_state() {
        let now = Utc::now();
        let mut delivery = WebhookDelivery {
            id: "d".to_string(),
            webhook_id: "h".to_string(),
            event_id: None,
            guid: "g".to_string(),
            event_type: "push".to_string(),
            url: "https://example.com".to_string(),
            payload: "{}".to_string(),
            request_headers: BTreeMap::new(),
            attempts: 0,
            success: false,
            status_code: None,
            duration_ms: None,
            response_headers: None,
            response_body: None,
            error: None,
            next_retry_at: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        assert_eq!(delivery.state(), DeliveryState::Pending);

        delivery.attempts = 1;
        delivery.next_retry_at = Some(now);
        assert_eq!(delivery.state(), DeliveryState::RetryScheduled);

        delivery.next_retry_at = None;
        delivery.completed_at = Some(now);
        assert_eq!(delivery.state(), DeliveryState::Failed);

        delivery.success = true;
        assert_eq!(delivery.state(), DeliveryState::Delivered);
    }
}
