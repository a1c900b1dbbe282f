// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run and job state-change events.
//!
//! The materializer and scheduler report transitions through a [`RunEventSink`];
//! the webhook dispatcher is the production sink.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::models::{Job, WorkflowRun};

/// Event name for run-level transitions.
pub const WORKFLOW_RUN_EVENT: &str = "workflow_run";

/// Event name for job-level transitions.
pub const WORKFLOW_JOB_EVENT: &str = "workflow_job";

/// A state transition worth telling the outside world about.
#[derive(Debug, Clone, PartialEq)]
pub struct RunEvent {
    /// Repository the run belongs to.
    pub repository_id: String,
    /// `workflow_run` or `workflow_job`.
    pub event_type: String,
    /// `requested`, `in_progress`, `completed`, `cancelled`.
    pub action: String,
    /// Snapshot of the run or job.
    pub payload: Value,
}

impl RunEvent {
    /// Run-level event carrying a run snapshot.
    pub fn workflow_run(run: &WorkflowRun, action: &str) -> Self {
        Self {
            repository_id: run.repository_id.clone(),
            event_type: WORKFLOW_RUN_EVENT.to_string(),
            action: action.to_string(),
            payload: json!({ "workflow_run": run }),
        }
    }

    /// Job-level event carrying a job snapshot.
    pub fn workflow_job(repository_id: &str, job: &Job, action: &str) -> Self {
        Self {
            repository_id: repository_id.to_string(),
            event_type: WORKFLOW_JOB_EVENT.to_string(),
            action: action.to_string(),
            payload: json!({ "workflow_job": job }),
        }
    }
}

/// Receiver of run events. Emitting never fails; sinks log their own errors.
#[async_trait]
pub trait RunEventSink: Send + Sync {
    /// Handle one event.
    async fn emit(&self, event: RunEvent);
}

/// Sink that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

#[async_trait]
impl RunEventSink for NoopEventSink {
    async fn emit(&self, _event: RunEvent) {}
}
