// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backend trait definitions.
//!
//! Defines the abstract interface for orchestration backends.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forge_core::models::Step;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Label attached to every unit so teardown can find it by job.
pub const JOB_LABEL: &str = "forge.job-id";

/// Errors from backend operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackendError {
    /// The backend tool is not installed or not reachable.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// The execution unit could not be created.
    #[error("Failed to create execution unit: {0}")]
    CreateFailed(String),

    /// Teardown of an existing unit failed.
    #[error("Teardown failed: {0}")]
    TeardownFailed(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Everything needed to create one isolated execution unit for a job.
#[derive(Debug, Clone)]
pub struct UnitSpec {
    /// Job ID; every resource of the unit is tagged with it.
    pub job_id: String,
    /// Run ID
    pub run_id: String,
    /// Job name within its run
    pub job_name: String,
    /// Image to run
    pub image: String,
    /// Environment, secrets included
    pub env: BTreeMap<String, String>,
    /// Rendered shell script
    pub script: String,
    /// Structured steps the script was rendered from
    pub steps: Vec<Step>,
}

impl UnitSpec {
    /// Name of the unit on the backend.
    pub fn unit_name(&self) -> String {
        unit_name(&self.job_id)
    }
}

/// Backend name for the unit of `job_id`.
pub fn unit_name(job_id: &str) -> String {
    format!("forge-job-{}", job_id)
}

/// Stream an output line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
}

/// One line of unit output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    /// Origin stream
    pub stream: OutputStream,
    /// Line without the trailing newline
    pub text: String,
}

impl OutputLine {
    /// Stdout line.
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stdout,
            text: text.into(),
        }
    }

    /// Stderr line.
    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            stream: OutputStream::Stderr,
            text: text.into(),
        }
    }
}

/// How a unit ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitExit {
    /// Exit code of the unit's main process (`-1` when unknown)
    pub exit_code: i32,
    /// Backend-level failure, if any
    pub error: Option<String>,
}

impl UnitExit {
    /// Exit with `code`.
    pub fn code(exit_code: i32) -> Self {
        Self {
            exit_code,
            error: None,
        }
    }

    /// The backend lost track of the unit.
    pub fn lost(error: impl Into<String>) -> Self {
        Self {
            exit_code: -1,
            error: Some(error.into()),
        }
    }

    /// Whether the unit exited cleanly.
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.error.is_none()
    }
}

/// Handle for a created unit.
#[derive(Debug, Clone)]
pub struct UnitHandle {
    /// Backend identifier (container name, pod name)
    pub handle_id: String,
    /// Job ID
    pub job_id: String,
    /// When the unit was created
    pub started_at: DateTime<Utc>,
}

/// A created unit with its push-based output and completion channels.
///
/// `lines` closes once the unit's output streams end; `exit` resolves with
/// the terminal signal.
#[derive(Debug)]
pub struct LaunchedUnit {
    /// Unit handle
    pub handle: UnitHandle,
    /// Live output lines
    pub lines: mpsc::Receiver<OutputLine>,
    /// Completion signal
    pub exit: oneshot::Receiver<UnitExit>,
}

/// Trait for orchestration backends.
///
/// Backends are PURE execution engines - they do NOT access the database.
/// Step and job bookkeeping is handled by the caller.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Backend type identifier (e.g., "container", "mock")
    fn backend_type(&self) -> &'static str;

    /// Create and start the unit for `spec`. Returns once the unit is running.
    async fn create(&self, spec: &UnitSpec) -> Result<LaunchedUnit>;

    /// Remove every resource tagged with `job_id`. Idempotent: nothing to
    /// remove is not an error.
    async fn teardown(&self, job_id: &str) -> Result<()>;
}
