// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for forge-core.
//!
//! A single error type shared by the materializer, scheduler, log hub and the
//! persistence backends. Each variant carries a stable machine-readable code
//! so the API layer can map it to a response without string matching.

use std::fmt;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while orchestrating runs.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Workflow run was not found.
    RunNotFound {
        /// The run ID that was not found.
        run_id: String,
    },

    /// Job was not found.
    JobNotFound {
        /// The job ID that was not found.
        job_id: String,
    },

    /// Webhook was not found.
    WebhookNotFound {
        /// The webhook ID that was not found.
        webhook_id: String,
    },

    /// Webhook delivery was not found.
    DeliveryNotFound {
        /// The delivery ID that was not found.
        delivery_id: String,
    },

    /// The workflow is disabled and cannot produce runs.
    WorkflowDisabled {
        /// The disabled workflow.
        workflow_id: String,
    },

    /// Workflow content could not be parsed or failed graph validation.
    InvalidWorkflow {
        /// Human readable reason.
        reason: String,
    },

    /// Another run claimed the same per-repository run number.
    RunNumberConflict {
        /// Repository whose counter collided.
        repository_id: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// An external collaborator (job queue, worker registry) failed.
    Collaborator {
        /// Which collaborator failed.
        collaborator: &'static str,
        /// Error details.
        details: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::RunNotFound { .. } => "RUN_NOT_FOUND",
            Self::JobNotFound { .. } => "JOB_NOT_FOUND",
            Self::WebhookNotFound { .. } => "WEBHOOK_NOT_FOUND",
            Self::DeliveryNotFound { .. } => "DELIVERY_NOT_FOUND",
            Self::WorkflowDisabled { .. } => "WORKFLOW_DISABLED",
            Self::InvalidWorkflow { .. } => "INVALID_WORKFLOW",
            Self::RunNumberConflict { .. } => "RUN_NUMBER_CONFLICT",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::Collaborator { .. } => "COLLABORATOR_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether the caller supplied bad input (as opposed to an infrastructure failure).
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::WorkflowDisabled { .. }
                | Self::InvalidWorkflow { .. }
                | Self::ValidationError { .. }
        )
    }

    pub(crate) fn invalid_workflow(reason: impl Into<String>) -> Self {
        Self::InvalidWorkflow {
            reason: reason.into(),
        }
    }

    pub(crate) fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RunNotFound { run_id } => write!(f, "Run '{}' not found", run_id),
            Self::JobNotFound { job_id } => write!(f, "Job '{}' not found", job_id),
            Self::WebhookNotFound { webhook_id } => {
                write!(f, "Webhook '{}' not found", webhook_id)
            }
            Self::DeliveryNotFound { delivery_id } => {
                write!(f, "Delivery '{}' not found", delivery_id)
            }
            Self::WorkflowDisabled { workflow_id } => {
                write!(f, "Workflow '{}' is disabled", workflow_id)
            }
            Self::InvalidWorkflow { reason } => write!(f, "Invalid workflow: {}", reason),
            Self::RunNumberConflict { repository_id } => write!(
                f,
                "Run number conflict for repository '{}'",
                repository_id
            ),
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::Collaborator {
                collaborator,
                details,
            } => write!(f, "{} error: {}", collaborator, details),
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CoreError::DatabaseError {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::DatabaseError {
            operation: "json".to_string(),
            details: err.to_string(),
        }
    }
}
