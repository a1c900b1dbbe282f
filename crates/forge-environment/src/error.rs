// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for forge-environment.

use thiserror::Error;

/// Environment errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Orchestration backend call failed.
    #[error("Backend error: {0}")]
    Backend(#[from] crate::backend::BackendError),

    /// Secrets could not be loaded or resolved.
    #[error("Secret error: {0}")]
    Secret(#[from] crate::secrets::SecretError),

    /// Core persistence or scheduling failed.
    #[error("Core error: {0}")]
    Core(#[from] forge_core::CoreError),

    /// Webhook dispatcher failed.
    #[error("Webhook error: {0}")]
    Webhook(#[from] forge_webhooks::WebhookError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type using Environment Error.
pub type Result<T> = std::result::Result<T, Error>;
