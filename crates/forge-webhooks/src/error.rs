// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for webhook management and delivery.

use forge_core::CoreError;

/// Result type using WebhookError
pub type Result<T> = std::result::Result<T, WebhookError>;

/// Errors returned by the webhook dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The target URL is not an absolute http(s) URL.
    #[error("invalid webhook url '{url}': {reason}")]
    InvalidUrl {
        /// The rejected URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The event name is not one webhooks can subscribe to.
    #[error("unknown event type '{0}'")]
    UnknownEvent(String),

    /// A webhook must subscribe to at least one event.
    #[error("webhook must subscribe to at least one event")]
    NoEvents,

    /// Webhook not found.
    #[error("webhook '{0}' not found")]
    WebhookNotFound(String),

    /// Delivery not found.
    #[error("delivery '{0}' not found")]
    DeliveryNotFound(String),

    /// The request body could not be signed.
    #[error(transparent)]
    Signature(#[from] SignatureError),

    /// The HTTP client could not be built.
    #[error("http client: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Storage failure.
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl WebhookError {
    /// Whether the caller supplied bad input.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidUrl { .. } | Self::UnknownEvent(_) | Self::NoEvents
        )
    }
}

/// Inbound signature verification failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    /// No signature header on a request that requires one.
    #[error("missing signature header")]
    Missing,

    /// Header is not `sha256=<hex>`.
    #[error("malformed signature header")]
    Malformed,

    /// Signature does not match the body.
    #[error("signature mismatch")]
    Mismatch,

    /// The secret cannot be used as an HMAC key.
    #[error("invalid signing key")]
    InvalidKey,
}
