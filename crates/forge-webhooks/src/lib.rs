// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Forge Webhooks - Signed Event Delivery
//!
//! Delivers repository and run events to per-repository HTTP endpoints.
//! Every delivery is stored before the first attempt and updated in place
//! as attempts are made, so the delivery history survives restarts.
//!
//! # Delivery Flow
//!
//! ```text
//!   trigger(repo, event, payload)
//!          │
//!          ▼
//!   ┌──────────────┐   one row per    ┌──────────────┐   POST + HMAC   ┌──────────┐
//!   │ webhook_event│─────────────────►│   delivery   │────────────────►│ endpoint │
//!   └──────────────┘  matching hook   └──────────────┘                 └──────────┘
//!                                        │      ▲
//!                          5xx / timeout │      │ next_retry_at elapsed
//!                                        ▼      │
//!                                   ┌──────────────┐
//!                                   │ retry worker │
//!                                   └──────────────┘
//! ```
//!
//! # Request Headers
//!
//! | Header | Value |
//! |--------|-------|
//! | `X-Hub-Event` | Event name |
//! | `X-Hub-Delivery` | Delivery guid |
//! | `X-Hub-Signature-256` | `sha256=<hex hmac of body>` when a secret is set |
//! | `Content-Type` | `application/json` or `application/x-www-form-urlencoded` |
//!
//! # Retries
//!
//! Failed attempts with no response or a 5xx/408/429 status are retried up
//! to five attempts in total, waiting 2, 4, 8 and 16 minutes. Other 4xx
//! responses are terminal. See [`retry`].

#![deny(missing_docs)]

/// Error types.
pub mod error;

/// Subscribable event names.
pub mod events;

/// Delivery body envelope.
pub mod payload;

/// Retry classification and schedule.
pub mod retry;

/// HTTP transport.
pub mod sender;

/// HMAC-SHA256 payload signatures.
pub mod signature;

/// Webhook management and delivery.
pub mod dispatcher;

/// Background retry sweep.
pub mod retry_worker;

pub use dispatcher::{DispatcherConfig, TriggerReceipt, WebhookDispatcher};
pub use error::{Result, SignatureError, WebhookError};
pub use payload::EventPayload;
pub use retry::{AttemptResult, RetryPolicy};
pub use retry_worker::{DeliveryRetryWorker, DeliveryRetryWorkerConfig};
