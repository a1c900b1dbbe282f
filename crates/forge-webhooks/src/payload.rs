// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Delivery body envelope and encoding.

use chrono::{DateTime, Utc};
use forge_core::models::ContentType;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Data passed to a trigger.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventPayload {
    /// Sub-type of the event (`opened`, `completed`, ...).
    pub action: Option<String>,
    /// Who caused the event.
    pub sender: Option<Value>,
    /// Event-specific body.
    pub data: Option<Value>,
}

impl EventPayload {
    /// Payload carrying `data`.
    pub fn new(data: Value) -> Self {
        Self {
            data: Some(data),
            ..Default::default()
        }
    }

    /// Set the action.
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    /// Set the sender.
    pub fn with_sender(mut self, sender: Value) -> Self {
        self.sender = Some(sender);
        self
    }
}

/// Repository reference inside an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryRef {
    /// Repository identifier.
    pub id: String,
}

/// JSON body of every delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Event name.
    pub event: String,
    /// Event action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Source repository.
    pub repository: RepositoryRef,
    /// Who caused the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<Value>,
    /// Event-specific body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// When the event was raised.
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    /// Wrap `payload` for `event` in `repository_id`.
    pub fn new(repository_id: &str, event: &str, payload: EventPayload) -> Self {
        Self {
            event: event.to_string(),
            action: payload.action,
            repository: RepositoryRef {
                id: repository_id.to_string(),
            },
            sender: payload.sender,
            data: payload.data,
            timestamp: Utc::now(),
        }
    }

    /// Serialize to the JSON stored on the delivery.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Request body for a stored JSON payload. Form webhooks receive the JSON in
/// a urlencoded `payload` field.
pub fn encode_body(content_type: ContentType, json: &str) -> String {
    match content_type {
        ContentType::Json => json.to_string(),
        ContentType::Form => format!("payload={}", urlencoding::encode(json)),
    }
}
