// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Webhook management, triggering and delivery attempts.
//!
//! `trigger` returns once the event and its delivery rows are stored; the
//! HTTP attempts run on a background task tracker. Every attempt, first or
//! retried, goes through [`WebhookDispatcher::attempt_delivery`] and updates
//! the same delivery row.

use std::collections::BTreeMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use forge_core::CoreError;
use forge_core::events::{RunEvent, RunEventSink};
use forge_core::models::{
    DeliveryAttempt, NewDelivery, NewWebhook, Webhook, WebhookDelivery, WebhookUpdate,
};
use forge_core::persistence::Persistence;
use forge_core::tasks::BackgroundTasks;
use serde_json::json;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{Result, WebhookError};
use crate::events::{self, PING};
use crate::payload::{Envelope, EventPayload, encode_body};
use crate::retry::{AttemptResult, RetryPolicy};
use crate::sender::{DELIVERY_HEADER, EVENT_HEADER, HttpSender, SendOutcome};
use crate::signature::{SIGNATURE_HEADER, sign};

/// Configuration for the webhook dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Per-request timeout.
    pub timeout: Duration,
    /// Retry schedule.
    pub retry: RetryPolicy,
    /// How long a claimed delivery is hidden from other sweeps.
    pub lease: Duration,
    /// `User-Agent` header.
    pub user_agent: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::DEFAULT,
            lease: Duration::from_secs(300),
            user_agent: format!("forge-hookshot/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl DispatcherConfig {
    /// Read `FORGE_WEBHOOK_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            timeout: env::var("FORGE_WEBHOOK_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            ..defaults
        }
    }
}

/// Outcome of [`WebhookDispatcher::trigger`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerReceipt {
    /// Stored event.
    pub event_id: String,
    /// One delivery per matching webhook.
    pub deliveries: Vec<String>,
}

/// Webhook dispatcher.
#[derive(Clone)]
pub struct WebhookDispatcher {
    persistence: Arc<dyn Persistence>,
    sender: HttpSender,
    config: DispatcherConfig,
    tasks: BackgroundTasks,
}

impl WebhookDispatcher {
    /// Create a dispatcher.
    pub fn new(persistence: Arc<dyn Persistence>, config: DispatcherConfig) -> Result<Self> {
        let sender = HttpSender::new(config.timeout, &config.user_agent)?;
        Ok(Self {
            persistence,
            sender,
            config,
            tasks: BackgroundTasks::new("webhook-deliveries"),
        })
    }

    /// Tracker of in-flight delivery attempts.
    pub fn tasks(&self) -> &BackgroundTasks {
        &self.tasks
    }

    /// Retry schedule in use.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.config.retry
    }

    // ------------------------------------------------------------------------
    // Management
    // ------------------------------------------------------------------------

    /// Validate and store a webhook.
    pub async fn create_webhook(&self, mut webhook: NewWebhook) -> Result<Webhook> {
        validate_url(&webhook.url)?;
        webhook.events = events::validate_subscriptions(&webhook.events)?;

        let webhook = self.persistence.create_webhook(&webhook).await?;
        info!(
            webhook_id = %webhook.id,
            repository_id = %webhook.repository_id,
            events = ?webhook.events,
            "Webhook created"
        );
        Ok(webhook)
    }

    /// Validate and apply a partial update.
    pub async fn update_webhook(&self, webhook_id: &str, mut update: WebhookUpdate) -> Result<Webhook> {
        if let Some(url) = &update.url {
            validate_url(url)?;
        }
        if let Some(events) = &update.events {
            update.events = Some(events::validate_subscriptions(events)?);
        }

        self.persistence
            .update_webhook(webhook_id, &update)
            .await?
            .ok_or_else(|| WebhookError::WebhookNotFound(webhook_id.to_string()))
    }

    /// Delete a webhook and its delivery history.
    pub async fn delete_webhook(&self, webhook_id: &str) -> Result<()> {
        if !self.persistence.delete_webhook(webhook_id).await? {
            return Err(WebhookError::WebhookNotFound(webhook_id.to_string()));
        }
        info!(webhook_id = %webhook_id, "Webhook deleted");
        Ok(())
    }

    /// Webhooks of a repository.
    pub async fn list_webhooks(&self, repository_id: &str) -> Result<Vec<Webhook>> {
        Ok(self.persistence.list_webhooks(repository_id).await?)
    }

    /// Delivery history of a webhook, newest first.
    pub async fn deliveries(&self, webhook_id: &str, limit: i64) -> Result<Vec<WebhookDelivery>> {
        Ok(self.persistence.list_deliveries(webhook_id, limit).await?)
    }

    // ------------------------------------------------------------------------
    // Delivery
    // ------------------------------------------------------------------------

    /// Record `event_type` for `repository_id` and start one delivery per
    /// active webhook subscribed to it. Returns before any request is sent.
    pub async fn trigger(
        &self,
        repository_id: &str,
        event_type: &str,
        payload: EventPayload,
    ) -> Result<TriggerReceipt> {
        if !events::is_known(event_type) {
            return Err(WebhookError::UnknownEvent(event_type.to_string()));
        }

        let envelope = Envelope::new(repository_id, event_type, payload);
        let body = envelope.to_json().map_err(CoreError::from)?;
        let stored = serde_json::to_value(&envelope).map_err(CoreError::from)?;

        let event = self
            .persistence
            .record_webhook_event(repository_id, event_type, envelope.action.as_deref(), &stored)
            .await?;

        let hooks = self
            .persistence
            .list_active_webhooks_for_event(repository_id, event_type)
            .await?;
        if hooks.is_empty() {
            debug!(repository_id = %repository_id, event = %event_type, "No webhooks subscribed");
        }

        let fallback = self.lease_deadline(Utc::now());
        let mut deliveries = Vec::with_capacity(hooks.len());
        for hook in hooks {
            let delivery = self
                .persistence
                .create_delivery(&NewDelivery {
                    webhook_id: hook.id.clone(),
                    event_id: Some(event.id.clone()),
                    event_type: event_type.to_string(),
                    url: hook.url.clone(),
                    payload: body.clone(),
                    next_retry_at: Some(fallback),
                })
                .await?;
            self.spawn_attempt(delivery.id.clone());
            deliveries.push(delivery.id);
        }

        info!(
            event_id = %event.id,
            repository_id = %repository_id,
            event = %event_type,
            deliveries = deliveries.len(),
            "Webhook event triggered"
        );

        Ok(TriggerReceipt {
            event_id: event.id,
            deliveries,
        })
    }

    /// Send a `ping` to one webhook and wait for the first attempt.
    pub async fn ping(&self, webhook_id: &str) -> Result<WebhookDelivery> {
        let webhook = self
            .persistence
            .get_webhook(webhook_id)
            .await?
            .ok_or_else(|| WebhookError::WebhookNotFound(webhook_id.to_string()))?;

        let payload = EventPayload::new(json!({
            "hook_id": webhook.id,
            "events": webhook.events,
        }));
        let envelope = Envelope::new(&webhook.repository_id, PING, payload);

        let delivery = self
            .persistence
            .create_delivery(&NewDelivery {
                webhook_id: webhook.id.clone(),
                event_id: None,
                event_type: PING.to_string(),
                url: webhook.url.clone(),
                payload: envelope.to_json().map_err(CoreError::from)?,
                next_retry_at: None,
            })
            .await?;

        self.attempt_delivery(&delivery.id).await
    }

    /// Send a stored delivery again as a new delivery with a fresh guid.
    pub async fn redeliver(&self, delivery_id: &str) -> Result<WebhookDelivery> {
        let original = self
            .persistence
            .get_delivery(delivery_id)
            .await?
            .ok_or_else(|| WebhookError::DeliveryNotFound(delivery_id.to_string()))?;

        let delivery = self
            .persistence
            .create_delivery(&NewDelivery {
                webhook_id: original.webhook_id.clone(),
                event_id: original.event_id.clone(),
                event_type: original.event_type.clone(),
                url: original.url.clone(),
                payload: original.payload.clone(),
                next_retry_at: Some(self.lease_deadline(Utc::now())),
            })
            .await?;

        info!(
            delivery_id = %delivery.id,
            original_id = %original.id,
            "Redelivery scheduled"
        );
        self.spawn_attempt(delivery.id.clone());
        Ok(delivery)
    }

    /// Retry every delivery whose retry time has elapsed.
    pub async fn retry_due(&self, limit: i64) -> Result<usize> {
        self.retry_due_at(Utc::now(), limit).await
    }

    /// Retry deliveries due at `now`. Each one is leased first so two sweeps
    /// never attempt the same delivery.
    pub async fn retry_due_at(&self, now: DateTime<Utc>, limit: i64) -> Result<usize> {
        let due = self
            .persistence
            .list_due_deliveries(now, self.config.retry.max_attempts, limit)
            .await?;

        let until = self.lease_deadline(now);
        let mut dispatched = 0;
        for delivery in due {
            if self
                .persistence
                .lease_delivery(&delivery.id, delivery.attempts, now, until)
                .await?
            {
                debug!(delivery_id = %delivery.id, attempts = delivery.attempts, "Retrying delivery");
                self.spawn_attempt(delivery.id);
                dispatched += 1;
            }
        }
        Ok(dispatched)
    }

    /// Make the next attempt of a delivery and record its outcome.
    pub async fn attempt_delivery(&self, delivery_id: &str) -> Result<WebhookDelivery> {
        let delivery = self
            .persistence
            .get_delivery(delivery_id)
            .await?
            .ok_or_else(|| WebhookError::DeliveryNotFound(delivery_id.to_string()))?;
        if delivery.is_terminal() {
            return Ok(delivery);
        }
        let webhook = self
            .persistence
            .get_webhook(&delivery.webhook_id)
            .await?
            .ok_or_else(|| WebhookError::WebhookNotFound(delivery.webhook_id.clone()))?;

        let attempt = delivery.attempts + 1;
        let body = encode_body(webhook.content_type, &delivery.payload);

        let mut headers = BTreeMap::new();
        headers.insert(
            "Content-Type".to_string(),
            webhook.content_type.mime().to_string(),
        );
        headers.insert(EVENT_HEADER.to_string(), delivery.event_type.clone());
        headers.insert(DELIVERY_HEADER.to_string(), delivery.guid.clone());
        if let Some(secret) = webhook.secret.as_deref().filter(|s| !s.is_empty()) {
            headers.insert(SIGNATURE_HEADER.to_string(), sign(body.as_bytes(), secret)?);
        }

        let outcome = if webhook.active {
            self.sender.post(&delivery.url, &headers, body).await
        } else {
            SendOutcome {
                result: AttemptResult::RequestError,
                duration: Duration::ZERO,
                response_headers: None,
                response_body: None,
                error: Some("webhook is inactive".to_string()),
            }
        };

        let next_retry_at = self
            .config
            .retry
            .next_retry_at(attempt, outcome.result, Utc::now());
        let success = outcome.result.is_success();

        let record = DeliveryAttempt {
            attempt,
            success,
            status_code: outcome.status_code().map(i64::from),
            duration_ms: outcome.duration.as_millis() as i64,
            request_headers: headers,
            response_headers: outcome.response_headers,
            response_body: outcome.response_body,
            error: outcome.error.clone(),
            next_retry_at,
        };

        if !self
            .persistence
            .record_delivery_attempt(delivery_id, &record)
            .await?
        {
            debug!(delivery_id = %delivery_id, attempt = attempt, "Attempt already recorded elsewhere");
        } else if success {
            info!(
                delivery_id = %delivery_id,
                webhook_id = %webhook.id,
                attempt = attempt,
                status = ?record.status_code,
                "Webhook delivered"
            );
        } else if let Some(at) = next_retry_at {
            warn!(
                delivery_id = %delivery_id,
                webhook_id = %webhook.id,
                attempt = attempt,
                error = ?outcome.error,
                next_retry_at = %at,
                "Webhook delivery failed, retry scheduled"
            );
        } else {
            warn!(
                delivery_id = %delivery_id,
                webhook_id = %webhook.id,
                attempt = attempt,
                error = ?outcome.error,
                "Webhook delivery failed permanently"
            );
        }

        self.persistence
            .get_delivery(delivery_id)
            .await?
            .ok_or_else(|| WebhookError::DeliveryNotFound(delivery_id.to_string()))
    }

    /// Stop accepting deliveries and wait for in-flight attempts.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.tasks.shutdown(timeout).await
    }

    fn spawn_attempt(&self, delivery_id: String) {
        let dispatcher = self.clone();
        self.tasks.spawn_fallible("webhook-delivery", async move {
            dispatcher.attempt_delivery(&delivery_id).await.map(|_| ())
        });
    }

    fn lease_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let lease = TimeDelta::from_std(self.config.lease).unwrap_or(TimeDelta::minutes(5));
        now + lease
    }
}

#[async_trait]
impl RunEventSink for WebhookDispatcher {
    async fn emit(&self, event: RunEvent) {
        let payload = EventPayload::new(event.payload).with_action(event.action);
        if let Err(e) = self
            .trigger(&event.repository_id, &event.event_type, payload)
            .await
        {
            warn!(
                repository_id = %event.repository_id,
                event = %event.event_type,
                error = %e,
                "Failed to trigger webhooks for run event"
            );
        }
    }
}

fn validate_url(raw: &str) -> Result<()> {
    let invalid = |reason: &str| WebhookError::InvalidUrl {
        url: raw.to_string(),
        reason: reason.to_string(),
    };

    let url = Url::parse(raw).map_err(|e| invalid(&e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid("scheme must be http or https"));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(invalid("missing host"));
    }
    Ok(())
}
