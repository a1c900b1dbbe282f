// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Delivery retry sweep.
//!
//! Periodically picks up deliveries whose `next_retry_at` has passed and
//! hands them back to the dispatcher. This also recovers first attempts lost
//! to a restart, since new deliveries are created with a fallback retry time.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::dispatcher::WebhookDispatcher;

/// Retry sweep configuration.
#[derive(Debug, Clone)]
pub struct DeliveryRetryWorkerConfig {
    /// How often to look for due deliveries
    pub poll_interval: Duration,
    /// Maximum deliveries retried per sweep
    pub batch_size: i64,
}

impl Default for DeliveryRetryWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            batch_size: 100,
        }
    }
}

impl DeliveryRetryWorkerConfig {
    /// Read `FORGE_WEBHOOK_RETRY_INTERVAL_SECS` and `FORGE_WEBHOOK_RETRY_BATCH`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            poll_interval: env::var("FORGE_WEBHOOK_RETRY_INTERVAL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
            batch_size: env::var("FORGE_WEBHOOK_RETRY_BATCH")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.batch_size),
        }
    }
}

/// Background task that retries due deliveries.
pub struct DeliveryRetryWorker {
    dispatcher: WebhookDispatcher,
    config: DeliveryRetryWorkerConfig,
    shutdown: Arc<Notify>,
}

impl DeliveryRetryWorker {
    /// Create a new retry worker.
    pub fn new(dispatcher: WebhookDispatcher, config: DeliveryRetryWorkerConfig) -> Self {
        Self {
            dispatcher,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the sweep loop until shutdown is signalled.
    pub async fn run(self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            batch_size = self.config.batch_size,
            "Delivery retry worker started"
        );

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.notified() => {
                    info!("Delivery retry worker shutting down");
                    break;
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    match self.dispatcher.retry_due(self.config.batch_size).await {
                        Ok(0) => debug!("No deliveries due for retry"),
                        Ok(count) => info!(count = count, "Retrying webhook deliveries"),
                        Err(e) => error!(error = %e, "Failed to retry due deliveries"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = DeliveryRetryWorkerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.batch_size, 100);
    }
}
