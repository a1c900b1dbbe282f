// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for webhook delivery tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use forge_core::models::{ContentType, NewWebhook, Webhook};
use forge_core::persistence::{Persistence, SqlitePersistence};
use forge_webhooks::{DispatcherConfig, RetryPolicy, WebhookDispatcher};
use tempfile::TempDir;

pub const REPO: &str = "repo-1";

/// Test context; the temp dir must outlive the database.
pub struct Ctx {
    pub _dir: TempDir,
    pub persistence: Arc<dyn Persistence>,
    pub dispatcher: WebhookDispatcher,
}

impl Ctx {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let persistence: Arc<dyn Persistence> = Arc::new(
            SqlitePersistence::from_path(dir.path().join("forge.db"))
                .await
                .expect("open database"),
        );
        let config = DispatcherConfig {
            timeout: Duration::from_secs(5),
            retry: RetryPolicy::DEFAULT,
            ..Default::default()
        };
        let dispatcher =
            WebhookDispatcher::new(persistence.clone(), config).expect("build dispatcher");
        Self {
            _dir: dir,
            persistence,
            dispatcher,
        }
    }

    /// Register an active webhook for [`REPO`].
    pub async fn hook(
        &self,
        url: &str,
        events: &[&str],
        secret: Option<&str>,
        content_type: ContentType,
    ) -> Webhook {
        self.dispatcher
            .create_webhook(NewWebhook {
                repository_id: REPO.to_string(),
                url: url.to_string(),
                secret: secret.map(str::to_string),
                events: events.iter().map(|e| e.to_string()).collect(),
                content_type,
                active: true,
            })
            .await
            .expect("create webhook")
    }

    /// Wait for every spawned delivery attempt.
    pub async fn settle(&self) {
        self.dispatcher.tasks().drain().await;
    }
}
