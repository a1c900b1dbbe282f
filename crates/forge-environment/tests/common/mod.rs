// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for forge-environment integration tests.
//!
//! A full [`ForgeRuntime`] over a file-backed SQLite database and the
//! [`MockBackend`], with short poll intervals.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use forge_core::models::{Job, Status, WorkflowRun};
use forge_core::persistence::{Persistence, SqlitePersistence};
use forge_core::scheduler::Worker;
use forge_core::workflow::{TriggerContext, Workflow, WorkflowState};
use forge_core::{LogHubSweeperConfig, SchedulerConfig};
use forge_environment::ExecutorConfig;
use forge_environment::backend::MockBackend;
use forge_environment::runtime::ForgeRuntime;
use forge_environment::secrets::InMemorySecretResolver;
use forge_webhooks::DeliveryRetryWorkerConfig;
use tempfile::TempDir;

pub const REPO: &str = "repo-1";
pub const ORG: &str = "org-1";

/// Open a database file under `dir`.
pub async fn database(dir: &TempDir) -> Arc<dyn Persistence> {
    Arc::new(
        SqlitePersistence::from_path(dir.path().join("forge.db"))
            .await
            .expect("open database"),
    )
}

/// An enabled workflow in [`REPO`].
pub fn workflow(content: &str) -> Workflow {
    Workflow {
        id: "wf-ci".to_string(),
        repository_id: REPO.to_string(),
        organization_id: Some(ORG.to_string()),
        name: "ci.yml".to_string(),
        path: ".forge/workflows/ci.yml".to_string(),
        content: content.to_string(),
        state: WorkflowState::Active,
    }
}

pub fn push() -> TriggerContext {
    TriggerContext::new("push", "0123abcd").with_branch("main")
}

/// Runtime with fast loops and the given backend and secrets.
pub async fn start(
    persistence: Arc<dyn Persistence>,
    backend: Arc<MockBackend>,
    secrets: InMemorySecretResolver,
    job_timeout: Duration,
) -> ForgeRuntime {
    ForgeRuntime::builder()
        .persistence(persistence)
        .backend(backend)
        .secrets(Arc::new(secrets))
        .workers(vec![Worker::new("w1", ["linux"])])
        .scheduler_config(SchedulerConfig {
            poll_interval: Duration::from_millis(20),
            ..Default::default()
        })
        .executor_config(ExecutorConfig {
            default_image: "alpine:3".to_string(),
            default_timeout: job_timeout,
        })
        .sweeper_config(LogHubSweeperConfig {
            poll_interval: Duration::from_millis(50),
        })
        .retry_config(DeliveryRetryWorkerConfig {
            poll_interval: Duration::from_millis(50),
            ..Default::default()
        })
        .shutdown_timeout(Duration::from_millis(500))
        .build()
        .expect("build runtime")
        .start()
        .await
        .expect("start runtime")
}

/// Test context; the temp dir must outlive the database.
pub struct Ctx {
    pub _dir: TempDir,
    pub backend: Arc<MockBackend>,
    pub runtime: ForgeRuntime,
}

impl Ctx {
    pub async fn new(backend: MockBackend) -> Self {
        Self::with(backend, InMemorySecretResolver::new(), Duration::from_secs(60)).await
    }

    pub async fn with(
        backend: MockBackend,
        secrets: InMemorySecretResolver,
        job_timeout: Duration,
    ) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let persistence = database(&dir).await;
        let backend = Arc::new(backend);
        let runtime = start(persistence, backend.clone(), secrets, job_timeout).await;
        Self {
            _dir: dir,
            backend,
            runtime,
        }
    }

    pub fn persistence(&self) -> &Arc<dyn Persistence> {
        self.runtime.persistence()
    }

    /// Materialize `content` for a push.
    pub async fn trigger(&self, content: &str) -> WorkflowRun {
        self.runtime
            .materializer()
            .materialize(&workflow(content), &push())
            .await
            .expect("materialize")
    }

    /// Wait until the run is terminal and its jobs have finished executing.
    pub async fn wait_run(&self, run_id: &str) -> WorkflowRun {
        for _ in 0..400 {
            let run = self
                .persistence()
                .get_run(run_id)
                .await
                .unwrap()
                .expect("run exists");
            if run.status.is_terminal() && self.runtime.executor().running_jobs() == 0 {
                self.runtime.scheduler().tasks().drain().await;
                return run;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {} did not finish", run_id);
    }

    /// Wait until job `name` of `run_id` has its first step running.
    pub async fn wait_step_running(&self, run_id: &str, name: &str) -> Job {
        for _ in 0..400 {
            let job = self.job(run_id, name).await;
            let steps = self.persistence().list_steps(&job.id).await.unwrap();
            if steps.first().is_some_and(|s| s.status == Status::InProgress) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never started a step", name);
    }

    pub async fn job(&self, run_id: &str, name: &str) -> Job {
        self.persistence()
            .list_jobs(run_id)
            .await
            .unwrap()
            .into_iter()
            .find(|j| j.name == name)
            .unwrap_or_else(|| panic!("no job {}", name))
    }
}
