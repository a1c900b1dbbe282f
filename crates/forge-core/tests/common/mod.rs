// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for forge-core integration tests.
//!
//! Everything runs against an in-memory SQLite database with the in-memory
//! queue and worker registry, and a scripted executor whose behavior is set
//! per job name.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use tokio_util::sync::CancellationToken;

use forge_core::events::{RunEvent, RunEventSink};
use forge_core::models::{Conclusion, WorkflowRun};
use forge_core::persistence::{Persistence, SqlitePersistence};
use forge_core::scheduler::{
    DispatchedJob, InMemoryJobQueue, InMemoryWorkerRegistry, JobExecutor, JobOutcome,
    JobScheduler, SchedulerConfig, Worker,
};
use forge_core::workflow::{Workflow, WorkflowState, YamlWorkflowParser};
use forge_core::RunMaterializer;

/// Fresh in-memory database with migrations applied.
pub async fn sqlite() -> Arc<dyn Persistence> {
    Arc::new(SqlitePersistence::new(sqlite_pool().await))
}

/// Migrated in-memory pool, for tests that reach past the persistence API.
pub async fn sqlite_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("Failed to create in-memory SQLite pool");
    forge_core::migrations::run_sqlite(&pool)
        .await
        .expect("Failed to run migrations");
    pool
}

/// An enabled workflow in repository `repo-1`.
pub fn workflow(content: &str) -> Workflow {
    Workflow {
        id: "wf-ci".to_string(),
        repository_id: "repo-1".to_string(),
        organization_id: Some("org-1".to_string()),
        name: "ci.yml".to_string(),
        path: ".forge/workflows/ci.yml".to_string(),
        content: content.to_string(),
        state: WorkflowState::Active,
    }
}

/// What the scripted executor does with a job.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Every step succeeds.
    Succeed,
    /// The step with this number exits non-zero.
    FailAt(i64),
    /// The executor panics before running any step.
    Panic,
    /// Blocks until cancelled.
    Hang,
}

/// Executor driven by per-job-name behaviors. Unlisted jobs succeed.
#[derive(Default)]
pub struct ScriptedExecutor {
    persistence: Option<Arc<dyn Persistence>>,
    behaviors: Mutex<HashMap<String, Behavior>>,
    started: Mutex<Vec<String>>,
    steps: Mutex<Vec<(String, i64)>>,
    tokens: Mutex<HashMap<String, CancellationToken>>,
    cancelled: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self {
            persistence: Some(persistence),
            ..Default::default()
        }
    }

    pub fn set(&self, job_name: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(job_name.to_string(), behavior);
    }

    /// Job names in the order their execution began.
    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    /// `(job name, step number)` in execution order.
    pub fn steps(&self) -> Vec<(String, i64)> {
        self.steps.lock().unwrap().clone()
    }

    /// Job ids passed to `cancel`.
    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }

    /// Wait until `job_name` has started executing.
    pub async fn wait_started(&self, job_name: &str) {
        for _ in 0..200 {
            if self.started().iter().any(|n| n == job_name) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {} never started", job_name);
    }
}

#[async_trait]
impl JobExecutor for ScriptedExecutor {
    async fn execute(&self, dispatched: DispatchedJob) -> JobOutcome {
        let name = dispatched.job.name.clone();
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(&name)
            .cloned()
            .unwrap_or(Behavior::Succeed);
        let token = self
            .tokens
            .lock()
            .unwrap()
            .entry(dispatched.job.id.clone())
            .or_default()
            .clone();
        self.started.lock().unwrap().push(name.clone());

        match behavior {
            Behavior::Panic => panic!("executor exploded on {}", name),
            Behavior::Hang => {
                token.cancelled().await;
                return JobOutcome::cancelled();
            }
            Behavior::Succeed | Behavior::FailAt(_) => {}
        }

        let persistence = self.persistence.as_ref().expect("persistence");
        for step in &dispatched.steps {
            persistence
                .start_step(&dispatched.job.id, step.number)
                .await
                .unwrap();
            self.steps.lock().unwrap().push((name.clone(), step.number));

            if matches!(behavior, Behavior::FailAt(n) if n == step.number) {
                persistence
                    .complete_step(
                        &dispatched.job.id,
                        step.number,
                        Conclusion::Failure,
                        Some("exit 1"),
                    )
                    .await
                    .unwrap();
                return JobOutcome::failure(format!("step {} exited with 1", step.number))
                    .with_output(json!({ "exit_code": 1 }));
            }

            persistence
                .complete_step(&dispatched.job.id, step.number, Conclusion::Success, None)
                .await
                .unwrap();
        }

        JobOutcome::success(Some(json!({ "exit_code": 0 })))
    }

    async fn cancel(&self, job_id: &str) {
        self.cancelled.lock().unwrap().push(job_id.to_string());
        // A cancel may arrive before execution registered its token.
        self.tokens
            .lock()
            .unwrap()
            .entry(job_id.to_string())
            .or_default()
            .cancel();
    }
}

/// Sink that keeps every event.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<RunEvent>>,
}

impl RecordingSink {
    /// `(event_type, action)` pairs in emission order.
    pub fn kinds(&self) -> Vec<(String, String)> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| (e.event_type.clone(), e.action.clone()))
            .collect()
    }
}

#[async_trait]
impl RunEventSink for RecordingSink {
    async fn emit(&self, event: RunEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Materializer, scheduler and collaborators wired together.
pub struct Harness {
    pub pool: SqlitePool,
    pub persistence: Arc<dyn Persistence>,
    pub queue: Arc<InMemoryJobQueue>,
    pub workers: Arc<InMemoryWorkerRegistry>,
    pub executor: Arc<ScriptedExecutor>,
    pub events: Arc<RecordingSink>,
    pub scheduler: Arc<JobScheduler>,
    pub materializer: RunMaterializer,
}

impl Harness {
    pub async fn new(workers: Vec<Worker>) -> Self {
        let pool = sqlite_pool().await;
        let persistence: Arc<dyn Persistence> = Arc::new(SqlitePersistence::new(pool.clone()));
        let queue = Arc::new(InMemoryJobQueue::new());
        let registry = Arc::new(InMemoryWorkerRegistry::with_workers(workers));
        let executor = Arc::new(ScriptedExecutor::new(persistence.clone()));
        let events = Arc::new(RecordingSink::default());

        let scheduler = Arc::new(JobScheduler::new(
            persistence.clone(),
            queue.clone(),
            registry.clone(),
            executor.clone(),
            events.clone(),
            SchedulerConfig::default(),
        ));
        let materializer = RunMaterializer::new(
            persistence.clone(),
            Arc::new(YamlWorkflowParser),
            scheduler.clone(),
            events.clone(),
        );

        Self {
            pool,
            persistence,
            queue,
            workers: registry,
            executor,
            events,
            scheduler,
            materializer,
        }
    }

    /// Single linux worker `w1`.
    pub async fn single_worker() -> Self {
        Self::new(vec![Worker::new("w1", ["linux"])]).await
    }

    /// Tick and wait for spawned executions until the run is terminal.
    pub async fn drive(&self, run_id: &str) -> WorkflowRun {
        for _ in 0..50 {
            self.scheduler.tick().await.expect("tick");
            self.scheduler.tasks().drain().await;

            let run = self
                .persistence
                .get_run(run_id)
                .await
                .unwrap()
                .expect("run exists");
            if run.status.is_terminal() {
                return run;
            }
        }
        panic!("run {} did not finish", run_id);
    }
}
