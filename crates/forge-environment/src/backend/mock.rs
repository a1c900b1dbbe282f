// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock backend for testing.
//!
//! Interprets a unit's structured steps instead of running its script, and
//! emits the same step markers the script would. Inside a `run` block:
//!
//! - `exit N` ends the step with status `N`
//! - `echo TEXT` prints `TEXT`, with `$NAME` expanded from the unit env
//! - any other line is printed as is
//!
//! `uses` steps print one line and succeed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, mpsc, oneshot};

use super::traits::*;
use crate::script::{end_marker, start_marker};

/// What the mock does with a job's unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MockBehavior {
    /// Interpret the steps and exit.
    #[default]
    Script,
    /// Start the first step and never finish until torn down.
    Hang,
    /// Fail to create the unit.
    FailCreate,
}

struct MockUnit {
    lines: Option<mpsc::Sender<OutputLine>>,
    exit: Option<oneshot::Sender<UnitExit>>,
}

/// Mock backend for testing.
pub struct MockBackend {
    behaviors: HashMap<String, MockBehavior>,
    units: Arc<Mutex<HashMap<String, MockUnit>>>,
    created: Mutex<Vec<UnitSpec>>,
    teardowns: Mutex<Vec<String>>,
    /// Delay between emitted lines
    pub line_delay: Duration,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    /// Create a mock backend where every job follows its script.
    pub fn new() -> Self {
        Self {
            behaviors: HashMap::new(),
            units: Arc::new(Mutex::new(HashMap::new())),
            created: Mutex::new(Vec::new()),
            teardowns: Mutex::new(Vec::new()),
            line_delay: Duration::ZERO,
        }
    }

    /// Set the behavior for jobs named `job_name`.
    pub fn with_behavior(mut self, job_name: &str, behavior: MockBehavior) -> Self {
        self.behaviors.insert(job_name.to_string(), behavior);
        self
    }

    /// Specs of every unit created so far.
    pub async fn created(&self) -> Vec<UnitSpec> {
        self.created.lock().await.clone()
    }

    /// Job IDs passed to `teardown`, in call order.
    pub async fn teardowns(&self) -> Vec<String> {
        self.teardowns.lock().await.clone()
    }

    /// Whether the unit of `job_id` is still running.
    pub async fn is_running(&self, job_id: &str) -> bool {
        self.units.lock().await.contains_key(job_id)
    }

    fn behavior(&self, job_name: &str) -> MockBehavior {
        self.behaviors.get(job_name).copied().unwrap_or_default()
    }
}

/// Output and exit status of interpreting `spec`'s steps.
fn interpret(spec: &UnitSpec) -> (Vec<OutputLine>, i32) {
    let mut lines = Vec::new();

    for step in &spec.steps {
        lines.push(OutputLine::stdout(start_marker(step.number)));
        let mut exit_code = 0;

        if let Some(run) = &step.run {
            for line in run.lines().map(str::trim).filter(|l| !l.is_empty()) {
                if let Some(code) = line.strip_prefix("exit ") {
                    exit_code = code.trim().parse().unwrap_or(1);
                    break;
                }
                let text = line.strip_prefix("echo ").unwrap_or(line);
                lines.push(OutputLine::stdout(expand(text, spec)));
            }
        } else if let Some(uses) = &step.uses {
            lines.push(OutputLine::stdout(format!("running action {}", uses)));
        }

        lines.push(OutputLine::stdout(end_marker(step.number, exit_code)));
        if exit_code != 0 {
            return (lines, exit_code);
        }
    }

    (lines, 0)
}

fn expand(text: &str, spec: &UnitSpec) -> String {
    let mut text = text.to_string();
    for (name, value) in spec.env.iter().rev() {
        text = text.replace(&format!("${}", name), value);
    }
    text
}

#[async_trait]
impl Backend for MockBackend {
    fn backend_type(&self) -> &'static str {
        "mock"
    }

    async fn create(&self, spec: &UnitSpec) -> Result<LaunchedUnit> {
        let behavior = self.behavior(&spec.job_name);
        if behavior == MockBehavior::FailCreate {
            return Err(BackendError::CreateFailed("mock create failure".to_string()));
        }
        self.created.lock().await.push(spec.clone());

        let (line_tx, line_rx) = mpsc::channel(64);
        let (exit_tx, exit_rx) = oneshot::channel();
        let handle = UnitHandle {
            handle_id: spec.unit_name(),
            job_id: spec.job_id.clone(),
            started_at: Utc::now(),
        };

        match behavior {
            MockBehavior::Hang => {
                if let Some(step) = spec.steps.first() {
                    let _ = line_tx.try_send(OutputLine::stdout(start_marker(step.number)));
                }
                self.units.lock().await.insert(
                    spec.job_id.clone(),
                    MockUnit {
                        lines: Some(line_tx),
                        exit: Some(exit_tx),
                    },
                );
            }
            _ => {
                self.units.lock().await.insert(
                    spec.job_id.clone(),
                    MockUnit {
                        lines: None,
                        exit: None,
                    },
                );
                let (output, exit_code) = interpret(spec);
                let units = self.units.clone();
                let job_id = spec.job_id.clone();
                let delay = self.line_delay;
                tokio::spawn(async move {
                    for line in output {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        if line_tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    drop(line_tx);
                    units.lock().await.remove(&job_id);
                    let _ = exit_tx.send(UnitExit::code(exit_code));
                });
            }
        }

        Ok(LaunchedUnit {
            handle,
            lines: line_rx,
            exit: exit_rx,
        })
    }

    async fn teardown(&self, job_id: &str) -> Result<()> {
        self.teardowns.lock().await.push(job_id.to_string());
        if let Some(mut unit) = self.units.lock().await.remove(job_id) {
            unit.lines.take();
            if let Some(exit) = unit.exit.take() {
                let _ = exit.send(UnitExit::code(137));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use forge_core::models::{Status, Step};

    fn spec(job_name: &str, runs: &[&str]) -> UnitSpec {
        UnitSpec {
            job_id: format!("{}-id", job_name),
            run_id: "run".to_string(),
            job_name: job_name.to_string(),
            image: "alpine".to_string(),
            env: BTreeMap::from([("NAME".to_string(), "forge".to_string())]),
            script: String::new(),
            steps: runs
                .iter()
                .enumerate()
                .map(|(i, run)| Step {
                    id: format!("s{}", i + 1),
                    job_id: format!("{}-id", job_name),
                    number: i as i64 + 1,
                    name: format!("step {}", i + 1),
                    uses: None,
                    run: Some(run.to_string()),
                    params: BTreeMap::new(),
                    env: BTreeMap::new(),
                    status: Status::Queued,
                    conclusion: None,
                    output: None,
                    started_at: None,
                    completed_at: None,
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_script_stops_at_failing_step() {
        let backend = MockBackend::new();
        let mut unit = backend
            .create(&spec("build", &["echo hello $NAME", "exit 3", "echo never"]))
            .await
            .unwrap();

        let mut lines = Vec::new();
        while let Some(line) = unit.lines.recv().await {
            lines.push(line.text);
        }
        assert_eq!(
            lines,
            vec![
                "::forge-step-start::1",
                "hello forge",
                "::forge-step-end::1::0",
                "::forge-step-start::2",
                "::forge-step-end::2::3",
            ]
        );
        assert_eq!(unit.exit.await.unwrap(), UnitExit::code(3));
        assert!(!backend.is_running("build-id").await);
    }

    #[tokio::test]
    async fn test_hang_until_teardown() {
        let backend = MockBackend::new().with_behavior("deploy", MockBehavior::Hang);
        let unit = backend.create(&spec("deploy", &["echo hi"])).await.unwrap();
        assert!(backend.is_running("deploy-id").await);

        backend.teardown("deploy-id").await.unwrap();
        backend.teardown("deploy-id").await.unwrap();

        assert_eq!(unit.exit.await.unwrap().exit_code, 137);
        assert!(!backend.is_running("deploy-id").await);
        assert_eq!(backend.teardowns().await, vec!["deploy-id", "deploy-id"]);
    }

    #[tokio::test]
    async fn test_create_failure() {
        let backend = MockBackend::new().with_behavior("broken", MockBehavior::FailCreate);
        assert!(matches!(
            backend.create(&spec("broken", &["echo"])).await,
            Err(BackendError::CreateFailed(_))
        ));
        assert!(backend.created().await.is_empty());
    }
}
