// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job executor backed by an orchestration [`Backend`].
//!
//! For every dispatched job the executor resolves secrets, renders the step
//! script, creates one execution unit and then follows the unit's pushed
//! output until its exit signal arrives:
//!
//! - step markers drive `start_step` / `complete_step`
//! - every other line is masked, attributed to the running step and
//!   published through the [`LogHub`] (`source = remote`)
//! - the exit signal concludes the job
//!
//! A per-job wall-clock timeout and cancellation both tear the unit down.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use forge_core::LogHub;
use forge_core::models::{Conclusion, Job, LogEntry, LogLevel, LogSource, Step, WorkflowRun};
use forge_core::persistence::Persistence;
use forge_core::scheduler::{DispatchedJob, JobExecutor, JobOutcome, Worker};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, LaunchedUnit, OutputLine, OutputStream, UnitExit, UnitSpec};
use crate::script::{Marker, parse_marker, render_script};
use crate::secrets::SecretResolver;

/// Step output kept on the step row, in bytes.
const MAX_STEP_OUTPUT: usize = 64 * 1024;

/// Replacement for secret values in published output.
const MASK: &str = "***";

/// Executor configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Image for jobs that do not name one
    pub default_image: String,
    /// Timeout for jobs without `timeout-minutes`
    pub default_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            default_image: "docker.io/library/alpine:3".to_string(),
            default_timeout: Duration::from_secs(3600),
        }
    }
}

impl ExecutorConfig {
    /// Read `FORGE_JOB_IMAGE` and `FORGE_JOB_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            default_image: std::env::var("FORGE_JOB_IMAGE").unwrap_or(defaults.default_image),
            default_timeout: std::env::var("FORGE_JOB_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_timeout),
        }
    }
}

enum Ended {
    Exited(UnitExit),
    Cancelled,
    TimedOut,
}

/// Per-job step bookkeeping while a unit runs.
struct StepTracker<'a> {
    job_id: &'a str,
    steps: &'a [Step],
    masks: Vec<String>,
    current: Option<i64>,
    output: String,
    results: BTreeMap<i64, Conclusion>,
    failed: Option<(i64, i32)>,
}

impl<'a> StepTracker<'a> {
    fn new(job_id: &'a str, steps: &'a [Step], secrets: &BTreeMap<String, String>) -> Self {
        let mut masks: Vec<String> = secrets
            .values()
            .filter(|v| !v.trim().is_empty())
            .cloned()
            .collect();
        // Longest first so a secret containing another is masked whole.
        masks.sort_by_key(|m| std::cmp::Reverse(m.len()));

        Self {
            job_id,
            steps,
            masks,
            current: None,
            output: String::new(),
            results: BTreeMap::new(),
            failed: None,
        }
    }

    fn mask(&self, text: &str) -> String {
        let mut text = text.to_string();
        for secret in &self.masks {
            if text.contains(secret.as_str()) {
                text = text.replace(secret.as_str(), MASK);
            }
        }
        text
    }

    fn step(&self, number: i64) -> Option<&Step> {
        self.steps.iter().find(|s| s.number == number)
    }

    fn current_step_id(&self) -> Option<String> {
        self.current
            .and_then(|n| self.step(n))
            .map(|s| s.id.clone())
    }

    fn push_output(&mut self, line: &str) {
        if self.output.len() + line.len() < MAX_STEP_OUTPUT {
            self.output.push_str(line);
            self.output.push('\n');
        }
    }

    fn take_output(&mut self) -> Option<String> {
        let output = std::mem::take(&mut self.output);
        (!output.is_empty()).then_some(output)
    }

    /// Structured job summary with per-step detail.
    fn summary(&self, exit_code: i32) -> Value {
        let steps: Vec<Value> = self
            .steps
            .iter()
            .map(|s| {
                json!({
                    "number": s.number,
                    "name": s.name,
                    "conclusion": self
                        .results
                        .get(&s.number)
                        .copied()
                        .unwrap_or(Conclusion::Skipped),
                })
            })
            .collect();
        json!({ "exit_code": exit_code, "steps": steps })
    }
}

/// [`JobExecutor`] running jobs on an orchestration backend.
pub struct BackendExecutor {
    persistence: Arc<dyn Persistence>,
    backend: Arc<dyn Backend>,
    secrets: Arc<dyn SecretResolver>,
    hub: Arc<LogHub>,
    config: ExecutorConfig,
    running: DashMap<String, CancellationToken>,
}

impl BackendExecutor {
    /// Create an executor.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        backend: Arc<dyn Backend>,
        secrets: Arc<dyn SecretResolver>,
        hub: Arc<LogHub>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            persistence,
            backend,
            secrets,
            hub,
            config,
            running: DashMap::new(),
        }
    }

    /// Number of jobs currently executing.
    pub fn running_jobs(&self) -> usize {
        self.running.len()
    }

    fn unit_spec(
        &self,
        run: &WorkflowRun,
        job: &Job,
        steps: &[Step],
        worker: &Worker,
        secrets: &BTreeMap<String, String>,
    ) -> UnitSpec {
        let mut env = job.env.clone();
        env.insert("CI".to_string(), "true".to_string());
        env.insert("FORGE_JOB_ID".to_string(), job.id.clone());
        env.insert("FORGE_JOB".to_string(), job.name.clone());
        env.insert("FORGE_RUN_ID".to_string(), run.id.clone());
        env.insert("FORGE_RUN_NUMBER".to_string(), run.run_number.to_string());
        env.insert("FORGE_REPOSITORY".to_string(), run.repository_id.clone());
        env.insert("FORGE_SHA".to_string(), run.head_sha.clone());
        env.insert("FORGE_EVENT_NAME".to_string(), run.event.clone());
        env.insert("FORGE_WORKER".to_string(), worker.id.clone());
        if let Some(branch) = &run.head_branch {
            env.insert("FORGE_REF_NAME".to_string(), branch.clone());
        }
        if let Some(actor) = &run.actor {
            env.insert("FORGE_ACTOR".to_string(), actor.clone());
        }
        env.extend(secrets.iter().map(|(k, v)| (k.clone(), v.clone())));

        UnitSpec {
            job_id: job.id.clone(),
            run_id: run.id.clone(),
            job_name: job.name.clone(),
            image: job
                .image
                .clone()
                .unwrap_or_else(|| self.config.default_image.clone()),
            env,
            script: render_script(steps),
            steps: steps.to_vec(),
        }
    }

    async fn run_job(
        &self,
        run: &WorkflowRun,
        job: &Job,
        steps: &[Step],
        worker: &Worker,
        token: &CancellationToken,
    ) -> JobOutcome {
        self.orchestrator_log(
            &job.id,
            LogLevel::Info,
            format!("Job '{}' assigned to worker {}", job.display_name, worker.id),
        )
        .await;

        let secrets = match self
            .secrets
            .resolve(
                &run.repository_id,
                run.organization_id.as_deref(),
                job.environment.as_deref(),
            )
            .await
        {
            Ok(secrets) => secrets,
            Err(e) => {
                let message = format!("failed to resolve secrets: {}", e);
                warn!(job_id = %job.id, error = %e, "Failed to resolve secrets");
                self.orchestrator_log(&job.id, LogLevel::Error, message.clone())
                    .await;
                return JobOutcome::failure(message);
            }
        };

        let spec = self.unit_spec(run, job, steps, worker, &secrets);
        let unit = match self.backend.create(&spec).await {
            Ok(unit) => unit,
            Err(e) => {
                error!(
                    job_id = %job.id,
                    backend = self.backend.backend_type(),
                    error = %e,
                    "Failed to create execution unit"
                );
                let message = e.to_string();
                self.orchestrator_log(&job.id, LogLevel::Error, message.clone())
                    .await;
                return JobOutcome::failure(message);
            }
        };

        info!(
            job_id = %job.id,
            handle = %unit.handle.handle_id,
            backend = self.backend.backend_type(),
            image = %spec.image,
            "Execution unit created"
        );

        let timeout = job_timeout(job.timeout_minutes, self.config.default_timeout);

        let mut tracker = StepTracker::new(&job.id, steps, &secrets);
        let ended = self.watch(unit, &mut tracker, token, timeout).await;

        match ended {
            Ended::Exited(exit) => self.conclude(&mut tracker, exit).await,
            Ended::Cancelled => {
                self.teardown(&job.id).await;
                self.orchestrator_log(&job.id, LogLevel::Warn, "Job cancelled".to_string())
                    .await;
                JobOutcome::cancelled()
            }
            Ended::TimedOut => {
                warn!(job_id = %job.id, timeout_secs = timeout.as_secs(), "Job timed out");
                self.teardown(&job.id).await;
                self.close_current(&mut tracker, Conclusion::Failure).await;
                let message = format!("job timed out after {:?}", timeout);
                self.orchestrator_log(&job.id, LogLevel::Error, message.clone())
                    .await;
                JobOutcome::failure(message).with_output(tracker.summary(-1))
            }
        }
    }

    /// Follow the unit until it exits, is cancelled or times out.
    async fn watch(
        &self,
        unit: LaunchedUnit,
        tracker: &mut StepTracker<'_>,
        token: &CancellationToken,
        timeout: Duration,
    ) -> Ended {
        let LaunchedUnit {
            mut lines,
            mut exit,
            ..
        } = unit;
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut streaming = true;

        loop {
            tokio::select! {
                biased;

                _ = token.cancelled() => return Ended::Cancelled,

                _ = &mut deadline => return Ended::TimedOut,

                line = lines.recv(), if streaming => match line {
                    Some(line) => self.on_line(tracker, line).await,
                    None => streaming = false,
                },

                status = &mut exit, if !streaming => {
                    return Ended::Exited(status.unwrap_or_else(|_| {
                        UnitExit::lost("backend dropped the unit without an exit status")
                    }));
                }
            }
        }
    }

    async fn on_line(&self, tracker: &mut StepTracker<'_>, line: OutputLine) {
        match parse_marker(&line.text) {
            Some(Marker::StepStart(number)) => {
                self.close_current(tracker, Conclusion::Failure).await;
                if tracker.step(number).is_none() {
                    warn!(job_id = %tracker.job_id, step = number, "Marker for unknown step");
                    return;
                }
                match self.persistence.start_step(tracker.job_id, number).await {
                    Ok(true) => debug!(job_id = %tracker.job_id, step = number, "Step started"),
                    Ok(false) => debug!(job_id = %tracker.job_id, step = number, "Step not startable"),
                    Err(e) => warn!(job_id = %tracker.job_id, step = number, error = %e, "Failed to start step"),
                }
                tracker.current = Some(number);
                tracker.output.clear();
            }
            Some(Marker::StepEnd { number, exit_code }) => {
                if exit_code != 0 && tracker.failed.is_none() {
                    tracker.failed = Some((number, exit_code));
                }
                if tracker.current == Some(number) {
                    tracker.current = None;
                }
                self.close_step(tracker, number, Conclusion::from_success(exit_code == 0))
                    .await;
            }
            None => {
                let text = tracker.mask(&line.text);
                tracker.push_output(&text);
                let level = match line.stream {
                    OutputStream::Stdout => LogLevel::Info,
                    OutputStream::Stderr => LogLevel::Warn,
                };
                let entry = LogEntry::new(
                    tracker.job_id,
                    tracker.current_step_id(),
                    level,
                    LogSource::Remote,
                    text,
                );
                if let Err(e) = self.hub.publish(entry).await {
                    warn!(job_id = %tracker.job_id, error = %e, "Failed to persist log line");
                }
            }
        }
    }

    async fn close_step(&self, tracker: &mut StepTracker<'_>, number: i64, conclusion: Conclusion) {
        let output = tracker.take_output();
        tracker.results.insert(number, conclusion);
        if let Err(e) = self
            .persistence
            .complete_step(tracker.job_id, number, conclusion, output.as_deref())
            .await
        {
            warn!(job_id = %tracker.job_id, step = number, error = %e, "Failed to complete step");
        }
    }

    /// Fail a step that started but never reported its end.
    async fn close_current(&self, tracker: &mut StepTracker<'_>, conclusion: Conclusion) {
        if let Some(number) = tracker.current.take() {
            if conclusion == Conclusion::Failure && tracker.failed.is_none() {
                tracker.failed = Some((number, -1));
            }
            self.close_step(tracker, number, conclusion).await;
        }
    }

    async fn conclude(&self, tracker: &mut StepTracker<'_>, exit: UnitExit) -> JobOutcome {
        self.close_current(tracker, Conclusion::Failure).await;
        let summary = tracker.summary(exit.exit_code);

        if exit.success() && tracker.failed.is_none() {
            self.orchestrator_log(tracker.job_id, LogLevel::Info, "Job succeeded".to_string())
                .await;
            return JobOutcome::success(Some(summary));
        }

        let message = match (tracker.failed, &exit.error) {
            (Some((number, code)), _) if code >= 0 => {
                format!("step {} failed with exit code {}", number, code)
            }
            (_, Some(error)) => error.clone(),
            _ => format!("execution unit exited with code {}", exit.exit_code),
        };
        self.orchestrator_log(tracker.job_id, LogLevel::Error, message.clone())
            .await;
        JobOutcome::failure(message).with_output(summary)
    }

    async fn record(&self, job_id: &str, outcome: &JobOutcome) {
        match self
            .persistence
            .complete_job(
                job_id,
                outcome.conclusion,
                outcome.output.as_ref(),
                outcome.error.as_deref(),
            )
            .await
        {
            Ok(true) => debug!(job_id = %job_id, conclusion = %outcome.conclusion, "Recorded job outcome"),
            Ok(false) => debug!(job_id = %job_id, "Job already terminal"),
            Err(e) => warn!(job_id = %job_id, error = %e, "Failed to record job outcome"),
        }
    }

    async fn teardown(&self, job_id: &str) {
        if let Err(e) = self.backend.teardown(job_id).await {
            warn!(job_id = %job_id, error = %e, "Failed to tear down execution unit");
        }
    }

    async fn orchestrator_log(&self, job_id: &str, level: LogLevel, message: String) {
        let entry = LogEntry::new(job_id, None, level, LogSource::Orchestrator, message);
        if let Err(e) = self.hub.publish(entry).await {
            warn!(job_id = %job_id, error = %e, "Failed to persist log line");
        }
    }

    /// Whether the job was cancelled before execution began.
    async fn cancelled_in_store(&self, job_id: &str) -> bool {
        match self.persistence.get_job(job_id).await {
            Ok(Some(job)) => job.status.is_terminal(),
            Ok(None) => true,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to re-read job");
                false
            }
        }
    }
}

#[async_trait]
impl JobExecutor for BackendExecutor {
    async fn execute(&self, dispatched: DispatchedJob) -> JobOutcome {
        let DispatchedJob {
            run,
            job,
            steps,
            worker,
        } = dispatched;

        // Registered before the status check so a cancel racing with the
        // start is seen by one or the other.
        let token = CancellationToken::new();
        self.running.insert(job.id.clone(), token.clone());
        self.hub.start(&job.id);

        let outcome = if token.is_cancelled() || self.cancelled_in_store(&job.id).await {
            info!(job_id = %job.id, "Job cancelled before execution");
            JobOutcome::cancelled()
        } else {
            self.run_job(&run, &job, &steps, &worker, &token).await
        };

        self.record(&job.id, &outcome).await;
        self.running.remove(&job.id);
        self.hub.stop(&job.id);
        outcome
    }

    async fn cancel(&self, job_id: &str) {
        if let Some(token) = self.running.get(job_id) {
            token.cancel();
            info!(job_id = %job_id, "Cancelling running job");
        }
        self.teardown(job_id).await;
    }
}

/// Wall-clock limit of a job; `timeout-minutes` wins over the default.
fn job_timeout(minutes: Option<i64>, default: Duration) -> Duration {
    minutes
        .and_then(|m| u64::try_from(m).ok())
        .filter(|m| *m > 0)
        .map(|m| Duration::from_secs(m.saturating_mul(60)))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_core::models::Status;

    fn step(number: i64) -> Step {
        Step {
            id: format!("step-{}", number),
            job_id: "job".to_string(),
            number,
            name: format!("Step {}", number),
            uses: None,
            run: Some("true".to_string()),
            params: BTreeMap::new(),
            env: BTreeMap::new(),
            status: Status::Queued,
            conclusion: None,
            output: None,
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn test_job_timeout() {
        let default = Duration::from_secs(3600);
        assert_eq!(job_timeout(None, default), default);
        assert_eq!(job_timeout(Some(0), default), default);
        assert_eq!(job_timeout(Some(-5), default), default);
        assert_eq!(job_timeout(Some(10), default), Duration::from_secs(600));
        assert_eq!(
            job_timeout(Some(i64::MAX), default),
            Duration::from_secs(u64::MAX)
        );
    }

    #[test]
    fn test_masking_prefers_longest_secret() {
        let steps = [step(1)];
        let secrets = BTreeMap::from([
            ("A".to_string(), "abc".to_string()),
            ("B".to_string(), "abcdef".to_string()),
            ("EMPTY".to_string(), " ".to_string()),
        ]);
        let tracker = StepTracker::new("job", &steps, &secrets);

        assert_eq!(tracker.mask("token=abcdef"), "token=***");
        assert_eq!(tracker.mask("abc and abcdef"), "*** and ***");
        assert_eq!(tracker.mask("a b c"), "a b c");
    }

    #[test]
    fn test_summary_marks_unrun_steps_skipped() {
        let steps = [step(1), step(2), step(3)];
        let mut tracker = StepTracker::new("job", &steps, &BTreeMap::new());
        tracker.results.insert(1, Conclusion::Success);
        tracker.results.insert(2, Conclusion::Failure);

        let summary = tracker.summary(2);
        assert_eq!(summary["exit_code"], 2);
        let conclusions: Vec<&str> = summary["steps"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["conclusion"].as_str().unwrap())
            .collect();
        assert_eq!(conclusions, vec!["success", "failure", "skipped"]);
        assert_eq!(summary["steps"][0]["name"], "Step 1");
    }

    #[test]
    fn test_step_output_is_bounded() {
        let steps = [step(1)];
        let mut tracker = StepTracker::new("job", &steps, &BTreeMap::new());
        let line = "x".repeat(1024);
        for _ in 0..100 {
            tracker.push_output(&line);
        }
        let output = tracker.take_output().unwrap();
        assert!(output.len() < MAX_STEP_OUTPUT);
        assert!(tracker.take_output().is_none());
    }
}
