// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container CLI backend.
//!
//! Runs each job as one container through a docker-compatible CLI
//! (`podman`, `docker`, `nerdctl`). The unit's output and exit status are
//! pushed from the CLI process: stdout and stderr are read line by line and
//! the exit code arrives when `run` returns.
//!
//! Environment values are passed as `-e NAME` with the value set on the CLI
//! process, so secrets never appear in the process argument list.

use std::process::Stdio;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::traits::*;

/// Lines buffered between the CLI readers and the executor.
const LINE_BUFFER: usize = 1024;

/// Container backend configuration.
#[derive(Debug, Clone)]
pub struct ContainerBackendConfig {
    /// CLI binary
    pub cli: String,
    /// Extra arguments inserted after `run` (network, resource limits)
    pub run_args: Vec<String>,
}

impl Default for ContainerBackendConfig {
    fn default() -> Self {
        Self {
            cli: "podman".to_string(),
            run_args: Vec::new(),
        }
    }
}

impl ContainerBackendConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            cli: std::env::var("FORGE_CONTAINER_CLI").unwrap_or_else(|_| "podman".to_string()),
            run_args: std::env::var("FORGE_CONTAINER_RUN_ARGS")
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
        }
    }
}

/// Container CLI backend.
pub struct ContainerBackend {
    config: ContainerBackendConfig,
}

impl ContainerBackend {
    /// Create a new container backend
    pub fn new(config: ContainerBackendConfig) -> Self {
        Self { config }
    }

    /// Create from environment variables
    pub fn from_env() -> Self {
        Self::new(ContainerBackendConfig::from_env())
    }

    /// Arguments of the `run` invocation for `spec`.
    pub fn run_args(&self, spec: &UnitSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            spec.unit_name(),
            "--label".to_string(),
            format!("{}={}", JOB_LABEL, spec.job_id),
            "--label".to_string(),
            format!("forge.run-id={}", spec.run_id),
        ];
        args.extend(self.config.run_args.iter().cloned());
        for name in spec.env.keys() {
            args.push("-e".to_string());
            args.push(name.clone());
        }
        args.push(spec.image.clone());
        args.push("sh".to_string());
        args.push("-c".to_string());
        args.push(spec.script.clone());
        args
    }

    /// Container IDs carrying the label of `job_id`.
    async fn list_units(&self, job_id: &str) -> Result<Vec<String>> {
        let output = Command::new(&self.config.cli)
            .args(["ps", "-aq", "--filter"])
            .arg(format!("label={}={}", JOB_LABEL, job_id))
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            return Err(BackendError::TeardownFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn remove_unit(&self, id: &str) -> Result<()> {
        let output = Command::new(&self.config.cli)
            .args(["rm", "-f", id])
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_missing(&stderr) {
            debug!(container_id = %id, "Container already gone");
            return Ok(());
        }
        Err(BackendError::TeardownFailed(stderr.trim().to_string()))
    }

    fn spawn_error(&self, e: std::io::Error) -> BackendError {
        if e.kind() == std::io::ErrorKind::NotFound {
            BackendError::Unavailable(format!("container CLI '{}' not found", self.config.cli))
        } else {
            BackendError::Io(e)
        }
    }
}

/// Whether a CLI error means the container does not exist.
fn is_missing(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    stderr.contains("no such container") || stderr.contains("no container with name or id")
}

/// Strip the line terminator left by `read_until` (`\n` or `\r\n`).
fn trim_line_end(buf: &[u8]) -> &[u8] {
    let buf = buf.strip_suffix(b"\n").unwrap_or(buf);
    buf.strip_suffix(b"\r").unwrap_or(buf)
}

/// Forward raw output lines as text. Invalid UTF-8 is replaced, never fatal,
/// and the pipe is drained to EOF so the CLI is not killed by a closed pipe.
fn forward_lines<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        let mut forwarding = true;
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if !forwarding {
                        continue;
                    }
                    let text = String::from_utf8_lossy(trim_line_end(&buf)).into_owned();
                    if tx.send(OutputLine { stream, text }).await.is_err() {
                        forwarding = false;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to read container output");
                    break;
                }
            }
        }
    });
}

#[async_trait]
impl Backend for ContainerBackend {
    fn backend_type(&self) -> &'static str {
        "container"
    }

    async fn create(&self, spec: &UnitSpec) -> Result<LaunchedUnit> {
        let mut cmd = Command::new(&self.config.cli);
        cmd.args(self.run_args(spec))
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| match self.spawn_error(e) {
            BackendError::Io(e) => BackendError::CreateFailed(e.to_string()),
            other => other,
        })?;

        let handle_id = spec.unit_name();
        info!(
            job_id = %spec.job_id,
            container = %handle_id,
            image = %spec.image,
            pid = ?child.id(),
            "Container started"
        );

        let (line_tx, line_rx) = mpsc::channel(LINE_BUFFER);
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, OutputStream::Stdout, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, OutputStream::Stderr, line_tx.clone());
        }
        drop(line_tx);

        let (exit_tx, exit_rx) = oneshot::channel();
        let container = handle_id.clone();
        tokio::spawn(async move {
            let exit = match child.wait().await {
                Ok(status) => UnitExit::code(status.code().unwrap_or(-1)),
                Err(e) => UnitExit::lost(format!("failed to wait for container CLI: {}", e)),
            };
            debug!(container = %container, exit_code = exit.exit_code, "Container exited");
            let _ = exit_tx.send(exit);
        });

        Ok(LaunchedUnit {
            handle: UnitHandle {
                handle_id,
                job_id: spec.job_id.clone(),
                started_at: Utc::now(),
            },
            lines: line_rx,
            exit: exit_rx,
        })
    }

    async fn teardown(&self, job_id: &str) -> Result<()> {
        let ids = self.list_units(job_id).await?;
        if ids.is_empty() {
            debug!(job_id = %job_id, "No containers to tear down");
            return Ok(());
        }
        for id in &ids {
            self.remove_unit(id).await?;
        }
        info!(job_id = %job_id, containers = ids.len(), "Containers torn down");
        Ok(())
    }
}
