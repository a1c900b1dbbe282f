// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for forge-environment.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use forge_core::scheduler::Worker;

use crate::executor::ExecutorConfig;
use crate::secrets::{InMemorySecretResolver, SecretResolver};

/// Environment configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database URL (`postgres://...` or `sqlite:...`)
    pub database_url: String,
    /// Container CLI used to run jobs
    pub container_cli: String,
    /// Image for jobs that do not name one
    pub job_image: String,
    /// Wall-clock limit for jobs without `timeout-minutes`
    pub job_timeout: Duration,
    /// Per-subscriber live log buffer
    pub log_buffer: usize,
    /// Interval between log hub sweeps
    pub log_sweep_interval: Duration,
    /// Optional JSON file with scoped secrets
    pub secrets_file: Option<PathBuf>,
    /// Workers registered at startup
    pub workers: Vec<Worker>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("FORGE_DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("FORGE_DATABASE_URL"))?;

        let container_cli =
            std::env::var("FORGE_CONTAINER_CLI").unwrap_or_else(|_| "podman".to_string());

        let job_image = std::env::var("FORGE_JOB_IMAGE")
            .unwrap_or_else(|_| "docker.io/library/alpine:3".to_string());

        let job_timeout = Duration::from_secs(parse_var("FORGE_JOB_TIMEOUT_SECS", 3600)?);
        let log_buffer = parse_var("FORGE_LOG_BUFFER", 256)?;
        let log_sweep_interval =
            Duration::from_secs(parse_var("FORGE_LOG_SWEEP_INTERVAL_SECS", 60)?);

        let secrets_file = std::env::var("FORGE_SECRETS_FILE").ok().map(PathBuf::from);

        let workers = match std::env::var("FORGE_WORKERS") {
            Ok(spec) => parse_workers(&spec)?,
            Err(_) => vec![Worker::new("local", ["linux"])],
        };

        Ok(Self {
            database_url,
            container_cli,
            job_image,
            job_timeout,
            log_buffer,
            log_sweep_interval,
            secrets_file,
            workers,
        })
    }

    /// Executor settings derived from this configuration.
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            default_image: self.job_image.clone(),
            default_timeout: self.job_timeout,
        }
    }

    /// Secret resolver backed by `secrets_file`, or an empty one.
    pub fn secret_resolver(&self) -> crate::Result<Arc<dyn SecretResolver>> {
        let resolver = match &self.secrets_file {
            Some(path) => InMemorySecretResolver::from_json_file(path)?,
            None => InMemorySecretResolver::new(),
        };
        Ok(Arc::new(resolver))
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
            name,
            value: value.clone(),
        }),
        Err(_) => Ok(default),
    }
}

/// Parse `FORGE_WORKERS`: `id:label,label;id:label`.
pub fn parse_workers(spec: &str) -> Result<Vec<Worker>, ConfigError> {
    let invalid = || ConfigError::InvalidValue {
        name: "FORGE_WORKERS",
        value: spec.to_string(),
    };

    let mut workers = Vec::new();
    for entry in spec.split(';').map(str::trim).filter(|e| !e.is_empty()) {
        let (id, labels) = entry.split_once(':').unwrap_or((entry, ""));
        let id = id.trim();
        if id.is_empty() {
            return Err(invalid());
        }
        let labels: Vec<&str> = labels
            .split(',')
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        workers.push(Worker::new(id, labels));
    }

    if workers.is_empty() {
        return Err(invalid());
    }
    Ok(workers)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A variable could not be parsed.
    #[error("Invalid value for {name}: '{value}'")]
    InvalidValue {
        /// Variable name.
        name: &'static str,
        /// Rejected value.
        value: String,
    },
}
