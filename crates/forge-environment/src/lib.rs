// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Forge Environment - Job Execution
//!
//! This crate runs the jobs the forge scheduler dispatches. Each job becomes
//! one execution unit on an orchestration backend; the unit's output and exit
//! status are pushed back, turned into step transitions and log lines, and
//! recorded as the job's outcome.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                        forge-core scheduler                           │
//! │                  (dispatch: run + job + steps + worker)               │
//! └──────────────────────────────────────────────────────────────────────┘
//!                                   │ execute / cancel
//!                                   ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                   forge-environment (This Crate)                      │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  ┌─────────────┐  │
//! │  │   Secret    │  │   Script    │  │   Backend   │  │   Output    │  │
//! │  │  Resolver   │  │  Renderer   │  │  (create /  │  │  Follower   │  │
//! │  │             │  │  (markers)  │  │  teardown)  │  │  (markers)  │  │
//! │  └─────────────┘  └─────────────┘  └─────────────┘  └─────────────┘  │
//! └──────────────────────────────────────────────────────────────────────┘
//!           │                                   │                │
//!           │ env                               │ spawn          │ lines
//!           ▼                                   ▼                ▼
//!   ┌───────────────┐              ┌─────────────────────┐  ┌──────────┐
//!   │  Job env +    │              │  forge-job-<id>     │  │ Log Hub  │
//!   │  FORGE_* vars │              │  container (sh -c)  │  │ (remote) │
//!   └───────────────┘              └─────────────────────┘  └──────────┘
//! ```
//!
//! # Step markers
//!
//! The rendered script brackets every step with marker lines:
//!
//! | Line | Effect |
//! |------|--------|
//! | `::forge-step-start::<n>` | step `n` -> `in_progress` |
//! | `::forge-step-end::<n>::<exit>` | step `n` -> `completed` (`success` when `exit` is 0) |
//! | anything else | log line of the running step, secrets masked |
//!
//! The script stops at the first failing step; steps it never reached are
//! recorded `skipped`.
//!
//! # Backends
//!
//! | Backend | Description |
//! |---------|-------------|
//! | Container (default) | `podman`/`docker`-compatible CLI, one labelled container per job |
//! | Mock | Interprets steps in-process (for testing) |
//!
//! # Configuration
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `FORGE_DATABASE_URL` | (required) | PostgreSQL or SQLite connection string |
//! | `FORGE_CONTAINER_CLI` | `podman` | Container CLI binary |
//! | `FORGE_CONTAINER_RUN_ARGS` | (empty) | Extra `run` arguments |
//! | `FORGE_JOB_IMAGE` | `docker.io/library/alpine:3` | Default job image |
//! | `FORGE_JOB_TIMEOUT_SECS` | `3600` | Default job timeout |
//! | `FORGE_LOG_BUFFER` | `256` | Per-subscriber live log buffer |
//! | `FORGE_LOG_SWEEP_INTERVAL_SECS` | `60` | Log hub sweep interval |
//! | `FORGE_SECRETS_FILE` | (unset) | JSON file with scoped secrets |
//! | `FORGE_WORKERS` | `local:linux` | Workers, `id:label,label;id:label` |

#![deny(missing_docs)]

/// Error types.
pub mod error;

/// Configuration from environment variables.
pub mod config;

/// Orchestration backends.
pub mod backend;

/// Step script rendering and marker parsing.
pub mod script;

/// Secret resolution.
pub mod secrets;

/// Job executor.
pub mod executor;

/// Embeddable runtime.
pub mod runtime;

pub use error::{Error, Result};
pub use executor::{BackendExecutor, ExecutorConfig};
pub use runtime::ForgeRuntime;
