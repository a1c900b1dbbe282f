// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Forge Core - Run Orchestration
//!
//! This crate turns workflow definitions into durable runs and drives them to
//! completion. It owns the run/job/step state machine, dependency-aware job
//! scheduling, live log fan-out and the persistence layer shared with the
//! webhook and execution crates.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                     Trigger (push, PR, manual)                        │
//! └──────────────────────────────────────────────────────────────────────┘
//!                                   │
//!                                   ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                           forge-core                                  │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐               │
//! │  │     Run     │───►│     Job     │───►│  JobQueue / │               │
//! │  │ Materializer│    │  Scheduler  │    │   Workers   │               │
//! │  └─────────────┘    └─────────────┘    └─────────────┘               │
//! │         │                  │  ▲                                       │
//! │         │ run events       │  │ outcome                               │
//! │         ▼                  ▼  │                                       │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐               │
//! │  │ RunEventSink│    │ JobExecutor │───►│   LogHub    │──► subscribers│
//! │  │ (webhooks)  │    │ (backends)  │    │             │               │
//! │  └─────────────┘    └─────────────┘    └─────────────┘               │
//! └──────────────────────────────────────────────────────────────────────┘
//!                                   │
//!                                   ▼
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                     PostgreSQL / SQLite                               │
//! │        (runs, jobs, steps, logs, webhooks, deliveries)                │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Run State Machine
//!
//! ```text
//!   ┌────────┐  first job starts  ┌─────────────┐  all jobs terminal  ┌───────────┐
//!   │ QUEUED │───────────────────►│ IN_PROGRESS │────────────────────►│ COMPLETED │
//!   └────────┘                    └─────────────┘                     └───────────┘
//!       │                                │
//!       │             cancel             │
//!       └───────────────┬────────────────┘
//!                       ▼
//!                 ┌───────────┐
//!                 │ CANCELLED │
//!                 └───────────┘
//! ```
//!
//! Jobs and steps follow the same shape. A completed entity carries a
//! conclusion: `success`, `failure`, `cancelled` or `skipped`.
//!
//! # Modules
//!
//! - [`error`]: Error type shared by every component
//! - [`models`]: Runs, jobs, steps, logs, webhooks and deliveries
//! - [`workflow`]: Workflow definitions, parsing and trigger matching
//! - [`persistence`]: Storage trait with PostgreSQL and SQLite backends
//! - [`materializer`]: Workflow + trigger to persisted run
//! - [`scheduler`]: Dependency-aware job dispatch
//! - [`log_hub`]: Live log fan-out with persistence
//! - [`events`]: Run lifecycle events for webhook fan-out
//! - [`tasks`]: Tracked background tasks

#![deny(missing_docs)]

/// Embedded database migrations.
pub mod migrations;

/// Error types for forge-core operations.
pub mod error;

/// Domain model.
pub mod models;

/// Workflow definitions and parsing.
pub mod workflow;

/// Storage backends.
pub mod persistence;

/// Run materialization.
pub mod materializer;

/// Job scheduling and dispatch.
pub mod scheduler;

/// Live log streaming.
pub mod log_hub;

/// Run lifecycle events.
pub mod events;

/// Tracked background tasks.
pub mod tasks;

pub use error::{CoreError, Result};
pub use log_hub::{LogHub, LogHubSweeper, LogHubSweeperConfig, LogSubscription};
pub use materializer::RunMaterializer;
pub use persistence::{Persistence, PostgresPersistence, SqlitePersistence};
pub use scheduler::{JobScheduler, SchedulerConfig};
