// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tracked background tasks.
//!
//! Job executions and webhook deliveries run detached from the call that
//! started them. They go through [`BackgroundTasks`] instead of a bare
//! `tokio::spawn` so panics are counted and logged, and shutdown can wait for
//! in-flight work instead of dropping it.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// Tracker for fire-and-forget work.
#[derive(Clone)]
pub struct BackgroundTasks {
    name: &'static str,
    tracker: TaskTracker,
    failures: Arc<AtomicU64>,
}

impl BackgroundTasks {
    /// Create a tracker; `name` appears in logs.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            tracker: TaskTracker::new(),
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Spawn `task`. A panic is caught, counted and logged.
    pub fn spawn<F>(&self, label: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let failures = self.failures.clone();
        let tracker = self.name;
        self.tracker.spawn(async move {
            if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
                failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    tracker = tracker,
                    task = label,
                    panic = %panic_message(panic.as_ref()),
                    "Background task panicked"
                );
            }
        });
    }

    /// Spawn a fallible `task`. Errors are counted and logged like panics.
    pub fn spawn_fallible<F, E>(&self, label: &'static str, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        let failures = self.failures.clone();
        let tracker = self.name;
        self.spawn(label, async move {
            if let Err(e) = task.await {
                failures.fetch_add(1, Ordering::Relaxed);
                warn!(tracker = tracker, task = label, error = %e, "Background task failed");
            }
        });
    }

    /// Number of tasks still running.
    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    /// Number of tasks that panicked or returned an error.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Wait for every task spawned so far, then accept new ones again.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Stop accepting work and wait up to `timeout` for running tasks.
    /// Returns `false` when tasks were still running at the deadline.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.tracker.close();
        let remaining = self.tracker.len();
        if remaining > 0 {
            info!(tracker = self.name, remaining = remaining, "Waiting for background tasks");
        }
        match tokio::time::timeout(timeout, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    tracker = self.name,
                    remaining = self.tracker.len(),
                    "Background tasks still running at shutdown deadline"
                );
                false
            }
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_panics_are_counted() {
        let tasks = BackgroundTasks::new("test");
        let ran = Arc::new(AtomicUsize::new(0));

        let counter = ran.clone();
        tasks.spawn("ok", async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tasks.spawn("boom", async {
            panic!("boom");
        });
        tasks.spawn_fallible("err", async { Err::<(), _>("nope") });

        tasks.drain().await;

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(tasks.failures(), 2);
        assert_eq!(tasks.active(), 0);

        // Still usable after draining.
        let counter = ran.clone();
        tasks.spawn("again", async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tasks.drain().await;
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_deadline() {
        let tasks = BackgroundTasks::new("test");
        tasks.spawn("slow", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        assert!(!tasks.shutdown(Duration::from_secs(1)).await);
        assert!(tasks.shutdown(Duration::from_secs(120)).await);
    }
}
