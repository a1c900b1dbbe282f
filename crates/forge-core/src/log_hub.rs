// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Live log fan-out.
//!
//! [`LogHub`] is a per-job publish/subscribe registry. Each job stream owns
//! its own subscriber map behind its own lock, so publishing to one job never
//! contends with another. Delivery to live viewers is best effort: every
//! subscriber has a bounded buffer and a full buffer drops the line for that
//! subscriber only. Independently of viewers, every published line is
//! persisted for later retrieval.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use dashmap::DashMap;
use futures::Stream;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::models::LogEntry;
use crate::persistence::Persistence;

/// Default per-subscriber buffer.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

struct JobStream {
    subscribers: Mutex<HashMap<String, mpsc::Sender<LogEntry>>>,
    inactive: AtomicBool,
    dropped: AtomicU64,
}

impl JobStream {
    fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            inactive: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    fn subscribers(&self) -> MutexGuard<'_, HashMap<String, mpsc::Sender<LogEntry>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Live subscriber count, forgetting receivers that were dropped.
    fn live_subscribers(&self) -> usize {
        let mut subscribers = self.subscribers();
        subscribers.retain(|_, tx| !tx.is_closed());
        subscribers.len()
    }
}

/// Result of one maintenance sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Streams newly marked inactive.
    pub marked: usize,
    /// Streams removed after staying inactive for a whole sweep interval.
    pub removed: usize,
}

/// Registry of live job log streams.
pub struct LogHub {
    streams: DashMap<String, Arc<JobStream>>,
    persistence: Arc<dyn Persistence>,
    buffer: usize,
}

impl LogHub {
    /// Create a hub persisting through `persistence` with `buffer` lines of
    /// headroom per subscriber.
    pub fn new(persistence: Arc<dyn Persistence>, buffer: usize) -> Self {
        Self {
            streams: DashMap::new(),
            persistence,
            buffer: buffer.max(1),
        }
    }

    /// Create an empty stream for `job_id`. Idempotent.
    pub fn start(&self, job_id: &str) {
        self.streams
            .entry(job_id.to_string())
            .or_insert_with(|| Arc::new(JobStream::new()));
    }

    /// Subscribe to live lines of `job_id`, creating the stream on demand.
    ///
    /// Re-subscribing with the same `subscriber_id` replaces (and closes) the
    /// previous subscription.
    pub fn subscribe(&self, job_id: &str, subscriber_id: &str) -> LogSubscription {
        let (tx, rx) = mpsc::channel(self.buffer);

        // Registered while holding the map entry so a concurrent sweep cannot
        // remove the stream between lookup and insert.
        let entry = self
            .streams
            .entry(job_id.to_string())
            .or_insert_with(|| Arc::new(JobStream::new()));
        entry.inactive.store(false, Ordering::SeqCst);
        entry.subscribers().insert(subscriber_id.to_string(), tx);
        drop(entry);

        debug!(job_id = %job_id, subscriber_id = %subscriber_id, "Log subscriber added");

        LogSubscription {
            job_id: job_id.to_string(),
            subscriber_id: subscriber_id.to_string(),
            receiver: rx,
        }
    }

    /// Remove a subscriber; its sequence ends. Returns whether it existed.
    pub fn unsubscribe(&self, job_id: &str, subscriber_id: &str) -> bool {
        let Some(stream) = self.stream(job_id) else {
            return false;
        };
        let removed = stream.subscribers().remove(subscriber_id).is_some();
        if removed {
            debug!(job_id = %job_id, subscriber_id = %subscriber_id, "Log subscriber removed");
        }
        removed
    }

    /// Fan `entry` out to live subscribers, then persist it.
    ///
    /// Never blocks on a subscriber. Publishing to a job without a stream or
    /// without subscribers only persists.
    pub async fn publish(&self, entry: LogEntry) -> Result<()> {
        self.fan_out(&entry);
        self.persistence.append_log(&entry).await
    }

    fn fan_out(&self, entry: &LogEntry) {
        let Some(stream) = self.stream(&entry.job_id) else {
            return;
        };

        let mut subscribers = stream.subscribers();
        subscribers.retain(|subscriber_id, tx| match tx.try_send(entry.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                stream.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    job_id = %entry.job_id,
                    subscriber_id = %subscriber_id,
                    "Log subscriber buffer full, dropping entry"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Close every subscriber of `job_id` and remove the stream.
    pub fn stop(&self, job_id: &str) {
        if let Some((_, stream)) = self.streams.remove(job_id) {
            let closed = {
                let mut subscribers = stream.subscribers();
                let count = subscribers.len();
                subscribers.clear();
                count
            };
            debug!(job_id = %job_id, subscribers = closed, "Log stream stopped");
        }
    }

    /// Whether a stream exists for `job_id`.
    pub fn has_stream(&self, job_id: &str) -> bool {
        self.streams.contains_key(job_id)
    }

    /// Number of live subscribers of `job_id`.
    pub fn subscriber_count(&self, job_id: &str) -> usize {
        self.stream(job_id)
            .map(|s| s.live_subscribers())
            .unwrap_or(0)
    }

    /// Entries dropped for `job_id` because a subscriber buffer was full.
    pub fn dropped_count(&self, job_id: &str) -> u64 {
        self.stream(job_id)
            .map(|s| s.dropped.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Persisted lines of a job.
    pub async fn get_job_logs(&self, job_id: &str) -> Result<Vec<LogEntry>> {
        self.persistence.get_job_logs(job_id).await
    }

    /// Persisted lines of step `number` of a job.
    pub async fn get_step_logs(&self, job_id: &str, number: i64) -> Result<Vec<LogEntry>> {
        self.persistence.get_step_logs(job_id, number).await
    }

    /// Mark subscriber-less streams inactive; remove streams that were
    /// already inactive on the previous sweep and still have no subscribers.
    pub fn sweep(&self) -> SweepStats {
        let mut stats = SweepStats::default();
        let mut stale = Vec::new();

        for entry in self.streams.iter() {
            let stream = entry.value();
            if stream.live_subscribers() > 0 {
                stream.inactive.store(false, Ordering::SeqCst);
            } else if stream.inactive.swap(true, Ordering::SeqCst) {
                stale.push(entry.key().clone());
            } else {
                stats.marked += 1;
            }
        }

        for job_id in stale {
            let removed = self.streams.remove_if(&job_id, |_, stream| {
                stream.inactive.load(Ordering::SeqCst) && stream.live_subscribers() == 0
            });
            if removed.is_some() {
                stats.removed += 1;
            }
        }

        stats
    }

    fn stream(&self, job_id: &str) -> Option<Arc<JobStream>> {
        self.streams.get(job_id).map(|s| s.value().clone())
    }
}

/// Lazy sequence of live log lines for one subscriber.
///
/// Ends when the subscriber is removed or the stream is stopped.
pub struct LogSubscription {
    job_id: String,
    subscriber_id: String,
    receiver: mpsc::Receiver<LogEntry>,
}

impl LogSubscription {
    /// Job this subscription follows.
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Subscriber identifier.
    pub fn subscriber_id(&self) -> &str {
        &self.subscriber_id
    }

    /// Next line, or `None` once the subscription ended.
    pub async fn recv(&mut self) -> Option<LogEntry> {
        self.receiver.recv().await
    }

    /// Next buffered line without waiting.
    pub fn try_recv(&mut self) -> Option<LogEntry> {
        self.receiver.try_recv().ok()
    }
}

impl Stream for LogSubscription {
    type Item = LogEntry;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

/// Configuration for the log hub sweeper.
#[derive(Debug, Clone)]
pub struct LogHubSweeperConfig {
    /// Time between sweeps.
    pub poll_interval: Duration,
}

impl Default for LogHubSweeperConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
        }
    }
}

/// Background worker running [`LogHub::sweep`] periodically.
pub struct LogHubSweeper {
    hub: Arc<LogHub>,
    config: LogHubSweeperConfig,
    shutdown: Arc<Notify>,
}

impl LogHubSweeper {
    /// Create a sweeper for `hub`.
    pub fn new(hub: Arc<LogHub>, config: LogHubSweeperConfig) -> Self {
        Self {
            hub,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Log hub sweeper started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Log hub sweeper received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    let stats = self.hub.sweep();
                    if stats.marked > 0 || stats.removed > 0 {
                        info!(marked = stats.marked, removed = stats.removed, "Swept log streams");
                    } else {
                        debug!("No idle log streams");
                    }
                }
            }
        }

        info!("Log hub sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use sqlx::sqlite::SqlitePoolOptions;

    use crate::models::{LogLevel, LogSource};
    use crate::persistence::SqlitePersistence;

    async fn test_hub(buffer: usize) -> LogHub {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("Failed to create in-memory SQLite pool");
        crate::migrations::SQLITE
            .run(&pool)
            .await
            .expect("Failed to run migrations");
        LogHub::new(Arc::new(SqlitePersistence::new(pool)), buffer)
    }

    fn line(job_id: &str, message: &str) -> LogEntry {
        LogEntry::new(job_id, None, LogLevel::Info, LogSource::Remote, message)
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_persists() {
        let hub = test_hub(4).await;

        for i in 0..10 {
            hub.publish(line("job-1", &format!("line {}", i)))
                .await
                .expect("publish must not fail without a stream");
        }

        hub.start("job-1");
        let mut sub = hub.subscribe("job-1", "viewer");
        hub.unsubscribe("job-1", "viewer");
        hub.publish(line("job-1", "after unsubscribe"))
            .await
            .expect("publish after unsubscribe");
        assert!(sub.next().await.is_none());

        let stored = hub.get_job_logs("job-1").await.expect("logs");
        assert_eq!(stored.len(), 11);
        assert_eq!(stored[10].message, "after unsubscribe");
    }

    #[tokio::test]
    async fn test_full_buffer_drops_only_for_slow_subscriber() {
        let hub = test_hub(2).await;
        let mut slow = hub.subscribe("job-1", "slow");
        let mut fast = hub.subscribe("job-1", "fast");

        for i in 0..3 {
            hub.publish(line("job-1", &format!("{}", i)))
                .await
                .expect("publish");
            assert_eq!(fast.recv().await.expect("fast line").message, i.to_string());
        }

        assert_eq!(hub.dropped_count("job-1"), 1);

        // Drain the slow subscriber; later entries flow again.
        assert_eq!(slow.try_recv().expect("first").message, "0");
        assert_eq!(slow.try_recv().expect("second").message, "1");
        assert!(slow.try_recv().is_none());

        hub.publish(line("job-1", "3")).await.expect("publish");
        assert_eq!(slow.recv().await.expect("later line").message, "3");

        assert_eq!(hub.get_job_logs("job-1").await.expect("logs").len(), 4);
    }

    #[tokio::test]
    async fn test_stop_closes_subscribers() {
        let hub = test_hub(8).await;
        let mut a = hub.subscribe("job-1", "a");
        let mut b = hub.subscribe("job-1", "b");
        let mut other = hub.subscribe("job-2", "c");

        hub.stop("job-1");
        assert!(!hub.has_stream("job-1"));
        assert!(a.next().await.is_none());
        assert!(b.next().await.is_none());

        hub.publish(line("job-2", "still here")).await.expect("publish");
        assert_eq!(other.recv().await.expect("line").message, "still here");
    }

    #[tokio::test]
    async fn test_sweep_removes_idle_streams_after_grace() {
        let hub = test_hub(8).await;
        hub.start("idle");
        let _watcher = hub.subscribe("watched", "viewer");

        {
            let dropped = hub.subscribe("abandoned", "gone");
            drop(dropped);
        }

        let first = hub.sweep();
        assert_eq!(first, SweepStats { marked: 2, removed: 0 });
        assert!(hub.has_stream("idle"));

        let second = hub.sweep();
        assert_eq!(second, SweepStats { marked: 0, removed: 2 });
        assert!(!hub.has_stream("idle"));
        assert!(!hub.has_stream("abandoned"));
        assert!(hub.has_stream("watched"));
        assert_eq!(hub.subscriber_count("watched"), 1);
    }

    #[tokio::test]
    async fn test_resubscribe_revives_marked_stream() {
        let hub = test_hub(8).await;
        hub.start("job-1");
        assert_eq!(hub.sweep().marked, 1);

        let _sub = hub.subscribe("job-1", "late");
        assert_eq!(hub.sweep(), SweepStats::default());
        assert!(hub.has_stream("job-1"));
    }
}
