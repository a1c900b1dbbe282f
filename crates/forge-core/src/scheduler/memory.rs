// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process job queue and worker registry.
//!
//! Used by single-node deployments and by tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use super::collaborators::{
    CollaboratorError, JobQueue, QueuedJob, Worker, WorkerRegistry, WorkerStatus,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Completion reported through [`JobQueue::complete`].
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedJob {
    /// Whether the job succeeded.
    pub success: bool,
    /// Output summary.
    pub output: Option<Value>,
}

/// Completions kept by default; older ones are forgotten first.
pub const DEFAULT_COMPLETION_HISTORY: usize = 1024;

/// Most recent completions, bounded to `capacity` entries.
struct CompletionHistory {
    capacity: usize,
    order: VecDeque<String>,
    entries: HashMap<String, CompletedJob>,
}

impl CompletionHistory {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    fn record(&mut self, job_id: &str, completed: CompletedJob) {
        if self.entries.insert(job_id.to_string(), completed).is_none() {
            self.order.push_back(job_id.to_string());
        }
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }
}

/// Priority queue held in memory.
pub struct InMemoryJobQueue {
    pending: Mutex<Vec<QueuedJob>>,
    completed: Mutex<CompletionHistory>,
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::with_completion_history(DEFAULT_COMPLETION_HISTORY)
    }
}

impl InMemoryJobQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty queue remembering at most `capacity` completions.
    pub fn with_completion_history(capacity: usize) -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            completed: Mutex::new(CompletionHistory::new(capacity)),
        }
    }

    /// Number of queued jobs.
    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `job_id` is queued.
    pub fn contains(&self, job_id: &str) -> bool {
        lock(&self.pending).iter().any(|j| j.job_id == job_id)
    }

    /// Completion reported for `job_id`, if still remembered.
    pub fn completion(&self, job_id: &str) -> Option<CompletedJob> {
        lock(&self.completed).entries.get(job_id).cloned()
    }

    /// Number of remembered completions.
    pub fn completions(&self) -> usize {
        lock(&self.completed).entries.len()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, job: QueuedJob) -> Result<(), CollaboratorError> {
        let mut pending = lock(&self.pending);
        if pending.iter().any(|j| j.job_id == job.job_id) {
            debug!(job_id = %job.job_id, "Job already queued");
            return Ok(());
        }
        pending.push(job);
        Ok(())
    }

    async fn dequeue(&self, labels: &[String]) -> Result<Option<QueuedJob>, CollaboratorError> {
        let mut pending = lock(&self.pending);
        let best = pending
            .iter()
            .enumerate()
            .filter(|(_, j)| j.matches(labels))
            .min_by(|(_, a), (_, b)| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.enqueued_at.cmp(&b.enqueued_at))
            })
            .map(|(i, _)| i);
        Ok(best.map(|i| pending.remove(i)))
    }

    async fn complete(
        &self,
        job_id: &str,
        success: bool,
        output: Option<&Value>,
    ) -> Result<(), CollaboratorError> {
        lock(&self.completed).record(
            job_id,
            CompletedJob {
                success,
                output: output.cloned(),
            },
        );
        Ok(())
    }

    async fn remove(&self, job_id: &str) -> Result<bool, CollaboratorError> {
        let mut pending = lock(&self.pending);
        let before = pending.len();
        pending.retain(|j| j.job_id != job_id);
        Ok(pending.len() != before)
    }
}

struct WorkerSlot {
    worker: Worker,
    job_id: Option<String>,
    assignments: usize,
    releases: usize,
}

/// Worker registry held in memory, in registration order.
#[derive(Default)]
pub struct InMemoryWorkerRegistry {
    slots: Mutex<Vec<WorkerSlot>>,
}

impl InMemoryWorkerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with `workers`.
    pub fn with_workers(workers: impl IntoIterator<Item = Worker>) -> Self {
        let registry = Self::new();
        for worker in workers {
            registry.register(worker);
        }
        registry
    }

    /// Add or replace a worker.
    pub fn register(&self, worker: Worker) {
        let mut slots = lock(&self.slots);
        slots.retain(|s| s.worker.id != worker.id);
        slots.push(WorkerSlot {
            worker,
            job_id: None,
            assignments: 0,
            releases: 0,
        });
    }

    /// Force a worker's status (e.g. `Offline` on disconnect).
    pub fn set_status(&self, worker_id: &str, status: WorkerStatus) -> bool {
        let mut slots = lock(&self.slots);
        match slots.iter_mut().find(|s| s.worker.id == worker_id) {
            Some(slot) => {
                slot.worker.status = status;
                true
            }
            None => false,
        }
    }

    /// Job currently assigned to `worker_id`.
    pub fn current_job(&self, worker_id: &str) -> Option<String> {
        lock(&self.slots)
            .iter()
            .find(|s| s.worker.id == worker_id)
            .and_then(|s| s.job_id.clone())
    }

    /// `(assignments, releases)` seen by `worker_id`.
    pub fn counters(&self, worker_id: &str) -> (usize, usize) {
        lock(&self.slots)
            .iter()
            .find(|s| s.worker.id == worker_id)
            .map(|s| (s.assignments, s.releases))
            .unwrap_or((0, 0))
    }
}

#[async_trait]
impl WorkerRegistry for InMemoryWorkerRegistry {
    async fn list(&self, status: Option<WorkerStatus>) -> Result<Vec<Worker>, CollaboratorError> {
        Ok(lock(&self.slots)
            .iter()
            .filter(|s| status.is_none_or(|st| s.worker.status == st))
            .map(|s| s.worker.clone())
            .collect())
    }

    async fn assign(&self, job_id: &str, worker_id: &str) -> Result<(), CollaboratorError> {
        let mut slots = lock(&self.slots);
        let slot = slots
            .iter_mut()
            .find(|s| s.worker.id == worker_id)
            .ok_or_else(|| CollaboratorError::UnknownWorker(worker_id.to_string()))?;

        if slot.worker.status != WorkerStatus::Online {
            return Err(CollaboratorError::WorkerUnavailable(worker_id.to_string()));
        }

        slot.worker.status = WorkerStatus::Busy;
        slot.job_id = Some(job_id.to_string());
        slot.assignments += 1;
        Ok(())
    }

    async fn release(&self, worker_id: &str) -> Result<(), CollaboratorError> {
        let mut slots = lock(&self.slots);
        let slot = slots
            .iter_mut()
            .find(|s| s.worker.id == worker_id)
            .ok_or_else(|| CollaboratorError::UnknownWorker(worker_id.to_string()))?;

        if slot.job_id.is_none() {
            warn!(worker_id = %worker_id, "Released a worker that had no job");
        }
        if slot.worker.status == WorkerStatus::Busy {
            slot.worker.status = WorkerStatus::Online;
        }
        slot.job_id = None;
        slot.releases += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn queued(id: &str, labels: &[&str], priority: i64, age_secs: i64) -> QueuedJob {
        QueuedJob {
            job_id: id.to_string(),
            run_id: "run".to_string(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
            priority,
            enqueued_at: Utc::now() - Duration::seconds(age_secs),
        }
    }

    fn labels(l: &[&str]) -> Vec<String> {
        l.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_dequeue_respects_labels_and_priority() {
        let queue = InMemoryJobQueue::new();
        queue.enqueue(queued("gpu", &["linux", "gpu"], 10, 0)).await.unwrap();
        queue.enqueue(queued("old", &["linux"], 0, 60)).await.unwrap();
        queue.enqueue(queued("new", &["linux"], 0, 1)).await.unwrap();
        queue.enqueue(queued("urgent", &["linux"], 5, 0)).await.unwrap();
        queue.enqueue(queued("urgent", &["linux"], 5, 0)).await.unwrap();
        assert_eq!(queue.len(), 4);

        let worker = labels(&["linux", "x64"]);
        let order: Vec<String> = [
            queue.dequeue(&worker).await.unwrap(),
            queue.dequeue(&worker).await.unwrap(),
            queue.dequeue(&worker).await.unwrap(),
        ]
        .into_iter()
        .map(|j| j.expect("job").job_id)
        .collect();
        assert_eq!(order, vec!["urgent", "old", "new"]);

        assert!(queue.dequeue(&worker).await.unwrap().is_none());
        assert!(queue.contains("gpu"));
        assert!(queue.remove("gpu").await.unwrap());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_completion_history_is_bounded() {
        let queue = InMemoryJobQueue::with_completion_history(2);
        queue.complete("a", true, None).await.unwrap();
        queue.complete("b", false, None).await.unwrap();
        queue.complete("a", false, None).await.unwrap();
        assert_eq!(queue.completions(), 2);
        assert_eq!(queue.completion("a").map(|c| c.success), Some(false));

        queue.complete("c", true, None).await.unwrap();
        assert_eq!(queue.completions(), 2);
        assert!(queue.completion("a").is_none());
        assert!(queue.completion("b").is_some());
        assert!(queue.completion("c").is_some());

        for i in 0..10_000 {
            queue.complete(&format!("job-{}", i), true, None).await.unwrap();
        }
        assert_eq!(queue.completions(), 2);
    }

    #[tokio::test]
    async fn test_worker_assign_and_release() {
        let registry = InMemoryWorkerRegistry::with_workers([
            Worker::new("w1", ["linux"]),
            Worker::new("w2", ["linux"]),
        ]);

        registry.assign("job-1", "w1").await.unwrap();
        assert!(matches!(
            registry.assign("job-2", "w1").await,
            Err(CollaboratorError::WorkerUnavailable(_))
        ));

        let online = registry.list(Some(WorkerStatus::Online)).await.unwrap();
        assert_eq!(online.len(), 1);
        assert_eq!(online[0].id, "w2");
        assert_eq!(registry.current_job("w1").as_deref(), Some("job-1"));

        registry.release("w1").await.unwrap();
        assert_eq!(registry.counters("w1"), (1, 1));
        assert_eq!(registry.list(Some(WorkerStatus::Online)).await.unwrap().len(), 2);

        registry.set_status("w2", WorkerStatus::Offline);
        assert!(registry.assign("job-3", "w2").await.is_err());
        assert!(matches!(
            registry.assign("job-3", "ghost").await,
            Err(CollaboratorError::UnknownWorker(_))
        ));
    }
}
