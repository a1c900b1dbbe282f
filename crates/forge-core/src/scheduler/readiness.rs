// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dependency readiness over one run's job set.
//!
//! All jobs of a run are loaded once and indexed by name; every readiness
//! question is answered against that snapshot.

use std::collections::HashMap;

use crate::models::{Conclusion, Job, Status};

/// Whether a job may be dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Queued and every dependency concluded `success`.
    Ready,
    /// Queued, some dependency has not finished yet.
    Waiting,
    /// A dependency finished without success (or does not exist); the job
    /// can never run.
    Blocked {
        /// The offending dependency.
        dependency: String,
        /// Its conclusion, `None` when the dependency is missing.
        conclusion: Option<Conclusion>,
    },
    /// Not queued any more.
    NotQueued,
}

/// Arena of one run's jobs, keyed by job name.
pub struct JobGraph<'a> {
    jobs: &'a [Job],
    by_name: HashMap<&'a str, usize>,
}

impl<'a> JobGraph<'a> {
    /// Index `jobs`.
    pub fn new(jobs: &'a [Job]) -> Self {
        let by_name = jobs
            .iter()
            .enumerate()
            .map(|(i, j)| (j.name.as_str(), i))
            .collect();
        Self { jobs, by_name }
    }

    /// Look up a job by name.
    pub fn get(&self, name: &str) -> Option<&'a Job> {
        self.by_name.get(name).map(|&i| &self.jobs[i])
    }

    /// Readiness of `job` against its siblings.
    pub fn readiness(&self, job: &Job) -> Readiness {
        if job.status != Status::Queued {
            return Readiness::NotQueued;
        }

        let mut waiting = false;
        for need in &job.needs {
            match self.get(need) {
                None => {
                    return Readiness::Blocked {
                        dependency: need.clone(),
                        conclusion: None,
                    };
                }
                Some(dep) if dep.succeeded() => {}
                Some(dep) if dep.status.is_terminal() => {
                    return Readiness::Blocked {
                        dependency: need.clone(),
                        conclusion: dep.conclusion,
                    };
                }
                Some(_) => waiting = true,
            }
        }

        if waiting {
            Readiness::Waiting
        } else {
            Readiness::Ready
        }
    }

    /// Every job reached a terminal status.
    pub fn all_terminal(&self) -> bool {
        self.jobs.iter().all(|j| j.status.is_terminal())
    }

    /// Conclusion of the run once every job is terminal: `success` iff every
    /// job succeeded, `failure` otherwise.
    pub fn run_conclusion(&self) -> Option<Conclusion> {
        if !self.all_terminal() {
            return None;
        }
        Some(Conclusion::from_success(
            self.jobs.iter().all(|j| j.conclusion == Some(Conclusion::Success)),
        ))
    }
}
