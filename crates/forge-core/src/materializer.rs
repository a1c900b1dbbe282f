// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Run materializer.
//!
//! Turns a workflow plus a trigger into persisted run, job and step rows.
//! Everything is validated before the first write; the rows themselves are
//! created in a single transaction, so a failed materialization leaves
//! nothing behind.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::events::{RunEvent, RunEventSink};
use crate::models::{NewJob, NewRun, NewStep, WorkflowRun};
use crate::persistence::Persistence;
use crate::scheduler::JobScheduler;
use crate::workflow::{TriggerContext, Workflow, WorkflowDefinition, WorkflowParser};

/// Attempts at allocating a run number before giving up.
const MAX_RUN_NUMBER_ATTEMPTS: usize = 3;

/// Creates workflow runs and hands them to the scheduler.
pub struct RunMaterializer {
    persistence: Arc<dyn Persistence>,
    parser: Arc<dyn WorkflowParser>,
    scheduler: Arc<JobScheduler>,
    events: Arc<dyn RunEventSink>,
}

impl RunMaterializer {
    /// Create a materializer.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        parser: Arc<dyn WorkflowParser>,
        scheduler: Arc<JobScheduler>,
        events: Arc<dyn RunEventSink>,
    ) -> Self {
        Self {
            persistence,
            parser,
            scheduler,
            events,
        }
    }

    /// Materialize one run of `workflow` for `trigger`.
    ///
    /// Fails with [`CoreError::WorkflowDisabled`] or
    /// [`CoreError::InvalidWorkflow`] without writing anything.
    pub async fn materialize(
        &self,
        workflow: &Workflow,
        trigger: &TriggerContext,
    ) -> Result<WorkflowRun> {
        if !workflow.is_enabled() {
            return Err(CoreError::WorkflowDisabled {
                workflow_id: workflow.id.clone(),
            });
        }
        let definition = self.parser.parse(&workflow.content)?;
        self.materialize_definition(workflow, &definition, trigger)
            .await
    }

    /// Materialize every enabled workflow whose triggers match. Failures
    /// are logged per workflow and do not stop the others.
    pub async fn materialize_for_event(
        &self,
        workflows: &[Workflow],
        trigger: &TriggerContext,
    ) -> Vec<WorkflowRun> {
        let mut runs = Vec::new();

        for workflow in workflows.iter().filter(|w| w.is_enabled()) {
            let definition = match self.parser.parse(&workflow.content) {
                Ok(definition) => definition,
                Err(e) => {
                    warn!(workflow_id = %workflow.id, path = %workflow.path, error = %e, "Skipping invalid workflow");
                    continue;
                }
            };
            if !self.parser.should_trigger(&definition, trigger) {
                debug!(workflow_id = %workflow.id, event = %trigger.event, "Workflow not triggered");
                continue;
            }

            match self
                .materialize_definition(workflow, &definition, trigger)
                .await
            {
                Ok(run) => runs.push(run),
                Err(e) => {
                    warn!(workflow_id = %workflow.id, error = %e, "Failed to materialize workflow run")
                }
            }
        }

        runs
    }

    async fn materialize_definition(
        &self,
        workflow: &Workflow,
        definition: &WorkflowDefinition,
        trigger: &TriggerContext,
    ) -> Result<WorkflowRun> {
        let new_run = build_run(workflow, definition, trigger);
        let jobs = build_jobs(definition);

        let mut attempt = 0;
        let run = loop {
            attempt += 1;
            match self.persistence.create_run(&new_run, &jobs).await {
                Ok(run) => break run,
                Err(CoreError::RunNumberConflict { .. }) if attempt < MAX_RUN_NUMBER_ATTEMPTS => {
                    debug!(
                        repository_id = %new_run.repository_id,
                        attempt = attempt,
                        "Run number taken, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        };

        info!(
            run_id = %run.id,
            workflow_id = %workflow.id,
            run_number = run.run_number,
            jobs = jobs.len(),
            event = %run.event,
            "Materialized workflow run"
        );

        self.events
            .emit(RunEvent::workflow_run(&run, "requested"))
            .await;

        // The rows are durable at this point; a failed hand-off is picked up
        // by the next scheduler tick.
        if let Err(e) = self.scheduler.schedule_run(&run.id).await {
            warn!(run_id = %run.id, error = %e, "Initial scheduling failed");
        }

        Ok(run)
    }
}

fn build_run(
    workflow: &Workflow,
    definition: &WorkflowDefinition,
    trigger: &TriggerContext,
) -> NewRun {
    NewRun {
        workflow_id: workflow.id.clone(),
        repository_id: workflow.repository_id.clone(),
        organization_id: workflow.organization_id.clone(),
        name: definition
            .name
            .clone()
            .unwrap_or_else(|| workflow.name.clone()),
        event: trigger.event.clone(),
        head_sha: trigger.head_sha.clone(),
        head_branch: trigger.branch.clone(),
        actor: trigger.actor.clone(),
    }
}

fn build_jobs(definition: &WorkflowDefinition) -> Vec<NewJob> {
    definition
        .jobs
        .iter()
        .map(|(name, job)| {
            let mut env = definition.env.clone();
            env.extend(job.env.clone());

            NewJob {
                name: name.clone(),
                display_name: job.name.clone().unwrap_or_else(|| name.clone()),
                needs: job.needs.clone(),
                runs_on: job.runs_on.clone(),
                env,
                strategy: job.strategy.clone(),
                environment: job.environment.clone(),
                image: job.image.clone(),
                timeout_minutes: job.timeout_minutes,
                priority: job.priority,
                steps: job
                    .steps
                    .iter()
                    .map(|step| NewStep {
                        name: step.display_name(),
                        uses: step.uses.clone(),
                        run: step.run.clone(),
                        params: step.with.clone(),
                        env: step.env.clone(),
                    })
                    .collect(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::YamlWorkflowParser;

    const WORKFLOW: &str = r#"
name: CI
on: push
env:
  LEVEL: workflow
  SHARED: workflow
jobs:
  build:
    runs-on: [linux]
    env:
      SHARED: job
    steps:
      - run: make
      - name: Publish
        uses: actions/upload@v1
        with:
          path: dist
  test:
    name: Unit tests
    needs: build
    steps:
      - run: make test
"#;

    #[test]
    fn test_build_jobs_merges_env_and_names_steps() {
        let definition = YamlWorkflowParser.parse(WORKFLOW).unwrap();
        let jobs = build_jobs(&definition);

        assert_eq!(jobs.len(), 2);
        let build = &jobs[0];
        assert_eq!(build.display_name, "build");
        assert_eq!(build.env.get("LEVEL").map(String::as_str), Some("workflow"));
        assert_eq!(build.env.get("SHARED").map(String::as_str), Some("job"));
        assert_eq!(build.steps[0].name, "Run make");
        assert_eq!(build.steps[1].name, "Publish");
        assert_eq!(build.steps[1].params.get("path").map(String::as_str), Some("dist"));

        let test = &jobs[1];
        assert_eq!(test.display_name, "Unit tests");
        assert_eq!(test.needs, vec!["build".to_string()]);
    }

    #[test]
    fn test_build_run_prefers_definition_name() {
        let definition = YamlWorkflowParser.parse(WORKFLOW).unwrap();
        let workflow = Workflow {
            id: "wf".to_string(),
            repository_id: "repo".to_string(),
            organization_id: None,
            name: "ci.yml".to_string(),
            path: ".forge/workflows/ci.yml".to_string(),
            content: WORKFLOW.to_string(),
            state: crate::workflow::WorkflowState::Active,
        };
        let trigger = TriggerContext::new("push", "abc123").with_branch("main");

        let run = build_run(&workflow, &definition, &trigger);
        assert_eq!(run.name, "CI");
        assert_eq!(run.head_branch.as_deref(), Some("main"));
        assert_eq!(run.event, "push");
    }
}
