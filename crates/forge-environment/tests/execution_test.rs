// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end execution tests: step markers, log streaming, secret masking,
//! failure propagation, cancellation, timeouts and restart recovery.

mod common;

use std::time::Duration;

use common::{Ctx, ORG, REPO};
use forge_core::models::{Conclusion, LogSource, Status};
use forge_environment::backend::{MockBackend, MockBehavior};
use forge_environment::secrets::InMemorySecretResolver;
use futures::StreamExt;

const CHAIN: &str = r#"
on: push
jobs:
  A:
    runs-on: linux
    steps:
      - run: echo compiling
      - run: |
          echo linking
          exit 2
      - run: echo never
  B:
    runs-on: linux
    needs: [A]
    steps:
      - run: echo deploying
"#;

const DEPLOY: &str = r#"
on: push
jobs:
  deploy:
    runs-on: linux
    steps:
      - run: ./deploy.sh
      - run: ./verify.sh
"#;

#[tokio::test]
async fn test_steps_follow_markers_and_secrets_are_masked() {
    let secrets = InMemorySecretResolver::new()
        .with_organization_secret(ORG, "ORG_TOKEN", "org-level")
        .with_repository_secret(REPO, "API_TOKEN", "repo-level")
        .with_environment_secret(REPO, "production", "API_TOKEN", "s3cr3t-prod");
    let ctx = Ctx::with(MockBackend::new(), secrets, Duration::from_secs(60)).await;

    let content = r#"
on: push
jobs:
  build:
    runs-on: linux
    environment: production
    container: node:20
    env:
      NAME: forge
    steps:
      - name: Greet
        run: echo hello $NAME
      - name: Leak
        run: echo token $API_TOKEN
      - uses: actions/checkout@v4
"#;
    let run = ctx.trigger(content).await;
    let run = ctx.wait_run(&run.id).await;
    assert_eq!(run.conclusion, Some(Conclusion::Success));

    let created = ctx.backend.created().await;
    assert_eq!(created.len(), 1);
    let spec = &created[0];
    assert_eq!(spec.image, "node:20");
    assert_eq!(spec.env["FORGE_RUN_ID"], run.id);
    assert_eq!(spec.env["FORGE_REPOSITORY"], REPO);
    assert_eq!(spec.env["NAME"], "forge");
    assert_eq!(spec.env["API_TOKEN"], "s3cr3t-prod");
    assert_eq!(spec.env["ORG_TOKEN"], "org-level");
    assert!(spec.script.contains("actions/checkout@v4"));

    let job = ctx.job(&run.id, "build").await;
    assert_eq!(job.conclusion, Some(Conclusion::Success));
    let output = job.output.expect("job output");
    assert_eq!(output["exit_code"], 0);
    assert_eq!(output["steps"][0]["name"], "Greet");
    assert_eq!(output["steps"][2]["conclusion"], "success");

    let steps = ctx.persistence().list_steps(&job.id).await.unwrap();
    assert!(
        steps
            .iter()
            .all(|s| s.status == Status::Completed && s.conclusion == Some(Conclusion::Success))
    );
    assert_eq!(steps[0].output.as_deref(), Some("hello forge\n"));
    assert_eq!(steps[1].output.as_deref(), Some("token ***\n"));

    let step_logs = ctx.persistence().get_step_logs(&job.id, 2).await.unwrap();
    let messages: Vec<&str> = step_logs.iter().map(|l| l.message.as_str()).collect();
    assert_eq!(messages, vec!["token ***"]);
    assert_eq!(step_logs[0].source, LogSource::Remote);
    assert_eq!(step_logs[0].step_id.as_deref(), Some(steps[1].id.as_str()));

    let job_logs = ctx.runtime.log_hub().get_job_logs(&job.id).await.unwrap();
    assert!(job_logs.iter().all(|l| !l.message.contains("s3cr3t-prod")));
    assert!(
        job_logs
            .iter()
            .any(|l| l.source == LogSource::Orchestrator && l.step_id.is_none())
    );

    ctx.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failing_step_skips_rest_and_dependents() {
    let ctx = Ctx::new(MockBackend::new()).await;

    let run = ctx.trigger(CHAIN).await;
    let run = ctx.wait_run(&run.id).await;
    assert_eq!(run.status, Status::Completed);
    assert_eq!(run.conclusion, Some(Conclusion::Failure));

    let a = ctx.job(&run.id, "A").await;
    assert_eq!(a.conclusion, Some(Conclusion::Failure));
    assert_eq!(a.error.as_deref(), Some("step 2 failed with exit code 2"));
    assert_eq!(a.output.as_ref().unwrap()["steps"][2]["conclusion"], "skipped");

    let conclusions: Vec<Option<Conclusion>> = ctx
        .persistence()
        .list_steps(&a.id)
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.conclusion)
        .collect();
    assert_eq!(
        conclusions,
        vec![
            Some(Conclusion::Success),
            Some(Conclusion::Failure),
            Some(Conclusion::Skipped)
        ]
    );

    let b = ctx.job(&run.id, "B").await;
    assert_eq!(b.conclusion, Some(Conclusion::Skipped));
    assert!(b.started_at.is_none());

    let created: Vec<String> = ctx
        .backend
        .created()
        .await
        .into_iter()
        .map(|s| s.job_name)
        .collect();
    assert_eq!(created, vec!["A"]);

    ctx.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_live_subscriber_sees_lines_until_job_ends() {
    let mut backend = MockBackend::new();
    backend.line_delay = Duration::from_millis(50);
    let ctx = Ctx::new(backend).await;

    let content = r#"
on: push
jobs:
  build:
    runs-on: linux
    steps:
      - run: |
          echo one
          echo two
"#;
    let run = ctx.trigger(content).await;
    let job = ctx.job(&run.id, "build").await;
    let subscription = ctx.runtime.log_hub().subscribe(&job.id, "viewer");

    let lines: Vec<String> = tokio::time::timeout(
        Duration::from_secs(5),
        subscription
            .filter(|l| futures::future::ready(l.source == LogSource::Remote))
            .map(|l| l.message)
            .collect(),
    )
    .await
    .expect("stream ends when the job finishes");
    assert_eq!(lines, vec!["one", "two"]);

    ctx.wait_run(&run.id).await;
    assert!(!ctx.runtime.log_hub().has_stream(&job.id));

    ctx.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_cancel_tears_down_running_unit() {
    let ctx = Ctx::new(MockBackend::new().with_behavior("deploy", MockBehavior::Hang)).await;

    let run = ctx.trigger(DEPLOY).await;
    let job = ctx.wait_step_running(&run.id, "deploy").await;
    assert!(ctx.backend.is_running(&job.id).await);

    let cancellation = ctx.runtime.scheduler().cancel_run(&run.id).await.unwrap();
    assert!(cancellation.cancelled);
    assert_eq!(cancellation.in_flight_jobs, vec![job.id.clone()]);

    let run = ctx.wait_run(&run.id).await;
    assert_eq!(run.status, Status::Cancelled);
    assert_eq!(run.conclusion, Some(Conclusion::Cancelled));

    let job = ctx.job(&run.id, "deploy").await;
    assert_eq!(job.conclusion, Some(Conclusion::Cancelled));
    let steps = ctx.persistence().list_steps(&job.id).await.unwrap();
    assert!(
        steps
            .iter()
            .all(|s| s.conclusion == Some(Conclusion::Cancelled))
    );

    assert!(ctx.backend.teardowns().await.contains(&job.id));
    assert!(!ctx.backend.is_running(&job.id).await);

    ctx.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_create_failure_fails_job() {
    let ctx = Ctx::new(MockBackend::new().with_behavior("deploy", MockBehavior::FailCreate)).await;

    let run = ctx.trigger(DEPLOY).await;
    let run = ctx.wait_run(&run.id).await;
    assert_eq!(run.conclusion, Some(Conclusion::Failure));

    let job = ctx.job(&run.id, "deploy").await;
    assert_eq!(job.conclusion, Some(Conclusion::Failure));
    assert!(job.error.unwrap().contains("mock create failure"));

    let steps = ctx.persistence().list_steps(&job.id).await.unwrap();
    assert!(steps.iter().all(|s| s.conclusion == Some(Conclusion::Skipped)));

    let logs = ctx.persistence().get_job_logs(&job.id).await.unwrap();
    assert!(
        logs.iter()
            .any(|l| l.source == LogSource::Orchestrator && l.message.contains("mock create failure"))
    );

    ctx.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_timeout_tears_down_unit() {
    let ctx = Ctx::with(
        MockBackend::new().with_behavior("deploy", MockBehavior::Hang),
        InMemorySecretResolver::new(),
        Duration::from_millis(300),
    )
    .await;

    let run = ctx.trigger(DEPLOY).await;
    let run = ctx.wait_run(&run.id).await;
    assert_eq!(run.conclusion, Some(Conclusion::Failure));

    let job = ctx.job(&run.id, "deploy").await;
    assert_eq!(job.conclusion, Some(Conclusion::Failure));
    assert!(job.error.as_deref().unwrap().starts_with("job timed out after"));
    assert_eq!(job.output.as_ref().unwrap()["steps"][0]["conclusion"], "failure");

    let conclusions: Vec<Option<Conclusion>> = ctx
        .persistence()
        .list_steps(&job.id)
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.conclusion)
        .collect();
    assert_eq!(
        conclusions,
        vec![Some(Conclusion::Failure), Some(Conclusion::Skipped)]
    );
    assert_eq!(ctx.backend.teardowns().await, vec![job.id.clone()]);

    ctx.runtime.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_restart_fails_orphaned_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let persistence = common::database(&dir).await;

    // First process: the job hangs and shutdown gives up waiting for it.
    let first_backend =
        std::sync::Arc::new(MockBackend::new().with_behavior("deploy", MockBehavior::Hang));
    let first = common::start(
        persistence.clone(),
        first_backend,
        InMemorySecretResolver::new(),
        Duration::from_secs(60),
    )
    .await;
    let run = first
        .materializer()
        .materialize(&common::workflow(DEPLOY), &common::push())
        .await
        .unwrap();
    for _ in 0..400 {
        if first.executor().running_jobs() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(first.executor().running_jobs(), 1);
    assert!(first.shutdown().await.is_err());

    // Second process over the same database.
    let second_backend = std::sync::Arc::new(MockBackend::new());
    let second = common::start(
        persistence.clone(),
        second_backend.clone(),
        InMemorySecretResolver::new(),
        Duration::from_secs(60),
    )
    .await;

    let jobs = persistence.list_jobs(&run.id).await.unwrap();
    let job = &jobs[0];
    assert_eq!(job.conclusion, Some(Conclusion::Failure));
    assert_eq!(
        job.error.as_deref(),
        Some("orchestrator restarted while the job was running")
    );
    assert_eq!(second_backend.teardowns().await, vec![job.id.clone()]);

    let mut finished = None;
    for _ in 0..400 {
        let current = persistence.get_run(&run.id).await.unwrap().unwrap();
        if current.status.is_terminal() {
            finished = Some(current);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        finished.expect("run completes").conclusion,
        Some(Conclusion::Failure)
    );

    second.shutdown().await.unwrap();
}
