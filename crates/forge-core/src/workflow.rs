// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow definitions and the parser contract.
//!
//! The materializer only depends on [`WorkflowParser`]'s output: a named set of
//! jobs, each with `needs` and an ordered list of steps. [`YamlWorkflowParser`]
//! accepts GitHub-Actions-shaped YAML documents.

use std::collections::{BTreeMap, HashMap, VecDeque};

use serde::Deserialize;
use serde_json::Value as JsonValue;
use serde_yaml::Value as YamlValue;

use crate::error::{CoreError, Result};

/// Whether a stored workflow may produce runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowState {
    /// Produces runs when triggered.
    Active,
    /// Disabled by an administrator; triggering it is a validation error.
    Disabled,
}

/// A workflow file as stored for a repository.
#[derive(Debug, Clone)]
pub struct Workflow {
    /// Workflow identifier.
    pub id: String,
    /// Owning repository.
    pub repository_id: String,
    /// Owning organization, if any.
    pub organization_id: Option<String>,
    /// Display name used when the document does not set one.
    pub name: String,
    /// Path of the workflow file inside the repository.
    pub path: String,
    /// Raw document content.
    pub content: String,
    /// Enabled state.
    pub state: WorkflowState,
}

impl Workflow {
    /// Whether runs may be created from this workflow.
    pub fn is_enabled(&self) -> bool {
        self.state == WorkflowState::Active
    }
}

/// What caused a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerContext {
    /// Event name (`push`, `pull_request`, `workflow_dispatch`, ...).
    pub event: String,
    /// Event action (`opened`, `synchronize`, ...), if the event has one.
    pub action: Option<String>,
    /// Commit the run executes against.
    pub head_sha: String,
    /// Branch of the triggering ref.
    pub branch: Option<String>,
    /// User that caused the event.
    pub actor: Option<String>,
}

impl TriggerContext {
    /// Trigger for `event` at `head_sha`.
    pub fn new(event: impl Into<String>, head_sha: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            head_sha: head_sha.into(),
            ..Default::default()
        }
    }

    /// Set the branch.
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    /// Set the actor.
    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Set the action.
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }
}

/// Per-event trigger filter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    /// Branch globs that must match; empty means any branch.
    pub branches: Vec<String>,
    /// Branch globs that suppress the trigger.
    pub branches_ignore: Vec<String>,
    /// Allowed actions; empty means any action.
    pub types: Vec<String>,
}

impl EventFilter {
    fn matches(&self, context: &TriggerContext) -> bool {
        if !self.types.is_empty() {
            match &context.action {
                Some(action) if self.types.iter().any(|t| t == action) => {}
                _ => return false,
            }
        }

        if !self.branches.is_empty() {
            match &context.branch {
                Some(branch) if any_glob_matches(&self.branches, branch) => {}
                _ => return false,
            }
        }

        if let Some(branch) = &context.branch
            && any_glob_matches(&self.branches_ignore, branch)
        {
            return false;
        }

        true
    }
}

fn any_glob_matches(patterns: &[String], value: &str) -> bool {
    patterns.iter().any(|p| match glob::Pattern::new(p) {
        Ok(pattern) => pattern.matches(value),
        Err(_) => p == value,
    })
}

/// The `on:` section of a workflow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TriggerFilter {
    events: BTreeMap<String, EventFilter>,
}

impl TriggerFilter {
    /// Filter that fires on each of `events` unconditionally.
    pub fn on_events<I, S>(events: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            events: events
                .into_iter()
                .map(|e| (e.into(), EventFilter::default()))
                .collect(),
        }
    }

    /// Event names this workflow listens to.
    pub fn events(&self) -> impl Iterator<Item = &str> {
        self.events.keys().map(String::as_str)
    }

    /// Filter for a single event.
    pub fn filter(&self, event: &str) -> Option<&EventFilter> {
        self.events.get(event)
    }

    /// Whether `context` fires this workflow.
    pub fn matches(&self, context: &TriggerContext) -> bool {
        self.events
            .get(&context.event)
            .is_some_and(|filter| filter.matches(context))
    }
}

/// Parsed workflow document.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowDefinition {
    /// `name:` of the document.
    pub name: Option<String>,
    /// Trigger filter.
    pub on: TriggerFilter,
    /// Workflow level environment, inherited by every job.
    pub env: BTreeMap<String, String>,
    /// Jobs in declaration order, keyed by job name.
    pub jobs: Vec<(String, JobDefinition)>,
}

impl WorkflowDefinition {
    /// Look up a job by key.
    pub fn job(&self, name: &str) -> Option<&JobDefinition> {
        self.jobs.iter().find(|(n, _)| n == name).map(|(_, j)| j)
    }
}

/// One job of a workflow document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobDefinition {
    /// Display name.
    pub name: Option<String>,
    /// Jobs that must succeed first.
    pub needs: Vec<String>,
    /// Labels a worker must carry.
    pub runs_on: Vec<String>,
    /// Job environment.
    pub env: BTreeMap<String, String>,
    /// Ordered steps.
    pub steps: Vec<StepDefinition>,
    /// Parallelism strategy, kept verbatim.
    pub strategy: Option<JsonValue>,
    /// Deployment environment (secret scope).
    pub environment: Option<String>,
    /// Wall-clock limit in minutes.
    pub timeout_minutes: Option<i64>,
    /// Queue priority.
    pub priority: i64,
    /// Container image override.
    pub image: Option<String>,
}

/// One step of a job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepDefinition {
    /// Display name.
    pub name: Option<String>,
    /// Shell command.
    pub run: Option<String>,
    /// Action reference.
    pub uses: Option<String>,
    /// Action inputs.
    pub with: BTreeMap<String, String>,
    /// Step environment.
    pub env: BTreeMap<String, String>,
}

impl StepDefinition {
    /// Name shown for the step: explicit name, else derived from its action.
    pub fn display_name(&self) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        if let Some(uses) = &self.uses {
            return format!("Run {}", uses);
        }
        let first_line = self
            .run
            .as_deref()
            .and_then(|r| r.lines().map(str::trim).find(|l| !l.is_empty()))
            .unwrap_or_default();
        format!("Run {}", first_line)
    }
}

/// Turns workflow content into a definition and evaluates triggers.
pub trait WorkflowParser: Send + Sync {
    /// Parse and validate `content`.
    fn parse(&self, content: &str) -> Result<WorkflowDefinition>;

    /// Whether `definition` should run for `context`.
    fn should_trigger(&self, definition: &WorkflowDefinition, context: &TriggerContext) -> bool {
        definition.on.matches(context)
    }
}

/// Parser for GitHub-Actions-shaped YAML workflows.
#[derive(Debug, Clone, Copy, Default)]
pub struct YamlWorkflowParser;

impl WorkflowParser for YamlWorkflowParser {
    fn parse(&self, content: &str) -> Result<WorkflowDefinition> {
        let raw: RawWorkflow = serde_yaml::from_str(content)
            .map_err(|e| CoreError::invalid_workflow(format!("malformed YAML: {}", e)))?;

        let on = match raw.on {
            Some(value) => parse_triggers(&value)?,
            None => return Err(CoreError::invalid_workflow("missing 'on' section")),
        };

        let mut jobs = Vec::with_capacity(raw.jobs.len());
        for (key, value) in raw.jobs {
            let name = key
                .as_str()
                .ok_or_else(|| CoreError::invalid_workflow("job keys must be strings"))?
                .to_string();
            let job: RawJob = serde_yaml::from_value(value)
                .map_err(|e| CoreError::invalid_workflow(format!("job '{}': {}", name, e)))?;
            let job = job.into_definition(&name)?;
            jobs.push((name, job));
        }

        let definition = WorkflowDefinition {
            name: raw.name,
            on,
            env: scalar_map(raw.env, "env")?,
            jobs,
        };
        validate(&definition)?;
        Ok(definition)
    }
}

/// Structural checks shared by every parser: non-empty, well-formed steps,
/// resolvable `needs`, acyclic graph.
pub fn validate(definition: &WorkflowDefinition) -> Result<()> {
    if definition.jobs.is_empty() {
        return Err(CoreError::invalid_workflow("workflow has no jobs"));
    }

    let mut seen = HashMap::new();
    for (index, (name, job)) in definition.jobs.iter().enumerate() {
        if seen.insert(name.as_str(), index).is_some() {
            return Err(CoreError::invalid_workflow(format!(
                "duplicate job '{}'",
                name
            )));
        }
        if job.steps.is_empty() {
            return Err(CoreError::invalid_workflow(format!(
                "job '{}' has no steps",
                name
            )));
        }
        for (i, step) in job.steps.iter().enumerate() {
            match (&step.run, &step.uses) {
                (Some(_), None) | (None, Some(_)) => {}
                _ => {
                    return Err(CoreError::invalid_workflow(format!(
                        "job '{}' step {} must set exactly one of 'run' or 'uses'",
                        name,
                        i + 1
                    )));
                }
            }
        }
    }

    for (name, job) in &definition.jobs {
        for need in &job.needs {
            if need == name {
                return Err(CoreError::invalid_workflow(format!(
                    "job '{}' depends on itself",
                    name
                )));
            }
            if !seen.contains_key(need.as_str()) {
                return Err(CoreError::invalid_workflow(format!(
                    "job '{}' needs unknown job '{}'",
                    name, need
                )));
            }
        }
    }

    // Kahn's algorithm; anything left unvisited sits on a cycle.
    let mut indegree: Vec<usize> = definition.jobs.iter().map(|(_, j)| j.needs.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); definition.jobs.len()];
    for (index, (_, job)) in definition.jobs.iter().enumerate() {
        for need in &job.needs {
            dependents[seen[need.as_str()]].push(index);
        }
    }
    let mut queue: VecDeque<usize> = indegree
        .iter()
        .enumerate()
        .filter(|(_, d)| **d == 0)
        .map(|(i, _)| i)
        .collect();
    let mut visited = 0;
    while let Some(index) = queue.pop_front() {
        visited += 1;
        for &dependent in &dependents[index] {
            indegree[dependent] -= 1;
            if indegree[dependent] == 0 {
                queue.push_back(dependent);
            }
        }
    }
    if visited != definition.jobs.len() {
        let cyclic: Vec<&str> = definition
            .jobs
            .iter()
            .zip(&indegree)
            .filter(|(_, d)| **d > 0)
            .map(|((n, _), _)| n.as_str())
            .collect();
        return Err(CoreError::invalid_workflow(format!(
            "dependency cycle between jobs: {}",
            cyclic.join(", ")
        )));
    }

    Ok(())
}

// ============================================================================
// Raw document shapes
// ============================================================================

#[derive(Deserialize)]
struct RawWorkflow {
    name: Option<String>,
    on: Option<YamlValue>,
    #[serde(default)]
    env: BTreeMap<String, YamlValue>,
    #[serde(default)]
    jobs: serde_yaml::Mapping,
}

#[derive(Deserialize)]
#[serde(rename_all = "kebab-case")]
struct RawJob {
    name: Option<String>,
    #[serde(default)]
    needs: OneOrMany,
    #[serde(default)]
    runs_on: OneOrMany,
    #[serde(default)]
    env: BTreeMap<String, YamlValue>,
    #[serde(default)]
    steps: Vec<RawStep>,
    strategy: Option<YamlValue>,
    environment: Option<RawEnvironment>,
    timeout_minutes: Option<i64>,
    #[serde(default)]
    priority: i64,
    container: Option<RawContainer>,
}

impl RawJob {
    fn into_definition(self, job: &str) -> Result<JobDefinition> {
        let strategy = self
            .strategy
            .map(|s| {
                serde_json::to_value(&s).map_err(|e| {
                    CoreError::invalid_workflow(format!("job '{}' strategy: {}", job, e))
                })
            })
            .transpose()?;

        if let Some(minutes) = self.timeout_minutes
            && minutes <= 0
        {
            return Err(CoreError::invalid_workflow(format!(
                "job '{}' timeout-minutes must be positive",
                job
            )));
        }

        let mut steps = Vec::with_capacity(self.steps.len());
        for step in self.steps {
            steps.push(StepDefinition {
                name: step.name,
                run: step.run,
                uses: step.uses,
                with: scalar_map(step.with, "with")?,
                env: scalar_map(step.env, "env")?,
            });
        }

        Ok(JobDefinition {
            name: self.name,
            needs: self.needs.into_vec(),
            runs_on: self.runs_on.into_vec(),
            env: scalar_map(self.env, "env")?,
            steps,
            strategy,
            environment: self.environment.map(|e| match e {
                RawEnvironment::Name(name) => name,
                RawEnvironment::Detailed { name } => name,
            }),
            timeout_minutes: self.timeout_minutes,
            priority: self.priority,
            image: self.container.map(|c| match c {
                RawContainer::Image(image) => image,
                RawContainer::Detailed { image } => image,
            }),
        })
    }
}

#[derive(Deserialize)]
struct RawStep {
    name: Option<String>,
    run: Option<String>,
    uses: Option<String>,
    #[serde(default)]
    with: BTreeMap<String, YamlValue>,
    #[serde(default)]
    env: BTreeMap<String, YamlValue>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl Default for OneOrMany {
    fn default() -> Self {
        OneOrMany::Many(Vec::new())
    }
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawEnvironment {
    Name(String),
    Detailed { name: String },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawContainer {
    Image(String),
    Detailed { image: String },
}

fn scalar_map(map: BTreeMap<String, YamlValue>, field: &str) -> Result<BTreeMap<String, String>> {
    map.into_iter()
        .map(|(key, value)| {
            let value = match value {
                YamlValue::String(s) => s,
                YamlValue::Bool(b) => b.to_string(),
                YamlValue::Number(n) => n.to_string(),
                YamlValue::Null => String::new(),
                _ => {
                    return Err(CoreError::invalid_workflow(format!(
                        "'{}.{}' must be a scalar",
                        field, key
                    )));
                }
            };
            Ok((key, value))
        })
        .collect()
}

fn parse_triggers(value: &YamlValue) -> Result<TriggerFilter> {
    let mut events = BTreeMap::new();
    match value {
        YamlValue::String(event) => {
            events.insert(event.clone(), EventFilter::default());
        }
        YamlValue::Sequence(items) => {
            for item in items {
                let event = item
                    .as_str()
                    .ok_or_else(|| CoreError::invalid_workflow("'on' list entries must be strings"))?;
                events.insert(event.to_string(), EventFilter::default());
            }
        }
        YamlValue::Mapping(map) => {
            for (key, config) in map {
                let event = key
                    .as_str()
                    .ok_or_else(|| CoreError::invalid_workflow("'on' keys must be strings"))?;
                events.insert(event.to_string(), parse_event_filter(event, config)?);
            }
        }
        _ => return Err(CoreError::invalid_workflow("'on' must be a string, list or map")),
    }

    if events.is_empty() {
        return Err(CoreError::invalid_workflow("'on' lists no events"));
    }
    Ok(TriggerFilter { events })
}

fn parse_event_filter(event: &str, config: &YamlValue) -> Result<EventFilter> {
    let map = match config {
        YamlValue::Null => return Ok(EventFilter::default()),
        YamlValue::Mapping(map) => map,
        _ => {
            return Err(CoreError::invalid_workflow(format!(
                "'on.{}' must be a map",
                event
            )));
        }
    };

    let list = |key: &str| -> Result<Vec<String>> {
        match map.get(key) {
            None | Some(YamlValue::Null) => Ok(Vec::new()),
            Some(value) => serde_yaml::from_value::<OneOrMany>(value.clone())
                .map(OneOrMany::into_vec)
                .map_err(|_| {
                    CoreError::invalid_workflow(format!(
                        "'on.{}.{}' must be a string or list of strings",
                        event, key
                    ))
                }),
        }
    };

    let filter = EventFilter {
        branches: list("branches")?,
        branches_ignore: list("branches-ignore")?,
        types: list("types")?,
    };

    for pattern in filter.branches.iter().chain(&filter.branches_ignore) {
        glob::Pattern::new(pattern).map_err(|e| {
            CoreError::invalid_workflow(format!("invalid branch pattern '{}': {}", pattern, e))
        })?;
    }

    Ok(filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    const CI: &str = r#"
name: CI
on:
  push:
    branches: [main, "release/*"]
  pull_request:
    types: [opened, synchronize]
env:
  RUST_LOG: debug
  RETRIES: 3
jobs:
  build:
    runs-on: [linux, x64]
    timeout-minutes: 10
    steps:
      - uses: actions/checkout@v4
        with:
          fetch-depth: 1
      - name: Compile
        run: cargo build
  test:
    needs: build
    runs-on: linux
    environment: staging
    container: rust:1.85
    strategy:
      matrix:
        toolchain: [stable, beta]
    steps:
      - run: |
          cargo test
          echo done
"#;

    #[test]
    fn test_parse_full_document() {
        let def = YamlWorkflowParser.parse(CI).expect("parse");
        assert_eq!(def.name.as_deref(), Some("CI"));
        assert_eq!(def.env.get("RETRIES").map(String::as_str), Some("3"));

        let names: Vec<&str> = def.jobs.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["build", "test"]);

        let build = def.job("build").expect("build");
        assert_eq!(build.runs_on, vec!["linux", "x64"]);
        assert_eq!(build.timeout_minutes, Some(10));
        assert_eq!(build.steps.len(), 2);
        assert_eq!(build.steps[0].with.get("fetch-depth").map(String::as_str), Some("1"));
        assert_eq!(build.steps[0].display_name(), "Run actions/checkout@v4");
        assert_eq!(build.steps[1].display_name(), "Compile");

        let test = def.job("test").expect("test");
        assert_eq!(test.needs, vec!["build"]);
        assert_eq!(test.runs_on, vec!["linux"]);
        assert_eq!(test.environment.as_deref(), Some("staging"));
        assert_eq!(test.image.as_deref(), Some("rust:1.85"));
        assert!(test.strategy.is_some());
        assert_eq!(test.steps[0].display_name(), "Run cargo test");
    }

    #[test]
    fn test_trigger_forms() {
        let def = YamlWorkflowParser
            .parse("on: push\njobs:\n  a:\n    steps:\n      - run: 'true'\n")
            .expect("string form");
        assert_eq!(def.on.events().collect::<Vec<_>>(), vec!["push"]);

        let def = YamlWorkflowParser
            .parse("on: [push, workflow_dispatch]\njobs:\n  a:\n    steps:\n      - run: 'true'\n")
            .expect("list form");
        assert_eq!(
            def.on.events().collect::<Vec<_>>(),
            vec!["push", "workflow_dispatch"]
        );
    }

    #[test]
    fn test_should_trigger_filters() {
        let def = YamlWorkflowParser.parse(CI).expect("parse");
        let parser = YamlWorkflowParser;

        assert!(parser.should_trigger(&def, &TriggerContext::new("push", "abc").with_branch("main")));
        assert!(parser.should_trigger(
            &def,
            &TriggerContext::new("push", "abc").with_branch("release/1.2")
        ));
        assert!(!parser.should_trigger(
            &def,
            &TriggerContext::new("push", "abc").with_branch("feature/x")
        ));
        assert!(!parser.should_trigger(&def, &TriggerContext::new("push", "abc")));

        assert!(parser.should_trigger(
            &def,
            &TriggerContext::new("pull_request", "abc").with_action("opened")
        ));
        assert!(!parser.should_trigger(
            &def,
            &TriggerContext::new("pull_request", "abc").with_action("closed")
        ));
        assert!(!parser.should_trigger(&def, &TriggerContext::new("issues", "abc")));
    }

    #[test]
    fn test_branches_ignore() {
        let def = YamlWorkflowParser
            .parse(
                "on:\n  push:\n    branches-ignore: ['dependabot/**']\njobs:\n  a:\n    steps:\n      - run: 'true'\n",
            )
            .expect("parse");
        assert!(def.on.matches(&TriggerContext::new("push", "x").with_branch("main")));
        assert!(!def.on.matches(
            &TriggerContext::new("push", "x").with_branch("dependabot/cargo/serde")
        ));
    }

    #[test]
    fn test_rejects_invalid_documents() {
        let cases = [
            ("jobs:\n  a:\n    steps:\n      - run: x\n", "missing 'on'"),
            ("on: push\njobs: {}\n", "no jobs"),
            ("on: push\njobs:\n  a:\n    steps: []\n", "has no steps"),
            (
                "on: push\njobs:\n  a:\n    steps:\n      - run: x\n        uses: y\n",
                "exactly one",
            ),
            (
                "on: push\njobs:\n  a:\n    needs: b\n    steps:\n      - run: x\n",
                "unknown job 'b'",
            ),
            (
                "on: push\njobs:\n  a:\n    needs: a\n    steps:\n      - run: x\n",
                "depends on itself",
            ),
            ("on: push\njobs: [", "malformed YAML"),
        ];

        for (content, expected) in cases {
            let err = YamlWorkflowParser.parse(content).expect_err(content);
            assert_eq!(err.error_code(), "INVALID_WORKFLOW");
            assert!(
                err.to_string().contains(expected),
                "'{}' should mention '{}'",
                err,
                expected
            );
        }
    }

    #[test]
    fn test_rejects_cycles() {
        let content = r#"
on: push
jobs:
  a:
    needs: c
    steps: [{ run: x }]
  b:
    needs: a
    steps: [{ run: x }]
  c:
    needs: b
    steps: [{ run: x }]
  d:
    steps: [{ run: x }]
"#;
        let err = YamlWorkflowParser.parse(content).expect_err("cycle");
        let message = err.to_string();
        assert!(message.contains("cycle"));
        assert!(message.contains("a, b, c"));
        assert!(!message.contains(", d"));
    }
}
