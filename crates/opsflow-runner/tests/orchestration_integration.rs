#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity
#![cfg(unix)]

//! Integration tests for workflow orchestration.
//!
//! Workflows are built in code and run through a `/bin/sh` pool with the
//! POSIX dialect. An in-memory store stands in for the catalog and log
//! database, except in the final end-to-end test.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use opsflow_core::config::InterpreterSettings;
use opsflow_core::text::SECRET_MASK;
use opsflow_runner::orchestration::{
    EventStatus, ExecutionControl, ExecutionError, ExecutionEvent, ExecutionLog, ExecutionStatus,
    Orchestrator,
};
use opsflow_runner::pool::{PoolConfig, ResourcePool};
use opsflow_runner::process::{BulkDelimiter, ProcessHandle, ScriptDialect};
use opsflow_runner::storage::{
    Database, FileCredentialStore, LocalStore, StoreError, WorkflowCatalog, WorkflowStore,
};
use opsflow_runner::workflow::{
    Credential, ParameterType, RuntimeParameters, Script, ScriptParameter, StepParameter, Target,
    Workflow, WorkflowStep,
};
use serde_json::json;
use tokio::sync::broadcast;

// --- Fixtures ---

#[derive(Default)]
struct MemoryStore {
    workflows: HashMap<String, Workflow>,
    saved: Mutex<Vec<ExecutionLog>>,
    fail_saves: bool,
}

impl MemoryStore {
    fn with(workflow: Workflow) -> Arc<Self> {
        Arc::new(Self {
            workflows: HashMap::from([(workflow.id.clone(), workflow)]),
            ..Self::default()
        })
    }

    fn saved(&self) -> Vec<ExecutionLog> {
        self.saved.lock().unwrap().clone()
    }
}

#[async_trait]
impl WorkflowStore for MemoryStore {
    async fn load_workflow(&self, id: &str) -> Result<Option<Workflow>, StoreError> {
        Ok(self.workflows.get(id).cloned())
    }

    async fn save_execution_log(&self, log: &ExecutionLog) -> Result<(), StoreError> {
        if self.fail_saves {
            return Err(StoreError::InvalidId(log.id.clone()));
        }
        self.saved.lock().unwrap().push(log.clone());
        Ok(())
    }
}

fn target(name: &str) -> Target {
    Target {
        id: format!("t-{name}"),
        name: name.to_string(),
        host: None,
        enabled: true,
        credential: None,
    }
}

fn step(id: &str, body: &str, targets: Vec<Target>) -> WorkflowStep {
    WorkflowStep {
        id: id.to_string(),
        name: format!("Step {id}"),
        enabled: true,
        abort_on_error: false,
        script: Script {
            id: format!("script-{id}"),
            name: id.to_string(),
            enabled: true,
            body: body.to_string(),
            parameters: Vec::new(),
        },
        targets,
        parameters: Vec::new(),
    }
}

fn workflow(id: &str, steps: Vec<WorkflowStep>) -> Workflow {
    Workflow {
        id: id.to_string(),
        name: format!("Workflow {id}"),
        description: None,
        steps,
    }
}

fn orchestrator_with(
    store: Arc<dyn WorkflowStore>,
    credentials: FileCredentialStore,
    max_size: i64,
) -> Orchestrator {
    let pool = ResourcePool::new(
        PoolConfig::new(max_size, 0, 100),
        ProcessHandle::factory(InterpreterSettings::posix_shell(), BulkDelimiter::default()),
    )
    .unwrap();
    Orchestrator::new(
        Arc::new(pool),
        store,
        Arc::new(credentials),
        ScriptDialect::Posix,
    )
}

fn orchestrator(store: Arc<MemoryStore>) -> Orchestrator {
    orchestrator_with(store, FileCredentialStore::default(), 4)
}

fn output_of(log: &ExecutionLog, step: usize, target: usize) -> String {
    log.steps[step].targets[target].output.concat()
}

fn drain(events: &mut broadcast::Receiver<ExecutionEvent>) -> Vec<ExecutionEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

// --- Happy paths ---

#[tokio::test]
async fn steps_run_in_order_across_all_targets() {
    let store = MemoryStore::with(workflow(
        "deploy",
        vec![
            step("s1", "echo first", vec![target("web-1"), target("web-2")]),
            step("s2", "echo second", vec![target("web-1")]),
        ],
    ));
    let orchestrator = orchestrator(Arc::clone(&store));

    let result = orchestrator
        .execute("deploy", &RuntimeParameters::new(), &ExecutionControl::new())
        .await;

    assert_eq!(result.status, ExecutionStatus::Success);
    assert!(result.error.is_none());
    let log = &result.log;
    assert_eq!(log.workflow_name, "Workflow deploy");
    assert_eq!(log.steps.len(), 2);
    assert_eq!(log.steps[0].targets.len(), 2);
    assert!(output_of(log, 0, 0).contains("first"));
    assert!(output_of(log, 0, 1).contains("first"));
    assert!(output_of(log, 1, 0).contains("second"));
    assert!(log.steps[0].finished_at <= log.steps[1].started_at);
    assert!(log.finished_at.is_some());

    let saved = store.saved();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].id, log.id);
    assert_eq!(saved[0].status, ExecutionStatus::Success);
}

#[tokio::test]
async fn runtime_parameters_reach_the_script() {
    let mut s1 = step("s1", r#"echo "service=$Name""#, vec![target("web-1")]);
    s1.script.parameters.push(ScriptParameter {
        name: "Name".into(),
        kind: ParameterType::String,
        required: true,
        nullable: false,
    });
    s1.parameters.push(StepParameter {
        name: "Name".into(),
        value: serde_json::Value::Null,
        runtime: true,
    });
    let store = MemoryStore::with(workflow("restart", vec![s1]));
    let orchestrator = orchestrator(store);

    let mut runtime = RuntimeParameters::new();
    runtime.set("s1", "Name", json!("nginx"));
    let result = orchestrator
        .execute("restart", &runtime, &ExecutionControl::new())
        .await;

    assert_eq!(result.status, ExecutionStatus::Success);
    assert!(output_of(&result.log, 0, 0).contains("service=nginx"));
}

#[tokio::test]
async fn saturated_pool_queues_targets() {
    let store = MemoryStore::with(workflow(
        "fanout",
        vec![step(
            "s1",
            "echo $$",
            vec![target("a"), target("b"), target("c")],
        )],
    ));
    let orchestrator = orchestrator_with(store, FileCredentialStore::default(), 1);

    let result = orchestrator
        .execute("fanout", &RuntimeParameters::new(), &ExecutionControl::new())
        .await;

    assert_eq!(result.status, ExecutionStatus::Success);
    let pids: Vec<String> = (0..3)
        .map(|i| output_of(&result.log, 0, i).trim().to_string())
        .collect();
    assert!(pids.iter().all(|p| p == &pids[0]), "pids: {pids:?}");
    assert_eq!(orchestrator.pool().stats().total_objects, 1);
}

// --- Disabled work ---

#[tokio::test]
async fn disabled_steps_and_targets_are_skipped() {
    let mut off = target("off");
    off.enabled = false;
    let mut s2 = step("s2", "echo never", vec![target("on")]);
    s2.enabled = false;
    let store = MemoryStore::with(workflow(
        "partial",
        vec![step("s1", "echo ran", vec![target("on"), off]), s2],
    ));
    let orchestrator = orchestrator(store);

    let result = orchestrator
        .execute("partial", &RuntimeParameters::new(), &ExecutionControl::new())
        .await;

    let log = &result.log;
    assert_eq!(log.steps[0].status, ExecutionStatus::Success);
    assert_eq!(log.steps[0].targets[1].status, ExecutionStatus::Skipped);
    assert!(log.steps[0].targets[1].output.is_empty());
    assert_eq!(log.steps[1].status, ExecutionStatus::Skipped);
    assert!(log.steps[1].targets.is_empty());
    assert_eq!(result.status, ExecutionStatus::Success);
}

#[tokio::test]
async fn fully_disabled_workflow_is_skipped() {
    let mut s1 = step("s1", "echo never", vec![target("on")]);
    s1.script.enabled = false;
    let store = MemoryStore::with(workflow("idle", vec![s1]));
    let orchestrator = orchestrator(store);

    let result = orchestrator
        .execute("idle", &RuntimeParameters::new(), &ExecutionControl::new())
        .await;

    assert_eq!(result.status, ExecutionStatus::Skipped);
    assert_eq!(orchestrator.pool().stats().total_objects, 0);
}

// --- Failures ---

#[tokio::test]
async fn failing_target_faults_its_step() {
    let store = MemoryStore::with(workflow(
        "check",
        vec![
            step("s1", "echo partial; exit 3", vec![target("web-1")]),
            step("s2", "echo after", vec![target("web-1")]),
        ],
    ));
    let orchestrator = orchestrator(store);

    let result = orchestrator
        .execute("check", &RuntimeParameters::new(), &ExecutionControl::new())
        .await;

    let log = &result.log;
    let failed = &log.steps[0].targets[0];
    assert_eq!(failed.status, ExecutionStatus::Faulty);
    assert!(failed.error.as_deref().unwrap().contains("code 3"));
    assert!(failed.output.concat().contains("partial"));
    assert_eq!(log.steps[0].status, ExecutionStatus::Faulty);
    // Without abort-on-error the next step still runs.
    assert_eq!(log.steps[1].status, ExecutionStatus::Success);
    assert_eq!(result.status, ExecutionStatus::Faulty);
    assert!(result.error.is_none());
}

#[tokio::test]
async fn abort_on_error_aborts_remaining_steps() {
    let mut s1 = step("s1", "exit 1", vec![target("web-1")]);
    s1.abort_on_error = true;
    let store = MemoryStore::with(workflow(
        "guarded",
        vec![
            s1,
            step("s2", "echo never", vec![target("web-1")]),
            step("s3", "echo never", vec![target("web-1")]),
        ],
    ));
    let orchestrator = orchestrator(store);

    let result = orchestrator
        .execute("guarded", &RuntimeParameters::new(), &ExecutionControl::new())
        .await;

    let log = &result.log;
    assert_eq!(log.steps[0].status, ExecutionStatus::Faulty);
    for aborted in &log.steps[1..] {
        assert_eq!(aborted.status, ExecutionStatus::Aborted);
        assert!(aborted.targets.is_empty());
    }
    assert_eq!(result.status, ExecutionStatus::Aborted);
}

#[tokio::test]
async fn invalid_parameter_data_faults_only_that_step() {
    let mut s1 = step("s1", "echo $Count", vec![target("web-1")]);
    s1.script.parameters.push(ScriptParameter {
        name: "Count".into(),
        kind: ParameterType::Integer,
        required: true,
        nullable: false,
    });
    s1.parameters.push(StepParameter {
        name: "Count".into(),
        value: json!("many"),
        runtime: false,
    });
    let store = MemoryStore::with(workflow(
        "typed",
        vec![s1, step("s2", "echo ok", vec![target("web-1")])],
    ));
    let orchestrator = orchestrator(store);

    let result = orchestrator
        .execute("typed", &RuntimeParameters::new(), &ExecutionControl::new())
        .await;

    let log = &result.log;
    assert_eq!(log.steps[0].status, ExecutionStatus::Faulty);
    assert!(log.steps[0].targets.is_empty());
    assert!(log.steps[0].error.as_deref().unwrap().contains("Count"));
    assert_eq!(log.steps[1].status, ExecutionStatus::Success);
    assert_eq!(result.status, ExecutionStatus::Faulty);
}

#[tokio::test]
async fn missing_runtime_parameter_faults_run_and_keeps_log() {
    let mut s1 = step("s1", "echo $Name", vec![target("web-1")]);
    s1.script.parameters.push(ScriptParameter {
        name: "Name".into(),
        kind: ParameterType::String,
        required: true,
        nullable: false,
    });
    s1.parameters.push(StepParameter {
        name: "Name".into(),
        value: serde_json::Value::Null,
        runtime: true,
    });
    let store = MemoryStore::with(workflow("restart", vec![s1]));
    let orchestrator = orchestrator(Arc::clone(&store));

    let result = orchestrator
        .execute("restart", &RuntimeParameters::new(), &ExecutionControl::new())
        .await;

    assert_eq!(result.status, ExecutionStatus::Faulty);
    assert!(matches!(
        result.error,
        Some(ExecutionError::MissingRuntimeParameter { ref parameter, .. }) if parameter == "Name"
    ));
    assert!(result.log.steps.is_empty());

    let saved = store.saved();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].id, result.log.id);
    assert_eq!(saved[0].status, ExecutionStatus::Faulty);
    assert!(saved[0].error.is_some());
}

#[tokio::test]
async fn unknown_workflow_is_reported() {
    let store = Arc::new(MemoryStore::default());
    let orchestrator = orchestrator(Arc::clone(&store));

    let result = orchestrator
        .execute("ghost", &RuntimeParameters::new(), &ExecutionControl::new())
        .await;

    assert_eq!(result.status, ExecutionStatus::Faulty);
    assert_eq!(
        result.error,
        Some(ExecutionError::WorkflowNotFound("ghost".into()))
    );
    assert_eq!(store.saved().len(), 1);
}

#[tokio::test]
async fn unknown_credential_faults_run() {
    let mut guarded = target("web-1");
    guarded.credential = Some("vault".into());
    let store = MemoryStore::with(workflow("secure", vec![step("s1", "true", vec![guarded])]));
    let orchestrator = orchestrator(store);

    let result = orchestrator
        .execute("secure", &RuntimeParameters::new(), &ExecutionControl::new())
        .await;

    assert_eq!(result.status, ExecutionStatus::Faulty);
    assert!(matches!(
        result.error,
        Some(ExecutionError::Credential { ref name, .. }) if name == "vault"
    ));
}

#[tokio::test]
async fn failed_save_turns_result_faulty() {
    let store = Arc::new(MemoryStore {
        workflows: HashMap::from([(
            "deploy".to_string(),
            workflow("deploy", vec![step("s1", "echo ok", vec![target("web-1")])]),
        )]),
        fail_saves: true,
        ..MemoryStore::default()
    });
    let orchestrator = orchestrator(store);

    let result = orchestrator
        .execute("deploy", &RuntimeParameters::new(), &ExecutionControl::new())
        .await;

    assert_eq!(result.log.status, ExecutionStatus::Success);
    assert_eq!(result.status, ExecutionStatus::Faulty);
    assert!(matches!(result.error, Some(ExecutionError::SaveLogFailed(_))));
}

// --- Cancellation ---

#[tokio::test]
async fn cancel_lets_running_targets_finish() {
    let store = MemoryStore::with(workflow(
        "slow",
        vec![
            step("s1", "sleep 1; echo done", vec![target("web-1")]),
            step("s2", "echo never", vec![target("web-1")]),
        ],
    ));
    let orchestrator = orchestrator(store);

    let control = ExecutionControl::new();
    let canceller = control.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        canceller.cancel();
    });

    let result = orchestrator
        .execute("slow", &RuntimeParameters::new(), &control)
        .await;

    let log = &result.log;
    assert_eq!(log.steps[0].status, ExecutionStatus::Success);
    assert!(output_of(log, 0, 0).contains("done"));
    assert_eq!(log.steps[1].status, ExecutionStatus::CancelledByUser);
    assert!(log.steps[1].targets.is_empty());
    assert_eq!(result.status, ExecutionStatus::CancelledByUser);
}

#[tokio::test]
async fn cancel_skips_targets_still_waiting_for_a_handle() {
    let store = MemoryStore::with(workflow(
        "queued",
        vec![step("s1", "sleep 1; echo ran", vec![target("a"), target("b")])],
    ));
    let orchestrator = orchestrator_with(store, FileCredentialStore::default(), 1);

    let control = ExecutionControl::new();
    let canceller = control.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        canceller.cancel();
    });

    let result = orchestrator
        .execute("queued", &RuntimeParameters::new(), &control)
        .await;

    let targets = &result.log.steps[0].targets;
    let (ran, waited): (Vec<_>, Vec<_>) = targets
        .iter()
        .partition(|t| t.status == ExecutionStatus::Success);
    assert_eq!(ran.len(), 1, "{targets:?}");
    assert!(ran[0].output.concat().contains("ran"));
    assert_eq!(waited.len(), 1, "{targets:?}");
    assert_eq!(waited[0].status, ExecutionStatus::CancelledByUser);
    assert!(waited[0].output.is_empty());
    assert!(waited[0].started_at.is_none());

    assert_eq!(result.log.steps[0].status, ExecutionStatus::CancelledByUser);
    assert_eq!(result.status, ExecutionStatus::CancelledByUser);
    assert_eq!(orchestrator.pool().stats().total_objects, 1);
}

#[tokio::test]
async fn kill_stops_running_targets() {
    let store = MemoryStore::with(workflow(
        "stuck",
        vec![
            step("s1", "sleep 30; echo late", vec![target("web-1"), target("web-2")]),
            step("s2", "echo never", vec![target("web-1")]),
        ],
    ));
    let orchestrator = orchestrator(store);

    let control = ExecutionControl::new();
    let killer = control.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        killer.kill();
    });

    let started = Instant::now();
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        orchestrator.execute("stuck", &RuntimeParameters::new(), &control),
    )
    .await
    .unwrap();
    assert!(started.elapsed() < Duration::from_secs(10));

    let log = &result.log;
    assert_eq!(log.steps[0].status, ExecutionStatus::CancelledByUser);
    for killed in &log.steps[0].targets {
        assert_eq!(killed.status, ExecutionStatus::CancelledByUser);
        assert!(!killed.output.concat().contains("late"));
    }
    assert_eq!(log.steps[1].status, ExecutionStatus::CancelledByUser);
    assert_eq!(result.status, ExecutionStatus::CancelledByUser);

    // Killed interpreters are not returned to the pool.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(orchestrator.pool().stats().locked_objects, 0);
}

// --- Events and secrets ---

#[tokio::test]
async fn events_report_progress_with_target_source() {
    let store = MemoryStore::with(workflow(
        "deploy",
        vec![step("s1", "echo hello", vec![target("web-1")])],
    ));
    let orchestrator = orchestrator(store);
    let mut events = orchestrator.subscribe();

    let result = orchestrator
        .execute("deploy", &RuntimeParameters::new(), &ExecutionControl::new())
        .await;
    let seen = drain(&mut events);

    assert!(seen.iter().all(|e| e.execution_id == result.log.id));
    assert!(
        seen.iter()
            .any(|e| matches!(e.status, EventStatus::Invocation(_))
                && e.source.as_deref() == Some("web-1")
                && e.message.contains("hello"))
    );
    let last = seen.last().unwrap();
    assert_eq!(last.status, EventStatus::Execution(ExecutionStatus::Success));
    assert!(last.source.is_none());
    assert_eq!(last.context.step_statuses, vec![ExecutionStatus::Success]);
    assert_eq!(last.context.workflow_name, "Workflow deploy");
}

#[tokio::test]
async fn credential_secrets_are_masked() {
    let mut guarded = target("web-1");
    guarded.credential = Some("ops".into());
    let store = MemoryStore::with(workflow(
        "secure",
        vec![step("s1", r#"echo "$OPSFLOW_CREDENTIALS""#, vec![guarded])],
    ));
    let credentials = FileCredentialStore::new([Credential {
        name: "ops".into(),
        username: "admin".into(),
        secret: "hunter2".into(),
    }]);
    let orchestrator = orchestrator_with(store, credentials, 2);
    let mut events = orchestrator.subscribe();

    let result = orchestrator
        .execute("secure", &RuntimeParameters::new(), &ExecutionControl::new())
        .await;

    assert_eq!(result.status, ExecutionStatus::Success);
    let output = output_of(&result.log, 0, 0);
    assert!(output.contains("admin"));
    assert!(output.contains(SECRET_MASK));
    assert!(!output.contains("hunter2"));
    assert!(drain(&mut events).iter().all(|e| !e.message.contains("hunter2")));
}

// --- End to end ---

#[tokio::test]
async fn catalog_workflow_log_is_persisted() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("nightly.toml"),
        r#"
id = "nightly"
name = "Nightly"

[[step]]
id = "s1"
name = "Greet"

[step.script]
id = "greet"
name = "Greet"
body = 'echo "hi $Who"'

[[step.script.parameter]]
name = "Who"
type = "string"
required = true

[[step.parameter]]
name = "Who"
value = "ops"

[[step.target]]
id = "t1"
name = "local"
"#,
    )
    .unwrap();

    let db = Database::open_in_memory().await.unwrap();
    let store = LocalStore::new(WorkflowCatalog::new(dir.path()), db.clone());
    let orchestrator = orchestrator_with(Arc::new(store), FileCredentialStore::default(), 2);

    let result = orchestrator
        .execute("nightly", &RuntimeParameters::new(), &ExecutionControl::new())
        .await;
    assert_eq!(result.status, ExecutionStatus::Success);

    let stored = db.get_execution_log(&result.log.id).await.unwrap();
    assert_eq!(stored.status, ExecutionStatus::Success);
    assert_eq!(stored.workflow_name, "Nightly");
    assert!(stored.steps[0].targets[0].output.concat().contains("hi ops"));

    let history = db.list_executions("nightly", 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, result.log.id);
}
