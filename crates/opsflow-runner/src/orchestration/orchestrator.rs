//! Workflow execution driver.
//!
//! Steps run strictly in order. Each step fans out to all of its targets at
//! once, one pooled [`ProcessHandle`] per target, and its summary status is
//! computed only after every target has settled.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::join_all;
use opsflow_core::db::unix_timestamp_millis;
use opsflow_core::text::redact;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use super::control::ExecutionControl;
use super::error::ExecutionError;
use super::events::{EVENT_BROADCAST_CAPACITY, EventStatus, ExecutionEvent, ExecutionStats};
use super::records::{
    ExecutionLog, ExecutionStatus, ExecutionStep, ExecutionTarget, summarize,
};
use crate::pool::ResourcePool;
use crate::process::{
    Argument, InvocationEvent, InvokeError, ProcessHandle, RemoteTarget, ScriptDialect,
};
use crate::storage::{CredentialStore, WorkflowStore};
use crate::workflow::{
    CredentialCache, RuntimeParameters, Target, Workflow, WorkflowStep,
    apply_runtime_parameters, build_arguments,
};

/// Outcome of [`Orchestrator::execute`].
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub log: ExecutionLog,
    /// The log's status, or Faulty when the log could not be saved.
    pub status: ExecutionStatus,
    #[serde(serialize_with = "serialize_error")]
    pub error: Option<ExecutionError>,
}

fn serialize_error<S: serde::Serializer>(
    error: &Option<ExecutionError>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match error {
        Some(e) => serializer.serialize_some(&e.to_string()),
        None => serializer.serialize_none(),
    }
}

struct TargetOutcome {
    status: ExecutionStatus,
    error: Option<String>,
    output: Vec<String>,
}

impl TargetOutcome {
    const fn status(status: ExecutionStatus) -> Self {
        Self {
            status,
            error: None,
            output: Vec::new(),
        }
    }

    fn faulty(error: impl ToString) -> Self {
        Self {
            status: ExecutionStatus::Faulty,
            error: Some(error.to_string()),
            output: Vec::new(),
        }
    }
}

/// State shared by every step and target of one run.
struct Run<'a> {
    execution_id: String,
    control: &'a ExecutionControl,
    credentials: CredentialCache,
    secrets: Vec<String>,
    stats: Mutex<ExecutionStats>,
}

impl Run<'_> {
    fn stats(&self) -> MutexGuard<'_, ExecutionStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_step(&self, index: usize, status: ExecutionStatus) {
        let mut stats = self.stats();
        stats.current_step = Some(index);
        if let Some(slot) = stats.step_statuses.get_mut(index) {
            *slot = status;
        }
    }

    fn redact(&self, text: &str) -> String {
        redact(text, &self.secrets)
    }
}

/// Runs workflows against pooled interpreter processes.
pub struct Orchestrator {
    pool: Arc<ResourcePool<ProcessHandle>>,
    workflows: Arc<dyn WorkflowStore>,
    credentials: Arc<dyn CredentialStore>,
    dialect: ScriptDialect,
    events: broadcast::Sender<ExecutionEvent>,
}

impl Orchestrator {
    pub fn new(
        pool: Arc<ResourcePool<ProcessHandle>>,
        workflows: Arc<dyn WorkflowStore>,
        credentials: Arc<dyn CredentialStore>,
        dialect: ScriptDialect,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BROADCAST_CAPACITY);
        Self {
            pool,
            workflows,
            credentials,
            dialect,
            events,
        }
    }

    /// Receive progress events for every run started after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    pub const fn pool(&self) -> &Arc<ResourcePool<ProcessHandle>> {
        &self.pool
    }

    /// Run a workflow to completion, then persist its log.
    ///
    /// Never fails outright: every outcome, including a missing workflow or a
    /// failed save, is reported through the returned [`ExecutionResult`].
    pub async fn execute(
        &self,
        workflow_id: &str,
        runtime: &RuntimeParameters,
        control: &ExecutionControl,
    ) -> ExecutionResult {
        let mut log = ExecutionLog::new(workflow_id);
        info!(execution_id = %log.id, workflow_id, "Workflow execution started");

        let mut error = match self.run(&mut log, runtime, control).await {
            Ok(()) => {
                log.status = summarize(log.step_statuses());
                None
            }
            Err(e) => {
                error!(execution_id = %log.id, workflow_id, error = %e, "Workflow execution failed");
                log.status = ExecutionStatus::Faulty;
                log.error = Some(e.to_string());
                Some(e)
            }
        };
        log.finished_at = Some(unix_timestamp_millis());

        self.publish(ExecutionEvent {
            execution_id: log.id.clone(),
            status: EventStatus::Execution(log.status),
            message: format!("Workflow finished: {}", log.status),
            timestamp: unix_timestamp_millis(),
            source: None,
            context: ExecutionStats {
                workflow_name: log.workflow_name.clone(),
                current_step: log.steps.len().checked_sub(1),
                step_statuses: log.step_statuses().collect(),
                status: log.status,
            },
        });

        let mut status = log.status;
        if let Err(e) = self.workflows.save_execution_log(&log).await {
            error!(execution_id = %log.id, error = %e, "Failed to save execution log");
            status = ExecutionStatus::Faulty;
            error = Some(ExecutionError::SaveLogFailed(e.to_string()));
        }

        info!(execution_id = %log.id, workflow_id, %status, "Workflow execution finished");
        ExecutionResult { log, status, error }
    }

    async fn run(
        &self,
        log: &mut ExecutionLog,
        runtime: &RuntimeParameters,
        control: &ExecutionControl,
    ) -> Result<(), ExecutionError> {
        let mut workflow = self
            .workflows
            .load_workflow(&log.workflow_id)
            .await
            .map_err(|e| ExecutionError::Store(e.to_string()))?
            .ok_or_else(|| ExecutionError::WorkflowNotFound(log.workflow_id.clone()))?;
        log.workflow_name.clone_from(&workflow.name);

        apply_runtime_parameters(&mut workflow, runtime)?;
        let credentials = self.resolve_credentials(&workflow).await?;

        let run = Run {
            execution_id: log.id.clone(),
            control,
            secrets: credentials.values().map(|c| c.secret.clone()).collect(),
            credentials,
            stats: Mutex::new(ExecutionStats {
                workflow_name: workflow.name.clone(),
                current_step: None,
                step_statuses: vec![ExecutionStatus::Pending; workflow.steps.len()],
                status: ExecutionStatus::Running,
            }),
        };
        self.emit(
            &run,
            EventStatus::Execution(ExecutionStatus::Running),
            "Workflow started",
        );

        let mut aborting = false;
        for (index, step) in workflow.steps.iter().enumerate() {
            let record = if control.is_cancelled() {
                ExecutionStep::not_run(index, step, ExecutionStatus::CancelledByUser)
            } else if aborting {
                ExecutionStep::not_run(index, step, ExecutionStatus::Aborted)
            } else if !step.enabled || !step.script.enabled {
                debug!(execution_id = %run.execution_id, step = index, "Step disabled, skipping");
                ExecutionStep::not_run(index, step, ExecutionStatus::Skipped)
            } else {
                self.run_step(&run, index, step).await
            };

            run.set_step(index, record.status);
            self.emit(
                &run,
                EventStatus::Execution(record.status),
                format!("Step '{}' {}", step.name, record.status),
            );

            if record.status == ExecutionStatus::Faulty && step.abort_on_error && !aborting {
                warn!(
                    execution_id = %run.execution_id,
                    step = index,
                    "Step failed with abort-on-error, aborting remaining steps"
                );
                aborting = true;
            }
            log.steps.push(record);
        }

        Ok(())
    }

    async fn resolve_credentials(
        &self,
        workflow: &Workflow,
    ) -> Result<CredentialCache, ExecutionError> {
        let mut cache = CredentialCache::new();
        for name in workflow.credential_names() {
            let credential = self
                .credentials
                .resolve(&name)
                .await
                .map_err(|e| ExecutionError::Credential {
                    name: name.clone(),
                    reason: e.to_string(),
                })?
                .ok_or_else(|| ExecutionError::Credential {
                    name: name.clone(),
                    reason: "not found".to_string(),
                })?;
            cache.insert(name, credential);
        }
        Ok(cache)
    }

    async fn run_step(&self, run: &Run<'_>, index: usize, step: &WorkflowStep) -> ExecutionStep {
        let mut record = ExecutionStep::pending(index, step);
        record.status = ExecutionStatus::Running;
        record.started_at = Some(unix_timestamp_millis());
        run.set_step(index, ExecutionStatus::Running);
        self.emit(
            run,
            EventStatus::Execution(ExecutionStatus::Running),
            format!("Step '{}' started", step.name),
        );
        info!(
            execution_id = %run.execution_id,
            step = index,
            name = %step.name,
            targets = step.targets.len(),
            "Step started"
        );

        match build_arguments(step) {
            Ok(args) => {
                let targets = step
                    .targets
                    .iter()
                    .map(|target| self.run_target(run, step, target, &args));
                record.targets = join_all(targets).await;
                record.status = summarize(record.targets.iter().map(|t| t.status));
            }
            Err(e) => {
                warn!(execution_id = %run.execution_id, step = index, error = %e, "Invalid step parameters");
                record.status = ExecutionStatus::Faulty;
                record.error = Some(e.to_string());
            }
        }

        record.finished_at = Some(unix_timestamp_millis());
        record
    }

    async fn run_target(
        &self,
        run: &Run<'_>,
        step: &WorkflowStep,
        target: &Target,
        args: &[Argument],
    ) -> ExecutionTarget {
        let mut record = ExecutionTarget::pending(target);
        let outcome = self.dispatch(run, step, target, args, &mut record).await;
        record.output = outcome.output;
        record.finish(outcome.status, outcome.error);
        debug!(
            execution_id = %run.execution_id,
            target = %target.name,
            status = %record.status,
            "Target settled"
        );
        record
    }

    async fn dispatch(
        &self,
        run: &Run<'_>,
        step: &WorkflowStep,
        target: &Target,
        args: &[Argument],
        record: &mut ExecutionTarget,
    ) -> TargetOutcome {
        if !target.enabled {
            return TargetOutcome::status(ExecutionStatus::Skipped);
        }
        if run.control.is_cancelled() {
            return TargetOutcome::status(ExecutionStatus::CancelledByUser);
        }

        let credential = target
            .credential
            .as_deref()
            .and_then(|name| run.credentials.get(name));
        let remote = match target.host.as_deref() {
            Some(host) if !target.is_local() => Some(RemoteTarget { host, credential }),
            _ => None,
        };
        let injected: Vec<_> = credential.cloned().into_iter().collect();
        let command = match self
            .dialect
            .build_command(&step.script.body, args, &injected, remote)
        {
            Ok(command) => command,
            Err(e) => return TargetOutcome::faulty(e),
        };
        if let Ok(rendered) = self.dialect.render_arguments(args) {
            debug!(
                execution_id = %run.execution_id,
                target = %target.name,
                arguments = %run.redact(&rendered),
                "Dispatching target"
            );
        }

        let handle = tokio::select! {
            biased;
            () = run.control.killed() => {
                return TargetOutcome::status(ExecutionStatus::CancelledByUser);
            }
            acquired = self.pool.acquire() => match acquired {
                Ok(handle) => handle,
                Err(e) => {
                    warn!(target = %target.name, error = %e, "Failed to acquire process handle");
                    return TargetOutcome::faulty(e);
                }
            },
        };

        let tracked = run.control.track(&handle);
        let outcome = if run.control.is_cancelled() {
            TargetOutcome::status(ExecutionStatus::CancelledByUser)
        } else {
            record.start();
            handle.set_secrets(&run.secrets);
            self.invoke(run, &handle, &command, &target.name).await
        };
        drop(tracked);

        if let Err(e) = self.pool.release(&handle) {
            warn!(handle_id = handle.id(), error = %e, "Failed to release process handle");
        }
        outcome
    }

    async fn invoke(
        &self,
        run: &Run<'_>,
        handle: &ProcessHandle,
        command: &str,
        source: &str,
    ) -> TargetOutcome {
        let mut events = handle.subscribe();
        let invocation = handle.invoke(command);
        tokio::pin!(invocation);

        let result = loop {
            tokio::select! {
                result = &mut invocation => break result,
                Some(event) = events.recv() => self.forward(run, source, event),
            }
        };
        while let Ok(event) = events.try_recv() {
            self.forward(run, source, event);
        }

        let redact_all = |chunks: Vec<String>| -> Vec<String> {
            chunks.iter().map(|c| run.redact(c)).collect()
        };
        match result {
            Ok(output) => TargetOutcome {
                status: ExecutionStatus::Success,
                error: None,
                output: redact_all(output.chunks),
            },
            Err(_) if run.control.is_killed() => {
                TargetOutcome::status(ExecutionStatus::CancelledByUser)
            }
            Err(InvokeError::ScriptFailed {
                code,
                stderr,
                output,
            }) => {
                let mut message = format!("Script exited with code {code}");
                if !stderr.is_empty() {
                    message.push_str(": ");
                    message.push_str(&stderr);
                }
                TargetOutcome {
                    status: ExecutionStatus::Faulty,
                    error: Some(run.redact(&message)),
                    output: redact_all(output),
                }
            }
            Err(e) => TargetOutcome::faulty(run.redact(&e.to_string())),
        }
    }

    fn forward(&self, run: &Run<'_>, source: &str, event: InvocationEvent) {
        let message = run.redact(&event.message);
        self.publish(ExecutionEvent {
            execution_id: run.execution_id.clone(),
            status: EventStatus::Invocation(event.status),
            message,
            timestamp: event.timestamp,
            source: Some(source.to_string()),
            context: run.stats().clone(),
        });
    }

    fn emit(&self, run: &Run<'_>, status: EventStatus, message: impl Into<String>) {
        self.publish(ExecutionEvent {
            execution_id: run.execution_id.clone(),
            status,
            message: run.redact(&message.into()),
            timestamp: unix_timestamp_millis(),
            source: None,
            context: run.stats().clone(),
        });
    }

    fn publish(&self, event: ExecutionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
