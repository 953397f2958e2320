// Copyright (c) 2025 Corynth Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cross-workflow orchestration: dependency chains before a run, trigger
//! fan-out after it.
//!
//! Dependencies with a fresh stored output are reused without re-running
//! (their listed outputs are imported into the main run's variables);
//! otherwise they execute first, bounded by
//! `max_concurrent_dependencies`. Triggers fire on the main outcome under
//! `max_concurrent_triggers`; their results are recorded but never change
//! the main outcome. Each phase runs under its configured timeout.

use crate::engine::WorkflowEngine;
use crate::error::{EngineError, Result};
use crate::parser::WorkflowParser;
use crate::state::{ExecutionMode, ExecutionState, ExecutionStatus};
use crate::value::Value;
use crate::workflow::{Workflow, WorkflowDependency, WorkflowTrigger};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Result of one dependency workflow.
#[derive(Debug)]
pub struct DependencyOutcome {
    pub workflow_file: String,
    /// True when a stored output satisfied the dependency without a run.
    pub reused: bool,
    pub execution: Option<ExecutionState>,
    pub imported: HashMap<String, Value>,
    pub error: Option<String>,
}

/// Result of one triggered workflow.
#[derive(Debug)]
pub struct TriggerOutcome {
    pub workflow_file: String,
    pub fired: bool,
    pub execution: Option<ExecutionState>,
    pub error: Option<String>,
}

/// Outcome of a whole chain run.
#[derive(Debug)]
pub struct ChainResult {
    pub main: ExecutionState,
    pub dependencies: Vec<DependencyOutcome>,
    pub triggers: Vec<TriggerOutcome>,
}

/// Executes workflow chains through the engine.
pub struct ChainOrchestrator {
    engine: Arc<WorkflowEngine>,
}

impl ChainOrchestrator {
    pub fn new(engine: Arc<WorkflowEngine>) -> Self {
        Self { engine }
    }

    /// Runs dependency phase, main workflow, then trigger phase.
    pub async fn execute_chain(
        &self,
        workflow: &Workflow,
        caller_variables: HashMap<String, Value>,
        mode: ExecutionMode,
        cancel: watch::Receiver<bool>,
    ) -> Result<ChainResult> {
        let execution_config = self.engine.config().orchestration.execution.clone();

        // Dependency phase.
        let dependencies = tokio::time::timeout(
            execution_config.dependency_timeout(),
            self.run_dependencies(workflow, mode, cancel.clone()),
        )
        .await
        .map_err(|_| EngineError::DependencyFailed {
            workflow: workflow.name.clone(),
            dependency: "<phase>".into(),
            message: format!(
                "dependency phase exceeded {:?}",
                execution_config.dependency_timeout()
            ),
        })?;

        let mut imports: HashMap<String, Value> = HashMap::new();
        for outcome in &dependencies {
            if let Some(error) = &outcome.error {
                let dep = workflow
                    .depends_on_workflows
                    .iter()
                    .find(|d| d.workflow_file == outcome.workflow_file);
                if dep.is_some_and(|d| d.required) {
                    return Err(EngineError::DependencyFailed {
                        workflow: workflow.name.clone(),
                        dependency: outcome.workflow_file.clone(),
                        message: error.clone(),
                    });
                }
                warn!(
                    dependency = %outcome.workflow_file,
                    error = %error,
                    "optional dependency failed, continuing without its imports"
                );
                continue;
            }
            imports.extend(outcome.imported.clone());
        }

        // Imports override defaults but never explicit caller values.
        let mut merged = imports;
        merged.extend(caller_variables);

        // Main phase under the default timeout; on expiry the run is
        // cancelled and drained rather than abandoned.
        let (inner_tx, inner_rx) = watch::channel(false);
        forward_cancel(cancel.clone(), inner_tx.clone());

        let main_future = self
            .engine
            .execute(workflow, merged, mode, None, inner_rx);
        tokio::pin!(main_future);
        let main = match tokio::time::timeout(
            execution_config.default_timeout(),
            &mut main_future,
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    workflow = %workflow.name,
                    timeout = ?execution_config.default_timeout(),
                    "main phase timed out, cancelling"
                );
                let _ = inner_tx.send(true);
                main_future.await?
            }
        };

        // Trigger phase.
        let triggers = tokio::time::timeout(
            execution_config.trigger_timeout(),
            self.run_triggers(workflow, &main, mode, cancel),
        )
        .await
        .unwrap_or_else(|_| {
            warn!(
                workflow = %workflow.name,
                "trigger phase exceeded its timeout"
            );
            Vec::new()
        });

        Ok(ChainResult {
            main,
            dependencies,
            triggers,
        })
    }

    async fn run_dependencies(
        &self,
        workflow: &Workflow,
        mode: ExecutionMode,
        cancel: watch::Receiver<bool>,
    ) -> Vec<DependencyOutcome> {
        let config = &self.engine.config().orchestration.execution;
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_dependencies.max(1)));
        let mut join_set: JoinSet<(usize, DependencyOutcome)> = JoinSet::new();

        for (index, dep) in workflow.depends_on_workflows.iter().enumerate() {
            let engine = self.engine.clone();
            let dep = dep.clone();
            let source_dir = workflow.source_dir.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("dependency semaphore closed");
                let outcome = run_dependency(engine, dep, source_dir, mode, cancel).await;
                (index, outcome)
            });
        }

        let mut outcomes: Vec<Option<DependencyOutcome>> =
            Vec::with_capacity(workflow.depends_on_workflows.len());
        outcomes.resize_with(workflow.depends_on_workflows.len(), || None);
        while let Some(joined) = join_set.join_next().await {
            if let Ok((index, outcome)) = joined {
                outcomes[index] = Some(outcome);
            }
        }
        outcomes.into_iter().flatten().collect()
    }

    async fn run_triggers(
        &self,
        workflow: &Workflow,
        main: &ExecutionState,
        mode: ExecutionMode,
        cancel: watch::Receiver<bool>,
    ) -> Vec<TriggerOutcome> {
        let config = &self.engine.config().orchestration.execution;
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_triggers.max(1)));
        let mut join_set: JoinSet<(usize, TriggerOutcome)> = JoinSet::new();

        for (index, trigger) in workflow.trigger_workflows.iter().enumerate() {
            let fired = match main.status {
                ExecutionStatus::Success => trigger.on_success,
                ExecutionStatus::Failure => trigger.on_failure,
                _ => false,
            };
            if !fired {
                join_set.spawn({
                    let file = trigger.workflow_file.clone();
                    async move {
                        (
                            index,
                            TriggerOutcome {
                                workflow_file: file,
                                fired: false,
                                execution: None,
                                error: None,
                            },
                        )
                    }
                });
                continue;
            }

            let mut exports = HashMap::new();
            for name in &trigger.export_vars {
                match main.outputs.get(name) {
                    Some(value) => {
                        exports.insert(name.clone(), value.clone());
                    }
                    None => warn!(
                        trigger = %trigger.workflow_file,
                        output = %name,
                        "export variable missing from main outputs"
                    ),
                }
            }

            let engine = self.engine.clone();
            let trigger = trigger.clone();
            let source_dir = workflow.source_dir.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("trigger semaphore closed");
                let outcome = run_trigger(engine, trigger, exports, source_dir, mode, cancel).await;
                (index, outcome)
            });
        }

        let mut outcomes: Vec<Option<TriggerOutcome>> =
            Vec::with_capacity(workflow.trigger_workflows.len());
        outcomes.resize_with(workflow.trigger_workflows.len(), || None);
        while let Some(joined) = join_set.join_next().await {
            if let Ok((index, outcome)) = joined {
                outcomes[index] = Some(outcome);
            }
        }
        outcomes.into_iter().flatten().collect()
    }
}

/// Forwards an outer cancellation signal into a phase-local channel.
fn forward_cancel(mut outer: watch::Receiver<bool>, inner: watch::Sender<bool>) {
    tokio::spawn(async move {
        loop {
            if *outer.borrow() {
                let _ = inner.send(true);
                return;
            }
            if outer.changed().await.is_err() {
                return;
            }
        }
    });
}

async fn run_dependency(
    engine: Arc<WorkflowEngine>,
    dep: WorkflowDependency,
    source_dir: Option<PathBuf>,
    mode: ExecutionMode,
    cancel: watch::Receiver<bool>,
) -> DependencyOutcome {
    let mut outcome = DependencyOutcome {
        workflow_file: dep.workflow_file.clone(),
        reused: false,
        execution: None,
        imported: HashMap::new(),
        error: None,
    };

    let path = match &source_dir {
        Some(dir) => dir.join(&dep.workflow_file),
        None => PathBuf::from(&dep.workflow_file),
    };

    let dep_workflow = match WorkflowParser::parse_file(&path) {
        Ok(workflow) => workflow,
        Err(err) => {
            outcome.error = Some(err.to_string());
            return outcome;
        }
    };

    // A previously produced output satisfies the dependency without a
    // re-run.
    match engine
        .store()
        .load_workflow_output(&dep_workflow.name)
        .await
    {
        Ok(Some(stored)) => {
            info!(
                dependency = %dep_workflow.name,
                "reusing stored outputs, dependency not re-run"
            );
            outcome.reused = true;
            import_outputs(&dep, &stored.outputs, &mut outcome);
            return outcome;
        }
        Ok(None) => {}
        Err(err) => {
            warn!(error = %err, "could not check stored outputs, running dependency");
        }
    }

    match engine
        .execute(&dep_workflow, dep.variables.clone(), mode, None, cancel)
        .await
    {
        Ok(execution) if execution.status == ExecutionStatus::Success => {
            import_outputs(&dep, &execution.outputs, &mut outcome);
            outcome.execution = Some(execution);
        }
        Ok(execution) => {
            outcome.error = Some(
                execution
                    .error_message
                    .clone()
                    .unwrap_or_else(|| format!("dependency finished {}", execution.status)),
            );
            outcome.execution = Some(execution);
        }
        Err(err) => outcome.error = Some(err.to_string()),
    }
    outcome
}

fn import_outputs(
    dep: &WorkflowDependency,
    outputs: &HashMap<String, Value>,
    outcome: &mut DependencyOutcome,
) {
    for name in &dep.import_vars {
        match outputs.get(name) {
            Some(value) => {
                outcome.imported.insert(name.clone(), value.clone());
            }
            None => warn!(
                dependency = %dep.workflow_file,
                output = %name,
                "import variable missing from dependency outputs"
            ),
        }
    }
}

async fn run_trigger(
    engine: Arc<WorkflowEngine>,
    trigger: WorkflowTrigger,
    exports: HashMap<String, Value>,
    source_dir: Option<PathBuf>,
    mode: ExecutionMode,
    cancel: watch::Receiver<bool>,
) -> TriggerOutcome {
    let mut outcome = TriggerOutcome {
        workflow_file: trigger.workflow_file.clone(),
        fired: true,
        execution: None,
        error: None,
    };

    let path = match &source_dir {
        Some(dir) => dir.join(&trigger.workflow_file),
        None => PathBuf::from(&trigger.workflow_file),
    };

    match engine
        .execute_file(&path, exports, mode, None, cancel)
        .await
    {
        Ok(execution) => {
            if execution.status != ExecutionStatus::Success {
                outcome.error = execution.error_message.clone();
            }
            outcome.execution = Some(execution);
        }
        Err(err) => outcome.error = Some(err.to_string()),
    }
    outcome
}
