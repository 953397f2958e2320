// Copyright (c) 2025 Corynth Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Workflow engine: binds variables, prepares the scope, drives the
//! scheduler and collects outputs for one workflow run.

use crate::config::Config;
use crate::context::ExecutionContext;
use crate::error::{EngineError, Result};
use crate::expr;
use crate::parser::WorkflowParser;
use crate::plugin::PluginRuntimeRef;
use crate::retry::RetryPolicy;
use crate::scheduler::{SchedulerOptions, StepScheduler, SubworkflowRunner};
use crate::state::{
    ExecutionMode, ExecutionState, ExecutionStatus, StateStoreRef, WorkflowOutput,
};
use crate::value::Value;
use crate::workflow::{StepTarget, VariableType, Workflow};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Orchestrates a single workflow run end to end.
pub struct WorkflowEngine {
    plugins: PluginRuntimeRef,
    store: StateStoreRef,
    config: Config,
    self_ref: Weak<WorkflowEngine>,
}

impl WorkflowEngine {
    pub fn new(plugins: PluginRuntimeRef, store: StateStoreRef, config: Config) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            plugins,
            store,
            config,
            self_ref: weak.clone(),
        })
    }

    pub fn store(&self) -> StateStoreRef {
        self.store.clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Parses and runs a workflow file.
    pub async fn execute_file(
        &self,
        path: &Path,
        variables: HashMap<String, Value>,
        mode: ExecutionMode,
        max_parallel: Option<usize>,
        cancel: watch::Receiver<bool>,
    ) -> Result<ExecutionState> {
        let workflow = WorkflowParser::parse_file(path)?;
        self.execute(&workflow, variables, mode, max_parallel, cancel)
            .await
    }

    /// Runs a parsed workflow. Parser and binding errors are fatal and
    /// surface as `Err`; step failures are reported through the returned
    /// execution's status.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        caller_variables: HashMap<String, Value>,
        mode: ExecutionMode,
        max_parallel: Option<usize>,
        cancel: watch::Receiver<bool>,
    ) -> Result<ExecutionState> {
        workflow.validate()?;
        let variables = bind_variables(workflow, caller_variables)?;

        info!(
            workflow = %workflow.name,
            mode = ?mode,
            "starting workflow run"
        );

        let ctx = Arc::new(ExecutionContext::new(variables.clone()));
        for (name, raw) in &workflow.locals {
            let value = expr::expand_value(raw, &ctx.scope())?;
            ctx.set_local(name.clone(), value);
        }

        self.preflight_plugins(workflow).await?;

        let execution = ExecutionState::new(&workflow.name, mode, variables);
        let options = SchedulerOptions {
            mode,
            max_parallel: max_parallel
                .unwrap_or(self.config.orchestration.execution.max_concurrent)
                .max(1),
            default_timeout: self.config.orchestration.execution.default_timeout(),
            default_retry: RetryPolicy {
                max_attempts: self.config.orchestration.retry.default_max_attempts,
                delay: std::time::Duration::from_millis(
                    self.config.orchestration.retry.default_delay_ms,
                ),
                backoff: crate::workflow::BackoffStrategy::parse(
                    &self.config.orchestration.retry.default_backoff,
                )?,
                max_delay: self.config.orchestration.retry.max_backoff_delay(),
            },
            max_backoff_delay: self.config.orchestration.retry.max_backoff_delay(),
        };

        let subworkflows = self
            .self_ref
            .upgrade()
            .map(|engine| engine as Arc<dyn SubworkflowRunner>);
        let scheduler = StepScheduler::new(
            self.plugins.clone(),
            self.store.clone(),
            subworkflows,
            options,
        );

        let mut execution = scheduler.run(workflow, ctx.clone(), execution, cancel).await;

        // Plan runs produce no step outputs, so output expressions only
        // resolve on apply.
        if execution.status == ExecutionStatus::Success && mode == ExecutionMode::Apply {
            match self.collect_outputs(workflow, &ctx) {
                Ok(outputs) => {
                    execution.outputs = outputs;
                    if !execution.outputs.is_empty() {
                        let record = WorkflowOutput {
                            workflow_name: workflow.name.clone(),
                            outputs: execution.outputs.clone(),
                            timestamp: Utc::now(),
                        };
                        if let Err(err) = self.store.save_workflow_output(&record).await {
                            warn!(error = %err, "failed to persist workflow outputs");
                        }
                    }
                }
                Err(err) => {
                    execution.status = ExecutionStatus::Failure;
                    execution.error_message = Some(err.to_string());
                }
            }
            if let Err(err) = self.store.save_execution(&execution).await {
                warn!(error = %err, "final state save failed");
            }
        }

        info!(
            workflow = %workflow.name,
            execution = %execution.id,
            status = %execution.status,
            "workflow run finished"
        );
        Ok(execution)
    }

    /// Resolves every referenced plugin before the first step runs.
    async fn preflight_plugins(&self, workflow: &Workflow) -> Result<()> {
        let mut names: Vec<&str> = Vec::new();
        for step in &workflow.steps {
            match &step.target {
                StepTarget::Plugin { plugin, .. } => names.push(plugin),
                StepTarget::Template { template } => {
                    if let Some(spec) = workflow.templates.get(template) {
                        names.push(&spec.plugin);
                    }
                }
                StepTarget::Subworkflow { .. } => {}
            }
        }
        names.sort_unstable();
        names.dedup();

        for name in names {
            self.plugins.ensure(name).await?;
        }
        Ok(())
    }

    fn collect_outputs(
        &self,
        workflow: &Workflow,
        ctx: &ExecutionContext,
    ) -> Result<HashMap<String, Value>> {
        let scope = ctx.scope();
        let mut outputs = HashMap::with_capacity(workflow.outputs.len());
        for (name, spec) in &workflow.outputs {
            let value = expr::expand_value(&spec.value, &scope)?;
            if spec.sensitive {
                debug!(output = %name, "collected sensitive output");
            } else {
                debug!(output = %name, value = %value, "collected output");
            }
            outputs.insert(name.clone(), value);
        }
        Ok(outputs)
    }
}

#[async_trait]
impl SubworkflowRunner for WorkflowEngine {
    async fn run_subworkflow(
        &self,
        path: &Path,
        variables: HashMap<String, Value>,
        mode: ExecutionMode,
        cancel: watch::Receiver<bool>,
    ) -> Result<ExecutionState> {
        debug!(path = %path.display(), "running subworkflow");
        self.execute_file(path, variables, mode, None, cancel).await
    }
}

/// Merges caller-provided variables over declared defaults, enforcing
/// declared types and validation rules. Undeclared caller variables pass
/// through untouched so orchestrator imports stay visible.
pub fn bind_variables(
    workflow: &Workflow,
    caller: HashMap<String, Value>,
) -> Result<HashMap<String, Value>> {
    let mut bound: HashMap<String, Value> = HashMap::new();

    for (name, spec) in &workflow.variables {
        let value = match caller.get(name) {
            Some(value) => Some(coerce(value, spec.var_type)?),
            None => spec.default.clone(),
        };

        match value {
            Some(value) => {
                if !spec.var_type.check(&value) {
                    return Err(EngineError::type_mismatch_in(
                        spec.var_type.name(),
                        value.type_name(),
                        format!("variable '{name}'"),
                    ));
                }
                bound.insert(name.clone(), value);
            }
            None if spec.required => {
                return Err(EngineError::Validation(format!(
                    "required variable '{name}' was not provided"
                )));
            }
            None => {}
        }
    }

    // Pass through anything not declared (imports, ad-hoc overrides).
    for (name, value) in caller {
        bound.entry(name).or_insert(value);
    }

    // Validation conditions see the fully bound set.
    let scope = expr::Scope::of_variables(bound.clone());
    for (name, spec) in &workflow.variables {
        let Some(validation) = &spec.validation else { continue };
        if !bound.contains_key(name) {
            continue;
        }
        let ok = expr::evaluate_condition(&validation.condition, &scope)?;
        if !ok {
            return Err(EngineError::Validation(format!(
                "variable '{name}': {}",
                validation.error_message
            )));
        }
    }

    Ok(bound)
}

/// String inputs coerce to the declared scalar type so CLI `--var k=v`
/// pairs bind without explicit JSON typing.
fn coerce(value: &Value, var_type: VariableType) -> Result<Value> {
    match (var_type, value) {
        (VariableType::Number, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Value::Number)
            .map_err(|_| EngineError::type_mismatch("number", "string")),
        (VariableType::Bool, Value::String(s)) => match s.to_ascii_lowercase().as_str() {
            "true" => Ok(Value::Bool(true)),
            "false" => Ok(Value::Bool(false)),
            _ => Err(EngineError::type_mismatch("bool", "string")),
        },
        _ => Ok(value.clone()),
    }
}
