// Copyright (c) 2025 Corynth Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Step scheduler: topological DAG execution with bounded parallelism.
//!
//! The dispatch loop keeps a ready set of steps whose dependencies have
//! reached a terminal status and runs them on a semaphore-bounded pool.
//! Conditions, loops, templates, subworkflows, retries, timeouts,
//! continue-on-error and cancellation are all handled here; every status
//! transition is persisted through the state store.

use crate::context::{ExecutionContext, LoopBinding, Scope};
use crate::error::{EngineError, PluginError, Result};
use crate::expr;
use crate::dag::WorkflowDag;
use crate::plugin::PluginRuntimeRef;
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::state::{
    AttemptRecord, ExecutionMode, ExecutionState, ExecutionStatus, StateStoreRef, StepExecution,
};
use crate::value::Value;
use crate::workflow::{Step, StepTarget, TemplateSpec, Workflow};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Recursive engine invocation for `subworkflow` steps. Implemented by the
/// workflow engine; the indirection keeps the scheduler free of a direct
/// dependency on it.
#[async_trait]
pub trait SubworkflowRunner: Send + Sync {
    async fn run_subworkflow(
        &self,
        path: &Path,
        variables: HashMap<String, Value>,
        mode: ExecutionMode,
        cancel: watch::Receiver<bool>,
    ) -> Result<ExecutionState>;
}

/// Scheduler tunables derived from configuration and the run request.
#[derive(Clone)]
pub struct SchedulerOptions {
    pub mode: ExecutionMode,
    pub max_parallel: usize,
    pub default_timeout: Duration,
    pub default_retry: RetryPolicy,
    pub max_backoff_delay: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Apply,
            max_parallel: 5,
            default_timeout: Duration::from_secs(300),
            default_retry: RetryPolicy::default(),
            max_backoff_delay: Duration::from_secs(60),
        }
    }
}

/// Executes one workflow's step DAG.
pub struct StepScheduler {
    plugins: PluginRuntimeRef,
    store: StateStoreRef,
    subworkflows: Option<Arc<dyn SubworkflowRunner>>,
    options: SchedulerOptions,
}

impl StepScheduler {
    pub fn new(
        plugins: PluginRuntimeRef,
        store: StateStoreRef,
        subworkflows: Option<Arc<dyn SubworkflowRunner>>,
        options: SchedulerOptions,
    ) -> Self {
        Self {
            plugins,
            store,
            subworkflows,
            options,
        }
    }

    /// Runs the workflow's steps, mutating and returning the execution
    /// record. Scheduling errors are folded into the record's status; the
    /// caller inspects `status` and `error_message`.
    pub async fn run(
        &self,
        workflow: &Workflow,
        ctx: Arc<ExecutionContext>,
        mut execution: ExecutionState,
        cancel: watch::Receiver<bool>,
    ) -> ExecutionState {
        let dag = match WorkflowDag::from_workflow(workflow) {
            Ok(dag) => dag,
            Err(err) => {
                execution.status = ExecutionStatus::Failure;
                execution.error_message = Some(err.to_string());
                execution.end_time = Some(Utc::now());
                self.persist(&execution).await;
                return execution;
            }
        };
        let order = match dag.execution_order() {
            Ok(order) => order,
            Err(err) => {
                execution.status = ExecutionStatus::Failure;
                execution.error_message = Some(err.to_string());
                execution.end_time = Some(Utc::now());
                self.persist(&execution).await;
                return execution;
            }
        };

        execution.status = ExecutionStatus::Running;
        execution.steps = order.iter().map(StepExecution::pending).collect();
        self.persist(&execution).await;

        let mut remaining: HashMap<String, usize> = order
            .iter()
            .map(|name| (name.clone(), dag.dependencies(name).len()))
            .collect();
        let mut ready: VecDeque<String> = order
            .iter()
            .filter(|name| remaining[*name] == 0)
            .cloned()
            .collect();
        let mut statuses: HashMap<String, ExecutionStatus> = order
            .iter()
            .map(|name| (name.clone(), ExecutionStatus::Pending))
            .collect();
        // Steps with at least one skipped dependency cascade to skipped
        // unless they declare continue_on.error.
        let mut skip_tainted: HashSet<String> = HashSet::new();
        let mut run_failed = false;

        let semaphore = Arc::new(Semaphore::new(self.options.max_parallel));
        let runner = Arc::new(StepRunner {
            plugins: self.plugins.clone(),
            subworkflows: self.subworkflows.clone(),
            templates: workflow.templates.clone(),
            source_dir: workflow.source_dir.clone(),
            workflow_name: workflow.name.clone(),
            options: self.options.clone(),
            ctx: ctx.clone(),
            cancel: cancel.clone(),
        });
        let mut join_set: JoinSet<(StepExecution, Option<EngineError>)> = JoinSet::new();

        loop {
            let cancelled = *cancel.borrow();

            // Dispatch every ready step unless the run has been cancelled.
            while !cancelled {
                let Some(name) = ready.pop_front() else { break };
                let step = workflow
                    .step(&name)
                    .expect("ready step exists in workflow")
                    .clone();

                // Cascaded skip from a skipped dependency.
                if skip_tainted.contains(&name) && !step.continue_on_error {
                    self.finish_skipped(
                        &name,
                        &mut execution,
                        &mut statuses,
                        &ctx,
                        &dag,
                        &mut remaining,
                        &mut ready,
                        &mut skip_tainted,
                    )
                    .await;
                    continue;
                }

                // Evaluate the condition in the current scope.
                if let Some(condition) = &step.condition {
                    match expr::evaluate_condition(condition, &ctx.scope()) {
                        Ok(true) => {}
                        Ok(false) => {
                            debug!(step = %name, "condition false, skipping");
                            self.finish_skipped(
                                &name,
                                &mut execution,
                                &mut statuses,
                                &ctx,
                                &dag,
                                &mut remaining,
                                &mut ready,
                                &mut skip_tainted,
                            )
                            .await;
                            continue;
                        }
                        Err(err) => {
                            error!(step = %name, error = %err, "condition evaluation failed");
                            let mut record = StepExecution::pending(&name);
                            record.status = ExecutionStatus::Failure;
                            record.error = Some(err.to_string());
                            record.end_time = Some(Utc::now());
                            run_failed |= self
                                .finish_failed(
                                    record,
                                    &step,
                                    &mut execution,
                                    &mut statuses,
                                    &ctx,
                                    &dag,
                                    &mut remaining,
                                    &mut ready,
                                )
                                .await;
                            continue;
                        }
                    }
                }

                statuses.insert(name.clone(), ExecutionStatus::Running);
                if let Some(record) = record_mut(&mut execution, &name) {
                    record.status = ExecutionStatus::Running;
                    record.start_time = Some(Utc::now());
                }
                self.persist(&execution).await;

                info!(step = %name, "dispatching step");
                let runner = runner.clone();
                let semaphore = semaphore.clone();
                join_set.spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .expect("scheduler semaphore closed");
                    runner.execute(step).await
                });
            }

            if join_set.is_empty() {
                break;
            }

            // Wait for one completion and advance the frontier.
            let Some(joined) = join_set.join_next().await else { break };
            let (record, _failure) = match joined {
                Ok(result) => result,
                Err(join_err) => {
                    error!(error = %join_err, "step task panicked");
                    let mut record = StepExecution::pending("unknown");
                    record.status = ExecutionStatus::Failure;
                    record.error = Some(join_err.to_string());
                    (record, Some(EngineError::Validation(join_err.to_string())))
                }
            };
            let name = record.step_name.clone();

            match record.status {
                ExecutionStatus::Success => {
                    statuses.insert(name.clone(), ExecutionStatus::Success);
                    ctx.record_outputs(&name, record.outputs.clone());
                    replace_record(&mut execution, record);
                    for dependent in dag.dependents(&name) {
                        if decrement(&mut remaining, &dependent) {
                            ready.push_back(dependent);
                        }
                    }
                }
                ExecutionStatus::Cancelled => {
                    statuses.insert(name.clone(), ExecutionStatus::Cancelled);
                    replace_record(&mut execution, record);
                }
                _ => {
                    let step = workflow.step(&name).cloned();
                    match step {
                        Some(step) => {
                            run_failed |= self
                                .finish_failed(
                                    record,
                                    &step,
                                    &mut execution,
                                    &mut statuses,
                                    &ctx,
                                    &dag,
                                    &mut remaining,
                                    &mut ready,
                                )
                                .await;
                        }
                        None => {
                            replace_record(&mut execution, record);
                            run_failed = true;
                        }
                    }
                }
            }
            self.persist(&execution).await;
        }

        // Anything never dispatched was cut off by cancellation or failure.
        let caller_cancelled = *cancel.borrow();
        for (name, status) in &statuses {
            if !status.is_terminal() {
                if let Some(record) = record_mut(&mut execution, name) {
                    record.status = ExecutionStatus::Cancelled;
                    record.end_time = Some(Utc::now());
                }
            }
        }

        execution.status = if caller_cancelled {
            ExecutionStatus::Cancelled
        } else if run_failed {
            ExecutionStatus::Failure
        } else {
            ExecutionStatus::Success
        };
        if caller_cancelled && execution.error_message.is_none() {
            execution.error_message = Some(EngineError::Cancelled.to_string());
        }
        execution.end_time = Some(Utc::now());
        self.persist(&execution).await;
        execution
    }

    /// Marks a step skipped and taints its dependents.
    #[allow(clippy::too_many_arguments)]
    async fn finish_skipped(
        &self,
        name: &str,
        execution: &mut ExecutionState,
        statuses: &mut HashMap<String, ExecutionStatus>,
        ctx: &ExecutionContext,
        dag: &WorkflowDag,
        remaining: &mut HashMap<String, usize>,
        ready: &mut VecDeque<String>,
        skip_tainted: &mut HashSet<String>,
    ) {
        statuses.insert(name.to_string(), ExecutionStatus::Skipped);
        ctx.mark_skipped(name);
        if let Some(record) = record_mut(execution, name) {
            record.status = ExecutionStatus::Skipped;
            record.end_time = Some(Utc::now());
        }
        for dependent in dag.dependents(name) {
            skip_tainted.insert(dependent.clone());
            if decrement(remaining, &dependent) {
                ready.push_back(dependent);
            }
        }
        self.persist(execution).await;
    }

    /// Handles a failed step: continue-on-error unblocks dependents with
    /// empty outputs, otherwise the transitive dependents are cancelled.
    /// Returns whether the run as a whole is now failed.
    #[allow(clippy::too_many_arguments)]
    async fn finish_failed(
        &self,
        record: StepExecution,
        step: &Step,
        execution: &mut ExecutionState,
        statuses: &mut HashMap<String, ExecutionStatus>,
        ctx: &ExecutionContext,
        dag: &WorkflowDag,
        remaining: &mut HashMap<String, usize>,
        ready: &mut VecDeque<String>,
    ) -> bool {
        let name = record.step_name.clone();
        statuses.insert(name.clone(), ExecutionStatus::Failure);
        replace_record(execution, record);

        if step.continue_on_error {
            warn!(step = %name, "step failed, continuing (continue_on.error)");
            ctx.record_outputs(&name, HashMap::new());
            for dependent in dag.dependents(&name) {
                if decrement(remaining, &dependent) {
                    ready.push_back(dependent);
                }
            }
            self.persist(execution).await;
            return false;
        }

        error!(step = %name, "step failed, cancelling dependents");
        for dependent in dag.transitive_dependents(&name) {
            if statuses
                .get(&dependent)
                .is_some_and(|status| !status.is_terminal())
            {
                statuses.insert(dependent.clone(), ExecutionStatus::Cancelled);
                if let Some(record) = record_mut(execution, &dependent) {
                    record.status = ExecutionStatus::Cancelled;
                    record.end_time = Some(Utc::now());
                }
                ready.retain(|queued| queued != &dependent);
            }
        }
        if execution.error_message.is_none() {
            execution.error_message = execution
                .step(&name)
                .and_then(|record| record.error.clone());
        }
        self.persist(execution).await;
        true
    }

    /// Best-effort persistence: a save failure is logged and retried once;
    /// the run continues in memory either way.
    async fn persist(&self, execution: &ExecutionState) {
        if let Err(err) = self.store.save_execution(execution).await {
            warn!(error = %err, "state save failed, retrying once");
            if let Err(err) = self.store.save_execution(execution).await {
                error!(error = %err, "state save failed again, continuing in memory");
            }
        }
    }
}

fn record_mut<'a>(execution: &'a mut ExecutionState, name: &str) -> Option<&'a mut StepExecution> {
    execution.steps.iter_mut().find(|s| s.step_name == name)
}

fn replace_record(execution: &mut ExecutionState, record: StepExecution) {
    match record_mut(execution, &record.step_name) {
        Some(existing) => *existing = record,
        None => execution.steps.push(record),
    }
}

fn decrement(remaining: &mut HashMap<String, usize>, name: &str) -> bool {
    match remaining.get_mut(name) {
        Some(count) if *count > 0 => {
            *count -= 1;
            *count == 0
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Per-step execution
// ---------------------------------------------------------------------------

struct StepRunner {
    plugins: PluginRuntimeRef,
    subworkflows: Option<Arc<dyn SubworkflowRunner>>,
    templates: HashMap<String, TemplateSpec>,
    source_dir: Option<PathBuf>,
    workflow_name: String,
    options: SchedulerOptions,
    ctx: Arc<ExecutionContext>,
    cancel: watch::Receiver<bool>,
}

impl StepRunner {
    /// Executes one step (including loop expansion) and produces its record.
    async fn execute(self: Arc<Self>, step: Step) -> (StepExecution, Option<EngineError>) {
        let mut record = StepExecution::pending(&step.name);
        record.status = ExecutionStatus::Running;
        record.start_time = Some(Utc::now());

        let result = match &step.loop_spec {
            Some(_) => self.clone().run_loop(&step, &mut record).await,
            None => {
                self.run_with_retry(&step, self.ctx.scope(), &mut record)
                    .await
            }
        };

        record.end_time = Some(Utc::now());
        match result {
            Ok(outputs) => {
                record.status = ExecutionStatus::Success;
                record.outputs = outputs;
                (record, None)
            }
            Err(err) if err.is_cancelled() => {
                record.status = ExecutionStatus::Cancelled;
                record.error = Some(err.to_string());
                (record, Some(err))
            }
            Err(err) => {
                record.status = ExecutionStatus::Failure;
                record.error = Some(err.to_string());
                (record, Some(err))
            }
        }
    }

    /// Expands a loop into iterations; aggregated outputs land under
    /// `results` in original index order once every iteration completed.
    async fn run_loop(
        self: Arc<Self>,
        step: &Step,
        record: &mut StepExecution,
    ) -> Result<HashMap<String, Value>> {
        let loop_spec = step.loop_spec.as_ref().expect("caller checked loop_spec");
        let scope = self.ctx.scope();
        let over = expr::expand_value(&loop_spec.over, &scope)?;

        let bindings: Vec<LoopBinding> = match over {
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(index, value)| LoopBinding {
                    key: Value::Number(index as f64),
                    value,
                    index,
                })
                .collect(),
            Value::Object(entries) => {
                // Sorted keys keep map iteration deterministic within a run.
                let mut keys: Vec<String> = entries.keys().cloned().collect();
                keys.sort();
                keys.into_iter()
                    .enumerate()
                    .map(|(index, key)| LoopBinding {
                        value: entries[&key].clone(),
                        key: Value::String(key),
                        index,
                    })
                    .collect()
            }
            other => {
                return Err(EngineError::type_mismatch_in(
                    "array or object",
                    other.type_name(),
                    format!("loop.over of step '{}'", step.name),
                ))
            }
        };

        let total = bindings.len();
        let mut iteration_records: Vec<Option<StepExecution>> = Vec::new();
        iteration_records.resize_with(total, || None);
        let mut outputs: Vec<Option<Value>> = vec![None; total];
        let mut first_error: Option<EngineError> = None;

        if loop_spec.parallel && total > 1 {
            let workers = loop_spec
                .max_workers
                .unwrap_or(self.options.max_parallel)
                .clamp(1, self.options.max_parallel);
            let semaphore = Arc::new(Semaphore::new(workers));
            let mut join_set: JoinSet<(usize, StepExecution, Result<HashMap<String, Value>>)> =
                JoinSet::new();

            for binding in bindings {
                let runner = self.clone();
                let step = step.clone();
                let scope = scope.with_loop(binding.clone());
                let semaphore = semaphore.clone();
                let index = binding.index;
                join_set.spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .expect("loop semaphore closed");
                    let mut iteration = StepExecution::pending(format!(
                        "{}[{}]",
                        step.name, index
                    ));
                    iteration.status = ExecutionStatus::Running;
                    iteration.start_time = Some(Utc::now());
                    let result = runner.run_with_retry(&step, scope, &mut iteration).await;
                    iteration.end_time = Some(Utc::now());
                    (index, iteration, result)
                });
            }

            while let Some(joined) = join_set.join_next().await {
                let Ok((index, mut iteration, result)) = joined else {
                    first_error
                        .get_or_insert(EngineError::Validation("loop iteration panicked".into()));
                    continue;
                };
                match result {
                    Ok(map) => {
                        iteration.status = ExecutionStatus::Success;
                        iteration.outputs = map.clone();
                        outputs[index] = Some(Value::Object(map));
                    }
                    Err(err) => {
                        iteration.status = if err.is_cancelled() {
                            ExecutionStatus::Cancelled
                        } else {
                            ExecutionStatus::Failure
                        };
                        iteration.error = Some(err.to_string());
                        first_error.get_or_insert(err);
                    }
                }
                iteration_records[index] = Some(iteration);
            }
        } else {
            for binding in bindings {
                let index = binding.index;
                let scope = scope.with_loop(binding);
                let mut iteration =
                    StepExecution::pending(format!("{}[{}]", step.name, index));
                iteration.status = ExecutionStatus::Running;
                iteration.start_time = Some(Utc::now());
                let result = self.run_with_retry(step, scope, &mut iteration).await;
                iteration.end_time = Some(Utc::now());
                match result {
                    Ok(map) => {
                        iteration.status = ExecutionStatus::Success;
                        iteration.outputs = map.clone();
                        outputs[index] = Some(Value::Object(map));
                        iteration_records[index] = Some(iteration);
                    }
                    Err(err) => {
                        iteration.status = if err.is_cancelled() {
                            ExecutionStatus::Cancelled
                        } else {
                            ExecutionStatus::Failure
                        };
                        iteration.error = Some(err.to_string());
                        iteration_records[index] = Some(iteration);
                        first_error = Some(err);
                        break;
                    }
                }
            }
        }

        record.loop_iterations = Some(iteration_records.into_iter().flatten().collect());
        match first_error {
            Some(err) => Err(err),
            None => {
                let aggregated: Vec<Value> = outputs.into_iter().flatten().collect();
                Ok(HashMap::from([(
                    "results".to_string(),
                    Value::Array(aggregated),
                )]))
            }
        }
    }

    /// Runs one dispatch under the step's retry policy, recording attempts.
    async fn run_with_retry(
        &self,
        step: &Step,
        scope: Scope,
        record: &mut StepExecution,
    ) -> Result<HashMap<String, Value>> {
        let policy = step
            .retry
            .as_ref()
            .map(|spec| RetryPolicy::from_spec(spec, self.options.max_backoff_delay))
            .unwrap_or_else(|| self.options.default_retry.clone());

        let attempts: Mutex<Vec<AttemptRecord>> = Mutex::new(Vec::new());
        let (result, attempt_count) = RetryExecutor::new(policy)
            .execute(|_attempt| {
                let scope = scope.clone();
                let attempts = &attempts;
                async move {
                    let start = Utc::now();
                    let outcome = self.dispatch_once(step, &scope).await;
                    attempts.lock().push(AttemptRecord {
                        start_time: start,
                        end_time: Some(Utc::now()),
                        outputs: outcome.as_ref().cloned().unwrap_or_default(),
                        error: outcome.as_ref().err().map(ToString::to_string),
                    });
                    outcome
                }
            })
            .await;

        record.attempts = attempts.into_inner();
        result.map_err(|err| self.finalize_error(step, err, attempt_count))
    }

    /// One dispatch of the step's target with expanded parameters.
    async fn dispatch_once(&self, step: &Step, scope: &Scope) -> Result<HashMap<String, Value>> {
        if *self.cancel.borrow() {
            return Err(EngineError::Cancelled);
        }

        let timeout = step.timeout.unwrap_or(self.options.default_timeout);

        match &step.target {
            StepTarget::Subworkflow { subworkflow } => {
                let runner = self.subworkflows.as_ref().ok_or_else(|| {
                    EngineError::Validation(format!(
                        "step '{}' uses a subworkflow but nesting is not available here",
                        step.name
                    ))
                })?;
                let path = match &self.source_dir {
                    Some(dir) => dir.join(subworkflow),
                    None => PathBuf::from(subworkflow),
                };
                let variables = expr::expand_params(&step.params, scope)?;

                let nested = tokio::time::timeout(
                    timeout,
                    runner.run_subworkflow(
                        &path,
                        variables,
                        self.options.mode,
                        self.cancel.clone(),
                    ),
                )
                .await
                .map_err(|_| EngineError::StepTimeout {
                    workflow: self.workflow_name.clone(),
                    step: step.name.clone(),
                    timeout,
                })??;

                match nested.status {
                    ExecutionStatus::Success => Ok(nested.outputs),
                    ExecutionStatus::Cancelled => Err(EngineError::Cancelled),
                    _ => Err(EngineError::StepFailed {
                        workflow: self.workflow_name.clone(),
                        step: step.name.clone(),
                        attempts: 1,
                        message: nested
                            .error_message
                            .unwrap_or_else(|| "subworkflow failed".to_string()),
                        stderr: None,
                    }),
                }
            }
            target => {
                let (plugin, action, params) = self.materialize(target, step, scope)?;

                self.plugins.ensure(&plugin).await?;
                match self.options.mode {
                    ExecutionMode::Plan => {
                        self.plugins.validate(&plugin, &action, params).await?;
                        Ok(HashMap::new())
                    }
                    ExecutionMode::Apply => {
                        let outputs = self
                            .plugins
                            .invoke(&plugin, &action, params, timeout, self.cancel.clone())
                            .await?;
                        Ok(outputs)
                    }
                }
            }
        }
    }

    /// Resolves the concrete plugin call: templates contribute their
    /// defaults under the step's own parameters.
    fn materialize(
        &self,
        target: &StepTarget,
        step: &Step,
        scope: &Scope,
    ) -> Result<(String, String, HashMap<String, Value>)> {
        let (plugin, action, defaults) = match target {
            StepTarget::Plugin { plugin, action } => (plugin.clone(), action.clone(), None),
            StepTarget::Template { template } => {
                let spec = self.templates.get(template).ok_or_else(|| {
                    EngineError::Validation(format!(
                        "step '{}' references unknown template '{template}'",
                        step.name
                    ))
                })?;
                (
                    spec.plugin.clone(),
                    spec.action.clone(),
                    Some(spec.defaults.clone()),
                )
            }
            StepTarget::Subworkflow { .. } => unreachable!("handled by dispatch_once"),
        };

        let mut merged = defaults.unwrap_or_default();
        for (key, value) in &step.params {
            merged.insert(key.clone(), value.clone());
        }
        let params = expr::expand_params(&merged, scope)?;
        Ok((plugin, action, params))
    }

    /// Shapes the terminal error after retries: timeouts keep their own
    /// kind, everything else becomes `StepFailed`.
    fn finalize_error(&self, step: &Step, err: EngineError, attempts: u32) -> EngineError {
        match err {
            EngineError::Cancelled => EngineError::Cancelled,
            EngineError::StepTimeout {
                workflow,
                step,
                timeout,
            } => EngineError::StepTimeout {
                workflow,
                step,
                timeout,
            },
            EngineError::Plugin(PluginError::Timeout { timeout, .. }) => {
                EngineError::StepTimeout {
                    workflow: self.workflow_name.clone(),
                    step: step.name.clone(),
                    timeout,
                }
            }
            other => EngineError::StepFailed {
                workflow: self.workflow_name.clone(),
                step: step.name.clone(),
                attempts,
                message: other.to_string(),
                stderr: plugin_stderr(&other),
            },
        }
    }
}

fn plugin_stderr(err: &EngineError) -> Option<String> {
    match err {
        EngineError::Plugin(PluginError::ProtocolError { reason, .. }) => Some(reason.clone()),
        EngineError::Plugin(PluginError::ActionFailed { message, .. }) => Some(message.clone()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{ActionSpec, PluginMetadata, PluginRuntime};
    use crate::state::MemoryStateStore;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    /// Scripted in-process runtime: behavior keyed by the `behavior` param.
    #[derive(Default)]
    struct MockRuntime {
        invocations: AtomicU32,
        active: AtomicUsize,
        max_active: AtomicUsize,
        fail_until: AtomicU32,
    }

    impl MockRuntime {
        fn arc() -> Arc<Self> {
            Arc::new(Self::default())
        }
    }

    #[async_trait]
    impl PluginRuntime for MockRuntime {
        async fn ensure(&self, _name: &str) -> std::result::Result<(), PluginError> {
            Ok(())
        }

        async fn metadata(
            &self,
            name: &str,
        ) -> std::result::Result<PluginMetadata, PluginError> {
            Ok(PluginMetadata {
                name: name.to_string(),
                version: "0.0.0".into(),
                description: String::new(),
                author: String::new(),
                tags: Vec::new(),
                repository: None,
                license: None,
            })
        }

        async fn actions(
            &self,
            _name: &str,
        ) -> std::result::Result<HashMap<String, ActionSpec>, PluginError> {
            Ok(HashMap::new())
        }

        async fn invoke(
            &self,
            plugin: &str,
            action: &str,
            params: HashMap<String, Value>,
            _timeout: Duration,
            _cancel: watch::Receiver<bool>,
        ) -> std::result::Result<HashMap<String, Value>, PluginError> {
            let n = self.invocations.fetch_add(1, Ordering::SeqCst) + 1;
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);

            let behavior = params
                .get("behavior")
                .and_then(Value::as_str)
                .unwrap_or("ok");
            let result = match behavior {
                "sleep" => {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    Ok(HashMap::from([(
                        "done".to_string(),
                        Value::Bool(true),
                    )]))
                }
                "fail" => Err(PluginError::ActionFailed {
                    name: plugin.to_string(),
                    action: action.to_string(),
                    message: "boom".into(),
                }),
                "flaky" => {
                    if n <= self.fail_until.load(Ordering::SeqCst) {
                        Err(PluginError::ActionFailed {
                            name: plugin.to_string(),
                            action: action.to_string(),
                            message: format!("flake {n}"),
                        })
                    } else {
                        Ok(HashMap::from([(
                            "attempt".to_string(),
                            Value::Number(n as f64),
                        )]))
                    }
                }
                _ => {
                    let mut outputs = HashMap::new();
                    outputs.insert("invocation".to_string(), Value::Number(n as f64));
                    if let Some(echo) = params.get("echo") {
                        outputs.insert("echo".to_string(), echo.clone());
                    }
                    Ok(outputs)
                }
            };

            self.active.fetch_sub(1, Ordering::SeqCst);
            result
        }

        async fn validate(
            &self,
            _plugin: &str,
            _action: &str,
            _params: HashMap<String, Value>,
        ) -> std::result::Result<(), PluginError> {
            Ok(())
        }
    }

    fn step(name: &str, deps: &[&str]) -> Step {
        Step {
            name: name.into(),
            target: StepTarget::Plugin {
                plugin: "mock".into(),
                action: "run".into(),
            },
            params: HashMap::new(),
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            condition: None,
            loop_spec: None,
            retry: None,
            timeout: None,
            continue_on_error: false,
        }
    }

    fn workflow(steps: Vec<Step>) -> Workflow {
        Workflow {
            name: "sched-test".into(),
            description: None,
            version: None,
            variables: HashMap::new(),
            locals: HashMap::new(),
            templates: HashMap::new(),
            steps,
            outputs: HashMap::new(),
            depends_on_workflows: Vec::new(),
            trigger_workflows: Vec::new(),
            source_dir: None,
        }
    }

    struct Harness {
        runtime: Arc<MockRuntime>,
        scheduler: StepScheduler,
        cancel_tx: watch::Sender<bool>,
        cancel_rx: watch::Receiver<bool>,
    }

    fn harness(max_parallel: usize) -> Harness {
        let runtime = MockRuntime::arc();
        let scheduler = StepScheduler::new(
            runtime.clone(),
            Arc::new(MemoryStateStore::new()),
            None,
            SchedulerOptions {
                max_parallel,
                ..SchedulerOptions::default()
            },
        );
        let (cancel_tx, cancel_rx) = watch::channel(false);
        Harness {
            runtime,
            scheduler,
            cancel_tx,
            cancel_rx,
        }
    }

    async fn run(h: &Harness, wf: &Workflow) -> ExecutionState {
        run_with_vars(h, wf, HashMap::new()).await
    }

    async fn run_with_vars(
        h: &Harness,
        wf: &Workflow,
        vars: HashMap<String, Value>,
    ) -> ExecutionState {
        let ctx = Arc::new(ExecutionContext::new(vars));
        let execution = ExecutionState::new(&wf.name, ExecutionMode::Apply, HashMap::new());
        h.scheduler
            .run(wf, ctx, execution, h.cancel_rx.clone())
            .await
    }

    #[tokio::test]
    async fn test_linear_chain_runs_in_order() {
        let h = harness(4);
        let wf = workflow(vec![step("a", &[]), step("b", &["a"]), step("c", &["b"])]);
        let result = run(&h, &wf).await;

        assert_eq!(result.status, ExecutionStatus::Success);
        let a = result.step("a").unwrap();
        let b = result.step("b").unwrap();
        let c = result.step("c").unwrap();
        assert!(b.start_time.unwrap() >= a.end_time.unwrap());
        assert!(c.start_time.unwrap() >= b.end_time.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fan_out_fan_in_parallelism() {
        let h = harness(3);
        let mut steps: Vec<Step> = ["a", "b", "c"]
            .iter()
            .map(|name| {
                let mut s = step(name, &[]);
                s.params
                    .insert("behavior".into(), Value::String("sleep".into()));
                s
            })
            .collect();
        steps.push(step("d", &["a", "b", "c"]));
        let wf = workflow(steps);

        let started = tokio::time::Instant::now();
        let result = run(&h, &wf).await;
        let elapsed = started.elapsed();

        assert_eq!(result.status, ExecutionStatus::Success);
        // Three 1s sleeps on three workers complete together.
        assert!(elapsed < Duration::from_millis(2100), "took {elapsed:?}");
        assert_eq!(h.runtime.max_active.load(Ordering::SeqCst), 3);

        let d = result.step("d").unwrap();
        for name in ["a", "b", "c"] {
            assert!(d.start_time.unwrap() >= result.step(name).unwrap().end_time.unwrap());
        }
    }

    #[tokio::test]
    async fn test_condition_skip_cascades() {
        let h = harness(2);
        let mut gate = step("p", &[]);
        gate.condition = Some("var.env == \"prod\"".into());
        let wf = workflow(vec![gate, step("q", &["p"])]);

        let mut vars = HashMap::new();
        vars.insert("env".to_string(), Value::String("dev".into()));
        let result = run_with_vars(&h, &wf, vars).await;

        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.step("p").unwrap().status, ExecutionStatus::Skipped);
        assert_eq!(result.step("q").unwrap().status, ExecutionStatus::Skipped);
        assert_eq!(h.runtime.invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_skipped_dependency_with_continue_on_error_runs() {
        let h = harness(2);
        let mut gate = step("p", &[]);
        gate.condition = Some("false".into());
        let mut q = step("q", &["p"]);
        q.continue_on_error = true;
        let wf = workflow(vec![gate, q]);

        let result = run(&h, &wf).await;
        assert_eq!(result.step("p").unwrap().status, ExecutionStatus::Skipped);
        assert_eq!(result.step("q").unwrap().status, ExecutionStatus::Success);
    }

    #[tokio::test]
    async fn test_reference_to_skipped_step_is_unresolved() {
        let h = harness(2);
        let mut gate = step("p", &[]);
        gate.condition = Some("false".into());
        let mut q = step("q", &["p"]);
        q.continue_on_error = true;
        q.params
            .insert("echo".into(), Value::String("${step.p.out}".into()));
        let wf = workflow(vec![gate, q]);

        let result = run(&h, &wf).await;
        let q = result.step("q").unwrap();
        assert_eq!(q.status, ExecutionStatus::Failure);
        assert!(q.error.as_deref().unwrap().contains("step.p.out"));
        // continue_on_error still unblocks nothing downstream here, but the
        // run keeps its success/failure accounting per flag.
        assert_eq!(result.status, ExecutionStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_eventual_success() {
        let h = harness(2);
        h.runtime.fail_until.store(2, Ordering::SeqCst);
        let mut s = step("flaky", &[]);
        s.params
            .insert("behavior".into(), Value::String("flaky".into()));
        s.retry = Some(crate::workflow::RetrySpec {
            max_attempts: 3,
            delay: Duration::from_millis(100),
            backoff: crate::workflow::BackoffStrategy::Exponential,
        });
        let wf = workflow(vec![s]);

        let result = run(&h, &wf).await;
        let record = result.step("flaky").unwrap();
        assert_eq!(record.status, ExecutionStatus::Success);
        assert_eq!(record.attempts.len(), 3);
        assert!(record.attempts[0].error.is_some());
        assert!(record.attempts[2].error.is_none());
        assert_eq!(record.outputs["attempt"], Value::Number(3.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_fails_step() {
        let h = harness(2);
        let mut s = step("doomed", &[]);
        s.params
            .insert("behavior".into(), Value::String("fail".into()));
        s.retry = Some(crate::workflow::RetrySpec {
            max_attempts: 2,
            delay: Duration::from_millis(10),
            backoff: crate::workflow::BackoffStrategy::Fixed,
        });
        let wf = workflow(vec![s, step("after", &["doomed"])]);

        let result = run(&h, &wf).await;
        assert_eq!(result.status, ExecutionStatus::Failure);
        let record = result.step("doomed").unwrap();
        assert_eq!(record.status, ExecutionStatus::Failure);
        assert_eq!(record.attempts.len(), 2);
        assert_eq!(
            result.step("after").unwrap().status,
            ExecutionStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_continue_on_error_unblocks_dependents() {
        let h = harness(2);
        let mut s = step("lossy", &[]);
        s.params
            .insert("behavior".into(), Value::String("fail".into()));
        s.continue_on_error = true;
        let wf = workflow(vec![s, step("after", &["lossy"])]);

        let result = run(&h, &wf).await;
        assert_eq!(result.step("lossy").unwrap().status, ExecutionStatus::Failure);
        assert_eq!(result.step("after").unwrap().status, ExecutionStatus::Success);
        assert_eq!(result.status, ExecutionStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_dispatch() {
        let h = harness(1);
        let mut slow = step("slow", &[]);
        slow.params
            .insert("behavior".into(), Value::String("sleep".into()));
        let wf = workflow(vec![slow, step("next", &["slow"])]);

        let cancel_tx = h.cancel_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let _ = cancel_tx.send(true);
        });

        let result = run(&h, &wf).await;
        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert_eq!(
            result.step("next").unwrap().status,
            ExecutionStatus::Cancelled
        );
        // Only the in-flight step ever reached the runtime.
        assert_eq!(h.runtime.invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_loop_bounds_workers_and_orders_outputs() {
        let h = harness(4);
        let mut s = step("fan", &[]);
        s.params
            .insert("behavior".into(), Value::String("sleep".into()));
        s.params
            .insert("echo".into(), Value::String("${loop.value}".into()));
        s.loop_spec = Some(crate::workflow::LoopSpec {
            over: Value::Array(vec![
                Value::String("a".into()),
                Value::String("b".into()),
                Value::String("c".into()),
            ]),
            variable: "item".into(),
            parallel: true,
            max_workers: Some(2),
        });
        let wf = workflow(vec![s]);

        let result = run(&h, &wf).await;
        assert_eq!(result.status, ExecutionStatus::Success);
        assert!(h.runtime.max_active.load(Ordering::SeqCst) <= 2);

        let record = result.step("fan").unwrap();
        assert_eq!(record.loop_iterations.as_ref().unwrap().len(), 3);
        let results = record.outputs["results"].try_array().unwrap().clone();
        assert_eq!(results.len(), 3);
        let echoed: Vec<&str> = results
            .iter()
            .map(|item| item.get("echo").unwrap().as_str().unwrap())
            .collect();
        assert_eq!(echoed, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_map_loop_iterates_sorted_keys() {
        let h = harness(2);
        let mut s = step("fan", &[]);
        s.params
            .insert("echo".into(), Value::String("${loop.key}=${loop.value}".into()));
        s.loop_spec = Some(crate::workflow::LoopSpec {
            over: Value::Object(HashMap::from([
                ("zeta".to_string(), Value::Number(1.0)),
                ("alpha".to_string(), Value::Number(2.0)),
            ])),
            variable: "entry".into(),
            parallel: false,
            max_workers: None,
        });
        let wf = workflow(vec![s]);

        let result = run(&h, &wf).await;
        let record = result.step("fan").unwrap();
        let results = record.outputs["results"].try_array().unwrap().clone();
        let echoed: Vec<&str> = results
            .iter()
            .map(|item| item.get("echo").unwrap().as_str().unwrap())
            .collect();
        assert_eq!(echoed, vec!["alpha=2", "zeta=1"]);
    }

    #[tokio::test]
    async fn test_plan_mode_does_not_invoke() {
        let runtime = MockRuntime::arc();
        let scheduler = StepScheduler::new(
            runtime.clone(),
            Arc::new(MemoryStateStore::new()),
            None,
            SchedulerOptions {
                mode: ExecutionMode::Plan,
                ..SchedulerOptions::default()
            },
        );
        let (_tx, rx) = watch::channel(false);
        let wf = workflow(vec![step("a", &[]), step("b", &["a"])]);
        let ctx = Arc::new(ExecutionContext::new(HashMap::new()));
        let execution = ExecutionState::new(&wf.name, ExecutionMode::Plan, HashMap::new());

        let result = scheduler.run(&wf, ctx, execution, rx).await;
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(runtime.invocations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_template_merges_defaults_under_params() {
        let h = harness(2);
        let mut wf = workflow(vec![]);
        wf.templates.insert(
            "echoer".into(),
            TemplateSpec {
                plugin: "mock".into(),
                action: "run".into(),
                defaults: HashMap::from([
                    ("echo".to_string(), Value::String("default".into())),
                    ("behavior".to_string(), Value::String("ok".into())),
                ]),
            },
        );
        let mut s = step("templated", &[]);
        s.target = StepTarget::Template {
            template: "echoer".into(),
        };
        s.params
            .insert("echo".into(), Value::String("override".into()));
        wf.steps.push(s);

        let result = run(&h, &wf).await;
        let record = result.step("templated").unwrap();
        assert_eq!(record.status, ExecutionStatus::Success);
        assert_eq!(record.outputs["echo"], Value::String("override".into()));
    }

    #[tokio::test]
    async fn test_step_outputs_flow_into_scope() {
        let h = harness(2);
        let producer = step("produce", &[]);
        let mut consumer = step("consume", &["produce"]);
        consumer.params.insert(
            "echo".into(),
            Value::String("${step.produce.invocation}".into()),
        );
        let wf = workflow(vec![producer, consumer]);

        let result = run(&h, &wf).await;
        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(
            result.step("consume").unwrap().outputs["echo"],
            Value::Number(1.0)
        );
    }

    #[tokio::test]
    async fn test_independent_branch_survives_failure() {
        let h = harness(2);
        let mut bad = step("bad", &[]);
        bad.params
            .insert("behavior".into(), Value::String("fail".into()));
        let wf = workflow(vec![
            bad,
            step("bad_child", &["bad"]),
            step("independent", &[]),
        ]);

        let result = run(&h, &wf).await;
        assert_eq!(result.status, ExecutionStatus::Failure);
        assert_eq!(
            result.step("bad_child").unwrap().status,
            ExecutionStatus::Cancelled
        );
        assert_eq!(
            result.step("independent").unwrap().status,
            ExecutionStatus::Success
        );
    }
}
