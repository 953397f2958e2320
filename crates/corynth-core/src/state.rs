// Copyright (c) 2025 Corynth Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Execution records and the state persistence seam.
//!
//! The engine owns the in-memory [`ExecutionState`] of an active run and
//! persists it through a [`StateStore`] on every status transition. Backends
//! live in the `corynth-state` crate; the in-memory store here backs tests
//! and ephemeral runs.

use crate::error::StateError;
use crate::value::Value;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Terminal and intermediate statuses for runs and steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failure,
    Cancelled,
    Skipped,
}

impl ExecutionStatus {
    /// True once no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
        };
        write!(f, "{name}")
    }
}

/// Whether a run executes plugins or only validates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Plan,
    Apply,
}

/// One invocation attempt of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
    pub error: Option<String>,
}

/// Execution record of one step, including loop iterations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepExecution {
    pub step_name: String,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub attempts: Vec<AttemptRecord>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub loop_iterations: Option<Vec<StepExecution>>,
}

impl StepExecution {
    pub fn pending(step_name: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            status: ExecutionStatus::Pending,
            attempts: Vec::new(),
            start_time: None,
            end_time: None,
            outputs: HashMap::new(),
            error: None,
            loop_iterations: None,
        }
    }
}

/// Record of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionState {
    pub id: Uuid,
    pub workflow_name: String,
    pub status: ExecutionStatus,
    pub execution_mode: ExecutionMode,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
    #[serde(default)]
    pub steps: Vec<StepExecution>,
    pub error_message: Option<String>,
}

impl ExecutionState {
    pub fn new(
        workflow_name: impl Into<String>,
        mode: ExecutionMode,
        variables: HashMap<String, Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            workflow_name: workflow_name.into(),
            status: ExecutionStatus::Pending,
            execution_mode: mode,
            start_time: Utc::now(),
            end_time: None,
            variables,
            outputs: HashMap::new(),
            steps: Vec::new(),
            error_message: None,
        }
    }

    /// Duration of the run so far, or total once finished.
    pub fn duration(&self) -> Duration {
        let end = self.end_time.unwrap_or_else(Utc::now);
        (end - self.start_time).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn step(&self, name: &str) -> Option<&StepExecution> {
        self.steps.iter().find(|s| s.step_name == name)
    }
}

/// Named outputs exported across workflows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowOutput {
    pub workflow_name: String,
    #[serde(default)]
    pub outputs: HashMap<String, Value>,
    pub timestamp: DateTime<Utc>,
}

/// Persistence seam for execution records and workflow outputs.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save_execution(&self, execution: &ExecutionState) -> Result<(), StateError>;

    /// Loads by full id or by a unique prefix of at least 8 characters.
    async fn load_execution(&self, id: &str) -> Result<ExecutionState, StateError>;

    async fn list_executions(&self) -> Result<Vec<ExecutionState>, StateError>;

    async fn find_by_workflow(&self, workflow: &str) -> Result<Vec<ExecutionState>, StateError>;

    /// Most recent execution of a workflow by start time.
    async fn get_latest(&self, workflow: &str) -> Result<Option<ExecutionState>, StateError>;

    async fn delete_execution(&self, id: &str) -> Result<(), StateError>;

    async fn save_workflow_output(&self, output: &WorkflowOutput) -> Result<(), StateError>;

    async fn load_workflow_output(
        &self,
        workflow: &str,
    ) -> Result<Option<WorkflowOutput>, StateError>;

    /// Removes executions older than `max_age` or beyond the `max_count`
    /// newest, returning the number deleted.
    async fn cleanup(
        &self,
        max_age: Option<Duration>,
        max_count: Option<usize>,
    ) -> Result<usize, StateError>;
}

pub type StateStoreRef = Arc<dyn StateStore>;

/// Volatile store used by tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryStateStore {
    executions: RwLock<Vec<ExecutionState>>,
    outputs: RwLock<HashMap<String, WorkflowOutput>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Shared prefix-match helper used by every backend.
pub fn match_execution<'a>(
    executions: &'a [ExecutionState],
    id: &str,
) -> Result<&'a ExecutionState, StateError> {
    if let Some(found) = executions.iter().find(|e| e.id.to_string() == id) {
        return Ok(found);
    }
    if id.len() < 8 {
        return Err(StateError::NotFound(id.to_string()));
    }
    let matches: Vec<&ExecutionState> = executions
        .iter()
        .filter(|e| e.id.to_string().starts_with(id))
        .collect();
    match matches.as_slice() {
        [] => Err(StateError::NotFound(id.to_string())),
        [single] => Ok(single),
        _ => Err(StateError::AmbiguousPrefix(id.to_string())),
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn save_execution(&self, execution: &ExecutionState) -> Result<(), StateError> {
        let mut executions = self.executions.write();
        match executions.iter_mut().find(|e| e.id == execution.id) {
            Some(existing) => *existing = execution.clone(),
            None => executions.push(execution.clone()),
        }
        executions.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(())
    }

    async fn load_execution(&self, id: &str) -> Result<ExecutionState, StateError> {
        let executions = self.executions.read();
        match_execution(&executions, id).cloned()
    }

    async fn list_executions(&self) -> Result<Vec<ExecutionState>, StateError> {
        Ok(self.executions.read().clone())
    }

    async fn find_by_workflow(&self, workflow: &str) -> Result<Vec<ExecutionState>, StateError> {
        Ok(self
            .executions
            .read()
            .iter()
            .filter(|e| e.workflow_name == workflow)
            .cloned()
            .collect())
    }

    async fn get_latest(&self, workflow: &str) -> Result<Option<ExecutionState>, StateError> {
        Ok(self
            .executions
            .read()
            .iter()
            .filter(|e| e.workflow_name == workflow)
            .max_by_key(|e| e.start_time)
            .cloned())
    }

    async fn delete_execution(&self, id: &str) -> Result<(), StateError> {
        let mut executions = self.executions.write();
        let target = match_execution(&executions, id)?.id;
        executions.retain(|e| e.id != target);
        Ok(())
    }

    async fn save_workflow_output(&self, output: &WorkflowOutput) -> Result<(), StateError> {
        self.outputs
            .write()
            .insert(output.workflow_name.clone(), output.clone());
        Ok(())
    }

    async fn load_workflow_output(
        &self,
        workflow: &str,
    ) -> Result<Option<WorkflowOutput>, StateError> {
        Ok(self.outputs.read().get(workflow).cloned())
    }

    async fn cleanup(
        &self,
        max_age: Option<Duration>,
        max_count: Option<usize>,
    ) -> Result<usize, StateError> {
        let mut executions = self.executions.write();
        let before = executions.len();

        if let Some(age) = max_age {
            let cutoff = Utc::now() - chrono::Duration::from_std(age).unwrap_or_default();
            executions.retain(|e| e.start_time >= cutoff);
        }
        if let Some(count) = max_count {
            executions.sort_by(|a, b| b.start_time.cmp(&a.start_time));
            executions.truncate(count);
        }

        Ok(before - executions.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execution(workflow: &str) -> ExecutionState {
        ExecutionState::new(workflow, ExecutionMode::Apply, HashMap::new())
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let store = MemoryStateStore::new();
        let mut exec = execution("deploy");
        exec.outputs
            .insert("url".into(), Value::String("https://x".into()));
        exec.steps.push(StepExecution::pending("greet"));

        store.save_execution(&exec).await.unwrap();
        let loaded = store.load_execution(&exec.id.to_string()).await.unwrap();
        assert_eq!(loaded, exec);
    }

    #[tokio::test]
    async fn test_prefix_lookup() {
        let store = MemoryStateStore::new();
        let exec = execution("deploy");
        store.save_execution(&exec).await.unwrap();

        let prefix = &exec.id.to_string()[..8];
        let loaded = store.load_execution(prefix).await.unwrap();
        assert_eq!(loaded.id, exec.id);

        // Short prefixes are rejected.
        assert!(matches!(
            store.load_execution(&exec.id.to_string()[..4]).await,
            Err(StateError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_get_latest_orders_by_start_time() {
        let store = MemoryStateStore::new();
        let mut old = execution("deploy");
        old.start_time = Utc::now() - chrono::Duration::hours(2);
        let new = execution("deploy");

        store.save_execution(&old).await.unwrap();
        store.save_execution(&new).await.unwrap();

        let latest = store.get_latest("deploy").await.unwrap().unwrap();
        assert_eq!(latest.id, new.id);
    }

    #[tokio::test]
    async fn test_cleanup_by_count() {
        let store = MemoryStateStore::new();
        for _ in 0..5 {
            store.save_execution(&execution("w")).await.unwrap();
        }
        let removed = store.cleanup(None, Some(2)).await.unwrap();
        assert_eq!(removed, 3);
        assert_eq!(store.list_executions().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_workflow_output_round_trip() {
        let store = MemoryStateStore::new();
        let output = WorkflowOutput {
            workflow_name: "etl".into(),
            outputs: HashMap::from([("rows".into(), Value::Number(42.0))]),
            timestamp: Utc::now(),
        };
        store.save_workflow_output(&output).await.unwrap();
        let loaded = store.load_workflow_output("etl").await.unwrap().unwrap();
        assert_eq!(loaded, output);
        assert!(store.load_workflow_output("none").await.unwrap().is_none());
    }

    #[test]
    fn test_status_terminality() {
        assert!(ExecutionStatus::Success.is_terminal());
        assert!(ExecutionStatus::Skipped.is_terminal());
        assert!(!ExecutionStatus::Running.is_terminal());
    }
}
