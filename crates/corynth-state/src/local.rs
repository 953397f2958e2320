// Copyright (c) 2025 Corynth Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Local file backend.
//!
//! One canonical file `<state_dir>/corynth.tfstate` holds a versioned
//! envelope of the most recent executions, newest first, bounded to a
//! ring of 100. Per-workflow outputs live next to it as
//! `outputs_<workflow>.json`. Every write rewrites the whole file through
//! a temp file in the same directory followed by a rename, so a
//! concurrent reader observes either the previous or the next complete
//! state. All writes serialize on an in-process mutex; cross-process
//! coordination is cooperative.

use crate::envelope::StateEnvelope;
use async_trait::async_trait;
use chrono::Utc;
use corynth_core::state::{match_execution, ExecutionState, StateStore, WorkflowOutput};
use corynth_core::StateError;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

pub const STATE_FILE: &str = "corynth.tfstate";

/// Most recent executions kept in the file.
pub const MAX_EXECUTIONS: usize = 100;

/// File-backed state store.
pub struct LocalStateStore {
    state_dir: PathBuf,
    write_lock: Mutex<()>,
    max_executions: usize,
}

impl LocalStateStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Result<Self, StateError> {
        let state_dir = state_dir.into();
        std::fs::create_dir_all(&state_dir)?;
        Ok(Self {
            state_dir,
            write_lock: Mutex::new(()),
            max_executions: MAX_EXECUTIONS,
        })
    }

    fn state_path(&self) -> PathBuf {
        self.state_dir.join(STATE_FILE)
    }

    fn output_path(&self, workflow: &str) -> PathBuf {
        self.state_dir.join(format!("outputs_{workflow}.json"))
    }

    fn read_envelope(&self) -> Result<StateEnvelope, StateError> {
        let path = self.state_path();
        if !path.exists() {
            return Ok(StateEnvelope::default());
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Whole-file rewrite: temp file in the same directory, then rename.
    fn write_envelope(&self, envelope: &StateEnvelope) -> Result<(), StateError> {
        let path = self.state_path();
        let tmp = self
            .state_dir
            .join(format!(".{STATE_FILE}.tmp.{}", std::process::id()));
        let content = serde_json::to_string_pretty(envelope)?;
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn write_json_atomic(&self, path: &Path, content: &str) -> Result<(), StateError> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = self
            .state_dir
            .join(format!(".{file_name}.tmp.{}", std::process::id()));
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn save_execution(&self, execution: &ExecutionState) -> Result<(), StateError> {
        let _guard = self.write_lock.lock();
        let mut envelope = self.read_envelope()?;

        match envelope
            .executions
            .iter_mut()
            .find(|e| e.id == execution.id)
        {
            Some(existing) => *existing = execution.clone(),
            None => envelope.executions.push(execution.clone()),
        }

        envelope
            .executions
            .sort_by(|a, b| b.start_time.cmp(&a.start_time));
        envelope.executions.truncate(self.max_executions);

        self.write_envelope(&envelope)?;
        debug!(execution = %execution.id, "execution saved");
        Ok(())
    }

    async fn load_execution(&self, id: &str) -> Result<ExecutionState, StateError> {
        let envelope = self.read_envelope()?;
        match_execution(&envelope.executions, id).cloned()
    }

    async fn list_executions(&self) -> Result<Vec<ExecutionState>, StateError> {
        Ok(self.read_envelope()?.executions)
    }

    async fn find_by_workflow(&self, workflow: &str) -> Result<Vec<ExecutionState>, StateError> {
        Ok(self
            .read_envelope()?
            .executions
            .into_iter()
            .filter(|e| e.workflow_name == workflow)
            .collect())
    }

    async fn get_latest(&self, workflow: &str) -> Result<Option<ExecutionState>, StateError> {
        // Envelope ordering is newest first.
        Ok(self
            .read_envelope()?
            .executions
            .into_iter()
            .find(|e| e.workflow_name == workflow))
    }

    async fn delete_execution(&self, id: &str) -> Result<(), StateError> {
        let _guard = self.write_lock.lock();
        let mut envelope = self.read_envelope()?;
        let target = match_execution(&envelope.executions, id)?.id;
        envelope.executions.retain(|e| e.id != target);
        self.write_envelope(&envelope)
    }

    async fn save_workflow_output(&self, output: &WorkflowOutput) -> Result<(), StateError> {
        let _guard = self.write_lock.lock();
        let content = serde_json::to_string_pretty(output)?;
        self.write_json_atomic(&self.output_path(&output.workflow_name), &content)
    }

    async fn load_workflow_output(
        &self,
        workflow: &str,
    ) -> Result<Option<WorkflowOutput>, StateError> {
        let path = self.output_path(workflow);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    async fn cleanup(
        &self,
        max_age: Option<Duration>,
        max_count: Option<usize>,
    ) -> Result<usize, StateError> {
        let _guard = self.write_lock.lock();
        let mut envelope = self.read_envelope()?;
        let before = envelope.executions.len();

        if let Some(age) = max_age {
            let cutoff = Utc::now() - chrono::Duration::from_std(age).unwrap_or_default();
            envelope.executions.retain(|e| e.start_time >= cutoff);
        }
        if let Some(count) = max_count {
            envelope
                .executions
                .sort_by(|a, b| b.start_time.cmp(&a.start_time));
            envelope.executions.truncate(count);
        }

        let removed = before - envelope.executions.len();
        if removed > 0 {
            self.write_envelope(&envelope)?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use corynth_core::state::ExecutionMode;
    use corynth_core::Value;
    use std::collections::HashMap;

    fn store(dir: &Path) -> LocalStateStore {
        LocalStateStore::new(dir).unwrap()
    }

    fn execution(workflow: &str) -> ExecutionState {
        ExecutionState::new(workflow, ExecutionMode::Apply, HashMap::new())
    }

    #[tokio::test]
    async fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let mut exec = execution("deploy");
        exec.variables
            .insert("env".into(), Value::String("prod".into()));
        exec.outputs.insert("url".into(), Value::String("https://x".into()));

        store.save_execution(&exec).await.unwrap();
        let loaded = store.load_execution(&exec.id.to_string()).await.unwrap();
        assert_eq!(loaded, exec);
    }

    #[tokio::test]
    async fn test_envelope_shape_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.save_execution(&execution("w")).await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join(STATE_FILE)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["version"], 1);
        assert!(json["executions"].is_array());
    }

    #[tokio::test]
    async fn test_update_replaces_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let mut exec = execution("deploy");
        store.save_execution(&exec).await.unwrap();
        exec.error_message = Some("late failure".into());
        store.save_execution(&exec).await.unwrap();

        let all = store.list_executions().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].error_message.as_deref(), Some("late failure"));
    }

    #[tokio::test]
    async fn test_ring_bound() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store(dir.path());
        store.max_executions = 5;

        for i in 0..8 {
            let mut exec = execution("w");
            exec.start_time = Utc::now() + chrono::Duration::seconds(i);
            store.save_execution(&exec).await.unwrap();
        }

        let all = store.list_executions().await.unwrap();
        assert_eq!(all.len(), 5);
        // Newest first.
        assert!(all[0].start_time > all[4].start_time);
    }

    #[tokio::test]
    async fn test_prefix_lookup_rules() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let exec = execution("w");
        store.save_execution(&exec).await.unwrap();

        let id = exec.id.to_string();
        assert!(store.load_execution(&id[..8]).await.is_ok());
        assert!(matches!(
            store.load_execution(&id[..7]).await,
            Err(StateError::NotFound(_))
        ));
        assert!(matches!(
            store.load_execution("0000000000").await,
            Err(StateError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_execution() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let exec = execution("w");
        store.save_execution(&exec).await.unwrap();

        store.delete_execution(&exec.id.to_string()).await.unwrap();
        assert!(store.list_executions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_find_and_latest() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let mut old = execution("deploy");
        old.start_time = Utc::now() - chrono::Duration::hours(1);
        let new = execution("deploy");
        let other = execution("etl");
        store.save_execution(&old).await.unwrap();
        store.save_execution(&new).await.unwrap();
        store.save_execution(&other).await.unwrap();

        assert_eq!(store.find_by_workflow("deploy").await.unwrap().len(), 2);
        assert_eq!(
            store.get_latest("deploy").await.unwrap().unwrap().id,
            new.id
        );
        assert!(store.get_latest("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_workflow_output_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let output = WorkflowOutput {
            workflow_name: "etl".into(),
            outputs: HashMap::from([("rows".into(), Value::Number(9.0))]),
            timestamp: Utc::now(),
        };
        store.save_workflow_output(&output).await.unwrap();

        assert!(dir.path().join("outputs_etl.json").exists());
        let loaded = store.load_workflow_output("etl").await.unwrap().unwrap();
        assert_eq!(loaded, output);
    }

    #[tokio::test]
    async fn test_cleanup_by_age_and_count() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());

        let mut ancient = execution("w");
        ancient.start_time = Utc::now() - chrono::Duration::days(30);
        store.save_execution(&ancient).await.unwrap();
        for _ in 0..3 {
            store.save_execution(&execution("w")).await.unwrap();
        }

        let removed = store
            .cleanup(Some(Duration::from_secs(24 * 3600)), None)
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let removed = store.cleanup(None, Some(2)).await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.list_executions().await.unwrap().len(), 2);
    }

    /// A reader racing a writer sees only complete states (the rename is
    /// atomic); a torn read would fail JSON parsing.
    #[tokio::test]
    async fn test_atomic_save_visibility() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(store(dir.path()));

        let writer = {
            let store = store.clone();
            tokio::spawn(async move {
                for _ in 0..25 {
                    let mut exec = execution("race");
                    exec.variables.insert(
                        "payload".into(),
                        Value::String("x".repeat(4096)),
                    );
                    store.save_execution(&exec).await.unwrap();
                }
            })
        };

        let reader = {
            let store = store.clone();
            tokio::spawn(async move {
                for _ in 0..50 {
                    // Never a torn file: parse always succeeds.
                    let _ = store.list_executions().await.unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };

        writer.await.unwrap();
        reader.await.unwrap();
    }
}
