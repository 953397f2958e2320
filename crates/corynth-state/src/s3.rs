// Copyright (c) 2025 Corynth Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Remote object store backend (S3).
//!
//! Executions are stored one object each under
//! `<prefix>/executions/<id>.json`, workflow outputs under
//! `<prefix>/outputs/<name>.json`. Writers take an advisory lock object at
//! `<prefix>/locks/<id>.lock` via a conditional put; a conflicting holder
//! yields `LockNotAcquired`. Locking can be disabled, in which case writes
//! race last-writer-wins. Cleanup deletes in bounded batches.

use async_trait::async_trait;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{Delete, ObjectIdentifier};
use aws_sdk_s3::Client;
use chrono::Utc;
use corynth_core::state::{match_execution, ExecutionState, StateStore, WorkflowOutput};
use corynth_core::StateError;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Objects deleted per DeleteObjects request.
const MAX_DELETE_BATCH: usize = 1000;

/// Backend configuration, read from `state.backend_config`.
#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    pub prefix: String,
    pub region: Option<String>,
    /// Advisory locking on saves; disabling makes writes race.
    pub locking: bool,
}

impl S3Config {
    /// Parses the generic `backend_config` key map.
    pub fn from_map(map: &HashMap<String, String>) -> Result<Self, StateError> {
        let bucket = map
            .get("bucket")
            .cloned()
            .ok_or_else(|| StateError::Backend("s3 backend requires 'bucket'".into()))?;
        Ok(Self {
            bucket,
            prefix: map
                .get("prefix")
                .cloned()
                .unwrap_or_else(|| "corynth".to_string()),
            region: map.get("region").cloned(),
            locking: map
                .get("lock")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(true),
        })
    }
}

/// S3-backed state store.
pub struct S3StateStore {
    client: Client,
    config: S3Config,
}

impl S3StateStore {
    /// Builds a store from ambient AWS credentials.
    pub async fn connect(config: S3Config) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(aws_sdk_s3::config::Region::new(region.clone()));
        }
        let shared = loader.load().await;
        Self {
            client: Client::new(&shared),
            config,
        }
    }

    pub fn with_client(client: Client, config: S3Config) -> Self {
        Self { client, config }
    }

    fn execution_key(&self, id: &str) -> String {
        format!("{}/executions/{id}.json", self.config.prefix)
    }

    fn output_key(&self, workflow: &str) -> String {
        format!("{}/outputs/{workflow}.json", self.config.prefix)
    }

    fn lock_key(&self, id: &str) -> String {
        format!("{}/locks/{id}.lock", self.config.prefix)
    }

    async fn put_json(&self, key: &str, body: Vec<u8>) -> Result<(), StateError> {
        self.client
            .put_object()
            .bucket(&self.config.bucket)
            .key(key)
            .content_type("application/json")
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| StateError::Backend(format!("put {key}: {err}")))?;
        Ok(())
    }

    async fn get_json(&self, key: &str) -> Result<Option<Vec<u8>>, StateError> {
        match self
            .client
            .get_object()
            .bucket(&self.config.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(output) => {
                let bytes = output
                    .body
                    .collect()
                    .await
                    .map_err(|err| StateError::Backend(format!("read {key}: {err}")))?;
                Ok(Some(bytes.into_bytes().to_vec()))
            }
            Err(SdkError::ServiceError(service)) if service.err().is_no_such_key() => Ok(None),
            Err(err) => Err(StateError::Backend(format!("get {key}: {err}"))),
        }
    }

    /// Conditional put of the lock object; a pre-existing lock means
    /// another writer holds it.
    async fn acquire_lock(&self, id: &str) -> Result<(), StateError> {
        let key = self.lock_key(id);
        let body = format!(
            "{{\"holder\":\"corynth-{}\",\"acquired\":\"{}\"}}",
            std::process::id(),
            Utc::now().to_rfc3339()
        );

        match self
            .client
            .put_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .if_none_match("*")
            .body(ByteStream::from(body.into_bytes()))
            .send()
            .await
        {
            Ok(_) => {
                debug!(key = %key, "lock acquired");
                Ok(())
            }
            Err(SdkError::ServiceError(service))
                if service.raw().status().as_u16() == 412 =>
            {
                Err(StateError::LockNotAcquired(id.to_string()))
            }
            Err(err) => Err(StateError::Backend(format!("lock {key}: {err}"))),
        }
    }

    /// Deletes the lock object. Called on every exit path of a locked
    /// write; a failed release is logged, surfacing as a conflict for the
    /// next writer rather than silent corruption.
    async fn release_lock(&self, id: &str) {
        let key = self.lock_key(id);
        if let Err(err) = self
            .client
            .delete_object()
            .bucket(&self.config.bucket)
            .key(&key)
            .send()
            .await
        {
            warn!(key = %key, error = %err, "failed to release lock");
        }
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<(String, Option<i64>)>, StateError> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.config.bucket)
                .prefix(prefix);
            if let Some(token) = &continuation {
                request = request.continuation_token(token);
            }
            let response = request
                .send()
                .await
                .map_err(|err| StateError::Backend(format!("list {prefix}: {err}")))?;

            for object in response.contents() {
                if let Some(key) = object.key() {
                    keys.push((
                        key.to_string(),
                        object.last_modified().map(|t| t.secs()),
                    ));
                }
            }

            match response.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        Ok(keys)
    }

    async fn delete_keys(&self, keys: Vec<String>) -> Result<usize, StateError> {
        let mut deleted = 0;
        for batch in keys.chunks(MAX_DELETE_BATCH) {
            let objects: Vec<ObjectIdentifier> = batch
                .iter()
                .map(|key| {
                    ObjectIdentifier::builder()
                        .key(key)
                        .build()
                        .map_err(|err| StateError::Backend(format!("delete batch: {err}")))
                })
                .collect::<Result<_, _>>()?;

            let delete = Delete::builder()
                .set_objects(Some(objects))
                .build()
                .map_err(|err| StateError::Backend(format!("delete batch: {err}")))?;

            self.client
                .delete_objects()
                .bucket(&self.config.bucket)
                .delete(delete)
                .send()
                .await
                .map_err(|err| StateError::Backend(format!("delete batch: {err}")))?;
            deleted += batch.len();
        }
        Ok(deleted)
    }

    async fn load_all(&self) -> Result<Vec<ExecutionState>, StateError> {
        let prefix = format!("{}/executions/", self.config.prefix);
        let keys = self.list_keys(&prefix).await?;

        let mut executions = Vec::with_capacity(keys.len());
        for (key, _) in keys {
            if let Some(bytes) = self.get_json(&key).await? {
                match serde_json::from_slice(&bytes) {
                    Ok(execution) => executions.push(execution),
                    Err(err) => warn!(key = %key, error = %err, "skipping malformed execution object"),
                }
            }
        }
        executions.sort_by(|a: &ExecutionState, b: &ExecutionState| {
            b.start_time.cmp(&a.start_time)
        });
        Ok(executions)
    }
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn save_execution(&self, execution: &ExecutionState) -> Result<(), StateError> {
        let id = execution.id.to_string();
        let body = serde_json::to_vec_pretty(execution)?;
        let key = self.execution_key(&id);

        if !self.config.locking {
            return self.put_json(&key, body).await;
        }

        self.acquire_lock(&id).await?;
        let result = self.put_json(&key, body).await;
        self.release_lock(&id).await;
        result
    }

    async fn load_execution(&self, id: &str) -> Result<ExecutionState, StateError> {
        // Full ids fetch directly; prefixes fall back to a listing.
        if id.len() == 36 {
            if let Some(bytes) = self.get_json(&self.execution_key(id)).await? {
                return Ok(serde_json::from_slice(&bytes)?);
            }
            return Err(StateError::NotFound(id.to_string()));
        }
        let executions = self.load_all().await?;
        match_execution(&executions, id).cloned()
    }

    async fn list_executions(&self) -> Result<Vec<ExecutionState>, StateError> {
        self.load_all().await
    }

    async fn find_by_workflow(&self, workflow: &str) -> Result<Vec<ExecutionState>, StateError> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .filter(|e| e.workflow_name == workflow)
            .collect())
    }

    async fn get_latest(&self, workflow: &str) -> Result<Option<ExecutionState>, StateError> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .find(|e| e.workflow_name == workflow))
    }

    async fn delete_execution(&self, id: &str) -> Result<(), StateError> {
        let execution = self.load_execution(id).await?;
        self.delete_keys(vec![self.execution_key(&execution.id.to_string())])
            .await?;
        Ok(())
    }

    async fn save_workflow_output(&self, output: &WorkflowOutput) -> Result<(), StateError> {
        let body = serde_json::to_vec_pretty(output)?;
        self.put_json(&self.output_key(&output.workflow_name), body)
            .await
    }

    async fn load_workflow_output(
        &self,
        workflow: &str,
    ) -> Result<Option<WorkflowOutput>, StateError> {
        match self.get_json(&self.output_key(workflow)).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn cleanup(
        &self,
        max_age: Option<Duration>,
        max_count: Option<usize>,
    ) -> Result<usize, StateError> {
        let prefix = format!("{}/executions/", self.config.prefix);
        let mut keys = self.list_keys(&prefix).await?;
        // Newest first by modification time.
        keys.sort_by_key(|(_, modified)| std::cmp::Reverse(modified.unwrap_or(0)));

        let mut doomed: Vec<String> = Vec::new();
        if let Some(age) = max_age {
            let cutoff = Utc::now().timestamp() - age.as_secs() as i64;
            doomed.extend(
                keys.iter()
                    .filter(|(_, modified)| modified.unwrap_or(0) < cutoff)
                    .map(|(key, _)| key.clone()),
            );
        }
        if let Some(count) = max_count {
            doomed.extend(keys.iter().skip(count).map(|(key, _)| key.clone()));
        }
        doomed.sort();
        doomed.dedup();

        if doomed.is_empty() {
            return Ok(0);
        }
        self.delete_keys(doomed).await
    }
}
