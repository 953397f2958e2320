// Copyright (c) 2025 Corynth Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error taxonomy for the orchestration core.

use std::time::Duration;

/// Result alias used throughout the core.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by plugin resolution and invocation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PluginError {
    /// No plugin with this name is registered or installable.
    #[error("plugin '{0}' not found")]
    NotFound(String),

    /// Fetching a plugin repository failed.
    #[error("failed to fetch plugin '{name}': {reason}")]
    FetchFailed { name: String, reason: String },

    /// Building a plugin from source failed.
    #[error("failed to build plugin '{name}': {reason}")]
    BuildFailed { name: String, reason: String },

    /// The plugin process violated the wire protocol.
    #[error("plugin '{name}' protocol error: {reason}")]
    ProtocolError { name: String, reason: String },

    /// The serve handshake line was malformed or missing.
    #[error("plugin '{name}' handshake failed: {reason}")]
    HandshakeFailed { name: String, reason: String },

    /// The plugin did not respond within the deadline.
    #[error("plugin '{name}' timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    /// Required inputs were missing or malformed.
    #[error("plugin '{name}' action '{action}' rejected parameters: {reason}")]
    ValidationFailed {
        name: String,
        action: String,
        reason: String,
    },

    /// The post-install health probe failed.
    #[error("plugin '{name}' failed health check: {reason}")]
    HealthCheckFailed { name: String, reason: String },

    /// Installation failed after all repositories were tried.
    #[error("installation of plugin '{name}' failed: {reason}")]
    InstallFailed { name: String, reason: String },

    /// The plugin reported an application-level error.
    #[error("plugin '{name}' action '{action}' failed: {message}")]
    ActionFailed {
        name: String,
        action: String,
        message: String,
    },
}

/// Errors surfaced by state persistence backends.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying I/O failure.
    #[error("state I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record (de)serialization failure.
    #[error("state serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No execution matches the given id or prefix.
    #[error("execution '{0}' not found")]
    NotFound(String),

    /// An id prefix matched more than one execution.
    #[error("execution id prefix '{0}' is ambiguous")]
    AmbiguousPrefix(String),

    /// The advisory lock is held by another writer.
    #[error("lock not acquired for execution '{0}'")]
    LockNotAcquired(String),

    /// Backend-specific failure (remote store, misconfiguration).
    #[error("state backend error: {0}")]
    Backend(String),
}

/// Top-level error type for workflow parsing, validation and execution.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Workflow source could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// Workflow structure is invalid.
    #[error("validation error: {0}")]
    Validation(String),

    /// The step graph contains a cycle.
    #[error("dependency cycle detected involving step '{0}'")]
    CycleDetected(String),

    /// An expression referenced a value that is not in scope.
    #[error("unresolved reference '{0}'")]
    UnresolvedReference(String),

    /// A value had the wrong type for the requested operation.
    #[error("type mismatch: expected {expected}, found {found}{}", context_suffix(.context))]
    TypeMismatch {
        expected: String,
        found: String,
        context: Option<String>,
    },

    /// A step failed after exhausting its retry policy.
    #[error("step '{step}' failed after {attempts} attempt(s): {message}")]
    StepFailed {
        workflow: String,
        step: String,
        attempts: u32,
        message: String,
        stderr: Option<String>,
    },

    /// A step exceeded its effective timeout.
    #[error("step '{step}' timed out after {timeout:?}")]
    StepTimeout {
        workflow: String,
        step: String,
        timeout: Duration,
    },

    /// The retry policy was exhausted without success.
    #[error("step '{step}' exhausted {attempts} retry attempt(s)")]
    RetryExhausted { step: String, attempts: u32 },

    /// A required dependency workflow failed.
    #[error("dependency workflow '{dependency}' failed: {message}")]
    DependencyFailed {
        workflow: String,
        dependency: String,
        message: String,
    },

    /// The run was cancelled by its caller.
    #[error("execution cancelled")]
    Cancelled,

    /// Plugin subsystem failure.
    #[error(transparent)]
    Plugin(#[from] PluginError),

    /// State persistence failure.
    #[error(transparent)]
    State(#[from] StateError),

    /// Configuration is missing or inconsistent.
    #[error("configuration error: {0}")]
    Config(String),
}

fn context_suffix(context: &Option<String>) -> String {
    match context {
        Some(ctx) => format!(" ({ctx})"),
        None => String::new(),
    }
}

impl EngineError {
    /// Builds a `TypeMismatch` without positional context.
    pub fn type_mismatch(expected: impl Into<String>, found: impl Into<String>) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
            context: None,
        }
    }

    /// Builds a `TypeMismatch` carrying the expression or parameter it arose in.
    pub fn type_mismatch_in(
        expected: impl Into<String>,
        found: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Self::TypeMismatch {
            expected: expected.into(),
            found: found.into(),
            context: Some(context.into()),
        }
    }

    /// True when this error represents cancellation rather than failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
