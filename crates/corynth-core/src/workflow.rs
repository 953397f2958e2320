// Copyright (c) 2025 Corynth Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Workflow definition model.
//!
//! A [`Workflow`] is produced by the parser and immutable thereafter.
//! [`Workflow::validate`] enforces the structural invariants the scheduler
//! relies on: unique step names, known dependency targets, exactly one
//! dispatch target per step, and an acyclic step graph.

use crate::dag::WorkflowDag;
use crate::error::{EngineError, Result};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

/// Declared type of a workflow variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    String,
    Number,
    Bool,
    List,
    Map,
}

impl VariableType {
    /// Parses the type name used in workflow files.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "string" => Ok(Self::String),
            "number" => Ok(Self::Number),
            "bool" => Ok(Self::Bool),
            "list" => Ok(Self::List),
            "map" => Ok(Self::Map),
            other => Err(EngineError::Validation(format!(
                "unknown variable type '{other}'"
            ))),
        }
    }

    /// Checks a bound value against the declared type.
    pub fn check(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (Self::String, Value::String(_))
                | (Self::Number, Value::Number(_))
                | (Self::Bool, Value::Bool(_))
                | (Self::List, Value::Array(_))
                | (Self::Map, Value::Object(_))
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Bool => "bool",
            Self::List => "list",
            Self::Map => "map",
        }
    }
}

/// Custom validation attached to a variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationSpec {
    /// Boolean expression evaluated with the candidate value bound.
    pub condition: String,
    /// Message reported when the condition is false.
    pub error_message: String,
}

/// A declared workflow variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableSpec {
    #[serde(rename = "type")]
    pub var_type: VariableType,
    pub description: Option<String>,
    pub default: Option<Value>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub sensitive: bool,
    pub validation: Option<ValidationSpec>,
}

/// A pre-bound partial plugin call reusable by steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSpec {
    pub plugin: String,
    pub action: String,
    #[serde(default)]
    pub defaults: HashMap<String, Value>,
}

/// What a step dispatches to. Exactly one per step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepTarget {
    /// Invoke `action` on `plugin`.
    Plugin { plugin: String, action: String },
    /// Expand a named template declared in the same workflow.
    Template { template: String },
    /// Run another workflow file as a nested execution.
    Subworkflow { subworkflow: String },
}

/// Backoff strategy between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    Exponential,
}

impl BackoffStrategy {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "fixed" => Ok(Self::Fixed),
            "linear" => Ok(Self::Linear),
            "exponential" => Ok(Self::Exponential),
            other => Err(EngineError::Validation(format!(
                "unknown backoff strategy '{other}'"
            ))),
        }
    }
}

/// Per-step retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySpec {
    pub max_attempts: u32,
    pub delay: Duration,
    pub backoff: BackoffStrategy,
}

/// Loop expansion over a sequence or map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopSpec {
    /// Expression yielding an array or object to iterate.
    pub over: Value,
    /// Name the iteration value is bound to (informational; the scope
    /// always exposes `loop.value` / `loop.key` / `loop.index`).
    pub variable: String,
    #[serde(default)]
    pub parallel: bool,
    pub max_workers: Option<usize>,
}

/// One step of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub target: StepTarget,
    #[serde(default)]
    pub params: HashMap<String, Value>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub condition: Option<String>,
    #[serde(rename = "loop")]
    pub loop_spec: Option<LoopSpec>,
    pub retry: Option<RetrySpec>,
    pub timeout: Option<Duration>,
    /// When true, failure does not cancel dependents.
    #[serde(default)]
    pub continue_on_error: bool,
}

/// A named output exposed to other workflows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSpec {
    /// Expression evaluated in the post-run scope.
    pub value: Value,
    pub description: Option<String>,
    #[serde(default)]
    pub sensitive: bool,
}

/// Reference to a workflow that must run (or have run) before this one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDependency {
    pub workflow_file: String,
    #[serde(default)]
    pub required: bool,
    /// Output names imported into this workflow's variable bindings.
    #[serde(default)]
    pub import_vars: Vec<String>,
    /// Variables passed through to the dependency run.
    #[serde(default)]
    pub variables: HashMap<String, Value>,
}

/// Reference to a workflow fired after this one completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTrigger {
    pub workflow_file: String,
    #[serde(default)]
    pub on_success: bool,
    #[serde(default)]
    pub on_failure: bool,
    /// Output names exported as the trigger's input variables.
    #[serde(default)]
    pub export_vars: Vec<String>,
}

/// A parsed, validated workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    pub description: Option<String>,
    pub version: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, VariableSpec>,
    #[serde(default)]
    pub locals: HashMap<String, Value>,
    #[serde(default)]
    pub templates: HashMap<String, TemplateSpec>,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub outputs: HashMap<String, OutputSpec>,
    #[serde(default)]
    pub depends_on_workflows: Vec<WorkflowDependency>,
    #[serde(default)]
    pub trigger_workflows: Vec<WorkflowTrigger>,
    /// Directory the workflow file was read from; resolves subworkflow and
    /// import paths.
    pub source_dir: Option<PathBuf>,
}

impl Workflow {
    /// Validates structural invariants. Called by the parser before the
    /// workflow is handed to the engine.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(EngineError::Validation("workflow name is empty".into()));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.name.is_empty() {
                return Err(EngineError::Validation(format!(
                    "workflow '{}' contains a step without a name",
                    self.name
                )));
            }
            if !seen.insert(step.name.as_str()) {
                return Err(EngineError::Validation(format!(
                    "duplicate step name '{}'",
                    step.name
                )));
            }
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(EngineError::Validation(format!(
                        "step '{}' depends on unknown step '{}'",
                        step.name, dep
                    )));
                }
                if dep == &step.name {
                    return Err(EngineError::CycleDetected(step.name.clone()));
                }
            }

            if let StepTarget::Template { template } = &step.target {
                if !self.templates.contains_key(template) {
                    return Err(EngineError::Validation(format!(
                        "step '{}' references unknown template '{}'",
                        step.name, template
                    )));
                }
            }

            if let Some(retry) = &step.retry {
                if retry.max_attempts == 0 {
                    return Err(EngineError::Validation(format!(
                        "step '{}': retry.max_attempts must be at least 1",
                        step.name
                    )));
                }
            }

            if let Some(loop_spec) = &step.loop_spec {
                if loop_spec.variable.is_empty() {
                    return Err(EngineError::Validation(format!(
                        "step '{}': loop.variable is empty",
                        step.name
                    )));
                }
                if loop_spec.max_workers == Some(0) {
                    return Err(EngineError::Validation(format!(
                        "step '{}': loop.max_workers must be at least 1",
                        step.name
                    )));
                }
            }
        }

        for trigger in &self.trigger_workflows {
            if !trigger.on_success && !trigger.on_failure {
                return Err(EngineError::Validation(format!(
                    "trigger '{}' fires on neither success nor failure",
                    trigger.workflow_file
                )));
            }
        }

        // Cycle check over depends_on plus step references inside expressions.
        WorkflowDag::from_workflow(self)?;

        Ok(())
    }

    /// Finds a step by name.
    pub fn step(&self, name: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Names of variables marked sensitive, used for output redaction.
    pub fn sensitive_variables(&self) -> HashSet<&str> {
        self.variables
            .iter()
            .filter(|(_, spec)| spec.sensitive)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}
