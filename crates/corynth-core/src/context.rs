// Copyright (c) 2025 Corynth Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Shared execution context and evaluation scopes.
//!
//! An [`ExecutionContext`] is shared by all worker tasks of a run; it
//! accumulates step outputs as they complete. A [`Scope`] is an immutable
//! snapshot handed to the expression evaluator, optionally overlaid with
//! loop bindings for a single iteration.

use crate::error::{EngineError, Result};
use crate::value::Value;
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Loop locals visible inside one loop iteration.
#[derive(Debug, Clone)]
pub struct LoopBinding {
    pub value: Value,
    pub key: Value,
    pub index: usize,
}

/// Mutable, thread-safe state of a single workflow run.
#[derive(Debug, Default)]
pub struct ExecutionContext {
    variables: HashMap<String, Value>,
    locals: parking_lot::RwLock<HashMap<String, Value>>,
    step_outputs: DashMap<String, HashMap<String, Value>>,
    skipped_steps: DashMap<String, ()>,
}

impl ExecutionContext {
    pub fn new(variables: HashMap<String, Value>) -> Self {
        Self {
            variables,
            locals: parking_lot::RwLock::new(HashMap::new()),
            step_outputs: DashMap::new(),
            skipped_steps: DashMap::new(),
        }
    }

    pub fn variables(&self) -> &HashMap<String, Value> {
        &self.variables
    }

    /// Stores an evaluated local. Locals are written once by the engine
    /// before any step runs.
    pub fn set_local(&self, name: impl Into<String>, value: Value) {
        self.locals.write().insert(name.into(), value);
    }

    /// Publishes a completed step's outputs, making them visible to
    /// dependent steps' scopes.
    pub fn record_outputs(&self, step: impl Into<String>, outputs: HashMap<String, Value>) {
        self.step_outputs.insert(step.into(), outputs);
    }

    /// Marks a step skipped; references to its outputs become unresolved.
    pub fn mark_skipped(&self, step: impl Into<String>) {
        self.skipped_steps.insert(step.into(), ());
    }

    /// Outputs of a completed step, if any.
    pub fn outputs_of(&self, step: &str) -> Option<HashMap<String, Value>> {
        self.step_outputs.get(step).map(|entry| entry.clone())
    }

    /// Immutable snapshot for expression evaluation.
    pub fn scope(&self) -> Scope {
        Scope {
            variables: self.variables.clone(),
            locals: self.locals.read().clone(),
            steps: self
                .step_outputs
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
            skipped: self
                .skipped_steps
                .iter()
                .map(|entry| entry.key().clone())
                .collect(),
            loop_binding: None,
        }
    }
}

/// Immutable view of the values visible to expression evaluation.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    pub variables: HashMap<String, Value>,
    pub locals: HashMap<String, Value>,
    pub steps: HashMap<String, HashMap<String, Value>>,
    pub skipped: HashSet<String>,
    pub loop_binding: Option<Arc<LoopBinding>>,
}

impl Scope {
    /// A scope holding only variables; used by the engine for variable
    /// validation expressions.
    pub fn of_variables(variables: HashMap<String, Value>) -> Self {
        Self {
            variables,
            ..Default::default()
        }
    }

    /// Derives a scope with loop locals bound for one iteration.
    pub fn with_loop(&self, binding: LoopBinding) -> Self {
        let mut scope = self.clone();
        scope.loop_binding = Some(Arc::new(binding));
        scope
    }

    /// Resolves a dotted reference path. The first segment selects the
    /// namespace (`var`, `local`, `step`, `loop`); the rest walk into it.
    pub fn resolve(&self, path: &[&str]) -> Result<Value> {
        let dotted = path.join(".");
        let unresolved = || EngineError::UnresolvedReference(dotted.clone());

        match path {
            ["var", name, rest @ ..] => {
                let value = self.variables.get(*name).ok_or_else(unresolved)?;
                walk(value, rest, &dotted)
            }
            ["local", name, rest @ ..] => {
                let value = self.locals.get(*name).ok_or_else(unresolved)?;
                walk(value, rest, &dotted)
            }
            ["step", name, rest @ ..] => {
                if self.skipped.contains(*name) {
                    return Err(unresolved());
                }
                let outputs = self.steps.get(*name).ok_or_else(unresolved)?;
                match rest {
                    [] => Ok(Value::Object(outputs.clone())),
                    [output, deeper @ ..] => {
                        let value = outputs.get(*output).ok_or_else(unresolved)?;
                        walk(value, deeper, &dotted)
                    }
                }
            }
            ["loop", field] => {
                let binding = self.loop_binding.as_ref().ok_or_else(unresolved)?;
                match *field {
                    "value" => Ok(binding.value.clone()),
                    "key" => Ok(binding.key.clone()),
                    "index" => Ok(Value::Number(binding.index as f64)),
                    _ => Err(unresolved()),
                }
            }
            _ => Err(unresolved()),
        }
    }
}

fn walk(value: &Value, path: &[&str], dotted: &str) -> Result<Value> {
    let mut current = value;
    for segment in path {
        current = current
            .get(segment)
            .ok_or_else(|| EngineError::UnresolvedReference(dotted.to_string()))?;
    }
    Ok(current.clone())
}
