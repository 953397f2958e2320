// Copyright (c) 2025 Corynth Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! DAG representation of a workflow's step graph.
//!
//! Edges come from explicit `depends_on` declarations plus `step.<name>` /
//! `.Steps.<name>` references found inside step expressions, so a step that
//! consumes another step's output is ordered after it even without a
//! declared dependency.

use crate::error::{EngineError, Result};
use crate::value::Value;
use crate::workflow::{Step, Workflow};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};

/// Immutable step dependency graph.
#[derive(Debug, Clone)]
pub struct WorkflowDag {
    graph: DiGraph<String, ()>,
    nodes: HashMap<String, NodeIndex>,
}

impl WorkflowDag {
    /// Builds the DAG for a workflow, failing with `CycleDetected` when the
    /// combined edge set is cyclic.
    pub fn from_workflow(workflow: &Workflow) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut nodes = HashMap::new();

        for step in &workflow.steps {
            let idx = graph.add_node(step.name.clone());
            nodes.insert(step.name.clone(), idx);
        }

        for step in &workflow.steps {
            let to = nodes[&step.name];
            for dep in step_dependencies(step, &nodes) {
                let from = nodes[&dep];
                if from != to {
                    graph.update_edge(from, to, ());
                }
            }
        }

        // Self-references inside expressions are cycles too.
        for step in &workflow.steps {
            if expression_refs(step).contains(&step.name) {
                return Err(EngineError::CycleDetected(step.name.clone()));
            }
        }

        let dag = Self { graph, nodes };
        dag.execution_order()?;
        Ok(dag)
    }

    /// Topological order of step names. Fails with `CycleDetected`.
    pub fn execution_order(&self) -> Result<Vec<String>> {
        match toposort(&self.graph, None) {
            Ok(order) => Ok(order
                .into_iter()
                .map(|idx| self.graph[idx].clone())
                .collect()),
            Err(cycle) => Err(EngineError::CycleDetected(
                self.graph[cycle.node_id()].clone(),
            )),
        }
    }

    /// Direct dependencies of a step (edges into it).
    pub fn dependencies(&self, name: &str) -> Vec<String> {
        self.neighbors(name, petgraph::Direction::Incoming)
    }

    /// Direct dependents of a step (edges out of it).
    pub fn dependents(&self, name: &str) -> Vec<String> {
        self.neighbors(name, petgraph::Direction::Outgoing)
    }

    /// All transitive dependents of a step.
    pub fn transitive_dependents(&self, name: &str) -> HashSet<String> {
        let mut out = HashSet::new();
        let mut stack = self.dependents(name);
        while let Some(next) = stack.pop() {
            if out.insert(next.clone()) {
                stack.extend(self.dependents(&next));
            }
        }
        out
    }

    fn neighbors(&self, name: &str, dir: petgraph::Direction) -> Vec<String> {
        match self.nodes.get(name) {
            Some(&idx) => self
                .graph
                .neighbors_directed(idx, dir)
                .map(|n| self.graph[n].clone())
                .collect(),
            None => Vec::new(),
        }
    }
}

/// Union of declared and expression-implied dependencies that name real
/// steps. References to unknown names are left for scope resolution to
/// report at run time.
fn step_dependencies(step: &Step, known: &HashMap<String, NodeIndex>) -> HashSet<String> {
    let mut deps: HashSet<String> = step
        .depends_on
        .iter()
        .filter(|dep| known.contains_key(dep.as_str()))
        .cloned()
        .collect();
    for referenced in expression_refs(step) {
        if known.contains_key(&referenced) && referenced != step.name {
            deps.insert(referenced);
        }
    }
    deps
}

fn expression_refs(step: &Step) -> HashSet<String> {
    let mut refs = HashSet::new();
    if let Some(condition) = &step.condition {
        collect_step_refs(condition, &mut refs);
    }
    for value in step.params.values() {
        collect_refs_in_value(value, &mut refs);
    }
    if let Some(loop_spec) = &step.loop_spec {
        collect_refs_in_value(&loop_spec.over, &mut refs);
    }
    refs
}

fn collect_refs_in_value(value: &Value, refs: &mut HashSet<String>) {
    match value {
        Value::String(s) => collect_step_refs(s, refs),
        Value::Array(items) => {
            for item in items {
                collect_refs_in_value(item, refs);
            }
        }
        Value::Object(entries) => {
            for item in entries.values() {
                collect_refs_in_value(item, refs);
            }
        }
        _ => {}
    }
}

/// Scans expression text for `step.<name>` and `.Steps.<name>` references.
fn collect_step_refs(text: &str, refs: &mut HashSet<String>) {
    for marker in ["step.", ".Steps."] {
        let mut rest = text;
        while let Some(pos) = rest.find(marker) {
            // `step.` must start a token, not terminate e.g. `.Steps.`.
            let preceded = pos > 0 && {
                let before = rest.as_bytes()[pos - 1];
                before == b'.' || before.is_ascii_alphanumeric() || before == b'_'
            };
            let after = &rest[pos + marker.len()..];
            if !preceded || marker == ".Steps." {
                let name: String = after
                    .chars()
                    .take_while(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
                    .collect();
                if !name.is_empty() {
                    refs.insert(name);
                }
            }
            rest = &rest[pos + marker.len()..];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::StepTarget;

    fn step(name: &str, deps: &[&str]) -> Step {
        Step {
            name: name.into(),
            target: StepTarget::Plugin {
                plugin: "shell".into(),
                action: "exec".into(),
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
            name: "dag-test".into(),
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

    #[test]
    fn test_execution_order_respects_edges() {
        let wf = workflow(vec![
            step("c", &["b"]),
            step("a", &[]),
            step("b", &["a"]),
        ]);
        let dag = WorkflowDag::from_workflow(&wf).unwrap();
        let order = dag.execution_order().unwrap();
        let pos = |n: &str| order.iter().position(|s| s == n).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
    }

    #[test]
    fn test_cycle_detected() {
        let wf = workflow(vec![
            step("a", &["c"]),
            step("b", &["a"]),
            step("c", &["b"]),
        ]);
        assert!(matches!(
            WorkflowDag::from_workflow(&wf),
            Err(EngineError::CycleDetected(_))
        ));
    }

    #[test]
    fn test_expression_reference_creates_edge() {
        let mut consumer = step("b", &[]);
        consumer.params.insert(
            "url".into(),
            Value::String("${step.a.endpoint}/health".into()),
        );
        let wf = workflow(vec![consumer, step("a", &[])]);
        let dag = WorkflowDag::from_workflow(&wf).unwrap();
        assert_eq!(dag.dependencies("b"), vec!["a".to_string()]);
    }

    #[test]
    fn test_template_form_reference_creates_edge() {
        let mut consumer = step("fanin", &[]);
        consumer.condition = Some("{{ eq .Steps.probe.status \"ok\" }}".into());
        let wf = workflow(vec![consumer, step("probe", &[])]);
        let dag = WorkflowDag::from_workflow(&wf).unwrap();
        assert_eq!(dag.dependencies("fanin"), vec!["probe".to_string()]);
    }

    #[test]
    fn test_transitive_dependents() {
        let wf = workflow(vec![
            step("a", &[]),
            step("b", &["a"]),
            step("c", &["b"]),
            step("d", &["a"]),
        ]);
        let dag = WorkflowDag::from_workflow(&wf).unwrap();
        let downstream = dag.transitive_dependents("a");
        assert_eq!(downstream.len(), 3);
        assert!(downstream.contains("c"));
    }

    #[test]
    fn test_expression_self_reference_is_cycle() {
        let mut looped = step("a", &[]);
        looped
            .params
            .insert("x".into(), Value::String("${step.a.out}".into()));
        let wf = workflow(vec![looped]);
        assert!(matches!(
            WorkflowDag::from_workflow(&wf),
            Err(EngineError::CycleDetected(_))
        ));
    }

    #[test]
    fn test_random_graph_acyclicity_property() {
        // Deterministic pseudo-random graphs: forward-only edges are always
        // acyclic; adding one back edge always creates a cycle.
        let mut seed = 0x2545f49u64;
        let mut next = move || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (seed >> 33) as usize
        };

        for n in 3..10 {
            let names: Vec<String> = (0..n).map(|i| format!("s{i}")).collect();
            let mut steps: Vec<Step> = Vec::new();
            for (i, name) in names.iter().enumerate() {
                let mut deps = Vec::new();
                for j in 0..i {
                    if next() % 3 == 0 {
                        deps.push(names[j].as_str());
                    }
                }
                steps.push(step(name, &deps));
            }
            let wf = workflow(steps.clone());
            assert!(WorkflowDag::from_workflow(&wf).is_ok(), "forward graph n={n}");

            // Back edge from the first to the last step's dependency list.
            let last = names[n - 1].clone();
            steps[0].depends_on.push(last);
            // Only cyclic if step 0 is reachable from the last step; force it.
            if !steps[n - 1].depends_on.iter().any(|d| d == "s0") {
                steps[n - 1].depends_on.push("s0".into());
            }
            let wf = workflow(steps);
            assert!(
                matches!(WorkflowDag::from_workflow(&wf), Err(EngineError::CycleDetected(_))),
                "back edge graph n={n}"
            );
        }
    }
}
