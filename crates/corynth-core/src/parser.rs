// Copyright (c) 2025 Corynth Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! HCL workflow parser.
//!
//! Reads `workflow` blocks with nested `variable`, `locals`, `template`,
//! `step`, `output` and `import` blocks into the [`Workflow`] model.
//! Literal HCL expressions become [`Value`]s; traversals, operations and
//! function calls are preserved as expression text for the evaluator
//! (`var.env == "prod"` stays a string and is parsed at evaluation time).

use crate::error::{EngineError, Result};
use crate::value::Value;
use crate::workflow::{
    BackoffStrategy, LoopSpec, OutputSpec, RetrySpec, Step, StepTarget, TemplateSpec,
    ValidationSpec, VariableSpec, VariableType, Workflow, WorkflowDependency, WorkflowTrigger,
};
use hcl::{Attribute, Block, Body, Expression, ObjectKey, TemplateExpr};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Parses workflow definition files.
pub struct WorkflowParser;

impl WorkflowParser {
    /// Parses a file containing one `workflow` block. Files with several
    /// blocks yield the first; `import` and subworkflow paths resolve
    /// relative to the file's directory.
    pub fn parse_file(path: &Path) -> Result<Workflow> {
        let source = std::fs::read_to_string(path).map_err(|err| {
            EngineError::Parse(format!("cannot read '{}': {err}", path.display()))
        })?;
        let dir = path.parent().map(Path::to_path_buf);

        let mut workflows = Self::parse_all(&source, dir.as_deref())?;
        match workflows.len() {
            0 => Err(EngineError::Parse(format!(
                "no workflow block in '{}'",
                path.display()
            ))),
            1 => Ok(workflows.remove(0)),
            n => {
                warn!(
                    file = %path.display(),
                    count = n,
                    "file defines multiple workflows, using the first"
                );
                Ok(workflows.remove(0))
            }
        }
    }

    /// Parses every `workflow` block in the source.
    pub fn parse_all(source: &str, source_dir: Option<&Path>) -> Result<Vec<Workflow>> {
        let body: Body =
            hcl::parse(source).map_err(|err| EngineError::Parse(err.to_string()))?;

        let mut workflows = Vec::new();
        for block in body.blocks() {
            if block.identifier() == "workflow" {
                workflows.push(parse_workflow(block, source_dir)?);
            }
        }
        Ok(workflows)
    }
}

fn parse_workflow(block: &Block, source_dir: Option<&Path>) -> Result<Workflow> {
    let name = single_label(block, "workflow")?;

    let mut workflow = Workflow {
        name,
        description: None,
        version: None,
        variables: HashMap::new(),
        locals: HashMap::new(),
        templates: HashMap::new(),
        steps: Vec::new(),
        outputs: HashMap::new(),
        depends_on_workflows: Vec::new(),
        trigger_workflows: Vec::new(),
        source_dir: source_dir.map(PathBuf::from),
    };

    for attr in block.body().attributes() {
        match attr.key() {
            "description" => workflow.description = Some(expr_to_text(attr.expr())),
            "version" => workflow.version = Some(expr_to_text(attr.expr())),
            "depends_on_workflow" => {
                workflow.depends_on_workflows = parse_dependencies(attr)?;
            }
            "trigger_workflows" => {
                workflow.trigger_workflows = parse_triggers(attr)?;
            }
            other => {
                return Err(EngineError::Parse(format!(
                    "unknown workflow attribute '{other}'"
                )))
            }
        }
    }

    for inner in block.body().blocks() {
        match inner.identifier() {
            "variable" => {
                let var_name = single_label(inner, "variable")?;
                if workflow
                    .variables
                    .insert(var_name.clone(), parse_variable(inner)?)
                    .is_some()
                {
                    return Err(EngineError::Validation(format!(
                        "duplicate variable '{var_name}'"
                    )));
                }
            }
            "locals" => {
                for attr in inner.body().attributes() {
                    workflow
                        .locals
                        .insert(attr.key().to_string(), expr_to_value(attr.expr()));
                }
            }
            "template" => {
                let template_name = single_label(inner, "template")?;
                if workflow
                    .templates
                    .insert(template_name.clone(), parse_template(inner)?)
                    .is_some()
                {
                    return Err(EngineError::Validation(format!(
                        "duplicate template '{template_name}'"
                    )));
                }
            }
            "step" => workflow.steps.push(parse_step(inner)?),
            "output" => {
                let output_name = single_label(inner, "output")?;
                workflow
                    .outputs
                    .insert(output_name, parse_output(inner)?);
            }
            "import" => apply_import(&mut workflow, inner, source_dir)?,
            other => {
                return Err(EngineError::Parse(format!(
                    "unknown block '{other}' in workflow '{}'",
                    workflow.name
                )))
            }
        }
    }

    workflow.validate()?;
    Ok(workflow)
}

fn parse_variable(block: &Block) -> Result<VariableSpec> {
    let mut var_type = None;
    let mut spec = VariableSpec {
        var_type: VariableType::String,
        description: None,
        default: None,
        required: false,
        sensitive: false,
        validation: None,
    };

    for attr in block.body().attributes() {
        match attr.key() {
            "type" => var_type = Some(VariableType::parse(&expr_to_text(attr.expr()))?),
            "description" => spec.description = Some(expr_to_text(attr.expr())),
            "default" => spec.default = Some(expr_to_value(attr.expr())),
            "required" => spec.required = expr_to_bool(attr)?,
            "sensitive" => spec.sensitive = expr_to_bool(attr)?,
            other => {
                return Err(EngineError::Parse(format!(
                    "unknown variable attribute '{other}'"
                )))
            }
        }
    }

    for inner in block.body().blocks() {
        if inner.identifier() != "validation" {
            return Err(EngineError::Parse(format!(
                "unknown block '{}' in variable",
                inner.identifier()
            )));
        }
        let mut condition = None;
        let mut error_message = None;
        for attr in inner.body().attributes() {
            match attr.key() {
                "condition" => condition = Some(expr_to_text(attr.expr())),
                "error_message" => error_message = Some(expr_to_text(attr.expr())),
                other => {
                    return Err(EngineError::Parse(format!(
                        "unknown validation attribute '{other}'"
                    )))
                }
            }
        }
        spec.validation = Some(ValidationSpec {
            condition: condition
                .ok_or_else(|| EngineError::Parse("validation block missing condition".into()))?,
            error_message: error_message.unwrap_or_else(|| "validation failed".to_string()),
        });
    }

    spec.var_type =
        var_type.ok_or_else(|| EngineError::Parse("variable block missing type".into()))?;
    Ok(spec)
}

fn parse_template(block: &Block) -> Result<TemplateSpec> {
    let mut plugin = None;
    let mut action = None;
    let mut defaults = HashMap::new();

    for attr in block.body().attributes() {
        match attr.key() {
            "plugin" => plugin = Some(expr_to_text(attr.expr())),
            "action" => action = Some(expr_to_text(attr.expr())),
            "defaults" => defaults = expr_to_object(attr.expr())?,
            other => {
                return Err(EngineError::Parse(format!(
                    "unknown template attribute '{other}'"
                )))
            }
        }
    }

    Ok(TemplateSpec {
        plugin: plugin.ok_or_else(|| EngineError::Parse("template missing plugin".into()))?,
        action: action.ok_or_else(|| EngineError::Parse("template missing action".into()))?,
        defaults,
    })
}

fn parse_step(block: &Block) -> Result<Step> {
    let name = single_label(block, "step")?;

    let mut plugin = None;
    let mut action = None;
    let mut template = None;
    let mut subworkflow = None;
    let mut step = Step {
        name: name.clone(),
        target: StepTarget::Plugin {
            plugin: String::new(),
            action: String::new(),
        },
        params: HashMap::new(),
        depends_on: Vec::new(),
        condition: None,
        loop_spec: None,
        retry: None,
        timeout: None,
        continue_on_error: false,
    };

    for attr in block.body().attributes() {
        match attr.key() {
            "plugin" => plugin = Some(expr_to_text(attr.expr())),
            "action" => action = Some(expr_to_text(attr.expr())),
            "template" => template = Some(expr_to_text(attr.expr())),
            "subworkflow" => subworkflow = Some(expr_to_text(attr.expr())),
            "params" => step.params = expr_to_object(attr.expr())?,
            "depends_on" => step.depends_on = expr_to_string_list(attr)?,
            "condition" => step.condition = Some(expr_to_text(attr.expr())),
            "timeout" => step.timeout = Some(parse_duration(&expr_to_text(attr.expr()))?),
            other => {
                return Err(EngineError::Parse(format!(
                    "unknown step attribute '{other}' in step '{name}'"
                )))
            }
        }
    }

    for inner in block.body().blocks() {
        match inner.identifier() {
            "loop" => step.loop_spec = Some(parse_loop(inner)?),
            "retry" => step.retry = Some(parse_retry(inner)?),
            "continue_on" => {
                for attr in inner.body().attributes() {
                    match attr.key() {
                        "error" => step.continue_on_error = expr_to_bool(attr)?,
                        other => {
                            return Err(EngineError::Parse(format!(
                                "unknown continue_on attribute '{other}'"
                            )))
                        }
                    }
                }
            }
            other => {
                return Err(EngineError::Parse(format!(
                    "unknown block '{other}' in step '{name}'"
                )))
            }
        }
    }

    step.target = match (plugin, template, subworkflow) {
        (Some(plugin), None, None) => StepTarget::Plugin {
            plugin,
            action: action.ok_or_else(|| {
                EngineError::Validation(format!("step '{name}' has a plugin but no action"))
            })?,
        },
        (None, Some(template), None) => StepTarget::Template { template },
        (None, None, Some(subworkflow)) => StepTarget::Subworkflow { subworkflow },
        (None, None, None) => {
            return Err(EngineError::Validation(format!(
                "step '{name}' needs one of plugin, template or subworkflow"
            )))
        }
        _ => {
            return Err(EngineError::Validation(format!(
                "step '{name}' declares more than one of plugin, template and subworkflow"
            )))
        }
    };

    Ok(step)
}

fn parse_loop(block: &Block) -> Result<LoopSpec> {
    let mut over = None;
    let mut variable = "item".to_string();
    let mut parallel = false;
    let mut max_workers = None;

    for attr in block.body().attributes() {
        match attr.key() {
            "over" => over = Some(expr_to_value(attr.expr())),
            "variable" => variable = expr_to_text(attr.expr()),
            "parallel" => parallel = expr_to_bool(attr)?,
            "max_workers" => max_workers = Some(expr_to_usize(attr)?),
            other => {
                return Err(EngineError::Parse(format!(
                    "unknown loop attribute '{other}'"
                )))
            }
        }
    }

    Ok(LoopSpec {
        over: over.ok_or_else(|| EngineError::Parse("loop block missing 'over'".into()))?,
        variable,
        parallel,
        max_workers,
    })
}

fn parse_retry(block: &Block) -> Result<RetrySpec> {
    let mut max_attempts = 1;
    let mut delay = Duration::from_secs(1);
    let mut backoff = BackoffStrategy::Fixed;

    for attr in block.body().attributes() {
        match attr.key() {
            "max_attempts" => max_attempts = expr_to_usize(attr)? as u32,
            "delay" => delay = parse_duration(&expr_to_text(attr.expr()))?,
            "backoff" => backoff = BackoffStrategy::parse(&expr_to_text(attr.expr()))?,
            other => {
                return Err(EngineError::Parse(format!(
                    "unknown retry attribute '{other}'"
                )))
            }
        }
    }

    Ok(RetrySpec {
        max_attempts,
        delay,
        backoff,
    })
}

fn parse_output(block: &Block) -> Result<OutputSpec> {
    let mut value = None;
    let mut description = None;
    let mut sensitive = false;

    for attr in block.body().attributes() {
        match attr.key() {
            "value" => value = Some(expr_to_value(attr.expr())),
            "description" => description = Some(expr_to_text(attr.expr())),
            "sensitive" => sensitive = expr_to_bool(attr)?,
            other => {
                return Err(EngineError::Parse(format!(
                    "unknown output attribute '{other}'"
                )))
            }
        }
    }

    Ok(OutputSpec {
        value: value.ok_or_else(|| EngineError::Parse("output block missing value".into()))?,
        description,
        sensitive,
    })
}

fn parse_dependencies(attr: &Attribute) -> Result<Vec<WorkflowDependency>> {
    let items = expr_to_value(attr.expr());
    let list = items.try_array().map_err(|_| {
        EngineError::Parse("depends_on_workflow must be a list of objects".into())
    })?;

    let mut deps = Vec::with_capacity(list.len());
    for item in list {
        let obj = item.try_object().map_err(|_| {
            EngineError::Parse("depends_on_workflow entries must be objects".into())
        })?;
        deps.push(WorkflowDependency {
            workflow_file: required_string(obj, "workflow_file", "depends_on_workflow")?,
            required: obj
                .get("required")
                .map(Value::is_truthy)
                .unwrap_or(false),
            import_vars: optional_string_list(obj, "import_vars")?,
            variables: obj
                .get("variables")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        });
    }
    Ok(deps)
}

fn parse_triggers(attr: &Attribute) -> Result<Vec<WorkflowTrigger>> {
    let items = expr_to_value(attr.expr());
    let list = items.try_array().map_err(|_| {
        EngineError::Parse("trigger_workflows must be a list of objects".into())
    })?;

    let mut triggers = Vec::with_capacity(list.len());
    for item in list {
        let obj = item.try_object().map_err(|_| {
            EngineError::Parse("trigger_workflows entries must be objects".into())
        })?;
        triggers.push(WorkflowTrigger {
            workflow_file: required_string(obj, "workflow_file", "trigger_workflows")?,
            on_success: obj
                .get("on_success")
                .map(Value::is_truthy)
                .unwrap_or(false),
            on_failure: obj
                .get("on_failure")
                .map(Value::is_truthy)
                .unwrap_or(false),
            export_vars: optional_string_list(obj, "export_vars")?,
        });
    }
    Ok(triggers)
}

/// Merges variables from an imported file; `variables` overrides replace
/// the imported defaults. The importing workflow's own declarations win.
fn apply_import(workflow: &mut Workflow, block: &Block, source_dir: Option<&Path>) -> Result<()> {
    let mut source = None;
    let mut overrides: HashMap<String, Value> = HashMap::new();

    for attr in block.body().attributes() {
        match attr.key() {
            "source" => source = Some(expr_to_text(attr.expr())),
            "variables" => overrides = expr_to_object(attr.expr())?,
            other => {
                return Err(EngineError::Parse(format!(
                    "unknown import attribute '{other}'"
                )))
            }
        }
    }

    let source =
        source.ok_or_else(|| EngineError::Parse("import block missing source".into()))?;
    let path = match source_dir {
        Some(dir) => dir.join(&source),
        None => PathBuf::from(&source),
    };

    let imported = WorkflowParser::parse_file(&path)?;
    for (name, mut spec) in imported.variables {
        if let Some(value) = overrides.get(&name) {
            spec.default = Some(value.clone());
        }
        workflow.variables.entry(name).or_insert(spec);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Expression conversion
// ---------------------------------------------------------------------------

/// Converts an HCL expression to a model value. Literals convert directly;
/// anything needing evaluation is kept as interpolation text.
fn expr_to_value(expr: &Expression) -> Value {
    match expr {
        Expression::Null => Value::Null,
        Expression::Bool(b) => Value::Bool(*b),
        Expression::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
        Expression::String(s) => Value::String(s.clone()),
        Expression::TemplateExpr(template) => match template.as_ref() {
            TemplateExpr::QuotedString(s) => Value::String(s.clone()),
            TemplateExpr::Heredoc(heredoc) => Value::String(heredoc.template.clone()),
        },
        Expression::Array(items) => Value::Array(items.iter().map(expr_to_value).collect()),
        Expression::Object(entries) => Value::Object(
            entries
                .iter()
                .map(|(key, value)| (object_key(key), expr_to_value(value)))
                .collect(),
        ),
        Expression::Parenthesis(inner) => expr_to_value(inner),
        other => Value::String(format!("${{{other}}}")),
    }
}

/// Converts an HCL expression to expression text for the evaluator.
fn expr_to_text(expr: &Expression) -> String {
    match expr {
        Expression::String(s) => s.clone(),
        Expression::TemplateExpr(template) => match template.as_ref() {
            TemplateExpr::QuotedString(s) => s.clone(),
            TemplateExpr::Heredoc(heredoc) => heredoc.template.clone(),
        },
        other => other.to_string(),
    }
}

fn object_key(key: &ObjectKey) -> String {
    match key {
        ObjectKey::Identifier(ident) => ident.to_string(),
        ObjectKey::Expression(Expression::String(s)) => s.clone(),
        other => other.to_string(),
    }
}

fn expr_to_object(expr: &Expression) -> Result<HashMap<String, Value>> {
    match expr_to_value(expr) {
        Value::Object(entries) => Ok(entries),
        other => Err(EngineError::Parse(format!(
            "expected an object, found {}",
            other.type_name()
        ))),
    }
}

fn expr_to_bool(attr: &Attribute) -> Result<bool> {
    match attr.expr() {
        Expression::Bool(b) => Ok(*b),
        other => Err(EngineError::Parse(format!(
            "attribute '{}' must be a bool, found '{other}'",
            attr.key()
        ))),
    }
}

fn expr_to_usize(attr: &Attribute) -> Result<usize> {
    match attr.expr() {
        Expression::Number(n) => n
            .as_f64()
            .filter(|f| f.fract() == 0.0 && *f >= 0.0)
            .map(|f| f as usize)
            .ok_or_else(|| {
                EngineError::Parse(format!(
                    "attribute '{}' must be a non-negative integer",
                    attr.key()
                ))
            }),
        other => Err(EngineError::Parse(format!(
            "attribute '{}' must be a number, found '{other}'",
            attr.key()
        ))),
    }
}

fn expr_to_string_list(attr: &Attribute) -> Result<Vec<String>> {
    match expr_to_value(attr.expr()) {
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => Err(EngineError::Parse(format!(
                    "attribute '{}' must be a list of strings, found {}",
                    attr.key(),
                    other.type_name()
                ))),
            })
            .collect(),
        other => Err(EngineError::Parse(format!(
            "attribute '{}' must be a list, found {}",
            attr.key(),
            other.type_name()
        ))),
    }
}

fn required_string(
    obj: &HashMap<String, Value>,
    key: &str,
    context: &str,
) -> Result<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            EngineError::Parse(format!("{context} entry missing string '{key}'"))
        })
}

fn optional_string_list(obj: &HashMap<String, Value>, key: &str) -> Result<Vec<String>> {
    match obj.get(key) {
        None => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str().map(str::to_string).ok_or_else(|| {
                    EngineError::Parse(format!("'{key}' must contain only strings"))
                })
            })
            .collect(),
        Some(other) => Err(EngineError::Parse(format!(
            "'{key}' must be a list, found {}",
            other.type_name()
        ))),
    }
}

/// Parses `"100ms"`, `"30s"`, `"5m"`, `"2h"` or bare seconds.
pub fn parse_duration(text: &str) -> Result<Duration> {
    let text = text.trim();
    let err = || EngineError::Parse(format!("invalid duration '{text}'"));

    if let Ok(seconds) = text.parse::<f64>() {
        if seconds < 0.0 {
            return Err(err());
        }
        return Ok(Duration::from_secs_f64(seconds));
    }

    let split = text
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .ok_or_else(err)?;
    let (number, unit) = text.split_at(split);
    let number: f64 = number.parse().map_err(|_| err())?;
    let factor = match unit.trim() {
        "ms" => 0.001,
        "s" => 1.0,
        "m" => 60.0,
        "h" => 3600.0,
        _ => return Err(err()),
    };
    Ok(Duration::from_secs_f64(number * factor))
}

fn single_label(block: &Block, kind: &str) -> Result<String> {
    match block.labels() {
        [label] => Ok(label.as_str().to_string()),
        _ => Err(EngineError::Parse(format!(
            "{kind} block requires exactly one label"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO: &str = r#"
workflow "hello" {
  description = "Hello world"
  version     = "1.0.0"

  variable "name" {
    type    = "string"
    default = "World"
  }

  step "greet" {
    plugin = "shell"
    action = "exec"
    params = {
      command = "echo Hello, ${var.name}"
    }
  }

  output "greeting" {
    value = "${step.greet.stdout}"
  }
}
"#;

    #[test]
    fn test_parse_hello_workflow() {
        let workflows = WorkflowParser::parse_all(HELLO, None).unwrap();
        assert_eq!(workflows.len(), 1);
        let wf = &workflows[0];
        assert_eq!(wf.name, "hello");
        assert_eq!(wf.version.as_deref(), Some("1.0.0"));
        assert_eq!(
            wf.variables["name"].default,
            Some(Value::String("World".into()))
        );

        let step = wf.step("greet").unwrap();
        assert_eq!(
            step.target,
            StepTarget::Plugin {
                plugin: "shell".into(),
                action: "exec".into()
            }
        );
        assert_eq!(
            step.params["command"],
            Value::String("echo Hello, ${var.name}".into())
        );
        assert_eq!(
            wf.outputs["greeting"].value,
            Value::String("${step.greet.stdout}".into())
        );
    }

    #[test]
    fn test_parse_full_step_features() {
        let source = r#"
workflow "full" {
  variable "env" {
    type     = "string"
    required = true
    validation {
      condition     = "contains([\"dev\", \"prod\"], var.env)"
      error_message = "env must be dev or prod"
    }
  }

  locals {
    prefix = "app"
  }

  template "curl" {
    plugin = "http"
    action = "get"
    defaults = {
      method = "GET"
    }
  }

  step "fetch" {
    template   = "curl"
    params     = { url = "https://example.com" }
    condition  = var.env == "prod"
    timeout    = "30s"

    retry {
      max_attempts = 3
      delay        = "100ms"
      backoff      = "exponential"
    }

    continue_on {
      error = true
    }
  }

  step "fanout" {
    plugin     = "shell"
    action     = "exec"
    depends_on = ["fetch"]
    params     = { command = "echo ${loop.value}" }

    loop {
      over        = ["a", "b", "c"]
      variable    = "item"
      parallel    = true
      max_workers = 2
    }
  }
}
"#;
        let wf = WorkflowParser::parse_all(source, None)
            .unwrap()
            .remove(0);

        let fetch = wf.step("fetch").unwrap();
        assert_eq!(
            fetch.target,
            StepTarget::Template {
                template: "curl".into()
            }
        );
        assert_eq!(fetch.timeout, Some(Duration::from_secs(30)));
        assert!(fetch.continue_on_error);
        let retry = fetch.retry.as_ref().unwrap();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.delay, Duration::from_millis(100));
        assert_eq!(retry.backoff, BackoffStrategy::Exponential);

        // The condition survives as evaluable text.
        let condition = fetch.condition.as_deref().unwrap();
        assert!(condition.contains("var.env"));
        assert!(condition.contains("prod"));

        let fanout = wf.step("fanout").unwrap();
        let loop_spec = fanout.loop_spec.as_ref().unwrap();
        assert!(loop_spec.parallel);
        assert_eq!(loop_spec.max_workers, Some(2));
        assert_eq!(
            loop_spec.over,
            Value::Array(vec![
                Value::String("a".into()),
                Value::String("b".into()),
                Value::String("c".into())
            ])
        );

        assert_eq!(wf.locals["prefix"], Value::String("app".into()));
        assert_eq!(wf.templates["curl"].plugin, "http");
        let validation = wf.variables["env"].validation.as_ref().unwrap();
        assert!(validation.condition.contains("var.env"));
    }

    #[test]
    fn test_cross_workflow_references() {
        let source = r#"
workflow "main" {
  depends_on_workflow = [
    {
      workflow_file = "prepare.hcl"
      required      = true
      import_vars   = ["dataset_path", "record_count"]
      variables     = { region = "eu-1" }
    }
  ]

  trigger_workflows = [
    {
      workflow_file = "cleanup.hcl"
      on_success    = true
      export_vars   = ["dataset_path"]
    }
  ]

  step "noop" {
    plugin = "shell"
    action = "exec"
    params = { command = "true" }
  }
}
"#;
        let wf = WorkflowParser::parse_all(source, None)
            .unwrap()
            .remove(0);

        assert_eq!(wf.depends_on_workflows.len(), 1);
        let dep = &wf.depends_on_workflows[0];
        assert!(dep.required);
        assert_eq!(dep.import_vars, vec!["dataset_path", "record_count"]);
        assert_eq!(
            dep.variables.get("region"),
            Some(&Value::String("eu-1".into()))
        );

        assert_eq!(wf.trigger_workflows.len(), 1);
        assert!(wf.trigger_workflows[0].on_success);
        assert!(!wf.trigger_workflows[0].on_failure);
    }

    #[test]
    fn test_conflicting_dispatch_targets() {
        let source = r#"
workflow "bad" {
  step "both" {
    plugin   = "shell"
    action   = "exec"
    template = "curl"
  }
}
"#;
        let err = WorkflowParser::parse_all(source, None).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(err.to_string().contains("more than one"));
    }

    #[test]
    fn test_syntax_error_is_parse_error() {
        let err = WorkflowParser::parse_all("workflow \"x\" {", None).unwrap_err();
        assert!(matches!(err, EngineError::Parse(_)));
    }

    #[test]
    fn test_unknown_variable_type() {
        let source = r#"
workflow "bad" {
  variable "x" {
    type = "tuple"
  }
  step "s" {
    plugin = "shell"
    action = "exec"
  }
}
"#;
        assert!(matches!(
            WorkflowParser::parse_all(source, None),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_import_merges_variables() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("common.hcl"),
            r#"
workflow "common" {
  variable "region" {
    type    = "string"
    default = "us-1"
  }
  variable "zone" {
    type    = "string"
    default = "a"
  }
  step "noop" {
    plugin = "shell"
    action = "exec"
  }
}
"#,
        )
        .unwrap();

        let source = r#"
workflow "importer" {
  import {
    source    = "common.hcl"
    variables = { region = "eu-2" }
  }

  variable "zone" {
    type    = "string"
    default = "b"
  }

  step "noop" {
    plugin = "shell"
    action = "exec"
  }
}
"#;
        let wf = WorkflowParser::parse_all(source, Some(dir.path()))
            .unwrap()
            .remove(0);

        // Imported with override applied.
        assert_eq!(
            wf.variables["region"].default,
            Some(Value::String("eu-2".into()))
        );
        // Own declaration wins over the import.
        assert_eq!(
            wf.variables["zone"].default,
            Some(Value::String("b".into()))
        );
    }

    #[test]
    fn test_parse_duration_forms() {
        assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("-3s").is_err());
    }
}
