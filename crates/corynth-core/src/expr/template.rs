// Copyright (c) 2025 Corynth Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Go-template-like expression surface: `{{ .Variables.x }}`,
//! `{{ eq A B }}`, `{{ if C }}T{{ else }}F{{ end }}`.

use super::func::{compare, CmpOp};
use crate::context::Scope;
use crate::error::{EngineError, Result};
use crate::value::Value;

/// Evaluates a template-form expression. A template that is exactly one
/// action yields that action's typed value; mixed text and actions yield a
/// concatenated string.
pub fn evaluate(input: &str, scope: &Scope) -> Result<Value> {
    let segments = split_segments(input)?;
    let nodes = parse_nodes(&mut segments.into_iter().peekable(), false)?;

    // Single bare action: preserve the value's type.
    if let [Node::Expr(term)] = nodes.as_slice() {
        return eval_term(term, scope);
    }

    let mut out = String::new();
    render(&nodes, scope, &mut out)?;
    Ok(Value::String(out))
}

#[derive(Debug, Clone)]
enum Segment {
    Text(String),
    Action(String),
}

#[derive(Debug, Clone)]
enum Node {
    Text(String),
    Expr(Term),
    If {
        condition: Term,
        then_branch: Vec<Node>,
        else_branch: Vec<Node>,
    },
}

#[derive(Debug, Clone)]
enum Term {
    Path(Vec<String>),
    Literal(Value),
    Call(String, Vec<Term>),
}

fn split_segments(input: &str) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut rest = input;

    while let Some(open) = rest.find("{{") {
        if open > 0 {
            segments.push(Segment::Text(rest[..open].to_string()));
        }
        let after = &rest[open + 2..];
        let close = after
            .find("}}")
            .ok_or_else(|| EngineError::Parse(format!("unclosed '{{{{' in '{input}'")))?;
        segments.push(Segment::Action(after[..close].trim().to_string()));
        rest = &after[close + 2..];
    }
    if !rest.is_empty() {
        segments.push(Segment::Text(rest.to_string()));
    }

    Ok(segments)
}

fn parse_nodes(
    segments: &mut std::iter::Peekable<std::vec::IntoIter<Segment>>,
    in_branch: bool,
) -> Result<Vec<Node>> {
    let mut nodes = Vec::new();

    while let Some(segment) = segments.peek() {
        match segment {
            Segment::Text(text) => {
                nodes.push(Node::Text(text.clone()));
                segments.next();
            }
            Segment::Action(action) => {
                if action == "end" || action == "else" {
                    if !in_branch {
                        return Err(EngineError::Parse(format!(
                            "'{action}' outside of an if block"
                        )));
                    }
                    return Ok(nodes);
                }

                if let Some(condition_text) = action.strip_prefix("if ") {
                    let condition = parse_action(condition_text.trim())?;
                    segments.next();

                    let then_branch = parse_nodes(segments, true)?;
                    let mut else_branch = Vec::new();
                    match segments.next() {
                        Some(Segment::Action(a)) if a == "else" => {
                            else_branch = parse_nodes(segments, true)?;
                            match segments.next() {
                                Some(Segment::Action(a)) if a == "end" => {}
                                _ => {
                                    return Err(EngineError::Parse(
                                        "if block missing 'end'".into(),
                                    ))
                                }
                            }
                        }
                        Some(Segment::Action(a)) if a == "end" => {}
                        _ => return Err(EngineError::Parse("if block missing 'end'".into())),
                    }

                    nodes.push(Node::If {
                        condition,
                        then_branch,
                        else_branch,
                    });
                } else {
                    nodes.push(Node::Expr(parse_action(action)?));
                    segments.next();
                }
            }
        }
    }

    if in_branch {
        return Err(EngineError::Parse("if block missing 'end'".into()));
    }
    Ok(nodes)
}

/// Parses one action body: a single term, or `func arg1 arg2 ...`.
fn parse_action(action: &str) -> Result<Term> {
    let mut terms = Vec::new();
    let mut rest = action;
    while !rest.trim_start().is_empty() {
        let (term, remainder) = parse_term(rest.trim_start())?;
        terms.push(term);
        rest = remainder;
    }

    match terms.len() {
        0 => Err(EngineError::Parse("empty template action".into())),
        1 => Ok(terms.remove(0)),
        _ => match terms.remove(0) {
            Term::Call(name, existing) if existing.is_empty() => Ok(Term::Call(name, terms)),
            _ => Err(EngineError::Parse(format!(
                "malformed template action '{action}'"
            ))),
        },
    }
}

fn parse_term(input: &str) -> Result<(Term, &str)> {
    let mut chars = input.char_indices();
    let (_, first) = chars
        .next()
        .ok_or_else(|| EngineError::Parse("empty template term".into()))?;

    match first {
        '(' => {
            // Parenthesized sub-call, e.g. (eq .Variables.a "x").
            let mut depth = 1usize;
            for (idx, c) in chars {
                match c {
                    '(' => depth += 1,
                    ')' => {
                        depth -= 1;
                        if depth == 0 {
                            let inner = parse_action(input[1..idx].trim())?;
                            return Ok((inner, &input[idx + 1..]));
                        }
                    }
                    _ => {}
                }
            }
            Err(EngineError::Parse("unbalanced '(' in template".into()))
        }
        '"' => {
            let mut text = String::new();
            let mut escaped = false;
            for (idx, c) in chars {
                if escaped {
                    text.push(match c {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    });
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    return Ok((Term::Literal(Value::String(text)), &input[idx + 1..]));
                } else {
                    text.push(c);
                }
            }
            Err(EngineError::Parse("unterminated string in template".into()))
        }
        '.' => {
            let end = input[1..]
                .find(|c: char| c.is_whitespace() || c == ')' || c == '(')
                .map(|offset| offset + 1)
                .unwrap_or(input.len());
            let path: Vec<String> = input[1..end]
                .split('.')
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
                .collect();
            if path.is_empty() {
                return Err(EngineError::Parse("bare '.' in template".into()));
            }
            Ok((Term::Path(path), &input[end..]))
        }
        _ => {
            let end = input
                .find(|c: char| c.is_whitespace() || c == ')' || c == '(')
                .unwrap_or(input.len());
            let word = &input[..end];
            let term = if let Ok(number) = word.parse::<f64>() {
                Term::Literal(Value::Number(number))
            } else {
                match word {
                    "true" => Term::Literal(Value::Bool(true)),
                    "false" => Term::Literal(Value::Bool(false)),
                    "null" => Term::Literal(Value::Null),
                    name => Term::Call(name.to_string(), Vec::new()),
                }
            };
            Ok((term, &input[end..]))
        }
    }
}

fn render(nodes: &[Node], scope: &Scope, out: &mut String) -> Result<()> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Expr(term) => {
                let value = eval_term(term, scope)?;
                out.push_str(&value.to_string());
            }
            Node::If {
                condition,
                then_branch,
                else_branch,
            } => {
                if eval_term(condition, scope)?.is_truthy() {
                    render(then_branch, scope, out)?;
                } else {
                    render(else_branch, scope, out)?;
                }
            }
        }
    }
    Ok(())
}

fn eval_term(term: &Term, scope: &Scope) -> Result<Value> {
    match term {
        Term::Literal(value) => Ok(value.clone()),
        Term::Path(path) => resolve_template_path(path, scope),
        Term::Call(name, args) => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval_term(arg, scope)?);
            }
            call(name, &values)
        }
    }
}

/// Maps template roots (`Variables`, `Steps`, `Locals`, `Loop`) onto the
/// scope's namespaces.
fn resolve_template_path(path: &[String], scope: &Scope) -> Result<Value> {
    let root = match path.first().map(String::as_str) {
        Some("Variables") => "var",
        Some("Steps") => "step",
        Some("Locals") => "local",
        Some("Loop") => "loop",
        _ => {
            return Err(EngineError::UnresolvedReference(format!(
                ".{}",
                path.join(".")
            )))
        }
    };

    let mut mapped: Vec<&str> = vec![root];
    if root == "loop" {
        // .Loop.Value / .Loop.Key / .Loop.Index use lowercase scope fields.
        for segment in &path[1..] {
            mapped.push(match segment.as_str() {
                "Value" => "value",
                "Key" => "key",
                "Index" => "index",
                other => other,
            });
        }
    } else {
        mapped.extend(path[1..].iter().map(String::as_str));
    }
    scope.resolve(&mapped)
}

fn call(name: &str, args: &[Value]) -> Result<Value> {
    let binary = |args: &[Value]| -> Result<(Value, Value)> {
        if args.len() != 2 {
            return Err(EngineError::Parse(format!(
                "template function '{name}' expects 2 arguments, got {}",
                args.len()
            )));
        }
        Ok((args[0].clone(), args[1].clone()))
    };

    match name {
        "eq" => {
            let (a, b) = binary(args)?;
            compare(CmpOp::Eq, &a, &b)
        }
        "ne" => {
            let (a, b) = binary(args)?;
            compare(CmpOp::Ne, &a, &b)
        }
        "lt" => {
            let (a, b) = binary(args)?;
            compare(CmpOp::Lt, &a, &b)
        }
        "gt" => {
            let (a, b) = binary(args)?;
            compare(CmpOp::Gt, &a, &b)
        }
        "le" => {
            let (a, b) = binary(args)?;
            compare(CmpOp::Le, &a, &b)
        }
        "ge" => {
            let (a, b) = binary(args)?;
            compare(CmpOp::Ge, &a, &b)
        }
        "and" => Ok(Value::Bool(args.iter().all(Value::is_truthy))),
        "or" => Ok(Value::Bool(args.iter().any(Value::is_truthy))),
        "not" => {
            if args.len() != 1 {
                return Err(EngineError::Parse(
                    "template function 'not' expects 1 argument".into(),
                ));
            }
            Ok(Value::Bool(!args[0].is_truthy()))
        }
        other => Err(EngineError::Parse(format!(
            "unknown template function '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn scope() -> Scope {
        let mut variables = HashMap::new();
        variables.insert("env".to_string(), Value::String("prod".into()));
        variables.insert("replicas".to_string(), Value::Number(2.0));
        let mut scope = Scope::of_variables(variables);
        scope.steps.insert(
            "build".to_string(),
            HashMap::from([("image".to_string(), Value::String("app:v3".into()))]),
        );
        scope
    }

    #[test]
    fn test_bare_path_preserves_type() {
        let value = evaluate("{{ .Variables.replicas }}", &scope()).unwrap();
        assert_eq!(value, Value::Number(2.0));
    }

    #[test]
    fn test_step_output_path() {
        let value = evaluate("{{ .Steps.build.image }}", &scope()).unwrap();
        assert_eq!(value, Value::String("app:v3".into()));
    }

    #[test]
    fn test_eq_and_nested_calls() {
        assert_eq!(
            evaluate("{{ eq .Variables.env \"prod\" }}", &scope()).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            evaluate(
                "{{ and (eq .Variables.env \"prod\") (gt .Variables.replicas 1) }}",
                &scope()
            )
            .unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            evaluate("{{ not (eq .Variables.env \"dev\") }}", &scope()).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_if_else_end() {
        let value = evaluate(
            "{{ if eq .Variables.env \"prod\" }}live{{ else }}staging{{ end }}",
            &scope(),
        )
        .unwrap();
        assert_eq!(value, Value::String("live".into()));

        let value = evaluate(
            "{{ if eq .Variables.env \"dev\" }}live{{ else }}staging{{ end }}",
            &scope(),
        )
        .unwrap();
        assert_eq!(value, Value::String("staging".into()));
    }

    #[test]
    fn test_mixed_text_renders_string() {
        let value = evaluate("deploying {{ .Steps.build.image }} now", &scope()).unwrap();
        assert_eq!(value, Value::String("deploying app:v3 now".into()));
    }

    #[test]
    fn test_unresolved_path() {
        assert!(matches!(
            evaluate("{{ .Steps.missing.out }}", &scope()),
            Err(EngineError::UnresolvedReference(_))
        ));
        assert!(matches!(
            evaluate("{{ .Bogus.x }}", &scope()),
            Err(EngineError::UnresolvedReference(_))
        ));
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            evaluate("{{ if true }}never closed", &scope()),
            Err(EngineError::Parse(_))
        ));
        assert!(matches!(
            evaluate("{{ else }}", &scope()),
            Err(EngineError::Parse(_))
        ));
        assert!(matches!(
            evaluate("text {{ unclosed", &scope()),
            Err(EngineError::Parse(_))
        ));
    }
}
