// Copyright (c) 2025 Corynth Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Expression evaluation.
//!
//! Two surface syntaxes are accepted, routed by inspection:
//!
//! - template form, anything containing `{{ ... }}`:
//!   `{{ .Variables.x }}`, `{{ if C }}T{{ else }}F{{ end }}`;
//! - function-call form, everything else:
//!   `var.x == "y"`, `and(var.a, equal(var.e, "p"))`.
//!
//! `${...}` interpolations embed function-call form inside strings; a string
//! that is exactly one interpolation evaluates to the typed value instead of
//! rendering through text. Evaluation is pure and deterministic for a given
//! scope.

mod func;
mod template;

pub use crate::context::{LoopBinding, Scope};

use crate::error::{EngineError, Result};
use crate::value::Value;
use std::collections::HashMap;

/// Evaluates an expression string against a scope.
pub fn evaluate(expr: &str, scope: &Scope) -> Result<Value> {
    let trimmed = expr.trim();
    if trimmed.contains("{{") {
        return template::evaluate(trimmed, scope);
    }
    if let Some(inner) = whole_interpolation(trimmed) {
        return func::evaluate(inner, scope);
    }
    if trimmed.contains("${") {
        return interpolate(trimmed, scope).map(Value::String);
    }
    func::evaluate(trimmed, scope)
}

/// Evaluates a boolean condition. Booleans pass through; the strings
/// `"true"` / `"false"` coerce case-insensitively; anything else is a
/// `TypeMismatch`.
pub fn evaluate_condition(expr: &str, scope: &Scope) -> Result<bool> {
    evaluate(expr, scope)?.try_bool()
}

/// Renders `${...}` interpolations inside a string. `$${` escapes a literal
/// `${`.
pub fn interpolate(text: &str, scope: &Scope) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    loop {
        match find_interpolation(rest) {
            None => {
                out.push_str(&unescape(rest));
                return Ok(out);
            }
            Some((start, inner_end)) => {
                out.push_str(&unescape(&rest[..start]));
                let inner = &rest[start + 2..inner_end];
                let value = func::evaluate(inner, scope)?;
                out.push_str(&value.to_string());
                rest = &rest[inner_end + 1..];
            }
        }
    }
}

/// Expands a parameter value: strings run through interpolation (typed when
/// the string is exactly one `${...}`), template form is evaluated, and
/// collections recurse. Plain literals pass through untouched.
pub fn expand_value(value: &Value, scope: &Scope) -> Result<Value> {
    match value {
        Value::String(text) => {
            if text.contains("{{") {
                template::evaluate(text, scope)
            } else if let Some(inner) = whole_interpolation(text.trim()) {
                func::evaluate(inner, scope)
            } else if text.contains("${") {
                interpolate(text, scope).map(Value::String)
            } else {
                Ok(value.clone())
            }
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(expand_value(item, scope)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(entries) => {
            let mut out = HashMap::with_capacity(entries.len());
            for (key, item) in entries {
                out.insert(key.clone(), expand_value(item, scope)?);
            }
            Ok(Value::Object(out))
        }
        _ => Ok(value.clone()),
    }
}

/// Expands a whole parameter map.
pub fn expand_params(
    params: &HashMap<String, Value>,
    scope: &Scope,
) -> Result<HashMap<String, Value>> {
    let mut out = HashMap::with_capacity(params.len());
    for (name, value) in params {
        let expanded = expand_value(value, scope).map_err(|err| annotate_param(err, name))?;
        out.insert(name.clone(), expanded);
    }
    Ok(out)
}

fn annotate_param(err: EngineError, param: &str) -> EngineError {
    match err {
        EngineError::TypeMismatch {
            expected,
            found,
            context: None,
        } => EngineError::TypeMismatch {
            expected,
            found,
            context: Some(format!("parameter '{param}'")),
        },
        other => other,
    }
}

/// When `text` is exactly one `${...}` interpolation, returns the inner
/// expression.
fn whole_interpolation(text: &str) -> Option<&str> {
    let (start, inner_end) = find_interpolation(text)?;
    if start == 0 && inner_end + 1 == text.len() {
        Some(&text[2..inner_end])
    } else {
        None
    }
}

/// Finds the next unescaped `${`, returning (start of `${`, index of the
/// matching `}`). Brace depth tracking skips braces inside quoted strings.
fn find_interpolation(text: &str) -> Option<(usize, usize)> {
    let bytes = text.as_bytes();
    let mut i = 0;

    while i + 1 < bytes.len() {
        if bytes[i] == b'$' && bytes[i + 1] == b'{' {
            // `$${` is an escaped literal.
            if i > 0 && bytes[i - 1] == b'$' {
                i += 2;
                continue;
            }
            let mut depth = 1usize;
            let mut j = i + 2;
            let mut quote: Option<u8> = None;
            while j < bytes.len() {
                let c = bytes[j];
                match quote {
                    Some(q) => {
                        if c == b'\\' {
                            j += 1;
                        } else if c == q {
                            quote = None;
                        }
                    }
                    None => match c {
                        b'"' | b'\'' => quote = Some(c),
                        b'{' => depth += 1,
                        b'}' => {
                            depth -= 1;
                            if depth == 0 {
                                return Some((i, j));
                            }
                        }
                        _ => {}
                    },
                }
                j += 1;
            }
            return None; // unbalanced; treated as literal text
        }
        i += 1;
    }
    None
}

fn unescape(text: &str) -> String {
    text.replace("$${", "${")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> Scope {
        let mut variables = HashMap::new();
        variables.insert("name".to_string(), Value::String("World".into()));
        variables.insert("count".to_string(), Value::Number(3.0));
        variables.insert(
            "items".to_string(),
            Value::Array(vec![Value::String("a".into()), Value::String("b".into())]),
        );
        Scope::of_variables(variables)
    }

    #[test]
    fn test_interpolation_in_text() {
        let rendered = interpolate("echo Hello, ${var.name}", &scope()).unwrap();
        assert_eq!(rendered, "echo Hello, World");
    }

    #[test]
    fn test_whole_interpolation_keeps_type() {
        let value = evaluate("${var.items}", &scope()).unwrap();
        assert!(matches!(value, Value::Array(_)));

        let value = evaluate("${var.count}", &scope()).unwrap();
        assert_eq!(value, Value::Number(3.0));
    }

    #[test]
    fn test_escaped_interpolation() {
        let rendered = interpolate("cost is $${var.count} dollars", &scope()).unwrap();
        assert_eq!(rendered, "cost is ${var.count} dollars");
    }

    #[test]
    fn test_surface_routing() {
        // Template form.
        assert_eq!(
            evaluate("{{ eq .Variables.name \"World\" }}", &scope()).unwrap(),
            Value::Bool(true)
        );
        // Function-call form.
        assert_eq!(
            evaluate("var.name == \"World\"", &scope()).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_condition_coercion() {
        let mut s = scope();
        s.variables
            .insert("flag".to_string(), Value::String("TRUE".into()));
        assert!(evaluate_condition("var.flag", &s).unwrap());
        assert!(!evaluate_condition("false", &s).unwrap());
        assert!(matches!(
            evaluate_condition("var.items", &s),
            Err(EngineError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_expand_params_recurses() {
        let mut params = HashMap::new();
        params.insert(
            "command".to_string(),
            Value::String("echo Hello, ${var.name}".into()),
        );
        params.insert(
            "nested".to_string(),
            Value::Object(HashMap::from([(
                "n".to_string(),
                Value::String("${var.count}".into()),
            )])),
        );
        params.insert("plain".to_string(), Value::String("var.name".into()));

        let expanded = expand_params(&params, &scope()).unwrap();
        assert_eq!(
            expanded["command"],
            Value::String("echo Hello, World".into())
        );
        assert_eq!(expanded["nested"].get("n").unwrap(), &Value::Number(3.0));
        // A bare string without interpolation markers stays literal.
        assert_eq!(expanded["plain"], Value::String("var.name".into()));
    }

    #[test]
    fn test_interpolation_with_object_literal_inside() {
        let rendered = interpolate(
            "payload=${if(var.count > 2, {status = \"many\"}, {status = \"few\"})}",
            &scope(),
        )
        .unwrap();
        assert_eq!(rendered, "payload={\"status\":\"many\"}");
    }

    #[test]
    fn test_unresolved_in_interpolation() {
        assert!(matches!(
            interpolate("x ${var.ghost} y", &scope()),
            Err(EngineError::UnresolvedReference(_))
        ));
    }
}
