// Copyright (c) 2025 Corynth Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed run-time value tree shared by expressions, plugins and state.
//!
//! Semantically JSON-equivalent: string, number (64-bit float), bool,
//! array, object and null. Arrays are ordered; objects are unordered with
//! unique keys. Number comparison follows IEEE-754 (NaN is not equal to
//! itself).

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A workflow runtime value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// Absent / null.
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit floating point number.
    Number(f64),
    /// UTF-8 string.
    String(String),
    /// Ordered sequence.
    Array(Vec<Value>),
    /// Unordered string-keyed map.
    Object(HashMap<String, Value>),
}

impl Value {
    /// Human-readable name of the value's type tag.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    /// Returns the string contents, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the number, if this is a number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the boolean, if this is a bool.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the elements, if this is an array.
    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Returns the entries, if this is an object.
    pub fn as_object(&self) -> Option<&HashMap<String, Value>> {
        match self {
            Value::Object(entries) => Some(entries),
            _ => None,
        }
    }

    /// String accessor that fails with `TypeMismatch`.
    pub fn try_str(&self) -> Result<&str> {
        self.as_str()
            .ok_or_else(|| EngineError::type_mismatch("string", self.type_name()))
    }

    /// Number accessor that fails with `TypeMismatch`. Accepts numeric
    /// strings, per the evaluator's coercion rules.
    pub fn try_number(&self) -> Result<f64> {
        match self {
            Value::Number(n) => Ok(*n),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| EngineError::type_mismatch("number", "string")),
            other => Err(EngineError::type_mismatch("number", other.type_name())),
        }
    }

    /// Bool accessor that fails with `TypeMismatch`. Accepts the string
    /// forms `"true"` / `"false"` case-insensitively.
    pub fn try_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" => Ok(true),
                "false" => Ok(false),
                _ => Err(EngineError::type_mismatch("bool", "string")),
            },
            other => Err(EngineError::type_mismatch("bool", other.type_name())),
        }
    }

    /// Array accessor that fails with `TypeMismatch`.
    pub fn try_array(&self) -> Result<&Vec<Value>> {
        self.as_array()
            .ok_or_else(|| EngineError::type_mismatch("array", self.type_name()))
    }

    /// Object accessor that fails with `TypeMismatch`.
    pub fn try_object(&self) -> Result<&HashMap<String, Value>> {
        self.as_object()
            .ok_or_else(|| EngineError::type_mismatch("object", self.type_name()))
    }

    /// Looks up a key on an object value.
    pub fn get(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(entries) => entries.get(key),
            _ => None,
        }
    }

    /// Truthiness used by conditions: null, false, `""`, and `0` are falsy;
    /// everything else (including empty collections) is truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "" | "false" => false,
                "true" => true,
                _ => true,
            },
            Value::Array(_) | Value::Object(_) => true,
        }
    }

    /// Converts a `serde_json::Value` into a runtime value.
    pub fn from_json(json: serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(entries) => Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Converts this value into a `serde_json::Value`. Integral numbers are
    /// emitted as JSON integers so the wire stays canonical.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() && n.abs() < i64::MAX as f64 {
                    serde_json::Value::Number((*n as i64).into())
                } else {
                    serde_json::Number::from_f64(*n)
                        .map(serde_json::Value::Number)
                        .unwrap_or(serde_json::Value::Null)
                }
            }
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    /// Converts a whole parameter map to JSON (plugin wire format).
    pub fn map_to_json(map: &HashMap<String, Value>) -> serde_json::Value {
        serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }

    /// Converts a JSON object into a parameter map. Non-object input yields
    /// a `TypeMismatch`.
    pub fn map_from_json(json: serde_json::Value) -> Result<HashMap<String, Value>> {
        match json {
            serde_json::Value::Object(entries) => Ok(entries
                .into_iter()
                .map(|(k, v)| (k, Value::from_json(v)))
                .collect()),
            other => Err(EngineError::type_mismatch(
                "object",
                json_type_name(&other),
            )),
        }
    }
}

fn json_type_name(json: &serde_json::Value) -> &'static str {
    match json {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

impl fmt::Display for Value {
    /// Renders the value the way string interpolation expects: strings
    /// unquoted, integral numbers without a fraction, collections as JSON.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.is_finite() && n.abs() < i64::MAX as f64 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{}", n)
                }
            }
            Value::String(s) => write!(f, "{}", s),
            Value::Array(_) | Value::Object(_) => {
                write!(f, "{}", self.to_json())
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

impl From<HashMap<String, Value>> for Value {
    fn from(entries: HashMap<String, Value>) -> Self {
        Value::Object(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_round_trip() {
        let json: serde_json::Value = serde_json::json!({
            "name": "deploy",
            "count": 3,
            "ratio": 0.5,
            "enabled": true,
            "tags": ["a", "b"],
            "nested": {"k": null}
        });

        let value = Value::from_json(json.clone());
        assert_eq!(value.get("count").and_then(Value::as_number), Some(3.0));
        assert_eq!(value.to_json(), json);
    }

    #[test]
    fn test_typed_accessors() {
        let v = Value::String("hello".into());
        assert_eq!(v.try_str().unwrap(), "hello");
        assert!(v.try_array().is_err());

        let n = Value::Number(2.0);
        assert_eq!(n.try_number().unwrap(), 2.0);
        assert!(matches!(
            Value::Bool(true).try_number(),
            Err(EngineError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_numeric_string_coercion() {
        assert_eq!(Value::String(" 42 ".into()).try_number().unwrap(), 42.0);
        assert!(Value::String("forty-two".into()).try_number().is_err());
    }

    #[test]
    fn test_bool_string_coercion() {
        assert!(Value::String("TRUE".into()).try_bool().unwrap());
        assert!(!Value::String("false".into()).try_bool().unwrap());
        assert!(Value::String("yes".into()).try_bool().is_err());
    }

    #[test]
    fn test_nan_inequality() {
        let a = Value::Number(f64::NAN);
        let b = Value::Number(f64::NAN);
        assert_ne!(a, b);
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::String("".into()).is_truthy());
        assert!(!Value::String("false".into()).is_truthy());
        assert!(!Value::Number(0.0).is_truthy());
        assert!(Value::Array(vec![]).is_truthy());
        assert!(Value::String("anything".into()).is_truthy());
    }

    #[test]
    fn test_display_rendering() {
        assert_eq!(Value::String("plain".into()).to_string(), "plain");
        assert_eq!(Value::Number(3.0).to_string(), "3");
        assert_eq!(Value::Number(0.5).to_string(), "0.5");
        assert_eq!(Value::Bool(false).to_string(), "false");
        assert_eq!(
            Value::Array(vec![Value::Number(1.0), Value::Number(2.0)]).to_string(),
            "[1,2]"
        );
    }

    #[test]
    fn test_untagged_serde() {
        let v: Value = serde_json::from_str(r#"{"a": [1, "x", false, null]}"#).unwrap();
        let arr = v.get("a").unwrap().try_array().unwrap();
        assert_eq!(arr.len(), 4);
        assert_eq!(arr[0], Value::Number(1.0));
        assert_eq!(arr[3], Value::Null);

        let back = serde_json::to_string(&v.get("a").unwrap()).unwrap();
        assert_eq!(back, r#"[1.0,"x",false,null]"#);
    }
}
