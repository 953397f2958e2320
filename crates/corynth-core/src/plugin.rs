// Copyright (c) 2025 Corynth Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Plugin seam: the trait the scheduler invokes steps through, plus the
//! introspection types every transport returns. Concrete transports and the
//! manager live in the `corynth-plugins` crate.

use crate::error::PluginError;
use crate::value::Value;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Plugin self-description returned by the `metadata` probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginMetadata {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
}

/// Declared input of an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    #[serde(rename = "type")]
    pub param_type: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

/// Declared output field of an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputFieldSpec {
    #[serde(rename = "type")]
    pub output_type: String,
    #[serde(default)]
    pub description: String,
}

/// One action a plugin offers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub inputs: HashMap<String, ParamSpec>,
    #[serde(default)]
    pub outputs: HashMap<String, OutputFieldSpec>,
}

impl ActionSpec {
    /// Checks that every required input is present, applying declared
    /// defaults to the parameter map.
    pub fn check_inputs(
        &self,
        action: &str,
        plugin: &str,
        params: &mut HashMap<String, Value>,
    ) -> Result<(), PluginError> {
        for (name, spec) in &self.inputs {
            if params.contains_key(name) {
                continue;
            }
            if let Some(default) = &spec.default {
                params.insert(name.clone(), default.clone());
            } else if spec.required {
                return Err(PluginError::ValidationFailed {
                    name: plugin.to_string(),
                    action: action.to_string(),
                    reason: format!("missing required input '{name}'"),
                });
            }
        }
        Ok(())
    }
}

/// Seam between the scheduler and the plugin subsystem.
#[async_trait]
pub trait PluginRuntime: Send + Sync {
    /// Resolves a plugin by name, loading or installing it lazily.
    async fn ensure(&self, name: &str) -> Result<(), PluginError>;

    /// Metadata probe of a resolved plugin.
    async fn metadata(&self, name: &str) -> Result<PluginMetadata, PluginError>;

    /// Action specifications of a resolved plugin.
    async fn actions(&self, name: &str) -> Result<HashMap<String, ActionSpec>, PluginError>;

    /// Invokes an action. The implementation enforces the deadline and
    /// terminates the plugin process when `cancel` fires.
    async fn invoke(
        &self,
        plugin: &str,
        action: &str,
        params: HashMap<String, Value>,
        timeout: Duration,
        cancel: watch::Receiver<bool>,
    ) -> Result<HashMap<String, Value>, PluginError>;

    /// Validates parameters without executing (plan mode). Transports
    /// without a validation call only check declared required inputs.
    async fn validate(
        &self,
        plugin: &str,
        action: &str,
        params: HashMap<String, Value>,
    ) -> Result<(), PluginError>;
}

pub type PluginRuntimeRef = Arc<dyn PluginRuntime>;

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_with_required(name: &str) -> ActionSpec {
        ActionSpec {
            description: "test".into(),
            inputs: HashMap::from([(
                name.to_string(),
                ParamSpec {
                    param_type: "string".into(),
                    description: String::new(),
                    required: true,
                    default: None,
                },
            )]),
            outputs: HashMap::new(),
        }
    }

    #[test]
    fn test_missing_required_input() {
        let spec = spec_with_required("url");
        let mut params = HashMap::new();
        let err = spec.check_inputs("get", "http", &mut params).unwrap_err();
        assert!(matches!(err, PluginError::ValidationFailed { .. }));
        assert!(err.to_string().contains("url"));
    }

    #[test]
    fn test_default_applied() {
        let mut spec = spec_with_required("url");
        spec.inputs.insert(
            "method".into(),
            ParamSpec {
                param_type: "string".into(),
                description: String::new(),
                required: false,
                default: Some(Value::String("GET".into())),
            },
        );
        let mut params = HashMap::from([("url".into(), Value::String("https://x".into()))]);
        spec.check_inputs("get", "http", &mut params).unwrap();
        assert_eq!(params["method"], Value::String("GET".into()));
    }

    #[test]
    fn test_metadata_serde_round_trip() {
        let metadata = PluginMetadata {
            name: "http".into(),
            version: "1.2.0".into(),
            description: "HTTP client".into(),
            author: "corynth".into(),
            tags: vec!["network".into()],
            repository: None,
            license: Some("Apache-2.0".into()),
        };
        let json = serde_json::to_string(&metadata).unwrap();
        let back: PluginMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, metadata);
    }
}
