// Copyright (c) 2025 Corynth Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! gRPC protocol types for serve-transport plugins, plus conversions
//! between the wire representation and the engine's value model.
//!
//! The proto is the transport layer; the types in `corynth-core` remain the
//! source of truth.

use corynth_core::plugin::{ActionSpec, OutputFieldSpec, ParamSpec, PluginMetadata};
use corynth_core::Value;
use std::collections::HashMap;

// Generated protobuf code.
pub mod proto {
    tonic::include_proto!("corynth.plugin");
}

// Re-export for convenience.
pub use proto::plugin_service_client::PluginServiceClient;
pub use proto::plugin_service_server::{PluginService, PluginServiceServer};

/// Converts an engine value to the wire union.
pub fn value_to_proto(value: &Value) -> proto::PluginValue {
    use proto::plugin_value::Kind;

    let kind = match value {
        Value::Null => Kind::NullValue(true),
        Value::Bool(b) => Kind::BoolValue(*b),
        Value::Number(n) => Kind::NumberValue(*n),
        Value::String(s) => Kind::StringValue(s.clone()),
        Value::Array(items) => Kind::ArrayValue(proto::ValueList {
            items: items.iter().map(value_to_proto).collect(),
        }),
        Value::Object(entries) => Kind::ObjectValue(proto::ValueMap {
            entries: entries
                .iter()
                .map(|(key, item)| (key.clone(), value_to_proto(item)))
                .collect(),
        }),
    };

    proto::PluginValue { kind: Some(kind) }
}

/// Converts a wire union back to an engine value. A missing tag decodes as
/// null, matching JSON semantics.
pub fn proto_to_value(value: &proto::PluginValue) -> Value {
    use proto::plugin_value::Kind;

    match &value.kind {
        None | Some(Kind::NullValue(_)) => Value::Null,
        Some(Kind::BoolValue(b)) => Value::Bool(*b),
        Some(Kind::NumberValue(n)) => Value::Number(*n),
        Some(Kind::StringValue(s)) => Value::String(s.clone()),
        Some(Kind::ArrayValue(list)) => {
            Value::Array(list.items.iter().map(proto_to_value).collect())
        }
        Some(Kind::ObjectValue(map)) => Value::Object(
            map.entries
                .iter()
                .map(|(key, item)| (key.clone(), proto_to_value(item)))
                .collect(),
        ),
    }
}

/// Wraps a parameter map for a request.
pub fn params_to_proto(params: &HashMap<String, Value>) -> proto::ValueMap {
    proto::ValueMap {
        entries: params
            .iter()
            .map(|(key, value)| (key.clone(), value_to_proto(value)))
            .collect(),
    }
}

/// Unwraps a response map.
pub fn proto_to_params(map: &proto::ValueMap) -> HashMap<String, Value> {
    map.entries
        .iter()
        .map(|(key, value)| (key.clone(), proto_to_value(value)))
        .collect()
}

/// Converts wire metadata to the engine type. Empty optional fields decode
/// as absent.
pub fn proto_to_metadata(metadata: proto::Metadata) -> PluginMetadata {
    PluginMetadata {
        name: metadata.name,
        version: metadata.version,
        description: metadata.description,
        author: metadata.author,
        tags: metadata.tags,
        repository: non_empty(metadata.repository),
        license: non_empty(metadata.license),
    }
}

pub fn metadata_to_proto(metadata: &PluginMetadata) -> proto::Metadata {
    proto::Metadata {
        name: metadata.name.clone(),
        version: metadata.version.clone(),
        description: metadata.description.clone(),
        author: metadata.author.clone(),
        tags: metadata.tags.clone(),
        repository: metadata.repository.clone().unwrap_or_default(),
        license: metadata.license.clone().unwrap_or_default(),
    }
}

pub fn proto_to_action_spec(spec: proto::ActionSpec) -> ActionSpec {
    ActionSpec {
        description: spec.description,
        inputs: spec
            .inputs
            .into_iter()
            .map(|(name, input)| {
                (
                    name,
                    ParamSpec {
                        param_type: input.r#type,
                        description: input.description,
                        required: input.required,
                        default: input.default_value.as_ref().map(proto_to_value),
                    },
                )
            })
            .collect(),
        outputs: spec
            .outputs
            .into_iter()
            .map(|(name, output)| {
                (
                    name,
                    OutputFieldSpec {
                        output_type: output.r#type,
                        description: output.description,
                    },
                )
            })
            .collect(),
    }
}

pub fn proto_to_actions(response: proto::ActionsResponse) -> HashMap<String, ActionSpec> {
    response
        .actions
        .into_iter()
        .map(|(name, spec)| (name, proto_to_action_spec(spec)))
        .collect()
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_round_trip() {
        let value = Value::Object(HashMap::from([
            ("name".to_string(), Value::String("corynth".into())),
            ("count".to_string(), Value::Number(3.0)),
            ("flag".to_string(), Value::Bool(false)),
            ("nothing".to_string(), Value::Null),
            (
                "items".to_string(),
                Value::Array(vec![Value::Number(1.0), Value::String("x".into())]),
            ),
        ]));

        let wire = value_to_proto(&value);
        let back = proto_to_value(&wire);
        assert_eq!(back, value);
    }

    #[test]
    fn test_missing_kind_decodes_as_null() {
        let wire = proto::PluginValue { kind: None };
        assert_eq!(proto_to_value(&wire), Value::Null);
    }

    #[test]
    fn test_metadata_round_trip() {
        let metadata = PluginMetadata {
            name: "docker".into(),
            version: "2.1.0".into(),
            description: "Container manager".into(),
            author: "corynth".into(),
            tags: vec!["containers".into()],
            repository: Some("https://github.com/corynth/plugins".into()),
            license: None,
        };

        let back = proto_to_metadata(metadata_to_proto(&metadata));
        assert_eq!(back, metadata);
    }

    #[test]
    fn test_params_round_trip() {
        let params = HashMap::from([
            ("url".to_string(), Value::String("https://x".into())),
            ("retries".to_string(), Value::Number(2.0)),
        ]);
        let back = proto_to_params(&params_to_proto(&params));
        assert_eq!(back, params);
    }
}
