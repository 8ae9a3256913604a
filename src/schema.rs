//! Validation of open JSON maps against a connector-declared schema.
//!
//! Supports the object subset of JSON Schema connectors actually declare:
//! `properties`, `required`, per-property `type`, `enum` and `default`, and
//! `additionalProperties: false`. Defaults are injected into the result.

use anyhow::{bail, Result};
use serde_json::Value;

use crate::models::JsonMap;

pub fn validate_config(schema: &Value, config: &JsonMap) -> Result<JsonMap> {
    let properties = schema
        .get("properties")
        .and_then(|p| p.as_object())
        .cloned()
        .unwrap_or_default();

    let required: Vec<String> = schema
        .get("required")
        .and_then(|r| r.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();

    let mut result = config.clone();

    for req_field in &required {
        if !config.contains_key(req_field) {
            bail!("missing required field: {}", req_field);
        }
    }

    if schema.get("additionalProperties") == Some(&Value::Bool(false)) {
        if let Some(unknown) = config.keys().find(|k| !properties.contains_key(*k)) {
            bail!("unknown field: {}", unknown);
        }
    }

    for (prop_name, prop_schema) in &properties {
        if let Some(value) = config.get(prop_name) {
            if let Some(expected_type) = prop_schema.get("type").and_then(|t| t.as_str()) {
                let type_ok = match expected_type {
                    "string" => value.is_string(),
                    "integer" => value.is_i64() || value.is_u64(),
                    "number" => value.is_number(),
                    "boolean" => value.is_boolean(),
                    "array" => value.is_array(),
                    "object" => value.is_object(),
                    _ => true,
                };
                if !type_ok {
                    bail!(
                        "field '{}' must be of type '{}', got {}",
                        prop_name,
                        expected_type,
                        json_type_name(value)
                    );
                }
            }

            if let Some(enum_values) = prop_schema.get("enum").and_then(|e| e.as_array()) {
                if !enum_values.contains(value) {
                    let allowed: Vec<String> = enum_values.iter().map(|v| v.to_string()).collect();
                    bail!(
                        "field '{}' must be one of [{}], got {}",
                        prop_name,
                        allowed.join(", "),
                        value
                    );
                }
            }
        } else if let Some(default) = prop_schema.get("default") {
            result.insert(prop_name.clone(), default.clone());
        }
    }

    Ok(result)
}

fn json_type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
