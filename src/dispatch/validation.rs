//! Structural validation of tool arguments against a declared JSON Schema.
//!
//! Only shape is checked: `type` (including type unions), `required`,
//! `properties`, `items` and `enum`. Value semantics such as formats, ranges
//! or patterns are left to the server.

use serde_json::Value;

/// Validate tool arguments against a JSON Schema.
///
/// Returns `Ok(())` when valid, `Err(message)` describing the first
/// violation found, prefixed with its path (`$.filters[0].field`).
pub fn validate_arguments(args: &Value, schema: &Value) -> Result<(), String> {
    validate_at("$", args, schema)
}

fn validate_at(path: &str, value: &Value, schema: &Value) -> Result<(), String> {
    if let Some(expected) = schema.get("type") {
        let allowed: Vec<&str> = match expected {
            Value::String(name) => vec![name.as_str()],
            Value::Array(names) => names.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        if !allowed.is_empty() && !allowed.iter().any(|t| value_matches_type(value, t)) {
            return Err(format!(
                "{path}: expected {}, got {}",
                allowed.join(" or "),
                json_type_name(value)
            ));
        }
    }

    if let Some(choices) = schema.get("enum").and_then(Value::as_array) {
        if !choices.contains(value) {
            return Err(format!("{path}: value {value} is not one of the allowed values"));
        }
    }

    if let Some(obj) = value.as_object() {
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for name in required.iter().filter_map(Value::as_str) {
                if !obj.contains_key(name) {
                    return Err(format!("{path}: missing required field '{name}'"));
                }
            }
        }

        if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
            for (key, field) in obj {
                if let Some(field_schema) = properties.get(key) {
                    validate_at(&format!("{path}.{key}"), field, field_schema)?;
                }
            }
        }
    }

    if let (Some(items), Some(elements)) = (schema.get("items"), value.as_array()) {
        if items.is_object() {
            for (index, element) in elements.iter().enumerate() {
                validate_at(&format!("{path}[{index}]"), element, items)?;
            }
        }
    }

    Ok(())
}

fn value_matches_type(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => {
            value.is_i64()
                || value.is_u64()
                || value.as_f64().is_some_and(|n| n.fract() == 0.0)
        }
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
