//! Structural validation of tool arguments against an input schema.
//!
//! Supports the subset of JSON Schema tool descriptors use in practice:
//! `type` (single name or list), `properties`, `required`, `items`, `enum`
//! and `additionalProperties: false`. Unknown keywords are ignored.

use serde_json::{Map, Value};

use crate::mcp::error::McpError;

/// Name reported when the arguments object itself is at fault.
pub const ROOT_FIELD: &str = "arguments";

/// Validates an arguments object against a tool input schema.
///
/// # Errors
///
/// Returns [`McpError::InvalidArguments`] naming the first offending field.
pub fn validate_arguments(schema: &Value, arguments: &Map<String, Value>) -> Result<(), McpError> {
    check(schema, &Value::Object(arguments.clone()), "")
}

fn check(schema: &Value, value: &Value, path: &str) -> Result<(), McpError> {
    let Some(schema) = schema.as_object() else {
        // `true`, `{}` and malformed schemas accept anything
        return Ok(());
    };

    if let Some(expected) = schema.get("type") {
        if !type_matches(expected, value) {
            return Err(violation(
                path,
                format!("expected {}, found {}", describe(expected), type_name(value)),
            ));
        }
    }

    if let Some(Value::Array(allowed)) = schema.get("enum") {
        if !allowed.contains(value) {
            return Err(violation(path, format!("must be one of {}", Value::Array(allowed.clone()))));
        }
    }

    match value {
        Value::Object(obj) => check_object(schema, obj, path),
        Value::Array(items) => {
            if let Some(item_schema) = schema.get("items") {
                for (i, item) in items.iter().enumerate() {
                    check(item_schema, item, &format!("{}[{i}]", field_name(path)))?;
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

fn check_object(schema: &Map<String, Value>, obj: &Map<String, Value>, path: &str) -> Result<(), McpError> {
    if let Some(Value::Array(required)) = schema.get("required") {
        for name in required.iter().filter_map(Value::as_str) {
            if !obj.contains_key(name) {
                return Err(violation(&join(path, name), "is required".to_string()));
            }
        }
    }

    let properties = schema.get("properties").and_then(Value::as_object);

    for (name, field) in obj {
        match properties.and_then(|p| p.get(name)) {
            Some(field_schema) => check(field_schema, field, &join(path, name))?,
            None if schema.get("additionalProperties") == Some(&Value::Bool(false)) => {
                return Err(violation(&join(path, name), "is not allowed".to_string()));
            }
            None => {}
        }
    }

    Ok(())
}

fn type_matches(expected: &Value, value: &Value) -> bool {
    match expected {
        Value::String(name) => is_type(name, value),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .any(|name| is_type(name, value)),
        _ => true,
    }
}

fn is_type(name: &str, value: &Value) -> bool {
    match name {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        "number" => value.is_number(),
        "integer" => {
            value.is_i64()
                || value.is_u64()
                || value.as_f64().is_some_and(|f| f.fract() == 0.0)
        }
        // Unknown type names never reject
        _ => true,
    }
}

const fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn describe(expected: &Value) -> String {
    match expected {
        Value::String(name) => name.clone(),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" or "),
        other => other.to_string(),
    }
}

fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{path}.{name}")
    }
}

fn field_name(path: &str) -> &str {
    if path.is_empty() {
        ROOT_FIELD
    } else {
        path
    }
}

fn violation(path: &str, reason: String) -> McpError {
    McpError::InvalidArguments {
        field: field_name(path).to_string(),
        reason,
    }
}
