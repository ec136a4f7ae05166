//! Argument validation against the JSON-Schema subset carried by command
//! records: `type: object`, `properties`, `required`, optional `enum`
//! per property and `additionalProperties: false`.
//!
//! Validation also performs safe coercions (numeric/boolean strings) and
//! normalizes enum-like string fields (trim, lower-case), so the
//! validated value is what downstream code and the result-cache key see.

use omnihive_schema::SkillError;
use serde_json::{Map, Value};

pub fn validate_args(schema: &Value, args: Value) -> Result<Value, SkillError> {
    // Commands without a schema accept any object.
    if schema.is_null() {
        return match args {
            Value::Object(_) => Ok(args),
            Value::Null => Ok(Value::Object(Map::new())),
            other => Err(SkillError::InvalidArgs(format!(
                "arguments must be an object, got {}",
                type_name(&other)
            ))),
        };
    }

    if schema.get("type").and_then(Value::as_str) != Some("object") {
        return Err(SkillError::InvalidArgs(
            "input schema must declare type: object".into(),
        ));
    }

    let mut args = match args {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            return Err(SkillError::InvalidArgs(format!(
                "arguments must be an object, got {}",
                type_name(&other)
            )))
        }
    };

    let empty = Map::new();
    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    // Unknown keys are rejected only when the schema forbids them.
    let reject_unknown = schema
        .get("additionalProperties")
        .and_then(Value::as_bool)
        .map(|allowed| !allowed)
        .unwrap_or(false);
    if reject_unknown {
        if let Some(unknown) = args.keys().find(|key| !properties.contains_key(*key)) {
            return Err(SkillError::InvalidArgs(format!(
                "unknown argument: {unknown}"
            )));
        }
    }

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !args.contains_key(name) {
                return Err(SkillError::InvalidArgs(format!(
                    "missing required argument: {name}"
                )));
            }
        }
    }

    for (name, spec) in properties {
        let Some(value) = args.get(name) else {
            continue;
        };
        let coerced = coerce_value(name, value.clone(), spec)?;
        args.insert(name.clone(), coerced);
    }

    Ok(Value::Object(args))
}

fn coerce_value(name: &str, value: Value, spec: &Value) -> Result<Value, SkillError> {
    let expected = spec.get("type").and_then(Value::as_str).unwrap_or("string");

    let coerced = match (expected, &value) {
        ("string", Value::String(_)) => value,
        ("integer", Value::Number(n)) if n.is_i64() || n.is_u64() => value,
        ("number", Value::Number(_)) => value,
        ("boolean", Value::Bool(_)) => value,
        ("array", Value::Array(_)) => value,
        ("object", Value::Object(_)) => value,
        ("null", Value::Null) => value,
        // Safe scalar coercions from strings.
        ("integer", Value::String(raw)) => match raw.trim().parse::<i64>() {
            Ok(parsed) => Value::Number(parsed.into()),
            Err(_) => {
                return Err(SkillError::InvalidArgs(format!(
                    "argument {name} expects an integer, got {raw:?}"
                )))
            }
        },
        ("number", Value::String(raw)) => match raw.trim().parse::<f64>() {
            Ok(parsed) => serde_json::Number::from_f64(parsed)
                .map(Value::Number)
                .ok_or_else(|| {
                    SkillError::InvalidArgs(format!("argument {name} is not a finite number"))
                })?,
            Err(_) => {
                return Err(SkillError::InvalidArgs(format!(
                    "argument {name} expects a number, got {raw:?}"
                )))
            }
        },
        ("boolean", Value::String(raw)) => match raw.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => Value::Bool(true),
            "false" | "0" | "no" => Value::Bool(false),
            _ => {
                return Err(SkillError::InvalidArgs(format!(
                    "argument {name} expects a boolean, got {raw:?}"
                )))
            }
        },
        ("string", Value::Number(n)) => Value::String(n.to_string()),
        ("string", Value::Bool(b)) => Value::String(b.to_string()),
        (_, Value::Null) => Value::Null,
        (expected, actual) => {
            return Err(SkillError::InvalidArgs(format!(
                "argument {name} expects {expected}, got {}",
                type_name(actual)
            )))
        }
    };

    // Enum-like string fields are normalized before matching.
    if let Some(choices) = spec.get("enum").and_then(Value::as_array) {
        if let Value::String(raw) = &coerced {
            let normalized = raw.trim().to_lowercase();
            let matched = choices
                .iter()
                .filter_map(Value::as_str)
                .find(|choice| choice.to_lowercase() == normalized);
            return match matched {
                Some(choice) => Ok(Value::String(choice.to_string())),
                None => Err(SkillError::InvalidArgs(format!(
                    "argument {name} must be one of {choices:?}, got {raw:?}"
                ))),
            };
        }
    }

    Ok(coerced)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
