//! Tool argument validation against the declared JSON schema.
//!
//! Covers what tool schemas in this codebase actually use: an object with
//! `properties`, primitive `type`s, and a `required` list. A failed check
//! means the tool is never invoked.

use serde_json::Value;

/// Validate `args` against `schema`. Returns a human-readable reason on
/// failure (it goes straight into the tool result the model sees).
pub fn validate_arguments(schema: &Value, args: &Value) -> Result<(), String> {
    let Some(args_obj) = args.as_object() else {
        return Err("arguments must be a JSON object".into());
    };

    if let Some(required) = schema.get("required").and_then(|v| v.as_array()) {
        for name in required.iter().filter_map(|v| v.as_str()) {
            if !args_obj.contains_key(name) {
                return Err(format!("missing required argument: {name}"));
            }
        }
    }

    let Some(props) = schema.get("properties").and_then(|v| v.as_object()) else {
        return Ok(());
    };

    for (name, value) in args_obj {
        let Some(decl) = props.get(name) else {
            // Unknown arguments pass through; external servers often accept
            // more than they declare.
            continue;
        };
        let Some(expected) = decl.get("type").and_then(|v| v.as_str()) else {
            continue;
        };
        if !type_matches(expected, value) {
            return Err(format!(
                "argument '{name}' should be {expected}, got {}",
                type_name(value)
            ));
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        _ => true,
    }
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
