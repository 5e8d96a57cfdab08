// File: src/primitives/json.rs
//
// JSON encoding/decoding primitives. JSON numbers become integers when
// integral, floats otherwise; arrays become arrays, objects become
// dictionaries with string keys.

use serde_json::Value as JsonValue;

use super::{check_arity, string_arg};
use crate::value::{DictKey, DictMap, Value};

/// Generation refuses structures nested deeper than this; cyclic values
/// would otherwise recurse forever.
const MAX_DEPTH: usize = 64;

pub fn handle(selector: &str, args: &[Value]) -> Option<Result<Value, String>> {
    let result = match selector {
        "jsonParse:" => check_arity(selector, args, 1).and_then(|_| {
            let text = string_arg(selector, args, 0)?;
            let parsed: JsonValue =
                serde_json::from_str(&text).map_err(|e| format!("Invalid JSON: {}", e))?;
            Ok(json_to_value(parsed))
        }),

        "jsonGenerate:" => check_arity(selector, args, 1).and_then(|_| {
            let value = args.first().ok_or_else(|| "jsonGenerate: is missing its argument".to_string())?;
            let json = value_to_json(value, 0)?;
            serde_json::to_string(&json).map(Value::str).map_err(|e| format!("JSON generation failed: {}", e))
        }),

        _ => return None,
    };
    Some(result)
}

fn json_to_value(json: JsonValue) -> Value {
    match json {
        JsonValue::Null => Value::Nil,
        JsonValue::Bool(b) => Value::Bool(b),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(f64::NAN))
            }
        }
        JsonValue::String(s) => Value::str(s),
        JsonValue::Array(items) => {
            Value::array(items.into_iter().map(json_to_value).collect())
        }
        JsonValue::Object(entries) => {
            let mut map = DictMap::default();
            for (key, value) in entries {
                map.insert(DictKey::Str(key), json_to_value(value));
            }
            Value::dictionary(map)
        }
    }
}

fn value_to_json(value: &Value, depth: usize) -> Result<JsonValue, String> {
    if depth > MAX_DEPTH {
        return Err("Value is nested too deeply for JSON (cycle?)".to_string());
    }

    match value {
        Value::Nil => Ok(JsonValue::Null),
        Value::Bool(b) => Ok(JsonValue::Bool(*b)),
        Value::Int(n) => Ok(JsonValue::Number((*n).into())),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(JsonValue::Number)
            .ok_or_else(|| "Cannot represent NaN or infinity in JSON".to_string()),
        Value::Str(s) => Ok(JsonValue::String(s.as_ref().clone())),
        Value::Array(items) => {
            let items = items.lock().unwrap().clone();
            let mut out = Vec::with_capacity(items.len());
            for item in &items {
                out.push(value_to_json(item, depth + 1)?);
            }
            Ok(JsonValue::Array(out))
        }
        Value::Dictionary(map) => {
            let entries: Vec<(DictKey, Value)> = map
                .lock()
                .unwrap()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            let mut out = serde_json::Map::new();
            for (key, value) in entries {
                // Non-string keys flatten to their printed form.
                let key = match key {
                    DictKey::Str(s) => s,
                    other => other.to_value().display_string(),
                };
                out.insert(key, value_to_json(&value, depth + 1)?);
            }
            Ok(JsonValue::Object(out))
        }
        other => Err(format!("{} cannot be represented as JSON", other.kind_name())),
    }
}
