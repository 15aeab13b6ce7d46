//! Conversion of wire-level graph values into plain nested values.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// Largest integer magnitude representable exactly as an IEEE-754 double.
pub const MAX_SAFE_INTEGER: u64 = 9_007_199_254_740_991;

/// Value shapes handed to consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnType {
    /// Plain values: envelopes unwrapped, unsafe integers as strings.
    #[default]
    Native,
    /// Values exactly as the server sent them.
    Raw,
}

/// True for a graph-entity envelope: an object with a `metadata` object
/// (identity, labels or type) and a `data` property payload.
pub fn is_envelope(object: &Map<String, Value>) -> bool {
    matches!(object.get("metadata"), Some(Value::Object(_))) && object.contains_key("data")
}

/// Normalize one value.
///
/// Envelopes are replaced by their payload unless `preserve_envelopes` is
/// set. Integers outside ±[`MAX_SAFE_INTEGER`] become their exact decimal
/// text. Arrays and objects are walked with an explicit stack, so nesting
/// depth is bounded by memory rather than the call stack. Applying this to
/// its own output returns the same value.
pub fn to_native(value: Value, preserve_envelopes: bool) -> Value {
    enum Task {
        Visit(Value),
        Array(usize),
        Object(Vec<String>),
    }

    let mut tasks = vec![Task::Visit(value)];
    let mut done: Vec<Value> = Vec::new();

    while let Some(task) = tasks.pop() {
        match task {
            Task::Visit(Value::Number(number)) => done.push(normalize_number(number)),
            Task::Visit(Value::Array(items)) => {
                tasks.push(Task::Array(items.len()));
                tasks.extend(items.into_iter().rev().map(Task::Visit));
            }
            Task::Visit(Value::Object(mut object)) => {
                if !preserve_envelopes && is_envelope(&object) {
                    let payload = object.remove("data").unwrap_or(Value::Null);
                    tasks.push(Task::Visit(payload));
                    continue;
                }
                let (keys, values): (Vec<String>, Vec<Value>) = object.into_iter().unzip();
                tasks.push(Task::Object(keys));
                tasks.extend(values.into_iter().rev().map(Task::Visit));
            }
            Task::Visit(other) => done.push(other),
            Task::Array(len) => {
                let items = done.split_off(done.len() - len);
                done.push(Value::Array(items));
            }
            Task::Object(keys) => {
                let values = done.split_off(done.len() - keys.len());
                done.push(Value::Object(keys.into_iter().zip(values).collect()));
            }
        }
    }

    done.pop().unwrap_or(Value::Null)
}

fn normalize_number(number: Number) -> Value {
    if let Some(i) = number.as_i64() {
        return if i.unsigned_abs() <= MAX_SAFE_INTEGER {
            Value::Number(number)
        } else {
            Value::String(i.to_string())
        };
    }
    if let Some(u) = number.as_u64() {
        return if u <= MAX_SAFE_INTEGER {
            Value::Number(number)
        } else {
            Value::String(u.to_string())
        };
    }
    // Integers wider than 64 bits survive only as their literal text.
    let literal = number.to_string();
    let integral = literal
        .strip_prefix('-')
        .unwrap_or(&literal)
        .bytes()
        .all(|b| b.is_ascii_digit());
    if integral {
        Value::String(literal)
    } else {
        Value::Number(number)
    }
}
