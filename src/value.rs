//! Typed values flowing through a transform pipeline, plus JSON pointer helpers.

use serde_json::{Map, Number, Value};
use std::fmt;

/// A value resolved from a rule source.
///
/// Conversions are lenient the way a template language is: strings parse into
/// numbers when they can, numbers convert between each other, and a JSON
/// document only converts to a string (its serialization).
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    String(String),
    Integer(i64),
    Unsigned(u64),
    Float(f64),
    Boolean(bool),
    Json(Value),
}

impl TypedValue {
    /// Wrap a JSON node. `null` means "nothing there" and yields `None`.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::String(s) => Some(Self::String(s.clone())),
            Value::Bool(b) => Some(Self::Boolean(*b)),
            Value::Number(n) => Some(number_to_typed(n)),
            Value::Array(_) | Value::Object(_) => Some(Self::Json(value.clone())),
        }
    }

    pub fn as_string(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Integer(i) => i.to_string(),
            Self::Unsigned(u) => u.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Boolean(b) => b.to_string(),
            Self::Json(v) => v.to_string(),
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::String(s) => s.trim().parse().ok(),
            Self::Integer(i) => Some(*i),
            Self::Unsigned(u) => i64::try_from(*u).ok(),
            Self::Float(f) if f.is_finite() => Some(f.trunc() as i64),
            Self::Float(_) => None,
            Self::Boolean(b) => Some(i64::from(*b)),
            Self::Json(_) => None,
        }
    }

    pub fn as_unsigned(&self) -> Option<u64> {
        match self {
            Self::String(s) => s.trim().parse().ok(),
            Self::Integer(i) => u64::try_from(*i).ok(),
            Self::Unsigned(u) => Some(*u),
            Self::Float(f) if f.is_finite() && *f >= 0.0 => Some(f.trunc() as u64),
            Self::Float(_) => None,
            Self::Boolean(b) => Some(u64::from(*b)),
            Self::Json(_) => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::String(s) => s.trim().parse().ok(),
            Self::Integer(i) => Some(*i as f64),
            Self::Unsigned(u) => Some(*u as f64),
            Self::Float(f) => Some(*f),
            Self::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::Json(_) => None,
        }
    }

    /// Non-empty strings and non-zero numbers are true.
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Self::String(s) => Some(!s.is_empty()),
            Self::Integer(i) => Some(*i != 0),
            Self::Unsigned(u) => Some(*u != 0),
            Self::Float(f) => Some(*f != 0.0),
            Self::Boolean(b) => Some(*b),
            Self::Json(_) => None,
        }
    }

    /// Native JSON representation.
    pub fn to_json(&self) -> Value {
        match self {
            Self::String(s) => Value::String(s.clone()),
            Self::Integer(i) => Value::from(*i),
            Self::Unsigned(u) => Value::from(*u),
            Self::Float(f) => Value::from(*f),
            Self::Boolean(b) => Value::Bool(*b),
            Self::Json(v) => v.clone(),
        }
    }
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

fn number_to_typed(n: &Number) -> TypedValue {
    if let Some(i) = n.as_i64() {
        TypedValue::Integer(i)
    } else if let Some(u) = n.as_u64() {
        TypedValue::Unsigned(u)
    } else {
        TypedValue::Float(n.as_f64().unwrap_or(f64::NAN))
    }
}

/// Convert a body path into a JSON pointer.
///
/// Paths starting with `/` already are pointers; otherwise dots separate
/// object members (`a.b.c` becomes `/a/b/c`).
pub fn to_pointer(path: &str) -> String {
    if path.is_empty() || path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{}", path.replace('.', "/"))
    }
}

fn unescape_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

/// Write `value` at `pointer`, creating intermediate objects as needed.
///
/// Array elements can be replaced or appended (index equal to the length);
/// any other index into an array fails.
pub fn set_pointer(root: &mut Value, pointer: &str, value: Value) -> bool {
    if pointer.is_empty() {
        *root = value;
        return true;
    }
    if !pointer.starts_with('/') {
        return false;
    }

    let mut current = root;
    for raw in pointer[1..].split('/') {
        let token = unescape_token(raw);
        current = match current {
            Value::Array(items) => match token.parse::<usize>() {
                Ok(index) if index < items.len() => &mut items[index],
                Ok(index) if index == items.len() => {
                    items.push(Value::Null);
                    &mut items[index]
                }
                _ => return false,
            },
            other => {
                if !other.is_object() {
                    *other = Value::Object(Map::new());
                }
                match other {
                    Value::Object(map) => map.entry(token).or_insert(Value::Null),
                    _ => return false,
                }
            }
        };
    }

    *current = value;
    true
}

/// Remove the node at `pointer`, returning whether something was removed.
pub fn remove_pointer(root: &mut Value, pointer: &str) -> bool {
    let Some((parent, last)) = pointer.rsplit_once('/') else {
        return false;
    };
    let key = unescape_token(last);
    match root.pointer_mut(parent) {
        Some(Value::Object(map)) => map.remove(&key).is_some(),
        Some(Value::Array(items)) => match key.parse::<usize>() {
            Ok(index) if index < items.len() => {
                items.remove(index);
                true
            }
            _ => false,
        },
        _ => false,
    }
}
