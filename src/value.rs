//! The data values flowing between targets.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::core::{Blake3Hasher, Hash32};

/// A value produced by a target or held by an import.
///
/// Values serialize untagged, so JSON and CBOR representations look like the
/// natural encoding of the data (`[1, 2, 3]`, `{"a": true}`).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Content hash of the value.
    ///
    /// The hash is structural: it depends only on the data, not on how the
    /// value was produced or stored.
    pub fn hash(&self) -> Hash32 {
        let mut hasher = Blake3Hasher::new();
        self.feed(&mut hasher);
        hasher.finish()
    }

    fn feed(&self, hasher: &mut Blake3Hasher) {
        match self {
            Value::Null => {
                hasher.field(b"n");
            }
            Value::Bool(b) => {
                hasher.field(b"b").u64(*b as u64);
            }
            Value::Int(i) => {
                hasher.field(b"i").u64(*i as u64);
            }
            Value::Float(f) => {
                hasher.field(b"f").u64(f.to_bits());
            }
            Value::Str(s) => {
                hasher.field(b"s").field(s);
            }
            Value::List(items) => {
                hasher.field(b"l").u64(items.len() as u64);
                for item in items {
                    item.feed(hasher);
                }
            }
            Value::Map(map) => {
                hasher.field(b"m").u64(map.len() as u64);
                for (key, item) in map {
                    hasher.field(key);
                    item.feed(hasher);
                }
            }
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Elements used when branching over this value: a list yields its items,
    /// a map its values, anything else is a single element.
    pub fn elements(&self) -> Vec<Value> {
        match self {
            Value::List(items) => items.clone(),
            Value::Map(map) => map.values().cloned().collect(),
            other => vec![other.clone()],
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Value::List(items) => items.len(),
            Value::Map(map) => map.len(),
            Value::Str(s) => s.chars().count(),
            Value::Null => 0,
            _ => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x:?}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Map(map) => {
                write!(f, "{{")?;
                for (i, (key, item)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key:?}: {item}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(value: Vec<T>) -> Self {
        Value::List(value.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_structural() {
        let a = Value::from(vec![1i64, 2, 3]);
        let b = Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert_eq!(a.hash(), b.hash());
        assert_ne!(a.hash(), Value::from(vec![1i64, 2]).hash());
    }

    #[test]
    fn test_int_and_float_differ() {
        assert_ne!(Value::Int(1).hash(), Value::Float(1.0).hash());
    }

    #[test]
    fn test_elements() {
        assert_eq!(Value::from(vec!["a", "b"]).elements().len(), 2);
        assert_eq!(Value::Int(4).elements(), vec![Value::Int(4)]);
    }

    #[test]
    fn test_json_shape() {
        let value: Value = serde_json::from_str(r#"{"a": [1, 2.5, "x", null, true]}"#).unwrap();
        let Value::Map(map) = &value else {
            panic!("expected a map");
        };
        assert_eq!(
            map["a"],
            Value::List(vec![
                Value::Int(1),
                Value::Float(2.5),
                Value::Str("x".into()),
                Value::Null,
                Value::Bool(true),
            ])
        );
    }

    #[test]
    fn test_display() {
        let value = Value::from(vec![Value::Int(1), Value::from("a")]);
        assert_eq!(value.to_string(), r#"[1, "a"]"#);
    }
}
