//! The structured payload carried by command replies.
//!
//! Status trees are ordered name/value lists, not maps: `status <JAIL>`
//! returns nested pair lists whose order is part of the output format, so
//! pairs are modeled as two-element [`Value::List`]s rather than objects.

use serde::{Deserialize, Serialize};

/// A reply payload: nil, scalar, or (possibly nested) list.
///
/// The untagged serde representation maps directly onto JSON:
/// `Nil` ⇔ `null`, lists ⇔ arrays. Pairs are two-element lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// No payload.
    Nil,
    /// Boolean scalar.
    Bool(bool),
    /// Integer scalar.
    Int(i64),
    /// Floating point scalar.
    Num(f64),
    /// String scalar.
    Str(String),
    /// Ordered sequence of values (also used for name/value pairs).
    List(Vec<Value>),
}

impl Value {
    /// Build a `(name, value)` pair as a two-element list.
    pub fn pair(name: impl Into<String>, value: impl Into<Value>) -> Value {
        Value::List(vec![Value::Str(name.into()), value.into()])
    }

    /// Build a list value from anything convertible.
    pub fn list(items: impl IntoIterator<Item = impl Into<Value>>) -> Value {
        Value::List(items.into_iter().map(Into::into).collect())
    }

    /// Whether this is [`Value::Nil`].
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Integer view, if this is an `Int`.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// String view, if this is a `Str`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// List view, if this is a `List`.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Nil
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Nil
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Num(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Nil,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Nil => write!(f, "None"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Num(v) => write!(f, "{}", v),
            Value::Str(s) => write!(f, "{}", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_round_trip() {
        let v = Value::List(vec![
            Value::pair("Currently banned", 2usize),
            Value::pair("Banned IP list", Value::list(["192.0.2.1", "192.0.2.2"])),
            Value::Nil,
        ]);
        let encoded = serde_json::to_string(&v).unwrap();
        let decoded: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(v, decoded);
    }

    #[test]
    fn test_untagged_scalars() {
        assert_eq!(serde_json::from_str::<Value>("null").unwrap(), Value::Nil);
        assert_eq!(serde_json::from_str::<Value>("42").unwrap(), Value::Int(42));
        assert_eq!(
            serde_json::from_str::<Value>("\"x\"").unwrap(),
            Value::Str("x".into())
        );
    }

    #[test]
    fn test_display() {
        let v = Value::list(["a", "b"]);
        assert_eq!(v.to_string(), "[a, b]");
        assert_eq!(Value::Nil.to_string(), "None");
    }
}
