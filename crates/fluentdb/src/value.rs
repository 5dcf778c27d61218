//! Scalar values bound as statement parameters and returned in rows.

use serde::{Serialize, Serializer};
use std::fmt;

/// Maximum byte length of a text parameter copied into hook/error contexts.
pub const MAX_SANITIZED_TEXT: usize = 200;

/// A closed scalar value: the only shapes that are ever bound to a statement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
}

/// The driver-side parameter type chosen for a [`Value`] at bind time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    Null,
    Bool,
    Int,
    Text,
}

impl Value {
    /// Binding type: null→null, integer→integer, boolean→boolean, else→string.
    pub fn param_type(&self) -> ParamType {
        match self {
            Value::Null => ParamType::Null,
            Value::Bool(_) => ParamType::Bool,
            Value::Int(_) => ParamType::Int,
            Value::Text(_) => ParamType::Text,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Text(s) => s.trim().parse().ok(),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Null => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Copy suitable for logs and hook contexts: long text is cut on a char boundary.
    pub fn sanitized(&self) -> Value {
        match self {
            Value::Text(s) if s.len() > MAX_SANITIZED_TEXT => {
                let mut end = MAX_SANITIZED_TEXT;
                while end > 0 && !s.is_char_boundary(end) {
                    end -= 1;
                }
                Value::Text(format!("{}...", &s[..end]))
            }
            other => other.clone(),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

pub(crate) fn sanitize_params(params: &[Value]) -> Vec<Value> {
    params.iter().map(Value::sanitized).collect()
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Text(s) => write!(f, "'{s}'"),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Text(s) => serializer.serialize_str(s),
        }
    }
}

macro_rules! impl_from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Value {
                fn from(v: $t) -> Self {
                    Value::Int(i64::from(v))
                }
            }
        )*
    };
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&String> for Value {
    fn from(v: &String) -> Self {
        Value::Text(v.clone())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// The right-hand side of a WHERE/HAVING predicate: a scalar, or a list for `IN`/`NOT IN`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Scalar(Value),
    List(Vec<Value>),
}

macro_rules! impl_scalar_operand {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Operand {
                fn from(v: $t) -> Self {
                    Operand::Scalar(v.into())
                }
            }
        )*
    };
}

impl_scalar_operand!(i8, i16, i32, i64, u8, u16, u32, bool, &str, String, &String, Value);

impl<T: Into<Value>> From<Option<T>> for Operand {
    fn from(v: Option<T>) -> Self {
        Operand::Scalar(v.into())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Operand {
    fn from(v: Vec<T>) -> Self {
        Operand::List(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>, const N: usize> From<[T; N]> for Operand {
    fn from(v: [T; N]) -> Self {
        Operand::List(v.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_types_follow_value_shape() {
        assert_eq!(Value::Null.param_type(), ParamType::Null);
        assert_eq!(Value::from(3_i32).param_type(), ParamType::Int);
        assert_eq!(Value::from(true).param_type(), ParamType::Bool);
        assert_eq!(Value::from("x").param_type(), ParamType::Text);
        assert_eq!(Value::from(None::<i64>), Value::Null);
    }

    #[test]
    fn sanitize_truncates_on_char_boundary() {
        let long = "é".repeat(150);
        let Value::Text(s) = Value::Text(long).sanitized() else {
            panic!("expected text");
        };
        assert!(s.ends_with("..."));
        assert!(s.len() <= MAX_SANITIZED_TEXT + 3);
        assert_eq!(Value::from("short").sanitized(), Value::from("short"));
    }

    #[test]
    fn operands_from_lists() {
        assert_eq!(
            Operand::from(vec![1, 2]),
            Operand::List(vec![Value::Int(1), Value::Int(2)])
        );
        assert_eq!(Operand::from("a"), Operand::Scalar(Value::from("a")));
        assert_eq!(
            serde_json::to_string(&vec![Value::Null, Value::Int(1), Value::from("a")]).unwrap(),
            r#"[null,1,"a"]"#
        );
    }
}
