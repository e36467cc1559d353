use std::fmt;

use serde::{Deserialize, Serialize};

/// A single column value as seen by the harness.
///
/// Engines report `balance` as a fixed-point `DECIMAL`, scripts write plain
/// integers, so comparison between values goes through [`Value::matches`],
/// which is numeric-aware, rather than through `==`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// SQL `NULL`.
    Null,
    /// Any integer column.
    Int(i64),
    /// `FLOAT` / `DOUBLE` columns.
    Float(f64),
    /// Fixed-point columns, kept in the engine's textual form (`"9999.00"`).
    Decimal(String),
    /// Character columns.
    Text(String),
}

impl Value {
    /// Returns the value as an `f64` if it is numeric.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use isoscope::prelude::*;
    ///
    /// assert_eq!(Value::Decimal("9999.00".to_string()).as_f64(), Some(9999.0));
    /// assert_eq!(Value::Int(7).as_f64(), Some(7.0));
    /// assert_eq!(Value::Text("Alice".to_string()).as_f64(), None);
    /// ```
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Decimal(d) => d.trim().parse::<f64>().ok(),
            Value::Null | Value::Text(_) => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Compares two values the way an assertion should.
    ///
    /// Numeric values are compared by magnitude regardless of representation,
    /// text by content, and `Null` only matches `Null`.
    pub fn matches(&self, other: &Value) -> bool {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => (a - b).abs() < 1e-9,
            _ => match (self, other) {
                (Value::Null, Value::Null) => true,
                (Value::Text(a), Value::Text(b)) => a == b,
                (Value::Decimal(a), Value::Text(b)) | (Value::Text(b), Value::Decimal(a)) => {
                    a == b
                }
                _ => false,
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Decimal(d) => f.write_str(d),
            Value::Text(s) => write!(f, "'{}'", s),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}
