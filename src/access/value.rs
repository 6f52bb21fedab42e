use std::fmt;

use serde::{Deserialize, Serialize};

/// Type tag of a [`Value`]. Values of different types order by tag.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DataType {
    Null = 0,
    Boolean = 1,
    Integer = 2,
    Float = 3,
    DateTime = 4,
    String = 5,
}

impl DataType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(DataType::Null),
            1 => Some(DataType::Boolean),
            2 => Some(DataType::Integer),
            3 => Some(DataType::Float),
            4 => Some(DataType::DateTime),
            5 => Some(DataType::String),
            _ => None,
        }
    }
}

/// A typed key component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    /// Microseconds since the Unix epoch.
    DateTime(i64),
    String(String),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Null => DataType::Null,
            Value::Boolean(_) => DataType::Boolean,
            Value::Integer(_) => DataType::Integer,
            Value::Float(_) => DataType::Float,
            Value::DateTime(_) => DataType::DateTime,
            Value::String(_) => DataType::String,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::DateTime(micros) => write!(f, "@{}us", micros),
            Value::String(s) => write!(f, "'{}'", s),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Boolean(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Integer(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

/// An encoded record: opaque bytes with a known length.
///
/// Collections store whatever a `ValueBuffer` yields without looking inside.
pub trait ValueBuffer {
    fn as_bytes(&self) -> &[u8];

    fn len(&self) -> usize {
        self.as_bytes().len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ValueBuffer for [u8] {
    fn as_bytes(&self) -> &[u8] {
        self
    }
}

impl ValueBuffer for Vec<u8> {
    fn as_bytes(&self) -> &[u8] {
        self.as_slice()
    }
}

impl<const N: usize> ValueBuffer for [u8; N] {
    fn as_bytes(&self) -> &[u8] {
        self.as_slice()
    }
}

impl ValueBuffer for str {
    fn as_bytes(&self) -> &[u8] {
        str::as_bytes(self)
    }
}

impl ValueBuffer for String {
    fn as_bytes(&self) -> &[u8] {
        String::as_bytes(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn length<V: ValueBuffer + ?Sized>(value: &V) -> usize {
        ValueBuffer::len(value)
    }

    #[test]
    fn test_value_data_type() {
        assert_eq!(Value::Null.data_type(), DataType::Null);
        assert_eq!(Value::from(3i64).data_type(), DataType::Integer);
        assert_eq!(Value::from("x").data_type(), DataType::String);
        assert_eq!(DataType::from_u8(4), Some(DataType::DateTime));
        assert_eq!(DataType::from_u8(9), None);
        assert!(DataType::Boolean < DataType::String);
    }

    #[test]
    fn test_value_buffer_impls() {
        assert_eq!(length(&b"abc"[..]), 3);
        assert_eq!(length(&vec![1u8, 2]), 2);
        assert_eq!(length(b"four"), 4);
        assert_eq!(length("hé"), 3);
        assert!(ValueBuffer::is_empty(&String::new()));
    }
}
