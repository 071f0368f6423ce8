//! SQL values, column types and comparison options.
//!
//! Every row field is a [`Value`]. Columns declare a [`DataType`] which
//! governs size enforcement and the on-disk encoding. Comparisons go through
//! [`Value::compare`] with an explicit [`CompareOptions`] so that collation
//! never depends on process-wide state.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{EmberError, EmberResult};

/// Options that govern how values are ordered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompareOptions {
    /// Compare strings case-insensitively.
    pub ignore_case: bool,
}

impl CompareOptions {
    /// Options with case-insensitive string comparison.
    #[must_use]
    pub const fn case_insensitive() -> Self {
        Self { ignore_case: true }
    }
}

/// A column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// BOOLEAN.
    Boolean,
    /// 32-bit INTEGER.
    Integer,
    /// 64-bit BIGINT.
    BigInt,
    /// DOUBLE precision float.
    Double,
    /// Fixed length CHAR(n), padded with spaces.
    Char(usize),
    /// VARCHAR(n). A length of zero means unbounded.
    Varchar(usize),
    /// Variable length BINARY.
    Binary,
    /// TIMESTAMP as milliseconds since the epoch.
    Timestamp,
}

impl DataType {
    /// Returns the declared maximum length for character types.
    #[must_use]
    pub const fn max_length(&self) -> Option<usize> {
        match self {
            Self::Char(n) => Some(*n),
            Self::Varchar(n) if *n > 0 => Some(*n),
            _ => None,
        }
    }

    /// Returns true for character types.
    #[must_use]
    pub const fn is_character(&self) -> bool {
        matches!(self, Self::Char(_) | Self::Varchar(_))
    }

    /// Returns a one-byte tag used by the binary row format.
    #[must_use]
    pub const fn tag(&self) -> u8 {
        match self {
            Self::Boolean => 1,
            Self::Integer => 2,
            Self::BigInt => 3,
            Self::Double => 4,
            Self::Char(_) | Self::Varchar(_) => 5,
            Self::Binary => 6,
            Self::Timestamp => 7,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean => write!(f, "BOOLEAN"),
            Self::Integer => write!(f, "INTEGER"),
            Self::BigInt => write!(f, "BIGINT"),
            Self::Double => write!(f, "DOUBLE"),
            Self::Char(n) => write!(f, "CHAR({})", n),
            Self::Varchar(0) => write!(f, "VARCHAR"),
            Self::Varchar(n) => write!(f, "VARCHAR({})", n),
            Self::Binary => write!(f, "BINARY"),
            Self::Timestamp => write!(f, "TIMESTAMP"),
        }
    }
}

/// A single field value.
#[derive(Debug, Clone)]
pub enum Value {
    /// NULL value.
    Null,
    /// Boolean value.
    Boolean(bool),
    /// 32-bit integer.
    Integer(i32),
    /// 64-bit integer.
    BigInt(i64),
    /// 64-bit floating point.
    Double(f64),
    /// Character data.
    String(String),
    /// Binary data.
    Binary(Vec<u8>),
    /// Milliseconds since the epoch.
    Timestamp(i64),
}

impl Value {
    /// Creates a string value.
    pub fn string(v: impl Into<String>) -> Self {
        Value::String(v.into())
    }

    /// Returns true if this value is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Converts this value to an i64.
    pub fn to_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(i64::from(*i)),
            Value::BigInt(i) | Value::Timestamp(i) => Some(*i),
            Value::Double(f) => Some(*f as i64),
            Value::Boolean(b) => Some(i64::from(*b)),
            Value::String(s) => s.trim().parse().ok(),
            Value::Null | Value::Binary(_) => None,
        }
    }

    /// Converts this value to an f64.
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(f64::from(*i)),
            Value::BigInt(i) | Value::Timestamp(i) => Some(*i as f64),
            Value::Double(f) => Some(*f),
            Value::String(s) => s.trim().parse().ok(),
            Value::Null | Value::Boolean(_) | Value::Binary(_) => None,
        }
    }

    /// Returns the string payload, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Converts this value to the representation used by `target`.
    ///
    /// NULL converts to NULL for every type.
    pub fn convert_to(&self, target: &DataType) -> EmberResult<Value> {
        if self.is_null() {
            return Ok(Value::Null);
        }

        let mismatch = || EmberError::TypeMismatch {
            expected: target.to_string(),
            actual: self.type_name().to_string(),
        };

        match target {
            DataType::Boolean => match self {
                Value::Boolean(b) => Ok(Value::Boolean(*b)),
                Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(Value::Boolean(true)),
                Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(Value::Boolean(false)),
                _ => Err(mismatch()),
            },
            DataType::Integer => {
                let v = self.to_i64().ok_or_else(mismatch)?;
                i32::try_from(v).map(Value::Integer).map_err(|_| mismatch())
            }
            DataType::BigInt => self.to_i64().map(Value::BigInt).ok_or_else(mismatch),
            DataType::Timestamp => self.to_i64().map(Value::Timestamp).ok_or_else(mismatch),
            DataType::Double => self.to_f64().map(Value::Double).ok_or_else(mismatch),
            DataType::Char(_) | DataType::Varchar(_) => match self {
                Value::Binary(_) => Err(mismatch()),
                other => Ok(Value::String(other.to_string())),
            },
            DataType::Binary => match self {
                Value::Binary(b) => Ok(Value::Binary(b.clone())),
                _ => Err(mismatch()),
            },
        }
    }

    /// Short type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Boolean(_) => "BOOLEAN",
            Value::Integer(_) => "INTEGER",
            Value::BigInt(_) => "BIGINT",
            Value::Double(_) => "DOUBLE",
            Value::String(_) => "VARCHAR",
            Value::Binary(_) => "BINARY",
            Value::Timestamp(_) => "TIMESTAMP",
        }
    }

    /// Compares two values. NULL sorts before every non-null value.
    pub fn compare(&self, other: &Value, options: &CompareOptions) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,

            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::BigInt(a), Value::BigInt(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Double(a), Value::Double(b)) => a.total_cmp(b),
            (Value::String(a), Value::String(b)) => {
                if options.ignore_case {
                    compare_ignore_case(a, b)
                } else {
                    a.cmp(b)
                }
            }
            (Value::Binary(a), Value::Binary(b)) => a.cmp(b),

            (Value::Integer(a), Value::BigInt(b)) => i64::from(*a).cmp(b),
            (Value::BigInt(a), Value::Integer(b)) => a.cmp(&i64::from(*b)),

            (a, b) => match (a.to_f64(), b.to_f64()) {
                (Some(x), Some(y)) => x.total_cmp(&y),
                _ => a.type_rank().cmp(&b.type_rank()),
            },
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Boolean(_) => 1,
            Value::Integer(_) | Value::BigInt(_) | Value::Double(_) => 2,
            Value::Timestamp(_) => 3,
            Value::String(_) => 4,
            Value::Binary(_) => 5,
        }
    }
}

fn compare_ignore_case(a: &str, b: &str) -> Ordering {
    let mut left = a.chars().flat_map(char::to_uppercase);
    let mut right = b.chars().flat_map(char::to_uppercase);
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => match x.cmp(&y) {
                Ordering::Equal => continue,
                other => return other,
            },
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other, &CompareOptions::default()) == Ordering::Equal
    }
}

impl Eq for Value {}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Boolean(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            Value::Integer(i) => write!(f, "{}", i),
            Value::BigInt(i) => write!(f, "{}", i),
            Value::Double(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "{}", s),
            Value::Binary(b) => {
                for byte in b {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
            Value::Timestamp(t) => write!(f, "{}", t),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_sorts_first() {
        let opts = CompareOptions::default();
        assert_eq!(Value::Null.compare(&Value::Integer(-5), &opts), Ordering::Less);
        assert_eq!(Value::Integer(-5).compare(&Value::Null, &opts), Ordering::Greater);
        assert_eq!(Value::Null.compare(&Value::Null, &opts), Ordering::Equal);
    }

    #[test]
    fn test_cross_width_integers() {
        let opts = CompareOptions::default();
        assert_eq!(Value::Integer(7).compare(&Value::BigInt(7), &opts), Ordering::Equal);
        assert_eq!(Value::BigInt(8).compare(&Value::Integer(7), &opts), Ordering::Greater);
        assert_eq!(Value::Integer(1), Value::BigInt(1));
    }

    #[test]
    fn test_ignore_case() {
        let a = Value::string("apple");
        let b = Value::string("APPLE");
        assert_ne!(a.compare(&b, &CompareOptions::default()), Ordering::Equal);
        assert_eq!(a.compare(&b, &CompareOptions::case_insensitive()), Ordering::Equal);
    }

    #[test]
    fn test_convert() {
        let v = Value::string("42").convert_to(&DataType::Integer).unwrap();
        assert_eq!(v, Value::Integer(42));
        let v = Value::Integer(5).convert_to(&DataType::Varchar(10)).unwrap();
        assert_eq!(v, Value::string("5"));
        assert!(Value::BigInt(i64::MAX).convert_to(&DataType::Integer).is_err());
        assert!(Value::Null.convert_to(&DataType::Binary).unwrap().is_null());
    }

    #[test]
    fn test_data_type_lengths() {
        assert_eq!(DataType::Char(4).max_length(), Some(4));
        assert_eq!(DataType::Varchar(0).max_length(), None);
        assert_eq!(DataType::Varchar(0).to_string(), "VARCHAR");
        assert!(DataType::Char(1).is_character());
        assert!(!DataType::Binary.is_character());
    }
}
