//! Runtime values

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};

/// A value held in a register
///
/// Values are immutable and cheap to clone; tuples share their storage. They
/// are hashable so they can key green keys and promotion caches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Nil,
    Int(i64),
    Tuple(Arc<[Value]>),
}

impl Value {
    /// Build a tuple value
    pub fn tuple(fields: Vec<Value>) -> Self {
        Value::Tuple(fields.into())
    }

    pub fn from_bool(b: bool) -> Self {
        Value::Int(b as i64)
    }

    /// Truthiness used by branches: `nil` and `0` are false
    pub fn truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Int(n) => *n != 0,
            Value::Tuple(_) => true,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Int(_) => "int",
            Value::Tuple(_) => "tuple",
        }
    }

    /// Read a tuple field
    pub fn field(&self, index: usize) -> Result<Value> {
        match self {
            Value::Tuple(fields) => fields.get(index).cloned().ok_or_else(|| {
                Error::index_error(format!(
                    "field {} out of range for tuple of {}",
                    index,
                    fields.len()
                ))
            }),
            other => Err(Error::type_error(format!(
                "cannot read field {} of {}",
                index,
                other.type_name()
            ))),
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Int(n) => write!(f, "{}", n),
            Value::Tuple(fields) => {
                write!(f, "(")?;
                for (i, field) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", field)?;
                }
                write!(f, ")")
            }
        }
    }
}
