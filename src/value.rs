//! Values flowing between atoms.
//!
//! Most atom outputs are plain data and are carried as [`serde_json::Value`],
//! which gives a canonical encoding for memoization hashes (object keys are
//! kept sorted). Values that cannot be serialized (handles, connections,
//! closures) travel as [`AtomValue::Opaque`] and are hashed by identity.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{FlowError, Result};

#[derive(Clone)]
pub enum AtomValue {
    Data(Value),
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl AtomValue {
    pub fn null() -> Self {
        AtomValue::Data(Value::Null)
    }

    pub fn serialize<T: Serialize>(value: &T) -> Result<Self> {
        serde_json::to_value(value)
            .map(AtomValue::Data)
            .map_err(|e| FlowError::Serialization(e.to_string()))
    }

    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        match self {
            AtomValue::Data(value) => serde_json::from_value(value.clone())
                .map_err(|e| FlowError::Serialization(e.to_string())),
            AtomValue::Opaque(_) => Err(FlowError::Serialization(
                "opaque value cannot be deserialized".to_string(),
            )),
        }
    }

    pub fn opaque<T: Any + Send + Sync>(value: T) -> Self {
        AtomValue::Opaque(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self {
            AtomValue::Opaque(inner) => inner.downcast_ref::<T>(),
            AtomValue::Data(_) => None,
        }
    }

    pub fn as_data(&self) -> Option<&Value> {
        match self {
            AtomValue::Data(value) => Some(value),
            AtomValue::Opaque(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.as_data().and_then(Value::as_i64)
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.as_data().and_then(Value::as_f64)
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_data().and_then(Value::as_str)
    }

    pub fn is_opaque(&self) -> bool {
        matches!(self, AtomValue::Opaque(_))
    }

    /// SHA-256 over the canonical JSON encoding.
    pub fn content_hash(&self) -> Result<String> {
        match self {
            AtomValue::Data(value) => {
                let encoded = serde_json::to_vec(value)
                    .map_err(|e| FlowError::Serialization(e.to_string()))?;
                Ok(hex_digest(&encoded))
            }
            AtomValue::Opaque(_) => Err(FlowError::Serialization(
                "opaque value has no canonical encoding".to_string(),
            )),
        }
    }

    /// Hash of the value's identity. Only stable for as long as the
    /// allocation lives, so atoms depending on it always recompute.
    pub fn identity_hash(&self) -> String {
        match self {
            AtomValue::Opaque(inner) => {
                format!("id:{:p}", Arc::as_ptr(inner) as *const ())
            }
            AtomValue::Data(value) => format!("id:{:p}", value as *const Value),
        }
    }
}

pub(crate) fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

impl Default for AtomValue {
    fn default() -> Self {
        AtomValue::null()
    }
}

impl PartialEq for AtomValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (AtomValue::Data(a), AtomValue::Data(b)) => a == b,
            (AtomValue::Opaque(a), AtomValue::Opaque(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for AtomValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AtomValue::Data(value) => write!(f, "Data({})", value),
            AtomValue::Opaque(_) => write!(f, "Opaque(..)"),
        }
    }
}

impl fmt::Display for AtomValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AtomValue::Data(Value::String(s)) => f.write_str(s),
            AtomValue::Data(value) => write!(f, "{}", value),
            AtomValue::Opaque(_) => f.write_str("<opaque>"),
        }
    }
}

impl From<Value> for AtomValue {
    fn from(value: Value) -> Self {
        AtomValue::Data(value)
    }
}

impl From<i64> for AtomValue {
    fn from(value: i64) -> Self {
        AtomValue::Data(Value::from(value))
    }
}

impl From<i32> for AtomValue {
    fn from(value: i32) -> Self {
        AtomValue::Data(Value::from(value))
    }
}

impl From<f64> for AtomValue {
    fn from(value: f64) -> Self {
        // serde_json maps non-finite floats to null
        AtomValue::Data(Value::from(value))
    }
}

impl From<bool> for AtomValue {
    fn from(value: bool) -> Self {
        AtomValue::Data(Value::Bool(value))
    }
}

impl From<&str> for AtomValue {
    fn from(value: &str) -> Self {
        AtomValue::Data(Value::String(value.to_string()))
    }
}

impl From<String> for AtomValue {
    fn from(value: String) -> Self {
        AtomValue::Data(Value::String(value))
    }
}
