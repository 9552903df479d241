//! Host-side value model and its conversion to and from the wire form.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::{BlobData, RowsFormatter, RowsIterator, RowsOutput};
use crate::error::{ErrorKind, HostError, HostResult};
use crate::protocol::{ObjectType, ObjectValue, VariantValue};

/// Column / argument data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Null,
    Integer,
    Float,
    Boolean,
    String,
    Timestamp,
    Blob,
    Object,
    Dynamic,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::Null => "null",
            DataType::Integer => "integer",
            DataType::Float => "float",
            DataType::Boolean => "boolean",
            DataType::String => "string",
            DataType::Timestamp => "timestamp",
            DataType::Blob => "blob",
            DataType::Object => "object",
            DataType::Dynamic => "any",
        };
        f.write_str(s)
    }
}

impl FromStr for DataType {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "null" | "void" => Ok(DataType::Null),
            "integer" | "int" | "int64" | "bigint" => Ok(DataType::Integer),
            "float" | "double" | "real" | "numeric" => Ok(DataType::Float),
            "boolean" | "bool" => Ok(DataType::Boolean),
            "string" | "text" | "varchar" => Ok(DataType::String),
            "timestamp" | "datetime" => Ok(DataType::Timestamp),
            "blob" | "bytes" => Ok(DataType::Blob),
            "object" => Ok(DataType::Object),
            "any" | "dynamic" => Ok(DataType::Dynamic),
            other => Err(HostError::data(
                ErrorKind::CannotCast,
                format!("unknown data type '{other}'"),
            )),
        }
    }
}

/// An opaque object value held by the host.
#[derive(Clone)]
pub enum HostObject {
    RowsIterator(Arc<dyn RowsIterator>),
    RowsOutput(Arc<dyn RowsOutput>),
    RowsFormatter(Arc<dyn RowsFormatter>),
    Blob(Arc<dyn BlobData>),
}

impl HostObject {
    pub fn object_type(&self) -> ObjectType {
        match self {
            HostObject::RowsIterator(_) => ObjectType::RowsIterator,
            HostObject::RowsOutput(_) => ObjectType::RowsOutput,
            HostObject::RowsFormatter(_) => ObjectType::RowsFormatter,
            HostObject::Blob(_) => ObjectType::Blob,
        }
    }

    /// Plugin-side handle if this object is a proxy of a remote object.
    pub fn remote_handle(&self) -> Option<i32> {
        match self {
            HostObject::RowsIterator(o) => o.remote_handle(),
            HostObject::RowsOutput(o) => o.remote_handle(),
            HostObject::RowsFormatter(o) => o.remote_handle(),
            HostObject::Blob(o) => o.remote_handle(),
        }
    }

    fn ptr_eq(&self, other: &HostObject) -> bool {
        match (self, other) {
            (HostObject::RowsIterator(a), HostObject::RowsIterator(b)) => Arc::ptr_eq(a, b),
            (HostObject::RowsOutput(a), HostObject::RowsOutput(b)) => Arc::ptr_eq(a, b),
            (HostObject::RowsFormatter(a), HostObject::RowsFormatter(b)) => Arc::ptr_eq(a, b),
            (HostObject::Blob(a), HostObject::Blob(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostObject")
            .field("type", &self.object_type())
            .field("handle", &self.remote_handle())
            .finish()
    }
}

/// Host-native value.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Boolean(bool),
    String(String),
    Timestamp(DateTime<Utc>),
    Blob(Vec<u8>),
    Object(HostObject),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Value::Null => DataType::Null,
            Value::Integer(_) => DataType::Integer,
            Value::Float(_) => DataType::Float,
            Value::Boolean(_) => DataType::Boolean,
            Value::String(_) => DataType::String,
            Value::Timestamp(_) => DataType::Timestamp,
            Value::Blob(_) => DataType::Blob,
            Value::Object(_) => DataType::Object,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&HostObject> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    /// Convert a scalar wire value. Objects need a plugin context to
    /// materialize and are rejected here.
    pub fn from_wire(value: VariantValue) -> HostResult<Value> {
        Ok(match value {
            VariantValue::Null => Value::Null,
            VariantValue::Integer(v) => Value::Integer(v),
            VariantValue::Float(v) => Value::Float(v),
            VariantValue::Boolean(v) => Value::Boolean(v),
            VariantValue::String(v) => Value::String(v),
            VariantValue::Timestamp(micros) => {
                let ts = DateTime::<Utc>::from_timestamp_micros(micros).ok_or_else(|| {
                    HostError::data(ErrorKind::CannotCast, format!("timestamp out of range: {micros}"))
                })?;
                Value::Timestamp(ts)
            }
            VariantValue::Blob(bytes) => Value::Blob(bytes),
            VariantValue::Object(o) => {
                return Err(HostError::data(
                    ErrorKind::CannotCast,
                    format!("remote object {:?}#{} has no owning plugin", o.kind, o.handle),
                ))
            }
        })
    }

    /// Convert to the wire form. Only remote-backed objects can cross.
    pub fn to_wire(&self) -> HostResult<VariantValue> {
        Ok(match self {
            Value::Null => VariantValue::Null,
            Value::Integer(v) => VariantValue::Integer(*v),
            Value::Float(v) => VariantValue::Float(*v),
            Value::Boolean(v) => VariantValue::Boolean(*v),
            Value::String(v) => VariantValue::String(v.clone()),
            Value::Timestamp(ts) => VariantValue::Timestamp(ts.timestamp_micros()),
            Value::Blob(bytes) => VariantValue::Blob(bytes.clone()),
            Value::Object(o) => {
                let handle = o.remote_handle().ok_or_else(|| {
                    HostError::data(
                        ErrorKind::CannotCast,
                        format!("local {:?} object cannot be sent to a plugin", o.object_type()),
                    )
                })?;
                VariantValue::Object(ObjectValue {
                    kind: o.object_type(),
                    handle,
                    name: String::new(),
                })
            }
        })
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            (Value::Blob(a), Value::Blob(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}
