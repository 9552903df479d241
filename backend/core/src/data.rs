//! Data-access interfaces the query engine consumes.
//!
//! Remote proxies in `tether-plugins` implement these so that a rows set or
//! blob living in a plugin process looks like any other local source.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, HostError, HostResult};
use crate::protocol::{ContextQueryInfo, WireColumn, WireKeyColumn};
use crate::value::{DataType, Value};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Column {
    pub name: String,
    pub data_type: DataType,
    #[serde(default)]
    pub description: String,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            description: String::new(),
        }
    }

    pub fn from_wire(column: WireColumn) -> HostResult<Self> {
        Ok(Self {
            data_type: column.data_type.parse()?,
            name: column.name,
            description: column.description,
        })
    }

    pub fn to_wire(&self) -> WireColumn {
        WireColumn {
            name: self.name.clone(),
            data_type: self.data_type.to_string(),
            description: self.description.clone(),
        }
    }
}

/// Predicate operation usable for key column pushdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompareOperation {
    Equals,
    NotEquals,
    Greater,
    GreaterOrEquals,
    Less,
    LessOrEquals,
    Like,
    NotLike,
    In,
    IsNull,
    IsNotNull,
}

impl CompareOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            CompareOperation::Equals => "Equals",
            CompareOperation::NotEquals => "NotEquals",
            CompareOperation::Greater => "Greater",
            CompareOperation::GreaterOrEquals => "GreaterOrEquals",
            CompareOperation::Less => "Less",
            CompareOperation::LessOrEquals => "LessOrEquals",
            CompareOperation::Like => "Like",
            CompareOperation::NotLike => "NotLike",
            CompareOperation::In => "In",
            CompareOperation::IsNull => "IsNull",
            CompareOperation::IsNotNull => "IsNotNull",
        }
    }
}

impl fmt::Display for CompareOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompareOperation {
    type Err = HostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let op = match s {
            "Equals" => CompareOperation::Equals,
            "NotEquals" => CompareOperation::NotEquals,
            "Greater" => CompareOperation::Greater,
            "GreaterOrEquals" => CompareOperation::GreaterOrEquals,
            "Less" => CompareOperation::Less,
            "LessOrEquals" => CompareOperation::LessOrEquals,
            "Like" => CompareOperation::Like,
            "NotLike" => CompareOperation::NotLike,
            "In" => CompareOperation::In,
            "IsNull" => CompareOperation::IsNull,
            "IsNotNull" => CompareOperation::IsNotNull,
            other => {
                return Err(HostError::data(
                    ErrorKind::InvalidArguments,
                    format!("unknown compare operation '{other}'"),
                ))
            }
        };
        Ok(op)
    }
}

/// A column the source can filter on before rows are produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyColumn {
    pub name: String,
    pub is_required: bool,
    pub operations: Vec<CompareOperation>,
}

impl KeyColumn {
    /// Unknown operation names are skipped.
    pub fn from_wire(column: WireKeyColumn) -> Self {
        Self {
            name: column.name,
            is_required: column.is_required,
            operations: column
                .operations
                .iter()
                .filter_map(|op| op.parse().ok())
                .collect(),
        }
    }
}

/// Query information the engine attaches to a source or sink.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct QueryContextInfo {
    pub columns: Vec<Column>,
    pub limit: Option<u64>,
    pub offset: u64,
    /// Rows to fetch per round trip; `0` lets the reader pick.
    pub preread_count: usize,
}

impl QueryContextInfo {
    pub fn to_wire(&self) -> ContextQueryInfo {
        ContextQueryInfo {
            columns: self.columns.iter().map(Column::to_wire).collect(),
            limit: self
                .limit
                .map(|l| i64::try_from(l).unwrap_or(i64::MAX))
                .unwrap_or(-1),
            offset: i64::try_from(self.offset).unwrap_or(i64::MAX),
            preread_count: i32::try_from(self.preread_count).unwrap_or(i32::MAX),
        }
    }
}

fn not_supported(what: &str) -> HostError {
    HostError::data(ErrorKind::NotSupported, format!("{what} is not supported"))
}

/// Forward-only row source.
#[async_trait]
pub trait RowsIterator: Send + Sync {
    fn columns(&self) -> Vec<Column>;

    async fn open(&self) -> HostResult<()>;

    async fn close(&self) -> HostResult<()>;

    async fn reset(&self) -> HostResult<()>;

    /// Advance to the next row; `false` once the source is exhausted.
    async fn read_next(&self) -> HostResult<bool>;

    /// Value of the current row at `column_index`.
    fn read_value(&self, column_index: usize) -> HostResult<Value>;

    async fn key_columns(&self) -> HostResult<Vec<KeyColumn>> {
        Ok(Vec::new())
    }

    async fn set_key_column_value(
        &self,
        _column: &str,
        _operation: CompareOperation,
        _value: Value,
    ) -> HostResult<()> {
        Err(not_supported("key column filtering"))
    }

    async fn unset_key_column_value(
        &self,
        _column: &str,
        _operation: CompareOperation,
    ) -> HostResult<()> {
        Err(not_supported("key column filtering"))
    }

    async fn update_value(&self, _column_index: usize, _value: Value) -> HostResult<()> {
        Err(not_supported("update"))
    }

    async fn delete_row(&self) -> HostResult<()> {
        Err(not_supported("delete"))
    }

    async fn position(&self) -> HostResult<i64> {
        Err(not_supported("position"))
    }

    async fn total_rows(&self) -> HostResult<Option<i64>> {
        Ok(None)
    }

    async fn unique_key(&self) -> HostResult<Vec<String>> {
        Ok(Vec::new())
    }

    fn set_query_context(&self, context: QueryContextInfo);

    /// Plugin-side handle for proxies, `None` for local sources.
    fn remote_handle(&self) -> Option<i32> {
        None
    }
}

/// Row sink.
#[async_trait]
pub trait RowsOutput: Send + Sync {
    async fn open(&self) -> HostResult<()>;

    async fn close(&self) -> HostResult<()>;

    async fn reset(&self) -> HostResult<()>;

    async fn write_values(&self, values: &[Value]) -> HostResult<()>;

    fn set_query_context(&self, context: QueryContextInfo);

    fn remote_handle(&self) -> Option<i32> {
        None
    }
}

/// Turns blobs into rows and back.
#[async_trait]
pub trait RowsFormatter: Send + Sync {
    async fn open_input(
        &self,
        blob: Arc<dyn BlobData>,
        key: Option<&str>,
    ) -> HostResult<Arc<dyn RowsIterator>>;

    async fn open_output(&self, blob: Arc<dyn BlobData>) -> HostResult<Arc<dyn RowsOutput>>;

    fn remote_handle(&self) -> Option<i32> {
        None
    }
}

/// Random-access binary data.
#[async_trait]
pub trait BlobData: Send + Sync {
    async fn length(&self) -> HostResult<u64>;

    /// Up to `count` bytes starting at `offset`; empty at end of data.
    async fn read_range(&self, offset: u64, count: usize) -> HostResult<Vec<u8>>;

    async fn write(&self, bytes: &[u8]) -> HostResult<usize>;

    fn remote_handle(&self) -> Option<i32> {
        None
    }
}
