//! Wire protocol shared by the host and its plugins.
//!
//! Two logical services are multiplexed over one endpoint. The host serves
//! [`MANAGER_SERVICE`] (plugins call into it) and every plugin serves
//! [`PLUGIN_SERVICE`] on its callback endpoint (the host calls into it).
//! Bodies are tagged as `{ "method": ..., "params": ... }`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::PluginException;

/// Service name of the host-side plugins manager.
pub const MANAGER_SERVICE: &str = "PluginsManager";

/// Service name every plugin serves on its callback endpoint.
pub const PLUGIN_SERVICE: &str = "Plugin";

/// Handle value meaning "no object context".
pub const NO_OBJECT_HANDLE: i32 = -1;

/// Request envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub seq: u64,
    pub service: String,
    pub body: serde_json::Value,
}

/// Response envelope; `seq` echoes the request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub seq: u64,
    pub result: RpcResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RpcResult {
    Ok(serde_json::Value),
    Err(PluginException),
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// Kind of a remote object referenced by handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectType {
    Generic,
    RowsInput,
    RowsIterator,
    RowsOutput,
    RowsFormatter,
    Blob,
}

/// Reference to an object living in the plugin process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectValue {
    pub kind: ObjectType,
    pub handle: i32,
    #[serde(default)]
    pub name: String,
}

/// Value representation on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum VariantValue {
    Null,
    Integer(i64),
    Float(f64),
    Boolean(bool),
    String(String),
    /// Microseconds since the Unix epoch.
    Timestamp(i64),
    Blob(#[serde(with = "base64_bytes")] Vec<u8>),
    Object(ObjectValue),
}

impl VariantValue {
    pub fn as_object(&self) -> Option<&ObjectValue> {
        match self {
            VariantValue::Object(o) => Some(o),
            _ => None,
        }
    }
}

/// Serde adapter encoding bytes as a base64 string.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Registration
// ---------------------------------------------------------------------------

/// A function advertised by a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginFunction {
    /// Signature such as `add(a: integer, b: integer): integer`.
    pub signature: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_safe: bool,
    #[serde(default)]
    pub is_aggregate: bool,
    #[serde(default)]
    pub formatter_ids: Vec<String>,
}

impl PluginFunction {
    pub fn new(signature: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            signature: signature.into(),
            description: description.into(),
            is_safe: false,
            is_aggregate: false,
            formatter_ids: Vec::new(),
        }
    }

    /// Function name: the signature up to the opening parenthesis.
    pub fn name(&self) -> &str {
        function_name(&self.signature)
    }
}

/// Extract the bare name from a function signature.
pub fn function_name(signature: &str) -> &str {
    let end = signature.find('(').unwrap_or(signature.len());
    signature[..end].trim()
}

/// Payload a plugin sends when registering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginData {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub functions: Vec<PluginFunction>,
}

/// Acknowledgement returned to a registered plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResult {
    pub host_version: String,
    pub min_log_level: LogLevel,
}

/// Log level used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Trace,
    Debug,
    Information,
    Warning,
    Error,
    Critical,
    None,
}

impl LogLevel {
    pub fn as_arg(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Information => "information",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
            LogLevel::Critical => "critical",
            LogLevel::None => "none",
        }
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// Column description as sent by plugins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireColumn {
    pub name: String,
    pub data_type: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireKeyColumn {
    pub name: String,
    #[serde(default)]
    pub is_required: bool,
    #[serde(default)]
    pub operations: Vec<String>,
}

/// Query context pushed to a plugin before reads and writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextQueryInfo {
    pub columns: Vec<WireColumn>,
    /// `-1` means no limit.
    pub limit: i64,
    pub offset: i64,
    pub preread_count: i32,
}

/// A batch of rows; values are flattened row by row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowsList {
    pub values: Vec<VariantValue>,
    pub has_more: bool,
}

// ---------------------------------------------------------------------------
// Calls
// ---------------------------------------------------------------------------

/// Calls a plugin makes into the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum ManagerCall {
    RegisterPlugin {
        auth_token: String,
        callback_uri: String,
        plugin_data: Option<PluginData>,
    },
    CallFunction {
        function_name: String,
        args: Vec<VariantValue>,
        object_handle: i32,
    },
    RunQuery {
        query: String,
        #[serde(default)]
        parameters: HashMap<String, VariantValue>,
    },
    GetConfigValue {
        key: String,
    },
    SetConfigValue {
        key: String,
        value: VariantValue,
    },
    Log {
        level: LogLevel,
        message: String,
        #[serde(default)]
        arguments: Vec<String>,
    },
}

/// Calls the host makes into a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum PluginCall {
    CallFunction {
        function_name: String,
        args: Vec<VariantValue>,
        object_handle: i32,
    },
    Shutdown,
    #[serde(rename = "RowsSet_Open")]
    RowsSetOpen { handle: i32 },
    #[serde(rename = "RowsSet_Close")]
    RowsSetClose { handle: i32 },
    #[serde(rename = "RowsSet_Reset")]
    RowsSetReset { handle: i32 },
    #[serde(rename = "RowsSet_GetColumns")]
    RowsSetGetColumns { handle: i32 },
    #[serde(rename = "RowsSet_GetUniqueKey")]
    RowsSetGetUniqueKey { handle: i32 },
    #[serde(rename = "RowsSet_Position")]
    RowsSetPosition { handle: i32 },
    #[serde(rename = "RowsSet_TotalRows")]
    RowsSetTotalRows { handle: i32 },
    #[serde(rename = "RowsSet_SetContext")]
    RowsSetSetContext {
        handle: i32,
        context: ContextQueryInfo,
    },
    #[serde(rename = "RowsSet_GetRows")]
    RowsSetGetRows { handle: i32, count: i32 },
    #[serde(rename = "RowsSet_GetKeyColumns")]
    RowsSetGetKeyColumns { handle: i32 },
    #[serde(rename = "RowsSet_SetKeyColumnValue")]
    RowsSetSetKeyColumnValue {
        handle: i32,
        column_name: String,
        operation: String,
        value: VariantValue,
    },
    #[serde(rename = "RowsSet_UnsetKeyColumnValue")]
    RowsSetUnsetKeyColumnValue {
        handle: i32,
        column_name: String,
        operation: String,
    },
    #[serde(rename = "RowsSet_UpdateValue")]
    RowsSetUpdateValue {
        handle: i32,
        column_index: i32,
        value: VariantValue,
    },
    #[serde(rename = "RowsSet_DeleteRow")]
    RowsSetDeleteRow { handle: i32 },
    #[serde(rename = "RowsSet_WriteValues")]
    RowsSetWriteValues {
        handle: i32,
        values: Vec<VariantValue>,
    },
    #[serde(rename = "RowsFormatter_OpenInput")]
    RowsFormatterOpenInput {
        handle: i32,
        blob_handle: i32,
        key: Option<String>,
    },
    #[serde(rename = "RowsFormatter_OpenOutput")]
    RowsFormatterOpenOutput { handle: i32, blob_handle: i32 },
    #[serde(rename = "Blob_GetLength")]
    BlobGetLength { handle: i32 },
    #[serde(rename = "Blob_Read")]
    BlobRead { handle: i32, offset: i64, count: i32 },
    #[serde(rename = "Blob_Write")]
    BlobWrite {
        handle: i32,
        #[serde(with = "base64_bytes")]
        bytes: Vec<u8>,
    },
}

impl PluginCall {
    /// Method name as it appears on the wire.
    pub fn method(&self) -> &'static str {
        match self {
            PluginCall::CallFunction { .. } => "CallFunction",
            PluginCall::Shutdown => "Shutdown",
            PluginCall::RowsSetOpen { .. } => "RowsSet_Open",
            PluginCall::RowsSetClose { .. } => "RowsSet_Close",
            PluginCall::RowsSetReset { .. } => "RowsSet_Reset",
            PluginCall::RowsSetGetColumns { .. } => "RowsSet_GetColumns",
            PluginCall::RowsSetGetUniqueKey { .. } => "RowsSet_GetUniqueKey",
            PluginCall::RowsSetPosition { .. } => "RowsSet_Position",
            PluginCall::RowsSetTotalRows { .. } => "RowsSet_TotalRows",
            PluginCall::RowsSetSetContext { .. } => "RowsSet_SetContext",
            PluginCall::RowsSetGetRows { .. } => "RowsSet_GetRows",
            PluginCall::RowsSetGetKeyColumns { .. } => "RowsSet_GetKeyColumns",
            PluginCall::RowsSetSetKeyColumnValue { .. } => "RowsSet_SetKeyColumnValue",
            PluginCall::RowsSetUnsetKeyColumnValue { .. } => "RowsSet_UnsetKeyColumnValue",
            PluginCall::RowsSetUpdateValue { .. } => "RowsSet_UpdateValue",
            PluginCall::RowsSetDeleteRow { .. } => "RowsSet_DeleteRow",
            PluginCall::RowsSetWriteValues { .. } => "RowsSet_WriteValues",
            PluginCall::RowsFormatterOpenInput { .. } => "RowsFormatter_OpenInput",
            PluginCall::RowsFormatterOpenOutput { .. } => "RowsFormatter_OpenOutput",
            PluginCall::BlobGetLength { .. } => "Blob_GetLength",
            PluginCall::BlobRead { .. } => "Blob_Read",
            PluginCall::BlobWrite { .. } => "Blob_Write",
        }
    }
}
