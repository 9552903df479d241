//! A fake plugin process for tests: serves the plugin-side service over a
//! real socket and records every call it receives.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Value as Json, json};
use tether_core::protocol::{
    MANAGER_SERVICE, ManagerCall, ObjectType, ObjectValue, PLUGIN_SERVICE, PluginCall, PluginData,
    PluginFunction, RegistrationResult, RowsList, RpcRequest, RpcResponse, RpcResult,
    VariantValue, WireColumn, WireKeyColumn,
};
use tether_core::{BlobData, ErrorKind, HostResult, PluginException};
use tokio_util::sync::CancellationToken;

use crate::context::PluginContext;
use crate::objects::ObjectStorage;
use crate::remote::RemoteLink;
use crate::rpc::RpcClient;
use crate::rpc::framing::{read_message, write_message};
use crate::session::SessionPool;
use crate::transport::{Connection, Endpoint};

/// Handle of the rows set returned by the fake `rows()` function.
pub const ROWS_FUNCTION_HANDLE: i32 = 42;

/// Rows served under one handle.
#[derive(Clone)]
pub struct FakeRows {
    columns: Vec<(String, String)>,
    rows: Vec<Vec<VariantValue>>,
    key_columns: Vec<WireKeyColumn>,
    known_total: bool,
    position: usize,
}

impl FakeRows {
    pub fn new(columns: Vec<(&str, &str)>, rows: Vec<Vec<VariantValue>>) -> Self {
        Self {
            columns: columns
                .into_iter()
                .map(|(n, t)| (n.to_string(), t.to_string()))
                .collect(),
            rows,
            key_columns: Vec::new(),
            known_total: true,
            position: 0,
        }
    }

    pub fn with_key_column(mut self, name: &str, operations: &[&str]) -> Self {
        self.key_columns.push(WireKeyColumn {
            name: name.to_string(),
            is_required: false,
            operations: operations.iter().map(|s| s.to_string()).collect(),
        });
        self
    }

    pub fn with_unknown_total(mut self) -> Self {
        self.known_total = false;
        self
    }
}

#[derive(Default)]
struct FakeState {
    calls: Vec<PluginCall>,
    rows: HashMap<i32, FakeRows>,
    blobs: HashMap<i32, Vec<u8>>,
    formatter_result: i32,
    drop_next: bool,
    stall_next: bool,
}

enum Reply {
    Answer(Result<Json, PluginException>),
    Drop,
    Stall,
}

pub struct FakePlugin {
    endpoint: Endpoint,
    state: Arc<Mutex<FakeState>>,
    shutdown: CancellationToken,
    storage: Arc<ObjectStorage>,
    pool: Arc<SessionPool>,
}

impl FakePlugin {
    pub async fn start() -> Self {
        let listener = Endpoint::generate().bind().await.expect("bind fake plugin");
        let endpoint = listener.local_endpoint().expect("fake plugin endpoint");
        let state = Arc::new(Mutex::new(FakeState::default()));
        let shutdown = CancellationToken::new();

        let accept_state = Arc::clone(&state);
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let connection = tokio::select! {
                    _ = accept_shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(connection) => connection,
                        Err(_) => break,
                    },
                };
                let state = Arc::clone(&accept_state);
                let shutdown = accept_shutdown.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = serve(connection, state) => {}
                    }
                });
            }
        });

        let pool = Arc::new(SessionPool::new("fake", endpoint.clone(), 4, false));
        Self {
            endpoint,
            state,
            shutdown,
            storage: Arc::new(ObjectStorage::new()),
            pool,
        }
    }

    /// Functions the fake advertises when registering.
    pub fn functions() -> Vec<PluginFunction> {
        vec![
            PluginFunction::new("add(a: integer, b: integer): integer", "Adds two numbers"),
            PluginFunction::new("rows(): object", "Returns a rows set"),
        ]
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn add_rows(&self, handle: i32, rows: FakeRows) {
        self.state().rows.insert(handle, rows);
    }

    pub fn remove_rows(&self, handle: i32) {
        self.state().rows.remove(&handle);
    }

    pub fn add_blob(&self, handle: i32, content: Vec<u8>) {
        self.state().blobs.insert(handle, content);
    }

    /// Handle returned by the formatter open calls.
    pub fn set_formatter_result(&self, handle: i32) {
        self.state().formatter_result = handle;
    }

    /// Close the connection instead of answering the next call.
    pub fn drop_next_call(&self) {
        self.state().drop_next = true;
    }

    /// Never answer the next call.
    pub fn stall_next_call(&self) {
        self.state().stall_next = true;
    }

    pub fn calls(&self) -> Vec<PluginCall> {
        self.state().calls.clone()
    }

    /// Whether the host sent `Shutdown`.
    pub fn was_shut_down(&self) -> bool {
        self.state()
            .calls
            .iter()
            .any(|c| matches!(c, PluginCall::Shutdown))
    }

    /// Calls addressed to the object `handle`.
    pub fn calls_for(&self, handle: i32) -> Vec<PluginCall> {
        self.state()
            .calls
            .iter()
            .filter(|c| object_handle(c) == Some(handle))
            .cloned()
            .collect()
    }

    pub fn storage(&self) -> Arc<ObjectStorage> {
        Arc::clone(&self.storage)
    }

    /// Link for proxies built directly in tests.
    pub fn link(&self) -> RemoteLink {
        RemoteLink::new("fake", Arc::clone(&self.pool), &self.storage, CancellationToken::new())
    }

    /// A context as the server would build it on registration.
    pub fn context(&self) -> Arc<PluginContext> {
        let sessions = Arc::new(SessionPool::new("fake", self.endpoint.clone(), 4, false));
        Arc::new(PluginContext::new(plugin_data(Self::functions()), sessions))
    }

    /// Register with a host listening on `host`, like a started plugin would.
    pub async fn register_with(&self, host: &Endpoint, token: &str) -> HostResult<RegistrationResult> {
        let mut client = RpcClient::connect(host).await?;
        let call = register_payload(token, self, Some(Self::functions()));
        client
            .call(MANAGER_SERVICE, &call, &CancellationToken::new())
            .await
    }
}

impl Drop for FakePlugin {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn plugin_data(functions: Vec<PluginFunction>) -> PluginData {
    PluginData {
        name: "fake".into(),
        version: "1.0.0".into(),
        functions,
    }
}

/// `RegisterPlugin` call pointing back at `plugin`.
pub fn register_payload(
    token: &str,
    plugin: &FakePlugin,
    functions: Option<Vec<PluginFunction>>,
) -> ManagerCall {
    ManagerCall::RegisterPlugin {
        auth_token: token.to_string(),
        callback_uri: plugin.endpoint().uri(),
        plugin_data: functions.map(plugin_data),
    }
}

/// A blob that lives in the host, not in a plugin.
pub struct LocalBlob;

#[async_trait]
impl BlobData for LocalBlob {
    async fn length(&self) -> HostResult<u64> {
        Ok(0)
    }

    async fn read_range(&self, _offset: u64, _count: usize) -> HostResult<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn write(&self, bytes: &[u8]) -> HostResult<usize> {
        Ok(bytes.len())
    }
}

fn object_handle(call: &PluginCall) -> Option<i32> {
    match call {
        PluginCall::CallFunction { .. } | PluginCall::Shutdown => None,
        PluginCall::RowsSetOpen { handle }
        | PluginCall::RowsSetClose { handle }
        | PluginCall::RowsSetReset { handle }
        | PluginCall::RowsSetGetColumns { handle }
        | PluginCall::RowsSetGetUniqueKey { handle }
        | PluginCall::RowsSetPosition { handle }
        | PluginCall::RowsSetTotalRows { handle }
        | PluginCall::RowsSetSetContext { handle, .. }
        | PluginCall::RowsSetGetRows { handle, .. }
        | PluginCall::RowsSetGetKeyColumns { handle }
        | PluginCall::RowsSetSetKeyColumnValue { handle, .. }
        | PluginCall::RowsSetUnsetKeyColumnValue { handle, .. }
        | PluginCall::RowsSetUpdateValue { handle, .. }
        | PluginCall::RowsSetDeleteRow { handle }
        | PluginCall::RowsSetWriteValues { handle, .. }
        | PluginCall::RowsFormatterOpenInput { handle, .. }
        | PluginCall::RowsFormatterOpenOutput { handle, .. }
        | PluginCall::BlobGetLength { handle }
        | PluginCall::BlobRead { handle, .. }
        | PluginCall::BlobWrite { handle, .. } => Some(*handle),
    }
}

async fn serve(mut connection: Connection, state: Arc<Mutex<FakeState>>) {
    loop {
        let request: RpcRequest = match read_message(&mut connection.reader).await {
            Ok(Some(request)) => request,
            _ => return,
        };
        let reply = if request.service != PLUGIN_SERVICE {
            Reply::Answer(Err(PluginException::new(ErrorKind::NotSupported, "unknown service")))
        } else {
            match serde_json::from_value::<PluginCall>(request.body) {
                Ok(call) => {
                    let mut state = state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                    state.calls.push(call.clone());
                    if std::mem::take(&mut state.drop_next) {
                        Reply::Drop
                    } else if std::mem::take(&mut state.stall_next) {
                        Reply::Stall
                    } else {
                        Reply::Answer(answer(&mut state, call))
                    }
                }
                Err(e) => Reply::Answer(Err(PluginException::new(
                    ErrorKind::InvalidArguments,
                    e.to_string(),
                ))),
            }
        };
        let result = match reply {
            Reply::Answer(result) => result,
            Reply::Drop => return,
            Reply::Stall => std::future::pending().await,
        };
        let response = RpcResponse {
            seq: request.seq,
            result: match result {
                Ok(value) => RpcResult::Ok(value),
                Err(e) => RpcResult::Err(e),
            },
        };
        if write_message(&mut connection.writer, &response).await.is_err() {
            return;
        }
    }
}

fn invalid(handle: i32) -> PluginException {
    PluginException::new(ErrorKind::InvalidObject, format!("no object #{handle}"))
        .with_object_handle(handle)
}

fn to_json<T: serde::Serialize>(value: T) -> Result<Json, PluginException> {
    serde_json::to_value(value).map_err(|e| PluginException::new(ErrorKind::Generic, e.to_string()))
}

fn answer(state: &mut FakeState, call: PluginCall) -> Result<Json, PluginException> {
    match call {
        PluginCall::CallFunction {
            function_name,
            args,
            ..
        } => match function_name.as_str() {
            "add" => {
                let total: i64 = args
                    .iter()
                    .map(|a| match a {
                        VariantValue::Integer(i) => *i,
                        _ => 0,
                    })
                    .sum();
                to_json(VariantValue::Integer(total))
            }
            "rows" => to_json(VariantValue::Object(ObjectValue {
                kind: ObjectType::RowsIterator,
                handle: ROWS_FUNCTION_HANDLE,
                name: "rows".into(),
            })),
            other => Err(PluginException::new(
                ErrorKind::InvalidArguments,
                format!("unknown function {other}"),
            )),
        },
        PluginCall::Shutdown
        | PluginCall::RowsSetOpen { .. }
        | PluginCall::RowsSetSetContext { .. }
        | PluginCall::RowsSetSetKeyColumnValue { .. }
        | PluginCall::RowsSetUnsetKeyColumnValue { .. }
        | PluginCall::RowsSetUpdateValue { .. }
        | PluginCall::RowsSetDeleteRow { .. }
        | PluginCall::RowsSetWriteValues { .. } => Ok(Json::Null),
        PluginCall::RowsSetClose { handle } | PluginCall::RowsSetReset { handle } => {
            if let Some(rows) = state.rows.get_mut(&handle) {
                rows.position = 0;
            }
            Ok(Json::Null)
        }
        PluginCall::RowsSetGetColumns { handle } => {
            let rows = state.rows.get(&handle).ok_or_else(|| invalid(handle))?;
            let columns: Vec<WireColumn> = rows
                .columns
                .iter()
                .map(|(name, data_type)| WireColumn {
                    name: name.clone(),
                    data_type: data_type.clone(),
                    description: String::new(),
                })
                .collect();
            to_json(columns)
        }
        PluginCall::RowsSetGetRows { handle, count } => {
            let rows = state.rows.get_mut(&handle).ok_or_else(|| invalid(handle))?;
            let end = (rows.position + count.max(0) as usize).min(rows.rows.len());
            let values: Vec<VariantValue> = rows.rows[rows.position..end]
                .iter()
                .flatten()
                .cloned()
                .collect();
            rows.position = end;
            to_json(RowsList {
                values,
                has_more: end < rows.rows.len(),
            })
        }
        PluginCall::RowsSetGetKeyColumns { handle } => {
            let rows = state.rows.get(&handle).ok_or_else(|| invalid(handle))?;
            to_json(rows.key_columns.clone())
        }
        PluginCall::RowsSetGetUniqueKey { handle } => {
            let rows = state.rows.get(&handle).ok_or_else(|| invalid(handle))?;
            to_json(rows.columns.iter().take(1).map(|(n, _)| n.clone()).collect::<Vec<_>>())
        }
        PluginCall::RowsSetPosition { handle } => {
            let rows = state.rows.get(&handle).ok_or_else(|| invalid(handle))?;
            to_json(rows.position as i64)
        }
        PluginCall::RowsSetTotalRows { handle } => {
            let rows = state.rows.get(&handle).ok_or_else(|| invalid(handle))?;
            let total = if rows.known_total { rows.rows.len() as i64 } else { -1 };
            to_json(total)
        }
        PluginCall::RowsFormatterOpenInput { .. } | PluginCall::RowsFormatterOpenOutput { .. } => {
            to_json(state.formatter_result)
        }
        PluginCall::BlobGetLength { handle } => {
            let blob = state.blobs.get(&handle).ok_or_else(|| invalid(handle))?;
            to_json(blob.len() as i64)
        }
        PluginCall::BlobRead {
            handle,
            offset,
            count,
        } => {
            let blob = state.blobs.get(&handle).ok_or_else(|| invalid(handle))?;
            let start = (offset.max(0) as usize).min(blob.len());
            let end = (start + count.max(0) as usize).min(blob.len());
            Ok(json!(STANDARD.encode(&blob[start..end])))
        }
        PluginCall::BlobWrite { handle, bytes } => {
            let blob = state.blobs.get_mut(&handle).ok_or_else(|| invalid(handle))?;
            blob.extend_from_slice(&bytes);
            to_json(bytes.len() as i32)
        }
    }
}
