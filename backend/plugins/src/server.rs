//! The host-side endpoint plugins register with and call into.
//!
//! One listener serves every plugin. A plugin first calls `RegisterPlugin`
//! with the token it was started with and its callback endpoint; the server
//! then opens a client connection back into the plugin, builds its
//! [`PluginContext`] and releases the loader waiting on the token.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::FutureExt;
use tether_core::protocol::{
    MANAGER_SERVICE, LogLevel, ManagerCall, PluginData, RegistrationResult, VariantValue,
};
use tether_core::{
    DataType, ErrorKind, ExecutionContext, FunctionRegistry, HostError, HostResult,
    PluginException, Value,
};
use tether_logging::{emit_plugin_record, redact_token};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::context::PluginContext;
use crate::registration::TokenRegistry;
use crate::rpc::{ConnectionScope, RpcClient, RpcServer, RpcService};
use crate::session::SessionPool;
use crate::transport::Endpoint;

/// Settings for [`PluginsServer::start`].
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Fixed endpoint to listen on; a private one is generated when unset.
    pub endpoint: Option<Endpoint>,
    /// Reject registrations with unknown tokens.
    pub verify_tokens: bool,
    pub max_sessions: usize,
    pub log_remote_calls: bool,
    pub min_log_level: LogLevel,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            endpoint: None,
            verify_tokens: true,
            max_sessions: 4,
            log_remote_calls: false,
            min_log_level: LogLevel::Information,
        }
    }
}

type Registrations = Arc<Mutex<HashMap<String, Arc<PluginContext>>>>;

pub struct PluginsServer {
    endpoint: Endpoint,
    tokens: Arc<TokenRegistry>,
    registrations: Registrations,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PluginsServer {
    /// Bind and start serving.
    pub async fn start(
        options: ServerOptions,
        functions: Arc<dyn FunctionRegistry>,
        execution: Arc<dyn ExecutionContext>,
    ) -> HostResult<Self> {
        let requested = options.endpoint.clone().unwrap_or_else(Endpoint::generate);
        let listener = requested.bind().await?;
        let endpoint = listener.local_endpoint()?;

        let tokens = Arc::new(TokenRegistry::new());
        let registrations: Registrations = Arc::default();
        let handler = ManagerHandler {
            options,
            tokens: Arc::clone(&tokens),
            registrations: Arc::clone(&registrations),
            functions,
            execution,
        };
        let shutdown = CancellationToken::new();
        let task = RpcServer::new()
            .with_service(MANAGER_SERVICE, Arc::new(handler))
            .spawn(listener, shutdown.clone());
        info!(endpoint = %endpoint, "Plugins server listening");

        Ok(Self {
            endpoint,
            tokens,
            registrations,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn tokens(&self) -> &Arc<TokenRegistry> {
        &self.tokens
    }

    /// Context created by the registration that used `token`.
    pub fn take_registration(&self, token: &str) -> Option<Arc<PluginContext>> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(token)
    }

    /// Stop accepting connections and close open ones. Registrations nobody
    /// took are shut down.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Plugins server task ended abnormally");
            }
        }

        let leftover: Vec<_> = self
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, context)| context)
            .collect();
        let cancel = CancellationToken::new();
        for context in leftover {
            warn!(plugin = %context.name(), "Shutting down unclaimed plugin registration");
            context.shutdown(&cancel).await;
        }
        info!(endpoint = %self.endpoint, "Plugins server stopped");
    }
}

impl Drop for PluginsServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Serves `PluginsManager` calls.
struct ManagerHandler {
    options: ServerOptions,
    tokens: Arc<TokenRegistry>,
    registrations: Registrations,
    functions: Arc<dyn FunctionRegistry>,
    execution: Arc<dyn ExecutionContext>,
}

fn method_name(call: &ManagerCall) -> &'static str {
    match call {
        ManagerCall::RegisterPlugin { .. } => "RegisterPlugin",
        ManagerCall::CallFunction { .. } => "CallFunction",
        ManagerCall::RunQuery { .. } => "RunQuery",
        ManagerCall::GetConfigValue { .. } => "GetConfigValue",
        ManagerCall::SetConfigValue { .. } => "SetConfigValue",
        ManagerCall::Log { .. } => "Log",
    }
}

fn to_json(value: Value) -> HostResult<serde_json::Value> {
    serde_json::to_value(value.to_wire()?)
        .map_err(|e| HostError::Internal(format!("cannot encode result: {e}")))
}

/// Plugins may not pass their own objects back as arguments.
fn from_wire_arg(value: VariantValue) -> HostResult<Value> {
    if let VariantValue::Object(object) = &value {
        return Err(HostError::data(
            ErrorKind::CannotCast,
            format!("object #{} cannot be passed to host functions", object.handle),
        ));
    }
    Value::from_wire(value)
}

impl ManagerHandler {
    async fn handle(
        &self,
        scope: &mut ConnectionScope,
        call: ManagerCall,
    ) -> HostResult<serde_json::Value> {
        match call {
            ManagerCall::RegisterPlugin {
                auth_token,
                callback_uri,
                plugin_data,
            } => self.register(scope, auth_token, callback_uri, plugin_data).await,
            ManagerCall::CallFunction {
                function_name,
                args,
                ..
            } => {
                let args = args
                    .into_iter()
                    .map(from_wire_arg)
                    .collect::<HostResult<Vec<_>>>()?;
                let types: Vec<DataType> = args.iter().map(Value::data_type).collect();
                let function = self
                    .functions
                    .find_by_name(&function_name, Some(&types))
                    .ok_or_else(|| {
                        HostError::data(
                            ErrorKind::InvalidArguments,
                            format!("no function '{function_name}' accepts these arguments"),
                        )
                    })?;
                to_json(self.functions.call(&function, args).await?)
            }
            ManagerCall::RunQuery { query, parameters } => {
                let parameters = parameters
                    .into_iter()
                    .map(|(k, v)| from_wire_arg(v).map(|v| (k, v)))
                    .collect::<HostResult<HashMap<_, _>>>()?;
                to_json(self.execution.run_query(&query, parameters).await?)
            }
            ManagerCall::GetConfigValue { key } => {
                to_json(self.execution.get_config_value(&key).await?)
            }
            ManagerCall::SetConfigValue { key, value } => {
                self.execution
                    .set_config_value(&key, from_wire_arg(value)?)
                    .await?;
                Ok(serde_json::Value::Null)
            }
            ManagerCall::Log {
                level,
                message,
                arguments,
            } => {
                emit_plugin_record(scope.label(), level, &message, &arguments);
                Ok(serde_json::Value::Null)
            }
        }
    }

    async fn register(
        &self,
        scope: &mut ConnectionScope,
        token: String,
        callback_uri: String,
        data: Option<PluginData>,
    ) -> HostResult<serde_json::Value> {
        if self.options.verify_tokens && !self.tokens.verify(&token) {
            warn!(token = %redact_token(&token), "Registration with unknown token");
            return Err(HostError::InvalidAuthToken);
        }
        let data = data.ok_or_else(|| {
            HostError::data(ErrorKind::InvalidArguments, "registration carries no plugin data")
        })?;
        if let Some(expected) = self.tokens.expected_plugin(&token) {
            if !expected.is_empty() && expected != data.name {
                info!(expected = %expected, actual = %data.name, "Plugin registered under another name");
            }
        }

        let endpoint: Endpoint = callback_uri.parse()?;
        let client = RpcClient::connect(&endpoint).await?;
        let sessions = Arc::new(SessionPool::new(
            &data.name,
            endpoint,
            self.options.max_sessions,
            self.options.log_remote_calls,
        ));
        sessions.add_client(client)?;

        let name = data.name.clone();
        let functions = data.functions.len();
        let context = Arc::new(PluginContext::new(data, sessions));
        self.store(&token, context).await?;
        scope.label = Some(name.clone());
        self.tokens.confirm(&token);
        info!(plugin = %name, functions, token = %redact_token(&token), "Plugin registered");

        let result = RegistrationResult {
            host_version: env!("CARGO_PKG_VERSION").to_string(),
            min_log_level: self.options.min_log_level,
        };
        serde_json::to_value(result).map_err(|e| HostError::Internal(e.to_string()))
    }
}

impl ManagerHandler {
    /// Keep `context` for the loader waiting on `token`. A context replaced
    /// by a repeated registration is shut down, and so is `context` when the
    /// token expired while the server was connecting back.
    async fn store(&self, token: &str, context: Arc<PluginContext>) -> HostResult<()> {
        let replaced = self
            .registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(token.to_string(), Arc::clone(&context));
        let cancel = CancellationToken::new();
        if let Some(replaced) = replaced {
            warn!(plugin = %replaced.name(), token = %redact_token(token), "Plugin registered twice with one token");
            replaced.shutdown(&cancel).await;
        }

        if self.options.verify_tokens && !self.tokens.verify(token) {
            // The loader gave up on the token; whoever still finds the
            // context in the map owns its shutdown.
            let ours = {
                let mut registrations =
                    self.registrations.lock().unwrap_or_else(PoisonError::into_inner);
                match registrations.get(token) {
                    Some(current) if Arc::ptr_eq(current, &context) => {
                        registrations.remove(token);
                        true
                    }
                    _ => false,
                }
            };
            warn!(plugin = %context.name(), token = %redact_token(token), "Registration arrived after its token expired");
            if ours {
                context.shutdown(&cancel).await;
            }
            return Err(HostError::InvalidAuthToken);
        }
        Ok(())
    }
}

#[async_trait]
impl RpcService for ManagerHandler {
    /// Every failure leaves as a structured exception; panics become
    /// `HandlerInternalError`.
    async fn dispatch(
        &self,
        scope: &mut ConnectionScope,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, PluginException> {
        let call: ManagerCall = serde_json::from_value(body).map_err(|e| {
            warn!(peer = %scope.label(), error = %e, "Malformed plugins manager call");
            PluginException::new(ErrorKind::InvalidArguments, format!("malformed call: {e}"))
        })?;
        let method = method_name(&call);

        let outcome = AssertUnwindSafe(self.handle(scope, call)).catch_unwind().await;
        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                error!(method, peer = %scope.label(), error = %e, "Plugins manager call failed");
                Err(e.to_exception())
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_string());
                error!(method, peer = %scope.label(), panic = %message, "Plugins manager handler panicked");
                Err(PluginException::new(ErrorKind::HandlerInternalError, message))
            }
        }
    }
}
