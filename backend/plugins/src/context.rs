//! Per-plugin state created when a plugin registers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tether_core::protocol::{NO_OBJECT_HANDLE, PluginCall, PluginData, PluginFunction, VariantValue};
use tether_core::{HostResult, Value};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::native::{NativeLibrary, PlatformLibraryLoader};
use crate::objects::ObjectStorage;
use crate::remote::RemoteLink;
use crate::session::SessionPool;

/// How long a plugin process gets to exit after the shutdown call.
const PROCESS_EXIT_GRACE: Duration = Duration::from_secs(3);

/// How long the shutdown call itself may take.
const SHUTDOWN_CALL_TIMEOUT: Duration = Duration::from_secs(2);

struct NativeHandle {
    loader: Arc<dyn PlatformLibraryLoader>,
    library: Box<dyn NativeLibrary>,
}

/// A registered plugin: its functions, its sessions and the objects it
/// handed out.
pub struct PluginContext {
    name: String,
    version: String,
    functions: Vec<PluginFunction>,
    storage: Arc<ObjectStorage>,
    sessions: Arc<SessionPool>,
    native: Mutex<Option<NativeHandle>>,
    process: tokio::sync::Mutex<Option<Child>>,
    cancel: CancellationToken,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("name", &self.name)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl PluginContext {
    pub fn new(data: PluginData, sessions: Arc<SessionPool>) -> Self {
        Self {
            name: data.name,
            version: data.version,
            functions: data.functions,
            storage: Arc::new(ObjectStorage::new()),
            sessions,
            native: Mutex::new(None),
            process: tokio::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn functions(&self) -> &[PluginFunction] {
        &self.functions
    }

    pub fn storage(&self) -> &Arc<ObjectStorage> {
        &self.storage
    }

    pub fn sessions(&self) -> &Arc<SessionPool> {
        &self.sessions
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Cancelled when the context shuts down.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Link used by proxies created from this plugin's results.
    pub fn link(&self) -> RemoteLink {
        RemoteLink::new(
            &self.name,
            Arc::clone(&self.sessions),
            &self.storage,
            self.cancel.clone(),
        )
    }

    /// Keep a loaded library with the context so shutdown can release it.
    pub fn attach_library(&self, loader: Arc<dyn PlatformLibraryLoader>, library: Box<dyn NativeLibrary>) {
        *self.native.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(NativeHandle { loader, library });
    }

    pub async fn attach_process(&self, child: Child) {
        *self.process.lock().await = Some(child);
    }

    /// Invoke `function_name` inside the plugin. Returned remote objects are
    /// wrapped in proxies and tracked.
    pub async fn call_function(
        &self,
        function_name: &str,
        args: &[Value],
        cancel: &CancellationToken,
    ) -> HostResult<Value> {
        let args = args
            .iter()
            .map(Value::to_wire)
            .collect::<HostResult<Vec<_>>>()?;
        let call = PluginCall::CallFunction {
            function_name: function_name.to_string(),
            args,
            object_handle: NO_OBJECT_HANDLE,
        };
        let result: VariantValue = {
            let mut session = self.sessions.get_session(cancel).await?;
            session.call(&call, cancel).await?
        };
        self.link().materialize(result).await
    }

    /// Release tracked objects, ask the plugin to stop and free what was
    /// loaded for it. Safe to call more than once.
    pub async fn shutdown(&self, cancel: &CancellationToken) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let released = self.storage.clear();
        debug!(plugin = %self.name, objects = released, "Released plugin objects");

        let call = async {
            let mut session = self.sessions.get_session(cancel).await?;
            session.call::<serde_json::Value>(&PluginCall::Shutdown, cancel).await
        };
        match tokio::time::timeout(SHUTDOWN_CALL_TIMEOUT, call).await {
            Ok(Ok(_)) => {}
            // The plugin may drop the connection instead of answering.
            Ok(Err(e)) => debug!(plugin = %self.name, error = %e, "Shutdown call failed"),
            Err(_) => warn!(plugin = %self.name, "Shutdown call timed out"),
        }
        self.sessions.dispose();
        self.cancel.cancel();

        let native = self.native.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(NativeHandle { loader, library }) = native {
            loader.unload(library);
        }

        if let Some(mut child) = self.process.lock().await.take() {
            match tokio::time::timeout(PROCESS_EXIT_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!(plugin = %self.name, %status, "Plugin process exited"),
                Ok(Err(e)) => warn!(plugin = %self.name, error = %e, "Cannot wait for plugin process"),
                Err(_) => {
                    warn!(plugin = %self.name, "Plugin process did not exit, killing it");
                    if let Err(e) = child.kill().await {
                        warn!(plugin = %self.name, error = %e, "Cannot kill plugin process");
                    }
                }
            }
        }
        info!(plugin = %self.name, "Plugin shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakePlugin, FakeRows};
    use tether_core::{ErrorKind, HostError, HostObject};

    #[tokio::test]
    async fn call_function_materializes_iterator() {
        let plugin = FakePlugin::start().await;
        plugin.add_rows(
            42,
            FakeRows::new(vec![("id", "integer")], vec![vec![VariantValue::Integer(1)]]),
        );
        let context = plugin.context();
        let cancel = CancellationToken::new();

        let value = context.call_function("rows", &[], &cancel).await.unwrap();
        let Some(HostObject::RowsIterator(rows)) = value.as_object() else {
            panic!("expected rows iterator, got {value:?}");
        };
        assert_eq!(rows.remote_handle(), Some(42));
        assert_eq!(context.storage().len(), 1);

        let sum = context
            .call_function("add", &[Value::Integer(2), Value::Integer(3)], &cancel)
            .await
            .unwrap();
        assert_eq!(sum, Value::Integer(5));
    }

    #[tokio::test]
    async fn shutdown_disposes_objects_and_notifies_plugin() {
        let plugin = FakePlugin::start().await;
        plugin.add_rows(42, FakeRows::new(vec![("id", "integer")], Vec::new()));
        let context = plugin.context();
        let cancel = CancellationToken::new();
        let value = context.call_function("rows", &[], &cancel).await.unwrap();
        let Some(HostObject::RowsIterator(rows)) = value.as_object().cloned() else {
            panic!("expected rows iterator");
        };

        context.shutdown(&cancel).await;
        assert!(context.is_shut_down());
        assert!(context.storage().is_empty());
        assert!(plugin.calls().contains(&PluginCall::Shutdown));
        assert!(matches!(rows.read_next().await, Err(HostError::Disposed(_))));

        let err = context.call_function("add", &[], &cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidObject);

        // Second shutdown is a no-op.
        context.shutdown(&cancel).await;
        let shutdowns = plugin
            .calls()
            .iter()
            .filter(|c| **c == PluginCall::Shutdown)
            .count();
        assert_eq!(shutdowns, 1);
    }
}
