//! Local proxies for objects living inside a plugin process.
//!
//! Every proxy method turns into one call against the object's handle over a
//! pooled session. Transport failures surface as errors; they are never
//! retried here.

mod blob;
mod formatter;
mod iterator;
mod output;

pub use blob::RemoteBlob;
pub use formatter::RemoteRowsFormatter;
pub use iterator::{DEFAULT_BATCH_SIZE, RemoteRowsIterator};
pub use output::RemoteRowsOutput;

use std::sync::{Arc, Weak};

use serde::de::DeserializeOwned;
use tether_core::protocol::{ObjectType, ObjectValue, PluginCall, VariantValue};
use tether_core::{ErrorKind, HostError, HostObject, HostResult, Value};
use tokio_util::sync::CancellationToken;

use crate::objects::{ObjectStorage, RemoteObject};
use crate::session::SessionPool;

/// What a proxy needs to reach its plugin.
#[derive(Clone)]
pub struct RemoteLink {
    plugin: Arc<str>,
    sessions: Arc<SessionPool>,
    storage: Weak<ObjectStorage>,
    cancel: CancellationToken,
}

impl RemoteLink {
    pub fn new(
        plugin: &str,
        sessions: Arc<SessionPool>,
        storage: &Arc<ObjectStorage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            plugin: Arc::from(plugin),
            sessions,
            storage: Arc::downgrade(storage),
            cancel,
        }
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Run one call on a borrowed session.
    pub async fn call<R: DeserializeOwned>(&self, call: PluginCall) -> HostResult<R> {
        let mut session = self.sessions.get_session(&self.cancel).await?;
        session.call(&call, &self.cancel).await
    }

    /// Call on behalf of a proxy. Once the plugin reports the object invalid
    /// the proxy is disposed.
    pub(crate) async fn call_object<R: DeserializeOwned>(
        &self,
        disposal: &Disposal,
        what: &'static str,
        call: PluginCall,
    ) -> HostResult<R> {
        disposal.check(what)?;
        let result = self.call(call).await;
        if let Err(e) = &result {
            if e.kind() == ErrorKind::InvalidObject {
                disposal.mark();
            }
        }
        result
    }

    /// Convert a wire value, building and tracking a proxy for remote objects.
    pub async fn materialize(&self, value: VariantValue) -> HostResult<Value> {
        match value {
            VariantValue::Object(object) => self.materialize_object(object).await,
            scalar => Value::from_wire(scalar),
        }
    }

    async fn materialize_object(&self, object: ObjectValue) -> HostResult<Value> {
        let handle = object.handle;
        let host = match object.kind {
            ObjectType::RowsInput | ObjectType::RowsIterator => {
                HostObject::RowsIterator(self.rows_iterator(handle).await?)
            }
            ObjectType::RowsOutput => HostObject::RowsOutput(self.rows_output(handle)?),
            ObjectType::RowsFormatter => {
                let proxy = Arc::new(RemoteRowsFormatter::new(self.clone(), handle));
                self.track(handle, RemoteObject::RowsFormatter(Arc::clone(&proxy)))?;
                HostObject::RowsFormatter(proxy)
            }
            ObjectType::Blob => {
                let proxy = Arc::new(RemoteBlob::new(self.clone(), handle));
                self.track(handle, RemoteObject::Blob(Arc::clone(&proxy)))?;
                HostObject::Blob(proxy)
            }
            ObjectType::Generic => {
                return Err(HostError::data(
                    ErrorKind::CannotCast,
                    format!("cannot create a proxy for generic object #{handle}"),
                ));
            }
        };
        Ok(Value::Object(host))
    }

    /// Build and track an iterator proxy; fetches the column list first.
    pub(crate) async fn rows_iterator(&self, handle: i32) -> HostResult<Arc<RemoteRowsIterator>> {
        let proxy = Arc::new(RemoteRowsIterator::connect(self.clone(), handle).await?);
        self.track(handle, RemoteObject::RowsIterator(Arc::clone(&proxy)))?;
        Ok(proxy)
    }

    pub(crate) fn rows_output(&self, handle: i32) -> HostResult<Arc<RemoteRowsOutput>> {
        let proxy = Arc::new(RemoteRowsOutput::new(self.clone(), handle));
        self.track(handle, RemoteObject::RowsOutput(Arc::clone(&proxy)))?;
        Ok(proxy)
    }

    fn track(&self, handle: i32, object: RemoteObject) -> HostResult<()> {
        match self.storage.upgrade() {
            Some(storage) => {
                storage.add(handle, object);
                Ok(())
            }
            None => Err(HostError::Disposed("plugin context")),
        }
    }
}

/// Shared disposed flag of a proxy.
#[derive(Default)]
pub(crate) struct Disposal(std::sync::atomic::AtomicBool);

impl Disposal {
    pub(crate) fn mark(&self) {
        self.0.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub(crate) fn check(&self, what: &'static str) -> HostResult<()> {
        if self.0.load(std::sync::atomic::Ordering::SeqCst) {
            Err(HostError::Disposed(what))
        } else {
            Ok(())
        }
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}
