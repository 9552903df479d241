use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tether_core::protocol::PluginCall;
use tether_core::{HostResult, QueryContextInfo, RowsOutput, Value};

use super::{Disposal, RemoteLink};

#[derive(Default)]
struct PendingContext {
    context: Option<QueryContextInfo>,
    dirty: bool,
}

/// Row sink living in a plugin.
pub struct RemoteRowsOutput {
    link: RemoteLink,
    handle: i32,
    pending: Mutex<PendingContext>,
    disposal: Disposal,
}

impl RemoteRowsOutput {
    pub fn new(link: RemoteLink, handle: i32) -> Self {
        Self {
            link,
            handle,
            pending: Mutex::new(PendingContext::default()),
            disposal: Disposal::default(),
        }
    }

    pub fn handle(&self) -> i32 {
        self.handle
    }

    pub fn dispose(&self) {
        self.disposal.mark();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposal.is_disposed()
    }

    async fn invoke(&self, call: PluginCall) -> HostResult<()> {
        let _: serde_json::Value = self
            .link
            .call_object(&self.disposal, "rows output", call)
            .await?;
        Ok(())
    }

    async fn flush_context(&self) -> HostResult<()> {
        let context = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if !pending.dirty {
                return Ok(());
            }
            pending.dirty = false;
            pending.context.as_ref().map(QueryContextInfo::to_wire)
        };
        let Some(context) = context else { return Ok(()) };
        let pushed = self
            .invoke(PluginCall::RowsSetSetContext {
                handle: self.handle,
                context,
            })
            .await;
        if pushed.is_err() {
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .dirty = true;
        }
        pushed
    }
}

#[async_trait]
impl RowsOutput for RemoteRowsOutput {
    async fn open(&self) -> HostResult<()> {
        self.flush_context().await?;
        self.invoke(PluginCall::RowsSetOpen { handle: self.handle }).await
    }

    async fn close(&self) -> HostResult<()> {
        self.invoke(PluginCall::RowsSetClose { handle: self.handle }).await
    }

    async fn reset(&self) -> HostResult<()> {
        self.invoke(PluginCall::RowsSetReset { handle: self.handle }).await
    }

    async fn write_values(&self, values: &[Value]) -> HostResult<()> {
        let values = values
            .iter()
            .map(Value::to_wire)
            .collect::<HostResult<Vec<_>>>()?;
        self.flush_context().await?;
        self.invoke(PluginCall::RowsSetWriteValues {
            handle: self.handle,
            values,
        })
        .await
    }

    fn set_query_context(&self, context: QueryContextInfo) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.context = Some(context);
        pending.dirty = true;
    }

    fn remote_handle(&self) -> Option<i32> {
        Some(self.handle)
    }
}
