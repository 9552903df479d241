//! Pooled client sessions into a plugin's own RPC service.

use std::sync::Arc;
use std::time::Instant;

use serde::de::DeserializeOwned;
use tether_core::protocol::{PLUGIN_SERVICE, PluginCall};
use tether_core::{HostError, HostResult};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::rpc::RpcClient;
use crate::transport::Endpoint;
use crate::wait_queue::{Lease, WaitQueue};

/// Bounded pool of connections to one plugin's callback endpoint.
pub struct SessionPool {
    plugin: String,
    endpoint: Endpoint,
    queue: WaitQueue<RpcClient>,
    max_sessions: usize,
    grow_lock: Mutex<()>,
    capacity_freed: Arc<Notify>,
    log_calls: bool,
}

impl SessionPool {
    pub fn new(plugin: &str, endpoint: Endpoint, max_sessions: usize, log_calls: bool) -> Self {
        Self {
            plugin: plugin.to_string(),
            endpoint,
            queue: WaitQueue::new(),
            max_sessions: max_sessions.max(1),
            grow_lock: Mutex::new(()),
            capacity_freed: Arc::new(Notify::new()),
            log_calls,
        }
    }

    /// Seed the pool with an already connected client.
    pub fn add_client(&self, client: RpcClient) -> HostResult<()> {
        self.queue.enqueue(client)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Borrow a session, opening a new connection while under the bound.
    pub async fn get_session(&self, cancel: &CancellationToken) -> HostResult<PluginSession> {
        loop {
            let freed = self.capacity_freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();

            if let Some(lease) = self.queue.try_dequeue()? {
                return Ok(self.session(lease));
            }
            if let Some(lease) = self.try_grow(cancel).await? {
                return Ok(self.session(lease));
            }
            tokio::select! {
                lease = self.queue.dequeue(cancel) => return Ok(self.session(lease?)),
                // A broken session was dropped; there may be room to grow again.
                _ = &mut freed => continue,
            }
        }
    }

    async fn try_grow(&self, cancel: &CancellationToken) -> HostResult<Option<Lease<RpcClient>>> {
        let _guard = tokio::select! {
            guard = self.grow_lock.lock() => guard,
            _ = cancel.cancelled() => return Err(HostError::Cancelled),
        };
        if self.queue.total_count() >= self.max_sessions {
            return Ok(None);
        }
        let client = tokio::select! {
            client = RpcClient::connect(&self.endpoint) => client?,
            _ = cancel.cancelled() => return Err(HostError::Cancelled),
        };
        debug!(
            plugin = %self.plugin,
            sessions = self.queue.total_count() + 1,
            "Opened plugin session"
        );
        Ok(Some(self.queue.insert_leased(client)?))
    }

    fn session(&self, lease: Lease<RpcClient>) -> PluginSession {
        PluginSession {
            lease: Some(lease),
            plugin: self.plugin.clone(),
            capacity_freed: Arc::clone(&self.capacity_freed),
            log_calls: self.log_calls,
        }
    }

    pub fn total_count(&self) -> usize {
        self.queue.total_count()
    }

    pub fn available_count(&self) -> usize {
        self.queue.available_count()
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Close idle connections and refuse further sessions.
    pub fn dispose(&self) {
        self.queue.dispose();
        self.capacity_freed.notify_waiters();
    }
}

/// A borrowed connection. Dropping it returns the connection to the pool,
/// unless the connection broke, in which case it is discarded.
pub struct PluginSession {
    lease: Option<Lease<RpcClient>>,
    plugin: String,
    capacity_freed: Arc<Notify>,
    log_calls: bool,
}

impl PluginSession {
    pub async fn call<R: DeserializeOwned>(
        &mut self,
        call: &PluginCall,
        cancel: &CancellationToken,
    ) -> HostResult<R> {
        let client = match self.lease.as_mut() {
            Some(lease) => lease,
            None => return Err(HostError::Disposed("plugin session")),
        };
        let started = Instant::now();
        let result = client.call(PLUGIN_SERVICE, call, cancel).await;
        if self.log_calls {
            debug!(
                plugin = %self.plugin,
                method = call.method(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                ok = result.is_ok(),
                "Remote call"
            );
        }
        result
    }
}

impl Drop for PluginSession {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else { return };
        if lease.is_broken() {
            warn!(plugin = %self.plugin, "Discarding broken plugin session");
            drop(lease.discard());
            self.capacity_freed.notify_waiters();
        }
    }
}
