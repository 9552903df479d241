use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tether_core::protocol::{RpcRequest, RpcResponse, RpcResult};
use tether_core::{ErrorKind, HostResult, PluginException};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::framing::{read_message, write_message};
use crate::transport::{Connection, Listener};

/// Per-connection state visible to services.
#[derive(Debug, Default)]
pub struct ConnectionScope {
    pub id: u64,
    /// Set once the peer identified itself (e.g. by registering).
    pub label: Option<String>,
}

impl ConnectionScope {
    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or("unknown")
    }
}

/// A named service reachable through an [`RpcServer`].
#[async_trait]
pub trait RpcService: Send + Sync {
    async fn dispatch(
        &self,
        scope: &mut ConnectionScope,
        body: serde_json::Value,
    ) -> Result<serde_json::Value, PluginException>;
}

/// Serves any number of named services over one listener.
#[derive(Default)]
pub struct RpcServer {
    services: HashMap<String, Arc<dyn RpcService>>,
}

impl RpcServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, name: &str, service: Arc<dyn RpcService>) -> Self {
        self.services.insert(name.to_string(), service);
        self
    }

    /// Accept connections until `shutdown` fires.
    pub fn spawn(self, listener: Listener, shutdown: CancellationToken) -> JoinHandle<()> {
        let services = Arc::new(self.services);
        let ids = AtomicU64::new(1);
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok(connection) => {
                        let scope = ConnectionScope {
                            id: ids.fetch_add(1, Ordering::Relaxed),
                            label: None,
                        };
                        let services = Arc::clone(&services);
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            tokio::select! {
                                _ = shutdown.cancelled() => {}
                                result = serve_connection(connection, scope, services) => {
                                    if let Err(e) = result {
                                        debug!(error = %e, "RPC connection closed with error");
                                    }
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!("RPC accept error: {e}");
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
            debug!("RPC server stopped");
        })
    }
}

async fn serve_connection(
    mut connection: Connection,
    mut scope: ConnectionScope,
    services: Arc<HashMap<String, Arc<dyn RpcService>>>,
) -> HostResult<()> {
    while let Some(request) = read_message::<RpcRequest, _>(&mut connection.reader).await? {
        let result = match services.get(&request.service) {
            Some(service) => service.dispatch(&mut scope, request.body).await,
            None => {
                warn!(service = %request.service, connection = scope.id, "Unknown RPC service");
                Err(PluginException::new(
                    ErrorKind::NotSupported,
                    format!("unknown service '{}'", request.service),
                ))
            }
        };
        let response = RpcResponse {
            seq: request.seq,
            result: match result {
                Ok(value) => RpcResult::Ok(value),
                Err(exception) => RpcResult::Err(exception),
            },
        };
        write_message(&mut connection.writer, &response).await?;
    }
    debug!(connection = scope.id, peer = %scope.label(), "RPC peer disconnected");
    Ok(())
}
