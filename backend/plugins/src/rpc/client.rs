use serde::Serialize;
use serde::de::DeserializeOwned;
use tether_core::protocol::{RpcRequest, RpcResponse, RpcResult};
use tether_core::{HostError, HostResult};
use tokio_util::sync::CancellationToken;

use super::framing::{read_message, write_message};
use crate::transport::{BoxReader, BoxWriter, Connection, Endpoint};

/// Sequential request/response client over one connection.
///
/// A call that fails mid-flight or is abandoned leaves the stream in an
/// unknown state; the client is then reported broken and must not be reused.
pub struct RpcClient {
    reader: BoxReader,
    writer: BoxWriter,
    next_seq: u64,
    in_flight: bool,
    broken: bool,
}

impl RpcClient {
    pub fn new(connection: Connection) -> Self {
        Self {
            reader: connection.reader,
            writer: connection.writer,
            next_seq: 1,
            in_flight: false,
            broken: false,
        }
    }

    pub async fn connect(endpoint: &Endpoint) -> HostResult<Self> {
        Ok(Self::new(endpoint.connect().await?))
    }

    pub fn is_broken(&self) -> bool {
        self.broken || self.in_flight
    }

    /// Send `body` to `service` and decode the result.
    pub async fn call<B, R>(
        &mut self,
        service: &str,
        body: &B,
        cancel: &CancellationToken,
    ) -> HostResult<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let value = self.call_raw(service, body, cancel).await?;
        serde_json::from_value(value)
            .map_err(|e| HostError::Protocol(format!("unexpected result from {service}: {e}")))
    }

    pub async fn call_raw<B>(
        &mut self,
        service: &str,
        body: &B,
        cancel: &CancellationToken,
    ) -> HostResult<serde_json::Value>
    where
        B: Serialize + ?Sized,
    {
        if self.is_broken() {
            return Err(HostError::Transport(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "connection is broken",
            )));
        }
        let body = serde_json::to_value(body)
            .map_err(|e| HostError::Protocol(format!("cannot encode call: {e}")))?;
        let seq = self.next_seq;
        self.next_seq += 1;
        let request = RpcRequest {
            seq,
            service: service.to_string(),
            body,
        };

        self.in_flight = true;
        let exchange = async {
            write_message(&mut self.writer, &request).await?;
            match read_message::<RpcResponse, _>(&mut self.reader).await? {
                Some(response) => Ok(response),
                None => Err(HostError::Transport(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "peer closed the connection",
                ))),
            }
        };
        let outcome = tokio::select! {
            outcome = exchange => outcome,
            _ = cancel.cancelled() => Err(HostError::Cancelled),
        };

        let response = match outcome {
            Ok(response) => response,
            Err(e) => {
                self.in_flight = false;
                self.broken = true;
                return Err(e);
            }
        };
        self.in_flight = false;
        if response.seq != seq {
            self.broken = true;
            return Err(HostError::Protocol(format!(
                "response sequence {} does not match request {seq}",
                response.seq
            )));
        }
        match response.result {
            RpcResult::Ok(value) => Ok(value),
            RpcResult::Err(exception) => Err(exception.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::framing::{read_message, write_message};
    use serde_json::json;
    use tether_core::{ErrorKind, PluginException};

    fn pair() -> (RpcClient, tokio::io::DuplexStream) {
        let (client_side, server_side) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(client_side);
        let client = RpcClient::new(Connection {
            reader: Box::new(reader),
            writer: Box::new(writer),
        });
        (client, server_side)
    }

    #[tokio::test]
    async fn returns_ok_result() {
        let (mut client, mut server) = pair();
        let peer = tokio::spawn(async move {
            let request: RpcRequest = read_message(&mut server).await.unwrap().unwrap();
            assert_eq!(request.service, "Plugin");
            let response = RpcResponse {
                seq: request.seq,
                result: RpcResult::Ok(json!(5)),
            };
            write_message(&mut server, &response).await.unwrap();
            server
        });
        let value: i64 = client
            .call("Plugin", &json!({"method": "Shutdown"}), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(value, 5);
        assert!(!client.is_broken());
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn remote_exception_keeps_connection_usable() {
        let (mut client, mut server) = pair();
        let peer = tokio::spawn(async move {
            let request: RpcRequest = read_message(&mut server).await.unwrap().unwrap();
            let response = RpcResponse {
                seq: request.seq,
                result: RpcResult::Err(PluginException::new(ErrorKind::InvalidObject, "gone")),
            };
            write_message(&mut server, &response).await.unwrap();
            server
        });
        let err = client
            .call_raw("Plugin", &json!({}), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidObject);
        assert!(!client.is_broken());
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn closed_peer_breaks_client() {
        let (mut client, server) = pair();
        drop(server);
        let err = client
            .call_raw("Plugin", &json!({}), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert!(client.is_broken());
    }

    #[tokio::test]
    async fn cancelled_call_breaks_client() {
        let (mut client, _server) = pair();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client.call_raw("Plugin", &json!({}), &cancel).await.unwrap_err();
        assert!(matches!(err, HostError::Cancelled));
        assert!(client.is_broken());
    }
}
