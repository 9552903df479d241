use async_trait::async_trait;
use serde::Deserialize;
use tether_core::protocol::PluginCall;
use tether_core::{BlobData, HostError, HostResult};

use super::{Disposal, RemoteLink};

/// Chunk size used by [`RemoteBlob::read_to_end`].
pub const READ_CHUNK_SIZE: usize = 8192;

#[derive(Deserialize)]
struct BlobBytes(#[serde(with = "tether_core::protocol::base64_bytes")] Vec<u8>);

/// Binary data living in a plugin.
pub struct RemoteBlob {
    link: RemoteLink,
    handle: i32,
    disposal: Disposal,
}

impl RemoteBlob {
    pub fn new(link: RemoteLink, handle: i32) -> Self {
        Self {
            link,
            handle,
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

    /// Read everything from the start, one chunk per call, until the plugin
    /// returns an empty chunk.
    pub async fn read_to_end(&self) -> HostResult<Vec<u8>> {
        let mut data = Vec::new();
        loop {
            let chunk = self.read_range(data.len() as u64, READ_CHUNK_SIZE).await?;
            if chunk.is_empty() {
                return Ok(data);
            }
            data.extend_from_slice(&chunk);
        }
    }
}

#[async_trait]
impl BlobData for RemoteBlob {
    async fn length(&self) -> HostResult<u64> {
        let length: i64 = self
            .link
            .call_object(&self.disposal, "blob", PluginCall::BlobGetLength { handle: self.handle })
            .await?;
        u64::try_from(length)
            .map_err(|_| HostError::Protocol(format!("blob #{} reported length {length}", self.handle)))
    }

    async fn read_range(&self, offset: u64, count: usize) -> HostResult<Vec<u8>> {
        let bytes: BlobBytes = self
            .link
            .call_object(
                &self.disposal,
                "blob",
                PluginCall::BlobRead {
                    handle: self.handle,
                    offset: i64::try_from(offset).unwrap_or(i64::MAX),
                    count: i32::try_from(count).unwrap_or(i32::MAX),
                },
            )
            .await?;
        Ok(bytes.0)
    }

    async fn write(&self, bytes: &[u8]) -> HostResult<usize> {
        let written: i32 = self
            .link
            .call_object(
                &self.disposal,
                "blob",
                PluginCall::BlobWrite {
                    handle: self.handle,
                    bytes: bytes.to_vec(),
                },
            )
            .await?;
        usize::try_from(written)
            .map_err(|_| HostError::Protocol(format!("blob #{} reported {written} bytes written", self.handle)))
    }

    fn remote_handle(&self) -> Option<i32> {
        Some(self.handle)
    }
}
