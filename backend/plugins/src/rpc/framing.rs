//! Length-prefixed JSON frames.
//!
//! Each frame is a 4-byte big-endian length followed by that many bytes of
//! JSON.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io;
use tether_core::{HostError, HostResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Read one frame body. `None` when the peer closes before sending any byte
/// of the prefix; a prefix cut short is a protocol error.
pub async fn read_frame<R>(reader: &mut R) -> HostResult<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        match reader.read(&mut len_buf[filled..]).await {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(HostError::Protocol(format!(
                    "connection closed after {filled} of 4 length bytes"
                )));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(HostError::Protocol(format!(
            "frame of {len} bytes exceeds limit of {MAX_FRAME_SIZE}"
        )));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> HostResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    if body.len() > MAX_FRAME_SIZE {
        return Err(HostError::Protocol(format!(
            "frame of {} bytes exceeds limit of {MAX_FRAME_SIZE}",
            body.len()
        )));
    }
    let len = body.len() as u32;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_message<T, R>(reader: &mut R) -> HostResult<Option<T>>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin + ?Sized,
{
    match read_frame(reader).await? {
        Some(body) => serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| HostError::Protocol(format!("malformed message: {e}"))),
        None => Ok(None),
    }
}

pub async fn write_message<T, W>(writer: &mut W, message: &T) -> HostResult<()>
where
    T: Serialize + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let body = serde_json::to_vec(message)
        .map_err(|e| HostError::Protocol(format!("cannot encode message: {e}")))?;
    write_frame(writer, &body).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn frames_survive_a_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_message(&mut a, &json!({"seq": 1})).await.unwrap();
        let value: serde_json::Value = read_message(&mut b).await.unwrap().unwrap();
        assert_eq!(value["seq"], 1);
    }

    #[tokio::test]
    async fn clean_eof_is_none() {
        let (a, mut b) = tokio::io::duplex(64);
        drop(a);
        assert!(read_frame(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_prefix_is_protocol_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0, 0]).await.unwrap();
        drop(a);
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, HostError::Protocol(_)), "{err}");
    }

    #[tokio::test]
    async fn oversized_prefix_is_protocol_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(matches!(err, HostError::Protocol(_)));
    }

    #[tokio::test]
    async fn truncated_body_is_transport_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&10u32.to_be_bytes()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);
        let err = read_frame(&mut b).await.unwrap_err();
        assert!(err.is_transport());
    }
}
