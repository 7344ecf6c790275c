//! Framed bridge transport over Unix domain sockets.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use rkyv::util::AlignedVec;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};

use crate::codec::{Codec, FrameHeader, MessageType, FRAME_HEADER_SIZE};
use crate::error::ProtocolError;
use crate::work::BridgeMessage;

/// Unix socket listener owned by the worker side of the bridge.
///
/// Removes a stale socket file on bind and unlinks the file again on drop.
#[derive(Debug)]
pub struct BridgeListener {
    inner: UnixListener,
    path: PathBuf,
}

impl BridgeListener {
    /// Binds to the given socket path.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self, ProtocolError> {
        let path = path.as_ref();

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let inner = UnixListener::bind(path)?;
        Ok(Self {
            inner,
            path: path.to_path_buf(),
        })
    }

    /// Accepts the next connection.
    pub async fn accept(&self) -> Result<UnixStream, ProtocolError> {
        let (stream, _addr) = self.inner.accept().await?;
        Ok(stream)
    }

    /// Path of the backing socket file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for BridgeListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Reads one bridge message.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly between frames.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<BridgeMessage>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; FRAME_HEADER_SIZE];
    match reader.read_exact(&mut header_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let header = FrameHeader::decode(&header_buf)?;
    header.validate()?;

    if header.message_type != MessageType::Bridge {
        return Err(ProtocolError::UnexpectedMessageType {
            expected: MessageType::Bridge.as_u16(),
            actual: header.message_type.as_u16(),
        });
    }

    let mut payload = AlignedVec::<16>::with_capacity(header.payload_len as usize);
    payload.resize(header.payload_len as usize, 0);
    reader.read_exact(&mut payload).await?;

    Codec::decode(&payload).map(Some)
}

/// Writes one bridge message and flushes it.
pub async fn write_message<W>(
    writer: &mut W,
    codec: &mut Codec,
    message: &BridgeMessage,
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let frame = codec.encode(message, MessageType::Bridge)?;
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BridgeResponse, RequestId, WorkItem, WorkResponse};

    #[tokio::test]
    async fn message_exchange_over_socket() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("bridge.sock");

        let listener = BridgeListener::bind(&sock_path).unwrap();
        assert!(sock_path.exists());

        let server = tokio::spawn(async move {
            let mut stream = listener.accept().await.unwrap();
            let message = read_message(&mut stream).await.unwrap().unwrap();
            let BridgeMessage::Invoke(item) = message else {
                panic!("expected invoke");
            };

            let reply = BridgeMessage::Response(BridgeResponse {
                logs: Vec::new(),
                callback_data: WorkResponse::with_status(item.request_id, 201, "created"),
            });
            let mut codec = Codec::new();
            write_message(&mut stream, &mut codec, &reply).await.unwrap();
        });

        let mut client = UnixStream::connect(&sock_path).await.unwrap();
        let mut codec = Codec::new();
        let item = WorkItem::builder(RequestId::from("req-7"), "cb").build();
        write_message(&mut client, &mut codec, &BridgeMessage::Invoke(item))
            .await
            .unwrap();

        let Some(BridgeMessage::Response(response)) = read_message(&mut client).await.unwrap() else {
            panic!("expected response");
        };
        assert_eq!(response.callback_data.request_id, RequestId::from("req-7"));
        assert_eq!(response.callback_data.status_code, 201);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn clean_close_reads_as_none() {
        let (mut a, b) = UnixStream::pair().unwrap();
        drop(b);
        assert!(read_message(&mut a).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn socket_cleanup_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("cleanup.sock");

        {
            let _listener = BridgeListener::bind(&sock_path).unwrap();
            assert!(sock_path.exists());
        }

        assert!(!sock_path.exists());
    }

    #[tokio::test]
    async fn stale_socket_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("stale.sock");
        std::fs::write(&sock_path, b"leftover").unwrap();

        let listener = BridgeListener::bind(&sock_path).unwrap();
        assert_eq!(listener.path(), sock_path.as_path());
    }
}
