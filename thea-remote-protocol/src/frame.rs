use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::*;

use thea_remote_common::MAX_FRAME_SIZE;

use crate::messages::RemoteMessage;

#[derive(thiserror::Error, Debug)]
pub enum WireError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    FrameTooLarge(usize),
    #[error("connection closed mid-frame")]
    UnexpectedEof,
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Length-prefixed message transport: each frame is a `u32` big-endian
/// byte count followed by that many bytes of JSON.
///
/// Outgoing messages accumulate in a buffer until [MessageStream::flush];
/// incoming bytes accumulate until a whole frame is available.
pub struct MessageStream<S> {
    stream: S,
    inbound_buffer: BytesMut,
    outbound_buffer: BytesMut,
}

impl<S> MessageStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            inbound_buffer: BytesMut::new(),
            outbound_buffer: BytesMut::new(),
        }
    }

    /// Queues one message; returns its on-the-wire size including the
    /// length prefix.
    pub fn push(&mut self, message: &RemoteMessage) -> Result<usize, WireError> {
        trace!(?message, "sending");
        let body = serde_json::to_vec(message)?;
        if body.len() > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge(body.len()));
        }
        self.outbound_buffer.put_u32(body.len() as u32);
        self.outbound_buffer.extend_from_slice(&body);
        Ok(4 + body.len())
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }
}

impl<S> MessageStream<S>
where
    S: AsyncWrite + Unpin,
{
    pub async fn flush(&mut self) -> Result<(), WireError> {
        self.stream.write_all(&self.outbound_buffer[..]).await?;
        self.outbound_buffer = BytesMut::new();
        self.stream.flush().await?;
        Ok(())
    }
}

impl<S> MessageStream<S>
where
    S: AsyncRead + Unpin,
{
    /// Receives one raw frame body. `Ok(None)` means the peer closed the
    /// connection cleanly between frames.
    pub async fn recv(&mut self) -> Result<Option<Bytes>, WireError> {
        loop {
            if self.inbound_buffer.len() >= 4 {
                let declared = u32::from_be_bytes([
                    self.inbound_buffer[0],
                    self.inbound_buffer[1],
                    self.inbound_buffer[2],
                    self.inbound_buffer[3],
                ]) as usize;
                if declared > MAX_FRAME_SIZE {
                    return Err(WireError::FrameTooLarge(declared));
                }
                if self.inbound_buffer.len() >= 4 + declared {
                    self.inbound_buffer.advance(4);
                    let body = self.inbound_buffer.split_to(declared).freeze();
                    return Ok(Some(body));
                }
            }

            let read_bytes = self.stream.read_buf(&mut self.inbound_buffer).await?;
            if read_bytes == 0 {
                if self.inbound_buffer.is_empty() {
                    return Ok(None);
                }
                return Err(WireError::UnexpectedEof);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{DecodedMessage, RemoteMessage};

    fn frame_bytes(message: &RemoteMessage) -> Vec<u8> {
        let body = serde_json::to_vec(message).unwrap();
        let mut out = Vec::new();
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    #[tokio::test]
    async fn test_push_then_recv_round_trip() {
        let (client, server) = tokio::io::duplex(1024);
        let mut tx = MessageStream::new(client);
        let mut rx = MessageStream::new(server);

        let message = RemoteMessage::Error("boom".into());
        tx.push(&message).unwrap();
        tx.flush().await.unwrap();

        let body = rx.recv().await.unwrap().unwrap();
        match RemoteMessage::decode(&body) {
            DecodedMessage::Known(decoded) => assert_eq!(decoded, message),
            other => panic!("unexpected decode result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_partial_frames_accumulate() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut rx = MessageStream::new(server);

        let bytes = frame_bytes(&RemoteMessage::Error("split".into()));
        let (a, b) = bytes.split_at(3);

        tokio::io::AsyncWriteExt::write_all(&mut client, a).await.unwrap();
        let pending =
            tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv()).await;
        assert!(pending.is_err());

        tokio::io::AsyncWriteExt::write_all(&mut client, b).await.unwrap();
        let body = rx.recv().await.unwrap().unwrap();
        assert!(matches!(
            RemoteMessage::decode(&body),
            DecodedMessage::Known(RemoteMessage::Error(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut rx = MessageStream::new(server);

        let declared = (thea_remote_common::MAX_FRAME_SIZE + 1) as u32;
        tokio::io::AsyncWriteExt::write_all(&mut client, &declared.to_be_bytes())
            .await
            .unwrap();
        assert!(matches!(
            rx.recv().await,
            Err(WireError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_frame_at_limit_is_accepted() {
        // A frame of exactly MAX_FRAME_SIZE bytes must pass the length
        // check (the body here is not valid JSON; only framing is tested).
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let mut rx = MessageStream::new(server);

        let declared = thea_remote_common::MAX_FRAME_SIZE as u32;
        let writer = tokio::spawn(async move {
            client.write_all(&declared.to_be_bytes()).await.unwrap();
            let chunk = vec![b'x'; 64 * 1024];
            let mut remaining = thea_remote_common::MAX_FRAME_SIZE;
            while remaining > 0 {
                let n = remaining.min(chunk.len());
                client.write_all(&chunk[..n]).await.unwrap();
                remaining -= n;
            }
        });

        let body = rx.recv().await.unwrap().unwrap();
        assert_eq!(body.len(), thea_remote_common::MAX_FRAME_SIZE);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_eof_mid_frame_is_an_error() {
        let (mut client, server) = tokio::io::duplex(1024);
        let mut rx = MessageStream::new(server);

        let bytes = frame_bytes(&RemoteMessage::Error("cut".into()));
        tokio::io::AsyncWriteExt::write_all(&mut client, &bytes[..5])
            .await
            .unwrap();
        drop(client);

        assert!(matches!(rx.recv().await, Err(WireError::UnexpectedEof)));
    }

    #[tokio::test]
    async fn test_clean_eof_returns_none() {
        let (client, server) = tokio::io::duplex(1024);
        let mut rx = MessageStream::new(server);
        drop(client);
        assert!(rx.recv().await.unwrap().is_none());
    }
}
