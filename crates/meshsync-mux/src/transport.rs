//! Physical stream abstraction for sessions.
//!
//! A [`MultiplexStream`] carries [`MuxMessage`] envelopes in both
//! directions. Implementations may use gRPC, raw TCP, or any other duplex
//! transport. A session calls `send` from exactly one task and `recv` from
//! exactly one other task.

use async_trait::async_trait;

use crate::error::Result;
use crate::messages::MuxMessage;
use crate::metadata::StreamMetadata;

/// One physical duplex stream to a peer.
#[async_trait]
pub trait MultiplexStream: Send + Sync {
    /// Send one message.
    async fn send(&self, message: MuxMessage) -> Result<()>;

    /// Receive the next message.
    ///
    /// Returns [`crate::MuxError::Eof`] when the stream ends normally.
    async fn recv(&self) -> Result<MuxMessage>;

    /// The metadata the stream was opened with.
    fn metadata(&self) -> &StreamMetadata;
}

/// In-memory duplex streams for testing.
pub mod memory {
    use super::*;
    use crate::error::MuxError;
    use tokio::sync::{mpsc, Mutex};
    use tokio_util::sync::CancellationToken;

    /// One end of an in-memory pipe.
    pub struct MemoryStream {
        tx: mpsc::Sender<MuxMessage>,
        rx: Mutex<mpsc::Receiver<MuxMessage>>,
        metadata: StreamMetadata,
        cancel: CancellationToken,
    }

    /// Create a connected pair of streams.
    ///
    /// Each direction buffers `capacity` messages; a sender blocks once the
    /// other side stops draining. `a` carries `a_metadata`, the metadata
    /// the peer presented to it.
    pub fn pipe(
        a_metadata: StreamMetadata,
        b_metadata: StreamMetadata,
        capacity: usize,
    ) -> (MemoryStream, MemoryStream) {
        let (a_tx, b_rx) = mpsc::channel(capacity.max(1));
        let (b_tx, a_rx) = mpsc::channel(capacity.max(1));
        let a = MemoryStream {
            tx: a_tx,
            rx: Mutex::new(a_rx),
            metadata: a_metadata,
            cancel: CancellationToken::new(),
        };
        let b = MemoryStream {
            tx: b_tx,
            rx: Mutex::new(b_rx),
            metadata: b_metadata,
            cancel: CancellationToken::new(),
        };
        (a, b)
    }

    impl MemoryStream {
        /// Token that ends this side's stream: pending and later `recv`
        /// calls return EOF, like a cancelled RPC context.
        pub fn cancel_token(&self) -> CancellationToken {
            self.cancel.clone()
        }
    }

    #[async_trait]
    impl MultiplexStream for MemoryStream {
        async fn send(&self, message: MuxMessage) -> Result<()> {
            if self.cancel.is_cancelled() {
                return Err(MuxError::Eof);
            }
            tokio::select! {
                _ = self.cancel.cancelled() => Err(MuxError::Eof),
                res = self.tx.send(message) => {
                    res.map_err(|_| MuxError::Transport("peer disconnected".into()))
                }
            }
        }

        async fn recv(&self) -> Result<MuxMessage> {
            let mut rx = self.rx.lock().await;
            tokio::select! {
                _ = self.cancel.cancelled() => Err(MuxError::Eof),
                msg = rx.recv() => msg.ok_or(MuxError::Eof),
            }
        }

        fn metadata(&self) -> &StreamMetadata {
            &self.metadata
        }
    }
}

/// Length-prefixed CBOR framing over any async byte stream.
///
/// Each frame is a 4-byte big-endian length followed by the CBOR encoding
/// of a [`MuxMessage`].
pub mod framed {
    use super::*;
    use crate::error::MuxError;
    use crate::messages::limits::MAX_FRAME_SIZE;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
    use tokio::sync::Mutex;

    /// A [`MultiplexStream`] over an `AsyncRead + AsyncWrite` connection.
    pub struct FramedStream<T> {
        reader: Mutex<ReadHalf<T>>,
        writer: Mutex<WriteHalf<T>>,
        metadata: StreamMetadata,
        max_frame_size: usize,
    }

    impl<T> FramedStream<T>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        pub fn new(io: T, metadata: StreamMetadata) -> Self {
            let (reader, writer) = tokio::io::split(io);
            Self {
                reader: Mutex::new(reader),
                writer: Mutex::new(writer),
                metadata,
                max_frame_size: MAX_FRAME_SIZE,
            }
        }

        pub fn with_max_frame_size(mut self, max: usize) -> Self {
            self.max_frame_size = max;
            self
        }
    }

    /// Encode one message as a frame.
    pub fn encode_frame(message: &MuxMessage, max: usize) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        ciborium::ser::into_writer(message, &mut body)
            .map_err(|e| MuxError::Codec(e.to_string()))?;
        if body.len() > max || body.len() > u32::MAX as usize {
            return Err(MuxError::FrameTooLarge {
                size: body.len(),
                max,
            });
        }
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    #[async_trait]
    impl<T> MultiplexStream for FramedStream<T>
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        async fn send(&self, message: MuxMessage) -> Result<()> {
            let frame = encode_frame(&message, self.max_frame_size)?;
            let mut writer = self.writer.lock().await;
            writer.write_all(&frame).await?;
            writer.flush().await?;
            Ok(())
        }

        async fn recv(&self) -> Result<MuxMessage> {
            let mut reader = self.reader.lock().await;

            let mut len_buf = [0u8; 4];
            reader.read_exact(&mut len_buf).await?;
            let len = u32::from_be_bytes(len_buf) as usize;
            if len > self.max_frame_size {
                return Err(MuxError::FrameTooLarge {
                    size: len,
                    max: self.max_frame_size,
                });
            }

            let mut body = vec![0u8; len];
            reader.read_exact(&mut body).await.map_err(|e| match e.kind() {
                std::io::ErrorKind::UnexpectedEof => {
                    MuxError::Transport("connection closed mid-frame".into())
                }
                _ => MuxError::from(e),
            })?;

            ciborium::de::from_reader(body.as_slice()).map_err(|e| MuxError::Codec(e.to_string()))
        }

        fn metadata(&self) -> &StreamMetadata {
            &self.metadata
        }
    }
}

#[cfg(test)]
mod tests {
    use super::framed::{encode_frame, FramedStream};
    use super::memory::pipe;
    use super::*;
    use crate::error::MuxError;
    use crate::messages::{DeltaDiscoveryRequest, DeltaDiscoveryResponse, WireResource};
    use bytes::Bytes;

    fn request(type_url: &str) -> MuxMessage {
        MuxMessage::DeltaRequest(DeltaDiscoveryRequest {
            type_url: type_url.into(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_memory_pipe_send_recv() {
        let (a, b) = pipe(StreamMetadata::new(), StreamMetadata::new(), 4);
        a.send(request("Mesh")).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), request("Mesh"));
    }

    #[tokio::test]
    async fn test_memory_pipe_eof_on_drop() {
        let (a, b) = pipe(StreamMetadata::new(), StreamMetadata::new(), 4);
        drop(a);
        assert_eq!(b.recv().await.unwrap_err(), MuxError::Eof);
    }

    #[tokio::test]
    async fn test_memory_pipe_cancel_is_eof() {
        let (a, _b) = pipe(StreamMetadata::new(), StreamMetadata::new(), 4);
        a.cancel_token().cancel();
        assert_eq!(a.recv().await.unwrap_err(), MuxError::Eof);
        assert_eq!(a.send(request("Mesh")).await.unwrap_err(), MuxError::Eof);
    }

    #[tokio::test]
    async fn test_framed_roundtrip_over_duplex() {
        let (left, right) = tokio::io::duplex(64 * 1024);
        let a = FramedStream::new(left, StreamMetadata::new());
        let b = FramedStream::new(right, StreamMetadata::new());

        let response = MuxMessage::DeltaResponse(DeltaDiscoveryResponse {
            type_url: "Mesh".into(),
            nonce: "1".into(),
            resources: vec![WireResource {
                name: "default".into(),
                version: "abc".into(),
                resource: Bytes::from_static(b"\x01\x02"),
            }],
            ..Default::default()
        });

        a.send(request("Mesh")).await.unwrap();
        a.send(response.clone()).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), request("Mesh"));
        assert_eq!(b.recv().await.unwrap(), response);
    }

    #[tokio::test]
    async fn test_framed_clean_close_is_eof() {
        let (left, right) = tokio::io::duplex(1024);
        let b = FramedStream::new(right, StreamMetadata::new());
        drop(left);
        assert_eq!(b.recv().await.unwrap_err(), MuxError::Eof);
    }

    #[tokio::test]
    async fn test_framed_rejects_oversized_frame() {
        let (left, right) = tokio::io::duplex(1024);
        let a = FramedStream::new(left, StreamMetadata::new());
        let b = FramedStream::new(right, StreamMetadata::new()).with_max_frame_size(8);

        a.send(request("a-long-enough-type-url")).await.unwrap();
        assert!(matches!(
            b.recv().await.unwrap_err(),
            MuxError::FrameTooLarge { max: 8, .. }
        ));
    }

    #[test]
    fn test_encode_frame_prefix() {
        let frame = encode_frame(&request("Mesh"), 1024).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);
    }
}
