//! Client-side framing for talking to the proxy.
//!
//! Requests and responses use different frame shapes, so the two directions
//! get separate types: [`RequestEncoder`] only writes requests carrying a
//! routing key and [`FrameReader`] only reads plain responses. Split a socket
//! (for example with `TcpStream::into_split`) and hand one half to each.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::core::FrameCodec;
use crate::error::FrameError;

/// Encode a single client request frame with the default size limit.
pub fn encode_client_request(payload: &[u8], routing_key: u32) -> Result<Bytes, FrameError> {
    FrameCodec::default()
        .client_request_frame(payload, routing_key)
        .map(|frame| frame.freeze())
}

/// Write half of a proxy client: frames payloads and appends the routing key.
pub struct RequestEncoder<W> {
    writer: W,
    codec: FrameCodec,
    routing_key: u32,
}

impl<W: AsyncWrite + Unpin> RequestEncoder<W> {
    pub fn new(writer: W) -> Self {
        Self::with_codec(writer, FrameCodec::default())
    }

    pub fn with_codec(writer: W, codec: FrameCodec) -> Self {
        Self {
            writer,
            codec,
            routing_key: 0,
        }
    }

    /// Key carried by every following request until changed
    pub fn set_routing_key(&mut self, routing_key: u32) {
        self.routing_key = routing_key;
    }

    pub fn routing_key(&self) -> u32 {
        self.routing_key
    }

    /// Write `payload` as one request frame and flush it.
    pub async fn write_request(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        let frame = self.codec.client_request_frame(payload, self.routing_key)?;
        self.writer.write_all(&frame).await?;
        self.writer.flush().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Read half of a proxy client: decodes plain response frames.
pub struct FrameReader<R> {
    reader: R,
    codec: FrameCodec,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self::with_codec(reader, FrameCodec::default())
    }

    pub fn with_codec(reader: R, codec: FrameCodec) -> Self {
        Self { reader, codec }
    }

    /// Read one response. The proxy closing the connection instead of
    /// answering surfaces as `FrameError::Truncated`.
    pub async fn read_response(&mut self) -> Result<Bytes, FrameError> {
        self.codec.decode_backend_frame(&mut self.reader).await
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}
