/// Length-prefixed frame codec
///
/// Two wire shapes share one 4-byte big-endian length prefix:
///
/// ```text
/// client request : [len = n + 4][payload (n bytes)][routing key (u32, big-endian)]
/// everything else: [len = n][payload (n bytes)]
/// ```
///
/// Responses to the client and all backend traffic use the plain shape.
use crate::error::FrameError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix in bytes
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Size of the trailing routing key in a client request body
pub const ROUTING_KEY_LEN: usize = 4;

/// Default maximum frame body size, matching the stock framed RPC transport
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16_384_000;

/// A decoded client request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientFrame {
    pub routing_key: u32,
    pub payload: Bytes,
}

/// Frame encoder/decoder bounded by a maximum frame size
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Read one client request frame.
    ///
    /// Returns `Ok(None)` when the stream ends cleanly on a frame boundary.
    pub async fn decode_client_frame<R>(
        &self,
        reader: &mut R,
    ) -> Result<Option<ClientFrame>, FrameError>
    where
        R: AsyncRead + Unpin,
    {
        let len = match read_length(reader).await? {
            Some(len) => len,
            None => return Ok(None),
        };

        if (len as usize) < ROUTING_KEY_LEN {
            return Err(FrameError::TooShort { len });
        }

        let mut payload = self.read_body(reader, len).await?;
        let mut key = payload.split_off(payload.len() - ROUTING_KEY_LEN);

        Ok(Some(ClientFrame {
            routing_key: key.get_u32(),
            payload: payload.freeze(),
        }))
    }

    /// Read one plain frame from a backend. A backend that closes before
    /// answering yields `FrameError::Truncated`.
    pub async fn decode_backend_frame<R>(&self, reader: &mut R) -> Result<Bytes, FrameError>
    where
        R: AsyncRead + Unpin,
    {
        let len = read_length(reader)
            .await?
            .ok_or(FrameError::Truncated {
                expected: LENGTH_PREFIX_LEN,
            })?;

        Ok(self.read_body(reader, len).await?.freeze())
    }

    /// Write `payload` as one plain frame and flush it
    pub async fn encode_frame<W>(&self, writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
    where
        W: AsyncWrite + Unpin,
    {
        let frame = self.frame(payload)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Build a plain frame in memory
    pub fn frame(&self, payload: &[u8]) -> Result<BytesMut, FrameError> {
        self.check_size(payload.len())?;

        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);
        Ok(buf)
    }

    /// Build a client request frame carrying `routing_key` after the payload
    pub fn client_request_frame(
        &self,
        payload: &[u8],
        routing_key: u32,
    ) -> Result<BytesMut, FrameError> {
        let body_len = payload.len() + ROUTING_KEY_LEN;
        self.check_size(body_len)?;

        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + body_len);
        buf.put_u32(body_len as u32);
        buf.put_slice(payload);
        buf.put_u32(routing_key);
        Ok(buf)
    }

    fn check_size(&self, len: usize) -> Result<(), FrameError> {
        if len > self.max_frame_size || len > u32::MAX as usize {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_frame_size,
            });
        }
        Ok(())
    }

    async fn read_body<R>(&self, reader: &mut R, len: u32) -> Result<BytesMut, FrameError>
    where
        R: AsyncRead + Unpin,
    {
        let len = len as usize;
        // Checked before allocating so a garbled prefix cannot reserve gigabytes
        self.check_size(len)?;

        let mut body = BytesMut::zeroed(len);
        reader
            .read_exact(&mut body)
            .await
            .map_err(|e| FrameError::from_read(e, len))?;
        Ok(body)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

/// Read the 4-byte prefix, distinguishing a clean close from a torn one
async fn read_length<R>(reader: &mut R) -> Result<Option<u32>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    let mut filled = 0;

    while filled < LENGTH_PREFIX_LEN {
        let n = reader.read(&mut prefix[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(FrameError::Truncated {
                expected: LENGTH_PREFIX_LEN,
            });
        }
        filled += n;
    }

    Ok(Some(u32::from_be_bytes(prefix)))
}
