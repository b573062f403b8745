// =============================================================================
// Frame codec — 4-byte big-endian length prefix over a growable buffer
// =============================================================================
//
// The broker stream is a sequence of frames: a u32 length header followed by
// that many bytes of protobuf envelope. The codec accumulates raw reads and
// yields as many complete frames as the buffer holds, keeping any partial
// frame for the next read. The length header is only consumed together with
// its full frame, so partial reads can never misalign the stream.
// =============================================================================

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ConnectorError;

/// Frames larger than this are rejected as a protocol error.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Stateful decoder for the length-prefixed frame stream.
#[derive(Debug, Default)]
pub struct FrameCodec {
    buffer: BytesMut,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Append raw bytes from the transport.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Pop the next complete frame, if the buffer holds one.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, ConnectorError> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }

        let len = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;

        if len > MAX_FRAME_LEN {
            return Err(ConnectorError::Protocol(format!(
                "frame length {len} exceeds cap {MAX_FRAME_LEN}"
            )));
        }

        if self.buffer.len() < 4 + len {
            return Ok(None);
        }

        self.buffer.advance(4);
        Ok(Some(self.buffer.split_to(len).freeze()))
    }

    /// Bytes currently buffered (partial frame included).
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Prepend the length header to an encoded envelope.
pub fn encode_frame(envelope: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(4 + envelope.len());
    out.put_u32(envelope.len() as u32);
    out.extend_from_slice(envelope);
    out.freeze()
}
