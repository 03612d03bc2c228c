//! Wire framing
//!
//! Every frame on every transport is the same record:
//! ```text
//! ┌────────────────────────────────────────────┐
//! │ Bytes 0-3:  payload length (u32 big-endian)│
//! │ Payload:    MessagePack message (codec)    │
//! └────────────────────────────────────────────┘
//! ```
//! Stream transports (TCP, QUIC) delimit frames with the prefix via
//! [`FrameDecoder`]; message transports (WebSocket, UDP) carry exactly one
//! whole frame per message and validate the prefix against the message
//! length.

use crate::error::{Error, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Length prefix size in bytes
pub const LEN_PREFIX: usize = 4;

/// Prepend the length prefix to a payload
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LEN_PREFIX + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);
    buf.freeze()
}

/// Extract the payload of a single whole frame (message transports).
pub fn decode_frame(frame: &[u8], max_frame: usize) -> Result<Bytes> {
    if frame.len() < LEN_PREFIX {
        return Err(Error::Malformed(format!(
            "frame shorter than length prefix: {} bytes",
            frame.len()
        )));
    }
    let declared = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    if LEN_PREFIX + declared > max_frame {
        return Err(Error::FrameTooLarge {
            len: LEN_PREFIX + declared,
            max: max_frame,
        });
    }
    if frame.len() != LEN_PREFIX + declared {
        return Err(Error::Malformed(format!(
            "declared {} payload bytes, got {}",
            declared,
            frame.len() - LEN_PREFIX
        )));
    }
    Ok(Bytes::copy_from_slice(&frame[LEN_PREFIX..]))
}

/// Incremental frame decoder for byte-stream transports.
///
/// Feed raw bytes with [`push`](Self::push), then drain complete payloads
/// with [`next_frame`](Self::next_frame). An oversized declared length
/// poisons the decoder; the connection must be torn down.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_frame: usize,
    poisoned: bool,
}

impl FrameDecoder {
    pub fn new(max_frame: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_frame,
            poisoned: false,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        if !self.poisoned {
            self.buf.extend_from_slice(bytes);
        }
    }

    /// Next complete payload, `Ok(None)` when more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>> {
        if self.poisoned {
            return Err(Error::Malformed("decoder poisoned".to_string()));
        }
        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }

        let declared =
            u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if LEN_PREFIX + declared > self.max_frame {
            self.poisoned = true;
            return Err(Error::FrameTooLarge {
                len: LEN_PREFIX + declared,
                max: self.max_frame,
            });
        }
        if self.buf.len() < LEN_PREFIX + declared {
            return Ok(None);
        }

        self.buf.advance(LEN_PREFIX);
        Ok(Some(self.buf.split_to(declared).freeze()))
    }

    /// Bytes buffered but not yet consumed
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
