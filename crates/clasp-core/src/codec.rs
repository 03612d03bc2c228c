//! Message payload codec
//!
//! Payloads are MessagePack maps in named-field mode, so every payload is
//! self-describing and carries a `"type"` key naming the message. The
//! format is deterministic in size, forward-compatible (unknown optional
//! keys are skipped), and embedded-friendly.

use crate::error::Result;
use crate::frame;
use crate::message::Message;
use bytes::Bytes;

/// Encode a message payload (no frame prefix)
pub fn encode_payload(message: &Message) -> Result<Vec<u8>> {
    Ok(rmp_serde::to_vec_named(message)?)
}

/// Decode a message payload (no frame prefix)
pub fn decode_payload(bytes: &[u8]) -> Result<Message> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Encode a message into a complete length-prefixed frame
pub fn encode(message: &Message) -> Result<Bytes> {
    let payload = encode_payload(message)?;
    Ok(frame::encode_frame(&payload))
}

/// Decode a single whole frame into a message
pub fn decode(frame_bytes: &[u8], max_frame: usize) -> Result<Message> {
    let payload = frame::decode_frame(frame_bytes, max_frame)?;
    decode_payload(&payload)
}
