//! Binary frame codec for application messages
//!
//! Every application message exchanged over a live session is a single frame:
//!
//! ```text
//! ┌──────────────┬──────────────────────────────────────────┐
//! │ Type tag (1B)│ Payload (layout fixed by the tag)        │
//! └──────────────┴──────────────────────────────────────────┘
//! ```
//!
//! The tag is always read first. A [`MessageTable`] maps each tag to a
//! [`PayloadLayout`] and a decoder; the layout is checked against the frame
//! length before the decoder runs, so a frame is either fully parsed or
//! rejected. Variable-length payloads carry an explicit count byte followed
//! by that many fixed-size elements.
//!
//! Tag `0x00` is reserved for the keepalive frame, which is exactly one byte
//! long and never surfaces as an application message.

pub mod quantize;

use std::collections::HashMap;
use std::fmt;

pub use quantize::{
    dequantize_angle, dequantize_i16, dequantize_u16, quantize_angle, quantize_i16, quantize_u16,
    ANGLE_SCALE,
};

// ============================================================================
// Constants
// ============================================================================

/// Reserved tag of the keepalive frame
pub const KEEPALIVE_TAG: u8 = 0x00;

/// Length of the frame header (the type tag)
pub const TAG_LEN: usize = 1;

/// Maximum number of elements in a counted payload (count is one byte)
pub const MAX_COUNT: usize = u8::MAX as usize;

/// Encode the keepalive frame
pub fn encode_keepalive() -> [u8; 1] {
    [KEEPALIVE_TAG]
}

/// Check whether a raw frame is the keepalive frame
pub fn is_keepalive(frame: &[u8]) -> bool {
    frame == [KEEPALIVE_TAG]
}

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while encoding, decoding or building a message table
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Frame has no bytes at all
    Empty,
    /// No entry registered for this tag
    UnknownTag(u8),
    /// Payload length does not match the layout registered for the tag
    LengthMismatch {
        tag: u8,
        expected: usize,
        actual: usize,
    },
    /// Reader ran past the end of the payload
    Truncated { needed: usize, remaining: usize },
    /// Decoder returned without consuming the whole payload
    TrailingBytes { tag: u8, remaining: usize },
    /// Tag 0x00 cannot be registered for an application message
    ReservedTag,
    /// Tag registered twice in the same table
    DuplicateTag(u8),
    /// Counted payload with more than 255 elements
    CountOverflow(usize),
    /// Quantized value does not fit in its integer field
    OutOfRange { value: String, scale: String },
    /// Decoded field holds a value the message type does not accept
    InvalidField(&'static str),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Empty => write!(f, "empty frame"),
            CodecError::UnknownTag(tag) => write!(f, "unknown type tag 0x{:02x}", tag),
            CodecError::LengthMismatch {
                tag,
                expected,
                actual,
            } => write!(
                f,
                "payload length mismatch for tag 0x{:02x}: expected {} bytes, got {}",
                tag, expected, actual
            ),
            CodecError::Truncated { needed, remaining } => write!(
                f,
                "truncated payload: need {} bytes, {} remaining",
                needed, remaining
            ),
            CodecError::TrailingBytes { tag, remaining } => write!(
                f,
                "{} trailing bytes after decoding tag 0x{:02x}",
                remaining, tag
            ),
            CodecError::ReservedTag => write!(f, "tag 0x00 is reserved for keepalive"),
            CodecError::DuplicateTag(tag) => write!(f, "tag 0x{:02x} registered twice", tag),
            CodecError::CountOverflow(count) => {
                write!(f, "count {} exceeds maximum {}", count, MAX_COUNT)
            }
            CodecError::OutOfRange { value, scale } => {
                write!(f, "value {} out of range at scale {}", value, scale)
            }
            CodecError::InvalidField(field) => write!(f, "invalid value in field '{}'", field),
        }
    }
}

impl std::error::Error for CodecError {}

// ============================================================================
// Payload Layout
// ============================================================================

/// Length discipline of a payload, declared per tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadLayout {
    /// Exactly `n` payload bytes
    Fixed(usize),
    /// `prefix` fixed bytes, one count byte, then `count * element` bytes
    Counted { prefix: usize, element: usize },
}

impl PayloadLayout {
    /// Zero-length payload
    pub const EMPTY: PayloadLayout = PayloadLayout::Fixed(0);

    /// Validate a payload length against this layout
    fn check(&self, tag: u8, payload: &[u8]) -> Result<(), CodecError> {
        let expected = match *self {
            PayloadLayout::Fixed(n) => n,
            PayloadLayout::Counted { prefix, element } => {
                let count = *payload.get(prefix).ok_or(CodecError::LengthMismatch {
                    tag,
                    expected: prefix + 1,
                    actual: payload.len(),
                })? as usize;
                prefix + 1 + count * element
            }
        };

        if payload.len() != expected {
            return Err(CodecError::LengthMismatch {
                tag,
                expected,
                actual: payload.len(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// Frame Writer / Reader
// ============================================================================

/// Append-only payload builder (big-endian integers)
#[derive(Debug, Default)]
pub struct FrameWriter {
    buf: Vec<u8>,
}

impl FrameWriter {
    fn with_tag(tag: u8) -> Self {
        let mut buf = Vec::with_capacity(16);
        buf.push(tag);
        Self { buf }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_bool(&mut self, value: bool) {
        self.buf.push(value as u8);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_i16(&mut self, value: i16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Write an element count (one byte)
    pub fn put_count(&mut self, count: usize) -> Result<(), CodecError> {
        if count > MAX_COUNT {
            return Err(CodecError::CountOverflow(count));
        }
        self.buf.push(count as u8);
        Ok(())
    }

    /// Number of payload bytes written so far (tag excluded)
    pub fn payload_len(&self) -> usize {
        self.buf.len() - TAG_LEN
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a validated payload
#[derive(Debug)]
pub struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        Self { buf: payload, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let remaining = self.remaining();
        if n > remaining {
            return Err(CodecError::Truncated {
                needed: n,
                remaining,
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn bool(&mut self) -> Result<bool, CodecError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(CodecError::InvalidField("bool")),
        }
    }

    pub fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn i16(&mut self) -> Result<i16, CodecError> {
        let b = self.take(2)?;
        Ok(i16::from_be_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    /// Read an element count (one byte)
    pub fn count(&mut self) -> Result<usize, CodecError> {
        Ok(self.u8()? as usize)
    }
}

// ============================================================================
// Message Table
// ============================================================================

/// An application message that knows its own tag and payload encoding
pub trait WireMessage: Sized {
    /// Discriminator written as the first byte of the frame
    fn type_tag(&self) -> u8;

    /// Write the payload (everything after the tag)
    fn write_payload(&self, w: &mut FrameWriter) -> Result<(), CodecError>;
}

/// Payload decoder registered for one tag
pub type Decoder<M> = fn(&mut FrameReader<'_>) -> Result<M, CodecError>;

struct Entry<M> {
    layout: PayloadLayout,
    decoder: Decoder<M>,
}

/// Result of decoding one frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame<M> {
    /// Liveness-only frame
    Keepalive,
    /// Application message
    Message(M),
}

/// Per-game table mapping type tags to payload layouts and decoders
pub struct MessageTable<M> {
    entries: HashMap<u8, Entry<M>>,
}

impl<M: WireMessage> MessageTable<M> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register a tag; fails on the reserved tag or a duplicate
    pub fn register(
        mut self,
        tag: u8,
        layout: PayloadLayout,
        decoder: Decoder<M>,
    ) -> Result<Self, CodecError> {
        if tag == KEEPALIVE_TAG {
            return Err(CodecError::ReservedTag);
        }
        if self.entries.contains_key(&tag) {
            return Err(CodecError::DuplicateTag(tag));
        }
        self.entries.insert(tag, Entry { layout, decoder });
        Ok(self)
    }

    /// Whether a tag is registered
    pub fn contains(&self, tag: u8) -> bool {
        self.entries.contains_key(&tag)
    }

    /// Encode a message into a complete frame
    ///
    /// The encoded payload is checked against the registered layout so a
    /// message that would not decode on the other side is never sent.
    pub fn encode(&self, msg: &M) -> Result<Vec<u8>, CodecError> {
        let tag = msg.type_tag();
        let entry = self.entries.get(&tag).ok_or(CodecError::UnknownTag(tag))?;

        let mut w = FrameWriter::with_tag(tag);
        msg.write_payload(&mut w)?;
        let frame = w.finish();

        entry.layout.check(tag, &frame[TAG_LEN..])?;
        Ok(frame)
    }

    /// Decode one frame
    pub fn decode(&self, frame: &[u8]) -> Result<Frame<M>, CodecError> {
        let (&tag, payload) = frame.split_first().ok_or(CodecError::Empty)?;

        if tag == KEEPALIVE_TAG {
            if !payload.is_empty() {
                return Err(CodecError::LengthMismatch {
                    tag,
                    expected: 0,
                    actual: payload.len(),
                });
            }
            return Ok(Frame::Keepalive);
        }

        let entry = self.entries.get(&tag).ok_or(CodecError::UnknownTag(tag))?;
        entry.layout.check(tag, payload)?;

        let mut reader = FrameReader::new(payload);
        let msg = (entry.decoder)(&mut reader)?;
        if reader.remaining() != 0 {
            return Err(CodecError::TrailingBytes {
                tag,
                remaining: reader.remaining(),
            });
        }
        Ok(Frame::Message(msg))
    }

    /// Decode a frame, logging and dropping it on error
    pub fn decode_or_drop(&self, frame: &[u8]) -> Option<Frame<M>> {
        match self.decode(frame) {
            Ok(frame) => Some(frame),
            Err(e) => {
                log::debug!("Dropping frame ({} bytes): {}", frame.len(), e);
                None
            }
        }
    }
}

impl<M: WireMessage> Default for MessageTable<M> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================
