//! # Frame
//!
//! WebSocket frames as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//! A frame is the atomic unit on the wire. It carries a slice of a message (or a control
//! signal) plus the protocol metadata needed to reassemble it.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! ```
//!
//! Data frames (`Text`, `Binary`, `Continuation`) carry application payload, possibly split
//! across several frames. Control frames (`Close`, `Ping`, `Pong`) are never fragmented and
//! may be interleaved with the fragments of a data message.
//!
//! ```rust
//! use wsengine::frame::{Frame, OpCode};
//! use wsengine::close::CloseReason;
//!
//! let text = Frame::text("Hello, WebSocket!");
//! let first = Frame::new(false, OpCode::Binary, None, &b"part"[..]);
//! let last = Frame::continuation(true, &b"-two"[..]);
//! let close = Frame::close(&CloseReason::normal());
//! # assert!(text.fin && !first.fin && last.fin && close.opcode == OpCode::Close);
//! ```
use bytes::BytesMut;

use crate::{close::CloseReason, WebSocketError};

/// WebSocket operation code, determining how a frame is interpreted.
///
/// The numeric values are defined in [RFC 6455, Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8).
/// The ranges 0x3-0x7 and 0xB-0xF are reserved and rejected when decoding.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` for `Close`, `Ping` and `Pong`.
    ///
    /// Control frames must have the FIN bit set and a payload of at most 125 bytes.
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// Largest control frame payload allowed by the protocol.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Upper bound of an encoded frame header: 2 fixed bytes, 8 bytes of extended length, 4 bytes of mask.
pub(crate) const MAX_HEAD_SIZE: usize = 16;

/// A single WebSocket frame.
///
/// Frames are transient: the decoder produces them from the read buffer and the message
/// assembler consumes them, and on the way out the session builds them and the encoder
/// serializes them. Whether a frame gets masked is decided by the encoder's [`Role`](crate::Role),
/// never by the caller.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Indicates if this is the final frame in a message.
    pub fin: bool,
    /// The opcode of the frame, defining its type.
    pub opcode: OpCode,
    /// The masking key, present on client-to-server frames.
    mask: Option<[u8; 4]>,
    /// The payload of the frame.
    pub payload: BytesMut,
}

impl Frame {
    /// Creates a new frame.
    pub fn new(
        fin: bool,
        opcode: OpCode,
        mask: Option<[u8; 4]>,
        payload: impl Into<BytesMut>,
    ) -> Self {
        Self {
            fin,
            opcode,
            mask,
            payload: payload.into(),
        }
    }

    /// A complete, single-frame text message.
    pub fn text(payload: impl AsRef<str>) -> Self {
        Self::new(true, OpCode::Text, None, payload.as_ref().as_bytes())
    }

    /// A complete, single-frame binary message.
    pub fn binary(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Binary, None, payload.as_ref())
    }

    /// A continuation of the message in progress.
    pub fn continuation(fin: bool, payload: impl AsRef<[u8]>) -> Self {
        Self::new(fin, OpCode::Continuation, None, payload.as_ref())
    }

    pub fn ping(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Ping, None, payload.as_ref())
    }

    pub fn pong(payload: impl AsRef<[u8]>) -> Self {
        Self::new(true, OpCode::Pong, None, payload.as_ref())
    }

    /// A close frame carrying `reason`.
    pub fn close(reason: &CloseReason) -> Self {
        Self::new(true, OpCode::Close, None, &reason.encode()[..])
    }

    /// Checks if the frame payload is valid UTF-8.
    #[inline(always)]
    pub fn is_utf8(&self) -> bool {
        crate::utf8(&self.payload).is_ok()
    }

    /// Masks the payload, generating a random key if none was set.
    pub(crate) fn mask(&mut self) {
        let mask = *self.mask.get_or_insert_with(rand::random);
        crate::mask::apply_mask(&mut self.payload, mask);
    }

    /// Reverses masking and forgets the key.
    pub(crate) fn unmask(&mut self) {
        if let Some(mask) = self.mask.take() {
            crate::mask::apply_mask(&mut self.payload, mask);
        }
    }

    /// Writes the frame header into `head` and returns how many bytes were used.
    ///
    /// # Panics
    /// Panics if `head` is shorter than [`MAX_HEAD_SIZE`].
    pub(crate) fn fmt_head(&self, head: &mut [u8]) -> usize {
        head[0] = (self.fin as u8) << 7 | u8::from(self.opcode);

        let len = self.payload.len();
        let size = if len < 126 {
            head[1] = len as u8;
            2
        } else if len < 65536 {
            head[1] = 126;
            head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
            4
        } else {
            head[1] = 127;
            head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
            10
        };

        match self.mask {
            Some(mask) => {
                head[1] |= 0x80;
                head[size..size + 4].copy_from_slice(&mask);
                size + 4
            }
            None => size,
        }
    }
}
