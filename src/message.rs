//! Message reassembly.
//!
//! The [`Assembler`] turns the decoded frame sequence of one connection back into messages:
//! continuation frames are merged into the message in progress until a final frame completes
//! it, while control frames are surfaced immediately, even in the middle of a fragmented
//! message.
use bytes::{Bytes, BytesMut};

use crate::{
    close::CloseReason,
    frame::{Frame, OpCode},
    Result, WebSocketError,
};

/// A complete message delivered to an [`Endpoint`](crate::Endpoint).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
    /// Payload of a pong frame, usually the answer to [`BasicRemote::send_ping`](crate::BasicRemote::send_ping).
    Pong(Bytes),
}

impl Message {
    /// Payload size in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) | Self::Pong(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a frame amounted to once it went through the [`Assembler`].
#[derive(Debug)]
pub(crate) enum Incoming {
    Message(Message),
    Ping(Bytes),
    Close(CloseReason),
}

/// Header of the fragmented message in progress.
struct Fragment {
    opcode: OpCode,
}

/// Per-connection reassembly of fragmented messages.
pub(crate) struct Assembler {
    fragment: Option<Fragment>,
    accumulated: BytesMut,
    /// Hard cap for a message being accumulated, independent of the per-type limits the
    /// session checks once the message is complete.
    max_accumulated: usize,
}

impl Assembler {
    pub(crate) fn new(max_accumulated: usize) -> Self {
        Self {
            fragment: None,
            accumulated: BytesMut::new(),
            max_accumulated,
        }
    }

    /// Feeds one decoded frame.
    ///
    /// # Returns
    /// - `Ok(Some(Incoming))` when the frame completed a message or is a control frame.
    /// - `Ok(None)` when the frame was a non-final fragment.
    /// - `Err(WebSocketError)` when fragments arrive out of sequence, a text message is not
    ///   UTF-8 or a close frame is malformed.
    pub(crate) fn push(&mut self, frame: Frame) -> Result<Option<Incoming>> {
        match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                if self.fragment.is_some() {
                    return Err(WebSocketError::InvalidFragment);
                }

                if frame.fin {
                    return complete(frame.opcode, frame.payload).map(Some);
                }

                self.fragment = Some(Fragment {
                    opcode: frame.opcode,
                });
                self.accumulated.extend_from_slice(&frame.payload);
                Ok(None)
            }
            OpCode::Continuation => {
                let opcode = match &self.fragment {
                    Some(fragment) => fragment.opcode,
                    None => return Err(WebSocketError::InvalidContinuationFrame),
                };

                if self.accumulated.len() + frame.payload.len() > self.max_accumulated {
                    return Err(WebSocketError::FrameTooLarge);
                }
                self.accumulated.extend_from_slice(&frame.payload);

                if !frame.fin {
                    return Ok(None);
                }

                self.fragment = None;
                let payload = std::mem::take(&mut self.accumulated);
                complete(opcode, payload).map(Some)
            }
            OpCode::Ping => Ok(Some(Incoming::Ping(frame.payload.freeze()))),
            OpCode::Pong => Ok(Some(Incoming::Message(Message::Pong(
                frame.payload.freeze(),
            )))),
            OpCode::Close => CloseReason::parse(&frame.payload)
                .map(Incoming::Close)
                .map(Some),
        }
    }
}

fn complete(opcode: OpCode, payload: BytesMut) -> Result<Incoming> {
    let message = if opcode == OpCode::Text {
        Message::Text(crate::utf8(&payload)?.to_owned())
    } else {
        Message::Binary(payload.freeze())
    };
    Ok(Incoming::Message(message))
}
