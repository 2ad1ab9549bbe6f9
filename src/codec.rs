//! Incremental frame codec.
//!
//! The [`Decoder`] never assumes that a read ends on a frame boundary: it consumes what it can
//! from the buffer, remembers where it stopped and resumes when more bytes arrive. The
//! [`Encoder`] masks every outgoing frame when playing the client role and never masks when
//! playing the server role.
use bytes::{Buf, BytesMut};
use tokio_util::codec;

use crate::{
    frame::{Frame, OpCode, MAX_CONTROL_PAYLOAD, MAX_HEAD_SIZE},
    Role, WebSocketError,
};

/// Default upper bound for the payload of a single frame, 16 MiB.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 << 20;

/// Represents the reading state of a WebSocket frame.
enum ReadState {
    /// The two fixed header bytes were read, waiting for the extended length and mask.
    Header(Header),
    /// The full header was read, waiting for the payload.
    Payload(HeaderAndMask),
}

/// Represents the initial header fields of a WebSocket frame.
struct Header {
    fin: bool,
    masked: bool,
    opcode: OpCode,
    /// Number of extended length bytes (0, 2 or 8).
    extra: usize,
    /// The 7-bit length field.
    length_code: u8,
    /// Bytes still to read before the payload: extended length plus mask.
    header_size: usize,
}

/// Contains header and mask data after decoding the bytes before the payload.
struct HeaderAndMask {
    header: Header,
    mask: Option<[u8; 4]>,
    payload_len: usize,
}

/// A combined codec that provides both encoding and decoding of frames for one role.
pub struct Codec {
    decoder: Decoder,
    encoder: Encoder,
}

impl Codec {
    /// Creates the codec used by an endpoint playing `role`.
    pub fn new(role: Role, max_frame_size: usize) -> Self {
        Self {
            decoder: Decoder::new(role, max_frame_size),
            encoder: Encoder::new(role),
        }
    }
}

impl From<(Decoder, Encoder)> for Codec {
    fn from((decoder, encoder): (Decoder, Encoder)) -> Self {
        Self { decoder, encoder }
    }
}

impl codec::Decoder for Codec {
    type Item = <Decoder as codec::Decoder>::Item;
    type Error = <Decoder as codec::Decoder>::Error;

    #[inline]
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decoder.decode(src)
    }
}

impl codec::Encoder<Frame> for Codec {
    type Error = <Encoder as codec::Encoder<Frame>>::Error;

    #[inline]
    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encoder.encode(item, dst)
    }
}

/// A decoder for WebSocket frames.
///
/// The decoder validates everything that can be checked on a single frame: reserved bits,
/// opcodes, control frame constraints, the masking rule for its role and the frame size
/// limit. Decoded frames are always returned unmasked.
pub struct Decoder {
    role: Role,
    state: Option<ReadState>,
    max_payload_size: usize,
}

impl Decoder {
    /// Creates a decoder for an endpoint playing `role`, rejecting payloads above `max_payload_size`.
    pub fn new(role: Role, max_payload_size: usize) -> Self {
        Self {
            role,
            state: None,
            max_payload_size,
        }
    }
}

impl codec::Decoder for Decoder {
    type Item = Frame;
    type Error = WebSocketError;

    /// Decodes the next frame from `src`.
    ///
    /// # Returns
    /// - `Ok(Some(Frame))` once the header and the full declared payload are available.
    /// - `Ok(None)` if more data is needed. Already consumed header bytes are kept in the decoder state.
    /// - `Err(WebSocketError)` on a protocol violation.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state.take() {
                None => {
                    if src.remaining() < 2 {
                        return Ok(None);
                    }

                    let fin = src[0] & 0b1000_0000 != 0;
                    if src[0] & 0b0111_0000 != 0 {
                        return Err(WebSocketError::ReservedBitsNotZero);
                    }

                    let opcode = OpCode::try_from(src[0] & 0b0000_1111)?;
                    let masked = src[1] & 0b1000_0000 != 0;
                    let length_code = src[1] & 0x7F;

                    match (self.role, masked) {
                        (Role::Server, false) => return Err(WebSocketError::MissingMask),
                        (Role::Client, true) => return Err(WebSocketError::UnexpectedMask),
                        _ => {}
                    }

                    let extra = match length_code {
                        126 => 2,
                        127 => 8,
                        _ => 0,
                    };
                    let header_size = extra + masked as usize * 4;
                    src.advance(2);

                    self.state = Some(ReadState::Header(Header {
                        fin,
                        masked,
                        opcode,
                        extra,
                        length_code,
                        header_size,
                    }));
                }
                Some(ReadState::Header(header)) => {
                    if src.remaining() < header.header_size {
                        self.state = Some(ReadState::Header(header));
                        return Ok(None);
                    }

                    let payload_len = match header.extra {
                        0 => usize::from(header.length_code),
                        2 => src.get_u16() as usize,
                        _ => usize::try_from(src.get_u64())
                            .map_err(|_| WebSocketError::FrameTooLarge)?,
                    };

                    let mask = if header.masked {
                        Some(src.get_u32().to_be_bytes())
                    } else {
                        None
                    };

                    if header.opcode.is_control() {
                        if !header.fin {
                            return Err(WebSocketError::ControlFrameFragmented);
                        }
                        if payload_len > MAX_CONTROL_PAYLOAD {
                            return Err(WebSocketError::ControlFrameTooLarge);
                        }
                    }
                    if payload_len > self.max_payload_size {
                        return Err(WebSocketError::FrameTooLarge);
                    }

                    self.state = Some(ReadState::Payload(HeaderAndMask {
                        header,
                        mask,
                        payload_len,
                    }));
                }
                Some(ReadState::Payload(header_and_mask)) => {
                    if src.remaining() < header_and_mask.payload_len {
                        src.reserve(header_and_mask.payload_len - src.remaining());
                        self.state = Some(ReadState::Payload(header_and_mask));
                        return Ok(None);
                    }

                    let HeaderAndMask {
                        header,
                        mask,
                        payload_len,
                    } = header_and_mask;

                    let payload = src.split_to(payload_len);
                    let mut frame = Frame::new(header.fin, header.opcode, mask, payload);
                    frame.unmask();

                    break Ok(Some(frame));
                }
            }
        }
    }
}

/// Serializes frames, masking them when the encoder plays the client role.
pub struct Encoder {
    role: Role,
}

impl Encoder {
    pub fn new(role: Role) -> Self {
        Self { role }
    }
}

impl codec::Encoder<Frame> for Encoder {
    type Error = WebSocketError;

    fn encode(&mut self, mut frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match self.role {
            Role::Client => frame.mask(),
            Role::Server => frame.unmask(),
        }

        let mut header = [0; MAX_HEAD_SIZE];
        let size = frame.fmt_head(&mut header[..]);

        dst.reserve(size + frame.payload.len());
        dst.extend_from_slice(&header[..size]);
        dst.extend_from_slice(&frame.payload);

        Ok(())
    }
}
