//! Close codes and close reasons, as carried by close frames.
//!
//! A close frame payload is either empty or a 2-byte big-endian status code optionally
//! followed by a UTF-8 reason phrase. Control frames are limited to 125 bytes, which leaves
//! at most [`MAX_REASON_LEN`] bytes for the phrase.
//!
//! See [RFC 6455 Section 7.4](https://datatracker.ietf.org/doc/html/rfc6455#section-7.4).
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Result, WebSocketError};

/// Longest reason phrase that fits in a close frame next to the status code.
pub const MAX_REASON_LEN: usize = 123;

/// Status code sent in a close frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseCode {
    /// 1000: the purpose for which the connection was established has been fulfilled.
    Normal,
    /// 1001: an endpoint is going away, e.g. a server shutting down or a dropped connection.
    Away,
    /// 1002: the endpoint is terminating the connection due to a protocol error.
    Protocol,
    /// 1003: the endpoint received a type of data it cannot accept.
    Unsupported,
    /// 1005: no status code was present. Never sent on the wire.
    Status,
    /// 1006: the connection was closed abnormally. Never sent on the wire.
    Abnormal,
    /// 1007: a message contained data inconsistent with its type, e.g. non UTF-8 text.
    Invalid,
    /// 1008: a message violated the endpoint's policy.
    Policy,
    /// 1009: a message was too big to process.
    Size,
    /// 1010: the client expected the server to negotiate an extension it did not.
    Extension,
    /// 1011: the server encountered an unexpected condition.
    Error,
    /// 1015: TLS handshake failure. Never sent on the wire.
    Tls,
    /// Any other code below 3000 that has no defined meaning.
    Reserved(u16),
    /// 3000-3999: codes registered with IANA by libraries and frameworks.
    Iana(u16),
    /// 4000-4999: private use, defined by applications.
    Library(u16),
    /// Codes below 1000 or above 4999.
    Bad(u16),
}

impl CloseCode {
    /// Whether this code may appear in a close frame exchanged with a peer.
    ///
    /// Standard codes 1000-1003 and 1007-1011 are accepted, so are the registered (3000-3999)
    /// and application (4000-4999) ranges. Everything else is rejected during close-frame
    /// validation.
    pub fn is_allowed(self) -> bool {
        !matches!(
            self,
            Self::Status | Self::Abnormal | Self::Tls | Self::Reserved(_) | Self::Bad(_)
        )
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::Away,
            1002 => Self::Protocol,
            1003 => Self::Unsupported,
            1005 => Self::Status,
            1006 => Self::Abnormal,
            1007 => Self::Invalid,
            1008 => Self::Policy,
            1009 => Self::Size,
            1010 => Self::Extension,
            1011 => Self::Error,
            1015 => Self::Tls,
            1000..=2999 => Self::Reserved(code),
            3000..=3999 => Self::Iana(code),
            4000..=4999 => Self::Library(code),
            _ => Self::Bad(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::Away => 1001,
            CloseCode::Protocol => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::Status => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::Invalid => 1007,
            CloseCode::Policy => 1008,
            CloseCode::Size => 1009,
            CloseCode::Extension => 1010,
            CloseCode::Error => 1011,
            CloseCode::Tls => 1015,
            CloseCode::Reserved(code)
            | CloseCode::Iana(code)
            | CloseCode::Library(code)
            | CloseCode::Bad(code) => code,
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u16::from(*self))
    }
}

/// The code and phrase a session was closed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    code: CloseCode,
    reason: String,
}

impl CloseReason {
    /// Creates a close reason, failing if the phrase is longer than [`MAX_REASON_LEN`] bytes.
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Result<Self> {
        let reason = reason.into();
        if reason.len() > MAX_REASON_LEN {
            return Err(WebSocketError::ReasonTooLong(reason.len()));
        }
        Ok(Self { code, reason })
    }

    /// Code 1000 with an empty phrase, the default for [`Session::close`](crate::Session::close).
    pub fn normal() -> Self {
        Self {
            code: CloseCode::Normal,
            reason: String::new(),
        }
    }

    /// Builds a reason from text composed by the engine itself, cutting the phrase at the last
    /// character boundary that fits.
    pub(crate) fn truncated(code: CloseCode, reason: impl Into<String>) -> Self {
        let mut reason = reason.into();
        if reason.len() > MAX_REASON_LEN {
            let mut end = MAX_REASON_LEN;
            while !reason.is_char_boundary(end) {
                end -= 1;
            }
            reason.truncate(end);
        }
        Self { code, reason }
    }

    pub fn code(&self) -> CloseCode {
        self.code
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Parses the payload of a received close frame.
    ///
    /// An empty payload yields code 1005 (no status). Payloads of one byte, codes that are not
    /// [allowed](CloseCode::is_allowed) and phrases that are not UTF-8 are rejected.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        match payload.len() {
            0 => Ok(Self {
                code: CloseCode::Status,
                reason: String::new(),
            }),
            1 => Err(WebSocketError::InvalidCloseFrame),
            _ => {
                let raw = u16::from_be_bytes([payload[0], payload[1]]);
                let code = CloseCode::from(raw);
                if !code.is_allowed() {
                    return Err(WebSocketError::InvalidCloseCode(raw));
                }
                let reason = crate::utf8(&payload[2..])?;
                Self::new(code, reason)
            }
        }
    }

    /// Serializes this reason into a close frame payload.
    ///
    /// Codes that must never be sent on the wire (1005, 1006, 1015) produce an empty payload.
    pub fn encode(&self) -> Bytes {
        if matches!(
            self.code,
            CloseCode::Status | CloseCode::Abnormal | CloseCode::Tls
        ) {
            return Bytes::new();
        }
        let mut payload = BytesMut::with_capacity(2 + self.reason.len());
        payload.put_u16(u16::from(self.code));
        payload.extend_from_slice(self.reason.as_bytes());
        payload.freeze()
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reason.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.reason)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod close_code_tests {
        use super::*;

        #[test]
        fn test_standard_codes_are_allowed() {
            for code in [1000, 1001, 1002, 1003, 1007, 1008, 1009, 1010, 1011] {
                assert!(CloseCode::from(code).is_allowed(), "code {code}");
            }
        }

        #[test]
        fn test_application_and_registered_codes_are_allowed() {
            for code in [3000, 3999, 4000, 4321, 4999] {
                assert!(CloseCode::from(code).is_allowed(), "code {code}");
            }
        }

        #[test]
        fn test_reserved_codes_are_rejected() {
            for code in [0, 999, 1004, 1005, 1006, 1012, 1014, 1015, 1016, 2999, 5000] {
                assert!(!CloseCode::from(code).is_allowed(), "code {code}");
            }
        }

        #[test]
        fn test_u16_conversion_is_lossless() {
            for code in [1000u16, 1005, 1012, 2500, 3000, 4500, 6000] {
                assert_eq!(u16::from(CloseCode::from(code)), code);
            }
        }
    }

    mod close_reason_tests {
        use super::*;

        #[test]
        fn test_encode_and_parse() {
            let reason = CloseReason::new(CloseCode::Library(4001), "going home").unwrap();
            let payload = reason.encode();

            assert_eq!(&payload[..2], &4001u16.to_be_bytes());
            assert_eq!(&payload[2..], b"going home");
            assert_eq!(CloseReason::parse(&payload).unwrap(), reason);
        }

        #[test]
        fn test_empty_payload_is_no_status() {
            let reason = CloseReason::parse(&[]).unwrap();
            assert_eq!(reason.code(), CloseCode::Status);
            assert_eq!(reason.reason(), "");
        }

        #[test]
        fn test_single_byte_payload_is_invalid() {
            assert!(matches!(
                CloseReason::parse(&[0x03]),
                Err(WebSocketError::InvalidCloseFrame)
            ));
        }

        #[test]
        fn test_reserved_code_is_rejected() {
            let payload = 1004u16.to_be_bytes();
            assert!(matches!(
                CloseReason::parse(&payload),
                Err(WebSocketError::InvalidCloseCode(1004))
            ));
        }

        #[test]
        fn test_invalid_utf8_reason() {
            let payload = [0x03, 0xE8, 0xFF, 0xFE];
            assert!(matches!(
                CloseReason::parse(&payload),
                Err(WebSocketError::InvalidUTF8)
            ));
        }

        #[test]
        fn test_reason_length_limit() {
            assert!(CloseReason::new(CloseCode::Normal, "a".repeat(MAX_REASON_LEN)).is_ok());
            assert!(matches!(
                CloseReason::new(CloseCode::Normal, "a".repeat(MAX_REASON_LEN + 1)),
                Err(WebSocketError::ReasonTooLong(124))
            ));
        }

        #[test]
        fn test_truncated_respects_char_boundaries() {
            let reason = CloseReason::truncated(CloseCode::Size, "é".repeat(100));
            assert!(reason.reason().len() <= MAX_REASON_LEN);
            assert_eq!(reason.reason().len() % 2, 0);
        }

        #[test]
        fn test_never_sent_codes_encode_empty() {
            let reason = CloseReason::truncated(CloseCode::Abnormal, "lost");
            assert!(reason.encode().is_empty());
        }
    }
}
