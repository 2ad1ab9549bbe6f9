//! # wsengine
//! A WebSocket protocol engine (RFC 6455) shared by a client container and a server container.
//!
//! The engine negotiates the HTTP-to-WebSocket upgrade, encodes and decodes wire frames,
//! reassembles fragmented messages and owns the lifecycle of every upgraded connection
//! (open, closing, closed, idle timeout, close-code negotiation).
//!
//! The protocol core is sans-io. It only talks to a [`Transport`](transport::Transport), which is able to
//! write bytes, close the connection and, for proxied `wss://` targets, switch the channel to TLS
//! after the tunnel has been established. The [`net`] module drives any tokio stream through
//! that core, which is how [`ClientContainer`] and [`ServerContainer`] reach the network.
//!
//! # Features
//! The crate provides several optional features that can be enabled in your `Cargo.toml`:
//!
//! - `logging` (default): Enables debug logging for connection negotiation and frame processing using the `log` crate.
//!
//! - `json`: Enables serialization of JSON data through [`BasicRemote::send_json`](session::BasicRemote::send_json).
//!
//! - `simd`: Validates UTF-8 text payloads with `simdutf8`.
//!
//! # Client Example
//! ```no_run
//! use wsengine::{ClientContainer, ClientEndpointConfig, Handlers, Message};
//!
//! async fn client_connect() -> wsengine::Result<()> {
//!     let endpoint = Handlers::new().on_message(|session, message| {
//!         if let Message::Text(text) = message {
//!             let _ = session.basic_remote().and_then(|remote| remote.send_text(text));
//!         }
//!     });
//!
//!     let client = ClientContainer::new();
//!     let session = client
//!         .connect(endpoint, ClientEndpointConfig::default(), "ws://localhost:8025/echo")
//!         .await?;
//!
//!     session.basic_remote()?.send_text("Hello")?;
//!     session.close()?;
//!     Ok(())
//! }
//! ```
//!
//! # Server Example
//! ```no_run
//! use wsengine::{Handlers, Message, ServerContainer, ServerEndpointConfig};
//!
//! async fn serve() -> wsengine::Result<()> {
//!     let echo = Handlers::new().on_message(|session, message| {
//!         if let (Message::Text(text), Ok(remote)) = (message, session.basic_remote()) {
//!             let _ = remote.send_text(text);
//!         }
//!     });
//!
//!     let container = ServerContainer::builder()
//!         .endpoint(ServerEndpointConfig::new("/echo"), echo)
//!         .deploy()?;
//!
//!     let server = container.bind("127.0.0.1:8025").await?;
//!     server.wait().await;
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod client;
pub mod close;
pub mod codec;
pub mod config;
pub mod deploy;
pub mod frame;
pub mod handshake;
mod interceptor;
mod mask;
pub mod message;
pub mod net;
pub mod server;
pub mod session;
pub mod transport;

use thiserror::Error;

pub use client::ClientContainer;
pub use close::{CloseCode, CloseReason};
pub use config::{ClientEndpointConfig, ContainerConfig, ServerEndpointConfig};
pub use deploy::{DeploymentError, ErrorCollector};
pub use frame::{Frame, OpCode};
pub use handshake::{HandshakeError, HandshakeRequest, HandshakeResponse};
pub use message::Message;
pub use server::ServerContainer;
pub use session::{AsyncRemote, BasicRemote, Endpoint, Handlers, Session, SessionState};

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Which side of the connection this engine is playing.
///
/// The role decides the masking rules: a client masks every frame it sends and expects
/// unmasked frames back, a server does the opposite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// Represents errors that can occur during WebSocket operations.
///
/// The errors are broadly categorized into:
///
/// - Protocol errors raised by the frame codec (invalid frames, incorrect sequence of fragments)
/// - Negotiation errors ([`HandshakeError`]) and configuration errors ([`DeploymentError`])
/// - Lifecycle errors, when a session is used in a state that does not allow the operation
/// - I/O and transport errors
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// Occurs when receiving a data frame that starts a new message while a fragmented
    /// message is still in progress.
    #[error("Invalid fragment")]
    InvalidFragment,

    /// Indicates that a text message or close frame reason contains invalid UTF-8 data.
    #[error("Invalid UTF-8")]
    InvalidUTF8,

    /// Occurs when receiving a continuation frame without a preceding initial frame.
    #[error("Invalid continuation frame")]
    InvalidContinuationFrame,

    /// Indicates that a received close frame has an invalid format, such as
    /// containing a payload of 1 byte (close frames must be either empty or ≥2 bytes).
    #[error("Invalid close frame")]
    InvalidCloseFrame,

    /// A close frame carried a status code that is reserved or otherwise not allowed on the wire.
    #[error("Invalid close code: {0}")]
    InvalidCloseCode(u16),

    /// The reason phrase of a close frame does not fit in a control frame.
    #[error("Close reason is {0} bytes long, the limit is 123")]
    ReasonTooLong(usize),

    /// Reserved bits are set. No extension with a wire encoding is ever activated, so
    /// all three bits must be zero.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// Occurs when a control frame (ping, pong, or close) is received with the FIN bit not set.
    #[error("Control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame payload exceeds 125 bytes.
    #[error("Control frame too large")]
    ControlFrameTooLarge,

    /// Occurs when a received frame's payload length exceeds the maximum configured size.
    #[error("Frame too large")]
    FrameTooLarge,

    /// Indicates receipt of a frame with an invalid opcode value.
    #[error("Invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// A server received a frame without a masking key.
    #[error("Client frames must be masked")]
    MissingMask,

    /// A client received a masked frame.
    #[error("Server frames must not be masked")]
    UnexpectedMask,

    /// A reassembled message exceeds the maximum size configured for its type.
    #[error("Message too long; allowed message size is {max} bytes. (Current message length is {size} bytes)")]
    MessageTooBig { size: usize, max: usize },

    /// The operation is not allowed in the current session or writer state.
    #[error("Illegal state: {0}")]
    IllegalState(&'static str),

    /// The opening handshake failed.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// Configuration or binding failure surfaced at connect or deploy time.
    #[error(transparent)]
    Deployment(#[from] DeploymentError),

    /// The HTTP head of a handshake or proxy response could not be parsed.
    #[error("Malformed HTTP message: {0}")]
    InvalidHttp(String),

    /// Returned when attempting operations on a connection that the transport already closed.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// An asynchronous operation did not complete in time.
    #[error("Operation timed out")]
    Timeout,

    /// Wraps errors from URL parsing that may occur when processing WebSocket URLs.
    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    /// Wraps standard I/O errors that may occur during WebSocket communication,
    /// such as connection resets or network timeouts.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Occurs when serialization of JSON data fails.
    /// Only available when the `json` feature is enabled.
    #[cfg(feature = "json")]
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl WebSocketError {
    /// The close code a session sends when it fails with this error.
    pub(crate) fn close_code(&self) -> CloseCode {
        match self {
            Self::FrameTooLarge | Self::MessageTooBig { .. } => CloseCode::Size,
            Self::InvalidUTF8 => CloseCode::Invalid,
            Self::InvalidOpCode(_) => CloseCode::Unsupported,
            Self::InvalidFragment
            | Self::InvalidContinuationFrame
            | Self::InvalidCloseFrame
            | Self::InvalidCloseCode(_)
            | Self::ReasonTooLong(_)
            | Self::ReservedBitsNotZero
            | Self::ControlFrameFragmented
            | Self::ControlFrameTooLarge
            | Self::MissingMask
            | Self::UnexpectedMask => CloseCode::Protocol,
            _ => CloseCode::Error,
        }
    }
}

/// Checks that `payload` is valid UTF-8, with `simdutf8` when the `simd` feature is enabled.
#[inline]
pub(crate) fn utf8(payload: &[u8]) -> Result<&str> {
    #[cfg(feature = "simd")]
    {
        simdutf8::basic::from_utf8(payload).map_err(|_| WebSocketError::InvalidUTF8)
    }
    #[cfg(not(feature = "simd"))]
    {
        std::str::from_utf8(payload).map_err(|_| WebSocketError::InvalidUTF8)
    }
}
