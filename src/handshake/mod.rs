//! The HTTP Upgrade exchange that turns a connection into a WebSocket.
//!
//! [`HandshakeRequest`] and [`HandshakeResponse`] model the two HTTP heads of the opening
//! handshake. Headers are kept in an [`http::HeaderMap`]: names are case-insensitive and
//! every value sent for a name is kept, in arrival order.
//!
//! The negotiation itself lives in [`client`] (building the request and validating the
//! response) and [`server`] (validating the request and producing the response).
use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::{BufMut, Bytes, BytesMut};
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use sha1::{Digest, Sha1};
use thiserror::Error;

pub mod client;
pub mod extension;
pub(crate) mod http1;
pub mod server;

pub use extension::Extension;

/// The only protocol version this engine speaks.
pub const WEBSOCKET_VERSION: &str = "13";

/// GUID appended to the client key before hashing it into the accept key.
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// A failed protocol negotiation.
///
/// Carries an HTTP status code and an explanatory message. On the server side it becomes the
/// error response written back on the connection, which is then not upgraded.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Handshake error ({code}): {message}")]
pub struct HandshakeError {
    code: u16,
    message: String,
}

impl HandshakeError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// A `400 Bad Request` error.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// The HTTP response reporting this error to the peer.
    ///
    /// A `426 Upgrade Required` response advertises the supported version.
    pub fn to_response(&self) -> HandshakeResponse {
        let status = StatusCode::from_u16(self.code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = HandshakeResponse::new(status, Some(self.message.clone()));
        if status == StatusCode::UPGRADE_REQUIRED {
            response.insert(
                header::SEC_WEBSOCKET_VERSION,
                HeaderValue::from_static(WEBSOCKET_VERSION),
            );
        }
        response.insert(header::CONTENT_LENGTH, HeaderValue::from_static("0"));
        response
    }
}

/// Generates a fresh `Sec-WebSocket-Key`: 16 random bytes, base64 encoded.
pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    STANDARD.encode(nonce)
}

/// Computes the `Sec-WebSocket-Accept` value matching a client key.
pub fn accept_key(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(sha1.finalize())
}

/// Returns every comma separated element of every value of `name`, trimmed, in order.
pub fn header_list(headers: &HeaderMap, name: impl header::AsHeaderName) -> Vec<String> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Whether any element of the `name` header list equals `token`, ignoring ASCII case.
pub(crate) fn has_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    header_list(headers, name)
        .iter()
        .any(|item| item.eq_ignore_ascii_case(token))
}

/// The request half of the opening handshake, or a proxy `CONNECT` request.
#[derive(Debug, Clone)]
pub struct HandshakeRequest {
    method: Method,
    path: String,
    query: Option<String>,
    secure: bool,
    headers: HeaderMap,
}

impl HandshakeRequest {
    pub(crate) fn new(method: Method, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (target.to_owned(), None),
        };
        Self {
            method,
            path,
            query,
            secure: false,
            headers: HeaderMap::new(),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Path plus query string, as written on the request line.
    pub fn request_uri(&self) -> String {
        match &self.query {
            Some(query) => format!("{}?{}", self.path, query),
            None => self.path.clone(),
        }
    }

    /// Whether the request travelled (or will travel) over TLS.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of `name`, if present and printable.
    pub fn header(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub(crate) fn set_secure(&mut self, secure: bool) {
        self.secure = secure;
    }

    pub(crate) fn insert(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.insert(name, value);
    }

    pub(crate) fn append(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.append(name, value);
    }

    /// Serializes the request head.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_slice(self.method.as_str().as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(self.request_uri().as_bytes());
        buf.put_slice(b" HTTP/1.1\r\n");
        http1::write_headers(&self.headers, &mut buf);
        buf.freeze()
    }
}

impl fmt::Display for HandshakeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.request_uri())
    }
}

/// The response half of the opening handshake, or a proxy's answer to `CONNECT`.
#[derive(Debug, Clone)]
pub struct HandshakeResponse {
    status: StatusCode,
    reason: Option<String>,
    headers: HeaderMap,
}

impl HandshakeResponse {
    pub(crate) fn new(status: StatusCode, reason: Option<String>) -> Self {
        Self {
            status,
            reason,
            headers: HeaderMap::new(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The reason phrase sent on the status line, falling back to the canonical one.
    pub fn reason(&self) -> &str {
        self.reason
            .as_deref()
            .or_else(|| self.status.canonical_reason())
            .unwrap_or("")
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn header(&self, name: impl header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub(crate) fn insert(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.insert(name, value);
    }

    pub(crate) fn append(&mut self, name: HeaderName, value: HeaderValue) {
        self.headers.append(name, value);
    }

    /// Serializes the response head.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(256);
        buf.put_slice(format!("HTTP/1.1 {} {}\r\n", self.status.as_u16(), self.reason()).as_bytes());
        http1::write_headers(&self.headers, &mut buf);
        buf.freeze()
    }
}

impl fmt::Display for HandshakeResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status.as_u16(), self.reason())
    }
}
