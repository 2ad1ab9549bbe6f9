//! Minimal HTTP/1.1 head parsing and serialization for the opening handshake.
//!
//! Only heads are handled: a request line or a status line followed by header lines and an
//! empty line. Bodies never take part in the handshake.
use bytes::{BufMut, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use nom::{
    bytes::complete::{tag, take_till1, take_while1},
    character::complete::{char, digit1, space0, space1},
    combinator::{map_res, opt, rest},
    sequence::preceded,
    IResult, Parser,
};

use super::{HandshakeRequest, HandshakeResponse};
use crate::{Result, WebSocketError};

/// Heads larger than this are refused instead of buffered further.
pub(crate) const MAX_HEAD_SIZE: usize = 8192;

/// A parsed HTTP head.
#[derive(Debug)]
pub(crate) enum Head {
    Request(HandshakeRequest),
    Response(HandshakeResponse),
}

fn is_token(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c)
}

fn request_line(input: &str) -> IResult<&str, (&str, &str)> {
    let (input, (method, _, target, _, _)) = (
        take_while1(is_token),
        space1,
        take_till1(|c: char| c == ' '),
        space1,
        preceded(tag("HTTP/1."), digit1),
    )
        .parse(input)?;
    Ok((input, (method, target)))
}

fn status_line(input: &str) -> IResult<&str, (u16, &str)> {
    let (input, (_, _, code, reason)) = (
        preceded(tag("HTTP/1."), digit1),
        space1,
        map_res(digit1, |code: &str| code.parse::<u16>()),
        opt(preceded(char(' '), rest)),
    )
        .parse(input)?;
    Ok((input, (code, reason.unwrap_or("").trim())))
}

fn header_line(input: &str) -> IResult<&str, (&str, &str)> {
    let (input, (name, _, _, value)) =
        (take_while1(is_token), char(':'), space0, rest).parse(input)?;
    Ok((input, (name, value.trim_end())))
}

fn invalid(message: impl Into<String>) -> WebSocketError {
    WebSocketError::InvalidHttp(message.into())
}

/// Tries to parse one HTTP head from the start of `buf`.
///
/// # Returns
/// - `Ok(Some((head, consumed)))` with the number of bytes the head occupied, terminator included.
/// - `Ok(None)` if the terminating empty line has not arrived yet.
/// - `Err(WebSocketError::InvalidHttp)` if the head is malformed or too large.
pub(crate) fn parse_head(buf: &[u8]) -> Result<Option<(Head, usize)>> {
    let window = &buf[..buf.len().min(MAX_HEAD_SIZE)];
    let Some(end) = window.windows(4).position(|window| window == b"\r\n\r\n") else {
        if buf.len() >= MAX_HEAD_SIZE {
            return Err(invalid(format!("head exceeds {MAX_HEAD_SIZE} bytes")));
        }
        return Ok(None);
    };

    let text = std::str::from_utf8(&buf[..end]).map_err(|_| invalid("head is not valid UTF-8"))?;
    let mut lines = text.split("\r\n");
    let start = lines.next().unwrap_or_default();

    let mut headers = HeaderMap::new();
    for line in lines {
        let (_, (name, value)) =
            header_line(line).map_err(|_| invalid(format!("bad header line {line:?}")))?;
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| invalid(format!("bad header name {name:?}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| invalid(format!("bad value for header {name}")))?;
        headers.append(name, value);
    }

    let head = if start.starts_with("HTTP/") {
        let (_, (code, reason)) =
            status_line(start).map_err(|_| invalid(format!("bad status line {start:?}")))?;
        let status =
            StatusCode::from_u16(code).map_err(|_| invalid(format!("bad status code {code}")))?;
        let reason = (!reason.is_empty()).then(|| reason.to_owned());
        let mut response = HandshakeResponse::new(status, reason);
        response.headers = headers;
        Head::Response(response)
    } else {
        let (_, (method, target)) =
            request_line(start).map_err(|_| invalid(format!("bad request line {start:?}")))?;
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|_| invalid(format!("bad method {method:?}")))?;
        let mut request = HandshakeRequest::new(method, target);
        request.headers = headers;
        Head::Request(request)
    };

    Ok(Some((head, end + 4)))
}

/// Writes one line per header name, joining repeated values with `", "`, then the empty line.
pub(crate) fn write_headers(headers: &HeaderMap, buf: &mut BytesMut) {
    for name in headers.keys() {
        let values: Vec<&str> = headers
            .get_all(name)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .collect();
        buf.put_slice(title_case(name.as_str()).as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(values.join(", ").as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
}

/// `sec-websocket-key` becomes `Sec-Websocket-Key`.
fn title_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        out.push(if upper { c.to_ascii_uppercase() } else { c });
        upper = c == '-';
    }
    out
}
