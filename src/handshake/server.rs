//! Server side of the opening handshake.
use base64::{engine::general_purpose::STANDARD, Engine};
use http::{header, HeaderValue, Method, StatusCode};

use super::{
    accept_key, client::Negotiated, has_token, header_list, Extension, HandshakeError,
    HandshakeRequest, HandshakeResponse, WEBSOCKET_VERSION,
};
use crate::config::ServerEndpointConfig;

/// Whether `request` asks for a WebSocket upgrade at all.
///
/// Requests without `Upgrade: websocket` are ordinary HTTP and are not the engine's business.
pub fn is_upgrade_request(request: &HandshakeRequest) -> bool {
    has_token(request.headers(), header::UPGRADE, "websocket")
}

/// Validates an upgrade request and negotiates it against the endpoint's configuration.
///
/// The subprotocol is the first one offered by the client that the endpoint supports. The
/// extensions are those offered by the client whose names the endpoint accepts, in the
/// client's order.
///
/// # Returns
/// The `101 Switching Protocols` response with what was negotiated, or the error whose
/// [`to_response`](HandshakeError::to_response) must be sent instead.
pub fn accept(
    request: &HandshakeRequest,
    config: &ServerEndpointConfig,
) -> Result<(HandshakeResponse, Negotiated), HandshakeError> {
    if *request.method() != Method::GET {
        return Err(HandshakeError::new(
            405,
            format!("Method {} is not allowed for a WebSocket upgrade", request.method()),
        ));
    }
    if !is_upgrade_request(request) {
        return Err(HandshakeError::bad_request("Invalid Upgrade header"));
    }
    if !has_token(request.headers(), header::CONNECTION, "upgrade") {
        return Err(HandshakeError::bad_request("Invalid Connection header"));
    }
    if request.header(header::SEC_WEBSOCKET_VERSION).map(str::trim) != Some(WEBSOCKET_VERSION) {
        return Err(HandshakeError::new(426, "Unsupported WebSocket protocol version"));
    }

    let key = request
        .header(header::SEC_WEBSOCKET_KEY)
        .map(str::trim)
        .ok_or_else(|| HandshakeError::bad_request("Missing Sec-WebSocket-Key header"))?;
    if !matches!(STANDARD.decode(key), Ok(nonce) if nonce.len() == 16) {
        return Err(HandshakeError::bad_request("Invalid Sec-WebSocket-Key header"));
    }

    let offered = header_list(request.headers(), header::SEC_WEBSOCKET_PROTOCOL);
    let subprotocol = offered
        .into_iter()
        .find(|protocol| config.subprotocols.contains(protocol));

    let requested = header_list(request.headers(), header::SEC_WEBSOCKET_EXTENSIONS);
    let extensions: Vec<Extension> = Extension::parse_list(requested.iter().map(String::as_str))
        .map_err(|err| HandshakeError::bad_request(err.to_string()))?
        .into_iter()
        .filter(|ext| config.extensions.iter().any(|name| name == ext.name()))
        .collect();

    let mut response = HandshakeResponse::new(StatusCode::SWITCHING_PROTOCOLS, None);
    response.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    response.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
    let accept = HeaderValue::from_str(&accept_key(key))
        .map_err(|_| HandshakeError::bad_request("Invalid Sec-WebSocket-Key header"))?;
    response.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
    if let Some(protocol) = &subprotocol {
        if let Ok(value) = HeaderValue::from_str(protocol) {
            response.insert(header::SEC_WEBSOCKET_PROTOCOL, value);
        }
    }
    for ext in &extensions {
        if let Ok(value) = HeaderValue::from_str(&ext.to_string()) {
            response.append(header::SEC_WEBSOCKET_EXTENSIONS, value);
        }
    }

    Ok((
        response,
        Negotiated {
            subprotocol,
            extensions,
        },
    ))
}
