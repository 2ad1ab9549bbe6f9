//! Client side of the opening handshake.
use http::{header, HeaderName, HeaderValue, Method, StatusCode};
use url::Url;

use super::{
    accept_key, generate_key, has_token, header_list, Extension, HandshakeError,
    HandshakeRequest, HandshakeResponse, WEBSOCKET_VERSION,
};
use crate::{
    config::ClientEndpointConfig,
    deploy::DeploymentError,
    session::Session,
    Result, WebSocketError,
};

/// What the two peers agreed on during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Negotiated {
    pub subprotocol: Option<String>,
    pub extensions: Vec<Extension>,
}

/// Receives the outcome of a client handshake.
///
/// Exactly one of [`on_error`](Self::on_error) or the
/// [`on_response`](Self::on_response) / [`on_connected`](Self::on_connected) pair is called.
pub trait ResponseListener: Send + Sync + 'static {
    /// The response was validated; the session is about to open.
    fn on_response(&self, response: &HandshakeResponse);

    /// The session is open.
    fn on_connected(&self, session: &Session);

    /// The handshake failed.
    fn on_error(&self, error: HandshakeError);
}

/// Builds the opening request for a target URI and validates the server's answer.
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    url: Url,
    key: String,
    request: HandshakeRequest,
    extensions: Vec<Extension>,
    subprotocols: Vec<String>,
}

impl ClientHandshake {
    /// Prepares the handshake for `url` with a fresh key.
    ///
    /// Fails with a [`DeploymentError`] unless the scheme is `ws` or `wss` and the URI names a host.
    pub fn new(url: &Url, config: &ClientEndpointConfig) -> Result<Self> {
        let secure = match url.scheme() {
            "ws" => false,
            "wss" => true,
            _ => {
                return Err(DeploymentError::new(format!(
                    "Incorrect scheme in WebSocket endpoint URI={url}"
                ))
                .into())
            }
        };
        let host = url.host_str().ok_or_else(|| {
            DeploymentError::new(format!("Missing host in WebSocket endpoint URI={url}"))
        })?;

        let target = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_owned(),
        };
        let key = generate_key();

        let mut request = HandshakeRequest::new(Method::GET, &target);
        request.set_secure(secure);
        let host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        };
        request.insert(header::HOST, header_value(&host)?);
        request.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        request.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        request.insert(header::SEC_WEBSOCKET_KEY, header_value(&key)?);
        request.insert(
            header::SEC_WEBSOCKET_VERSION,
            HeaderValue::from_static(WEBSOCKET_VERSION),
        );
        if !config.subprotocols.is_empty() {
            request.insert(
                header::SEC_WEBSOCKET_PROTOCOL,
                header_value(&config.subprotocols.join(", "))?,
            );
        }
        if !config.extensions.is_empty() {
            let offered: Vec<String> = config.extensions.iter().map(ToString::to_string).collect();
            request.insert(
                header::SEC_WEBSOCKET_EXTENSIONS,
                header_value(&offered.join(", "))?,
            );
        }
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                DeploymentError::new(format!("Invalid handshake header name {name:?}"))
            })?;
            request.append(name, header_value(value)?);
        }

        Ok(Self {
            url: url.clone(),
            key,
            request,
            extensions: config.extensions.clone(),
            subprotocols: config.subprotocols.clone(),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn request(&self) -> &HandshakeRequest {
        &self.request
    }

    pub fn is_secure(&self) -> bool {
        self.request.is_secure()
    }

    /// `host:port` of the target, as used on a proxy `CONNECT` line.
    pub fn authority(&self) -> String {
        let host = self.url.host_str().unwrap_or_default();
        let port = self.url.port_or_known_default().unwrap_or(80);
        format!("{host}:{port}")
    }

    /// The `CONNECT` request asking a forward proxy to open a tunnel to the target.
    pub fn tunnel_request(&self) -> HandshakeRequest {
        let authority = self.authority();
        let mut request = HandshakeRequest::new(Method::CONNECT, &authority);
        if let Ok(value) = HeaderValue::from_str(&authority) {
            request.insert(header::HOST, value);
        }
        request.insert(
            HeaderName::from_static("proxy-connection"),
            HeaderValue::from_static("keep-alive"),
        );
        request.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        request
    }

    /// Checks the server's answer against the request.
    ///
    /// The status must be 101, `Upgrade` and `Connection` must name the upgrade and the accept
    /// key must match. A subprotocol or extension the client did not offer is refused.
    pub fn validate(
        &self,
        response: &HandshakeResponse,
    ) -> std::result::Result<Negotiated, HandshakeError> {
        let status = response.status();
        let code = status.as_u16();
        if status != StatusCode::SWITCHING_PROTOCOLS {
            return Err(HandshakeError::new(
                code,
                format!("Response code was not 101: {code}."),
            ));
        }

        if !has_token(response.headers(), header::UPGRADE, "websocket") {
            return Err(HandshakeError::new(code, "Invalid Upgrade header"));
        }
        if !has_token(response.headers(), header::CONNECTION, "upgrade") {
            return Err(HandshakeError::new(code, "Invalid Connection header"));
        }

        let expected = accept_key(&self.key);
        if response.header(header::SEC_WEBSOCKET_ACCEPT) != Some(expected.as_str()) {
            return Err(HandshakeError::new(
                code,
                "Sec-WebSocket-Accept returned by the server is not valid",
            ));
        }

        let subprotocol = response
            .header(header::SEC_WEBSOCKET_PROTOCOL)
            .map(str::trim)
            .filter(|protocol| !protocol.is_empty())
            .map(str::to_owned);
        if let Some(protocol) = &subprotocol {
            if !self.subprotocols.contains(protocol) {
                return Err(HandshakeError::new(
                    code,
                    format!("Unexpected subprotocol {protocol:?}"),
                ));
            }
        }

        let accepted = header_list(response.headers(), header::SEC_WEBSOCKET_EXTENSIONS);
        let extensions = Extension::parse_list(accepted.iter().map(String::as_str))
            .map_err(|err| HandshakeError::new(code, err.to_string()))?;
        if let Some(unexpected) = extensions
            .iter()
            .find(|ext| !self.extensions.iter().any(|offered| offered.name() == ext.name()))
        {
            return Err(HandshakeError::new(
                code,
                format!("Unexpected extension {:?}", unexpected.name()),
            ));
        }

        Ok(Negotiated {
            subprotocol,
            extensions,
        })
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|_| {
        WebSocketError::from(DeploymentError::new(format!(
            "Invalid handshake header value {value:?}"
        )))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handshake(url: &str, config: &ClientEndpointConfig) -> ClientHandshake {
        ClientHandshake::new(&url.parse().unwrap(), config).unwrap()
    }

    fn accepting(handshake: &ClientHandshake) -> HandshakeResponse {
        let key = handshake.request().header(header::SEC_WEBSOCKET_KEY).unwrap();
        let mut response = HandshakeResponse::new(StatusCode::SWITCHING_PROTOCOLS, None);
        response.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        response.insert(header::CONNECTION, HeaderValue::from_static("Upgrade"));
        response.insert(
            header::SEC_WEBSOCKET_ACCEPT,
            HeaderValue::from_str(&accept_key(key)).unwrap(),
        );
        response
    }

    #[test]
    fn test_request_headers() {
        let config = ClientEndpointConfig::default()
            .with_subprotocols(["chat", "superchat"])
            .with_header("Origin", "http://localhost");
        let handshake = handshake("ws://localhost:8025/echo?a=b", &config);
        let request = handshake.request();

        assert_eq!(request.method(), &Method::GET);
        assert_eq!(request.request_uri(), "/echo?a=b");
        assert!(!request.is_secure());
        assert_eq!(request.header(header::HOST), Some("localhost:8025"));
        assert_eq!(request.header(header::UPGRADE), Some("websocket"));
        assert_eq!(request.header(header::SEC_WEBSOCKET_VERSION), Some("13"));
        assert_eq!(
            request.header(header::SEC_WEBSOCKET_PROTOCOL),
            Some("chat, superchat")
        );
        assert_eq!(request.header(header::ORIGIN), Some("http://localhost"));
    }

    #[test]
    fn test_rejects_non_websocket_scheme() {
        let url: Url = "http://localhost/echo".parse().unwrap();
        let err = ClientHandshake::new(&url, &ClientEndpointConfig::default()).unwrap_err();
        match err {
            WebSocketError::Deployment(err) => {
                assert!(err.message().starts_with("Incorrect scheme"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_wss_is_secure_with_default_port() {
        let handshake = handshake("wss://example.com/chat", &ClientEndpointConfig::default());
        assert!(handshake.is_secure());
        assert_eq!(handshake.authority(), "example.com:443");
        assert_eq!(handshake.request().header(header::HOST), Some("example.com"));
    }

    #[test]
    fn test_tunnel_request() {
        let handshake = handshake("wss://example.com/chat", &ClientEndpointConfig::default());
        let request = handshake.tunnel_request();
        assert_eq!(
            &request.to_bytes()[..],
            &b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\nProxy-Connection: keep-alive\r\nConnection: keep-alive\r\n\r\n"[..]
        );
    }

    #[test]
    fn test_validate_success() {
        let config = ClientEndpointConfig::default().with_subprotocols(["chat"]);
        let handshake = handshake("ws://localhost/", &config);
        let mut response = accepting(&handshake);
        response.insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("chat"));

        let negotiated = handshake.validate(&response).unwrap();
        assert_eq!(negotiated.subprotocol.as_deref(), Some("chat"));
        assert!(negotiated.extensions.is_empty());
    }

    #[test]
    fn test_validate_wrong_status() {
        let handshake = handshake("ws://localhost/", &ClientEndpointConfig::default());
        let response = HandshakeResponse::new(StatusCode::NOT_FOUND, None);
        let err = handshake.validate(&response).unwrap_err();
        assert_eq!(err.code(), 404);
        assert_eq!(err.message(), "Response code was not 101: 404.");
    }

    #[test]
    fn test_validate_bad_accept_key() {
        let handshake = handshake("ws://localhost/", &ClientEndpointConfig::default());
        let mut response = accepting(&handshake);
        response.insert(
            header::SEC_WEBSOCKET_ACCEPT,
            HeaderValue::from_static("bm90IHRoZSByaWdodCBrZXk="),
        );
        assert!(handshake.validate(&response).is_err());
    }

    #[test]
    fn test_validate_unrequested_subprotocol() {
        let handshake = handshake("ws://localhost/", &ClientEndpointConfig::default());
        let mut response = accepting(&handshake);
        response.insert(header::SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static("chat"));
        assert!(handshake.validate(&response).is_err());
    }

    #[test]
    fn test_validate_extensions() {
        let config = ClientEndpointConfig::default()
            .with_extensions(vec![Extension::new("x-ext").with_param("level", Some("1"))]);
        let handshake = handshake("ws://localhost/", &config);
        assert_eq!(
            handshake.request().header(header::SEC_WEBSOCKET_EXTENSIONS),
            Some("x-ext; level=1")
        );

        let mut response = accepting(&handshake);
        response.insert(header::SEC_WEBSOCKET_EXTENSIONS, HeaderValue::from_static("x-ext"));
        let negotiated = handshake.validate(&response).unwrap();
        assert_eq!(negotiated.extensions, vec![Extension::new("x-ext")]);

        response.insert(header::SEC_WEBSOCKET_EXTENSIONS, HeaderValue::from_static("y-ext"));
        assert!(handshake.validate(&response).is_err());
    }
}
