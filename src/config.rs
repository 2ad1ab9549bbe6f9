//! Container and endpoint configuration.
//!
//! All option structs follow the same builder style: start from `default()` (or `new` for
//! server endpoints) and chain `with_*` calls.
use std::{fmt, sync::Arc, time::Duration};

use tokio_rustls::TlsConnector;
use url::Url;

use crate::{
    codec::DEFAULT_MAX_FRAME_SIZE,
    handshake::{Extension, HandshakeResponse},
};

/// How long [`ClientContainer::connect`](crate::ClientContainer::connect) waits for the handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Idle timeout installed on a connection right after the server accepted its handshake.
pub const DEFAULT_CONNECTION_IDLE_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Container-wide defaults applied to every session the container creates.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Largest binary message accepted by a session, `None` for unbounded.
    pub max_binary_message_buffer_size: Option<usize>,
    /// Largest text message accepted by a session, in bytes, `None` for unbounded.
    pub max_text_message_buffer_size: Option<usize>,
    /// Session idle timeout, `None` to keep idle sessions open.
    pub max_session_idle_timeout: Option<Duration>,
    /// Time after which an [`AsyncRemote`](crate::AsyncRemote) send fails with a timeout.
    pub async_send_timeout: Option<Duration>,
    /// Client only: how long `connect` waits for the handshake to complete.
    pub connect_timeout: Duration,
    /// Server only: idle timeout installed on upgraded connections whose session sets none.
    pub connection_idle_timeout: Option<Duration>,
    /// Largest frame payload the decoder accepts. Also caps fragmented messages being reassembled.
    pub max_frame_size: usize,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            max_binary_message_buffer_size: None,
            max_text_message_buffer_size: None,
            max_session_idle_timeout: None,
            async_send_timeout: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connection_idle_timeout: Some(DEFAULT_CONNECTION_IDLE_TIMEOUT),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ContainerConfig {
    pub fn with_max_binary_message_buffer_size(self, size: usize) -> Self {
        Self {
            max_binary_message_buffer_size: Some(size),
            ..self
        }
    }

    pub fn with_max_text_message_buffer_size(self, size: usize) -> Self {
        Self {
            max_text_message_buffer_size: Some(size),
            ..self
        }
    }

    pub fn with_max_session_idle_timeout(self, timeout: Duration) -> Self {
        Self {
            max_session_idle_timeout: Some(timeout),
            ..self
        }
    }

    pub fn with_async_send_timeout(self, timeout: Duration) -> Self {
        Self {
            async_send_timeout: Some(timeout),
            ..self
        }
    }

    pub fn with_connect_timeout(self, timeout: Duration) -> Self {
        Self {
            connect_timeout: timeout,
            ..self
        }
    }

    /// Overrides the connection idle timeout; `None` disables it.
    pub fn with_connection_idle_timeout(self, timeout: Option<Duration>) -> Self {
        Self {
            connection_idle_timeout: timeout,
            ..self
        }
    }

    pub fn with_max_frame_size(self, size: usize) -> Self {
        Self {
            max_frame_size: size,
            ..self
        }
    }
}

/// Hook run with the validated handshake response, before the session opens.
pub type AfterResponse = Arc<dyn Fn(&HandshakeResponse) + Send + Sync>;

/// Per-connection options of a client endpoint.
#[derive(Clone, Default)]
pub struct ClientEndpointConfig {
    pub(crate) subprotocols: Vec<String>,
    pub(crate) extensions: Vec<Extension>,
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) proxy: Option<Url>,
    pub(crate) tls_connector: Option<TlsConnector>,
    pub(crate) after_response: Option<AfterResponse>,
}

impl ClientEndpointConfig {
    /// Subprotocols offered to the server, in order of preference.
    pub fn with_subprotocols<I, S>(self, subprotocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            subprotocols: subprotocols.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    /// Extensions offered to the server.
    pub fn with_extensions(self, extensions: Vec<Extension>) -> Self {
        Self { extensions, ..self }
    }

    /// Adds a header to the handshake request.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Connects through an HTTP forward proxy, e.g. `http://proxy.local:3128`, using a `CONNECT` tunnel.
    pub fn with_proxy(self, proxy: Url) -> Self {
        Self {
            proxy: Some(proxy),
            ..self
        }
    }

    /// TLS connector used for `wss://` targets. Defaults to the webpki root store.
    pub fn with_tls_connector(self, connector: TlsConnector) -> Self {
        Self {
            tls_connector: Some(connector),
            ..self
        }
    }

    /// Runs `hook` with the server's handshake response once it was validated.
    pub fn with_after_response<F>(self, hook: F) -> Self
    where
        F: Fn(&HandshakeResponse) + Send + Sync + 'static,
    {
        Self {
            after_response: Some(Arc::new(hook)),
            ..self
        }
    }
}

impl fmt::Debug for ClientEndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientEndpointConfig")
            .field("subprotocols", &self.subprotocols)
            .field("extensions", &self.extensions)
            .field("headers", &self.headers)
            .field("proxy", &self.proxy)
            .field("tls_connector", &self.tls_connector.is_some())
            .field("after_response", &self.after_response.is_some())
            .finish()
    }
}

/// Options of an endpoint deployed on a [`ServerContainer`](crate::ServerContainer).
#[derive(Debug, Clone)]
pub struct ServerEndpointConfig {
    pub(crate) path: String,
    pub(crate) subprotocols: Vec<String>,
    pub(crate) extensions: Vec<String>,
}

impl ServerEndpointConfig {
    /// An endpoint reachable at exactly `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            subprotocols: Vec::new(),
            extensions: Vec::new(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Subprotocols the endpoint supports.
    pub fn with_subprotocols<I, S>(self, subprotocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            subprotocols: subprotocols.into_iter().map(Into::into).collect(),
            ..self
        }
    }

    /// Names of the extensions the endpoint accepts when a client offers them.
    pub fn with_extensions<I, S>(self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            extensions: extensions.into_iter().map(Into::into).collect(),
            ..self
        }
    }
}
