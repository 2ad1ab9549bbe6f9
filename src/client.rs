//! The client container: connects endpoints to remote WebSocket servers.
//!
//! [`ClientContainer::connect`] resolves once the session is open, or fails with a
//! [`DeploymentError`] summarizing what went wrong:
//!
//! - `"Connection failed."` when the TCP connection (or the proxy) could not be reached,
//! - `"Handshake error."` when the server or the proxy refused the upgrade,
//! - `"Handshake response not received."` when nothing came back within the connect timeout.
//!
//! A URI that is not `ws://` or `wss://` is rejected before any connection is attempted.
use std::{
    net::IpAddr,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::oneshot,
};
use tokio_rustls::rustls::pki_types::ServerName;
use url::{Host, Url};

use crate::{
    close::{CloseCode, CloseReason},
    config::{AfterResponse, ClientEndpointConfig, ContainerConfig},
    deploy::DeploymentError,
    handshake::{
        client::{ClientHandshake, ResponseListener},
        HandshakeError, HandshakeResponse,
    },
    interceptor::{ClientSide, Interceptor},
    net::{self, Connection, TlsTarget},
    session::{Endpoint, Session, SessionRegistry},
    Result, WebSocketError,
};

const CONNECTION_FAILED: &str = "Connection failed.";
const HANDSHAKE_FAILED: &str = "Handshake error.";
const NO_RESPONSE: &str = "Handshake response not received.";

/// Opens client sessions.
///
/// Cloning is cheap: clones share the configuration and the open-session registry.
#[derive(Clone, Default)]
pub struct ClientContainer {
    config: ContainerConfig,
    registry: SessionRegistry,
}

impl ClientContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ContainerConfig) -> Self {
        Self {
            config,
            registry: SessionRegistry::new(),
        }
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    /// Every open session created by this container.
    pub fn open_sessions(&self) -> Vec<Session> {
        self.registry.snapshot()
    }

    /// Connects `endpoint` to the server at `uri` over TCP, through the configured proxy
    /// if there is one.
    pub async fn connect(
        &self,
        endpoint: impl Endpoint,
        config: ClientEndpointConfig,
        uri: impl AsRef<str>,
    ) -> Result<Session> {
        let handshake = prepare(uri.as_ref(), &config)?;
        let target = match &config.proxy {
            Some(proxy) => proxy_authority(proxy)?,
            None => handshake.authority(),
        };

        #[cfg(feature = "logging")]
        log::debug!("connecting to {target} for {}", handshake.url());

        let stream =
            match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&target))
                .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => return Err(DeploymentError::with_cause(CONNECTION_FAILED, err).into()),
                Err(_) => {
                    return Err(
                        DeploymentError::with_cause(CONNECTION_FAILED, WebSocketError::Timeout)
                            .into(),
                    )
                }
            };
        let _ = stream.set_nodelay(true);

        self.open(Arc::new(endpoint), config, handshake, stream).await
    }

    /// Connects `endpoint` over an already established stream.
    ///
    /// With a proxy configured, `stream` must lead to the proxy: the tunnel is requested
    /// over it before the handshake.
    pub async fn connect_with_stream<S>(
        &self,
        endpoint: impl Endpoint,
        config: ClientEndpointConfig,
        uri: impl AsRef<str>,
        stream: S,
    ) -> Result<Session>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handshake = prepare(uri.as_ref(), &config)?;
        self.open(Arc::new(endpoint), config, handshake, stream).await
    }

    async fn open<S>(
        &self,
        endpoint: Arc<dyn Endpoint>,
        config: ClientEndpointConfig,
        handshake: ClientHandshake,
        stream: S,
    ) -> Result<Session>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let tls = if handshake.is_secure() {
            let connector = match config.tls_connector.clone() {
                Some(connector) => connector,
                None => net::tls_connector()
                    .map_err(|err| DeploymentError::with_cause(CONNECTION_FAILED, err))?,
            };
            Some(TlsTarget {
                connector,
                domain: server_name(handshake.url())?,
            })
        } else {
            None
        };

        let (done, outcome) = oneshot::channel();
        let listener = ConnectSynchronizer {
            done: Mutex::new(Some(done)),
            after_response: config.after_response.clone(),
        };

        let (connection, transport) = Connection::new(stream, tls);
        let mut interceptor = Interceptor::client(
            ClientSide {
                handshake,
                proxied: config.proxy.is_some(),
                endpoint,
                listener: Arc::new(listener),
                registry: self.registry.clone(),
            },
            self.config.clone(),
            transport,
        );
        interceptor
            .on_connect()
            .map_err(|err| DeploymentError::with_cause(CONNECTION_FAILED, err))?;
        tokio::spawn(connection.run(interceptor));

        match tokio::time::timeout(self.config.connect_timeout, outcome).await {
            Ok(Ok(Ok(session))) => Ok(session),
            Ok(Ok(Err(err))) => Err(DeploymentError::with_cause(HANDSHAKE_FAILED, err).into()),
            Ok(Err(_)) => Err(DeploymentError::new(NO_RESPONSE).into()),
            Err(_) => Err(DeploymentError::with_cause(NO_RESPONSE, WebSocketError::Timeout).into()),
        }
    }
}

fn prepare(uri: &str, config: &ClientEndpointConfig) -> Result<ClientHandshake> {
    let url = Url::parse(uri).map_err(|err| {
        DeploymentError::with_cause(format!("Invalid WebSocket endpoint URI={uri}"), err)
    })?;
    ClientHandshake::new(&url, config)
}

fn proxy_authority(proxy: &Url) -> Result<String> {
    match (proxy.host_str(), proxy.port_or_known_default()) {
        (Some(host), Some(port)) => Ok(format!("{host}:{port}")),
        _ => Err(DeploymentError::new(format!("Invalid proxy URI={proxy}")).into()),
    }
}

fn server_name(url: &Url) -> Result<ServerName<'static>> {
    let name = match url.host() {
        Some(Host::Domain(domain)) => ServerName::try_from(domain.to_owned()).ok(),
        Some(Host::Ipv4(ip)) => Some(ServerName::IpAddress(IpAddr::V4(ip).into())),
        Some(Host::Ipv6(ip)) => Some(ServerName::IpAddress(IpAddr::V6(ip).into())),
        None => None,
    };
    name.ok_or_else(|| DeploymentError::new(format!("Invalid TLS server name in URI={url}")).into())
}

/// Hands the outcome of the handshake back to the waiting `connect` call.
struct ConnectSynchronizer {
    done: Mutex<Option<oneshot::Sender<std::result::Result<Session, HandshakeError>>>>,
    after_response: Option<AfterResponse>,
}

impl ConnectSynchronizer {
    fn take(&self) -> Option<oneshot::Sender<std::result::Result<Session, HandshakeError>>> {
        self.done
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl ResponseListener for ConnectSynchronizer {
    fn on_response(&self, response: &HandshakeResponse) {
        if let Some(hook) = &self.after_response {
            hook(response);
        }
    }

    fn on_connected(&self, session: &Session) {
        let delivered = match self.take() {
            Some(done) => done.send(Ok(session.clone())).is_ok(),
            None => false,
        };
        if !delivered {
            // connect() already gave up on this session
            #[cfg(feature = "logging")]
            log::debug!("closing a session opened after its connect call timed out");
            let _ = session.close_with(CloseReason::truncated(CloseCode::Away, NO_RESPONSE));
        }
    }

    fn on_error(&self, error: HandshakeError) {
        #[cfg(feature = "logging")]
        log::debug!("handshake failed: {error}");
        if let Some(done) = self.take() {
            let _ = done.send(Err(error));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Handlers;

    fn deployment_error(result: Result<Session>) -> DeploymentError {
        match result {
            Err(WebSocketError::Deployment(err)) => err,
            other => panic!("expected a deployment error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_bad_scheme_is_rejected_before_connecting() {
        let client = ClientContainer::new();
        let err = deployment_error(
            client
                .connect(Handlers::new(), ClientEndpointConfig::default(), "http://127.0.0.1:1/echo")
                .await,
        );
        assert!(err.message().starts_with("Incorrect scheme"));
    }

    #[tokio::test]
    async fn test_unparsable_uri() {
        let client = ClientContainer::new();
        let err = deployment_error(
            client
                .connect(Handlers::new(), ClientEndpointConfig::default(), "not a uri")
                .await,
        );
        assert!(err.message().starts_with("Invalid WebSocket endpoint URI"));
        assert!(matches!(err.causes()[0], WebSocketError::UrlParseError(_)));
    }

    #[tokio::test]
    async fn test_connection_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = ClientContainer::new();
        let err = deployment_error(
            client
                .connect(
                    Handlers::new(),
                    ClientEndpointConfig::default(),
                    format!("ws://{addr}/echo"),
                )
                .await,
        );
        assert_eq!(err.message(), CONNECTION_FAILED);
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let (client_side, _server_side) = tokio::io::duplex(1024);
        let client = ClientContainer::with_config(
            ContainerConfig::default().with_connect_timeout(std::time::Duration::from_millis(50)),
        );
        let err = deployment_error(
            client
                .connect_with_stream(
                    Handlers::new(),
                    ClientEndpointConfig::default(),
                    "ws://localhost/echo",
                    client_side,
                )
                .await,
        );
        assert_eq!(err.message(), NO_RESPONSE);
        assert!(client.open_sessions().is_empty());
    }

    #[test]
    fn test_server_names() {
        let url = Url::parse("wss://example.com/chat").unwrap();
        assert!(matches!(server_name(&url), Ok(ServerName::DnsName(_))));
        let url = Url::parse("wss://[::1]:8443/chat").unwrap();
        assert!(matches!(server_name(&url), Ok(ServerName::IpAddress(_))));
    }

    #[test]
    fn test_proxy_authority_defaults_port() {
        let proxy = Url::parse("http://proxy.local").unwrap();
        assert_eq!(proxy_authority(&proxy).unwrap(), "proxy.local:80");
    }
}
