//! The server container: deployed endpoints, their open sessions and the accept loop.
//!
//! ```no_run
//! use wsengine::{Handlers, ServerContainer, ServerEndpointConfig};
//!
//! # async fn run() -> wsengine::Result<()> {
//! let container = ServerContainer::builder()
//!     .endpoint(ServerEndpointConfig::new("/chat"), Handlers::new())
//!     .deploy()?;
//! let server = container.bind("127.0.0.1:0").await?;
//! println!("listening on {}", server.local_addr());
//! server.stop().await;
//! # Ok(())
//! # }
//! ```
use std::{net::SocketAddr, sync::Arc};

use dashmap::DashMap;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, ToSocketAddrs},
    sync::oneshot,
    task::JoinHandle,
};

use crate::{
    config::{ContainerConfig, ServerEndpointConfig},
    deploy::{DeploymentError, ErrorCollector},
    interceptor::Interceptor,
    net::Connection,
    session::{Endpoint, Session, SessionRegistry},
    Result,
};

/// An endpoint deployed at one path.
#[derive(Clone)]
pub(crate) struct Deployed {
    pub(crate) config: ServerEndpointConfig,
    pub(crate) endpoint: Arc<dyn Endpoint>,
}

/// State shared by every connection of a server container.
pub(crate) struct ServerEngine {
    endpoints: DashMap<String, Deployed>,
    registry: SessionRegistry,
    config: ContainerConfig,
}

impl ServerEngine {
    pub(crate) fn new(config: ContainerConfig) -> Self {
        Self {
            endpoints: DashMap::new(),
            registry: SessionRegistry::new(),
            config,
        }
    }

    pub(crate) fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub(crate) fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// The endpoint deployed at exactly `path`.
    pub(crate) fn lookup(&self, path: &str) -> Option<Deployed> {
        self.endpoints.get(path).map(|entry| entry.value().clone())
    }

    pub(crate) fn insert(&self, config: ServerEndpointConfig, endpoint: Arc<dyn Endpoint>) {
        self.endpoints
            .insert(config.path.clone(), Deployed { config, endpoint });
    }

    fn remove(&self, path: &str) -> bool {
        self.endpoints.remove(path).is_some()
    }
}

/// Checks one endpoint configuration, recording every problem found.
fn validate(config: &ServerEndpointConfig, taken: &[&str], errors: &mut ErrorCollector) {
    let path = config.path();
    if !path.starts_with('/') {
        errors.add(DeploymentError::new(format!(
            "Endpoint path {path:?} must start with '/'"
        )));
    }
    if path.contains(['?', '#', ' ']) {
        errors.add(DeploymentError::new(format!(
            "Endpoint path {path:?} contains a query, a fragment or a space"
        )));
    }
    if taken.contains(&path) {
        errors.add(DeploymentError::new(format!(
            "Found equivalent paths. Endpoint path {path:?} is already deployed"
        )));
    }
    if config.subprotocols.iter().any(String::is_empty) {
        errors.add(DeploymentError::new(format!(
            "Endpoint {path:?} declares an empty subprotocol"
        )));
    }
}

/// Collects the endpoints of a [`ServerContainer`] before deploying them at once.
pub struct ServerContainerBuilder {
    config: ContainerConfig,
    endpoints: Vec<(ServerEndpointConfig, Arc<dyn Endpoint>)>,
}

impl ServerContainerBuilder {
    /// Container-wide defaults for every session.
    pub fn config(self, config: ContainerConfig) -> Self {
        Self { config, ..self }
    }

    /// Adds an endpoint to deploy.
    pub fn endpoint(mut self, config: ServerEndpointConfig, endpoint: impl Endpoint) -> Self {
        self.endpoints.push((config, Arc::new(endpoint)));
        self
    }

    /// Validates every endpoint and deploys them.
    ///
    /// Validation does not stop at the first problem: the returned [`DeploymentError`]
    /// lists every failure found.
    pub fn deploy(self) -> Result<ServerContainer> {
        let mut errors = ErrorCollector::new();
        let mut taken: Vec<&str> = Vec::new();
        for (config, _) in &self.endpoints {
            validate(config, &taken, &mut errors);
            taken.push(config.path());
        }
        errors.compose("Deployment of the server endpoints failed.")?;

        let engine = ServerEngine::new(self.config);
        for (config, endpoint) in self.endpoints {
            #[cfg(feature = "logging")]
            log::debug!("deploying endpoint at {}", config.path());
            engine.insert(config, endpoint);
        }
        Ok(ServerContainer {
            engine: Arc::new(engine),
        })
    }
}

/// Serves deployed endpoints, matching upgrade requests by exact path.
///
/// Cloning is cheap: clones share the endpoints and the open-session registry.
#[derive(Clone)]
pub struct ServerContainer {
    engine: Arc<ServerEngine>,
}

impl ServerContainer {
    pub fn builder() -> ServerContainerBuilder {
        ServerContainerBuilder {
            config: ContainerConfig::default(),
            endpoints: Vec::new(),
        }
    }

    pub fn config(&self) -> &ContainerConfig {
        self.engine.config()
    }

    /// Deploys one more endpoint on a running container.
    pub fn deploy(&self, config: ServerEndpointConfig, endpoint: impl Endpoint) -> Result<()> {
        let paths = self.paths();
        let taken: Vec<&str> = paths.iter().map(String::as_str).collect();
        let mut errors = ErrorCollector::new();
        validate(&config, &taken, &mut errors);
        errors.compose("Deployment of the server endpoint failed.")?;

        self.engine.insert(config, Arc::new(endpoint));
        Ok(())
    }

    /// Removes the endpoint at `path`. Sessions already open on it are left alone.
    pub fn undeploy(&self, path: &str) -> bool {
        self.engine.remove(path)
    }

    /// Paths of the deployed endpoints, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self
            .engine
            .endpoints
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        paths.sort();
        paths
    }

    /// Every open session, across all endpoints.
    pub fn open_sessions(&self) -> Vec<Session> {
        self.engine.registry().snapshot()
    }

    /// Runs the engine over one accepted connection.
    ///
    /// Plain HTTP requests and requests for paths without an endpoint are answered with
    /// `404 Not Found`.
    pub fn serve_stream<S>(&self, stream: S) -> JoinHandle<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (connection, transport) = Connection::new(stream, None);
        transport.set_idle_timeout(self.config().connection_idle_timeout);
        let interceptor = Interceptor::server(self.engine.clone(), transport);
        tokio::spawn(connection.run(interceptor))
    }

    /// Listens on `addr` and serves every accepted TCP connection.
    pub async fn bind(&self, addr: impl ToSocketAddrs) -> Result<ServerHandle> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| DeploymentError::with_cause("Server failed to start.", err))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| DeploymentError::with_cause("Server failed to start.", err))?;

        #[cfg(feature = "logging")]
        log::debug!("listening on {local_addr}");

        let (shutdown, mut stopped) = oneshot::channel::<()>();
        let container = self.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _peer)) => {
                            let _ = stream.set_nodelay(true);
                            container.serve_stream(stream);
                        }
                        Err(_err) => {
                            #[cfg(feature = "logging")]
                            log::error!("accepting connection: {_err}");
                        }
                    },
                }
            }
        });

        Ok(ServerHandle {
            local_addr,
            shutdown,
            task,
        })
    }
}

/// A running accept loop started by [`ServerContainer::bind`].
pub struct ServerHandle {
    local_addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections. Connections already accepted keep running.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }

    /// Runs until the accept loop ends.
    pub async fn wait(self) {
        let _ = self.task.await;
    }
}
