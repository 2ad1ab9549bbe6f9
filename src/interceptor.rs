//! Per-connection traffic classification.
//!
//! An [`Interceptor`] sits in front of a connection's byte stream. Until the handshake
//! completes it buffers HTTP heads and decides what they are: a plain HTTP request the
//! engine has nothing to do with (passed through untouched), an upgrade request to answer
//! (server), a proxy's answer to `CONNECT` or the server's handshake response (client).
//! Once the connection is upgraded every byte is decoded as frames and dispatched to the
//! [`Session`].
//!
//! ```text
//! NotStarted ─┬─> TunnelRequested ──> HandshakeSent ──┬─> Upgraded ──> Closed
//!             ├─> HandshakeSent ──────────────────────┤
//!             ├─> HandshakeReceived ──────────────────┘
//!             └─> PassThrough
//! ```
use std::{io, sync::Arc};

use bytes::{Buf, Bytes, BytesMut};
use http::StatusCode;
use tokio_util::codec::Decoder as _;

use crate::{
    close::{CloseCode, CloseReason},
    codec::Decoder,
    config::ContainerConfig,
    handshake::{
        client::{ClientHandshake, ResponseListener},
        http1::{self, Head},
        server, HandshakeError, HandshakeRequest, HandshakeResponse,
    },
    message::{Assembler, Incoming},
    server::ServerEngine,
    session::{Endpoint, Session, SessionRegistry, SessionState},
    transport::{FrameSink, Transport},
    Role, WebSocketError,
};

/// Reason reported to a session whose connection went away without a close handshake.
const CONNECTION_CLOSED_REASON: &str = "Close detected on connection";

/// Where a connection stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    NotStarted,
    /// Client only: `CONNECT` sent to the proxy, waiting for its answer.
    TunnelRequested,
    HandshakeSent,
    HandshakeReceived,
    Upgraded,
    /// The connection carries plain HTTP, which is none of the engine's business.
    PassThrough,
    Closed,
}

/// What became of a chunk handed to [`Interceptor::on_read`].
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    Consumed,
    /// Bytes that belong to whatever handles plain HTTP on this connection.
    PassThrough(Bytes),
}

/// Everything a client connection needs to run its handshake.
pub(crate) struct ClientSide {
    pub(crate) handshake: ClientHandshake,
    pub(crate) proxied: bool,
    pub(crate) endpoint: Arc<dyn Endpoint>,
    pub(crate) listener: Arc<dyn ResponseListener>,
    pub(crate) registry: SessionRegistry,
}

enum Side {
    Client(Arc<ClientSide>),
    Server(Arc<ServerEngine>),
}

pub(crate) struct Interceptor {
    side: Side,
    transport: Arc<dyn Transport>,
    config: ContainerConfig,
    state: ConnectionState,
    /// Set once the single handshake attempt of this connection was made.
    handshake_processed: bool,
    buffer: BytesMut,
    decoder: Decoder,
    assembler: Assembler,
    session: Option<Session>,
}

impl Interceptor {
    pub(crate) fn client(
        side: ClientSide,
        config: ContainerConfig,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self::new(Side::Client(Arc::new(side)), Role::Client, config, transport)
    }

    pub(crate) fn server(engine: Arc<ServerEngine>, transport: Arc<dyn Transport>) -> Self {
        let config = engine.config().clone();
        Self::new(Side::Server(engine), Role::Server, config, transport)
    }

    fn new(side: Side, role: Role, config: ContainerConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            side,
            transport,
            state: ConnectionState::NotStarted,
            handshake_processed: false,
            buffer: BytesMut::new(),
            decoder: Decoder::new(role, config.max_frame_size),
            assembler: Assembler::new(config.max_frame_size),
            session: None,
            config,
        }
    }

    #[cfg(feature = "logging")]
    fn role(&self) -> Role {
        match self.side {
            Side::Client(_) => Role::Client,
            Side::Server(_) => Role::Server,
        }
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    #[cfg(test)]
    pub(crate) fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Client only: starts the handshake on a freshly established connection.
    ///
    /// With a proxy, the `CONNECT` request goes first and the handshake follows the proxy's
    /// `200`. Without one, a `wss` target gets its secure layer before the handshake is sent.
    pub(crate) fn on_connect(&mut self) -> crate::Result<()> {
        let Side::Client(client) = &self.side else {
            return Ok(());
        };
        if self.state != ConnectionState::NotStarted {
            return Err(WebSocketError::IllegalState("the connection was already started"));
        }

        if client.proxied {
            let tunnel = client.handshake.tunnel_request();
            #[cfg(feature = "logging")]
            log::debug!("requesting tunnel: {tunnel}");
            self.transport.write(tunnel.to_bytes(), None)?;
            self.state = ConnectionState::TunnelRequested;
            Ok(())
        } else {
            self.send_handshake()
        }
    }

    fn send_handshake(&mut self) -> crate::Result<()> {
        let Side::Client(client) = &self.side else {
            return Ok(());
        };
        if client.handshake.is_secure() {
            self.transport.upgrade_to_secure()?;
        }

        #[cfg(feature = "logging")]
        log::debug!("sending handshake: {}", client.handshake.request());

        self.transport
            .write(client.handshake.request().to_bytes(), None)?;
        self.state = ConnectionState::HandshakeSent;
        Ok(())
    }

    /// Feeds a chunk read from the connection.
    pub(crate) fn on_read(&mut self, data: &[u8]) -> ReadOutcome {
        match self.state {
            ConnectionState::Upgraded => {
                self.buffer.extend_from_slice(data);
                self.read_frames();
                ReadOutcome::Consumed
            }
            ConnectionState::PassThrough => ReadOutcome::PassThrough(Bytes::copy_from_slice(data)),
            ConnectionState::Closed => ReadOutcome::Consumed,
            ConnectionState::NotStarted
            | ConnectionState::TunnelRequested
            | ConnectionState::HandshakeSent
            | ConnectionState::HandshakeReceived => {
                self.buffer.extend_from_slice(data);
                self.read_head()
            }
        }
    }

    fn read_head(&mut self) -> ReadOutcome {
        let (head, consumed) = match http1::parse_head(&self.buffer) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => return ReadOutcome::Consumed,
            Err(err) => {
                self.reject_head(err);
                return ReadOutcome::Consumed;
            }
        };

        match head {
            Head::Request(request) => self.on_request(request, consumed),
            Head::Response(response) => {
                self.buffer.advance(consumed);
                self.on_response(response)
            }
        }
    }

    fn on_request(&mut self, request: HandshakeRequest, consumed: usize) -> ReadOutcome {
        let engine = match &self.side {
            Side::Server(engine) => engine.clone(),
            Side::Client(_) => {
                self.fail_handshake(HandshakeError::new(500, "Unexpected HTTP request"));
                return ReadOutcome::Consumed;
            }
        };

        if self.handshake_processed || !server::is_upgrade_request(&request) {
            return self.pass_through();
        }
        let Some(deployed) = engine.lookup(request.path()) else {
            #[cfg(feature = "logging")]
            log::debug!("no endpoint deployed at {}", request.path());
            return self.pass_through();
        };

        self.handshake_processed = true;
        self.state = ConnectionState::HandshakeReceived;
        self.buffer.advance(consumed);

        let (response, negotiated) = match server::accept(&request, &deployed.config) {
            Ok(accepted) => accepted,
            Err(err) => {
                #[cfg(feature = "logging")]
                log::debug!("rejecting {request}: {err}");
                let _ = self.transport.write(err.to_response().to_bytes(), None);
                self.state = ConnectionState::PassThrough;
                return if self.buffer.is_empty() {
                    ReadOutcome::Consumed
                } else {
                    ReadOutcome::PassThrough(self.buffer.split().freeze())
                };
            }
        };

        if let Err(_err) = self.transport.write(response.to_bytes(), None) {
            #[cfg(feature = "logging")]
            log::debug!("handshake response not sent: {_err}");
            self.state = ConnectionState::Closed;
            return ReadOutcome::Consumed;
        }
        self.transport
            .set_idle_timeout(self.config.connection_idle_timeout);

        let session = Session::new(
            Role::Server,
            &request,
            negotiated,
            deployed.endpoint.clone(),
            engine.registry().clone(),
            FrameSink::new(Role::Server, self.transport.clone()),
            &self.config,
        );
        self.attach(&session);
        session.open();
        self.read_frames();
        ReadOutcome::Consumed
    }

    fn on_response(&mut self, response: HandshakeResponse) -> ReadOutcome {
        let client = match &self.side {
            Side::Client(client) => client.clone(),
            Side::Server(_) => return self.pass_through(),
        };

        match self.state {
            ConnectionState::TunnelRequested => {
                let status = response.status();
                if status != StatusCode::OK {
                    let code = status.as_u16();
                    self.fail_handshake(HandshakeError::new(
                        code,
                        format!("Proxy error. {code}: {}", response.reason()),
                    ));
                } else if let Err(err) = self.send_handshake() {
                    self.fail_handshake(HandshakeError::new(500, err.to_string()));
                }
            }
            ConnectionState::HandshakeSent if !self.handshake_processed => {
                self.handshake_processed = true;
                let negotiated = match client.handshake.validate(&response) {
                    Ok(negotiated) => negotiated,
                    Err(err) => {
                        self.fail_handshake(err);
                        return ReadOutcome::Consumed;
                    }
                };

                client.listener.on_response(&response);
                let session = Session::new(
                    Role::Client,
                    client.handshake.request(),
                    negotiated,
                    client.endpoint.clone(),
                    client.registry.clone(),
                    FrameSink::new(Role::Client, self.transport.clone()),
                    &self.config,
                );
                self.attach(&session);
                session.open();
                client.listener.on_connected(&session);
                // frames the server sent right behind its response
                self.read_frames();
            }
            _ => {
                self.fail_handshake(HandshakeError::new(
                    response.status().as_u16(),
                    "Unexpected HTTP response",
                ));
            }
        }
        ReadOutcome::Consumed
    }

    fn attach(&mut self, session: &Session) {
        self.state = ConnectionState::Upgraded;
        self.session = Some(session.clone());
    }

    fn pass_through(&mut self) -> ReadOutcome {
        self.state = ConnectionState::PassThrough;
        ReadOutcome::PassThrough(self.buffer.split().freeze())
    }

    fn reject_head(&mut self, error: WebSocketError) {
        match &self.side {
            Side::Server(_) => {
                let response = HandshakeError::bad_request(error.to_string()).to_response();
                let _ = self.transport.write(response.to_bytes(), None);
                self.buffer.clear();
                self.state = ConnectionState::Closed;
                self.transport.close();
            }
            Side::Client(_) => self.fail_handshake(HandshakeError::new(500, error.to_string())),
        }
    }

    fn fail_handshake(&mut self, error: HandshakeError) {
        #[cfg(feature = "logging")]
        log::debug!("{} handshake failed: {error}", self.role());

        self.state = ConnectionState::Closed;
        self.buffer.clear();
        if let Side::Client(client) = &self.side {
            client.listener.on_error(error);
        }
        self.transport.close();
    }

    fn read_frames(&mut self) {
        let Some(session) = self.session.clone() else {
            return;
        };

        while self.state == ConnectionState::Upgraded {
            let frame = match self.decoder.decode(&mut self.buffer) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    self.fail_session(&session, err);
                    break;
                }
            };

            match self.assembler.push(frame) {
                Ok(Some(Incoming::Message(message))) => session.on_message(message),
                Ok(Some(Incoming::Ping(payload))) => session.on_ping(payload),
                Ok(Some(Incoming::Close(reason))) => session.on_peer_close(reason),
                Ok(None) => {}
                Err(err) => self.fail_session(&session, err),
            }

            if session.state() == SessionState::Closed {
                self.state = ConnectionState::Closed;
                self.buffer.clear();
            }
        }
    }

    fn fail_session(&mut self, session: &Session, error: WebSocketError) {
        self.state = ConnectionState::Closed;
        self.buffer.clear();
        session.fail(error);
    }

    /// The connection was closed.
    ///
    /// An upgraded connection closing underneath its session is an abnormal close, reported
    /// to the session as "going away". Before the upgrade the close only matters to a client
    /// still waiting for its handshake.
    pub(crate) fn on_close(&mut self) {
        match self.state {
            ConnectionState::Upgraded => {
                if let Some(session) = &self.session {
                    session.on_transport_closed(going_away());
                }
            }
            ConnectionState::TunnelRequested | ConnectionState::HandshakeSent => {
                if let Side::Client(client) = &self.side {
                    client.listener.on_error(HandshakeError::new(
                        500,
                        "Connection closed before the handshake completed",
                    ));
                }
            }
            _ => {}
        }
        self.state = ConnectionState::Closed;
    }

    /// The connection failed with an I/O error.
    pub(crate) fn on_error(&mut self, error: io::Error) {
        match self.state {
            ConnectionState::Upgraded => {
                if let Some(session) = &self.session {
                    session.on_transport_error(going_away(), error.into());
                }
            }
            ConnectionState::TunnelRequested | ConnectionState::HandshakeSent => {
                if let Side::Client(client) = &self.side {
                    client
                        .listener
                        .on_error(HandshakeError::new(500, error.to_string()));
                }
            }
            _ => {}
        }
        self.state = ConnectionState::Closed;
    }

    /// No traffic for the configured idle timeout.
    pub(crate) fn on_idle_timeout(&mut self) {
        match (&self.state, &self.session) {
            (ConnectionState::Upgraded, Some(session)) => session.on_idle_timeout(),
            _ => self.transport.close(),
        }
    }
}

fn going_away() -> CloseReason {
    CloseReason::truncated(CloseCode::Away, CONNECTION_CLOSED_REASON)
}
