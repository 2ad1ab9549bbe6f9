//! Sessions: the logical conversation on one upgraded connection.
//!
//! A [`Session`] moves forward through [`SessionState`] exactly once:
//! `Connecting → Open → Closing → Closed`. It is registered in its container's
//! [`SessionRegistry`] while open, dispatches complete messages to the application's
//! [`Endpoint`], enforces the per-type message size limits and runs the close handshake.
//!
//! Once a session is closed every accessor fails with [`WebSocketError::IllegalState`],
//! except [`Session::state`], [`Session::is_open`] and [`Session::close_reason`].
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use bytes::Bytes;
use dashmap::DashMap;

mod endpoint;
mod registry;
mod remote;
mod writer;

pub use endpoint::{Endpoint, Handlers};
pub use registry::SessionRegistry;
pub use remote::{AsyncRemote, BasicRemote, SendFuture};
pub use writer::{BinaryStream, TextStream};

use crate::{
    close::{CloseCode, CloseReason},
    config::ContainerConfig,
    frame::{Frame, OpCode},
    handshake::{client::Negotiated, Extension, HandshakeRequest, WEBSOCKET_VERSION},
    message::Message,
    transport::{FrameSink, WriteAck},
    Result, Role, WebSocketError,
};

const IDLE_TIMEOUT_REASON: &str = "Session closed by the container because of the idle timeout.";

/// Lifecycle state of a [`Session`]. States are never re-entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created by a successful handshake, not yet announced to the endpoint.
    Connecting,
    Open,
    /// A close frame was sent, waiting for the peer's answer.
    Closing,
    Closed,
}

struct State {
    phase: SessionState,
    max_binary: Option<usize>,
    max_text: Option<usize>,
    idle_timeout: Option<Duration>,
    close_reason: Option<CloseReason>,
    /// What this side sent when it initiated the close.
    local_close: Option<CloseReason>,
    /// The outbound message being sent in fragments, if any.
    cursor: Option<Cursor>,
    next_writer: u64,
}

/// An outbound fragmented message in progress.
struct Cursor {
    opcode: OpCode,
    /// Whether the first fragment went out.
    started: bool,
    /// The stream writer owning the message, `None` for `send_partial_*` calls.
    writer: Option<u64>,
}

struct Inner {
    id: String,
    role: Role,
    request_uri: String,
    query: Option<String>,
    secure: bool,
    negotiated: Negotiated,
    endpoint: Arc<dyn Endpoint>,
    registry: SessionRegistry,
    sink: FrameSink,
    async_send_timeout: Option<Duration>,
    connection_idle_timeout: Option<Duration>,
    user_properties: DashMap<String, String>,
    state: Mutex<State>,
}

/// One WebSocket conversation. Cloning is cheap and every clone refers to the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Creates a session for a connection whose handshake just succeeded.
    pub(crate) fn new(
        role: Role,
        request: &HandshakeRequest,
        negotiated: Negotiated,
        endpoint: Arc<dyn Endpoint>,
        registry: SessionRegistry,
        sink: FrameSink,
        config: &ContainerConfig,
    ) -> Self {
        let connection_idle_timeout = match role {
            Role::Server => config.connection_idle_timeout,
            Role::Client => None,
        };
        Self {
            inner: Arc::new(Inner {
                id: uuid::Uuid::new_v4().to_string(),
                role,
                request_uri: request.request_uri(),
                query: request.query().map(str::to_owned),
                secure: request.is_secure(),
                negotiated,
                endpoint,
                registry,
                sink,
                async_send_timeout: config.async_send_timeout,
                connection_idle_timeout,
                user_properties: DashMap::new(),
                state: Mutex::new(State {
                    phase: SessionState::Connecting,
                    max_binary: config.max_binary_message_buffer_size,
                    max_text: config.max_text_message_buffer_size,
                    idle_timeout: config.max_session_idle_timeout,
                    close_reason: None,
                    local_close: None,
                    cursor: None,
                    next_writer: 0,
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn check_not_closed(&self) -> Result<()> {
        if self.lock().phase == SessionState::Closed {
            Err(WebSocketError::IllegalState("the session is closed"))
        } else {
            Ok(())
        }
    }

    pub fn state(&self) -> SessionState {
        self.lock().phase
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// The reason the session was closed with, once it is closed.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.lock().close_reason.clone()
    }

    /// Unique identifier of the session.
    pub fn id(&self) -> Result<&str> {
        self.check_not_closed()?;
        Ok(&self.inner.id)
    }

    /// Path and query of the handshake request.
    pub fn request_uri(&self) -> Result<&str> {
        self.check_not_closed()?;
        Ok(&self.inner.request_uri)
    }

    pub fn query_string(&self) -> Result<Option<&str>> {
        self.check_not_closed()?;
        Ok(self.inner.query.as_deref())
    }

    /// Whether the connection runs over TLS.
    pub fn is_secure(&self) -> Result<bool> {
        self.check_not_closed()?;
        Ok(self.inner.secure)
    }

    pub fn protocol_version(&self) -> Result<&'static str> {
        self.check_not_closed()?;
        Ok(WEBSOCKET_VERSION)
    }

    pub fn negotiated_subprotocol(&self) -> Result<Option<&str>> {
        self.check_not_closed()?;
        Ok(self.inner.negotiated.subprotocol.as_deref())
    }

    pub fn negotiated_extensions(&self) -> Result<&[Extension]> {
        self.check_not_closed()?;
        Ok(&self.inner.negotiated.extensions)
    }

    pub fn max_binary_message_buffer_size(&self) -> Result<Option<usize>> {
        let state = self.lock();
        match state.phase {
            SessionState::Closed => Err(WebSocketError::IllegalState("the session is closed")),
            _ => Ok(state.max_binary),
        }
    }

    /// Largest binary message accepted from now on, `None` for unbounded.
    pub fn set_max_binary_message_buffer_size(&self, size: Option<usize>) -> Result<()> {
        let mut state = self.lock();
        if state.phase == SessionState::Closed {
            return Err(WebSocketError::IllegalState("the session is closed"));
        }
        state.max_binary = size;
        Ok(())
    }

    pub fn max_text_message_buffer_size(&self) -> Result<Option<usize>> {
        let state = self.lock();
        match state.phase {
            SessionState::Closed => Err(WebSocketError::IllegalState("the session is closed")),
            _ => Ok(state.max_text),
        }
    }

    /// Largest text message accepted from now on, in bytes, `None` for unbounded.
    pub fn set_max_text_message_buffer_size(&self, size: Option<usize>) -> Result<()> {
        let mut state = self.lock();
        if state.phase == SessionState::Closed {
            return Err(WebSocketError::IllegalState("the session is closed"));
        }
        state.max_text = size;
        Ok(())
    }

    pub fn max_idle_timeout(&self) -> Result<Option<Duration>> {
        let state = self.lock();
        match state.phase {
            SessionState::Closed => Err(WebSocketError::IllegalState("the session is closed")),
            _ => Ok(state.idle_timeout),
        }
    }

    /// Closes the session after `timeout` without traffic. `None` falls back to the
    /// connection's own idle timeout, if the container installed one.
    pub fn set_max_idle_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        {
            let mut state = self.lock();
            if state.phase == SessionState::Closed {
                return Err(WebSocketError::IllegalState("the session is closed"));
            }
            state.idle_timeout = timeout;
        }
        self.inner
            .sink
            .transport()
            .set_idle_timeout(timeout.or(self.inner.connection_idle_timeout));
        Ok(())
    }

    /// Every open session of the container this session belongs to, this one included.
    pub fn open_sessions(&self) -> Result<Vec<Session>> {
        self.check_not_closed()?;
        Ok(self.inner.registry.snapshot())
    }

    /// Application data attached to the session.
    pub fn user_properties(&self) -> Result<&DashMap<String, String>> {
        self.check_not_closed()?;
        Ok(&self.inner.user_properties)
    }

    /// Sends that return once the frame was handed to the connection.
    pub fn basic_remote(&self) -> Result<BasicRemote> {
        self.check_not_closed()?;
        Ok(BasicRemote::new(self.clone()))
    }

    /// Sends that return a future completing once the frame was written.
    pub fn async_remote(&self) -> Result<AsyncRemote> {
        self.check_not_closed()?;
        Ok(AsyncRemote::new(self.clone(), self.inner.async_send_timeout))
    }

    /// Starts the close handshake with code 1000 and no reason phrase.
    pub fn close(&self) -> Result<()> {
        self.close_with(CloseReason::normal())
    }

    /// Starts the close handshake with `reason`.
    ///
    /// The session leaves the registry right away and is closed once the peer answers.
    /// Only an open session can be closed: any later call fails and sends nothing.
    pub fn close_with(&self, reason: CloseReason) -> Result<()> {
        let sent = {
            let mut state = self.lock();
            if state.phase != SessionState::Open {
                return Err(WebSocketError::IllegalState("the session is not open"));
            }
            state.phase = SessionState::Closing;
            state.cursor = None;
            state.local_close = Some(reason.clone());
            self.inner.sink.send(Frame::close(&reason), None)
        };
        self.inner.registry.remove(&self.inner.id);

        #[cfg(feature = "logging")]
        log::debug!("{} session {} closing: {reason}", self.inner.role, self.inner.id);

        if let Err(_err) = sent {
            // nobody is left to answer
            #[cfg(feature = "logging")]
            log::debug!("close frame of session {} not sent: {_err}", self.inner.id);
            self.inner.sink.transport().close();
            self.finish(reason);
        }
        Ok(())
    }

    /// Announces the session to the registry and the endpoint.
    pub(crate) fn open(&self) {
        let idle_timeout = {
            let mut state = self.lock();
            if state.phase != SessionState::Connecting {
                return;
            }
            state.phase = SessionState::Open;
            state.idle_timeout
        };
        self.inner.registry.insert(self.clone());
        if idle_timeout.is_some() {
            self.inner.sink.transport().set_idle_timeout(idle_timeout);
        }

        #[cfg(feature = "logging")]
        log::debug!(
            "{} session {} opened on {}",
            self.inner.role,
            self.inner.id,
            self.inner.request_uri
        );

        self.inner.endpoint.on_open(self);
    }

    /// Sends a whole message or a control frame.
    pub(crate) fn send(&self, frame: Frame, ack: Option<WriteAck>) -> Result<()> {
        let state = self.lock();
        if state.phase != SessionState::Open {
            return Err(WebSocketError::IllegalState("the session is not open"));
        }
        if state.cursor.is_some() && !frame.opcode.is_control() {
            return Err(WebSocketError::IllegalState(
                "a partial message is being sent",
            ));
        }
        self.inner.sink.send(frame, ack)
    }

    /// Sends one fragment of a message of type `opcode`, which must be `Text` or `Binary`.
    pub(crate) fn send_partial(&self, opcode: OpCode, payload: &[u8], last: bool) -> Result<()> {
        self.send_fragment(None, opcode, payload, last)
    }

    /// Reserves the next outbound message for a stream writer.
    ///
    /// Until the writer sends its last fragment, every other message and writer is refused.
    pub(crate) fn reserve_writer(&self, opcode: OpCode) -> Result<u64> {
        let mut state = self.lock();
        if state.phase != SessionState::Open {
            return Err(WebSocketError::IllegalState("the session is not open"));
        }
        if state.cursor.is_some() {
            return Err(WebSocketError::IllegalState(
                "a partial message is being sent",
            ));
        }
        let writer = state.next_writer;
        state.next_writer += 1;
        state.cursor = Some(Cursor {
            opcode,
            started: false,
            writer: Some(writer),
        });
        Ok(writer)
    }

    /// Sends one fragment on behalf of `writer`, or of the partial sender when `None`.
    pub(crate) fn send_fragment(
        &self,
        writer: Option<u64>,
        opcode: OpCode,
        payload: &[u8],
        last: bool,
    ) -> Result<()> {
        let mut state = self.lock();
        if state.phase != SessionState::Open {
            return Err(WebSocketError::IllegalState("the session is not open"));
        }
        let started = match &state.cursor {
            None if writer.is_none() => false,
            None => {
                return Err(WebSocketError::IllegalState(
                    "the stream no longer owns a message",
                ))
            }
            Some(cursor) if cursor.writer != writer => {
                return Err(WebSocketError::IllegalState(
                    "another message is being sent",
                ))
            }
            Some(cursor) if cursor.opcode != opcode => {
                return Err(WebSocketError::IllegalState(
                    "a partial message of another type is being sent",
                ))
            }
            Some(cursor) => cursor.started,
        };
        let frame_opcode = if started { OpCode::Continuation } else { opcode };
        self.inner
            .sink
            .send(Frame::new(last, frame_opcode, None, payload), None)?;
        state.cursor = (!last).then_some(Cursor {
            opcode,
            started: true,
            writer,
        });
        Ok(())
    }

    /// Delivers a complete inbound message, enforcing the size limit of its type.
    pub(crate) fn on_message(&self, message: Message) {
        let limit = {
            let state = self.lock();
            if state.phase != SessionState::Open {
                return;
            }
            match &message {
                Message::Text(_) => state.max_text,
                Message::Binary(_) => state.max_binary,
                Message::Pong(_) => None,
            }
        };

        if let Some(max) = limit {
            let size = message.len();
            if size > max {
                let error = WebSocketError::MessageTooBig { size, max };
                let _ = self.close_with(CloseReason::truncated(CloseCode::Size, error.to_string()));
                self.inner.endpoint.on_error(self, &error);
                return;
            }
        }

        self.inner.endpoint.on_message(self, message);
    }

    pub(crate) fn on_ping(&self, payload: Bytes) {
        if self.is_open() {
            let _ = self.send(Frame::pong(payload), None);
        }
    }

    /// The peer sent a close frame.
    ///
    /// An open session echoes it; a closing session takes it as the answer to its own.
    pub(crate) fn on_peer_close(&self, reason: CloseReason) {
        let echoed = {
            let mut state = self.lock();
            match state.phase {
                SessionState::Open => {
                    state.phase = SessionState::Closing;
                    state.cursor = None;
                    let _ = self.inner.sink.send(Frame::close(&reason), None);
                    true
                }
                SessionState::Closing => false,
                SessionState::Connecting | SessionState::Closed => return,
            }
        };
        if echoed {
            self.inner.registry.remove(&self.inner.id);
        }

        self.finish(reason);
        self.inner.sink.transport().close();
    }

    /// The connection went away underneath the session.
    pub(crate) fn on_transport_closed(&self, reason: CloseReason) {
        let local_close = {
            let mut state = self.lock();
            match state.phase {
                SessionState::Closed => return,
                SessionState::Connecting => {
                    state.phase = SessionState::Closed;
                    state.close_reason = Some(reason);
                    return;
                }
                SessionState::Open => None,
                SessionState::Closing => state.local_close.clone(),
            }
        };
        self.inner.registry.remove(&self.inner.id);
        self.finish(local_close.unwrap_or(reason));
    }

    /// The connection failed with an I/O error.
    pub(crate) fn on_transport_error(&self, reason: CloseReason, error: WebSocketError) {
        let was_closed = self.state() == SessionState::Closed;
        self.on_transport_closed(reason);
        if !was_closed {
            self.inner.endpoint.on_error(self, &error);
        }
    }

    /// Fails the connection after a protocol violation by the peer.
    ///
    /// A close frame carrying the matching code is sent, the connection is closed without
    /// waiting for an answer and the endpoint sees `on_close` then `on_error`.
    pub(crate) fn fail(&self, error: WebSocketError) {
        #[cfg(feature = "logging")]
        log::debug!("{} session {} failed: {error}", self.inner.role, self.inner.id);

        let reason = CloseReason::truncated(error.close_code(), error.to_string());
        let _ = self.close_with(reason.clone());
        self.inner.sink.transport().close();

        let reason = self.lock().local_close.clone().unwrap_or(reason);
        self.inner.registry.remove(&self.inner.id);
        self.finish(reason);
        self.inner.endpoint.on_error(self, &error);
    }

    pub(crate) fn on_idle_timeout(&self) {
        match self.state() {
            SessionState::Open => {
                #[cfg(feature = "logging")]
                log::debug!("session {} idle, closing", self.inner.id);
                let _ = self.close_with(CloseReason::truncated(CloseCode::Away, IDLE_TIMEOUT_REASON));
            }
            // the peer never answered our close frame
            SessionState::Closing => self.inner.sink.transport().close(),
            SessionState::Connecting | SessionState::Closed => {}
        }
    }

    fn finish(&self, reason: CloseReason) {
        {
            let mut state = self.lock();
            if state.phase == SessionState::Closed {
                return;
            }
            state.phase = SessionState::Closed;
            state.cursor = None;
            state.close_reason = Some(reason.clone());
        }

        #[cfg(feature = "logging")]
        log::debug!("{} session {} closed: {reason}", self.inner.role, self.inner.id);

        self.inner.endpoint.on_close(self, &reason);
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Session {}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("role", &self.inner.role)
            .field("request_uri", &self.inner.request_uri)
            .field("state", &self.state())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{open_session, Event, Fixture};
    use super::*;

    fn server() -> Fixture {
        open_session(Role::Server, &ContainerConfig::default())
    }

    fn close_frames(fixture: &Fixture, sender: Role) -> Vec<CloseReason> {
        fixture
            .transport
            .frames(sender)
            .into_iter()
            .filter(|frame| frame.opcode == OpCode::Close)
            .map(|frame| CloseReason::parse(&frame.payload).unwrap())
            .collect()
    }

    mod lifecycle_tests {
        use super::*;

        #[test]
        fn test_open_registers_and_notifies() {
            let fixture = server();
            assert!(fixture.session.is_open());
            assert_eq!(fixture.endpoint.events(), vec![Event::Open]);
            assert_eq!(fixture.registry.len(), 1);
            assert_eq!(fixture.session.open_sessions().unwrap(), vec![fixture.session.clone()]);
            assert_eq!(
                fixture.transport.idle_timeout(),
                None,
                "no session idle timeout configured"
            );
        }

        #[test]
        fn test_accessors_while_open() {
            let fixture = server();
            let session = &fixture.session;
            assert_eq!(session.request_uri().unwrap(), "/echo?room=1");
            assert_eq!(session.query_string().unwrap(), Some("room=1"));
            assert!(!session.is_secure().unwrap());
            assert_eq!(session.protocol_version().unwrap(), "13");
            assert_eq!(session.negotiated_subprotocol().unwrap(), Some("chat"));
            assert!(session.negotiated_extensions().unwrap().is_empty());
            assert_eq!(session.id().unwrap().len(), 36);

            session.user_properties().unwrap().insert("user".into(), "alice".into());
            assert_eq!(
                session.user_properties().unwrap().get("user").unwrap().value(),
                "alice"
            );
        }

        #[test]
        fn test_double_close_fails_without_resending() {
            let fixture = server();
            fixture.session.close().unwrap();
            assert_eq!(fixture.session.state(), SessionState::Closing);
            assert!(fixture.registry.is_empty());

            let err = fixture.session.close().unwrap_err();
            assert!(matches!(err, WebSocketError::IllegalState(_)));
            assert_eq!(close_frames(&fixture, Role::Server), vec![CloseReason::normal()]);
        }

        #[test]
        fn test_local_close_completes_on_peer_answer() {
            let fixture = open_session(Role::Client, &ContainerConfig::default());
            let reason = CloseReason::new(CloseCode::from(4001), "bye").unwrap();
            fixture.session.close_with(reason.clone()).unwrap();
            assert!(!fixture.transport.is_closed());

            fixture.session.on_peer_close(reason.clone());
            assert_eq!(fixture.session.state(), SessionState::Closed);
            assert_eq!(fixture.session.close_reason(), Some(reason.clone()));
            assert!(fixture.transport.is_closed());
            assert_eq!(
                fixture.endpoint.events(),
                vec![Event::Open, Event::Close(reason.clone())]
            );
            // the client masks its close frame, the reason survives
            assert_eq!(close_frames(&fixture, Role::Client), vec![reason]);
        }

        #[test]
        fn test_peer_close_is_echoed() {
            let fixture = server();
            let reason = CloseReason::new(CloseCode::Policy, "policy").unwrap();
            fixture.session.on_peer_close(reason.clone());

            assert_eq!(fixture.session.state(), SessionState::Closed);
            assert!(fixture.registry.is_empty());
            assert!(fixture.transport.is_closed());
            assert_eq!(close_frames(&fixture, Role::Server), vec![reason.clone()]);
            assert_eq!(
                fixture.endpoint.events(),
                vec![Event::Open, Event::Close(reason)]
            );
        }

        #[test]
        fn test_transport_loss_closes_abnormally() {
            let fixture = server();
            let reason = CloseReason::truncated(CloseCode::Away, "Close detected on connection");
            fixture.session.on_transport_closed(reason.clone());
            fixture.session.on_transport_closed(reason.clone());

            assert_eq!(fixture.session.close_reason(), Some(reason.clone()));
            assert!(fixture.registry.is_empty());
            assert_eq!(
                fixture.endpoint.events(),
                vec![Event::Open, Event::Close(reason)]
            );
        }

        #[test]
        fn test_every_accessor_fails_after_close() {
            let fixture = server();
            let session = &fixture.session;
            session.on_peer_close(CloseReason::normal());
            assert_eq!(session.state(), SessionState::Closed);

            let illegal = |result: Result<()>| {
                assert!(matches!(result, Err(WebSocketError::IllegalState(_))))
            };
            illegal(session.id().map(drop));
            illegal(session.request_uri().map(drop));
            illegal(session.query_string().map(drop));
            illegal(session.is_secure().map(drop));
            illegal(session.protocol_version().map(drop));
            illegal(session.negotiated_subprotocol().map(drop));
            illegal(session.negotiated_extensions().map(drop));
            illegal(session.max_binary_message_buffer_size().map(drop));
            illegal(session.set_max_binary_message_buffer_size(Some(1)));
            illegal(session.max_text_message_buffer_size().map(drop));
            illegal(session.set_max_text_message_buffer_size(Some(1)));
            illegal(session.max_idle_timeout().map(drop));
            illegal(session.set_max_idle_timeout(None));
            illegal(session.open_sessions().map(drop));
            illegal(session.user_properties().map(drop));
            illegal(session.basic_remote().map(drop));
            illegal(session.async_remote().map(drop));
            illegal(session.close());

            assert!(!session.is_open());
            assert_eq!(session.close_reason(), Some(CloseReason::normal()));
        }

        #[test]
        fn test_idle_timeout_closes_with_going_away() {
            let fixture = server();
            fixture.session.on_idle_timeout();
            assert_eq!(fixture.session.state(), SessionState::Closing);

            let sent = close_frames(&fixture, Role::Server);
            assert_eq!(sent[0].code(), CloseCode::Away);
            assert_eq!(sent[0].reason(), IDLE_TIMEOUT_REASON);

            // second expiry while waiting for the answer drops the connection
            fixture.session.on_idle_timeout();
            assert!(fixture.transport.is_closed());
        }

        #[test]
        fn test_set_idle_timeout_reaches_transport() {
            let fixture = server();
            let timeout = Duration::from_secs(3);
            fixture.session.set_max_idle_timeout(Some(timeout)).unwrap();
            assert_eq!(fixture.session.max_idle_timeout().unwrap(), Some(timeout));
            assert_eq!(fixture.transport.idle_timeout(), Some(Some(timeout)));

            // back to the connection default
            fixture.session.set_max_idle_timeout(None).unwrap();
            assert_eq!(
                fixture.transport.idle_timeout(),
                Some(ContainerConfig::default().connection_idle_timeout)
            );
        }

        #[test]
        fn test_configured_idle_timeout_installed_on_open() {
            let config = ContainerConfig::default()
                .with_max_session_idle_timeout(Duration::from_millis(500));
            let fixture = open_session(Role::Client, &config);
            assert_eq!(
                fixture.transport.idle_timeout(),
                Some(Some(Duration::from_millis(500)))
            );
        }
    }

    mod dispatch_tests {
        use super::*;

        #[test]
        fn test_message_is_delivered() {
            let fixture = server();
            fixture.session.on_message(Message::Text("hello".into()));
            assert_eq!(
                fixture.endpoint.events(),
                vec![Event::Open, Event::Message(Message::Text("hello".into()))]
            );
        }

        #[test]
        fn test_message_too_big_closes_before_error() {
            let config = ContainerConfig::default().with_max_text_message_buffer_size(5);
            let fixture = open_session(Role::Server, &config);

            fixture.session.on_message(Message::Text("TEST1".into()));
            fixture.session.on_message(Message::Text("LONG--".into()));

            let expected =
                "Message too long; allowed message size is 5 bytes. (Current message length is 6 bytes)";
            let sent = close_frames(&fixture, Role::Server);
            assert_eq!(sent.len(), 1);
            assert_eq!(sent[0].code(), CloseCode::Size);
            assert_eq!(sent[0].reason(), expected);

            assert_eq!(
                fixture.endpoint.events(),
                vec![
                    Event::Open,
                    Event::Message(Message::Text("TEST1".into())),
                    Event::Error(expected.into(), false),
                ]
            );

            // anything arriving while closing is dropped
            fixture.session.on_message(Message::Text("late".into()));
            assert_eq!(fixture.endpoint.events().len(), 3);
        }

        #[test]
        fn test_binary_limit_is_separate() {
            let config = ContainerConfig::default().with_max_binary_message_buffer_size(2);
            let fixture = open_session(Role::Server, &config);
            fixture.session.on_message(Message::Text("long text".into()));
            assert!(fixture.session.is_open());
            fixture.session.on_message(Message::Binary(Bytes::from_static(b"abc")));
            assert_eq!(fixture.session.state(), SessionState::Closing);
        }

        #[test]
        fn test_ping_is_answered() {
            let fixture = server();
            fixture.session.on_ping(Bytes::from_static(b"beat"));
            let frames = fixture.transport.frames(Role::Server);
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].opcode, OpCode::Pong);
            assert_eq!(&frames[0].payload[..], b"beat");
        }

        #[test]
        fn test_protocol_failure_closes_then_errors() {
            let fixture = server();
            fixture.session.fail(WebSocketError::InvalidUTF8);

            assert_eq!(fixture.session.state(), SessionState::Closed);
            assert!(fixture.transport.is_closed());
            let reason = CloseReason::truncated(CloseCode::Invalid, "Invalid UTF-8");
            assert_eq!(close_frames(&fixture, Role::Server), vec![reason.clone()]);
            assert_eq!(
                fixture.endpoint.events(),
                vec![
                    Event::Open,
                    Event::Close(reason),
                    Event::Error("Invalid UTF-8".into(), false),
                ]
            );
        }
    }

    mod send_tests {
        use super::*;

        #[test]
        fn test_partial_message_uses_continuations() {
            let fixture = server();
            let session = &fixture.session;
            session.send_partial(OpCode::Text, b"he", false).unwrap();

            let err = session.send(Frame::text("whole"), None).unwrap_err();
            assert!(matches!(err, WebSocketError::IllegalState(_)));
            let err = session.send_partial(OpCode::Binary, b"x", false).unwrap_err();
            assert!(matches!(err, WebSocketError::IllegalState(_)));

            // control frames may interleave
            session.send(Frame::ping(b""), None).unwrap();
            session.send_partial(OpCode::Text, b"ll", false).unwrap();
            session.send_partial(OpCode::Text, b"o", true).unwrap();
            session.send(Frame::text("next"), None).unwrap();

            let frames: Vec<(OpCode, bool)> = fixture
                .transport
                .frames(Role::Server)
                .iter()
                .map(|frame| (frame.opcode, frame.fin))
                .collect();
            assert_eq!(
                frames,
                vec![
                    (OpCode::Text, false),
                    (OpCode::Ping, true),
                    (OpCode::Continuation, false),
                    (OpCode::Continuation, true),
                    (OpCode::Text, true),
                ]
            );
        }

        #[test]
        fn test_send_after_close_fails() {
            let fixture = server();
            fixture.session.close().unwrap();
            assert!(fixture.session.send(Frame::text("late"), None).is_err());
            assert!(fixture.session.send_partial(OpCode::Binary, b"x", true).is_err());
        }

        #[test]
        fn test_client_frames_are_masked() {
            let fixture = open_session(Role::Client, &ContainerConfig::default());
            fixture.session.send(Frame::binary(b"data"), None).unwrap();
            let written = fixture.transport.written();
            assert_eq!(written[1] & 0x80, 0x80);
            assert_eq!(&fixture.transport.frames(Role::Client)[0].payload[..], b"data");
        }
    }
}
