use std::{fmt, sync::Arc};

use super::Session;
use crate::{close::CloseReason, message::Message, WebSocketError};

/// The application's side of a session.
///
/// Every method has a no-op default, so an endpoint only implements the events it cares
/// about. Callbacks run on the task driving the connection: a slow callback delays the
/// processing of further frames for that connection only.
pub trait Endpoint: Send + Sync + 'static {
    /// The handshake completed and the session is open.
    fn on_open(&self, session: &Session) {
        let _ = session;
    }

    /// A complete message arrived.
    fn on_message(&self, session: &Session, message: Message) {
        let _ = (session, message);
    }

    /// The session reached its terminal state.
    fn on_close(&self, session: &Session, reason: &CloseReason) {
        let _ = (session, reason);
    }

    /// Something went wrong. When the error ended the session, it has already left the open
    /// state by the time this is called.
    fn on_error(&self, session: &Session, error: &WebSocketError) {
        let _ = (session, error);
    }
}

impl<E: Endpoint + ?Sized> Endpoint for Arc<E> {
    fn on_open(&self, session: &Session) {
        (**self).on_open(session)
    }

    fn on_message(&self, session: &Session, message: Message) {
        (**self).on_message(session, message)
    }

    fn on_close(&self, session: &Session, reason: &CloseReason) {
        (**self).on_close(session, reason)
    }

    fn on_error(&self, session: &Session, error: &WebSocketError) {
        (**self).on_error(session, error)
    }
}

type OpenHandler = Arc<dyn Fn(&Session) + Send + Sync>;
type MessageHandler = Arc<dyn Fn(&Session, Message) + Send + Sync>;
type CloseHandler = Arc<dyn Fn(&Session, &CloseReason) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(&Session, &WebSocketError) + Send + Sync>;

/// An [`Endpoint`] assembled from closures.
///
/// ```
/// use wsengine::{Handlers, Message};
///
/// let endpoint = Handlers::new()
///     .on_open(|session| println!("opened {:?}", session.id()))
///     .on_message(|_, message| {
///         if let Message::Text(text) = message {
///             println!("{text}");
///         }
///     });
/// # let _ = endpoint;
/// ```
#[derive(Clone, Default)]
pub struct Handlers {
    open: Option<OpenHandler>,
    message: Option<MessageHandler>,
    close: Option<CloseHandler>,
    error: Option<ErrorHandler>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_open<F>(self, handler: F) -> Self
    where
        F: Fn(&Session) + Send + Sync + 'static,
    {
        Self {
            open: Some(Arc::new(handler)),
            ..self
        }
    }

    pub fn on_message<F>(self, handler: F) -> Self
    where
        F: Fn(&Session, Message) + Send + Sync + 'static,
    {
        Self {
            message: Some(Arc::new(handler)),
            ..self
        }
    }

    pub fn on_close<F>(self, handler: F) -> Self
    where
        F: Fn(&Session, &CloseReason) + Send + Sync + 'static,
    {
        Self {
            close: Some(Arc::new(handler)),
            ..self
        }
    }

    pub fn on_error<F>(self, handler: F) -> Self
    where
        F: Fn(&Session, &WebSocketError) + Send + Sync + 'static,
    {
        Self {
            error: Some(Arc::new(handler)),
            ..self
        }
    }
}

impl Endpoint for Handlers {
    fn on_open(&self, session: &Session) {
        if let Some(handler) = &self.open {
            handler(session);
        }
    }

    fn on_message(&self, session: &Session, message: Message) {
        if let Some(handler) = &self.message {
            handler(session, message);
        }
    }

    fn on_close(&self, session: &Session, reason: &CloseReason) {
        if let Some(handler) = &self.close {
            handler(session, reason);
        }
    }

    fn on_error(&self, session: &Session, error: &WebSocketError) {
        if let Some(handler) = &self.error {
            handler(session, error);
        }
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers")
            .field("on_open", &self.open.is_some())
            .field("on_message", &self.message.is_some())
            .field("on_close", &self.close.is_some())
            .field("on_error", &self.error.is_some())
            .finish()
    }
}
