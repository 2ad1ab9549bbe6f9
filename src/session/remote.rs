use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use pin_project::pin_project;
use tokio::{sync::oneshot, time::Sleep};

use super::{BinaryStream, Session, TextStream};
use crate::{
    frame::{Frame, OpCode, MAX_CONTROL_PAYLOAD},
    Result, WebSocketError,
};

/// Blocking-style sends: each call returns once the frame was handed to the connection.
///
/// Whole messages cannot be sent while a partial message (or a stream) is in progress.
#[derive(Clone)]
pub struct BasicRemote {
    session: Session,
}

impl BasicRemote {
    pub(crate) fn new(session: Session) -> Self {
        Self { session }
    }

    pub fn send_text(&self, text: impl AsRef<str>) -> Result<()> {
        self.session.send(Frame::text(text), None)
    }

    pub fn send_binary(&self, data: impl AsRef<[u8]>) -> Result<()> {
        self.session.send(Frame::binary(data), None)
    }

    /// Sends one fragment of a text message. The message ends with the fragment for which
    /// `is_last` is true.
    pub fn send_partial_text(&self, text: impl AsRef<str>, is_last: bool) -> Result<()> {
        self.session
            .send_partial(OpCode::Text, text.as_ref().as_bytes(), is_last)
    }

    /// Sends one fragment of a binary message.
    pub fn send_partial_binary(&self, data: impl AsRef<[u8]>, is_last: bool) -> Result<()> {
        self.session
            .send_partial(OpCode::Binary, data.as_ref(), is_last)
    }

    /// Sends a ping. The peer's pong arrives as [`Message::Pong`](crate::Message::Pong).
    pub fn send_ping(&self, payload: impl AsRef<[u8]>) -> Result<()> {
        let payload = payload.as_ref();
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::ControlFrameTooLarge);
        }
        self.session.send(Frame::ping(payload), None)
    }

    /// Sends an unsolicited pong, usable as a heartbeat.
    pub fn send_pong(&self, payload: impl AsRef<[u8]>) -> Result<()> {
        let payload = payload.as_ref();
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::ControlFrameTooLarge);
        }
        self.session.send(Frame::pong(payload), None)
    }

    /// Starts a binary message written through [`std::io::Write`].
    pub fn send_stream(&self) -> Result<BinaryStream> {
        let writer = self.session.reserve_writer(OpCode::Binary)?;
        Ok(BinaryStream::new(self.session.clone(), writer))
    }

    /// Starts a text message written through [`std::fmt::Write`].
    pub fn send_writer(&self) -> Result<TextStream> {
        let writer = self.session.reserve_writer(OpCode::Text)?;
        Ok(TextStream::new(self.session.clone(), writer))
    }

    /// Serializes `value` and sends it as a text message.
    #[cfg(feature = "json")]
    #[cfg_attr(docsrs, doc(cfg(feature = "json")))]
    pub fn send_json<T: serde::Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let text = serde_json::to_string(value)?;
        self.send_text(text)
    }
}

/// Non-blocking sends: each call returns a [`SendFuture`] right away.
#[derive(Clone)]
pub struct AsyncRemote {
    session: Session,
    send_timeout: Option<Duration>,
}

impl AsyncRemote {
    pub(crate) fn new(session: Session, send_timeout: Option<Duration>) -> Self {
        Self {
            session,
            send_timeout,
        }
    }

    /// Time after which a pending send fails with [`WebSocketError::Timeout`].
    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout
    }

    pub fn set_send_timeout(&mut self, timeout: Option<Duration>) {
        self.send_timeout = timeout;
    }

    pub fn send_text(&self, text: impl AsRef<str>) -> SendFuture {
        self.send(Frame::text(text))
    }

    pub fn send_binary(&self, data: impl AsRef<[u8]>) -> SendFuture {
        self.send(Frame::binary(data))
    }

    pub fn send_ping(&self, payload: impl Into<Bytes>) -> SendFuture {
        let payload = payload.into();
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return SendFuture::failed(WebSocketError::ControlFrameTooLarge);
        }
        self.send(Frame::ping(payload))
    }

    #[cfg(feature = "json")]
    #[cfg_attr(docsrs, doc(cfg(feature = "json")))]
    pub fn send_json<T: serde::Serialize + ?Sized>(&self, value: &T) -> SendFuture {
        match serde_json::to_string(value) {
            Ok(text) => self.send_text(text),
            Err(err) => SendFuture::failed(err.into()),
        }
    }

    fn send(&self, frame: Frame) -> SendFuture {
        let (ack, done) = oneshot::channel();
        match self.session.send(frame, Some(ack)) {
            Ok(()) => SendFuture::Pending {
                done,
                deadline: self.send_timeout.map(tokio::time::sleep),
            },
            Err(err) => SendFuture::failed(err),
        }
    }
}

/// Completion of an [`AsyncRemote`] send.
///
/// Resolves once the frame was written to the connection, or with the error that prevented
/// it. When a send timeout is configured, the future must be polled inside a tokio runtime.
#[must_use = "futures do nothing unless polled"]
#[pin_project(project = SendFutureProj)]
pub enum SendFuture {
    Failed(Option<WebSocketError>),
    Pending {
        #[pin]
        done: oneshot::Receiver<std::io::Result<()>>,
        #[pin]
        deadline: Option<Sleep>,
    },
}

impl SendFuture {
    fn failed(error: WebSocketError) -> Self {
        Self::Failed(Some(error))
    }
}

impl Future for SendFuture {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.project() {
            SendFutureProj::Failed(error) => match error.take() {
                Some(error) => Poll::Ready(Err(error)),
                None => Poll::Ready(Err(WebSocketError::ConnectionClosed)),
            },
            SendFutureProj::Pending { done, deadline } => {
                if let Poll::Ready(result) = done.poll(cx) {
                    return Poll::Ready(match result {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(err)) => Err(err.into()),
                        Err(_) => Err(WebSocketError::ConnectionClosed),
                    });
                }
                if let Some(deadline) = deadline.as_pin_mut() {
                    if deadline.poll(cx).is_ready() {
                        return Poll::Ready(Err(WebSocketError::Timeout));
                    }
                }
                Poll::Pending
            }
        }
    }
}
