//! Streaming writers producing one fragmented message.
//!
//! Every non-empty write goes out immediately as a non-final fragment, so nothing is
//! buffered. Closing the writer sends an empty final fragment, which also makes a writer
//! that never received data produce a well-formed empty message. Dropping an unclosed
//! writer closes it.
use std::{fmt, io};

use super::Session;
use crate::{frame::OpCode, Result, WebSocketError};

const STREAM_CLOSED: WebSocketError = WebSocketError::IllegalState("the stream is closed");

/// Writes one binary message through [`io::Write`].
pub struct BinaryStream {
    session: Session,
    writer: u64,
    closed: bool,
}

impl BinaryStream {
    pub(crate) fn new(session: Session, writer: u64) -> Self {
        Self {
            session,
            writer,
            closed: false,
        }
    }

    fn send(&self, payload: &[u8], last: bool) -> Result<()> {
        self.session
            .send_fragment(Some(self.writer), OpCode::Binary, payload, last)
    }

    /// Ends the message.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(STREAM_CLOSED);
        }
        self.closed = true;
        self.send(&[], true)
    }
}

impl io::Write for BinaryStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.closed {
            return Err(io::Error::other(STREAM_CLOSED));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        self.send(buf, false).map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::other(STREAM_CLOSED));
        }
        Ok(())
    }
}

impl Drop for BinaryStream {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.close();
        }
    }
}

/// Writes one text message through [`fmt::Write`] or [`TextStream::write`].
pub struct TextStream {
    session: Session,
    writer: u64,
    closed: bool,
}

impl TextStream {
    pub(crate) fn new(session: Session, writer: u64) -> Self {
        Self {
            session,
            writer,
            closed: false,
        }
    }

    fn send(&self, payload: &[u8], last: bool) -> Result<()> {
        self.session
            .send_fragment(Some(self.writer), OpCode::Text, payload, last)
    }

    /// Sends `text` as the next fragment.
    pub fn write(&mut self, text: &str) -> Result<()> {
        if self.closed {
            return Err(STREAM_CLOSED);
        }
        if text.is_empty() {
            return Ok(());
        }
        self.send(text.as_bytes(), false)
    }

    pub fn flush(&mut self) -> Result<()> {
        if self.closed {
            return Err(STREAM_CLOSED);
        }
        Ok(())
    }

    /// Ends the message.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(STREAM_CLOSED);
        }
        self.closed = true;
        self.send(&[], true)
    }
}

impl fmt::Write for TextStream {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write(s).map_err(|_| fmt::Error)
    }
}

impl Drop for TextStream {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.close();
        }
    }
}
