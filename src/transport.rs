//! The byte-level capability the engine runs on.
//!
//! A [`Transport`] can write bytes, close the connection and optionally switch an already
//! established plain connection to TLS. Inbound bytes are pushed into the engine by whoever
//! owns the connection (see [`net`](crate::net)).
use std::{io, sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use tokio::sync::oneshot;
use tokio_util::codec::Encoder as _;

use crate::{codec::Encoder, frame::Frame, Result, Role};

/// Completion signal of a write, fired once the bytes reached the wire (or failed to).
pub type WriteAck = oneshot::Sender<io::Result<()>>;

/// A connection as seen by the engine.
///
/// Writes must be queued in call order and must not block on the network.
pub trait Transport: Send + Sync + 'static {
    /// Queues `data` for writing. `ack`, when given, is completed after the write.
    fn write(&self, data: Bytes, ack: Option<WriteAck>) -> io::Result<()>;

    /// Closes the connection once previously queued writes are flushed.
    fn close(&self);

    /// Starts TLS on the connection. Writes queued afterwards go through the secure channel.
    fn upgrade_to_secure(&self) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "transport cannot be upgraded to TLS",
        ))
    }

    /// Closes the connection after `timeout` without traffic; `None` disables the timer.
    fn set_idle_timeout(&self, timeout: Option<Duration>) {
        let _ = timeout;
    }
}

/// Encodes frames for one role and hands them to a transport.
#[derive(Clone)]
pub(crate) struct FrameSink {
    role: Role,
    transport: Arc<dyn Transport>,
}

impl FrameSink {
    pub(crate) fn new(role: Role, transport: Arc<dyn Transport>) -> Self {
        Self { role, transport }
    }

    pub(crate) fn send(&self, frame: Frame, ack: Option<WriteAck>) -> Result<()> {
        let mut dst = BytesMut::with_capacity(frame.payload.len() + 14);
        Encoder::new(self.role).encode(frame, &mut dst)?;
        self.transport.write(dst.freeze(), ack)?;
        Ok(())
    }

    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! An in-memory transport that records everything written to it.
    use std::sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Mutex,
    };

    use tokio_util::codec::Decoder as _;

    use super::*;
    use crate::codec::{Decoder, DEFAULT_MAX_FRAME_SIZE};

    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        writes: Mutex<Vec<Bytes>>,
        closed: AtomicBool,
        secure_upgrades: AtomicUsize,
        idle_timeout: Mutex<Option<Option<Duration>>>,
    }

    impl RecordingTransport {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Everything written so far, concatenated.
        pub(crate) fn written(&self) -> Vec<u8> {
            self.writes.lock().unwrap().concat()
        }

        pub(crate) fn take_written(&self) -> Vec<u8> {
            std::mem::take(&mut *self.writes.lock().unwrap()).concat()
        }

        /// Decodes everything written so far as frames sent by `sender`.
        pub(crate) fn frames(&self, sender: Role) -> Vec<Frame> {
            let receiver = match sender {
                Role::Client => Role::Server,
                Role::Server => Role::Client,
            };
            let mut decoder = Decoder::new(receiver, DEFAULT_MAX_FRAME_SIZE);
            let mut buf = BytesMut::from(&self.written()[..]);
            let mut frames = Vec::new();
            while let Some(frame) = decoder.decode(&mut buf).unwrap() {
                frames.push(frame);
            }
            frames
        }

        pub(crate) fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        pub(crate) fn secure_upgrades(&self) -> usize {
            self.secure_upgrades.load(Ordering::SeqCst)
        }

        pub(crate) fn idle_timeout(&self) -> Option<Option<Duration>> {
            *self.idle_timeout.lock().unwrap()
        }
    }

    impl Transport for RecordingTransport {
        fn write(&self, data: Bytes, ack: Option<WriteAck>) -> io::Result<()> {
            if self.is_closed() {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            self.writes.lock().unwrap().push(data);
            if let Some(ack) = ack {
                let _ = ack.send(Ok(()));
            }
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn upgrade_to_secure(&self) -> io::Result<()> {
            self.secure_upgrades.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn set_idle_timeout(&self, timeout: Option<Duration>) {
            *self.idle_timeout.lock().unwrap() = Some(timeout);
        }
    }
}
