//! Runs the engine over tokio streams.
//!
//! Each connection is owned by one task. The task reads from the stream and pushes the
//! bytes into the engine. Everything the engine wants done to the connection reaches the
//! task as a command through an unbounded channel, so callers never block on the network
//! and writes leave in the order they were queued.
mod stream;

use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::mpsc,
    time::Instant,
};
use tokio_rustls::{
    rustls::{
        self,
        pki_types::{ServerName, TrustAnchor},
    },
    TlsConnector,
};

pub use stream::MaybeTlsStream;

use crate::{
    handshake::HandshakeError,
    interceptor::{Interceptor, ReadOutcome},
    transport::{Transport, WriteAck},
};

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Something the engine asked of a connection.
pub(crate) enum Command {
    Write(Bytes, Option<WriteAck>),
    UpgradeToSecure,
    SetIdleTimeout(Option<Duration>),
    Close,
}

/// The [`Transport`] handed to the engine for a connection driven by [`Connection::run`].
#[derive(Clone)]
pub(crate) struct ChannelTransport {
    commands: mpsc::UnboundedSender<Command>,
    closed: Arc<AtomicBool>,
    can_secure: bool,
}

impl ChannelTransport {
    fn send(&self, command: Command) -> io::Result<()> {
        self.commands
            .send(command)
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))
    }
}

impl Transport for ChannelTransport {
    fn write(&self, data: Bytes, ack: Option<WriteAck>) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.send(Command::Write(data, ack))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.send(Command::Close);
        }
    }

    fn upgrade_to_secure(&self) -> io::Result<()> {
        if !self.can_secure {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "no TLS configuration for this connection",
            ));
        }
        self.send(Command::UpgradeToSecure)
    }

    fn set_idle_timeout(&self, timeout: Option<Duration>) {
        let _ = self.send(Command::SetIdleTimeout(timeout));
    }
}

/// TLS parameters for a client connection to a `wss` target.
pub(crate) struct TlsTarget {
    pub(crate) connector: TlsConnector,
    pub(crate) domain: ServerName<'static>,
}

/// One connection waiting to be driven.
pub(crate) struct Connection<S> {
    stream: S,
    commands: mpsc::UnboundedReceiver<Command>,
    transport: ChannelTransport,
    tls: Option<TlsTarget>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps `stream`, returning the transport the engine will talk to.
    ///
    /// Without a [`TlsTarget`] the transport refuses to upgrade to TLS.
    pub(crate) fn new(stream: S, tls: Option<TlsTarget>) -> (Self, Arc<dyn Transport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = ChannelTransport {
            commands: tx,
            closed: Arc::new(AtomicBool::new(false)),
            can_secure: tls.is_some(),
        };
        let connection = Self {
            stream,
            commands: rx,
            transport: transport.clone(),
            tls,
        };
        (connection, Arc::new(transport))
    }

    /// Drives the connection until it is closed or fails.
    ///
    /// Reading never waits for a write to finish: queued bytes go out through their own
    /// `select!` branch, so two peers flooding each other keep draining their sockets.
    pub(crate) async fn run(self, mut interceptor: Interceptor) {
        let Self {
            stream,
            mut commands,
            transport,
            tls,
        } = self;

        let (mut reader, mut writer) = tokio::io::split(MaybeTlsStream::Plain(stream));
        let mut read_buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut outgoing = BytesMut::new();
        let mut acks: Vec<WriteAck> = Vec::new();
        let mut needs_flush = false;
        let mut closing = false;
        let mut idle_timeout: Option<Duration> = None;
        let idle = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(idle);

        loop {
            if closing && outgoing.is_empty() && !needs_flush {
                let _ = writer.shutdown().await;
                interceptor.on_close();
                break;
            }
            read_buf.reserve(READ_BUFFER_SIZE);

            tokio::select! {
                command = commands.recv(), if !closing => {
                    let Some(command) = command else { break };
                    match command {
                        Command::Write(data, ack) => {
                            outgoing.extend_from_slice(&data);
                            acks.extend(ack);
                        }
                        Command::UpgradeToSecure => {
                            if let Err(err) = drain(&mut writer, &mut outgoing, &mut acks).await {
                                interceptor.on_error(err);
                                break;
                            }
                            needs_flush = false;
                            let stream = reader.unsplit(writer);
                            match secure(stream, tls.as_ref()).await {
                                Ok(stream) => (reader, writer) = tokio::io::split(stream),
                                Err(err) => {
                                    #[cfg(feature = "logging")]
                                    log::debug!("TLS handshake failed: {err}");
                                    interceptor.on_error(err);
                                    break;
                                }
                            }
                        }
                        Command::SetIdleTimeout(timeout) => {
                            idle_timeout = timeout;
                            if let Some(timeout) = timeout {
                                idle.as_mut().reset(Instant::now() + timeout);
                            }
                        }
                        Command::Close => closing = true,
                    }
                }
                pushed = push(&mut writer, &mut outgoing), if !outgoing.is_empty() || needs_flush => {
                    match pushed {
                        Ok(Pushed::Written) => {
                            needs_flush = true;
                            if let Some(timeout) = idle_timeout {
                                idle.as_mut().reset(Instant::now() + timeout);
                            }
                        }
                        Ok(Pushed::Flushed) => {
                            needs_flush = false;
                            for ack in acks.drain(..) {
                                let _ = ack.send(Ok(()));
                            }
                        }
                        Err(err) => {
                            fail_acks(&mut acks, &err);
                            interceptor.on_error(err);
                            break;
                        }
                    }
                }
                read = reader.read_buf(&mut read_buf) => match read {
                    Ok(0) => {
                        interceptor.on_close();
                        break;
                    }
                    Ok(_) => {
                        if let Some(timeout) = idle_timeout {
                            idle.as_mut().reset(Instant::now() + timeout);
                        }
                        let data = read_buf.split().freeze();
                        if let ReadOutcome::PassThrough(_) = interceptor.on_read(&data) {
                            not_found(&transport);
                        }
                    }
                    Err(err) => {
                        interceptor.on_error(err);
                        break;
                    }
                },
                () = &mut idle, if idle_timeout.is_some() => {
                    #[cfg(feature = "logging")]
                    log::debug!("connection idle timeout");
                    interceptor.on_idle_timeout();
                    if let Some(timeout) = idle_timeout {
                        idle.as_mut().reset(Instant::now() + timeout);
                    }
                }
            }
        }

        transport.closed.store(true, Ordering::Release);
    }
}

enum Pushed {
    Written,
    Flushed,
}

/// Writes the next chunk of `outgoing`, or flushes once it is empty.
async fn push<W>(writer: &mut W, outgoing: &mut BytesMut) -> io::Result<Pushed>
where
    W: AsyncWrite + Unpin,
{
    if outgoing.is_empty() {
        writer.flush().await?;
        Ok(Pushed::Flushed)
    } else {
        writer.write_buf(outgoing).await?;
        Ok(Pushed::Written)
    }
}

/// Writes everything queued and answers the acks of those writes.
async fn drain<W>(
    writer: &mut W,
    outgoing: &mut BytesMut,
    acks: &mut Vec<WriteAck>,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let result = match writer.write_all_buf(outgoing).await {
        Ok(()) => writer.flush().await,
        Err(err) => Err(err),
    };
    match &result {
        Ok(()) => {
            for ack in acks.drain(..) {
                let _ = ack.send(Ok(()));
            }
        }
        Err(err) => fail_acks(acks, err),
    }
    result
}

fn fail_acks(acks: &mut Vec<WriteAck>, err: &io::Error) {
    for ack in acks.drain(..) {
        let _ = ack.send(Err(io::Error::new(err.kind(), err.to_string())));
    }
}

async fn secure<S>(
    stream: MaybeTlsStream<S>,
    tls: Option<&TlsTarget>,
) -> io::Result<MaybeTlsStream<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match (stream, tls) {
        (MaybeTlsStream::Plain(stream), Some(tls)) => {
            let stream = tls.connector.connect(tls.domain.clone(), stream).await?;
            Ok(MaybeTlsStream::Tls(Box::new(stream)))
        }
        (MaybeTlsStream::Tls(_), _) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            "connection is already secure",
        )),
        (MaybeTlsStream::Plain(_), None) => Err(io::ErrorKind::Unsupported.into()),
    }
}

/// Answers traffic the engine passed through. Only a server connection produces any, and
/// nothing but the engine serves HTTP here.
fn not_found(transport: &ChannelTransport) {
    let response = HandshakeError::new(404, "Not Found").to_response();
    let _ = transport.write(response.to_bytes(), None);
    transport.close();
}

/// Creates a TLS connector with root certificates for secure WebSocket connections.
pub(crate) fn tls_connector() -> io::Result<TlsConnector> {
    let mut root_cert_store = rustls::RootCertStore::empty();
    root_cert_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| TrustAnchor {
        subject: ta.subject.clone(),
        subject_public_key_info: ta.subject_public_key_info.clone(),
        name_constraints: ta.name_constraints.clone(),
    }));

    let provider = rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::ring::default_provider()));

    let mut config = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(rustls::ALL_VERSIONS)
        .map_err(io::Error::other)?
        .with_root_certificates(root_cert_store)
        .with_no_client_auth();
    config.alpn_protocols = vec!["http/1.1".into()];

    Ok(TlsConnector::from(Arc::new(config)))
}
