//! Client and server containers talking to each other, over in-memory pipes and TCP.
use std::{
    io::Write as _,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::mpsc,
};
use wsengine::{
    ClientContainer, ClientEndpointConfig, CloseCode, CloseReason, ContainerConfig, Endpoint,
    Handlers, Message, ServerContainer, ServerEndpointConfig, Session, SessionState,
    WebSocketError,
};

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Open,
    Text(String),
    Binary(usize),
    Close(u16, String),
    Error(String),
}

/// An endpoint forwarding every callback to a channel.
fn recorder() -> (Handlers, mpsc::UnboundedReceiver<Event>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (open, message, close, error) = (tx.clone(), tx.clone(), tx.clone(), tx);
    let handlers = Handlers::new()
        .on_open(move |_| {
            let _ = open.send(Event::Open);
        })
        .on_message(move |_, msg| {
            let event = match msg {
                Message::Text(text) => Event::Text(text),
                Message::Binary(data) => Event::Binary(data.len()),
                Message::Pong(_) => return,
            };
            let _ = message.send(event);
        })
        .on_close(move |_, reason| {
            let _ = close.send(Event::Close(u16::from(reason.code()), reason.reason().to_owned()));
        })
        .on_error(move |_, err| {
            let _ = error.send(Event::Error(err.to_string()));
        });
    (handlers, rx)
}

fn echo() -> Handlers {
    Handlers::new().on_message(|session, message| {
        let Ok(remote) = session.basic_remote() else {
            return;
        };
        let _ = match message {
            Message::Text(text) => remote.send_text(text),
            Message::Binary(data) => remote.send_binary(data),
            Message::Pong(_) => Ok(()),
        };
    })
}

async fn next(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Connects a client endpoint to `container` through an in-memory pipe.
async fn connect(
    container: &ServerContainer,
    endpoint: impl Endpoint,
    config: ClientEndpointConfig,
    target: &str,
) -> wsengine::Result<Session> {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    container.serve_stream(server_io);
    ClientContainer::new()
        .connect_with_stream(endpoint, config, format!("ws://localhost{target}"), client_io)
        .await
}

fn init_logging() {
    let _ = simple_logger::init_with_level(log::Level::Debug);
}

#[tokio::test]
async fn test_echo_over_pipe() {
    init_logging();
    let server = ServerContainer::builder()
        .endpoint(ServerEndpointConfig::new("/echo"), echo())
        .deploy()
        .unwrap();

    let (client, mut events) = recorder();
    let session = connect(&server, client, ClientEndpointConfig::default(), "/echo?room=1")
        .await
        .unwrap();
    assert_eq!(next(&mut events).await, Event::Open);
    assert!(session.is_open());

    session.basic_remote().unwrap().send_text("Hello").unwrap();
    assert_eq!(next(&mut events).await, Event::Text("Hello".into()));

    session.async_remote().unwrap().send_binary([7u8; 300]).await.unwrap();
    assert_eq!(next(&mut events).await, Event::Binary(300));

    let server_session = &server.open_sessions()[0];
    assert_eq!(server_session.request_uri().unwrap(), "/echo?room=1");
    assert_eq!(server_session.query_string().unwrap(), Some("room=1"));
}

const CLOSE_CODES: [u16; 13] = [
    1000, 1001, 1002, 1003, 1007, 1008, 1009, 1010, 1011, 3000, 4000, 4001, 4999,
];

#[tokio::test]
async fn test_close_codes_reach_the_peer() {
    init_logging();
    for code in CLOSE_CODES {
        let (server_endpoint, mut server_events) = recorder();
        let server = ServerContainer::builder()
            .endpoint(ServerEndpointConfig::new("/close"), server_endpoint)
            .deploy()
            .unwrap();

        let (client, mut client_events) = recorder();
        let session = connect(&server, client, ClientEndpointConfig::default(), "/close")
            .await
            .unwrap();
        assert_eq!(next(&mut server_events).await, Event::Open);
        assert_eq!(next(&mut client_events).await, Event::Open);

        let reason = CloseReason::new(CloseCode::from(code), "bye").unwrap();
        session.close_with(reason).unwrap();

        assert_eq!(next(&mut server_events).await, Event::Close(code, "bye".into()));
        assert_eq!(next(&mut client_events).await, Event::Close(code, "bye".into()));
        assert_eq!(session.state(), SessionState::Closed);
    }
}

#[tokio::test]
async fn test_server_initiated_close_codes_reach_the_client() {
    init_logging();
    for code in CLOSE_CODES {
        let (server_endpoint, mut server_events) = recorder();
        let server = ServerContainer::builder()
            .endpoint(ServerEndpointConfig::new("/close"), server_endpoint)
            .deploy()
            .unwrap();

        let (client, mut client_events) = recorder();
        let session = connect(&server, client, ClientEndpointConfig::default(), "/close")
            .await
            .unwrap();
        assert_eq!(next(&mut server_events).await, Event::Open);
        assert_eq!(next(&mut client_events).await, Event::Open);

        let server_session = server.open_sessions().remove(0);
        let reason = CloseReason::new(CloseCode::from(code), "server bye").unwrap();
        server_session.close_with(reason).unwrap();

        assert_eq!(
            next(&mut client_events).await,
            Event::Close(code, "server bye".into())
        );
        assert_eq!(
            next(&mut server_events).await,
            Event::Close(code, "server bye".into())
        );
        assert_eq!(server_session.state(), SessionState::Closed);
        assert_eq!(session.state(), SessionState::Closed);
    }
}

#[tokio::test]
async fn test_closed_session_refuses_everything() {
    init_logging();
    let server = ServerContainer::builder()
        .endpoint(ServerEndpointConfig::new("/echo"), echo())
        .deploy()
        .unwrap();
    let (client, mut events) = recorder();
    let session = connect(&server, client, ClientEndpointConfig::default(), "/echo")
        .await
        .unwrap();
    assert_eq!(next(&mut events).await, Event::Open);

    session.close().unwrap();
    assert!(matches!(session.close(), Err(WebSocketError::IllegalState(_))));
    assert_eq!(next(&mut events).await, Event::Close(1000, String::new()));

    assert!(session.id().is_err());
    assert!(session.basic_remote().is_err());
    assert!(session.max_idle_timeout().is_err());
    assert!(session.user_properties().is_err());
    assert_eq!(
        session.close_reason().map(|reason| reason.code()),
        Some(CloseCode::Normal)
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(events.try_recv().is_err(), "on_close must fire once");
}

#[tokio::test]
async fn test_streamed_message_is_reassembled() {
    init_logging();
    let (server_endpoint, mut server_events) = recorder();
    let server = ServerContainer::builder()
        .endpoint(ServerEndpointConfig::new("/stream"), server_endpoint)
        .deploy()
        .unwrap();
    let session = connect(&server, Handlers::new(), ClientEndpointConfig::default(), "/stream")
        .await
        .unwrap();
    assert_eq!(next(&mut server_events).await, Event::Open);

    let data: Vec<u8> = (0..=255).collect();
    let mut stream = session.basic_remote().unwrap().send_stream().unwrap();
    for chunk in data.chunks(64) {
        stream.write_all(chunk).unwrap();
    }
    stream.close().unwrap();

    assert_eq!(next(&mut server_events).await, Event::Binary(256));
}

#[tokio::test]
async fn test_both_sides_flooding_a_small_pipe() {
    init_logging();
    let server = ServerContainer::builder()
        .endpoint(ServerEndpointConfig::new("/echo"), echo())
        .deploy()
        .unwrap();

    let (client_io, server_io) = tokio::io::duplex(1024);
    server.serve_stream(server_io);
    let (client, mut events) = recorder();
    let session = ClientContainer::new()
        .connect_with_stream(
            client,
            ClientEndpointConfig::default(),
            "ws://localhost/echo",
            client_io,
        )
        .await
        .unwrap();
    assert_eq!(next(&mut events).await, Event::Open);

    let remote = session.basic_remote().unwrap();
    for _ in 0..16 {
        remote.send_binary(vec![0x5Au8; 64 * 1024]).unwrap();
    }
    for _ in 0..16 {
        assert_eq!(next(&mut events).await, Event::Binary(64 * 1024));
    }
}

#[tokio::test]
async fn test_message_too_big_closes_with_1009() {
    init_logging();
    let (server_endpoint, mut server_events) = recorder();
    let server = ServerContainer::builder()
        .config(ContainerConfig::default().with_max_text_message_buffer_size(5))
        .endpoint(ServerEndpointConfig::new("/small"), server_endpoint)
        .deploy()
        .unwrap();
    let (client, mut client_events) = recorder();
    let session = connect(&server, client, ClientEndpointConfig::default(), "/small")
        .await
        .unwrap();
    assert_eq!(next(&mut server_events).await, Event::Open);
    assert_eq!(next(&mut client_events).await, Event::Open);

    let remote = session.basic_remote().unwrap();
    remote.send_text("TEST1").unwrap();
    assert_eq!(next(&mut server_events).await, Event::Text("TEST1".into()));

    remote.send_text("LONG--").unwrap();
    let expected = "Message too long; allowed message size is 5 bytes. (Current message length is 6 bytes)";
    assert_eq!(
        next(&mut server_events).await,
        Event::Error(expected.into())
    );
    assert_eq!(
        next(&mut client_events).await,
        Event::Close(1009, expected.into())
    );
}

#[tokio::test]
async fn test_open_sessions_are_tracked() {
    init_logging();
    let (server_endpoint, mut server_events) = recorder();
    let server = ServerContainer::builder()
        .endpoint(ServerEndpointConfig::new("/room"), server_endpoint)
        .deploy()
        .unwrap();

    let mut clients = Vec::new();
    for _ in 0..4 {
        let session = connect(&server, Handlers::new(), ClientEndpointConfig::default(), "/room")
            .await
            .unwrap();
        assert_eq!(next(&mut server_events).await, Event::Open);
        clients.push(session);
    }
    assert_eq!(server.open_sessions().len(), 4);
    assert_eq!(server.open_sessions()[0].open_sessions().unwrap().len(), 4);

    clients[0].close().unwrap();
    assert_eq!(next(&mut server_events).await, Event::Close(1000, String::new()));
    assert_eq!(server.open_sessions().len(), 3);
}

#[tokio::test]
async fn test_subprotocol_and_response_hook() {
    init_logging();
    let server = ServerContainer::builder()
        .endpoint(
            ServerEndpointConfig::new("/chat").with_subprotocols(["chat"]),
            Handlers::new(),
        )
        .deploy()
        .unwrap();

    let accepted = Arc::new(Mutex::new(None));
    let hook = accepted.clone();
    let config = ClientEndpointConfig::default()
        .with_subprotocols(["superchat", "chat"])
        .with_after_response(move |response| {
            *hook.lock().unwrap() = response.header("sec-websocket-accept").map(str::to_owned);
        });

    let session = connect(&server, Handlers::new(), config, "/chat").await.unwrap();
    assert_eq!(session.negotiated_subprotocol().unwrap(), Some("chat"));
    assert!(accepted.lock().unwrap().is_some());
}

#[tokio::test]
async fn test_unknown_path_fails_the_handshake() {
    init_logging();
    let server = ServerContainer::builder()
        .endpoint(ServerEndpointConfig::new("/echo"), echo())
        .deploy()
        .unwrap();

    let err = connect(&server, Handlers::new(), ClientEndpointConfig::default(), "/nope")
        .await
        .unwrap_err();
    let WebSocketError::Deployment(err) = err else {
        panic!("expected a deployment error, got {err:?}");
    };
    assert_eq!(err.message(), "Handshake error.");
    assert!(matches!(&err.causes()[0], WebSocketError::Handshake(cause) if cause.code() == 404));
}

#[tokio::test]
async fn test_plain_http_gets_not_found() {
    init_logging();
    let server = ServerContainer::builder()
        .endpoint(ServerEndpointConfig::new("/echo"), echo())
        .deploy()
        .unwrap();

    let (mut client_io, server_io) = tokio::io::duplex(4096);
    server.serve_stream(server_io);
    client_io
        .write_all(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), client_io.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert!(response.starts_with(b"HTTP/1.1 404"));
}

#[tokio::test]
async fn test_echo_over_tcp() {
    init_logging();
    let server = ServerContainer::builder()
        .endpoint(ServerEndpointConfig::new("/echo"), echo())
        .deploy()
        .unwrap();
    let handle = server.bind("127.0.0.1:0").await.unwrap();

    let (client, mut events) = recorder();
    let session = ClientContainer::new()
        .connect(
            client,
            ClientEndpointConfig::default(),
            format!("ws://{}/echo", handle.local_addr()),
        )
        .await
        .unwrap();
    assert_eq!(next(&mut events).await, Event::Open);

    session.basic_remote().unwrap().send_text("over tcp").unwrap();
    assert_eq!(next(&mut events).await, Event::Text("over tcp".into()));

    session.close().unwrap();
    assert_eq!(next(&mut events).await, Event::Close(1000, String::new()));
    handle.stop().await;
}
