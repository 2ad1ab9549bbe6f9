//! A WebSocket echo server.
//! It echoes back any text or binary message it receives on `/echo`.

use wsengine::{Handlers, Message, ServerContainer, ServerEndpointConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    simple_logger::init_with_level(log::Level::Debug).expect("log");

    let echo = Handlers::new()
        .on_open(|session| log::info!("Client connected: {:?}", session.id()))
        .on_message(|session, message| {
            let Ok(remote) = session.basic_remote() else {
                return;
            };
            let result = match message {
                Message::Text(text) => remote.send_text(text),
                Message::Binary(data) => remote.send_binary(data),
                Message::Pong(_) => Ok(()),
            };
            if let Err(err) = result {
                log::error!("Error sending message: {err}");
            }
        })
        .on_close(|_, reason| log::debug!("Client disconnected: {reason}"));

    let container = ServerContainer::builder()
        .endpoint(
            ServerEndpointConfig::new("/echo").with_subprotocols(["echo"]),
            echo,
        )
        .deploy()?;

    let server = container.bind("127.0.0.1:8025").await?;
    log::info!("Listening on ws://{}/echo", server.local_addr());
    server.wait().await;

    Ok(())
}
