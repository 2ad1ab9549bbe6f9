/// Example client that talks to the echo server and sends a heartbeat every 3 seconds.
use std::time::Duration;

use tokio::{sync::mpsc, time::interval};
use wsengine::{ClientContainer, ClientEndpointConfig, Handlers, Message};

#[derive(serde::Serialize)]
struct Greeting<'a> {
    op: &'a str,
    args: Vec<&'a str>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    simple_logger::init_with_level(log::Level::Debug).expect("log");

    let (closed_tx, mut closed) = mpsc::unbounded_channel();
    let endpoint = Handlers::new()
        .on_message(|_, message| match message {
            Message::Text(text) => log::info!("{text}"),
            Message::Binary(data) => log::info!("{} bytes", data.len()),
            Message::Pong(data) => log::debug!("Pong: {:?}", data),
        })
        .on_close(move |_, reason| {
            log::debug!("Disconnected: {reason}");
            let _ = closed_tx.send(());
        });

    let client = ClientContainer::new();
    let session = client
        .connect(
            endpoint,
            ClientEndpointConfig::default().with_subprotocols(["echo"]),
            "ws://127.0.0.1:8025/echo",
        )
        .await?;

    let greeting = Greeting {
        op: "subscribe",
        args: vec!["publicTrade.BTCUSDT"],
    };
    session
        .basic_remote()?
        .send_text(serde_json::to_string(&greeting)?)?;

    let mut ival = interval(Duration::from_secs(3));
    let mut ticks = 0;
    loop {
        tokio::select! {
            _ = ival.tick() => {
                ticks += 1;
                if ticks > 5 {
                    session.close()?;
                    let _ = closed.recv().await;
                    break;
                }
                log::debug!("Tick");
                session.async_remote()?.send_ping("idk").await?;
            }
            _ = closed.recv() => break,
        }
    }

    Ok(())
}
