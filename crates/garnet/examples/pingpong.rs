//! Minimal two-endpoint demo: a server and a client in one process,
//! talking over loopback UDP. Run with `cargo run --example pingpong`.

use bytes::Bytes;
use garnet::{Config, Event, Peer, Priority, Reliability, Target};
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
enum AppError {
    #[error("network error: {0}")]
    Net(#[from] garnet::NetError),
}

#[tokio::main]
async fn main() -> Result<(), AppError> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let server = Peer::startup(
        Config {
            advertisement: "garnet pingpong".into(),
            ..Config::default()
        },
        &["127.0.0.1:0".parse().expect("static addr")],
    )
    .await?;
    let server_addr = server.local_addr()?;
    tracing::info!(%server_addr, "server up");

    let client = Peer::startup(Config::default(), &["127.0.0.1:0".parse().expect("static addr")]).await?;
    client.connect("127.0.0.1", server_addr.port(), None).await?;

    // Wait until the handshake completes.
    loop {
        match client.recv().await {
            Some(Event::ConnectionRequestAccepted { addr, guid }) => {
                tracing::info!(%addr, guid, "connected");
                break;
            }
            Some(other) => tracing::info!(?other, "client event"),
            None => return Ok(()),
        }
    }

    for i in 0..5u32 {
        let text = format!("ping {i}");
        client
            .send(
                Bytes::from(text),
                Priority::Medium,
                Reliability::ReliableOrdered,
                0,
                Target::Addr(server_addr),
                None,
            )
            .await?;
    }

    // Echo everything the server hears back to its sender.
    let mut echoed = 0;
    while echoed < 5 {
        if let Some(Event::Message { addr, payload, .. }) = server.recv().await {
            server
                .send(
                    payload,
                    Priority::Medium,
                    Reliability::ReliableOrdered,
                    0,
                    Target::Addr(addr),
                    None,
                )
                .await?;
            echoed += 1;
        }
    }

    let mut received = 0;
    while received < 5 {
        if let Some(Event::Message { payload, .. }) = client.recv().await {
            tracing::info!(reply = %String::from_utf8_lossy(&payload), "echo");
            received += 1;
        }
    }

    client.shutdown(Duration::from_millis(500)).await;
    server.shutdown(Duration::from_millis(500)).await;
    Ok(())
}
