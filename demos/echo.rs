//! Minimal connection manager demo against a public echo endpoint.
//!
//! Run with:
//! ```sh
//! RUST_LOG=debug cargo run --example echo --features tracing
//! ```

use std::time::Duration;

use chatwire::{Config, ConnectionManager, Event, EventKind};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let manager =
        ConnectionManager::new("wss://echo.websocket.org".to_owned(), Config::default())?;

    manager.add_event_listener(EventKind::Open, |_| info!("connected"));
    manager.add_event_listener(EventKind::Message, |event| {
        if let Event::Message { payload } = event {
            info!(?payload, "echoed back");
        }
    });
    manager.add_event_listener(EventKind::Close, |_| info!("closed"));

    manager.connect().await?;

    manager.send(&serde_json::json!({ "body": "hello out there", "sender": "demo" }));
    manager.send_text("plain text says hi".to_owned());

    tokio::time::sleep(Duration::from_secs(3)).await;

    manager.disconnect();

    Ok(())
}
