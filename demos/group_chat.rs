//! # Group Chat Example
//!
//! Demonstrates a complete pub/sub client lifecycle:
//!
//! 1. Negotiate an access URL and open the WebSocket on first use
//! 2. Join a group
//! 3. Print every message broadcast to the group
//! 4. Send each line typed on stdin to the group
//! 5. Leave and close gracefully on Ctrl+C or end of input
//!
//! ## Running
//!
//! ```sh
//! PUBSUB_HUB=chat \
//! PUBSUB_NEGOTIATE_URL=https://my-app.example.com/negotiate \
//! cargo run --example group_chat
//!
//! # Pick a different group:
//! PUBSUB_GROUP=general cargo run --example group_chat
//! ```

use tokio::io::{AsyncBufReadExt, BufReader};
use web_pubsub_client::{handler_fn, HandlerError, PubSubClient, PubSubConfig};

/// Default group when `PUBSUB_GROUP` is not set.
const DEFAULT_GROUP: &str = "lobby";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Logging ─────────────────────────────────────────────────────
    // Initialize tracing. Set `RUST_LOG=debug` for verbose output.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // ── Configuration ───────────────────────────────────────────────
    let config = PubSubConfig::from_env()?;
    let group = std::env::var("PUBSUB_GROUP").unwrap_or_else(|_| DEFAULT_GROUP.to_string());
    tracing::info!("Hub {} via {}", config.hub, config.negotiate_url);

    // ── Client ──────────────────────────────────────────────────────
    // The handler runs on the background receive loop, one message at a time.
    let watched = group.clone();
    let client = PubSubClient::builder(config)
        .with_handler(handler_fn(move |_client, event| {
            let watched = watched.clone();
            async move {
                let msg = event.message;
                if msg.is_group_message(&watched) {
                    println!("<{}> {}", msg.from_user_id, msg.data);
                } else {
                    tracing::debug!("{} {}", msg.kind, msg.event);
                }
                Ok::<(), HandlerError>(())
            }
        }))
        .build()?;

    // Joining is the first send, so it also starts the receive loop.
    client.join_group(&group).await?;
    tracing::info!("Joined {group}; type a line to send it, Ctrl+C to quit");

    // ── Input loop ──────────────────────────────────────────────────
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            // Branch 1: a line from stdin.
            line = lines.next_line() => {
                let Some(line) = line? else {
                    tracing::info!("End of input, exiting");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                if let Err(e) = client.send_to_group(&group, &line).await {
                    tracing::warn!("Send failed: {e}");
                }
            }

            // Branch 2: Ctrl+C, shut down gracefully.
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl+C received, shutting down…");
                break;
            }
        }
    }

    // ── Cleanup ─────────────────────────────────────────────────────
    if let Err(e) = client.leave_group(&group).await {
        tracing::warn!("Leave failed: {e}");
    }
    client.close("client exiting").await?;
    tracing::info!("Client closed. Goodbye!");
    Ok(())
}
