//! # Beacon
//!
//! Headless connectivity client. Logs in, keeps the channel up, and logs
//! every connection, presence, typing and delivery event.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! BEACON_TOKEN=... beacon
//!
//! # Point at another server
//! BEACON_WS_URL=wss://chat.example.com/ws BEACON_API_URL=https://chat.example.com beacon
//! ```

use anyhow::{Context, Result};
use beacon_client::{metrics, AuthState, Client, Config, HttpPresenceApi};
use beacon_core::{Event, Topic};
use beacon_transport::{WebSocketConfig, WebSocketTransport};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "beacon=debug,beacon_client=debug,beacon_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load()?;

    if config.metrics.enabled {
        metrics::init_metrics();
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            warn!(error = %e, port = config.metrics.port, "Metrics exporter not started");
        }
    }

    let token = std::env::var("BEACON_TOKEN").context("BEACON_TOKEN is not set")?;

    info!(ws = %config.server.ws_url, api = %config.server.api_base_url, "Starting Beacon");

    let transport = WebSocketTransport::new(WebSocketConfig::new(&config.server.ws_url));
    let api = HttpPresenceApi::new(&config.server).context("Failed to build HTTP client")?;
    let client = Client::new(config, Arc::new(transport), Arc::new(api), AuthState::new());

    let loggers: Vec<_> = [
        Topic::ConnectionState,
        Topic::PresenceChange,
        Topic::TypingChange,
        Topic::DeliveryChange,
    ]
    .into_iter()
    .map(|topic| {
        let mut events = client.subscribe(topic);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                log_event(&event);
            }
        })
    })
    .collect();

    client.login(token).await;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down");
    client.logout().await;
    client.shutdown().await;
    for logger in loggers {
        logger.abort();
    }

    Ok(())
}

fn log_event(event: &Event) {
    match event {
        Event::ConnectionState(change) => match &change.reason {
            Some(reason) => info!(from = %change.previous, to = %change.current, %reason, "Connection"),
            None => info!(from = %change.previous, to = %change.current, "Connection"),
        },
        Event::Presence(change) => {
            info!(user = %change.user_id, status = change.current.as_str(), source = ?change.source, "Presence");
        }
        Event::Typing(change) => {
            info!(
                conversation = %change.conversation_id,
                user = %change.user_id,
                typing = change.typing,
                "Typing"
            );
        }
        Event::Delivery(change) => {
            info!(
                message = %change.client_message_id,
                state = %change.current,
                retryable = change.retryable,
                "Delivery"
            );
        }
        Event::Inbound(_) | Event::Outbound(_) => {}
    }
}
