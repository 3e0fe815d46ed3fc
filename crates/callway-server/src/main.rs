//! # Callway Server
//!
//! Presence and WebRTC call-signaling server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! callway
//!
//! # Run with environment variables
//! CALLWAY_PORT=8080 CALLWAY_HOST=0.0.0.0 CALLWAY_JWT_SECRET=... callway
//! ```

use anyhow::Result;
use callway_server::{config::Config, metrics, run_server};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "callway=debug,tenvis_callway_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load()?;

    tracing::info!("Starting Callway server on {}:{}", config.host, config.port);

    if config.metrics.enabled {
        metrics::init_metrics();
    }

    run_server(config).await
}
