mod config;
mod error;
mod handlers;
mod router;
mod state;
mod subscriber;

use config::GatewayConfig;
use market_data::directory::InstrumentDirectory;
use market_data::session::publish_spots;
use router::create_router;
use state::AppState;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

const MAX_LOAD_BACKOFF: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!(version = market_data::SERVICE_VERSION, "Starting option-chain gateway");

    let config = GatewayConfig::from_env();
    let state = AppState::new(config.clone());

    // Connections wait on the directory; load it in the background.
    tokio::spawn(load_directory(state.directory.clone()));

    let underlyings: Vec<_> = config.directory.underlyings.values().cloned().collect();
    state.session.request_subscription(&underlyings);
    if config.access_token.is_some() {
        state.session.start();
    } else {
        tracing::warn!("FEED_ACCESS_TOKEN not set; upstream feed disabled");
    }

    tokio::spawn(publish_spots(
        state.session.clone(),
        state.subscriptions.clone(),
        config.directory.underlyings.clone(),
        config.keepalive_interval,
    ));

    let app = create_router(state.clone());

    let listener = TcpListener::bind(config.bind_addr).await?;
    tracing::info!("Listening on {}", config.bind_addr);
    axum::serve(listener, app).await?;

    state.session.shutdown();
    Ok(())
}

/// Retry the one-time load until it succeeds.
async fn load_directory(directory: Arc<InstrumentDirectory>) {
    let mut delay = Duration::from_secs(1);
    while let Err(e) = directory.load().await {
        tracing::warn!(error = %e, retry_in_secs = delay.as_secs(), "Instrument directory load failed");
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(MAX_LOAD_BACKOFF);
    }
}
