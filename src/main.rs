//! stall-stream: a paced, stalling HTTP body and a client that aborts it
//!
//! One process run:
//! - Starts an HTTP server on an ephemeral local port
//! - POSTs a stream request to it (by default: 1 MiB body, 5s stall
//!   after 500 bytes)
//! - Aborts the request after a fixed delay (3s by default)
//! - Shuts the server down, whatever happened
//!
//! Configuration via CLI arguments or TOML file; defaults need neither.

mod body;
mod cancel;
mod config;
mod payload;
mod scenario;
mod server;
mod stream;

use config::Config;
use scenario::ScenarioError;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        path = %config.path,
        cancel_after_ms = stream::as_millis_u64(config.cancel_after),
        stalls = config.request.body_timeouts.len(),
        "Starting stall-stream"
    );

    // Single-threaded: one event loop drives both server and client
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    match runtime.block_on(scenario::run(&config))? {
        Ok(bytes) => info!(bytes, "Scenario finished: body received"),
        Err(ScenarioError::Aborted { .. }) => info!("Scenario finished: request aborted"),
        Err(_) => info!("Scenario finished: request failed"),
    }

    Ok(())
}
