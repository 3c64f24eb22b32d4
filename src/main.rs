//! Sensor Relay Server
//!
//! Run with: cargo run --bin sensor-relay
//!
//! # Configuration
//!
//! Read from the first of `$XDG_CONFIG_HOME/sensor-relay/config.toml`,
//! `/etc/sensor-relay/config.toml` or `./config.toml`, with environment
//! overrides:
//! - `SENSOR_RELAY_HOST`: Host to bind to (default: 0.0.0.0)
//! - `SENSOR_RELAY_PORT`: Port to listen on (default: 8080)
//! - `SENSOR_RELAY_ECHO`: `all` or `except_sender` (default: all)
//! - `SENSOR_RELAY_LOG_LEVEL`: Log level (default: info)
//! - `SENSOR_RELAY_LOG_FORMAT`: `pretty` or `json` (default: pretty)
//! - `RUST_LOG`: Full filter directive, takes precedence over the log level

use sensor_relay::{Config, LoggingConfig, Relay};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load_default();
    init_logging(&config.logging);

    tracing::info!("Starting Sensor Relay v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        echo = %config.relay.echo,
        outbound_buffer = config.relay.outbound_buffer,
        max_connections = config.relay.max_connections,
        "Relay settings"
    );

    if let Err(e) = Relay::run(config.relay).await {
        tracing::error!(error = %e, "Relay failed");
        return Err(e.into());
    }

    tracing::info!("Sensor Relay stopped");
    Ok(())
}

/// Initialize tracing from the logging config
fn init_logging(config: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("sensor_relay={},tower_http=info", config.level))
    });

    let registry = tracing_subscriber::registry().with(filter);
    if config.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
