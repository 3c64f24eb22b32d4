//! # Sensor Relay
//!
//! A WebSocket broadcast relay for live sensor readings. One producer (for
//! example a microcontroller reporting a hall-effect sensor) connects and
//! sends readings; every connected dashboard receives them unmodified and
//! in order.
//!
//! ## Features
//!
//! - **Fan-out**: Every frame is forwarded to every open connection
//! - **Isolation**: A slow or broken consumer is disconnected without delaying the others
//! - **Opaque payloads**: Text and binary frames are relayed byte-for-byte
//! - **Clean shutdown**: Dropping the relay handle closes every connection
//!
//! ## Modules
//!
//! - [`relay`]: The broadcast relay server
//! - [`client`]: WebSocket client for producers and consumers
//! - [`history`]: Accumulating consumer with CSV/JSON export
//! - [`config`]: TOML and environment configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sensor_relay::{Relay, RelayClient, RelayConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let relay = Relay::start(RelayConfig::new("127.0.0.1", 8080)).await?;
//!
//!     let mut dashboard = RelayClient::connect(&relay.url()).await?;
//!     let mut sensor = RelayClient::connect(&relay.url()).await?;
//!
//!     sensor.send_text("42").await?;
//!     let frame = dashboard.next_frame().await?;
//!     println!("Dashboard received {:?}", frame);
//!
//!     relay.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod history;
pub mod relay;

pub use relay::{
    build_router, ConnectionSet, ConnectionState, EchoPolicy, FanoutReport, Frame, Relay,
    RelayError, RelayHandle, RelayResult, RelayState, SendError, SetConfig,
};

pub use client::{ClientError, RelayClient};

pub use history::{ExportFormat, History, HistoryError, Reading};

pub use config::{generate_default_config, Config, ConfigError, LoggingConfig, RelayConfig};
