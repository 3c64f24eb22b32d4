//! Broadcast Relay
//!
//! Accepts WebSocket connections and forwards every frame received from any
//! connection, unchanged, to every connection that is currently open.
//!
//! ## Architecture
//!
//! - **ConnectionSet**: The registry of open connections and their outbound queues
//! - **Handler**: Upgrades requests and runs one reader and one writer task per peer
//! - **Frame**: The opaque text or binary payload being relayed
//!
//! ## Endpoints
//!
//! - `GET /` - WebSocket upgrade (what sensor producers and dashboards use)
//! - `GET /ws` - Same, for clients that expect a path
//!
//! ## Example
//!
//! ```rust,no_run
//! use sensor_relay::{Relay, RelayConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let relay = Relay::start(RelayConfig::new("127.0.0.1", 8080)).await?;
//!     println!("Relaying on {}", relay.url());
//!
//!     // ... later
//!     relay.shutdown().await?;
//!     Ok(())
//! }
//! ```

mod error;
mod frame;
mod handler;
mod registry;

pub use error::{RelayError, RelayResult};
pub use frame::Frame;
pub use handler::websocket_handler;
pub use registry::{
    ConnectionId, ConnectionSet, ConnectionState, EchoPolicy, FanoutReport, RegisterError,
    Registration, SendError, SetConfig,
};

use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::RelayConfig;

/// How long `shutdown` waits for the accept loop before aborting it
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Shared state for the WebSocket handler
pub struct RelayState {
    /// Open connections of this relay instance
    pub connections: Arc<ConnectionSet>,
    /// Relay configuration
    pub config: Arc<RelayConfig>,
    /// Cancelled when the relay shuts down; parent of every connection token
    pub shutdown: CancellationToken,
}

impl RelayState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            connections: Arc::new(ConnectionSet::new(SetConfig::from(&config))),
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }
}

/// Build the relay router
pub fn build_router(state: RelayState) -> Router {
    Router::new()
        .route("/", get(websocket_handler))
        .route("/ws", get(websocket_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Entry points for running a relay
pub struct Relay;

impl Relay {
    /// Bind the listening endpoint and start accepting connections
    ///
    /// The returned handle owns the listener: dropping it, or calling
    /// [`RelayHandle::shutdown`], closes every connection and stops
    /// accepting new ones.
    pub async fn start(config: RelayConfig) -> RelayResult<RelayHandle> {
        let addr = config.addr();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| RelayError::bind(addr.as_str(), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| RelayError::bind(addr.as_str(), e))?;

        let echo = config.echo;
        let state = RelayState::new(config);
        let connections = Arc::clone(&state.connections);
        let shutdown = state.shutdown.clone();
        let router = build_router(state);

        let token = shutdown.clone();
        let server = tokio::spawn(async move {
            let stop = token.clone();
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
                .map_err(RelayError::Serve);
            // A failed accept loop takes every connection down with it
            token.cancel();
            result
        });

        tracing::info!(echo = %echo, "Sensor relay listening on ws://{}", local_addr);

        Ok(RelayHandle {
            local_addr,
            connections,
            shutdown,
            server: Some(server),
        })
    }

    /// Run a relay until SIGINT/SIGTERM or a fatal server error
    pub async fn run(config: RelayConfig) -> RelayResult<()> {
        let handle = Self::start(config).await?;

        tokio::select! {
            _ = shutdown_signal() => {}
            _ = handle.stopped() => {
                tracing::error!("Relay stopped unexpectedly");
            }
        }

        handle.shutdown().await
    }
}

/// Handle to a running relay
pub struct RelayHandle {
    local_addr: SocketAddr,
    connections: Arc<ConnectionSet>,
    shutdown: CancellationToken,
    server: Option<JoinHandle<RelayResult<()>>>,
}

impl RelayHandle {
    /// The address actually bound (useful when the configured port is 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// WebSocket URL for clients
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.connection_count().await
    }

    /// Resolves once the relay has begun shutting down
    pub async fn stopped(&self) {
        self.shutdown.cancelled().await
    }

    /// Close every connection and the listening endpoint
    pub async fn shutdown(mut self) -> RelayResult<()> {
        tracing::info!("Shutting down relay");
        self.shutdown.cancel();
        let closed = self.connections.close_all().await;

        let result = match self.server.take() {
            Some(mut server) => match tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await {
                Ok(joined) => joined.map_err(RelayError::from).and_then(|r| r),
                Err(_) => {
                    tracing::warn!(
                        grace_secs = SHUTDOWN_GRACE.as_secs(),
                        "Accept loop did not stop in time, aborting"
                    );
                    server.abort();
                    Ok(())
                }
            },
            None => Ok(()),
        };

        tracing::info!(closed_connections = closed, "Relay shut down");
        result
    }
}

impl Drop for RelayHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(server) = self.server.take() {
            server.abort();
        }
    }
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::util::ServiceExt;

    fn create_test_app() -> Router {
        build_router(RelayState::new(RelayConfig::default()))
    }

    #[tokio::test]
    async fn test_plain_http_is_rejected() {
        let response = create_test_app()
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn test_unknown_route_returns_404() {
        let response = create_test_app()
            .oneshot(
                Request::builder()
                    .uri("/nonexistent")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_start_on_ephemeral_port() {
        let relay = Relay::start(RelayConfig::new("127.0.0.1", 0)).await.unwrap();

        assert_ne!(relay.local_addr().port(), 0);
        assert!(relay.url().starts_with("ws://127.0.0.1:"));
        assert_eq!(relay.connection_count().await, 0);

        relay.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_error_when_port_taken() {
        let first = Relay::start(RelayConfig::new("127.0.0.1", 0)).await.unwrap();
        let port = first.local_addr().port();

        let second = Relay::start(RelayConfig::new("127.0.0.1", port)).await;
        assert!(matches!(second, Err(RelayError::Bind { .. })));

        first.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropping_handle_cancels_relay() {
        let relay = Relay::start(RelayConfig::new("127.0.0.1", 0)).await.unwrap();
        let token = relay.shutdown.clone();

        drop(relay);
        assert!(token.is_cancelled());
    }
}
