//! Connection Set
//!
//! The relay's authoritative registry of open connections. Each entry owns
//! the sending half of a bounded per-connection queue; a writer task drains
//! the other half into the socket. Fan-out only ever calls `try_send`, so a
//! slow or stalled consumer can never hold up delivery to the others.

use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::frame::Frame;
use crate::config::RelayConfig;

/// Unique identifier for a relay connection
pub type ConnectionId = String;

/// Which connections receive a frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EchoPolicy {
    /// Every open connection, the sender included
    #[default]
    All,
    /// Every open connection except the one the frame came from
    ExceptSender,
}

impl FromStr for EchoPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(EchoPolicy::All),
            "except_sender" | "except-sender" => Ok(EchoPolicy::ExceptSender),
            other => Err(format!(
                "unknown echo policy '{}' (expected 'all' or 'except_sender')",
                other
            )),
        }
    }
}

impl fmt::Display for EchoPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EchoPolicy::All => f.write_str("all"),
            EchoPolicy::ExceptSender => f.write_str("except_sender"),
        }
    }
}

/// Readiness of a registered connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ConnectionState::Open => 0,
            ConnectionState::Closing => 1,
            ConnectionState::Closed => 2,
        }
    }
}

/// Configuration for the connection set
#[derive(Debug, Clone)]
pub struct SetConfig {
    /// Maximum number of concurrent connections
    pub max_connections: usize,
    /// Frames queued per connection before writes to it count as failed
    pub outbound_buffer: usize,
    /// Whether senders receive their own frames
    pub echo: EchoPolicy,
}

impl Default for SetConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
            outbound_buffer: 1024,
            echo: EchoPolicy::All,
        }
    }
}

impl From<&RelayConfig> for SetConfig {
    fn from(config: &RelayConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            outbound_buffer: config.outbound_buffer.max(1),
            echo: config.echo,
        }
    }
}

/// Registry entry for one connection
struct ConnectionHandle {
    sender: mpsc::Sender<Frame>,
    state: AtomicU8,
    cancel: CancellationToken,
    connected_at: Instant,
}

impl ConnectionHandle {
    fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Mark closed and stop the connection's tasks
    fn close(&self) {
        self.set_state(ConnectionState::Closed);
        self.cancel.cancel();
    }
}

/// Everything a connection task needs after registering
pub struct Registration {
    pub id: ConnectionId,
    /// Frames fanned out to this connection, in order
    pub outbound: mpsc::Receiver<Frame>,
    /// Cancelled when the connection is evicted or the relay shuts down
    pub cancel: CancellationToken,
}

/// Outcome of fanning out one frame
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FanoutReport {
    /// Targets the frame was queued on
    pub delivered: usize,
    /// Targets skipped by state or echo policy
    pub skipped: usize,
    /// Targets whose write failed; these have been evicted
    pub failed: Vec<(ConnectionId, SendError)>,
}

/// Manages the set of open relay connections
pub struct ConnectionSet {
    connections: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
    config: SetConfig,
}

impl ConnectionSet {
    pub fn new(config: SetConfig) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Register a new connection in the OPEN state
    ///
    /// The connection's cancellation token is a child of `shutdown`, so
    /// cancelling the relay-wide token stops every connection task.
    pub async fn register(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<Registration, RegisterError> {
        let mut connections = self.connections.write().await;
        if connections.len() >= self.config.max_connections {
            return Err(RegisterError::TooManyConnections {
                limit: self.config.max_connections,
            });
        }

        let id = Uuid::new_v4().to_string();
        let (sender, outbound) = mpsc::channel(self.config.outbound_buffer);
        let cancel = shutdown.child_token();

        connections.insert(
            id.clone(),
            ConnectionHandle {
                sender,
                state: AtomicU8::new(ConnectionState::Open.as_u8()),
                cancel: cancel.clone(),
                connected_at: Instant::now(),
            },
        );
        let total = connections.len();
        drop(connections);

        tracing::info!(connection_id = %id, connections = total, "Client connected");
        Ok(Registration { id, outbound, cancel })
    }

    /// Stop targeting a connection that has started its closing handshake
    pub async fn mark_closing(&self, id: &str) {
        if let Some(handle) = self.connections.read().await.get(id) {
            handle.set_state(ConnectionState::Closing);
        }
    }

    /// Remove a connection from the set
    ///
    /// Returns whether the connection was present. Removing an absent
    /// connection is a no-op.
    pub async fn unregister(&self, id: &str) -> bool {
        let (handle, remaining) = {
            let mut connections = self.connections.write().await;
            let handle = connections.remove(id);
            (handle, connections.len())
        };

        match handle {
            Some(handle) => {
                handle.close();
                tracing::info!(
                    connection_id = %id,
                    connections = remaining,
                    connected_secs = handle.connected_at.elapsed().as_secs(),
                    "Client disconnected"
                );
                true
            }
            None => false,
        }
    }

    /// Queue a frame on every OPEN connection
    ///
    /// A full or closed queue fails only that target. Failed targets are
    /// evicted once the fan-out pass is finished.
    pub async fn broadcast(&self, origin: &str, frame: &Frame) -> FanoutReport {
        let mut report = FanoutReport::default();

        {
            let connections = self.connections.read().await;
            for (id, handle) in connections.iter() {
                if self.config.echo == EchoPolicy::ExceptSender && id == origin {
                    report.skipped += 1;
                    continue;
                }
                if handle.state() != ConnectionState::Open {
                    report.skipped += 1;
                    continue;
                }

                match handle.sender.try_send(frame.clone()) {
                    Ok(()) => report.delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        report.failed.push((id.clone(), SendError::Full));
                    }
                    Err(TrySendError::Closed(_)) => {
                        report.failed.push((id.clone(), SendError::Closed));
                    }
                }
            }
        }

        for (id, error) in &report.failed {
            tracing::warn!(
                connection_id = %id,
                origin = %origin,
                error = %error,
                "Write failed, disconnecting target"
            );
            self.unregister(id).await;
        }

        tracing::trace!(
            origin = %origin,
            kind = frame.kind(),
            bytes = frame.len(),
            delivered = report.delivered,
            skipped = report.skipped,
            failed = report.failed.len(),
            "Fan-out complete"
        );

        report
    }

    /// Close and remove every connection
    ///
    /// Returns the number of connections that were closed.
    pub async fn close_all(&self) -> usize {
        let drained: Vec<_> = self.connections.write().await.drain().collect();
        for (id, handle) in &drained {
            handle.close();
            tracing::debug!(connection_id = %id, "Closing connection");
        }
        drained.len()
    }

    /// Current state of a connection, `None` once it has been removed
    pub async fn state(&self, id: &str) -> Option<ConnectionState> {
        self.connections.read().await.get(id).map(|h| h.state())
    }

    /// Get the current connection count
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }
}

/// Errors registering a connection
#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("Too many connections (limit: {limit})")]
    TooManyConnections { limit: usize },
}

/// Why a frame could not be queued for a target
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("outbound queue full")]
    Full,

    #[error("connection closed")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn register(set: &ConnectionSet) -> Registration {
        set.register(&CancellationToken::new()).await.unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = SetConfig::default();
        assert_eq!(config.max_connections, 1000);
        assert_eq!(config.outbound_buffer, 1024);
        assert_eq!(config.echo, EchoPolicy::All);
    }

    #[test]
    fn test_echo_policy_parse() {
        assert_eq!("all".parse::<EchoPolicy>().unwrap(), EchoPolicy::All);
        assert_eq!(
            "except-sender".parse::<EchoPolicy>().unwrap(),
            EchoPolicy::ExceptSender
        );
        assert_eq!(EchoPolicy::ExceptSender.to_string(), "except_sender");
        assert!("nobody".parse::<EchoPolicy>().is_err());
    }

    #[tokio::test]
    async fn test_register_unregister() {
        let set = ConnectionSet::new(SetConfig::default());

        let reg = register(&set).await;
        assert!(!reg.id.is_empty());
        assert_eq!(set.connection_count().await, 1);
        assert_eq!(set.state(&reg.id).await, Some(ConnectionState::Open));

        assert!(set.unregister(&reg.id).await);
        assert_eq!(set.connection_count().await, 0);
        assert!(reg.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let set = ConnectionSet::new(SetConfig::default());
        let reg = register(&set).await;

        assert!(set.unregister(&reg.id).await);
        assert!(!set.unregister(&reg.id).await);
        assert!(!set.unregister("never-registered").await);
        assert_eq!(set.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let config = SetConfig {
            max_connections: 2,
            ..SetConfig::default()
        };
        let set = ConnectionSet::new(config);

        let _a = register(&set).await;
        let _b = register(&set).await;
        let result = set.register(&CancellationToken::new()).await;

        assert!(matches!(
            result,
            Err(RegisterError::TooManyConnections { limit: 2 })
        ));
    }

    #[tokio::test]
    async fn test_broadcast_includes_sender_by_default() {
        let set = ConnectionSet::new(SetConfig::default());
        let mut producer = register(&set).await;
        let mut consumer = register(&set).await;

        let report = set.broadcast(&producer.id, &Frame::text("42")).await;
        assert_eq!(report.delivered, 2);
        assert!(report.failed.is_empty());

        assert_eq!(consumer.outbound.try_recv().unwrap(), Frame::text("42"));
        assert_eq!(producer.outbound.try_recv().unwrap(), Frame::text("42"));
    }

    #[tokio::test]
    async fn test_broadcast_except_sender() {
        let config = SetConfig {
            echo: EchoPolicy::ExceptSender,
            ..SetConfig::default()
        };
        let set = ConnectionSet::new(config);
        let mut producer = register(&set).await;
        let mut consumer = register(&set).await;

        let report = set.broadcast(&producer.id, &Frame::text("42")).await;
        assert_eq!(report.delivered, 1);
        assert_eq!(report.skipped, 1);

        assert_eq!(consumer.outbound.try_recv().unwrap(), Frame::text("42"));
        assert!(producer.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_preserves_order() {
        let set = ConnectionSet::new(SetConfig::default());
        let producer = register(&set).await;
        let mut consumers = vec![register(&set).await, register(&set).await];

        for i in 0..50 {
            set.broadcast(&producer.id, &Frame::text(i.to_string())).await;
        }

        for consumer in consumers.iter_mut() {
            for i in 0..50 {
                assert_eq!(
                    consumer.outbound.try_recv().unwrap(),
                    Frame::text(i.to_string())
                );
            }
            assert!(consumer.outbound.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn test_closed_target_does_not_block_others() {
        let set = ConnectionSet::new(SetConfig::default());
        let producer = register(&set).await;
        let mut first = register(&set).await;
        let gone = register(&set).await;
        let mut last = register(&set).await;

        let gone_id = gone.id.clone();
        drop(gone.outbound);

        let report = set.broadcast(&producer.id, &Frame::text("5")).await;
        assert_eq!(report.failed, vec![(gone_id.clone(), SendError::Closed)]);
        assert_eq!(report.delivered, 3);

        assert_eq!(first.outbound.try_recv().unwrap(), Frame::text("5"));
        assert_eq!(last.outbound.try_recv().unwrap(), Frame::text("5"));

        // The failed target was evicted and its tasks told to stop
        assert_eq!(set.state(&gone_id).await, None);
        assert!(gone.cancel.is_cancelled());
        assert_eq!(set.connection_count().await, 3);
    }

    #[tokio::test]
    async fn test_full_queue_evicts_slow_consumer() {
        let config = SetConfig {
            outbound_buffer: 2,
            ..SetConfig::default()
        };
        let set = ConnectionSet::new(config);
        let mut producer = register(&set).await;
        let slow = register(&set).await;

        // Producer drains its own echo; the slow consumer never reads
        for i in 0..3 {
            set.broadcast(&producer.id, &Frame::text(i.to_string())).await;
            assert!(producer.outbound.try_recv().is_ok());
        }

        assert_eq!(set.state(&slow.id).await, None);
        assert!(slow.cancel.is_cancelled());
        assert_eq!(set.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_closing_connection_is_skipped() {
        let set = ConnectionSet::new(SetConfig::default());
        let producer = register(&set).await;
        let mut leaving = register(&set).await;

        set.mark_closing(&leaving.id).await;
        assert_eq!(set.state(&leaving.id).await, Some(ConnectionState::Closing));

        let report = set.broadcast(&producer.id, &Frame::text("7")).await;
        assert_eq!(report.skipped, 1);
        assert!(leaving.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_close_all_cancels_children() {
        let shutdown = CancellationToken::new();
        let set = ConnectionSet::new(SetConfig::default());

        let a = set.register(&shutdown).await.unwrap();
        let b = set.register(&shutdown).await.unwrap();

        assert_eq!(set.close_all().await, 2);
        assert_eq!(set.connection_count().await, 0);
        assert!(a.cancel.is_cancelled());
        assert!(b.cancel.is_cancelled());
        assert!(!shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn test_relay_shutdown_reaches_connections() {
        let shutdown = CancellationToken::new();
        let set = ConnectionSet::new(SetConfig::default());
        let reg = set.register(&shutdown).await.unwrap();

        shutdown.cancel();
        assert!(reg.cancel.is_cancelled());
    }
}
