//! Relay Error Types

use thiserror::Error;

/// Errors that stop the relay itself
///
/// Per-connection failures never surface here; they only disconnect the
/// affected peer.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The listening endpoint could not be established
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The accept loop failed after startup
    #[error("Server error: {0}")]
    Serve(#[source] std::io::Error),

    /// The accept loop task panicked or was aborted
    #[error("Server task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl RelayError {
    pub(crate) fn bind(addr: impl Into<String>, source: std::io::Error) -> Self {
        RelayError::Bind {
            addr: addr.into(),
            source,
        }
    }
}

/// Result type for relay operations
pub type RelayResult<T> = Result<T, RelayError>;
