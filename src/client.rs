//! Relay Client
//!
//! A thin WebSocket client for talking to a relay. The CLI uses it as a
//! producer (send readings) and as a consumer (watch or record them).

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::relay::Frame;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A connection to a relay
pub struct RelayClient {
    stream: WsStream,
    url: String,
    close_frame: Option<CloseFrame>,
}

impl RelayClient {
    /// Connect to a relay, e.g. `ws://localhost:8080`
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|source| ClientError::Connect {
                url: url.to_string(),
                source,
            })?;

        tracing::debug!(url = %url, "Connected to relay");
        Ok(Self {
            stream,
            url: url.to_string(),
            close_frame: None,
        })
    }

    /// The close frame the relay sent, once `next_frame` has seen it
    pub fn close_frame(&self) -> Option<&CloseFrame> {
        self.close_frame.as_ref()
    }

    /// Send one text frame
    pub async fn send_text(&mut self, text: impl Into<String>) -> Result<(), ClientError> {
        self.stream.send(Message::text(text.into())).await?;
        Ok(())
    }

    /// Send one binary frame
    pub async fn send_binary(&mut self, data: impl Into<Vec<u8>>) -> Result<(), ClientError> {
        self.stream.send(Message::binary(data.into())).await?;
        Ok(())
    }

    /// Wait for the next relayed frame
    ///
    /// Control frames are skipped. Returns `Ok(None)` once the relay closes
    /// the connection.
    pub async fn next_frame(&mut self) -> Result<Option<Frame>, ClientError> {
        while let Some(message) = self.stream.next().await {
            match message? {
                Message::Text(text) => return Ok(Some(Frame::text(text.as_str()))),
                Message::Binary(data) => return Ok(Some(Frame::binary(data.to_vec()))),
                Message::Close(frame) => {
                    tracing::debug!(url = %self.url, close = ?frame, "Relay closed the connection");
                    self.close_frame = frame;
                    return Ok(None);
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
        Ok(None)
    }

    /// Close the connection
    pub async fn close(mut self) -> Result<(), ClientError> {
        match self.stream.close(None).await {
            Ok(()) => Ok(()),
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Errors talking to a relay
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },

    #[error("WebSocket error: {0}")]
    Transport(#[from] tungstenite::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nobody listens on
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = RelayClient::connect(&format!("ws://127.0.0.1:{}", port)).await;
        assert!(matches!(result, Err(ClientError::Connect { .. })));
    }

    #[tokio::test]
    async fn test_invalid_url() {
        let result = RelayClient::connect("not a url").await;
        assert!(result.is_err());
    }
}
