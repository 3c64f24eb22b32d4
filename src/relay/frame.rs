//! Relay Frame Types
//!
//! Payloads are opaque: the relay never parses them, it only remembers
//! whether a frame arrived as text or binary so it can forward it the
//! same way.

use axum::extract::ws::Message;
use std::borrow::Cow;
use std::sync::Arc;

/// An opaque payload received from one connection
///
/// Cloning is cheap, so queueing one inbound frame on every target shares
/// the payload. Each target's writer copies it once, into the outgoing
/// WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A text frame (the reference producers send one reading per frame)
    Text(Arc<str>),
    /// A binary frame
    Binary(Arc<[u8]>),
}

impl Frame {
    pub fn text(text: impl Into<Arc<str>>) -> Self {
        Frame::Text(text.into())
    }

    pub fn binary(data: impl Into<Arc<[u8]>>) -> Self {
        Frame::Binary(data.into())
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Short name used in log fields
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Text(_) => "text",
            Frame::Binary(_) => "binary",
        }
    }

    /// The payload as text, if it was sent as a text frame
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Frame::Text(text) => Some(text.as_ref()),
            Frame::Binary(_) => None,
        }
    }

    /// The payload as text, decoding binary payloads lossily
    pub fn to_text_lossy(&self) -> Cow<'_, str> {
        match self {
            Frame::Text(text) => Cow::Borrowed(text.as_ref()),
            Frame::Binary(data) => String::from_utf8_lossy(data),
        }
    }

    pub(crate) fn into_message(self) -> Message {
        match self {
            Frame::Text(text) => Message::Text(text.to_string()),
            Frame::Binary(data) => Message::Binary(data.to_vec()),
        }
    }
}

/// What the relay does with one inbound WebSocket message
#[derive(Debug)]
pub(crate) enum Inbound {
    /// Forward to the connection set
    Forward(Frame),
    /// Ping/pong, answered by the transport
    Control,
    /// Peer started the closing handshake
    Close,
}

impl From<Message> for Inbound {
    fn from(message: Message) -> Self {
        match message {
            Message::Text(text) => Inbound::Forward(Frame::text(text)),
            Message::Binary(data) => Inbound::Forward(Frame::binary(data)),
            Message::Ping(_) | Message::Pong(_) => Inbound::Control,
            Message::Close(_) => Inbound::Close,
        }
    }
}
