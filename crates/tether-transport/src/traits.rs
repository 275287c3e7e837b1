//! Transport capability traits for tether.
//!
//! The client consumes transports through this minimal surface: connect,
//! send, close, a readable state, and event callbacks for open/message/
//! error/close. Any bidirectional frame carrier with these semantics can
//! back a socket — a persistent WebSocket or an HTTP long-poll emulation
//! with the same surface.

use std::fmt;
use thiserror::Error;

use tether_protocol::WireFrame;

/// Connection parameters handed to a transport at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectInfo {
    /// Fully qualified endpoint URL including query parameters.
    pub url: String,
    /// Optional bearer token conveyed during the handshake.
    pub auth_token: Option<String>,
}

impl ConnectInfo {
    /// Create connect info for a URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_token: None,
        }
    }

    /// Attach an auth token.
    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }
}

/// A close notification from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseEvent {
    /// Close status code.
    pub code: u16,
    /// Textual close reason, possibly empty.
    pub reason: String,
}

impl CloseEvent {
    /// Create a close event.
    #[must_use]
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

/// Connection states mirrored from the underlying transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl TransportState {
    /// Lowercase name, as reported by `Socket::connection_state`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            TransportState::Connecting => "connecting",
            TransportState::Open => "open",
            TransportState::Closing => "closing",
            TransportState::Closed => "closed",
        }
    }
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport errors surfaced through the error callback.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The connection could not be established.
    #[error("connect failed: {0}")]
    ConnectFailed(String),

    /// The connection was lost or refused a write.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Event callbacks registered by the socket at connect time.
///
/// Callbacks are lightweight event sinks: the socket's hooks only enqueue
/// the event for its next poll, so implementations may invoke them from
/// `pump()`, from `connect`/`close`, or from embedding-driven emitters.
pub struct TransportCallbacks {
    /// Invoked once the connection is established.
    pub on_open: Box<dyn Fn()>,
    /// Invoked for every inbound frame.
    pub on_message: Box<dyn Fn(WireFrame)>,
    /// Invoked on transport-level errors.
    pub on_error: Box<dyn Fn(TransportError)>,
    /// Invoked when the connection closes, cleanly or not.
    pub on_close: Box<dyn Fn(CloseEvent)>,
}

impl TransportCallbacks {
    /// Callbacks that drop every event; useful as a placeholder in tests.
    #[must_use]
    pub fn noop() -> Self {
        Self {
            on_open: Box::new(|| {}),
            on_message: Box::new(|_| {}),
            on_error: Box::new(|_| {}),
            on_close: Box::new(|_| {}),
        }
    }
}

impl fmt::Debug for TransportCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TransportCallbacks { .. }")
    }
}

/// A client-side transport connection.
pub trait Transport {
    /// Open the underlying connection and register event callbacks.
    fn connect(&mut self, info: ConnectInfo, callbacks: TransportCallbacks);

    /// Send one frame. The socket only sends while the transport reports
    /// itself open; frames sent in other states may be dropped.
    fn send(&mut self, frame: WireFrame);

    /// Close the connection with a status code and reason.
    fn close(&mut self, code: u16, reason: &str);

    /// Current connection state.
    fn ready_state(&self) -> TransportState;

    /// Bytes accepted by `send` but not yet flushed to the peer.
    fn buffered_amount(&self) -> usize {
        0
    }

    /// Whether the transport provides its own liveness signal. Long-poll
    /// emulations acknowledge at the HTTP layer, so the socket skips
    /// application heartbeats for them.
    fn skip_heartbeat(&self) -> bool {
        false
    }

    /// Deliver any internally queued events to the registered callbacks.
    /// Transports that deliver events directly may ignore this.
    fn pump(&mut self) {}
}

/// Constructor for a fresh transport, invoked once per connect cycle.
pub type TransportFactory = Box<dyn Fn() -> Box<dyn Transport>>;
