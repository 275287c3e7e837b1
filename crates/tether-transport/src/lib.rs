//! # tether-transport
//!
//! Transport capability layer for the tether realtime client.
//!
//! The socket consumes any carrier implementing the [`Transport`] trait:
//!
//! - **WebSocket** (`websocket` feature) — tokio-tungstenite adapter
//! - **Mock** — scriptable in-process transport for tests and embeddings
//!
//! The [`SessionStore`] capability persists transport fallback history
//! across reconnects within one session.
//!
//! ```rust
//! use tether_transport::mock::MockTransport;
//!
//! let (factory, handle) = MockTransport::factory();
//! let _transport = factory();
//! handle.set_auto_open(true);
//! ```

pub mod mock;
pub mod store;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use store::{MemoryStore, SessionStore};
pub use traits::{
    CloseEvent, ConnectInfo, Transport, TransportCallbacks, TransportError, TransportFactory,
    TransportState,
};

#[cfg(feature = "websocket")]
pub use websocket::WebSocketTransport;
