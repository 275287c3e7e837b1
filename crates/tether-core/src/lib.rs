//! # tether-core
//!
//! Socket, channel, push, and presence state machines for the tether
//! realtime client.
//!
//! One [`Socket`] owns a transport connection and multiplexes any number
//! of topic [`Channel`]s over it, each with its own join lifecycle,
//! request/reply correlation ([`Push`]), automatic rejoin with backoff,
//! and optional [`Presence`] tracking.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐     ┌──────────┐     ┌──────────┐
//! │ Transport │────▶│  Socket  │────▶│ Channel  │──▶ Push / Presence
//! └───────────┘     └──────────┘     └──────────┘
//!                         │
//!                         ▼
//!                   ┌───────────┐
//!                   │ Scheduler │  (heartbeat, backoff, timeouts)
//!                   └───────────┘
//! ```
//!
//! The core is single-threaded and callback-driven: the embedding drives
//! it by calling [`Socket::poll`] from its event loop, and exactly one
//! inbound frame is processed at a time.
//!
//! ## Example
//!
//! ```rust
//! use tether_core::{Params, Socket, SocketOptions};
//! use tether_transport::mock::MockTransport;
//!
//! let (factory, handle) = MockTransport::factory();
//! handle.set_auto_open(true);
//!
//! let socket = Socket::new(
//!     "ws://example.com/socket",
//!     SocketOptions {
//!         transport: Some(factory),
//!         ..SocketOptions::default()
//!     },
//! );
//! socket.connect();
//! socket.poll(0);
//!
//! let room = socket.channel("room:1", Params::default());
//! room.on("new_msg", |payload, _ref, _join_ref| {
//!     println!("got {payload:?}");
//! });
//! room.join(None)
//!     .receive("ok", |_resp| println!("joined"))
//!     .receive("error", |resp| println!("join refused: {resp:?}"));
//! socket.poll(0);
//! assert!(room.is_joining());
//! ```

pub mod channel;
pub mod config;
pub mod presence;
pub mod push;
pub mod socket;
pub mod timer;

#[cfg(test)]
pub(crate) mod test_support;

pub use channel::{Channel, ChannelState};
pub use config::{
    default_reconnect_after_ms, default_rejoin_after_ms, Params, SocketOptions,
};
pub use presence::{Meta, Presence, PresenceDiff, PresenceEntry, PresenceOptions, PresenceState};
pub use push::Push;
pub use socket::Socket;
pub use timer::{RetryTimer, Scheduler, TaskId};
