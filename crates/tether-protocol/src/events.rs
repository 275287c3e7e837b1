//! Protocol constants for tether.
//!
//! Wire-level event names, the reserved system topic, close codes, and
//! protocol defaults shared by the client and its transports.

use std::fmt;

/// Protocol version sent as the `vsn` query parameter.
pub const DEFAULT_VSN: &str = "2.0.0";

/// Default reply timeout for pushes, in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Default heartbeat interval, in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 30_000;

/// Topic reserved for connection-level traffic such as heartbeats.
pub const SYSTEM_TOPIC: &str = "phoenix";

/// Event name for heartbeat pushes on the system topic.
pub const HEARTBEAT_EVENT: &str = "heartbeat";

/// Default event carrying a full presence snapshot.
pub const PRESENCE_STATE_EVENT: &str = "presence_state";

/// Default event carrying an incremental presence diff.
pub const PRESENCE_DIFF_EVENT: &str = "presence_diff";

/// Normal close code for caller-initiated disconnects.
pub const WS_CLOSE_NORMAL: u16 = 1000;

/// Application close code used to force a reconnect cycle, for example
/// after a missed heartbeat acknowledgment.
pub const WS_CLOSE_ABNORMAL: u16 = 4000;

/// Subprotocol prefix carrying the auth token during the handshake.
pub const AUTH_TOKEN_PREFIX: &str = "tether.bearer.";

/// Lifecycle events exchanged on every channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelEvent {
    /// Channel closed, locally or by the server.
    Close,
    /// Channel errored; a rejoin will be scheduled.
    Error,
    /// Join request for a topic.
    Join,
    /// Reply to a previously sent push.
    Reply,
    /// Leave request for a topic.
    Leave,
}

impl ChannelEvent {
    /// Get the wire name of the event.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ChannelEvent::Close => "phx_close",
            ChannelEvent::Error => "phx_error",
            ChannelEvent::Join => "phx_join",
            ChannelEvent::Reply => "phx_reply",
            ChannelEvent::Leave => "phx_leave",
        }
    }

    /// Check whether an event name is one of the channel lifecycle events.
    #[must_use]
    pub fn is_lifecycle(event: &str) -> bool {
        ChannelEvent::try_from(event).is_ok()
    }
}

impl fmt::Display for ChannelEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for ChannelEvent {
    type Error = &'static str;

    fn try_from(value: &str) -> Result<Self, &'static str> {
        match value {
            "phx_close" => Ok(ChannelEvent::Close),
            "phx_error" => Ok(ChannelEvent::Error),
            "phx_join" => Ok(ChannelEvent::Join),
            "phx_reply" => Ok(ChannelEvent::Reply),
            "phx_leave" => Ok(ChannelEvent::Leave),
            _ => Err("not a lifecycle event"),
        }
    }
}

/// Derive the reply event name bound for a given push ref.
///
/// Replies are routed to the push that owns the ref via this per-ref
/// subscription name rather than through generic event bindings.
#[must_use]
pub fn reply_event_name(event_ref: &str) -> String {
    format!("chan_reply_{event_ref}")
}
