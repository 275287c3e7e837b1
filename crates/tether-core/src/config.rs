//! Client configuration.
//!
//! Every knob is an explicit construction-time option; defaults are pure
//! functions rather than shared mutable globals, so two sockets never
//! observe each other's configuration.

use std::fmt;
use std::rc::Rc;

use serde_json::{json, Value};

use tether_protocol::events::{DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_TIMEOUT_MS, DEFAULT_VSN};
use tether_protocol::{Message, ProtocolError, WireFrame};
use tether_transport::{SessionStore, TransportFactory};

/// Connection or channel params: a static object, or a producer invoked on
/// every (re)connect/(re)join so fresh values such as short-lived tokens
/// are picked up automatically.
pub enum Params {
    /// A fixed JSON object.
    Static(Value),
    /// A producer returning the params for the current attempt.
    Dynamic(Box<dyn Fn() -> Value>),
}

impl Params {
    /// Resolve the params for the current attempt.
    #[must_use]
    pub fn resolve(&self) -> Value {
        match self {
            Params::Static(value) => value.clone(),
            Params::Dynamic(producer) => producer(),
        }
    }
}

impl Default for Params {
    fn default() -> Self {
        Params::Static(json!({}))
    }
}

impl fmt::Debug for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Params::Static(value) => f.debug_tuple("Static").field(value).finish(),
            Params::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

impl From<Value> for Params {
    fn from(value: Value) -> Self {
        Params::Static(value)
    }
}

/// User-facing log hook: `(kind, message, data)`.
pub type Logger = Box<dyn Fn(&str, &str, &dyn fmt::Debug)>;

/// Encoder override for outbound messages.
pub type EncodeFn = Box<dyn Fn(&Message) -> Result<WireFrame, ProtocolError>>;

/// Decoder override for inbound frames.
pub type DecodeFn = Box<dyn Fn(&WireFrame) -> Result<Message, ProtocolError>>;

/// Reconnect backoff used when none is configured: steps quickly through
/// sub-second retries before settling at five seconds.
#[must_use]
pub fn default_reconnect_after_ms(tries: u32) -> u64 {
    const STEPS: [u64; 9] = [10, 50, 100, 150, 200, 250, 500, 1000, 2000];
    STEPS
        .get(tries.saturating_sub(1) as usize)
        .copied()
        .unwrap_or(5000)
}

/// Rejoin backoff used when none is configured.
#[must_use]
pub fn default_rejoin_after_ms(tries: u32) -> u64 {
    const STEPS: [u64; 3] = [1000, 2000, 5000];
    STEPS
        .get(tries.saturating_sub(1) as usize)
        .copied()
        .unwrap_or(10_000)
}

/// Socket construction options.
pub struct SocketOptions {
    /// Primary transport factory. Required before `connect`.
    pub transport: Option<TransportFactory>,
    /// Fallback transport factory raced against the primary when
    /// `long_poll_fallback_ms` is set.
    pub fallback_transport: Option<TransportFactory>,
    /// Health-check threshold in milliseconds after which the fallback
    /// transport replaces a primary that has not opened.
    pub long_poll_fallback_ms: Option<u64>,
    /// Default reply timeout for pushes, in milliseconds.
    pub timeout_ms: u64,
    /// Heartbeat interval, in milliseconds.
    pub heartbeat_interval_ms: u64,
    /// Reconnect backoff keyed by attempt count.
    pub reconnect_after_ms: Box<dyn Fn(u32) -> u64>,
    /// Rejoin backoff keyed by attempt count, shared with every channel.
    pub rejoin_after_ms: Rc<dyn Fn(u32) -> u64>,
    /// Optional user log hook.
    pub logger: Option<Logger>,
    /// Connection params appended to the endpoint URL.
    pub params: Params,
    /// Bearer token conveyed to the transport at connect time.
    pub auth_token: Option<String>,
    /// Protocol version sent as the `vsn` query parameter.
    pub vsn: String,
    /// Encoder override; defaults to the envelope serializer.
    pub encode: Option<EncodeFn>,
    /// Decoder override; defaults to the envelope serializer.
    pub decode: Option<DecodeFn>,
    /// Session store override; defaults to an in-memory store.
    pub session_store: Option<Box<dyn SessionStore>>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            transport: None,
            fallback_transport: None,
            long_poll_fallback_ms: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            reconnect_after_ms: Box::new(default_reconnect_after_ms),
            rejoin_after_ms: Rc::new(default_rejoin_after_ms),
            logger: None,
            params: Params::default(),
            auth_token: None,
            vsn: DEFAULT_VSN.to_string(),
            encode: None,
            decode: None,
            session_store: None,
        }
    }
}

impl fmt::Debug for SocketOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketOptions")
            .field("timeout_ms", &self.timeout_ms)
            .field("heartbeat_interval_ms", &self.heartbeat_interval_ms)
            .field("long_poll_fallback_ms", &self.long_poll_fallback_ms)
            .field("vsn", &self.vsn)
            .field("params", &self.params)
            .field("has_auth_token", &self.auth_token.is_some())
            .finish_non_exhaustive()
    }
}
