//! Connection manager and multiplexer.
//!
//! One socket owns the transport and carries any number of topic
//! channels: it assigns monotonic message refs, routes inbound frames to
//! channels by topic and join instance, runs the heartbeat, buffers
//! outbound sends while disconnected, reconnects with backoff, and can
//! promote from a primary transport to a fallback when the primary fails
//! its health check.
//!
//! The embedding drives the socket by calling [`Socket::poll`] (or
//! [`Socket::poll_now`]) from its event loop: each poll pumps the
//! transport, dispatches queued transport events one at a time, and
//! advances the shared scheduler.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, trace, warn};

use tether_protocol::events::{ChannelEvent, WS_CLOSE_ABNORMAL, WS_CLOSE_NORMAL};
use tether_protocol::{serializer, Message, WireFrame};
use tether_transport::{
    CloseEvent, ConnectInfo, MemoryStore, SessionStore, Transport, TransportCallbacks,
    TransportError, TransportFactory, TransportState,
};

use crate::channel::Channel;
use crate::config::{DecodeFn, EncodeFn, Logger, Params, SocketOptions};
use crate::timer::{RetryTimer, Scheduler, TaskId};

const TEARDOWN_TRIES: u32 = 5;
const TEARDOWN_POLL_MS: u64 = 150;

enum TransportEvent {
    Open,
    Message(WireFrame),
    Error(TransportError),
    Close(CloseEvent),
}

#[derive(Default)]
struct StateChangeCallbacks {
    open: Vec<(String, Rc<dyn Fn()>)>,
    close: Vec<(String, Rc<dyn Fn(&CloseEvent)>)>,
    error: Vec<(String, Rc<dyn Fn(&TransportError)>)>,
    message: Vec<(String, Rc<dyn Fn(&Message)>)>,
}

pub(crate) struct SocketInner {
    endpoint: String,
    vsn: String,
    timeout_ms: u64,
    heartbeat_interval_ms: u64,
    rejoin_after_ms: Rc<dyn Fn(u32) -> u64>,
    logger: Option<Logger>,
    params: Params,
    auth_token: Option<String>,
    encode: EncodeFn,
    decode: DecodeFn,
    transport_factory: Option<TransportFactory>,
    fallback_factory: Option<TransportFactory>,
    long_poll_fallback_ms: Option<u64>,
    session_store: Box<dyn SessionStore>,
    scheduler: Scheduler,
    epoch: Instant,
    conn: RefCell<Option<Box<dyn Transport>>>,
    channels: RefCell<Vec<Channel>>,
    send_buffer: RefCell<Vec<Message>>,
    ref_counter: Cell<u32>,
    pending_heartbeat_ref: RefCell<Option<String>>,
    heartbeat_task: Cell<Option<TaskId>>,
    reconnect_timer: RetryTimer,
    established_connections: Cell<u32>,
    close_was_clean: Cell<bool>,
    disconnecting: Cell<bool>,
    connect_clock: Cell<u64>,
    primary_passed_health_check: Cell<bool>,
    using_fallback: Cell<bool>,
    fallback_task: Cell<Option<TaskId>>,
    page_hidden: Cell<bool>,
    callbacks: RefCell<StateChangeCallbacks>,
    transport_events: RefCell<VecDeque<(u64, TransportEvent)>>,
}

/// The connection manager.
///
/// Handles are cheap clones sharing the same state. Constructed once per
/// endpoint; `connect`/`disconnect` toggle the underlying transport.
pub struct Socket {
    pub(crate) inner: Rc<SocketInner>,
}

impl Clone for Socket {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl Socket {
    /// Create a socket for an endpoint, e.g. `"ws://example.com/socket"`.
    #[must_use]
    pub fn new(endpoint: impl Into<String>, options: SocketOptions) -> Self {
        let SocketOptions {
            transport,
            fallback_transport,
            long_poll_fallback_ms,
            timeout_ms,
            heartbeat_interval_ms,
            reconnect_after_ms,
            rejoin_after_ms,
            logger,
            params,
            auth_token,
            vsn,
            encode,
            decode,
            session_store,
        } = options;
        let endpoint = endpoint.into();
        let scheduler = Scheduler::new();

        let inner = Rc::new_cyclic(|weak: &Weak<SocketInner>| {
            let timer_weak = weak.clone();
            let reconnect_timer = RetryTimer::new(
                scheduler.clone(),
                move || {
                    if let Some(inner) = timer_weak.upgrade() {
                        let socket = Socket { inner };
                        debug!(endpoint = %socket.inner.endpoint, "reconnecting");
                        let weak = Rc::downgrade(&socket.inner);
                        let reconnect: Rc<dyn Fn()> = Rc::new(move || {
                            if let Some(inner) = weak.upgrade() {
                                Socket { inner }.connect();
                            }
                        });
                        socket.teardown(Some(reconnect), None, None);
                    }
                },
                reconnect_after_ms,
            );

            SocketInner {
                endpoint,
                vsn,
                timeout_ms,
                heartbeat_interval_ms,
                rejoin_after_ms,
                logger,
                params,
                auth_token,
                encode: encode.unwrap_or_else(|| Box::new(serializer::encode)),
                decode: decode.unwrap_or_else(|| Box::new(serializer::decode)),
                transport_factory: transport,
                fallback_factory: fallback_transport,
                long_poll_fallback_ms,
                session_store: session_store.unwrap_or_else(|| Box::new(MemoryStore::new())),
                scheduler,
                epoch: Instant::now(),
                conn: RefCell::new(None),
                channels: RefCell::new(Vec::new()),
                send_buffer: RefCell::new(Vec::new()),
                ref_counter: Cell::new(0),
                pending_heartbeat_ref: RefCell::new(None),
                heartbeat_task: Cell::new(None),
                reconnect_timer,
                established_connections: Cell::new(0),
                close_was_clean: Cell::new(false),
                disconnecting: Cell::new(false),
                connect_clock: Cell::new(0),
                primary_passed_health_check: Cell::new(false),
                using_fallback: Cell::new(false),
                fallback_task: Cell::new(None),
                page_hidden: Cell::new(false),
                callbacks: RefCell::new(StateChangeCallbacks::default()),
                transport_events: RefCell::new(VecDeque::new()),
            }
        });
        Socket { inner }
    }

    pub(crate) fn from_inner(inner: Rc<SocketInner>) -> Self {
        Socket { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<SocketInner> {
        Rc::downgrade(&self.inner)
    }

    pub(crate) fn scheduler(&self) -> Scheduler {
        self.inner.scheduler.clone()
    }

    pub(crate) fn timeout_ms(&self) -> u64 {
        self.inner.timeout_ms
    }

    pub(crate) fn rejoin_after_ms(&self) -> Rc<dyn Fn(u32) -> u64> {
        Rc::clone(&self.inner.rejoin_after_ms)
    }

    /// Current virtual time of the socket's scheduler, in milliseconds.
    #[must_use]
    pub fn now_ms(&self) -> u64 {
        self.inner.scheduler.now_ms()
    }

    /// Drive the socket: pump the transport, dispatch queued transport
    /// events in order, then run scheduled work due at `now_ms`.
    pub fn poll(&self, now_ms: u64) {
        self.pump_transport();
        self.flush_transport_events();
        self.inner.scheduler.advance_to(now_ms);
        self.pump_transport();
        self.flush_transport_events();
    }

    /// [`Socket::poll`] with wall-clock time since socket construction.
    pub fn poll_now(&self) {
        let now_ms = self.inner.epoch.elapsed().as_millis() as u64;
        self.poll(now_ms);
    }

    /// Connect the configured transport. A no-op while a transport is
    /// active.
    ///
    /// # Panics
    ///
    /// Panics if no transport factory was configured.
    pub fn connect(&self) {
        if self.inner.conn.borrow().is_some() {
            return;
        }
        let race = self.inner.long_poll_fallback_ms.is_some()
            && self.inner.fallback_factory.is_some()
            && !self.inner.using_fallback.get();
        if race {
            self.connect_with_fallback();
        } else {
            self.transport_connect();
        }
    }

    /// Disconnect the socket, draining buffered writes before closing.
    ///
    /// `callback` runs once the send buffer is drained and the transport
    /// reached closed (both bounded by a small retry budget).
    pub fn disconnect(
        &self,
        callback: Option<Box<dyn FnOnce()>>,
        code: Option<u16>,
        reason: Option<&str>,
    ) {
        debug!(endpoint = %self.inner.endpoint, "disconnecting");
        self.inner.close_was_clean.set(true);
        self.inner.disconnecting.set(true);
        self.inner.reconnect_timer.reset();
        self.cancel_fallback_task();
        self.clear_heartbeat();

        let weak = Rc::downgrade(&self.inner);
        let callback_cell = Cell::new(callback);
        let done: Rc<dyn Fn()> = Rc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.disconnecting.set(false);
            }
            if let Some(callback) = callback_cell.take() {
                callback();
            }
        });
        self.teardown(Some(done), code, reason.map(str::to_string));
    }

    /// Current connection state as mirrored from the transport.
    #[must_use]
    pub fn connection_state(&self) -> TransportState {
        self.inner
            .conn
            .borrow()
            .as_ref()
            .map_or(TransportState::Closed, |conn| conn.ready_state())
    }

    /// Whether the transport is open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection_state() == TransportState::Open
    }

    /// Connections successfully established over this socket's lifetime.
    #[must_use]
    pub fn established_connections(&self) -> u32 {
        self.inner.established_connections.get()
    }

    /// The fully qualified endpoint URL with `vsn` and params appended.
    #[must_use]
    pub fn end_point_url(&self) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        query.append_pair("vsn", &self.inner.vsn);
        if let Value::Object(map) = self.inner.params.resolve() {
            for (key, value) in &map {
                let rendered;
                let value = match value {
                    Value::String(text) => text.as_str(),
                    other => {
                        rendered = other.to_string();
                        rendered.as_str()
                    }
                };
                query.append_pair(key, value);
            }
        }
        let separator = if self.inner.endpoint.contains('?') { '&' } else { '?' };
        format!("{}{}{}", self.inner.endpoint, separator, query.finish())
    }

    /// Return the next message ref, wrapping to `"0"` on overflow.
    /// Refs are per-socket and unique only while in flight.
    #[must_use]
    pub fn make_ref(&self) -> String {
        let next = self.inner.ref_counter.get().wrapping_add(1);
        self.inner.ref_counter.set(next);
        next.to_string()
    }

    /// Register a callback for connection open events. Returns a ref for
    /// [`Socket::off`].
    pub fn on_open(&self, callback: impl Fn() + 'static) -> String {
        let hook_ref = self.make_ref();
        self.inner
            .callbacks
            .borrow_mut()
            .open
            .push((hook_ref.clone(), Rc::new(callback)));
        hook_ref
    }

    /// Register a callback for connection close events.
    pub fn on_close(&self, callback: impl Fn(&CloseEvent) + 'static) -> String {
        let hook_ref = self.make_ref();
        self.inner
            .callbacks
            .borrow_mut()
            .close
            .push((hook_ref.clone(), Rc::new(callback)));
        hook_ref
    }

    /// Register a callback for transport errors.
    pub fn on_error(&self, callback: impl Fn(&TransportError) + 'static) -> String {
        let hook_ref = self.make_ref();
        self.inner
            .callbacks
            .borrow_mut()
            .error
            .push((hook_ref.clone(), Rc::new(callback)));
        hook_ref
    }

    /// Register a callback for every decoded inbound message.
    pub fn on_message(&self, callback: impl Fn(&Message) + 'static) -> String {
        let hook_ref = self.make_ref();
        self.inner
            .callbacks
            .borrow_mut()
            .message
            .push((hook_ref.clone(), Rc::new(callback)));
        hook_ref
    }

    /// Remove `on_open`/`on_close`/`on_error`/`on_message` registrations
    /// by the refs they returned.
    pub fn off(&self, refs: &[String]) {
        let mut callbacks = self.inner.callbacks.borrow_mut();
        callbacks.open.retain(|(r, _)| !refs.contains(r));
        callbacks.close.retain(|(r, _)| !refs.contains(r));
        callbacks.error.retain(|(r, _)| !refs.contains(r));
        callbacks.message.retain(|(r, _)| !refs.contains(r));
    }

    /// Initiate or reuse a channel for a topic.
    ///
    /// An existing tracked channel that has not begun leaving is returned
    /// as-is (its original params are kept); otherwise a new channel is
    /// constructed and tracked.
    pub fn channel(&self, topic: impl Into<String>, params: Params) -> Channel {
        let topic = topic.into();
        let existing = self
            .inner
            .channels
            .borrow()
            .iter()
            .find(|channel| channel.topic() == topic && !channel.is_leaving())
            .cloned();
        if let Some(channel) = existing {
            debug!(%topic, "reusing tracked channel");
            return channel;
        }
        let channel = Channel::new(topic, params, self);
        self.inner.channels.borrow_mut().push(channel.clone());
        channel
    }

    /// Queue an envelope: sent immediately while connected, buffered
    /// until the next open otherwise.
    pub fn push(&self, message: Message) {
        if self.has_logger() {
            self.log(
                "push",
                &format!(
                    "{} {} ({}, {})",
                    message.topic,
                    message.event,
                    message.join_ref.as_deref().unwrap_or("-"),
                    message.event_ref.as_deref().unwrap_or("-")
                ),
                &message.payload,
            );
        }
        if self.is_connected() {
            self.send_message(&message);
        } else {
            self.inner.send_buffer.borrow_mut().push(message);
        }
    }

    /// Ping the server, invoking `callback` with the round-trip time in
    /// milliseconds. Returns `false` when not connected.
    pub fn ping(&self, callback: impl Fn(u64) + 'static) -> bool {
        if !self.is_connected() {
            return false;
        }
        let event_ref = self.make_ref();
        let started_at = self.inner.scheduler.now_ms();
        self.push(Message::heartbeat(event_ref.clone()));

        let weak = Rc::downgrade(&self.inner);
        let hook_ref: Rc<RefCell<String>> = Rc::new(RefCell::new(String::new()));
        let hook_ref_probe = Rc::clone(&hook_ref);
        let registered = self.on_message(move |message| {
            if message.event_ref.as_deref() == Some(event_ref.as_str()) {
                if let Some(inner) = weak.upgrade() {
                    let socket = Socket { inner };
                    socket.off(&[hook_ref_probe.borrow().clone()]);
                    callback(socket.inner.scheduler.now_ms().saturating_sub(started_at));
                }
            }
        });
        *hook_ref.borrow_mut() = registered;
        true
    }

    /// Whether a logger hook is configured.
    #[must_use]
    pub fn has_logger(&self) -> bool {
        self.inner.logger.is_some()
    }

    /// Forward to the configured logger hook, if any.
    pub(crate) fn log(&self, kind: &str, msg: &str, data: &dyn fmt::Debug) {
        if let Some(logger) = &self.inner.logger {
            logger(kind, msg, data);
        }
    }

    /// Read a value from the session store.
    #[must_use]
    pub fn get_session(&self, key: &str) -> Option<String> {
        self.inner.session_store.get_item(key)
    }

    /// Write a value to the session store.
    pub fn store_session(&self, key: &str, value: &str) {
        self.inner.session_store.set_item(key, value);
    }

    /// Update the environment visibility flag. On the transition back to
    /// visible with a dead connection, reconnects immediately instead of
    /// waiting out the backoff.
    pub fn set_page_hidden(&self, hidden: bool) {
        let was_hidden = self.inner.page_hidden.replace(hidden);
        if was_hidden
            && !hidden
            && !self.is_connected()
            && !self.inner.disconnecting.get()
            && !self.inner.close_was_clean.get()
            && self.inner.conn.borrow().is_some()
        {
            debug!("page visible with dead connection; reconnecting now");
            self.inner.reconnect_timer.reset();
            let weak = Rc::downgrade(&self.inner);
            let reconnect: Rc<dyn Fn()> = Rc::new(move || {
                if let Some(inner) = weak.upgrade() {
                    Socket { inner }.connect();
                }
            });
            self.teardown(Some(reconnect), None, None);
        }
    }

    // ---- connect / fallback ------------------------------------------------

    fn transport_connect(&self) {
        self.inner.close_was_clean.set(false);
        let use_fallback = self.inner.using_fallback.get();
        let mut transport = {
            let factory = if use_fallback {
                self.inner.fallback_factory.as_ref()
            } else {
                self.inner.transport_factory.as_ref()
            };
            let Some(factory) = factory else {
                panic!("no transport factory configured; set SocketOptions::transport");
            };
            factory()
        };
        let info = ConnectInfo {
            url: self.end_point_url(),
            auth_token: self.inner.auth_token.clone(),
        };
        debug!(url = %info.url, fallback = use_fallback, "connecting transport");
        transport.connect(info, self.transport_callbacks());
        *self.inner.conn.borrow_mut() = Some(transport);
    }

    fn connect_with_fallback(&self) {
        let threshold_ms = self.inner.long_poll_fallback_ms.unwrap_or_default();
        if self.get_session(&self.fallback_session_key()).is_some() {
            self.log("transport", "using memorized fallback transport", &"");
            self.swap_to_fallback();
            return;
        }
        self.cancel_fallback_task();
        let weak = Rc::downgrade(&self.inner);
        let task = self.inner.scheduler.schedule(threshold_ms, move || {
            if let Some(inner) = weak.upgrade() {
                let socket = Socket { inner };
                socket.inner.fallback_task.set(None);
                if !socket.inner.primary_passed_health_check.get() {
                    warn!("primary transport failed its health check; falling back");
                    socket.log("transport", "falling back after health check timeout", &"");
                    socket.swap_to_fallback();
                }
            }
        });
        self.inner.fallback_task.set(Some(task));
        self.transport_connect();
    }

    fn swap_to_fallback(&self) {
        self.cancel_fallback_task();
        self.inner.using_fallback.set(true);
        // the primary's remaining events are stale after this bump
        self.inner
            .connect_clock
            .set(self.inner.connect_clock.get() + 1);
        if let Some(mut conn) = self.inner.conn.borrow_mut().take() {
            conn.close(WS_CLOSE_NORMAL, "fallback");
        }
        self.transport_connect();
    }

    fn fallback_session_key(&self) -> String {
        format!("tether:fallback:{}", self.inner.endpoint)
    }

    fn fallback_race_pending(&self) -> bool {
        self.inner.fallback_task.get().is_some()
            && !self.inner.primary_passed_health_check.get()
    }

    fn cancel_fallback_task(&self) {
        if let Some(task) = self.inner.fallback_task.take() {
            self.inner.scheduler.cancel(task);
        }
    }

    // ---- transport event plumbing -----------------------------------------

    fn transport_callbacks(&self) -> TransportCallbacks {
        let clock = self.inner.connect_clock.get();
        let enqueue = |weak: Weak<SocketInner>| {
            move |event: TransportEvent| {
                if let Some(inner) = weak.upgrade() {
                    inner.transport_events.borrow_mut().push_back((clock, event));
                }
            }
        };
        let on_open = enqueue(Rc::downgrade(&self.inner));
        let on_message = enqueue(Rc::downgrade(&self.inner));
        let on_error = enqueue(Rc::downgrade(&self.inner));
        let on_close = enqueue(Rc::downgrade(&self.inner));
        TransportCallbacks {
            on_open: Box::new(move || on_open(TransportEvent::Open)),
            on_message: Box::new(move |frame| on_message(TransportEvent::Message(frame))),
            on_error: Box::new(move |error| on_error(TransportEvent::Error(error))),
            on_close: Box::new(move |event| on_close(TransportEvent::Close(event))),
        }
    }

    fn pump_transport(&self) {
        if let Some(conn) = self.inner.conn.borrow_mut().as_mut() {
            conn.pump();
        }
    }

    fn flush_transport_events(&self) {
        loop {
            let next = self.inner.transport_events.borrow_mut().pop_front();
            let Some((clock, event)) = next else { break };
            if clock != self.inner.connect_clock.get() {
                trace!("dropping transport event from a previous connect cycle");
                continue;
            }
            match event {
                TransportEvent::Open => self.on_conn_open(),
                TransportEvent::Message(frame) => self.on_conn_message(&frame),
                TransportEvent::Error(error) => self.on_conn_error(&error),
                TransportEvent::Close(close) => self.on_conn_close(&close),
            }
        }
    }

    fn on_conn_open(&self) {
        debug!(endpoint = %self.inner.endpoint, "transport connected");
        self.log("transport", "connected", &self.inner.endpoint);
        self.inner
            .established_connections
            .set(self.inner.established_connections.get() + 1);
        self.cancel_fallback_task();
        if self.inner.using_fallback.get() {
            if !self.inner.primary_passed_health_check.get() {
                self.store_session(&self.fallback_session_key(), "true");
            }
        } else {
            self.inner.primary_passed_health_check.set(true);
        }
        self.flush_send_buffer();
        self.inner.reconnect_timer.reset();
        self.reset_heartbeat();

        let callbacks: Vec<Rc<dyn Fn()>> = self
            .inner
            .callbacks
            .borrow()
            .open
            .iter()
            .map(|(_, callback)| Rc::clone(callback))
            .collect();
        for callback in callbacks {
            callback();
        }
    }

    fn on_conn_message(&self, frame: &WireFrame) {
        let message = match (self.inner.decode)(frame) {
            Ok(message) => message,
            Err(error) => {
                warn!(%error, "dropping undecodable frame");
                self.log("receive", "decode failed", &error);
                return;
            }
        };

        if let Some(event_ref) = &message.event_ref {
            let acked = self
                .inner
                .pending_heartbeat_ref
                .borrow()
                .as_deref()
                .is_some_and(|pending| pending == event_ref.as_str());
            if acked {
                *self.inner.pending_heartbeat_ref.borrow_mut() = None;
                trace!("heartbeat acknowledged");
            }
        }

        if self.has_logger() {
            self.log(
                "receive",
                &format!("{} {}", message.topic, message.event),
                &message.payload,
            );
        }

        let members: Vec<Channel> = self
            .inner
            .channels
            .borrow()
            .iter()
            .filter(|channel| channel.is_member(&message))
            .cloned()
            .collect();
        for channel in members {
            channel.trigger(
                &message.event,
                Some(&message.payload),
                message.event_ref.as_deref(),
                message.join_ref.as_deref(),
            );
        }

        let callbacks: Vec<Rc<dyn Fn(&Message)>> = self
            .inner
            .callbacks
            .borrow()
            .message
            .iter()
            .map(|(_, callback)| Rc::clone(callback))
            .collect();
        for callback in callbacks {
            callback(&message);
        }
    }

    fn on_conn_error(&self, error: &TransportError) {
        warn!(%error, "transport error");
        self.log("transport", "error", error);

        let callbacks: Vec<Rc<dyn Fn(&TransportError)>> = self
            .inner
            .callbacks
            .borrow()
            .error
            .iter()
            .map(|(_, callback)| Rc::clone(callback))
            .collect();
        for callback in callbacks {
            callback(error);
        }

        if self.fallback_race_pending() {
            self.swap_to_fallback();
            return;
        }
        self.trigger_chan_error();
    }

    fn on_conn_close(&self, event: &CloseEvent) {
        debug!(code = event.code, reason = %event.reason, "transport closed");
        self.log("transport", "close", event);

        if self.fallback_race_pending() {
            self.clear_heartbeat();
            self.run_close_callbacks(event);
            self.swap_to_fallback();
            return;
        }

        self.trigger_chan_error();
        self.clear_heartbeat();
        if !self.inner.close_was_clean.get() {
            self.inner.reconnect_timer.schedule_timeout();
        }
        self.run_close_callbacks(event);
    }

    fn run_close_callbacks(&self, event: &CloseEvent) {
        let callbacks: Vec<Rc<dyn Fn(&CloseEvent)>> = self
            .inner
            .callbacks
            .borrow()
            .close
            .iter()
            .map(|(_, callback)| Rc::clone(callback))
            .collect();
        for callback in callbacks {
            callback(event);
        }
    }

    fn trigger_chan_error(&self) {
        let channels: Vec<Channel> = self.inner.channels.borrow().iter().cloned().collect();
        for channel in channels {
            if !(channel.is_errored() || channel.is_leaving() || channel.is_closed()) {
                channel.trigger(ChannelEvent::Error.as_str(), None, None, None);
            }
        }
    }

    // ---- heartbeat ---------------------------------------------------------

    fn reset_heartbeat(&self) {
        let skip = self
            .inner
            .conn
            .borrow()
            .as_ref()
            .is_some_and(|conn| conn.skip_heartbeat());
        if skip {
            return;
        }
        *self.inner.pending_heartbeat_ref.borrow_mut() = None;
        self.clear_heartbeat();
        self.schedule_heartbeat();
    }

    fn clear_heartbeat(&self) {
        if let Some(task) = self.inner.heartbeat_task.take() {
            self.inner.scheduler.cancel(task);
        }
    }

    fn schedule_heartbeat(&self) {
        let weak = Rc::downgrade(&self.inner);
        let task = self
            .inner
            .scheduler
            .schedule(self.inner.heartbeat_interval_ms, move || {
                if let Some(inner) = weak.upgrade() {
                    let socket = Socket { inner };
                    socket.inner.heartbeat_task.set(None);
                    socket.send_heartbeat();
                }
            });
        self.inner.heartbeat_task.set(Some(task));
    }

    fn send_heartbeat(&self) {
        if !self.is_connected() {
            return;
        }
        if self.inner.pending_heartbeat_ref.borrow().is_some() {
            // the previous heartbeat was never acked; the connection is
            // stale, bounded at roughly two heartbeat intervals
            *self.inner.pending_heartbeat_ref.borrow_mut() = None;
            warn!("heartbeat unacknowledged; closing transport to reconnect");
            self.log(
                "transport",
                "heartbeat timeout. Attempting to re-establish connection",
                &"",
            );
            self.abnormal_close("heartbeat timeout");
            return;
        }
        let event_ref = self.make_ref();
        *self.inner.pending_heartbeat_ref.borrow_mut() = Some(event_ref.clone());
        self.push(Message::heartbeat(event_ref));
        self.schedule_heartbeat();
    }

    fn abnormal_close(&self, reason: &str) {
        self.inner.close_was_clean.set(false);
        if let Some(conn) = self.inner.conn.borrow_mut().as_mut() {
            conn.close(WS_CLOSE_ABNORMAL, reason);
        }
    }

    // ---- outbound ----------------------------------------------------------

    fn send_message(&self, message: &Message) {
        match (self.inner.encode)(message) {
            Ok(frame) => {
                if let Some(conn) = self.inner.conn.borrow_mut().as_mut() {
                    conn.send(frame);
                }
            }
            Err(error) => {
                warn!(%error, "failed to encode outbound message");
                self.log("push", "encode failed", &error);
            }
        }
    }

    fn flush_send_buffer(&self) {
        if !self.is_connected() {
            return;
        }
        let buffered: Vec<Message> = self.inner.send_buffer.borrow_mut().drain(..).collect();
        for message in buffered {
            self.send_message(&message);
        }
    }

    // ---- channel registry --------------------------------------------------

    pub(crate) fn remove(&self, channel: &Channel) {
        let refs = channel.take_state_change_refs();
        self.off(&refs);
        self.inner
            .channels
            .borrow_mut()
            .retain(|tracked| !Rc::ptr_eq(&tracked.inner, &channel.inner));
    }

    /// Leave any other joined or joining channel on the topic before a
    /// new instance joins it, so two instances never share a topic.
    pub(crate) fn leave_open_topic(&self, topic: &str, joining: &Channel) {
        let duplicate = self
            .inner
            .channels
            .borrow()
            .iter()
            .find(|channel| {
                channel.topic() == topic
                    && (channel.is_joined() || channel.is_joining())
                    && !Rc::ptr_eq(&channel.inner, &joining.inner)
            })
            .cloned();
        if let Some(channel) = duplicate {
            debug!(%topic, "leaving duplicate topic");
            self.log("transport", &format!("leaving duplicate topic \"{topic}\""), &"");
            channel.leave(None);
        }
    }

    // ---- teardown ----------------------------------------------------------

    pub(crate) fn teardown(
        &self,
        callback: Option<Rc<dyn Fn()>>,
        code: Option<u16>,
        reason: Option<String>,
    ) {
        if self.inner.conn.borrow().is_none() {
            if let Some(callback) = callback {
                callback();
            }
            return;
        }

        let weak = Rc::downgrade(&self.inner);
        let close_and_wait: Rc<dyn Fn()> = Rc::new(move || {
            let Some(inner) = weak.upgrade() else { return };
            let socket = Socket { inner };
            if let Some(conn) = socket.inner.conn.borrow_mut().as_mut() {
                conn.close(code.unwrap_or(WS_CLOSE_NORMAL), reason.as_deref().unwrap_or(""));
            }
            let finish_weak = Rc::downgrade(&socket.inner);
            let callback = callback.clone();
            let finish: Rc<dyn Fn()> = Rc::new(move || {
                if let Some(inner) = finish_weak.upgrade() {
                    let socket = Socket { inner };
                    // deliver the close event before the transport and its
                    // remaining events are discarded
                    socket.pump_transport();
                    socket.flush_transport_events();
                    socket
                        .inner
                        .connect_clock
                        .set(socket.inner.connect_clock.get() + 1);
                    *socket.inner.conn.borrow_mut() = None;
                }
                if let Some(callback) = &callback {
                    callback();
                }
            });
            socket.wait_for_transport_closed(finish, 1);
        });
        self.wait_for_buffer_done(close_and_wait, 1);
    }

    fn wait_for_buffer_done(&self, on_done: Rc<dyn Fn()>, tries: u32) {
        let buffered = self
            .inner
            .conn
            .borrow()
            .as_ref()
            .map_or(0, |conn| conn.buffered_amount());
        if tries == TEARDOWN_TRIES || self.inner.conn.borrow().is_none() || buffered == 0 {
            on_done();
            return;
        }
        let weak = Rc::downgrade(&self.inner);
        self.inner
            .scheduler
            .schedule(TEARDOWN_POLL_MS * u64::from(tries), move || {
                if let Some(inner) = weak.upgrade() {
                    Socket { inner }.wait_for_buffer_done(on_done, tries + 1);
                }
            });
    }

    fn wait_for_transport_closed(&self, on_done: Rc<dyn Fn()>, tries: u32) {
        let closed = self
            .inner
            .conn
            .borrow()
            .as_ref()
            .map_or(true, |conn| conn.ready_state() == TransportState::Closed);
        if tries == TEARDOWN_TRIES || closed {
            on_done();
            return;
        }
        let weak = Rc::downgrade(&self.inner);
        self.inner
            .scheduler
            .schedule(TEARDOWN_POLL_MS * u64::from(tries), move || {
                if let Some(inner) = weak.upgrade() {
                    Socket { inner }.wait_for_transport_closed(on_done, tries + 1);
                }
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::Cell;
    use tether_protocol::Payload;
    use tether_transport::mock::MockTransport;

    use crate::config::Params;
    use crate::test_support::{
        connected_socket, joined_channel, poll, reply, sent_messages, socket_with_mock,
    };

    #[test]
    fn test_make_ref_increments_and_wraps_to_zero() {
        let (socket, _handle) = socket_with_mock();
        assert_eq!(socket.make_ref(), "1");
        assert_eq!(socket.make_ref(), "2");

        socket.inner.ref_counter.set(u32::MAX);
        assert_eq!(socket.make_ref(), "0");
        assert_eq!(socket.make_ref(), "1");
    }

    #[test]
    fn test_connect_opens_transport_once() {
        let (socket, handle) = socket_with_mock();
        assert!(!socket.is_connected());
        assert_eq!(socket.connection_state(), TransportState::Closed);

        socket.connect();
        socket.poll(0);
        assert!(socket.is_connected());
        assert_eq!(socket.established_connections(), 1);
        assert_eq!(handle.connects(), 1);

        // a second connect while a transport is active is a no-op
        socket.connect();
        assert_eq!(handle.connects(), 1);
    }

    #[test]
    fn test_end_point_url_appends_vsn_and_params() {
        let (factory, _handle) = MockTransport::factory();
        let socket = Socket::new(
            "ws://example.test/socket",
            SocketOptions {
                transport: Some(factory),
                params: Params::Static(json!({"user_id": "7", "fast": true})),
                ..SocketOptions::default()
            },
        );
        let url = socket.end_point_url();
        assert!(url.starts_with("ws://example.test/socket?vsn=2.0.0"));
        assert!(url.contains("user_id=7"));
        assert!(url.contains("fast=true"));
    }

    #[test]
    fn test_push_buffers_until_open_then_flushes_fifo() {
        let (socket, handle) = socket_with_mock();
        socket.push(Message::new("room:1", "one", Payload::Json(json!({"n": 1}))));
        socket.push(Message::new("room:1", "two", Payload::Json(json!({"n": 2}))));
        assert!(handle.sent().is_empty());

        socket.connect();
        socket.poll(0);
        let sent = sent_messages(&handle);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].event, "one");
        assert_eq!(sent[1].event, "two");
    }

    #[test]
    fn test_heartbeat_sent_and_acked() {
        let (socket, handle) = connected_socket();
        socket.poll(30_000);
        let sent = sent_messages(&handle);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, "phoenix");
        assert_eq!(sent[0].event, "heartbeat");
        let heartbeat_ref = sent[0].event_ref.clone().unwrap();

        // acked in time, so the next interval sends a fresh heartbeat
        reply(&handle, None, &heartbeat_ref, "phoenix", "ok", json!({}));
        socket.poll(60_000);
        assert_eq!(sent_messages(&handle).len(), 2);
        assert!(socket.is_connected());
        assert_eq!(handle.connects(), 1);
    }

    #[test]
    fn test_missed_heartbeat_forces_abnormal_close_and_reconnect() {
        let (socket, handle) = connected_socket();
        socket.poll(30_000); // heartbeat sent, never acked
        socket.poll(60_000); // next interval: connection considered dead
        assert_eq!(
            handle.closed_with().map(|(code, _)| code),
            Some(WS_CLOSE_ABNORMAL)
        );
        assert_eq!(handle.connects(), 1);

        // reconnect fires at the first backoff step
        socket.poll(60_010);
        assert_eq!(handle.connects(), 2);
        assert!(socket.is_connected());
        assert_eq!(socket.established_connections(), 2);
    }

    #[test]
    fn test_disconnect_is_clean_and_invokes_callback() {
        let (socket, handle) = connected_socket();
        let done = Rc::new(Cell::new(false));
        let done_probe = Rc::clone(&done);
        socket.disconnect(Some(Box::new(move || done_probe.set(true))), None, None);

        assert!(done.get());
        assert!(!socket.is_connected());
        assert_eq!(handle.closed_with().map(|(code, _)| code), Some(WS_CLOSE_NORMAL));

        // a clean disconnect never schedules a reconnect
        socket.poll(100_000);
        assert_eq!(handle.connects(), 1);
    }

    #[test]
    fn test_close_callbacks_fire_on_disconnect() {
        let (socket, _handle) = connected_socket();
        let seen = Rc::new(Cell::new(0u32));
        let seen_probe = Rc::clone(&seen);
        socket.on_close(move |event| {
            assert_eq!(event.code, WS_CLOSE_NORMAL);
            seen_probe.set(seen_probe.get() + 1);
        });
        socket.disconnect(None, None, None);
        assert_eq!(seen.get(), 1);
    }

    #[test]
    fn test_off_removes_state_hooks() {
        let (socket, _handle) = socket_with_mock();
        let opened = Rc::new(Cell::new(0u32));
        let opened_probe = Rc::clone(&opened);
        let open_ref = socket.on_open(move || opened_probe.set(opened_probe.get() + 1));
        socket.off(&[open_ref]);

        socket.connect();
        socket.poll(0);
        assert_eq!(opened.get(), 0);
    }

    #[test]
    fn test_transport_error_reaches_hooks_and_errors_channels() {
        let (socket, handle) = connected_socket();
        let channel = joined_channel(&socket, &handle, "room:1");
        let errors = Rc::new(Cell::new(0u32));
        let errors_probe = Rc::clone(&errors);
        socket.on_error(move |_error| errors_probe.set(errors_probe.get() + 1));

        handle.error("boom");
        poll(&socket);
        assert_eq!(errors.get(), 1);
        assert!(channel.is_errored());
    }

    #[test]
    fn test_ping_measures_round_trip() {
        let (socket, handle) = connected_socket();
        let rtt = Rc::new(Cell::new(None));
        let rtt_probe = Rc::clone(&rtt);
        assert!(socket.ping(move |ms| rtt_probe.set(Some(ms))));

        let sent = sent_messages(&handle);
        let ping_ref = sent.last().unwrap().event_ref.clone().unwrap();
        socket.poll(40);
        reply(&handle, None, &ping_ref, "phoenix", "ok", json!({}));
        socket.poll(40);
        assert_eq!(rtt.get(), Some(40));
    }

    #[test]
    fn test_ping_returns_false_while_disconnected() {
        let (socket, _handle) = socket_with_mock();
        assert!(!socket.ping(|_| {}));
    }

    #[test]
    fn test_decode_failure_is_dropped_not_fatal() {
        let (socket, handle) = connected_socket();
        handle.message_text("not json at all");
        handle.message_binary(vec![9u8, 0, 0]);
        poll(&socket);
        assert!(socket.is_connected());
    }

    #[test]
    fn test_fallback_promotion_after_threshold() {
        let (primary_factory, primary) = MockTransport::factory();
        let (fallback_factory, fallback) = MockTransport::factory();
        fallback.set_auto_open(true);
        let socket = Socket::new(
            "ws://example.test/socket",
            SocketOptions {
                transport: Some(primary_factory),
                fallback_transport: Some(fallback_factory),
                long_poll_fallback_ms: Some(2500),
                ..SocketOptions::default()
            },
        );
        socket.connect();
        socket.poll(0);
        assert_eq!(primary.connects(), 1);
        assert_eq!(fallback.connects(), 0);

        // primary never opens; the threshold promotes the fallback
        socket.poll(2500);
        assert_eq!(fallback.connects(), 1);
        assert!(socket.is_connected());
        assert_eq!(
            socket
                .get_session("tether:fallback:ws://example.test/socket")
                .as_deref(),
            Some("true")
        );
    }

    #[test]
    fn test_fallback_on_primary_error_before_health_check() {
        let (primary_factory, primary) = MockTransport::factory();
        let (fallback_factory, fallback) = MockTransport::factory();
        fallback.set_auto_open(true);
        let socket = Socket::new(
            "ws://example.test/socket",
            SocketOptions {
                transport: Some(primary_factory),
                fallback_transport: Some(fallback_factory),
                long_poll_fallback_ms: Some(2500),
                ..SocketOptions::default()
            },
        );
        socket.connect();
        primary.error("connection refused");
        socket.poll(0);
        assert_eq!(fallback.connects(), 1);
        assert!(socket.is_connected());
    }

    #[test]
    fn test_memorized_fallback_skips_race() {
        let (primary_factory, primary) = MockTransport::factory();
        let (fallback_factory, fallback) = MockTransport::factory();
        fallback.set_auto_open(true);
        let store = MemoryStore::new();
        store.set_item("tether:fallback:ws://example.test/socket", "true");
        let socket = Socket::new(
            "ws://example.test/socket",
            SocketOptions {
                transport: Some(primary_factory),
                fallback_transport: Some(fallback_factory),
                long_poll_fallback_ms: Some(2500),
                session_store: Some(Box::new(store)),
                ..SocketOptions::default()
            },
        );
        socket.connect();
        socket.poll(0);
        assert_eq!(primary.connects(), 0);
        assert_eq!(fallback.connects(), 1);
        assert!(socket.is_connected());
    }

    #[test]
    fn test_primary_not_replaced_after_health_check() {
        let (primary_factory, primary) = MockTransport::factory();
        primary.set_auto_open(true);
        let (fallback_factory, fallback) = MockTransport::factory();
        let socket = Socket::new(
            "ws://example.test/socket",
            SocketOptions {
                transport: Some(primary_factory),
                fallback_transport: Some(fallback_factory),
                long_poll_fallback_ms: Some(2500),
                ..SocketOptions::default()
            },
        );
        socket.connect();
        socket.poll(0);
        assert!(socket.is_connected());

        socket.poll(10_000);
        assert_eq!(primary.connects(), 1);
        assert_eq!(fallback.connects(), 0);
    }

    #[test]
    fn test_page_visibility_triggers_immediate_reconnect() {
        let (socket, handle) = connected_socket();
        socket.set_page_hidden(true);
        handle.close(WS_CLOSE_ABNORMAL, "dropped");
        poll(&socket);
        assert!(!socket.is_connected());
        assert_eq!(handle.connects(), 1);

        // back to visible: reconnect without waiting out the backoff
        socket.set_page_hidden(false);
        assert_eq!(handle.connects(), 2);
        poll(&socket);
        assert!(socket.is_connected());
    }

    #[test]
    fn test_channel_registry_reuses_tracked_topic() {
        let (socket, handle) = connected_socket();
        let first = socket.channel("room:1", Params::default());
        let again = socket.channel("room:1", Params::default());
        assert!(Rc::ptr_eq(&first.inner, &again.inner));

        let _ = joined_channel(&socket, &handle, "room:2");
        first.join(None);
        first.leave(None);
        // a leaving channel is not reused
        let fresh = socket.channel("room:1", Params::default());
        assert!(!Rc::ptr_eq(&first.inner, &fresh.inner));
    }

    #[test]
    fn test_logger_hook_observes_traffic() {
        let (factory, handle) = MockTransport::factory();
        handle.set_auto_open(true);
        let lines = Rc::new(RefCell::new(Vec::new()));
        let lines_probe = Rc::clone(&lines);
        let socket = Socket::new(
            "ws://example.test/socket",
            SocketOptions {
                transport: Some(factory),
                logger: Some(Box::new(move |kind, msg, _data| {
                    lines_probe.borrow_mut().push(format!("{kind}: {msg}"));
                })),
                ..SocketOptions::default()
            },
        );
        socket.connect();
        socket.poll(0);
        socket.push(Message::new("room:1", "shout", Payload::empty()));
        assert!(lines.borrow().iter().any(|line| line.starts_with("transport: connected")));
        assert!(lines.borrow().iter().any(|line| line.starts_with("push: room:1 shout")));
    }
}
