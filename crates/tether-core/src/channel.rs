//! Per-topic join state machine.
//!
//! A channel coordinates join/leave for one topic over a shared socket,
//! buffers pushes until the join settles, and dispatches inbound events
//! to subscribers. Messages belonging to a superseded join instance are
//! filtered out by join_ref so a stale join's late replies cannot corrupt
//! a fresh one.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use serde_json::json;
use tracing::debug;

use tether_protocol::events::{reply_event_name, ChannelEvent};
use tether_protocol::{Message, Payload};

use crate::config::Params;
use crate::push::{PayloadProducer, Push};
use crate::socket::{Socket, SocketInner};
use crate::timer::RetryTimer;

/// Channel lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelState {
    /// Not joined; the resting state before `join` and after a close.
    Closed,
    /// Join or connection failed; a rejoin is pending.
    Errored,
    /// Join acknowledged by the server.
    Joined,
    /// Join sent, reply pending.
    Joining,
    /// Leave in progress.
    Leaving,
}

impl ChannelState {
    /// Lowercase name of the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ChannelState::Closed => "closed",
            ChannelState::Errored => "errored",
            ChannelState::Joined => "joined",
            ChannelState::Joining => "joining",
            ChannelState::Leaving => "leaving",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type BindingCallback = Rc<dyn Fn(&Payload, Option<&str>, Option<&str>)>;

struct Binding {
    event: String,
    binding_ref: u32,
    callback: BindingCallback,
}

pub(crate) struct ChannelInner {
    topic: String,
    params: RefCell<Params>,
    socket: Weak<SocketInner>,
    state: Cell<ChannelState>,
    bindings: RefCell<Vec<Binding>>,
    binding_ref: Cell<u32>,
    timeout_ms: Cell<u64>,
    joined_once: Cell<bool>,
    join_push: Push,
    push_buffer: RefCell<Vec<Push>>,
    state_change_refs: RefCell<Vec<String>>,
    rejoin_timer: RetryTimer,
}

/// A per-topic channel multiplexed over one socket.
///
/// Handles are cheap clones sharing the same state.
pub struct Channel {
    pub(crate) inner: Rc<ChannelInner>,
}

impl Clone for Channel {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl Channel {
    pub(crate) fn new(topic: impl Into<String>, params: Params, socket: &Socket) -> Self {
        let topic = topic.into();
        let timeout_ms = socket.timeout_ms();
        let scheduler = socket.scheduler();
        let rejoin_after_ms = socket.rejoin_after_ms();
        let socket_weak = socket.downgrade();

        let inner = Rc::new_cyclic(|weak: &Weak<ChannelInner>| {
            // the join payload resolves the channel params afresh on every
            // attempt, so producer-backed params stay current across rejoins
            let producer_weak = weak.clone();
            let join_payload: PayloadProducer = Rc::new(move || {
                producer_weak
                    .upgrade()
                    .map(|inner| Payload::Json(inner.params.borrow().resolve()))
                    .unwrap_or_default()
            });
            let join_push = Push::new(
                weak.clone(),
                ChannelEvent::Join.as_str(),
                join_payload,
                timeout_ms,
            );

            let timer_weak = weak.clone();
            let rejoin_timer = RetryTimer::new(
                scheduler,
                move || {
                    if let Some(channel) = Channel::upgrade(&timer_weak) {
                        if channel.socket_is_connected() {
                            channel.rejoin(None);
                        }
                    }
                },
                {
                    let backoff = Rc::clone(&rejoin_after_ms);
                    move |tries| backoff(tries)
                },
            );

            ChannelInner {
                topic,
                params: RefCell::new(params),
                socket: socket_weak,
                state: Cell::new(ChannelState::Closed),
                bindings: RefCell::new(Vec::new()),
                binding_ref: Cell::new(0),
                timeout_ms: Cell::new(timeout_ms),
                joined_once: Cell::new(false),
                join_push,
                push_buffer: RefCell::new(Vec::new()),
                state_change_refs: RefCell::new(Vec::new()),
                rejoin_timer,
            }
        });

        let channel = Channel { inner };
        channel.wire_lifecycle(socket);
        channel
    }

    fn upgrade(weak: &Weak<ChannelInner>) -> Option<Channel> {
        weak.upgrade().map(|inner| Channel { inner })
    }

    fn wire_lifecycle(&self, socket: &Socket) {
        // socket-level hooks: restart backoff on transport error, rejoin
        // on the next successful open
        let weak = Rc::downgrade(&self.inner);
        let error_ref = socket.on_error(move |_error| {
            if let Some(channel) = Channel::upgrade(&weak) {
                channel.inner.rejoin_timer.reset();
            }
        });
        let weak = Rc::downgrade(&self.inner);
        let open_ref = socket.on_open(move || {
            if let Some(channel) = Channel::upgrade(&weak) {
                channel.inner.rejoin_timer.reset();
                if channel.is_errored() {
                    channel.rejoin(None);
                }
            }
        });
        self.inner
            .state_change_refs
            .borrow_mut()
            .extend([error_ref, open_ref]);

        let weak = Rc::downgrade(&self.inner);
        self.inner.join_push.receive("ok", move |_response| {
            if let Some(channel) = Channel::upgrade(&weak) {
                debug!(topic = %channel.inner.topic, "joined");
                channel.inner.state.set(ChannelState::Joined);
                channel.inner.rejoin_timer.reset();
                let buffered: Vec<Push> =
                    channel.inner.push_buffer.borrow_mut().drain(..).collect();
                for push in buffered {
                    push.send();
                }
            }
        });

        let weak = Rc::downgrade(&self.inner);
        self.inner.join_push.receive("error", move |_response| {
            if let Some(channel) = Channel::upgrade(&weak) {
                channel.socket_log("channel", &format!("join error {}", channel.inner.topic));
                channel.inner.state.set(ChannelState::Errored);
                if channel.socket_is_connected() {
                    channel.inner.rejoin_timer.schedule_timeout();
                }
            }
        });

        let weak = Rc::downgrade(&self.inner);
        self.inner.join_push.receive("timeout", move |_response| {
            if let Some(channel) = Channel::upgrade(&weak) {
                debug!(topic = %channel.inner.topic, "join timed out");
                channel.socket_log("channel", &format!("timeout {}", channel.inner.topic));
                // tell the server to drop the half-joined member
                let leave_payload: PayloadProducer = Rc::new(Payload::empty);
                let leave_push = Push::new(
                    Rc::downgrade(&channel.inner),
                    ChannelEvent::Leave.as_str(),
                    leave_payload,
                    channel.inner.timeout_ms.get(),
                );
                leave_push.send();
                channel.inner.state.set(ChannelState::Errored);
                channel.inner.join_push.reset();
                if channel.socket_is_connected() {
                    channel.inner.rejoin_timer.schedule_timeout();
                }
            }
        });

        let weak = Rc::downgrade(&self.inner);
        self.on(ChannelEvent::Close.as_str(), move |_payload, _ref, join_ref| {
            if let Some(channel) = Channel::upgrade(&weak) {
                debug!(topic = %channel.inner.topic, ?join_ref, "channel closed");
                channel.inner.rejoin_timer.reset();
                channel.inner.state.set(ChannelState::Closed);
                if let Some(socket) = channel.socket() {
                    socket.remove(&channel);
                }
            }
        });

        let weak = Rc::downgrade(&self.inner);
        self.on(ChannelEvent::Error.as_str(), move |_payload, _ref, _join_ref| {
            if let Some(channel) = Channel::upgrade(&weak) {
                if channel.is_leaving() || channel.is_closed() {
                    return;
                }
                channel.socket_log("channel", &format!("error {}", channel.inner.topic));
                if channel.is_joining() {
                    channel.inner.join_push.reset();
                }
                channel.inner.state.set(ChannelState::Errored);
                if channel.socket_is_connected() {
                    channel.inner.rejoin_timer.schedule_timeout();
                }
            }
        });

        // replies re-trigger as per-ref events so the owning push resolves
        let weak = Rc::downgrade(&self.inner);
        self.on(ChannelEvent::Reply.as_str(), move |payload, event_ref, _join_ref| {
            if let (Some(channel), Some(event_ref)) = (Channel::upgrade(&weak), event_ref) {
                channel.trigger(&reply_event_name(event_ref), Some(payload), Some(event_ref), None);
            }
        });
    }

    /// The channel topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.inner.state.get()
    }

    /// The join ref of the current join instance, if a join was sent.
    #[must_use]
    pub fn join_ref(&self) -> Option<String> {
        self.inner.join_push.event_ref()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    #[must_use]
    pub fn is_errored(&self) -> bool {
        self.state() == ChannelState::Errored
    }

    #[must_use]
    pub fn is_joined(&self) -> bool {
        self.state() == ChannelState::Joined
    }

    #[must_use]
    pub fn is_joining(&self) -> bool {
        self.state() == ChannelState::Joining
    }

    #[must_use]
    pub fn is_leaving(&self) -> bool {
        self.state() == ChannelState::Leaving
    }

    /// Join the channel, returning the join push for reply hooks.
    ///
    /// Rejoins after an error reuse this instance through its backoff
    /// path; calling `join` again is an integration bug.
    ///
    /// # Panics
    ///
    /// Panics if called more than once for this channel instance.
    pub fn join(&self, timeout_ms: Option<u64>) -> Push {
        assert!(
            !self.inner.joined_once.get(),
            "tried to join '{}' multiple times; 'join' can only be called once per channel instance",
            self.inner.topic
        );
        if let Some(timeout_ms) = timeout_ms {
            self.inner.timeout_ms.set(timeout_ms);
        }
        self.inner.joined_once.set(true);
        self.rejoin(timeout_ms);
        self.inner.join_push.clone()
    }

    /// Subscribe to an event. Returns an opaque ref usable with
    /// [`Channel::off_handler`] to remove exactly this subscription.
    ///
    /// Callbacks receive `(payload, ref, join_ref)`.
    pub fn on(
        &self,
        event: impl Into<String>,
        callback: impl Fn(&Payload, Option<&str>, Option<&str>) + 'static,
    ) -> u32 {
        let binding_ref = self.inner.binding_ref.get() + 1;
        self.inner.binding_ref.set(binding_ref);
        self.inner.bindings.borrow_mut().push(Binding {
            event: event.into(),
            binding_ref,
            callback: Rc::new(callback),
        });
        binding_ref
    }

    /// Hook into channel close.
    pub fn on_close(&self, callback: impl Fn() + 'static) -> u32 {
        self.on(ChannelEvent::Close.as_str(), move |_, _, _| callback())
    }

    /// Hook into channel errors.
    pub fn on_error(&self, callback: impl Fn(&Payload) + 'static) -> u32 {
        self.on(ChannelEvent::Error.as_str(), move |payload, _, _| {
            callback(payload);
        })
    }

    /// Remove every subscription for an event.
    pub fn off(&self, event: &str) {
        self.inner
            .bindings
            .borrow_mut()
            .retain(|binding| binding.event != event);
    }

    /// Remove one subscription by the ref returned from [`Channel::on`].
    pub fn off_handler(&self, event: &str, binding_ref: u32) {
        self.inner
            .bindings
            .borrow_mut()
            .retain(|binding| !(binding.event == event && binding.binding_ref == binding_ref));
    }

    /// Push an event to the server.
    ///
    /// While the join is settling, pushes are buffered and sent once the
    /// channel reaches `joined`.
    ///
    /// # Panics
    ///
    /// Panics if called before [`Channel::join`].
    pub fn push(&self, event: impl Into<String>, payload: Payload, timeout_ms: Option<u64>) -> Push {
        let event = event.into();
        assert!(
            self.inner.joined_once.get(),
            "tried to push '{}' to '{}' before joining; call join() first",
            event,
            self.inner.topic
        );
        let timeout_ms = timeout_ms.unwrap_or(self.inner.timeout_ms.get());
        let producer: PayloadProducer = Rc::new(move || payload.clone());
        let push = Push::new(Rc::downgrade(&self.inner), event, producer, timeout_ms);
        if self.can_push() {
            push.send();
        } else {
            push.start_timeout();
            self.inner.push_buffer.borrow_mut().push(push.clone());
        }
        push
    }

    /// Leave the channel: unsubscribes from server events and instructs
    /// the channel to terminate on the server.
    ///
    /// Triggers `phx_close` locally on acknowledgment or timeout, so
    /// close hooks observe the leave deterministically even if the server
    /// never acks.
    pub fn leave(&self, timeout_ms: Option<u64>) -> Push {
        let timeout_ms = timeout_ms.unwrap_or(self.inner.timeout_ms.get());
        self.inner.rejoin_timer.reset();
        self.inner.join_push.cancel_timeout();
        // no further socket lifecycle callbacks for this instance
        if let Some(socket) = self.socket() {
            let refs: Vec<String> = self.inner.state_change_refs.borrow_mut().drain(..).collect();
            socket.off(&refs);
        }
        self.inner.state.set(ChannelState::Leaving);

        let weak = Rc::downgrade(&self.inner);
        let on_close: Rc<dyn Fn()> = Rc::new(move || {
            if let Some(channel) = Channel::upgrade(&weak) {
                channel.socket_log("channel", &format!("leave {}", channel.inner.topic));
                channel.trigger(
                    ChannelEvent::Close.as_str(),
                    Some(&Payload::Json(json!("leave"))),
                    None,
                    None,
                );
            }
        });

        let leave_payload: PayloadProducer = Rc::new(Payload::empty);
        let leave_push = Push::new(
            Rc::downgrade(&self.inner),
            ChannelEvent::Leave.as_str(),
            leave_payload,
            timeout_ms,
        );
        {
            let on_close = Rc::clone(&on_close);
            leave_push.receive("ok", move |_| on_close());
        }
        leave_push.receive("timeout", move |_| on_close());
        leave_push.send();
        if !self.can_push() {
            leave_push.trigger_reply("ok", json!({}));
        }
        leave_push
    }

    pub(crate) fn rejoin(&self, timeout_ms: Option<u64>) {
        if self.is_leaving() {
            return;
        }
        if let Some(socket) = self.socket() {
            socket.leave_open_topic(&self.inner.topic, self);
        }
        self.inner.state.set(ChannelState::Joining);
        self.inner
            .join_push
            .resend(timeout_ms.unwrap_or(self.inner.timeout_ms.get()));
    }

    /// Whether an inbound message belongs to this channel's current join
    /// instance. `phx_close` and `phx_error` pass regardless of join_ref.
    pub(crate) fn is_member(&self, message: &Message) -> bool {
        if self.inner.topic != message.topic {
            return false;
        }
        match (&message.join_ref, self.join_ref()) {
            (Some(message_join_ref), Some(current)) if *message_join_ref != current => {
                if message.event == ChannelEvent::Close.as_str()
                    || message.event == ChannelEvent::Error.as_str()
                {
                    true
                } else {
                    debug!(
                        topic = %message.topic,
                        event = %message.event,
                        join_ref = %message_join_ref,
                        "dropping outdated message"
                    );
                    self.socket_log("channel", "dropping outdated message");
                    false
                }
            }
            _ => true,
        }
    }

    /// Dispatch an event to every binding registered for it.
    pub(crate) fn trigger(
        &self,
        event: &str,
        payload: Option<&Payload>,
        event_ref: Option<&str>,
        join_ref: Option<&str>,
    ) {
        let handlers: Vec<BindingCallback> = self
            .inner
            .bindings
            .borrow()
            .iter()
            .filter(|binding| binding.event == event)
            .map(|binding| Rc::clone(&binding.callback))
            .collect();
        let fallback = Payload::empty();
        let payload = payload.unwrap_or(&fallback);
        let join_ref = join_ref.map(str::to_string).or_else(|| self.join_ref());
        for handler in handlers {
            handler(payload, event_ref, join_ref.as_deref());
        }
    }

    pub(crate) fn socket(&self) -> Option<Socket> {
        self.inner.socket.upgrade().map(Socket::from_inner)
    }

    pub(crate) fn socket_push(&self, message: Message) {
        if let Some(socket) = self.socket() {
            socket.push(message);
        }
    }

    pub(crate) fn take_state_change_refs(&self) -> Vec<String> {
        self.inner.state_change_refs.borrow_mut().drain(..).collect()
    }

    fn can_push(&self) -> bool {
        self.socket_is_connected() && self.is_joined()
    }

    fn socket_is_connected(&self) -> bool {
        self.socket().is_some_and(|socket| socket.is_connected())
    }

    fn socket_log(&self, kind: &str, msg: &str) {
        if let Some(socket) = self.socket() {
            socket.log(kind, msg, &"");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::Cell;
    use tether_protocol::WireFrame;

    use crate::test_support::{
        connected_socket, joined_channel, poll, reply, sent_messages, socket_with_mock,
    };

    #[test]
    fn test_join_sends_join_push_with_params() {
        let (socket, handle) = connected_socket();
        let channel = socket.channel("room:1", Params::Static(json!({"token": "t0k3n"})));
        channel.join(None);

        assert!(channel.is_joining());
        let sent = sent_messages(&handle);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].topic, "room:1");
        assert_eq!(sent[0].event, "phx_join");
        assert_eq!(sent[0].payload, Payload::Json(json!({"token": "t0k3n"})));
        // the join's own ref doubles as the channel's join_ref
        assert_eq!(sent[0].join_ref, sent[0].event_ref);
        assert_eq!(channel.join_ref(), sent[0].join_ref);
    }

    #[test]
    #[should_panic(expected = "multiple times")]
    fn test_double_join_panics() {
        let (socket, _handle) = connected_socket();
        let channel = socket.channel("room:1", Params::default());
        channel.join(None);
        channel.join(None);
    }

    #[test]
    #[should_panic(expected = "before joining")]
    fn test_push_before_join_panics() {
        let (socket, _handle) = connected_socket();
        let channel = socket.channel("room:1", Params::default());
        channel.push("msg", Payload::empty(), None);
    }

    #[test]
    fn test_join_ok_flushes_buffered_pushes_in_order() {
        let (socket, handle) = connected_socket();
        let channel = socket.channel("room:1", Params::default());
        channel.join(None);
        let first = channel.push("first", Payload::Json(json!({"n": 1})), None);
        channel.push("second", Payload::Json(json!({"n": 2})), None);
        // only the join is on the wire while the join is settling
        assert_eq!(handle.sent().len(), 1);
        assert!(!first.is_sent());

        let join_ref = channel.join_ref().unwrap();
        reply(&handle, Some(&join_ref), &join_ref, "room:1", "ok", json!({}));
        poll(&socket);

        assert!(channel.is_joined());
        assert!(first.is_sent());
        let sent = sent_messages(&handle);
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[1].event, "first");
        assert_eq!(sent[2].event, "second");
        assert_eq!(sent[1].join_ref.as_deref(), Some(join_ref.as_str()));

        // joined channels send immediately, and the buffer stays drained
        channel.push("third", Payload::empty(), None);
        assert_eq!(sent_messages(&handle).len(), 4);
    }

    #[test]
    fn test_buffered_push_wire_shape() {
        let (socket, handle) = connected_socket();
        let channel = socket.channel("room:1", Params::default());
        channel.join(None);
        let push = channel.push("msg", Payload::Json(json!({"body": "hi"})), None);

        let join_ref = channel.join_ref().unwrap();
        let push_ref = push.event_ref().unwrap();
        reply(&handle, Some(&join_ref), &join_ref, "room:1", "ok", json!({}));
        poll(&socket);

        let frames = handle.sent();
        assert_eq!(
            frames[1],
            WireFrame::Text(format!(
                r#"["{join_ref}","{push_ref}","room:1","msg",{{"body":"hi"}}]"#
            ))
        );
    }

    #[test]
    fn test_push_reply_resolves_matching_receive_hook() {
        let (socket, handle) = connected_socket();
        let channel = joined_channel(&socket, &handle, "room:1");
        let push = channel.push("msg", Payload::empty(), None);

        let ok_seen = Rc::new(RefCell::new(None));
        let ok_probe = Rc::clone(&ok_seen);
        let error_count = Rc::new(Cell::new(0u32));
        let error_probe = Rc::clone(&error_count);
        push.receive("ok", move |response| {
            *ok_probe.borrow_mut() = Some(response.clone());
        })
        .receive("error", move |_| error_probe.set(error_probe.get() + 1));

        let join_ref = channel.join_ref().unwrap();
        let push_ref = push.event_ref().unwrap();
        reply(&handle, Some(&join_ref), &push_ref, "room:1", "ok", json!({"id": 3}));
        poll(&socket);

        assert_eq!(*ok_seen.borrow(), Some(Payload::Json(json!({"id": 3}))));
        assert_eq!(error_count.get(), 0);

        // a late subscription for the cached status fires immediately
        let late = Rc::new(Cell::new(false));
        let late_probe = Rc::clone(&late);
        push.receive("ok", move |_| late_probe.set(true));
        assert!(late.get());
    }

    #[test]
    fn test_push_timeout_fires_once_and_late_reply_is_ignored() {
        let (socket, handle) = connected_socket();
        let channel = joined_channel(&socket, &handle, "room:1");
        let push = channel.push("msg", Payload::empty(), Some(5_000));

        let ok_count = Rc::new(Cell::new(0u32));
        let ok_probe = Rc::clone(&ok_count);
        let timeout_count = Rc::new(Cell::new(0u32));
        let timeout_probe = Rc::clone(&timeout_count);
        push.receive("ok", move |_| ok_probe.set(ok_probe.get() + 1))
            .receive("timeout", move |_| timeout_probe.set(timeout_probe.get() + 1));

        let push_ref = push.event_ref().unwrap();
        socket.poll(socket.now_ms() + 5_000);
        assert_eq!(timeout_count.get(), 1);
        assert_eq!(ok_count.get(), 0);

        // the server answering after the local timeout must not re-fire
        let join_ref = channel.join_ref().unwrap();
        reply(&handle, Some(&join_ref), &push_ref, "room:1", "ok", json!({}));
        poll(&socket);
        assert_eq!(timeout_count.get(), 1);
        assert_eq!(ok_count.get(), 0);
    }

    #[test]
    fn test_stale_join_ref_messages_dropped_except_lifecycle() {
        let (socket, handle) = connected_socket();
        let channel = joined_channel(&socket, &handle, "room:1");
        let updates = Rc::new(Cell::new(0u32));
        let updates_probe = Rc::clone(&updates);
        channel.on("update", move |_, _, _| updates_probe.set(updates_probe.get() + 1));

        // a stale join instance's broadcast is dropped
        handle.message_text(json!(["999", null, "room:1", "update", {}]).to_string());
        poll(&socket);
        assert_eq!(updates.get(), 0);

        // the current join instance's broadcast is delivered
        let join_ref = channel.join_ref().unwrap();
        handle.message_text(json!([join_ref, null, "room:1", "update", {}]).to_string());
        poll(&socket);
        assert_eq!(updates.get(), 1);

        // phx_error passes the staleness filter
        handle.message_text(json!(["999", null, "room:1", "phx_error", {}]).to_string());
        poll(&socket);
        assert!(channel.is_errored());
    }

    #[test]
    fn test_messages_for_other_topics_are_not_delivered() {
        let (socket, handle) = connected_socket();
        let channel = joined_channel(&socket, &handle, "room:1");
        let updates = Rc::new(Cell::new(0u32));
        let updates_probe = Rc::clone(&updates);
        channel.on("update", move |_, _, _| updates_probe.set(updates_probe.get() + 1));

        handle.message_text(json!([null, null, "room:2", "update", {}]).to_string());
        poll(&socket);
        assert_eq!(updates.get(), 0);
    }

    #[test]
    fn test_join_error_schedules_backoff_rejoin() {
        let (socket, handle) = connected_socket();
        let channel = socket.channel("room:1", Params::default());
        channel.join(None);
        let first_join_ref = channel.join_ref().unwrap();

        reply(
            &handle,
            Some(&first_join_ref),
            &first_join_ref,
            "room:1",
            "error",
            json!({"reason": "denied"}),
        );
        poll(&socket);
        assert!(channel.is_errored());

        // first rejoin backoff step is one second
        socket.poll(socket.now_ms() + 999);
        assert!(channel.is_errored());
        socket.poll(socket.now_ms() + 1);
        assert!(channel.is_joining());
        assert_ne!(channel.join_ref().unwrap(), first_join_ref);
    }

    #[test]
    fn test_transport_close_errors_channel_and_rejoins_on_reconnect() {
        let (socket, handle) = connected_socket();
        let channel = joined_channel(&socket, &handle, "room:1");

        handle.close(4000, "dropped");
        poll(&socket);
        assert!(channel.is_errored());

        // reconnect backoff fires, the open triggers an automatic rejoin
        socket.poll(socket.now_ms() + 10);
        assert!(socket.is_connected());
        assert!(channel.is_joining());
        assert_eq!(handle.connects(), 2);
    }

    #[test]
    fn test_leave_acknowledged_closes_and_removes() {
        let (socket, handle) = connected_socket();
        let channel = joined_channel(&socket, &handle, "room:1");
        let closed = Rc::new(Cell::new(false));
        let closed_probe = Rc::clone(&closed);
        channel.on_close(move || closed_probe.set(true));

        channel.leave(None);
        assert!(channel.is_leaving());
        let sent = sent_messages(&handle);
        let leave_msg = sent.last().unwrap();
        assert_eq!(leave_msg.event, "phx_leave");

        reply(
            &handle,
            leave_msg.join_ref.as_deref(),
            leave_msg.event_ref.as_deref().unwrap(),
            "room:1",
            "ok",
            json!({}),
        );
        poll(&socket);
        assert!(closed.get());
        assert!(channel.is_closed());

        // the closed channel left the registry; a new instance replaces it
        let fresh = socket.channel("room:1", Params::default());
        assert!(!Rc::ptr_eq(&fresh.inner, &channel.inner));
    }

    #[test]
    fn test_leave_while_disconnected_closes_locally() {
        let (socket, _handle) = socket_with_mock();
        let channel = socket.channel("room:1", Params::default());
        channel.join(None);

        let closed = Rc::new(Cell::new(false));
        let closed_probe = Rc::clone(&closed);
        channel.on_close(move || closed_probe.set(true));

        channel.leave(None);
        assert!(closed.get());
        assert!(channel.is_closed());
    }

    #[test]
    fn test_join_timeout_sends_leave_and_schedules_rejoin() {
        let (socket, handle) = connected_socket();
        let channel = socket.channel("room:1", Params::default());
        channel.join(Some(5_000));

        socket.poll(socket.now_ms() + 5_000);
        assert!(channel.is_errored());
        let sent = sent_messages(&handle);
        assert_eq!(sent.last().unwrap().event, "phx_leave");

        socket.poll(socket.now_ms() + 1_000);
        assert!(channel.is_joining());
    }

    #[test]
    fn test_off_handler_removes_single_binding() {
        let (socket, handle) = connected_socket();
        let channel = socket.channel("room:1", Params::default());
        let first = Rc::new(Cell::new(0u32));
        let first_probe = Rc::clone(&first);
        let second = Rc::new(Cell::new(0u32));
        let second_probe = Rc::clone(&second);

        let first_ref = channel.on("evt", move |_, _, _| first_probe.set(first_probe.get() + 1));
        channel.on("evt", move |_, _, _| second_probe.set(second_probe.get() + 1));
        channel.off_handler("evt", first_ref);

        handle.message_text(json!([null, null, "room:1", "evt", {}]).to_string());
        poll(&socket);
        assert_eq!(first.get(), 0);
        assert_eq!(second.get(), 1);

        // off with no ref removes the remaining handler
        channel.off("evt");
        handle.message_text(json!([null, null, "room:1", "evt", {}]).to_string());
        poll(&socket);
        assert_eq!(second.get(), 1);
    }

    #[test]
    fn test_fresh_instance_replaces_a_leaving_channel() {
        let (socket, handle) = connected_socket();
        let stale = joined_channel(&socket, &handle, "room:1");
        stale.leave(None);
        // the leaving channel is not reused; its replacement joins freely
        let fresh = socket.channel("room:1", Params::default());
        fresh.join(None);
        assert!(fresh.is_joining());
        assert!(stale.is_leaving() || stale.is_closed());
    }

    #[test]
    fn test_channel_state_names() {
        assert_eq!(ChannelState::Closed.as_str(), "closed");
        assert_eq!(ChannelState::Joining.to_string(), "joining");
    }
}
