//! Request/reply correlation.
//!
//! A [`Push`] is one outgoing operation awaiting an at-most-one reply,
//! matched by ref. Callbacks are keyed by reply status; a timeout
//! synthesizes a local `"timeout"` reply through the same dispatch path
//! as server replies, so subscribers cannot tell the two apart.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use serde_json::{json, Value};
use tracing::trace;

use tether_protocol::events::reply_event_name;
use tether_protocol::{Message, Payload};

use crate::channel::{Channel, ChannelInner};
use crate::timer::TaskId;

/// Producer invoked on every send attempt to obtain a fresh payload.
pub(crate) type PayloadProducer = Rc<dyn Fn() -> Payload>;

struct ReceiveHook {
    status: String,
    callback: Rc<dyn Fn(&Payload)>,
}

pub(crate) struct PushInner {
    channel: Weak<ChannelInner>,
    event: String,
    payload: RefCell<PayloadProducer>,
    received_resp: RefCell<Option<Payload>>,
    timeout_ms: Cell<u64>,
    timeout_task: Cell<Option<TaskId>>,
    rec_hooks: RefCell<Vec<ReceiveHook>>,
    sent: Cell<bool>,
    event_ref: RefCell<Option<String>>,
    ref_event: RefCell<Option<String>>,
}

/// One outgoing operation awaiting a correlated reply.
///
/// Handles are cheap clones sharing the same state; a push is single-use
/// per send and becomes inert after a timeout until [`Push::resend`].
pub struct Push {
    inner: Rc<PushInner>,
}

impl Clone for Push {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl Push {
    pub(crate) fn new(
        channel: Weak<ChannelInner>,
        event: impl Into<String>,
        payload: PayloadProducer,
        timeout_ms: u64,
    ) -> Self {
        Self {
            inner: Rc::new(PushInner {
                channel,
                event: event.into(),
                payload: RefCell::new(payload),
                received_resp: RefCell::new(None),
                timeout_ms: Cell::new(timeout_ms),
                timeout_task: Cell::new(None),
                rec_hooks: RefCell::new(Vec::new()),
                sent: Cell::new(false),
                event_ref: RefCell::new(None),
                ref_event: RefCell::new(None),
            }),
        }
    }

    /// The event this push carries.
    #[must_use]
    pub fn event(&self) -> String {
        self.inner.event.clone()
    }

    /// The ref assigned to the current send attempt, if any.
    #[must_use]
    pub fn event_ref(&self) -> Option<String> {
        self.inner.event_ref.borrow().clone()
    }

    /// Register a callback for a reply status (`"ok"`, `"error"`,
    /// `"timeout"`, or any server-defined status).
    ///
    /// If a matching reply was already received, the callback fires
    /// immediately with the cached response.
    pub fn receive(&self, status: impl Into<String>, callback: impl Fn(&Payload) + 'static) -> &Self {
        let status = status.into();
        let callback: Rc<dyn Fn(&Payload)> = Rc::new(callback);
        let cached = self.inner.received_resp.borrow().clone();
        if let Some(reply) = cached {
            if let Some((cached_status, response)) = reply.reply_parts() {
                if cached_status == status {
                    callback(&response);
                }
            }
        }
        self.inner
            .rec_hooks
            .borrow_mut()
            .push(ReceiveHook { status, callback });
        self
    }

    /// Clear prior ref/timer state and send again. Used when a channel
    /// rejoins and the original push never got a reply.
    pub fn resend(&self, timeout_ms: u64) {
        self.inner.timeout_ms.set(timeout_ms);
        self.reset();
        self.send();
    }

    /// Queue the push: assign a ref if none is attached, re-resolve the
    /// payload, bind the reply event, and arm the timeout.
    pub(crate) fn send(&self) {
        if self.has_received("timeout") {
            return;
        }
        self.start_timeout();
        self.inner.sent.set(true);
        let Some(channel) = self.channel() else { return };
        let producer = self.inner.payload.borrow().clone();
        let mut message = Message::new(channel.topic(), self.inner.event.clone(), producer());
        message.join_ref = channel.join_ref();
        message.event_ref = self.event_ref();
        channel.socket_push(message);
    }

    pub(crate) fn reset(&self) {
        self.cancel_ref_event();
        self.cancel_timeout();
        *self.inner.event_ref.borrow_mut() = None;
        *self.inner.ref_event.borrow_mut() = None;
        *self.inner.received_resp.borrow_mut() = None;
        self.inner.sent.set(false);
    }

    pub(crate) fn start_timeout(&self) {
        if self.inner.timeout_task.get().is_some() {
            self.cancel_timeout();
        }
        let Some(channel) = self.channel() else { return };
        let Some(socket) = channel.socket() else { return };

        let event_ref = match self.event_ref() {
            Some(existing) => existing,
            None => socket.make_ref(),
        };
        let ref_event = reply_event_name(&event_ref);
        *self.inner.event_ref.borrow_mut() = Some(event_ref);
        *self.inner.ref_event.borrow_mut() = Some(ref_event.clone());

        // a resend with the same ref replaces the previous binding
        channel.off(&ref_event);
        let weak = Rc::downgrade(&self.inner);
        channel.on(ref_event, move |payload, _event_ref, _join_ref| {
            if let Some(inner) = weak.upgrade() {
                let push = Push { inner };
                push.cancel_ref_event();
                push.cancel_timeout();
                *push.inner.received_resp.borrow_mut() = Some(payload.clone());
                push.match_receive(payload);
            }
        });

        let weak = Rc::downgrade(&self.inner);
        let task = socket.scheduler().schedule(self.inner.timeout_ms.get(), move || {
            if let Some(inner) = weak.upgrade() {
                let push = Push { inner };
                push.inner.timeout_task.set(None);
                push.trigger_reply("timeout", json!({}));
            }
        });
        self.inner.timeout_task.set(Some(task));
    }

    /// Synthesize a reply locally, routed through the channel's dispatch
    /// so it behaves exactly like a server reply.
    pub(crate) fn trigger_reply(&self, status: &str, response: Value) {
        let Some(channel) = self.channel() else { return };
        let Some(ref_event) = self.inner.ref_event.borrow().clone() else {
            trace!(event = %self.inner.event, "reply triggered before send; ignoring");
            return;
        };
        let payload = Payload::Json(json!({"status": status, "response": response}));
        channel.trigger(&ref_event, Some(&payload), None, None);
    }

    pub(crate) fn cancel_timeout(&self) {
        if let Some(task) = self.inner.timeout_task.take() {
            if let Some(socket) = self.channel().and_then(|c| c.socket()) {
                socket.scheduler().cancel(task);
            }
        }
    }

    pub(crate) fn has_received(&self, status: &str) -> bool {
        self.inner
            .received_resp
            .borrow()
            .as_ref()
            .and_then(Payload::reply_parts)
            .is_some_and(|(cached, _)| cached == status)
    }

    pub(crate) fn is_sent(&self) -> bool {
        self.inner.sent.get()
    }

    fn match_receive(&self, payload: &Payload) {
        let Some((status, response)) = payload.reply_parts() else {
            trace!(event = %self.inner.event, "reply without a status; dropping");
            return;
        };
        let hooks: Vec<Rc<dyn Fn(&Payload)>> = self
            .inner
            .rec_hooks
            .borrow()
            .iter()
            .filter(|hook| hook.status == status)
            .map(|hook| Rc::clone(&hook.callback))
            .collect();
        for hook in hooks {
            hook(&response);
        }
    }

    fn cancel_ref_event(&self) {
        let ref_event = self.inner.ref_event.borrow().clone();
        if let (Some(ref_event), Some(channel)) = (ref_event, self.channel()) {
            channel.off(&ref_event);
        }
    }

    fn channel(&self) -> Option<Channel> {
        self.inner.channel.upgrade().map(|inner| Channel { inner })
    }
}
