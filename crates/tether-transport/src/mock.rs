//! Scriptable in-process transport.
//!
//! Drives a client without real I/O: outbound frames are recorded, and the
//! embedding emits open/message/error/close events through a [`MockHandle`].
//! All sockets built from one factory share the same scripted state, so a
//! reconnect cycle is observable through `connects()`.

use std::cell::RefCell;
use std::rc::Rc;

use bytes::Bytes;
use tether_protocol::WireFrame;

use crate::traits::{
    CloseEvent, ConnectInfo, Transport, TransportCallbacks, TransportError, TransportFactory,
    TransportState,
};

struct MockState {
    callbacks: Option<Rc<TransportCallbacks>>,
    ready_state: TransportState,
    sent: Vec<WireFrame>,
    connects: u32,
    last_connect: Option<ConnectInfo>,
    auto_open: bool,
    closed_with: Option<(u16, String)>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            callbacks: None,
            ready_state: TransportState::Closed,
            sent: Vec::new(),
            connects: 0,
            last_connect: None,
            auto_open: false,
            closed_with: None,
        }
    }
}

/// The transport half handed to the socket by the factory.
pub struct MockTransport {
    state: Rc<RefCell<MockState>>,
}

/// The controller half kept by the test or embedding.
#[derive(Clone)]
pub struct MockHandle {
    state: Rc<RefCell<MockState>>,
}

impl MockTransport {
    /// Create a factory and its controller handle sharing one state.
    #[must_use]
    pub fn factory() -> (TransportFactory, MockHandle) {
        let state = Rc::new(RefCell::new(MockState::default()));
        let handle = MockHandle {
            state: Rc::clone(&state),
        };
        let factory: TransportFactory = Box::new(move || {
            Box::new(MockTransport {
                state: Rc::clone(&state),
            })
        });
        (factory, handle)
    }
}

impl Transport for MockTransport {
    fn connect(&mut self, info: ConnectInfo, callbacks: TransportCallbacks) {
        let auto_open = {
            let mut state = self.state.borrow_mut();
            state.connects += 1;
            state.last_connect = Some(info);
            state.callbacks = Some(Rc::new(callbacks));
            state.ready_state = TransportState::Connecting;
            state.closed_with = None;
            state.auto_open
        };
        if auto_open {
            MockHandle {
                state: Rc::clone(&self.state),
            }
            .open();
        }
    }

    fn send(&mut self, frame: WireFrame) {
        self.state.borrow_mut().sent.push(frame);
    }

    fn close(&mut self, code: u16, reason: &str) {
        let (callbacks, was_live) = {
            let mut state = self.state.borrow_mut();
            let was_live = state.ready_state != TransportState::Closed;
            state.closed_with = Some((code, reason.to_string()));
            state.ready_state = TransportState::Closed;
            (state.callbacks.clone(), was_live)
        };
        // closing an already-closed connection emits no event
        if was_live {
            if let Some(callbacks) = callbacks {
                (callbacks.on_close)(CloseEvent::new(code, reason));
            }
        }
    }

    fn ready_state(&self) -> TransportState {
        self.state.borrow().ready_state
    }
}

impl MockHandle {
    fn callbacks(&self) -> Option<Rc<TransportCallbacks>> {
        self.state.borrow().callbacks.clone()
    }

    /// Make `connect` report the transport open immediately.
    pub fn set_auto_open(&self, auto_open: bool) {
        self.state.borrow_mut().auto_open = auto_open;
    }

    /// Mark the transport open and emit the open event.
    pub fn open(&self) {
        self.state.borrow_mut().ready_state = TransportState::Open;
        if let Some(callbacks) = self.callbacks() {
            (callbacks.on_open)();
        }
    }

    /// Emit an inbound text frame.
    pub fn message_text(&self, raw: impl Into<String>) {
        if let Some(callbacks) = self.callbacks() {
            (callbacks.on_message)(WireFrame::Text(raw.into()));
        }
    }

    /// Emit an inbound binary frame.
    pub fn message_binary(&self, data: impl Into<Bytes>) {
        if let Some(callbacks) = self.callbacks() {
            (callbacks.on_message)(WireFrame::Binary(data.into()));
        }
    }

    /// Emit a transport error.
    pub fn error(&self, reason: impl Into<String>) {
        if let Some(callbacks) = self.callbacks() {
            (callbacks.on_error)(TransportError::Other(reason.into()));
        }
    }

    /// Mark the transport closed and emit the close event.
    pub fn close(&self, code: u16, reason: impl Into<String>) {
        self.state.borrow_mut().ready_state = TransportState::Closed;
        if let Some(callbacks) = self.callbacks() {
            (callbacks.on_close)(CloseEvent::new(code, reason.into()));
        }
    }

    /// Frames sent so far, oldest first.
    #[must_use]
    pub fn sent(&self) -> Vec<WireFrame> {
        self.state.borrow().sent.clone()
    }

    /// Drain and return the sent frames.
    pub fn take_sent(&self) -> Vec<WireFrame> {
        std::mem::take(&mut self.state.borrow_mut().sent)
    }

    /// Number of connect calls observed.
    #[must_use]
    pub fn connects(&self) -> u32 {
        self.state.borrow().connects
    }

    /// Connect info of the most recent connect call.
    #[must_use]
    pub fn last_connect(&self) -> Option<ConnectInfo> {
        self.state.borrow().last_connect.clone()
    }

    /// Code and reason of the last client-initiated close, if any.
    #[must_use]
    pub fn closed_with(&self) -> Option<(u16, String)> {
        self.state.borrow().closed_with.clone()
    }

    /// Current reported state.
    #[must_use]
    pub fn ready_state(&self) -> TransportState {
        self.state.borrow().ready_state
    }
}
