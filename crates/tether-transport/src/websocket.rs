//! WebSocket transport adapter.
//!
//! Bridges tokio-tungstenite into the callback capability interface. The
//! adapter spawns a read/write task on the ambient tokio runtime; inbound
//! events are queued and handed to the registered callbacks when the
//! socket pumps the transport, so the client core stays single-threaded.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{mpsc, Arc};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

use tether_protocol::events::AUTH_TOKEN_PREFIX;
use tether_protocol::WireFrame;

use crate::traits::{
    CloseEvent, ConnectInfo, Transport, TransportCallbacks, TransportError, TransportFactory,
    TransportState,
};

// 1006 is never sent on the wire; it stands for a connection dropped
// without a close frame.
const CLOSE_ABNORMAL: u16 = 1006;

const STATE_CONNECTING: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_CLOSING: u8 = 2;
const STATE_CLOSED: u8 = 3;

enum Command {
    Send(WireFrame),
    Close(u16, String),
}

enum RawEvent {
    Open,
    Message(WireFrame),
    Error(TransportError),
    Close(CloseEvent),
}

/// WebSocket-backed transport.
///
/// `connect` spawns onto the current tokio runtime, so the embedding must
/// drive the socket from a thread with an entered runtime and poll it
/// periodically to drain queued events.
pub struct WebSocketTransport {
    state: Arc<AtomicU8>,
    events: Option<mpsc::Receiver<RawEvent>>,
    callbacks: Option<TransportCallbacks>,
    cmd_tx: Option<tokio::sync::mpsc::UnboundedSender<Command>>,
}

impl WebSocketTransport {
    /// Create a disconnected transport.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(STATE_CLOSED)),
            events: None,
            callbacks: None,
            cmd_tx: None,
        }
    }

    /// Factory suitable for `SocketOptions::transport`.
    #[must_use]
    pub fn factory() -> TransportFactory {
        Box::new(|| Box::new(WebSocketTransport::new()))
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn build_request(info: &ConnectInfo) -> Result<Request, String> {
    let mut request = info
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| e.to_string())?;
    if let Some(token) = &info.auth_token {
        let value = format!("{AUTH_TOKEN_PREFIX}{token}");
        let header = value
            .parse()
            .map_err(|_| "auth token is not a valid header value".to_string())?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", header);
    }
    Ok(request)
}

impl Transport for WebSocketTransport {
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime context.
    fn connect(&mut self, info: ConnectInfo, callbacks: TransportCallbacks) {
        let (event_tx, event_rx) = mpsc::channel();
        let (cmd_tx, mut cmd_rx) = tokio::sync::mpsc::unbounded_channel();
        self.events = Some(event_rx);
        self.callbacks = Some(callbacks);
        self.cmd_tx = Some(cmd_tx);
        self.state.store(STATE_CONNECTING, Ordering::SeqCst);

        let state = Arc::clone(&self.state);
        let url = info.url.clone();
        let handle = tokio::runtime::Handle::current();
        handle.spawn(async move {
            let request = match build_request(&info) {
                Ok(request) => request,
                Err(reason) => {
                    state.store(STATE_CLOSED, Ordering::SeqCst);
                    let _ = event_tx.send(RawEvent::Error(TransportError::ConnectFailed(reason)));
                    let _ = event_tx.send(RawEvent::Close(CloseEvent::new(CLOSE_ABNORMAL, "")));
                    return;
                }
            };

            let (ws, _response) = match connect_async(request).await {
                Ok(ok) => ok,
                Err(e) => {
                    debug!(%url, error = %e, "websocket connect failed");
                    state.store(STATE_CLOSED, Ordering::SeqCst);
                    let _ = event_tx.send(RawEvent::Error(TransportError::ConnectFailed(
                        e.to_string(),
                    )));
                    let _ = event_tx.send(RawEvent::Close(CloseEvent::new(CLOSE_ABNORMAL, "")));
                    return;
                }
            };

            debug!(%url, "websocket connected");
            state.store(STATE_OPEN, Ordering::SeqCst);
            let _ = event_tx.send(RawEvent::Open);

            let (mut sink, mut stream) = ws.split();
            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        Some(Command::Send(frame)) => {
                            let msg = match frame {
                                WireFrame::Text(text) => WsMessage::Text(text),
                                WireFrame::Binary(data) => WsMessage::Binary(data.to_vec()),
                            };
                            if let Err(e) = sink.send(msg).await {
                                let _ = event_tx.send(RawEvent::Error(
                                    TransportError::SendFailed(e.to_string()),
                                ));
                            }
                        }
                        Some(Command::Close(code, reason)) => {
                            state.store(STATE_CLOSING, Ordering::SeqCst);
                            let frame = CloseFrame {
                                code: CloseCode::from(code),
                                reason: reason.into(),
                            };
                            let _ = sink.send(WsMessage::Close(Some(frame))).await;
                        }
                        None => break,
                    },
                    incoming = stream.next() => match incoming {
                        Some(Ok(WsMessage::Text(text))) => {
                            let _ = event_tx.send(RawEvent::Message(WireFrame::Text(text)));
                        }
                        Some(Ok(WsMessage::Binary(data))) => {
                            let _ = event_tx.send(RawEvent::Message(
                                WireFrame::Binary(Bytes::from(data)),
                            ));
                        }
                        Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => {}
                        Some(Ok(WsMessage::Close(frame))) => {
                            state.store(STATE_CLOSED, Ordering::SeqCst);
                            let event = frame
                                .map(|f| CloseEvent::new(u16::from(f.code), f.reason.into_owned()))
                                .unwrap_or_else(|| CloseEvent::new(CLOSE_ABNORMAL, ""));
                            let _ = event_tx.send(RawEvent::Close(event));
                            break;
                        }
                        Some(Err(e)) => {
                            state.store(STATE_CLOSED, Ordering::SeqCst);
                            let _ = event_tx.send(RawEvent::Error(
                                TransportError::ReceiveFailed(e.to_string()),
                            ));
                            let _ = event_tx.send(RawEvent::Close(CloseEvent::new(CLOSE_ABNORMAL, "")));
                            break;
                        }
                        None => {
                            state.store(STATE_CLOSED, Ordering::SeqCst);
                            let _ = event_tx.send(RawEvent::Close(CloseEvent::new(CLOSE_ABNORMAL, "")));
                            break;
                        }
                    }
                }
            }
        });
    }

    fn send(&mut self, frame: WireFrame) {
        if let Some(tx) = &self.cmd_tx {
            if tx.send(Command::Send(frame)).is_err() {
                warn!("send on a finished websocket task dropped");
            }
        }
    }

    fn close(&mut self, code: u16, reason: &str) {
        if let Some(tx) = &self.cmd_tx {
            let _ = tx.send(Command::Close(code, reason.to_string()));
        }
    }

    fn ready_state(&self) -> TransportState {
        match self.state.load(Ordering::SeqCst) {
            STATE_CONNECTING => TransportState::Connecting,
            STATE_OPEN => TransportState::Open,
            STATE_CLOSING => TransportState::Closing,
            _ => TransportState::Closed,
        }
    }

    fn pump(&mut self) {
        let Some(events) = &self.events else { return };
        let Some(callbacks) = &self.callbacks else { return };
        while let Ok(event) = events.try_recv() {
            match event {
                RawEvent::Open => (callbacks.on_open)(),
                RawEvent::Message(frame) => (callbacks.on_message)(frame),
                RawEvent::Error(error) => (callbacks.on_error)(error),
                RawEvent::Close(event) => (callbacks.on_close)(event),
            }
        }
    }
}
