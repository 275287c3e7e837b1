//! Shared fixtures for the crate's tests.

use serde_json::{json, Value};

use tether_protocol::{serializer, Message};
use tether_transport::mock::{MockHandle, MockTransport};

use crate::channel::Channel;
use crate::config::{Params, SocketOptions};
use crate::socket::Socket;

/// A socket wired to an auto-opening mock transport, not yet connected.
pub(crate) fn socket_with_mock() -> (Socket, MockHandle) {
    let (factory, handle) = MockTransport::factory();
    handle.set_auto_open(true);
    let socket = Socket::new(
        "ws://example.test/socket",
        SocketOptions {
            transport: Some(factory),
            ..SocketOptions::default()
        },
    );
    (socket, handle)
}

/// A socket with its mock transport connected and open.
pub(crate) fn connected_socket() -> (Socket, MockHandle) {
    let (socket, handle) = socket_with_mock();
    socket.connect();
    socket.poll(0);
    assert!(socket.is_connected());
    (socket, handle)
}

/// Poll without advancing virtual time.
pub(crate) fn poll(socket: &Socket) {
    socket.poll(socket.now_ms());
}

/// Decode every frame the mock transport has sent, oldest first.
pub(crate) fn sent_messages(handle: &MockHandle) -> Vec<Message> {
    handle
        .sent()
        .iter()
        .map(|frame| serializer::decode(frame).expect("sent frame decodes"))
        .collect()
}

/// Emit a server reply envelope for a given ref.
pub(crate) fn reply(
    handle: &MockHandle,
    join_ref: Option<&str>,
    event_ref: &str,
    topic: &str,
    status: &str,
    response: Value,
) {
    let envelope = json!([
        join_ref,
        event_ref,
        topic,
        "phx_reply",
        {"status": status, "response": response}
    ]);
    handle.message_text(envelope.to_string());
}

/// Join a channel and ack the join server-side.
pub(crate) fn joined_channel(socket: &Socket, handle: &MockHandle, topic: &str) -> Channel {
    let channel = socket.channel(topic, Params::default());
    channel.join(None);
    poll(socket);
    let join_ref = channel.join_ref().expect("join assigns a ref");
    reply(handle, Some(&join_ref), &join_ref, topic, "ok", json!({}));
    poll(socket);
    assert!(channel.is_joined());
    channel
}
