//! `StreamRelayLayer`: forwards datagrams and stream data between an
//! already-TLS-established client-facing and server-facing `QuicLayer`,
//! applying addon hooks and synchronizing lifecycle between the two sides.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::addons::ProxyHooks;
use crate::commands::Command;
use crate::engine::{error_code_to_str, is_success_error_code, EngineEvent};
use crate::events::{EngineHandle, Event};
use crate::flow::{TcpMessage, UdpFlow, UdpMessage};
use crate::routing::SessionId;
use crate::stream::QuicStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Ready,
    Done,
}

/// One side's worth of event buffering until its peer's engine is known.
#[derive(Default)]
struct PendingBuffer {
    events: Vec<EngineEvent>,
}

pub struct StreamRelayLayer<H: ProxyHooks> {
    state: State,
    ignore: bool,
    client_conn: SessionId,
    server_conn: SessionId,
    client_engine: Option<EngineHandle>,
    server_engine: Option<EngineHandle>,
    client_pending: PendingBuffer,
    server_pending: PendingBuffer,
    streams: HashMap<u64, QuicStream>,
    udp_flow: UdpFlow,
    hooks: H,
}

impl<H: ProxyHooks> StreamRelayLayer<H> {
    pub fn new(client_conn: SessionId, server_conn: SessionId, ignore: bool, hooks: H) -> Self {
        Self {
            state: State::Start,
            ignore,
            client_conn,
            server_conn,
            client_engine: None,
            server_engine: None,
            client_pending: PendingBuffer::default(),
            server_pending: PendingBuffer::default(),
            streams: HashMap::new(),
            udp_flow: UdpFlow::new(),
            hooks,
        }
    }

    /// Start the relay: emits the UDP-start hook and requests the server
    /// connection be opened, unless this pairing is ignored.
    pub fn start(&mut self) -> Vec<Command> {
        let mut commands = Vec::new();
        if self.ignore {
            self.state = State::Ready;
            return commands;
        }
        self.hooks.udp_start();
        commands.push(Command::OpenConnection { conn: self.server_conn });
        self.state = State::Ready;
        commands
    }

    pub fn step(&mut self, event: Event, from_client: bool) -> Vec<Command> {
        match self.state {
            State::Start => self.start(),
            State::Ready => self.step_ready(event, from_client),
            State::Done => Vec::new(),
        }
    }

    fn step_ready(&mut self, event: Event, from_client: bool) -> Vec<Command> {
        match event {
            Event::QuicStart { engine } => self.on_quic_start(engine, from_client),
            Event::QuicConnectionEvent { event, from_client } => {
                self.handle_engine_event(event, from_client)
            }
            Event::TcpMessageInjected { stream_id, bytes, end_stream, from_client } => {
                self.handle_engine_event(
                    EngineEvent::StreamDataReceived { stream_id, bytes, end_stream },
                    from_client,
                )
            }
            Event::UdpMessageInjected { bytes, from_client } => {
                self.handle_engine_event(EngineEvent::DatagramFrameReceived { bytes }, from_client)
            }
            Event::ConnectionClosed => self.on_connection_closed(from_client),
            _ => Vec::new(),
        }
    }

    fn on_quic_start(&mut self, engine: EngineHandle, from_client: bool) -> Vec<Command> {
        if from_client {
            self.client_engine = Some(engine);
        } else {
            self.server_engine = Some(engine);
        }

        let buffered = if from_client {
            std::mem::take(&mut self.server_pending.events)
        } else {
            std::mem::take(&mut self.client_pending.events)
        };

        let mut commands = Vec::new();
        for event in buffered {
            // These were buffered because the *other* side's engine wasn't
            // ready; replay them now attributed to their original producer.
            commands.extend(self.handle_engine_event(event, !from_client));
        }
        commands
    }

    fn peer_engine(&self, from_client: bool) -> Option<&EngineHandle> {
        if from_client {
            self.server_engine.as_ref()
        } else {
            self.client_engine.as_ref()
        }
    }

    fn peer_conn(&self, from_client: bool) -> SessionId {
        if from_client {
            self.server_conn
        } else {
            self.client_conn
        }
    }

    fn handle_engine_event(&mut self, event: EngineEvent, from_client: bool) -> Vec<Command> {
        if self.peer_engine(from_client).is_none() {
            debug!(from_client, "peer engine not yet ready, buffering event");
            if from_client {
                self.client_pending.events.push(event);
            } else {
                self.server_pending.events.push(event);
            }
            return Vec::new();
        }

        let mut commands = Vec::new();
        match event {
            EngineEvent::DatagramFrameReceived { bytes } => {
                let mut message = UdpMessage { from_client, content: bytes };
                self.hooks.udp_message(&mut message);
                let content = message.content.clone();
                self.udp_flow.messages.push(message);
                let peer = self.peer_engine(from_client).unwrap();
                let _ = peer.borrow_mut().send_datagram(&content);
            }
            EngineEvent::StreamDataReceived { stream_id, bytes, end_stream } => {
                if !self.streams.contains_key(&stream_id) {
                    self.hooks.tcp_start();
                    self.streams.insert(stream_id, QuicStream::new(stream_id, self.ignore));
                }
                let stream = self.streams.get_mut(&stream_id).unwrap();
                if stream.has_ended(from_client) {
                    warn!(stream_id, from_client, "data received on already-ended side, dropping");
                    return Vec::new();
                }
                let mut message = TcpMessage { from_client, content: bytes };
                self.hooks.tcp_message(&mut message);
                let content = message.content.clone();
                stream.flow.messages.push(message);

                let peer = self.peer_engine(from_client).unwrap();
                let _ = peer.borrow_mut().send_stream_data(stream_id, &content, end_stream);

                if end_stream {
                    let (both_ended, _) = stream.mark_ended(from_client, None);
                    if both_ended && stream.flow.error.is_none() {
                        self.hooks.tcp_end();
                    }
                }
            }
            EngineEvent::StreamReset { stream_id, error_code } => {
                let stream = self
                    .streams
                    .entry(stream_id)
                    .or_insert_with(|| QuicStream::new(stream_id, self.ignore));
                if stream.has_ended(from_client) {
                    return Vec::new();
                }
                let peer = self.peer_engine(from_client).unwrap();
                let _ = peer.borrow_mut().reset_stream(stream_id, error_code);
                let (both_ended, error_newly_set) =
                    stream.mark_ended(from_client, Some(error_code_to_str(error_code)));
                if error_newly_set {
                    let reason = stream.flow.error.clone().unwrap_or_default();
                    self.hooks.tcp_error(&reason);
                }
                if both_ended && stream.flow.error.is_none() {
                    self.hooks.tcp_end();
                }
            }
            other => {
                debug!(?other, "unhandled engine event in relay, dropping");
            }
        }

        commands.push(Command::RequestWakeup {
            conn: self.peer_conn(from_client),
            delta: std::time::Duration::ZERO,
        });
        commands
    }

    fn on_connection_closed(&mut self, from_client: bool) -> Vec<Command> {
        let reason = "Connection closed.".to_string();
        for (_, stream) in self.streams.iter_mut() {
            if !stream.has_ended(from_client) {
                let (_, error_newly_set) = stream.mark_ended(from_client, Some(reason.clone()));
                if error_newly_set {
                    self.hooks.tcp_error(&reason);
                }
            }
        }

        let both_down = self.client_engine.is_none() || self.server_engine.is_none();
        if both_down && self.udp_flow.error.is_none() {
            self.hooks.udp_end();
            self.udp_flow.live = false;
        }

        self.state = State::Done;
        Vec::new()
    }

    /// Propagate a peer-visible close: both sides get the same error code
    /// and reason when known; otherwise a plain close.
    pub fn propagate_close(&mut self, from_client: bool, error_code: u64, reason: String) -> Vec<Command> {
        if !is_success_error_code(error_code) {
            self.udp_flow.set_error_once(reason.clone());
            self.hooks.udp_error(&reason);
        }
        vec![Command::CloseConnection {
            conn: self.peer_conn(from_client),
            error_code,
            reason,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addons::NoopHooks;
    use crate::engine::FakeEngine;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn relay() -> StreamRelayLayer<NoopHooks> {
        StreamRelayLayer::new(1, 2, false, NoopHooks)
    }

    #[test]
    fn events_are_buffered_until_peer_engine_registered() {
        let mut relay = relay();
        let commands = relay.handle_engine_event(
            EngineEvent::StreamDataReceived { stream_id: 0, bytes: b"hi".to_vec(), end_stream: false },
            true,
        );
        assert!(commands.is_empty());
        assert_eq!(relay.client_pending.events.len(), 1);
    }

    #[test]
    fn buffered_events_flush_on_quic_start_in_order() {
        let mut relay = relay();
        relay.handle_engine_event(
            EngineEvent::StreamDataReceived { stream_id: 0, bytes: b"first".to_vec(), end_stream: false },
            true,
        );
        relay.handle_engine_event(
            EngineEvent::StreamDataReceived { stream_id: 0, bytes: b"second".to_vec(), end_stream: false },
            true,
        );

        let server_engine: EngineHandle = Rc::new(RefCell::new(FakeEngine::new()));
        relay.on_quic_start(server_engine.clone(), false);

        let sent = &server_engine.borrow().sent_stream_data;
        assert!(sent.is_empty(), "server engine shouldn't receive client-originated data yet");

        let client_engine: EngineHandle = Rc::new(RefCell::new(FakeEngine::new()));
        relay.on_quic_start(client_engine, true);

        let fake = server_engine.borrow();
        assert_eq!(fake.sent_stream_data.len(), 2);
        assert_eq!(fake.sent_stream_data[0].1, b"first");
        assert_eq!(fake.sent_stream_data[1].1, b"second");
    }

    #[test]
    fn mutated_stream_data_reaches_peer_unmutated_bytes_by_default() {
        let mut relay = relay();
        let client_engine: EngineHandle = Rc::new(RefCell::new(FakeEngine::new()));
        let server_engine: EngineHandle = Rc::new(RefCell::new(FakeEngine::new()));
        relay.on_quic_start(client_engine, true);
        relay.on_quic_start(server_engine.clone(), false);

        relay.handle_engine_event(
            EngineEvent::StreamDataReceived { stream_id: 0, bytes: b"ABC".to_vec(), end_stream: false },
            true,
        );

        let fake = server_engine.borrow();
        assert_eq!(fake.sent_stream_data[0], (0, b"ABC".to_vec(), false));
    }

    #[test]
    fn end_stream_marks_side_ended() {
        let mut relay = relay();
        let client_engine: EngineHandle = Rc::new(RefCell::new(FakeEngine::new()));
        let server_engine: EngineHandle = Rc::new(RefCell::new(FakeEngine::new()));
        relay.on_quic_start(client_engine, true);
        relay.on_quic_start(server_engine, false);

        relay.handle_engine_event(
            EngineEvent::StreamDataReceived { stream_id: 0, bytes: Vec::new(), end_stream: true },
            true,
        );

        assert!(relay.streams.get(&0).unwrap().has_ended(true));
    }

    #[test]
    fn data_on_already_ended_side_is_dropped() {
        let mut relay = relay();
        let client_engine: EngineHandle = Rc::new(RefCell::new(FakeEngine::new()));
        let server_engine: EngineHandle = Rc::new(RefCell::new(FakeEngine::new()));
        relay.on_quic_start(client_engine, true);
        relay.on_quic_start(server_engine.clone(), false);

        relay.handle_engine_event(
            EngineEvent::StreamDataReceived { stream_id: 0, bytes: Vec::new(), end_stream: true },
            true,
        );
        relay.handle_engine_event(
            EngineEvent::StreamDataReceived { stream_id: 0, bytes: b"late".to_vec(), end_stream: false },
            true,
        );

        let fake = server_engine.borrow();
        assert_eq!(fake.sent_stream_data.len(), 1);
    }
}
