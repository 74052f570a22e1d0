//! `Session`: owns one client↔server connection pairing directly, replacing
//! the source's cyclic layer/child references (§9 "Cyclic references") with
//! a single struct holding both `QuicLayer` specializations and the relay
//! between them.

use std::net::SocketAddr;
use std::time::Instant;

use crate::addons::{ProxyHooks, TlsData};
use crate::commands::Command;
use crate::config::ProxyRuntime;
use crate::engine::EngineEvent;
use crate::error::CoreResult;
use crate::events::{EngineHandle, Event};
use crate::layer::client::{ClientQuicLayer, FirstPacketOutcome};
use crate::layer::roaming::QuicRoamingLayer;
use crate::layer::server::{OpenConnectionCompleted, ServerQuicLayer};
use crate::layer::QuicLayer;
use crate::relay::StreamRelayLayer;
use crate::routing::SessionId;
use crate::wakeup::WakeupToken;

/// What sits between the two `QuicLayer`s, mirroring §2's composition
/// diagram ("NextLayer picks either StreamRelayLayer or a known protocol").
/// This crate only implements the generic relay; a higher-level protocol
/// (HTTP/3, raw TCP) would plug in here without changing anything below it.
enum NextLayer<H: ProxyHooks> {
    Relay(StreamRelayLayer<H>),
    /// Installed when an addon's `ignore_connection` fired: bytes pass
    /// through unmodified and no hooks observe them.
    PassThrough,
}

fn dispatch_relay<H: ProxyHooks>(relay: &mut NextLayer<H>, event: Event, from_client: bool) -> Vec<Command> {
    match relay {
        NextLayer::Relay(relay) => relay.step(event, from_client),
        NextLayer::PassThrough => Vec::new(),
    }
}

/// After driving a layer forward, check whether its handshake just completed
/// and, if so, hand the relay a live engine via `QuicStart` — mirroring the
/// original source's `event_to_child(QuicStart(...))` immediately following
/// `handle_handshake_completed`. This is the only place an engine handle
/// crosses from a `QuicLayer` to the sibling `StreamRelayLayer`.
fn forward_handshake_start<H: ProxyHooks>(
    base: &QuicLayer,
    relay: &mut NextLayer<H>,
    from_client: bool,
    was_established: bool,
) -> Vec<Command> {
    if !was_established && base.endpoint.tls_established {
        if let Some(engine) = base.engine.clone() {
            return dispatch_relay(relay, Event::QuicStart { engine }, from_client);
        }
    }
    Vec::new()
}

/// Translate the decoded engine events a `QuicLayer` handed back into the
/// events the relay actually understands, and dispatch them. A completed
/// handshake is already handled by `forward_handshake_start`; a termination
/// becomes `Event::ConnectionClosed` rather than a raw `QuicConnectionEvent`,
/// since the relay only knows how to react to the former.
fn forward_engine_events<H: ProxyHooks>(
    relay: &mut NextLayer<H>,
    events: Vec<EngineEvent>,
    from_client: bool,
) -> Vec<Command> {
    let mut commands = Vec::new();
    for engine_event in events {
        let relay_event = match engine_event {
            EngineEvent::HandshakeCompleted { .. } => continue,
            EngineEvent::ConnectionTerminated { .. } => Event::ConnectionClosed,
            other => Event::QuicConnectionEvent { event: other, from_client },
        };
        commands.extend(dispatch_relay(relay, relay_event, from_client));
    }
    commands
}

/// One client-facing/server-facing pairing, or a roaming splice standing in
/// for a client-facing layer that migrated.
enum SessionState<H: ProxyHooks + Clone> {
    Active {
        client: ClientQuicLayer<H>,
        server: ServerQuicLayer<H>,
        relay: NextLayer<H>,
    },
    Roaming(QuicRoamingLayer),
}

pub struct Session<H: ProxyHooks + Clone> {
    pub id: SessionId,
    state: SessionState<H>,
    local_sockname: SocketAddr,
}

impl<H: ProxyHooks + Clone> Session<H> {
    pub fn new(id: SessionId, runtime: ProxyRuntime, local_sockname: SocketAddr, hooks: H) -> Self {
        let client = ClientQuicLayer::new(id, runtime.clone(), hooks.clone());
        let server = ServerQuicLayer::new(id, runtime, hooks.clone());
        Self {
            id,
            state: SessionState::Active { client, server, relay: NextLayer::Relay(StreamRelayLayer::new(id, id, false, hooks)) },
            local_sockname,
        }
    }

    /// Replace this session's client-facing handling with a roaming splice
    /// onto `existing`, per SPEC_FULL.md §4.6 step 3 and §9's "in-flight
    /// commands must be flushed before swap-out" resolution: the caller is
    /// expected to have already drained `transmit()` on the displaced
    /// `ClientQuicLayer`/`ServerQuicLayer` before calling this, so no
    /// buffered outbound packet is lost in the swap.
    pub fn become_roaming(&mut self, existing: SessionId, peer_addr: SocketAddr) {
        self.state = SessionState::Roaming(QuicRoamingLayer::new(existing, peer_addr));
    }

    /// Bootstrap the very first datagram on a new flow against the
    /// client-facing layer. `make_engine` is supplied by the embedder, which
    /// is the only place that knows how to turn addon-supplied TLS settings
    /// into a concrete engine. On success, drains whatever the engine
    /// produced immediately and, if that already completed the handshake
    /// (vanishingly unlikely for a single Initial, but not ruled out),
    /// forwards `QuicStart` to the relay exactly as `drive` does later.
    pub fn start(
        &mut self,
        bytes: &[u8],
        from_addr: SocketAddr,
        now: Instant,
        make_engine: impl FnOnce(&TlsData, Option<Vec<u8>>) -> CoreResult<EngineHandle>,
    ) -> (Vec<Command>, FirstPacketOutcome) {
        let SessionState::Active { client, relay, .. } = &mut self.state else {
            return (Vec::new(), FirstPacketOutcome::Rejected);
        };

        let was_established = client.base.endpoint.tls_established;
        let (mut commands, outcome) =
            client.datagram_received(bytes, from_addr, self.local_sockname, now, make_engine);

        if matches!(outcome, FirstPacketOutcome::Handled) {
            let (more, child_events) = client.base.process_events(&mut client.hooks, now);
            commands.extend(more);
            commands.extend(forward_handshake_start(&client.base, relay, true, was_established));
            commands.extend(forward_engine_events(relay, child_events, true));
        }

        (commands, outcome)
    }

    /// Dial the real server once the client side has asked for it (the
    /// `Command::OpenConnection` the relay emits on `start()`). `dial` and
    /// `make_engine` are embedder-supplied for the same reason as in
    /// `start()`.
    pub fn open_server(
        &mut self,
        peer_addr: SocketAddr,
        now: Instant,
        dial: impl FnOnce(SocketAddr) -> Result<(), String>,
        make_engine: impl FnOnce(&TlsData, Option<Vec<u8>>) -> CoreResult<EngineHandle>,
    ) -> (Vec<Command>, OpenConnectionCompleted) {
        let SessionState::Active { server, relay, .. } = &mut self.state else {
            return (Vec::new(), OpenConnectionCompleted::Err("session is roaming".to_string()));
        };

        let was_established = server.base.endpoint.tls_established;
        let (mut commands, outcome) = server.open_connection(peer_addr, now, dial, make_engine);
        commands.extend(forward_handshake_start(&server.base, relay, false, was_established));

        (commands, outcome)
    }

    /// Drive one post-bootstrap event (a later datagram, a wakeup, or a
    /// transport close) against either side's `QuicLayer`, firing
    /// `TlsEstablished`/`TlsFailed` (inside `process_events`/
    /// `handle_connection_terminated`) and forwarding a completed handshake
    /// or termination to the relay.
    pub fn drive(&mut self, event: Event, from_client: bool, now: Instant) -> Vec<Command> {
        match &mut self.state {
            SessionState::Roaming(roaming) => match event {
                Event::DataReceived { bytes, from_addr } => roaming.data_received(bytes, from_addr),
                _ => Vec::new(),
            },
            SessionState::Active { client, server, relay } => {
                let (base, hooks): (&mut QuicLayer, &mut H) = if from_client {
                    (&mut client.base, &mut client.hooks)
                } else {
                    (&mut server.base, &mut server.hooks)
                };

                let was_established = base.endpoint.tls_established;
                let (mut commands, child_events) = base.handle_event(hooks, event, now);
                commands.extend(forward_handshake_start(base, relay, from_client, was_established));
                commands.extend(forward_engine_events(relay, child_events, from_client));
                commands
            }
        }
    }

    pub fn on_data_received(&mut self, bytes: Vec<u8>, from_addr: SocketAddr, now: Instant) -> Vec<Command> {
        self.drive(Event::DataReceived { bytes, from_addr }, true, now)
    }

    /// Same as `on_data_received`, for a datagram arriving from the real
    /// server rather than the real client.
    pub fn on_server_data_received(&mut self, bytes: Vec<u8>, from_addr: SocketAddr, now: Instant) -> Vec<Command> {
        self.drive(Event::DataReceived { bytes, from_addr }, false, now)
    }

    pub fn on_wakeup(&mut self, token: WakeupToken, from_client: bool, now: Instant) -> Vec<Command> {
        self.drive(Event::Wakeup(token), from_client, now)
    }

    pub fn on_connection_closed(&mut self, from_client: bool, now: Instant) -> Vec<Command> {
        self.drive(Event::ConnectionClosed, from_client, now)
    }

    /// Hand an addon-injected synthetic message straight to the relay.
    pub fn dispatch(&mut self, event: Event, from_client: bool) -> Vec<Command> {
        match &mut self.state {
            SessionState::Active { relay, .. } => dispatch_relay(relay, event, from_client),
            _ => Vec::new(),
        }
    }
}
