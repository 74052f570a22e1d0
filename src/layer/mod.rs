//! The `QuicLayer` base behavior shared by the client-facing and
//! server-facing specializations, plus the roaming splice.

pub mod client;
pub mod roaming;
pub mod server;

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::addons::{ProxyHooks, TlsData, TlsEstablishedData, TlsFailedData};
use crate::commands::Command;
use crate::config::ProxyRuntime;
use crate::engine::{is_success_error_code, EngineEvent, OutgoingDatagram, QuicEngineAdapter};
use crate::error::CoreResult;
use crate::events::{EngineHandle, Event};
use crate::routing::{CidKey, RouteTable, SessionId};
use crate::wakeup::WakeupRegistry;

/// One side of a proxied session: the addon-visible state a `QuicLayer`
/// accumulates as TLS progresses.
#[derive(Debug, Clone, Default)]
pub struct Endpoint {
    pub peer_addr: Option<SocketAddr>,
    pub sni: Option<String>,
    /// ALPN protocols this side is willing to offer, known before TLS starts
    /// (from the original ClientHello, for the client-facing side).
    pub alpn_offers: Vec<Vec<u8>>,
    /// The single protocol negotiated once the handshake completes.
    pub alpn: Option<Vec<u8>>,
    pub tls_established: bool,
    pub certificate_chain: Vec<Vec<u8>>,
    pub tls_setup_timestamp: Option<Instant>,
    pub error: Option<String>,
    pub connected: bool,
}

/// Which role this `QuicLayer` plays: `Client` terminates inbound QUIC from
/// the real client, `Server` originates outbound QUIC to the real server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Base fields and behavior common to `ClientQuicLayer` and
/// `ServerQuicLayer` (SPEC_FULL.md §4.4). The specializations hold one of
/// these and delegate event/command handling to it, adding their own
/// role-specific bootstrap on top — the Rust equivalent of the source's
/// base-class / subclass split, without inheritance.
pub struct QuicLayer {
    pub id: SessionId,
    pub role: Role,
    pub endpoint: Endpoint,
    pub engine: Option<EngineHandle>,
    pub tls_started: bool,
    pub wakeups: WakeupRegistry,
    pub routes: RouteTable,
    pub runtime: ProxyRuntime,
}

impl QuicLayer {
    pub fn new(id: SessionId, role: Role, runtime: ProxyRuntime) -> Self {
        Self {
            id,
            role,
            endpoint: Endpoint::default(),
            engine: None,
            tls_started: false,
            wakeups: WakeupRegistry::new(),
            routes: RouteTable::new(),
            runtime,
        }
    }

    /// Dispatch one event against this side's engine. Returns the commands
    /// to forward upward plus the decoded data events the child layer
    /// should see (only non-empty once this side's handshake has
    /// completed — see `process_events`).
    pub fn handle_event<H: ProxyHooks>(
        &mut self,
        hooks: &mut H,
        event: Event,
        now: Instant,
    ) -> (Vec<Command>, Vec<EngineEvent>) {
        match event {
            Event::DataReceived { bytes, from_addr } if self.engine.is_some() => {
                {
                    let engine = self.engine.as_ref().unwrap();
                    engine.borrow_mut().feed_datagram(&bytes, from_addr, now);
                }
                self.process_events(hooks, now)
            }
            Event::ConnectionClosed if self.engine.is_some() => {
                self.force_terminate("UDP connection closed or timed out.");
                self.process_events(hooks, now)
            }
            Event::Wakeup(token) => {
                if self.wakeups.fire(token) {
                    if let Some(engine) = self.engine.clone() {
                        engine.borrow_mut().handle_timer(now);
                        return self.process_events(hooks, now);
                    }
                }
                (Vec::new(), Vec::new())
            }
            _ => (Vec::new(), Vec::new()),
        }
    }

    /// Filter a command emitted by the child layer before it reaches the
    /// I/O runtime. `Transmit` requests are consumed here (they only make
    /// sense relative to this layer's own engine); a `CloseConnection` for
    /// our engine is applied locally rather than forwarded, since the
    /// engine will emit its own `ConnectionTerminated` and subsequent
    /// packets still need to go out.
    pub fn handle_command<H: ProxyHooks>(&mut self, hooks: &mut H, command: Command, now: Instant) -> Vec<Command> {
        match command {
            Command::CloseConnection { conn, error_code, reason } if conn == self.id => {
                if let Some(engine) = self.engine.clone() {
                    engine.borrow_mut().close(error_code, reason.as_bytes());
                    self.process_events(hooks, now).0
                } else {
                    vec![Command::CloseConnection { conn, error_code, reason }]
                }
            }
            other => vec![other],
        }
    }

    fn force_terminate(&mut self, reason: &str) {
        if let Some(engine) = &self.engine {
            engine.borrow_mut().push_synthetic_termination(reason);
        }
    }

    /// Drain engine events in arrival order, translate terminal ones into
    /// endpoint-state updates, forward data events to the child once the
    /// handshake has completed, and finish with a `transmit()`.
    ///
    /// A `ConnectionTerminated` stops the drain early (matching the
    /// source's generator contract): later events in the same batch are
    /// left for the next `poll` and `transmit()` is still called so any
    /// final close packet is flushed. Returns the commands to forward
    /// upward and the data events the owning `Session` should hand to the
    /// child layer — callers that care about `HandshakeCompleted`/
    /// `ConnectionTerminated` for hook dispatch read `self.endpoint`
    /// afterward rather than matching on the returned events.
    pub fn process_events<H: ProxyHooks>(&mut self, hooks: &mut H, now: Instant) -> (Vec<Command>, Vec<EngineEvent>) {
        let Some(engine) = self.engine.clone() else {
            return (Vec::new(), Vec::new());
        };

        let events = engine.borrow_mut().drain_events();
        let mut child_events = Vec::new();

        for event in events {
            match event {
                EngineEvent::ConnectionIdIssued { ref cid } => self.on_cid_issued(cid),
                EngineEvent::ConnectionIdRetired { ref cid } => self.on_cid_retired(cid),
                EngineEvent::HandshakeCompleted { ref alpn, ref cipher, ref certificate_chain, .. } => {
                    self.endpoint.alpn = alpn.clone();
                    self.endpoint.tls_established = true;
                    self.endpoint.tls_setup_timestamp = Some(now);
                    self.endpoint.certificate_chain = certificate_chain.clone();
                    info!(session = self.id, role = ?self.role, "TLS established");

                    let established = TlsEstablishedData {
                        sni: self.endpoint.sni.clone(),
                        alpn: alpn.clone(),
                        tls_version: "QUIC".to_string(),
                        cipher: cipher.clone(),
                        certificate_chain: certificate_chain.clone(),
                    };
                    match self.role {
                        Role::Client => hooks.tls_established_client(&established),
                        Role::Server => hooks.tls_established_server(&established),
                    }

                    child_events.push(event);
                }
                EngineEvent::ConnectionTerminated { error_code, ref reason, .. } => {
                    self.handle_connection_terminated(hooks, reason);
                    if !is_success_error_code(error_code) {
                        warn!(session = self.id, error_code, reason, "connection terminated");
                    }
                    child_events.push(event);
                    break;
                }
                ref other => {
                    // Only forwarded to the child once the handshake has
                    // completed; earlier data events can't happen on a
                    // sans-IO engine before its own handshake finishes.
                    if self.endpoint.tls_established {
                        child_events.push(other.clone());
                    }
                }
            }
        }

        let commands = self.transmit(now);
        (commands, child_events)
    }

    fn on_cid_issued(&mut self, cid: &[u8]) {
        if let Some(sockname) = self.endpoint.peer_addr {
            let key = CidKey::new(sockname, cid);
            if let Err(err) = self.runtime.cid_table.insert(key, self.id) {
                error!(session = self.id, %err, "connection id issued but already owned");
            }
        }
    }

    fn on_cid_retired(&mut self, cid: &[u8]) {
        if let Some(sockname) = self.endpoint.peer_addr {
            self.runtime.cid_table.remove(&CidKey::new(sockname, cid));
        }
    }

    /// Consult the addon for TLS settings and construct this side's engine.
    /// `odcid` is the original destination connection id: required for the
    /// server-role (client-facing) endpoint, absent for the client-role
    /// (server-facing) one. Returns `false` (and logs) if the addon left
    /// `settings` unset or engine construction failed.
    pub fn start_tls<H: ProxyHooks>(
        &mut self,
        hooks: &mut H,
        odcid: Option<Vec<u8>>,
        make_engine: impl FnOnce(&TlsData, Option<Vec<u8>>) -> CoreResult<EngineHandle>,
    ) -> bool {
        let mut data = TlsData {
            sni: self.endpoint.sni.clone(),
            alpn_offers: self.endpoint.alpn_offers.clone(),
            settings: None,
        };

        match self.role {
            Role::Client => hooks.quic_tls_start_client(&mut data),
            Role::Server => hooks.quic_tls_start_server(&mut data),
        }

        if data.settings.is_none() {
            error!(session = self.id, role = ?self.role, "TLS settings hook left settings unset");
            return false;
        }

        self.tls_started = true;

        match make_engine(&data, odcid) {
            Ok(engine) => {
                if let (Some(cid), Some(sockname)) = (engine.borrow().host_cid(), self.endpoint.peer_addr) {
                    let key = CidKey::new(sockname, &cid);
                    if let Err(err) = self.runtime.cid_table.insert(key, self.id) {
                        error!(session = self.id, %err, "host connection id already owned");
                    }
                }
                self.engine = Some(engine);
                true
            }
            Err(err) => {
                error!(session = self.id, %err, "failed to construct QUIC engine");
                false
            }
        }
    }

    fn handle_connection_terminated<H: ProxyHooks>(&mut self, hooks: &mut H, reason: &str) {
        if !self.endpoint.tls_established {
            self.endpoint.error = Some(reason.to_string());
            let failed = TlsFailedData { reason: reason.to_string() };
            match self.role {
                Role::Client => hooks.tls_failed_client(&failed),
                Role::Server => hooks.tls_failed_server(&failed),
            }
        }
        self.engine = None;
    }

    /// Drain outgoing packets, routing each either to the endpoint's primary
    /// peer or through this layer's route table (populated by roaming), and
    /// re-arm the wakeup timer to the engine's next deadline.
    pub fn transmit(&mut self, now: Instant) -> Vec<Command> {
        let Some(engine) = self.engine.clone() else {
            return Vec::new();
        };

        let mut commands = Vec::new();
        let packets: Vec<OutgoingDatagram> = engine.borrow_mut().pending_packets(now);
        for OutgoingDatagram { bytes, to_addr } in packets {
            if Some(to_addr) == self.endpoint.peer_addr {
                commands.push(Command::SendData { conn: self.id, bytes });
            } else if let Some(handler) = self.routes.lookup(&to_addr) {
                commands.push(Command::SendData { conn: handler, bytes });
            } else {
                warn!(session = self.id, %to_addr, "no route for outgoing packet, dropping");
            }
        }

        let deadline = engine.borrow().next_deadline();
        if let Some(deadline) = deadline {
            if let Some(token) = self.wakeups.arm(deadline) {
                let _ = token;
                let delta = deadline.saturating_duration_since(now);
                commands.push(Command::RequestWakeup { conn: self.id, delta });
            }
        }

        commands
    }
}

/// Wakeup deadline arithmetic helper so `Instant::duration_since` never
/// panics on a deadline that is already in the past.
trait SaturatingSince {
    fn saturating_duration_since(&self, earlier: Instant) -> Duration;
}

impl SaturatingSince for Instant {
    fn saturating_duration_since(&self, earlier: Instant) -> Duration {
        self.checked_duration_since(earlier).unwrap_or(Duration::ZERO)
    }
}

/// Extension the production engine adapter implements to synthesize a
/// `ConnectionTerminated` event for a transport-level close with no prior
/// termination event (§4.4: "force-terminate the engine").
pub trait SyntheticTermination {
    fn push_synthetic_termination(&mut self, reason: &str);
}

impl<T: QuicEngineAdapter + ?Sized> SyntheticTermination for T {
    fn push_synthetic_termination(&mut self, reason: &str) {
        self.close(0x0, reason.as_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxyOptions, ProxyRuntime};
    use crate::engine::FakeEngine;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn layer() -> QuicLayer {
        QuicLayer::new(1, Role::Client, ProxyRuntime::new(ProxyOptions::default()))
    }

    #[test]
    fn transmit_with_no_engine_is_a_noop() {
        let mut l = layer();
        assert!(l.transmit(Instant::now()).is_empty());
    }

    #[test]
    fn transmit_routes_to_primary_peer() {
        let mut l = layer();
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        l.endpoint.peer_addr = Some(addr);
        let engine = Rc::new(RefCell::new(FakeEngine::new()));
        engine.borrow_mut().outgoing.push(OutgoingDatagram { bytes: vec![1, 2, 3], to_addr: addr });
        l.engine = Some(engine);

        let commands = l.transmit(Instant::now());
        assert!(matches!(&commands[0], Command::SendData { conn, .. } if *conn == l.id));
    }

    #[test]
    fn transmit_drops_unrouted_packet() {
        let mut l = layer();
        let primary: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let other: SocketAddr = "127.0.0.1:2".parse().unwrap();
        l.endpoint.peer_addr = Some(primary);
        let engine = Rc::new(RefCell::new(FakeEngine::new()));
        engine.borrow_mut().outgoing.push(OutgoingDatagram { bytes: vec![9], to_addr: other });
        l.engine = Some(engine);

        let commands = l.transmit(Instant::now());
        assert!(commands.is_empty());
    }

    #[test]
    fn transmit_uses_route_table_for_migrated_peer() {
        let mut l = layer();
        let primary: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let migrated: SocketAddr = "127.0.0.1:2".parse().unwrap();
        l.endpoint.peer_addr = Some(primary);
        l.routes.add_route(migrated, 42);
        let engine = Rc::new(RefCell::new(FakeEngine::new()));
        engine.borrow_mut().outgoing.push(OutgoingDatagram { bytes: vec![9], to_addr: migrated });
        l.engine = Some(engine);

        let commands = l.transmit(Instant::now());
        assert!(matches!(&commands[0], Command::SendData { conn, .. } if *conn == 42));
    }
}
