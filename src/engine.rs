//! The boundary between this crate and the underlying QUIC/TLS engine.
//!
//! [`QuicEngineAdapter`] is the sans-IO seam: feed datagrams in, drain
//! packets and events out, drive a single deadline timer. The production
//! implementation wraps a `quinn-proto` `Connection`; tests drive
//! [`FakeEngine`] instead, so layer logic never needs a real socket or a
//! real TLS handshake to exercise.

use std::net::SocketAddr;
use std::time::Instant;

use crate::error::CoreResult;

/// Events the adapter surfaces after a `feed_datagram`/`handle_timer` call.
/// This is a deliberately narrow projection of the underlying engine's own
/// event type — see §4.1: any event outside this set is a bug in the
/// adapter, not something the layers need to handle.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    ConnectionIdIssued { cid: Vec<u8> },
    ConnectionIdRetired { cid: Vec<u8> },
    HandshakeCompleted {
        alpn: Option<Vec<u8>>,
        early_data_accepted: bool,
        session_resumed: bool,
        cipher: Option<String>,
        certificate_chain: Vec<Vec<u8>>,
    },
    ConnectionTerminated {
        error_code: u64,
        frame_type: Option<u64>,
        reason: String,
    },
    /// Forwarded internally to keep the real engine's keepalive bookkeeping
    /// honest; never forwarded to a child layer (see SPEC_FULL.md §9).
    PingAcknowledged,
    /// ALPN is read off `HandshakeCompleted` instead; kept only for parity
    /// with the underlying engine's event stream.
    ProtocolNegotiated,
    DatagramFrameReceived { bytes: Vec<u8> },
    StreamDataReceived {
        stream_id: u64,
        bytes: Vec<u8>,
        end_stream: bool,
    },
    StreamReset { stream_id: u64, error_code: u64 },
}

/// NO_ERROR and the HTTP/3 equivalent H3_NO_ERROR are not failures.
pub const QUIC_NO_ERROR: u64 = 0x0;
pub const H3_NO_ERROR: u64 = 0x100;

pub fn is_success_error_code(code: u64) -> bool {
    code == QUIC_NO_ERROR || code == H3_NO_ERROR
}

pub fn error_code_to_str(code: u64) -> String {
    match code {
        QUIC_NO_ERROR => "NO_ERROR".to_string(),
        H3_NO_ERROR => "H3_NO_ERROR".to_string(),
        other => format!("0x{other:x}"),
    }
}

/// A decoded datagram ready to send, paired with its destination.
#[derive(Debug, Clone)]
pub struct OutgoingDatagram {
    pub bytes: Vec<u8>,
    pub to_addr: SocketAddr,
}

/// Shape a production adapter must provide. Kept intentionally close to the
/// `handle_event`/`poll_transmit`/`poll`/`poll_timeout` contract `quinn-proto`
/// exposes on its own `Connection`, so wrapping it is a thin translation
/// layer rather than a redesign.
pub trait QuicEngineAdapter {
    /// Feed one inbound, already header-protection-intact datagram.
    fn feed_datagram(&mut self, bytes: &[u8], from_addr: SocketAddr, now: Instant);

    /// Drain every event produced since the last drain, in arrival order.
    fn drain_events(&mut self) -> Vec<EngineEvent>;

    /// Drain every outbound datagram queued since the last drain.
    fn pending_packets(&mut self, now: Instant) -> Vec<OutgoingDatagram>;

    /// The next instant this engine needs `handle_timer` called, if any.
    fn next_deadline(&self) -> Option<Instant>;

    /// Advance internal timers (retransmission, idle, keepalive).
    fn handle_timer(&mut self, now: Instant);

    /// Ask the engine to close with an application-level reason.
    fn close(&mut self, error_code: u64, reason: &[u8]);

    /// This endpoint's current host connection id, if assigned.
    fn host_cid(&self) -> Option<Vec<u8>>;

    /// Open the transport-level connection (server-role adapters dial out
    /// once TLS settings and a peer address are known).
    fn connect(&mut self, peer_addr: SocketAddr, now: Instant) -> CoreResult<()>;

    /// Send a datagram frame on this connection.
    fn send_datagram(&mut self, bytes: &[u8]) -> CoreResult<()>;

    /// Send stream data, optionally ending the stream.
    fn send_stream_data(&mut self, stream_id: u64, bytes: &[u8], end_stream: bool) -> CoreResult<()>;

    /// Reset an outgoing stream with the given application error code.
    fn reset_stream(&mut self, stream_id: u64, error_code: u64) -> CoreResult<()>;
}

/// An in-memory, deterministic stand-in for a real engine, used by layer and
/// relay unit tests. Events and outgoing packets are injected/queued
/// directly by the test rather than being produced by a real handshake.
#[derive(Default)]
pub struct FakeEngine {
    pub events: std::collections::VecDeque<EngineEvent>,
    pub outgoing: Vec<OutgoingDatagram>,
    pub sent_datagrams: Vec<Vec<u8>>,
    pub sent_stream_data: Vec<(u64, Vec<u8>, bool)>,
    pub reset_streams: Vec<(u64, u64)>,
    pub closed: Option<(u64, Vec<u8>)>,
    pub host_cid: Option<Vec<u8>>,
    pub deadline: Option<Instant>,
    pub fed: Vec<Vec<u8>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_event(&mut self, event: EngineEvent) {
        self.events.push_back(event);
    }
}

impl QuicEngineAdapter for FakeEngine {
    fn feed_datagram(&mut self, bytes: &[u8], _from_addr: SocketAddr, _now: Instant) {
        self.fed.push(bytes.to_vec());
    }

    fn drain_events(&mut self) -> Vec<EngineEvent> {
        self.events.drain(..).collect()
    }

    fn pending_packets(&mut self, _now: Instant) -> Vec<OutgoingDatagram> {
        std::mem::take(&mut self.outgoing)
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    fn handle_timer(&mut self, _now: Instant) {}

    fn close(&mut self, error_code: u64, reason: &[u8]) {
        self.closed = Some((error_code, reason.to_vec()));
    }

    fn host_cid(&self) -> Option<Vec<u8>> {
        self.host_cid.clone()
    }

    fn connect(&mut self, _peer_addr: SocketAddr, _now: Instant) -> CoreResult<()> {
        Ok(())
    }

    fn send_datagram(&mut self, bytes: &[u8]) -> CoreResult<()> {
        self.sent_datagrams.push(bytes.to_vec());
        Ok(())
    }

    fn send_stream_data(&mut self, stream_id: u64, bytes: &[u8], end_stream: bool) -> CoreResult<()> {
        self.sent_stream_data.push((stream_id, bytes.to_vec(), end_stream));
        Ok(())
    }

    fn reset_stream(&mut self, stream_id: u64, error_code: u64) -> CoreResult<()> {
        self.reset_streams.push((stream_id, error_code));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_error_codes() {
        assert!(is_success_error_code(QUIC_NO_ERROR));
        assert!(is_success_error_code(H3_NO_ERROR));
        assert!(!is_success_error_code(0x101));
    }

    #[test]
    fn fake_engine_roundtrips_stream_data() {
        let mut engine = FakeEngine::new();
        engine.send_stream_data(4, b"hi", false).unwrap();
        assert_eq!(engine.sent_stream_data, vec![(4, b"hi".to_vec(), false)]);
    }

    #[test]
    fn fake_engine_drains_events_in_order() {
        let mut engine = FakeEngine::new();
        engine.push_event(EngineEvent::PingAcknowledged);
        engine.push_event(EngineEvent::ProtocolNegotiated);
        let drained = engine.drain_events();
        assert!(matches!(drained[0], EngineEvent::PingAcknowledged));
        assert!(matches!(drained[1], EngineEvent::ProtocolNegotiated));
        assert!(engine.drain_events().is_empty());
    }
}
