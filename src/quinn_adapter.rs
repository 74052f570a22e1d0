//! [`QuinnEngineAdapter`]: the production [`QuicEngineAdapter`], wrapping a
//! single `quinn-proto` [`Connection`](quinn_proto::Connection) plus the
//! shared [`Endpoint`](quinn_proto::Endpoint) it was handed off by.
//!
//! `quinn-proto` is sans-IO by design — it never touches a socket, it only
//! consumes datagrams and produces datagrams plus an event stream — which is
//! exactly the seam [`QuicEngineAdapter`] describes. This adapter's whole
//! job is translating between `quinn-proto`'s event/stream vocabulary and
//! this crate's narrower [`EngineEvent`] projection.

use std::net::SocketAddr;
use std::time::Instant;

use quinn_proto::{
    ConnectionHandle, Dir, Event as ProtoEvent, StreamEvent, StreamId, VarInt,
};
use tracing::{debug, warn};

use crate::engine::{EngineEvent, OutgoingDatagram, QuicEngineAdapter};
use crate::error::{CoreError, CoreResult};

/// Read-side buffer size handed to `quinn_proto::Connection::read` per call.
/// Matches the datagram MTU the rest of this crate assumes (§4.1's
/// `MAX_UDP_PAYLOAD_SIZE`); a single read never needs more than that.
const STREAM_READ_CHUNK: usize = 1500;

pub struct QuinnEngineAdapter {
    handle: ConnectionHandle,
    connection: quinn_proto::Connection,
    endpoint: quinn_proto::Endpoint,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    transmit_buf: Vec<u8>,
}

impl QuinnEngineAdapter {
    /// Wrap an already-accepted or already-dialed `quinn_proto::Connection`.
    /// Construction (accepting via `Endpoint::handle` / dialing via
    /// `Endpoint::connect`) happens at the call site in the embedder, which
    /// is the only place that knows the `ServerConfig`/`ClientConfig` the
    /// addon-supplied [`TlsSettings`](crate::addons::TlsSettings) translate
    /// into.
    pub fn new(
        handle: ConnectionHandle,
        connection: quinn_proto::Connection,
        endpoint: quinn_proto::Endpoint,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Self {
        Self {
            handle,
            connection,
            endpoint,
            local_addr,
            peer_addr,
            transmit_buf: vec![0u8; 65535],
        }
    }

    fn translate_event(&mut self, event: ProtoEvent) -> Option<EngineEvent> {
        match event {
            ProtoEvent::HandshakeDataReady => None,
            ProtoEvent::Connected => None,
            ProtoEvent::ConnectionLost { reason } => Some(EngineEvent::ConnectionTerminated {
                error_code: reason_to_error_code(&reason),
                frame_type: None,
                reason: reason.to_string(),
            }),
            ProtoEvent::Stream(StreamEvent::Opened { dir: Dir::Bi }) | ProtoEvent::Stream(StreamEvent::Opened { dir: Dir::Uni }) => {
                // Readable data is picked up the next time `poll` surfaces a
                // `StreamEvent::Readable` for this id; nothing to translate
                // on open alone.
                None
            }
            ProtoEvent::Stream(StreamEvent::Readable { id }) => self.read_stream(id),
            ProtoEvent::Stream(StreamEvent::Finished { id }) => Some(EngineEvent::StreamDataReceived {
                stream_id: stream_id_to_u64(id),
                bytes: Vec::new(),
                end_stream: true,
            }),
            ProtoEvent::Stream(StreamEvent::Stopped { id, error_code }) => Some(EngineEvent::StreamReset {
                stream_id: stream_id_to_u64(id),
                error_code: error_code.into_inner(),
            }),
            ProtoEvent::Stream(StreamEvent::Available { .. }) | ProtoEvent::Stream(StreamEvent::Writable { .. }) => None,
            ProtoEvent::DatagramReceived => {
                self.connection.datagrams().recv().map(|bytes| EngineEvent::DatagramFrameReceived { bytes: bytes.to_vec() })
            }
            ProtoEvent::DatagramsUnblocked => None,
            ProtoEvent::HandshakeCompleted | ProtoEvent::Handshaked { .. } => {
                let alpn = self.connection.handshake_data().and_then(|data| {
                    data.downcast::<quinn_proto::crypto::rustls::HandshakeData>().ok()
                }).and_then(|data| data.protocol);
                // quinn-proto doesn't surface the negotiated cipher suite name
                // through `handshake_data()`; left unset until upstream adds it.
                let cipher = None;
                let certificate_chain = self
                    .connection
                    .peer_identity()
                    .and_then(|identity| identity.downcast::<Vec<rustls_pki_types::CertificateDer<'static>>>().ok())
                    .map(|certs| certs.iter().map(|cert| cert.as_ref().to_vec()).collect())
                    .unwrap_or_default();
                Some(EngineEvent::HandshakeCompleted {
                    alpn,
                    early_data_accepted: self.connection.accepted_0rtt(),
                    session_resumed: false,
                    cipher,
                    certificate_chain,
                })
            }
        }
    }

    fn read_stream(&mut self, id: StreamId) -> Option<EngineEvent> {
        let mut recv = self.connection.recv_stream(id);
        let mut chunks = match recv.read(true) {
            Ok(chunks) => chunks,
            Err(err) => {
                warn!(?err, "failed to open stream read handle");
                return None;
            }
        };

        let mut bytes = Vec::with_capacity(STREAM_READ_CHUNK);
        let mut end_stream = false;
        loop {
            match chunks.next(STREAM_READ_CHUNK) {
                Ok(Some(chunk)) => bytes.extend_from_slice(&chunk.bytes),
                Ok(None) => {
                    end_stream = true;
                    break;
                }
                Err(_) => break,
            }
        }
        let _ = chunks.finalize();

        if bytes.is_empty() && !end_stream {
            return None;
        }
        Some(EngineEvent::StreamDataReceived { stream_id: stream_id_to_u64(id), bytes, end_stream })
    }
}

impl QuicEngineAdapter for QuinnEngineAdapter {
    fn feed_datagram(&mut self, bytes: &[u8], from_addr: SocketAddr, now: Instant) {
        let ecn = None;
        if let Some(event) = self.endpoint.handle(now, from_addr, Some(self.local_addr.ip()), ecn, bytes.into(), &mut self.transmit_buf) {
            match event {
                quinn_proto::DatagramEvent::ConnectionEvent(handle, conn_event) => {
                    debug_assert_eq!(handle, self.handle);
                    self.connection.handle_event(conn_event);
                }
                quinn_proto::DatagramEvent::NewConnection(_incoming) => {
                    debug!("unexpected new-connection datagram routed to an established adapter, dropping");
                }
                quinn_proto::DatagramEvent::Response(_transmit) => {
                    // Endpoint answered directly (e.g. a stateless reset);
                    // the embedder's `Endpoint::handle` caller is
                    // responsible for sending this when it owns the socket.
                }
            }
        }
    }

    fn drain_events(&mut self) -> Vec<EngineEvent> {
        let mut out = Vec::new();
        while let Some(event) = self.connection.poll() {
            if let Some(translated) = self.translate_event(event) {
                out.push(translated);
            }
        }
        out
    }

    fn pending_packets(&mut self, now: Instant) -> Vec<OutgoingDatagram> {
        let mut out = Vec::new();
        while let Some(transmit) = self.connection.poll_transmit(now, 1, &mut self.transmit_buf) {
            out.push(OutgoingDatagram {
                bytes: self.transmit_buf[..transmit.size].to_vec(),
                to_addr: transmit.destination,
            });
        }
        out
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.connection.poll_timeout()
    }

    fn handle_timer(&mut self, now: Instant) {
        self.connection.handle_timeout(now);
    }

    fn close(&mut self, error_code: u64, reason: &[u8]) {
        self.connection.close(Instant::now(), VarInt::from_u64(error_code).unwrap_or(VarInt::from_u32(0)), reason.into());
    }

    fn host_cid(&self) -> Option<Vec<u8>> {
        // `quinn-proto` hands out fresh CIDs over time via
        // `ConnectionIdIssued`, tracked in `QuicLayer::on_cid_issued`; there
        // is no single "current" id to read back off the connection once
        // the handshake has progressed past the first one.
        None
    }

    fn connect(&mut self, peer_addr: SocketAddr, _now: Instant) -> CoreResult<()> {
        if peer_addr != self.peer_addr {
            return Err(CoreError::EngineConfig(format!(
                "adapter constructed for {} but asked to connect to {}",
                self.peer_addr, peer_addr
            )));
        }
        Ok(())
    }

    fn send_datagram(&mut self, bytes: &[u8]) -> CoreResult<()> {
        self.connection
            .datagrams()
            .send(bytes.to_vec().into(), false)
            .map_err(|err| CoreError::EngineConfig(err.to_string()))
    }

    fn send_stream_data(&mut self, stream_id: u64, bytes: &[u8], end_stream: bool) -> CoreResult<()> {
        let id = u64_to_stream_id(stream_id);
        let mut send = self.connection.send_stream(id);
        send.write(bytes).map_err(|err| CoreError::EngineConfig(err.to_string()))?;
        if end_stream {
            send.finish().map_err(|err| CoreError::EngineConfig(err.to_string()))?;
        }
        Ok(())
    }

    fn reset_stream(&mut self, stream_id: u64, error_code: u64) -> CoreResult<()> {
        let id = u64_to_stream_id(stream_id);
        let code = VarInt::from_u64(error_code).unwrap_or(VarInt::from_u32(0));
        self.connection
            .send_stream(id)
            .reset(code)
            .map_err(|err| CoreError::EngineConfig(err.to_string()))
    }
}

fn stream_id_to_u64(id: StreamId) -> u64 {
    id.0
}

fn u64_to_stream_id(raw: u64) -> StreamId {
    StreamId(raw)
}

fn reason_to_error_code(reason: &quinn_proto::ConnectionError) -> u64 {
    match reason {
        quinn_proto::ConnectionError::ApplicationClosed(close) => close.error_code.into_inner(),
        quinn_proto::ConnectionError::ConnectionClosed(close) => close.error_code.into(),
        _ => crate::engine::QUIC_NO_ERROR,
    }
}
