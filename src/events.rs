//! Events layers consume, either from the I/O runtime below or synthesized
//! by a sibling layer (`QuicStart`, `QuicConnectionEvent`).

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use crate::engine::{EngineEvent, QuicEngineAdapter};
use crate::wakeup::WakeupToken;

/// Shared, single-threaded handle to a side's engine, handed to the relay
/// layer once that side's handshake has produced a live `EngineInstance`.
pub type EngineHandle = Rc<RefCell<dyn QuicEngineAdapter>>;

#[derive(Clone)]
pub enum Event {
    /// Raw bytes arrived on the owning connection's transport.
    DataReceived { bytes: Vec<u8>, from_addr: SocketAddr },
    /// The transport underlying a connection was closed or timed out.
    ConnectionClosed,
    /// A previously requested wakeup fired.
    Wakeup(WakeupToken),
    /// Emitted by a `QuicLayer` to its child once that side's engine exists,
    /// so the child can start draining any buffered cross-talk.
    QuicStart { engine: EngineHandle },
    /// One decoded engine event, tagged with which side produced it.
    QuicConnectionEvent { event: EngineEvent, from_client: bool },
    /// An addon injected a synthetic TCP-style message.
    TcpMessageInjected { stream_id: u64, bytes: Vec<u8>, end_stream: bool, from_client: bool },
    /// An addon injected a synthetic UDP-style datagram.
    UdpMessageInjected { bytes: Vec<u8>, from_client: bool },
}
