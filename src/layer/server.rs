//! `ServerQuicLayer`: originates outbound QUIC to the real server on
//! demand, once the client side asks for it.

use std::net::SocketAddr;
use std::time::Instant;

use tracing::warn;

use crate::addons::{ProxyHooks, TlsData};
use crate::commands::Command;
use crate::config::ProxyRuntime;
use crate::error::CoreResult;
use crate::events::EngineHandle;
use crate::routing::SessionId;

use super::{QuicLayer, Role};

/// Reply to the child once an `OpenConnection` request resolves, one way or
/// another — mirrors the three distinct failure branches in SPEC_FULL.md
/// §4.5 plus the success path.
#[derive(Debug, Clone)]
pub enum OpenConnectionCompleted {
    Ok,
    Err(String),
}

pub struct ServerQuicLayer<H: ProxyHooks> {
    pub base: QuicLayer,
    pub hooks: H,
    open_requested: bool,
}

impl<H: ProxyHooks> ServerQuicLayer<H> {
    pub fn new(id: SessionId, runtime: ProxyRuntime, hooks: H) -> Self {
        Self {
            base: QuicLayer::new(id, Role::Server, runtime),
            hooks,
            open_requested: false,
        }
    }

    /// Handle a child-originated `OpenConnection` for this layer's endpoint.
    /// `dial` performs the actual transport-level connect (out of scope
    /// here; provided by the I/O runtime) and `make_engine` builds this
    /// side's engine from the addon-supplied TLS settings.
    pub fn open_connection(
        &mut self,
        peer_addr: SocketAddr,
        now: Instant,
        dial: impl FnOnce(SocketAddr) -> Result<(), String>,
        make_engine: impl FnOnce(&TlsData, Option<Vec<u8>>) -> CoreResult<EngineHandle>,
    ) -> (Vec<Command>, OpenConnectionCompleted) {
        self.open_requested = true;
        self.base.endpoint.peer_addr = Some(peer_addr);

        if let Err(err) = dial(peer_addr) {
            warn!(%err, "failed to open server-facing transport connection");
            return (Vec::new(), OpenConnectionCompleted::Err(err));
        }

        if !self.base.start_tls(&mut self.hooks, None, make_engine) {
            return (
                vec![Command::CloseConnection {
                    conn: self.base.id,
                    error_code: 0x0,
                    reason: "TLS initialization failed".to_string(),
                }],
                OpenConnectionCompleted::Err("TLS initialization failed".to_string()),
            );
        }

        let engine = self.base.engine.clone().expect("start_tls just succeeded");
        if let Err(err) = engine.borrow_mut().connect(peer_addr, now) {
            return (Vec::new(), OpenConnectionCompleted::Err(err.to_string()));
        }

        let (commands, _child_events) = self.base.process_events(&mut self.hooks, now);
        // The real completion reply is deferred until `HandshakeCompleted`
        // actually fires (see `Session::drive`, which watches
        // `base.endpoint.tls_established` after this call); returning `Ok`
        // here only reflects that the dial and engine construction succeeded.
        (commands, OpenConnectionCompleted::Ok)
    }

    /// A transport close arriving before the deferred `OpenConnectionCompleted`
    /// resolves; picks the right of the two remaining failure reasons.
    pub fn connection_closed_while_opening(&self) -> OpenConnectionCompleted {
        if self.base.endpoint.tls_established {
            OpenConnectionCompleted::Err("Connection closed before connect".to_string())
        } else {
            OpenConnectionCompleted::Err("TLS initialization failed".to_string())
        }
    }
}
