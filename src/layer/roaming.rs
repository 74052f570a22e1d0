//! `QuicRoamingLayer`: the lightweight splice installed in place of a
//! `ClientQuicLayer` when a known connection ID arrives on a new UDP
//! 4-tuple, so the migrated client keeps talking to its original handler.

use std::net::SocketAddr;

use tracing::debug;

use crate::commands::Command;
use crate::routing::{RouteTable, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    Relay,
    Closed,
}

/// Splices packets arriving at `peer_addr` (the client's new UDP 4-tuple)
/// onto `target` (the `SessionId` of the original `ClientQuicLayer`).
pub struct QuicRoamingLayer {
    state: State,
    target: SessionId,
    peer_addr: SocketAddr,
}

impl QuicRoamingLayer {
    pub fn new(target: SessionId, peer_addr: SocketAddr) -> Self {
        Self { state: State::Start, target, peer_addr }
    }

    /// Register this migration's peer address into the target's route
    /// table, returning the commands (none) and leaving the layer in
    /// `Relay` state.
    pub fn start(&mut self, target_routes: &mut RouteTable) -> Vec<Command> {
        target_routes.add_route(self.peer_addr, self.target);
        self.state = State::Relay;
        Vec::new()
    }

    /// A datagram arrived at the migrated 4-tuple: rewrite the target's
    /// notion of "current peer" to this arrival's address and forward the
    /// bytes into the target handler.
    pub fn data_received(&mut self, bytes: Vec<u8>, from_addr: SocketAddr) -> Vec<Command> {
        if self.state != State::Relay {
            return Vec::new();
        }
        self.peer_addr = from_addr;
        debug!(target = self.target, %from_addr, "roaming splice forwarding datagram");
        vec![Command::SendData { conn: self.target, bytes }]
    }

    /// An addon-injected message must belong to the flow this splice
    /// forwards for; this is a single-owner assertion, not a recoverable
    /// fault.
    pub fn message_injected(&mut self, owner: SessionId) {
        assert_eq!(owner, self.target, "injected message does not belong to the roaming target");
    }

    pub fn connection_closed(&mut self, target_routes: &mut RouteTable) {
        target_routes.remove_route(&self.peer_addr);
        self.state = State::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn start_registers_route() {
        let mut routes = RouteTable::new();
        let mut roaming = QuicRoamingLayer::new(7, addr(1));
        roaming.start(&mut routes);
        assert_eq!(routes.lookup(&addr(1)), Some(7));
    }

    #[test]
    fn data_received_forwards_to_target_and_updates_peer() {
        let mut routes = RouteTable::new();
        let mut roaming = QuicRoamingLayer::new(7, addr(1));
        roaming.start(&mut routes);

        let commands = roaming.data_received(vec![9, 9], addr(2));
        assert!(matches!(&commands[0], Command::SendData { conn, bytes } if *conn == 7 && bytes == &vec![9, 9]));
        assert_eq!(roaming.peer_addr, addr(2));
    }

    #[test]
    fn closed_layer_drops_further_packets() {
        let mut routes = RouteTable::new();
        let mut roaming = QuicRoamingLayer::new(7, addr(1));
        roaming.start(&mut routes);
        roaming.connection_closed(&mut routes);
        assert!(routes.lookup(&addr(1)).is_none());
        assert!(roaming.data_received(vec![1], addr(1)).is_empty());
    }
}
