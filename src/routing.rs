//! Connection-ID routing table and per-layer peer-address route table.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};

/// Key into the process-wide connection-ID table: the local socket a packet
/// arrived on, plus the destination connection ID it carried.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CidKey {
    pub sockname: SocketAddr,
    pub cid: Vec<u8>,
}

impl CidKey {
    pub fn new(sockname: SocketAddr, cid: &[u8]) -> Self {
        Self {
            sockname,
            cid: cid.to_vec(),
        }
    }
}

/// Opaque identifier for the `ClientQuicLayer` owning a table entry. Layers
/// are addressed by this id rather than by reference so the table can be
/// shared behind a `Mutex` without borrowing into a layer's own state.
pub type SessionId = u64;

/// Process-wide map from `(sockname, cid)` to the session that owns it.
///
/// Single-writer-per-key is enforced by [`Self::insert`]: a second insert for
/// an already-owned key is an invariant violation (the same connection ID
/// being issued by two different sessions would mean the engine handed out a
/// colliding ID, or a session failed to retire before a new one reused it).
#[derive(Clone)]
pub struct ConnectionIdTable {
    inner: Arc<Mutex<HashMap<CidKey, SessionId>>>,
}

impl ConnectionIdTable {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a newly issued connection ID for `owner`.
    ///
    /// Returns `RoutingConflict` if the key is already owned by a different
    /// session; this is recoverable at the boundary (the engine should not
    /// have reused a live ID) so it is surfaced as a `CoreError` rather than
    /// a panic.
    pub fn insert(&self, key: CidKey, owner: SessionId) -> CoreResult<()> {
        let mut table = self.inner.lock().expect("connection id table poisoned");
        if let Some(existing) = table.get(&key) {
            if *existing != owner {
                return Err(CoreError::RoutingConflict {
                    sockname: key.sockname.to_string(),
                    cid: hex(&key.cid),
                });
            }
            return Ok(());
        }
        debug!(sockname = %key.sockname, cid = %hex(&key.cid), owner, "connection id registered");
        table.insert(key, owner);
        Ok(())
    }

    /// Remove a connection ID on retirement or session teardown. A missing
    /// key is logged, not fatal: retirement can race with termination
    /// cleanup that already swept the key.
    pub fn remove(&self, key: &CidKey) {
        let mut table = self.inner.lock().expect("connection id table poisoned");
        if table.remove(key).is_none() {
            warn!(sockname = %key.sockname, cid = %hex(&key.cid), "retiring unknown connection id");
        }
    }

    /// Look up the owning session for an inbound packet's destination CID.
    pub fn lookup(&self, key: &CidKey) -> Option<SessionId> {
        let table = self.inner.lock().expect("connection id table poisoned");
        table.get(key).copied()
    }

    /// Remove every entry owned by `owner`, used when a session tears down
    /// without having retired its connection IDs individually.
    pub fn remove_owner(&self, owner: SessionId) {
        let mut table = self.inner.lock().expect("connection id table poisoned");
        table.retain(|_, v| *v != owner);
    }
}

impl Default for ConnectionIdTable {
    fn default() -> Self {
        Self::new()
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Per-`ClientQuicLayer` table mapping a peer UDP address to the handler
/// currently reachable there. Populated by [`crate::layer::roaming`] and
/// consulted by `QuicLayer::transmit` when the engine addresses a packet to
/// something other than the endpoint's primary peer.
#[derive(Default)]
pub struct RouteTable {
    routes: HashMap<SocketAddr, SessionId>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_route(&mut self, addr: SocketAddr, handler: SessionId) {
        self.routes.insert(addr, handler);
    }

    pub fn remove_route(&mut self, addr: &SocketAddr) {
        self.routes.remove(addr);
    }

    pub fn lookup(&self, addr: &SocketAddr) -> Option<SessionId> {
        self.routes.get(addr).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:4433".parse().unwrap()
    }

    #[test]
    fn insert_then_lookup() {
        let table = ConnectionIdTable::new();
        let key = CidKey::new(addr(), &[1, 2, 3, 4]);
        table.insert(key.clone(), 7).unwrap();
        assert_eq!(table.lookup(&key), Some(7));
    }

    #[test]
    fn insert_conflict_rejected() {
        let table = ConnectionIdTable::new();
        let key = CidKey::new(addr(), &[1, 2, 3, 4]);
        table.insert(key.clone(), 7).unwrap();
        let err = table.insert(key, 8).unwrap_err();
        assert!(matches!(err, CoreError::RoutingConflict { .. }));
    }

    #[test]
    fn same_owner_reinsert_is_idempotent() {
        let table = ConnectionIdTable::new();
        let key = CidKey::new(addr(), &[9]);
        table.insert(key.clone(), 1).unwrap();
        table.insert(key.clone(), 1).unwrap();
        assert_eq!(table.lookup(&key), Some(1));
    }

    #[test]
    fn remove_owner_sweeps_all_keys() {
        let table = ConnectionIdTable::new();
        let k1 = CidKey::new(addr(), &[1]);
        let k2 = CidKey::new(addr(), &[2]);
        table.insert(k1.clone(), 3).unwrap();
        table.insert(k2.clone(), 3).unwrap();
        table.remove_owner(3);
        assert_eq!(table.lookup(&k1), None);
        assert_eq!(table.lookup(&k2), None);
    }

    #[test]
    fn route_table_add_remove() {
        let mut routes = RouteTable::new();
        routes.add_route(addr(), 42);
        assert_eq!(routes.lookup(&addr()), Some(42));
        routes.remove_route(&addr());
        assert_eq!(routes.lookup(&addr()), None);
    }
}
