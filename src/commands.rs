//! Commands layers emit upward to the I/O runtime or to sibling layers.

use std::time::Duration;

use tracing::Level;

use crate::routing::SessionId;

#[derive(Debug, Clone)]
pub enum Command {
    /// Send `bytes` on the connection owned by `conn`.
    SendData { conn: SessionId, bytes: Vec<u8> },
    /// Dial out a new server-facing connection.
    OpenConnection { conn: SessionId },
    /// Close the connection owned by `conn`.
    CloseConnection {
        conn: SessionId,
        error_code: u64,
        reason: String,
    },
    /// Ask the I/O runtime to redeliver a `Wakeup` event after `delta`.
    RequestWakeup { conn: SessionId, delta: Duration },
    /// Structured log line, for commands a layer wants surfaced through the
    /// embedding application's own logging rather than directly via `tracing`
    /// (kept distinct from in-core `tracing` calls per §6's "Log" command).
    Log { message: String, level: Level },
}
