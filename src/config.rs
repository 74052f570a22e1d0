//! Ambient configuration and the process-wide runtime handle.

use std::sync::Arc;

use crate::routing::ConnectionIdTable;

/// A sink for TLS key-log lines, in the standard `SSLKEYLOGFILE` format.
///
/// Implementations receive the already-formatted `label` and the raw secret
/// bytes and are responsible for writing one line; the trailing newline is
/// stripped by the caller before handing bytes to the sink, matching the
/// write contract addons rely on for key-log capture.
pub trait SecretsLogger: Send + Sync {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]);
}

/// Options supplied once by the embedding application before any session is
/// constructed. Immutable afterward.
#[derive(Clone, Debug)]
pub struct ProxyOptions {
    /// Length in bytes of connection IDs this proxy issues.
    pub quic_connection_id_length: usize,
    /// Whether a `ClientQuicLayer` is permitted to splice onto a
    /// previously-registered connection ID arriving from a new UDP 4-tuple.
    pub allow_roaming: bool,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            quic_connection_id_length: 8,
            allow_roaming: true,
        }
    }
}

/// Single handle bundling every process-wide collaborator the core needs:
/// the connection-ID routing table and the optional TLS secrets sink.
///
/// Sessions hold a clone of this handle rather than reaching for a global or
/// `static` — this is what keeps unit tests hermetic (each test builds its
/// own `ProxyRuntime`) while still matching the single shared table the
/// design calls for in production.
#[derive(Clone)]
pub struct ProxyRuntime {
    pub options: ProxyOptions,
    pub cid_table: ConnectionIdTable,
    secrets_logger: Option<Arc<dyn SecretsLogger>>,
}

impl ProxyRuntime {
    pub fn new(options: ProxyOptions) -> Self {
        Self {
            options,
            cid_table: ConnectionIdTable::new(),
            secrets_logger: None,
        }
    }

    pub fn with_secrets_logger(mut self, logger: Arc<dyn SecretsLogger>) -> Self {
        self.secrets_logger = Some(logger);
        self
    }

    pub fn secrets_logger(&self) -> Option<&Arc<dyn SecretsLogger>> {
        self.secrets_logger.as_ref()
    }
}

impl Default for ProxyRuntime {
    fn default() -> Self {
        Self::new(ProxyOptions::default())
    }
}
