//! Error types for the QUIC interception core.

use thiserror::Error;

/// Recoverable failures raised by setup-time operations.
///
/// Faults detected while driving an established session (malformed datagram,
/// routing miss, unsupported version) are logged and dropped in place rather
/// than propagated as a `CoreError` — see the event-handling code in
/// [`crate::layer`] and [`crate::relay`].
#[derive(Debug, Error)]
pub enum CoreError {
    /// The bytes handed to [`crate::client_hello::parse_client_hello`] were
    /// not a well-formed QUIC long-header Initial packet.
    #[error("invalid QUIC datagram: {0}")]
    InvalidDatagram(String),

    /// The Initial packet carried a QUIC version this adapter does not speak.
    #[error("unsupported QUIC version {0:#x}")]
    UnsupportedVersion(u32),

    /// Initial-secret derivation, header-protection removal, or AEAD open
    /// failed, or the recovered CRYPTO bytes were not a valid ClientHello.
    #[error("failed to parse ClientHello: {0}")]
    ClientHelloParse(String),

    /// An addon hook did not populate TLS settings before engine construction.
    #[error("TLS settings hook did not supply settings for {0}")]
    TlsSettingsMissing(&'static str),

    /// The connection-ID table already has an owner for this key.
    #[error("connection id {cid} on {sockname} already owned")]
    RoutingConflict { sockname: String, cid: String },

    /// Engine construction failed (rustls/quinn-proto configuration error).
    #[error("failed to configure QUIC engine: {0}")]
    EngineConfig(String),
}

/// Result type for core setup operations.
pub type CoreResult<T> = Result<T, CoreError>;
