//! The hook surface addons implement to supply TLS settings and observe or
//! mutate traffic. One method per named hook in SPEC_FULL.md §6, each given
//! `&mut` access to its data record; a default no-op body means an embedder
//! only overrides what it cares about.

use crate::flow::{TcpMessage, UdpMessage};

/// Certificate material and verification policy an addon supplies before a
/// `QuicLayer` constructs its engine.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    pub certificate: Vec<u8>,
    pub private_key: Vec<u8>,
    pub certificate_chain: Vec<Vec<u8>>,
    pub cipher_suites: Option<Vec<String>>,
    pub ca_file: Option<String>,
    pub ca_dir: Option<String>,
    pub verify_peer: bool,
}

/// Carried by `QuicTlsStartClientHook`/`QuicTlsStartServerHook`; the addon
/// must populate `settings` or the layer aborts TLS bootstrap.
#[derive(Debug, Clone, Default)]
pub struct TlsData {
    pub sni: Option<String>,
    pub alpn_offers: Vec<Vec<u8>>,
    pub settings: Option<TlsSettings>,
}

/// Carried by `TlsClienthelloHook`.
#[derive(Debug, Clone, Default)]
pub struct ClientHelloData {
    pub sni: Option<String>,
    pub alpn_protocols: Vec<Vec<u8>>,
    pub ignore_connection: bool,
    pub establish_server_tls_first: bool,
}

/// Carried by `TlsEstablished{Client,Server}Hook`.
#[derive(Debug, Clone, Default)]
pub struct TlsEstablishedData {
    pub sni: Option<String>,
    pub alpn: Option<Vec<u8>>,
    pub tls_version: String,
    pub cipher: Option<String>,
    pub certificate_chain: Vec<Vec<u8>>,
}

/// Carried by `TlsFailed{Client,Server}Hook`.
#[derive(Debug, Clone)]
pub struct TlsFailedData {
    pub reason: String,
}

/// Synchronous policy callbacks. Layers invoke these inline — with respect
/// to the calling layer, a hook runs to completion before the next event is
/// consumed, so a hook that mutates a message mutates it before the relay
/// reads the effective bytes back.
pub trait ProxyHooks {
    fn quic_tls_start_client(&mut self, _data: &mut TlsData) {}
    fn quic_tls_start_server(&mut self, _data: &mut TlsData) {}

    fn tls_clienthello(&mut self, _data: &mut ClientHelloData) {}

    fn tls_established_client(&mut self, _data: &TlsEstablishedData) {}
    fn tls_established_server(&mut self, _data: &TlsEstablishedData) {}
    fn tls_failed_client(&mut self, _data: &TlsFailedData) {}
    fn tls_failed_server(&mut self, _data: &TlsFailedData) {}

    fn udp_start(&mut self) {}
    fn udp_message(&mut self, _message: &mut UdpMessage) {}
    fn udp_end(&mut self) {}
    fn udp_error(&mut self, _reason: &str) {}

    fn tcp_start(&mut self) {}
    fn tcp_message(&mut self, _message: &mut TcpMessage) {}
    fn tcp_end(&mut self) {}
    fn tcp_error(&mut self, _reason: &str) {}
}

/// A `ProxyHooks` implementation that takes no action on any hook, used when
/// an embedder or a test does not need policy involvement.
#[derive(Default, Clone, Copy)]
pub struct NoopHooks;

impl ProxyHooks for NoopHooks {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_hooks_leave_data_untouched() {
        let mut hooks = NoopHooks;
        let mut data = ClientHelloData {
            sni: Some("example.com".into()),
            ..Default::default()
        };
        hooks.tls_clienthello(&mut data);
        assert_eq!(data.sni.as_deref(), Some("example.com"));
        assert!(!data.ignore_connection);
    }
}
