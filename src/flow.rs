//! Addon-visible flow records: the message lists hooks inspect and mutate.

/// One datagram observed on a flow, in either direction.
#[derive(Debug, Clone)]
pub struct UdpMessage {
    pub from_client: bool,
    pub content: Vec<u8>,
}

/// One stream-data chunk observed on a flow, in either direction.
#[derive(Debug, Clone)]
pub struct TcpMessage {
    pub from_client: bool,
    pub content: Vec<u8>,
}

/// A logical channel addons can inspect: either the datagram flow for a
/// connection pair, or one flow per bidirectional/unidirectional stream.
///
/// Hooks are handed `&mut` access to the message list (typically its last
/// element) before the relay reads the "effective" bytes back, so a hook
/// rewriting `content` changes what is actually forwarded to the peer.
#[derive(Debug, Clone)]
pub struct Flow<M> {
    pub messages: Vec<M>,
    pub error: Option<String>,
    pub live: bool,
}

impl<M> Flow<M> {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            error: None,
            live: true,
        }
    }

    /// Record `error` the first time it is set; later calls are no-ops so a
    /// stream's terminal reason is never overwritten by a second event.
    pub fn set_error_once(&mut self, error: String) -> bool {
        if self.error.is_some() {
            return false;
        }
        self.error = Some(error);
        true
    }
}

impl<M> Default for Flow<M> {
    fn default() -> Self {
        Self::new()
    }
}

pub type UdpFlow = Flow<UdpMessage>;
pub type TcpFlow = Flow<TcpMessage>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_error_once_does_not_overwrite() {
        let mut flow: TcpFlow = Flow::new();
        assert!(flow.set_error_once("first".into()));
        assert!(!flow.set_error_once("second".into()));
        assert_eq!(flow.error.as_deref(), Some("first"));
    }

    #[test]
    fn new_flow_is_live_with_no_messages() {
        let flow: UdpFlow = Flow::new();
        assert!(flow.live);
        assert!(flow.messages.is_empty());
        assert!(flow.error.is_none());
    }
}
