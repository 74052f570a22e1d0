//! Per-stream bookkeeping for the stream relay layer.

use tracing::error;

use crate::flow::TcpFlow;

/// A QUIC stream id's direction bits (RFC 9000 §2.1): bit 0 selects
/// client/server-initiated, bit 1 selects bidirectional/unidirectional.
fn is_client_initiated(stream_id: u64) -> bool {
    stream_id & 0x1 == 0
}

fn is_unidirectional(stream_id: u64) -> bool {
    stream_id & 0x2 != 0
}

/// One QUIC stream as seen by the relay. `ended_client`/`ended_server` track
/// whether each side has sent its last byte (or been reset); for a
/// unidirectional stream the side that never writes starts out already
/// ended, since it will never produce an end event of its own.
pub struct QuicStream {
    pub stream_id: u64,
    pub ignore: bool,
    ended_client: bool,
    ended_server: bool,
    pub flow: TcpFlow,
}

impl QuicStream {
    pub fn new(stream_id: u64, ignore: bool) -> Self {
        let unidirectional = is_unidirectional(stream_id);
        let client_initiated = is_client_initiated(stream_id);

        // On a unidirectional stream only the initiator ever writes; the
        // other side's "ended" flag starts true since it has nothing to end.
        let ended_client = unidirectional && !client_initiated;
        let ended_server = unidirectional && client_initiated;

        Self {
            stream_id,
            ignore,
            ended_client,
            ended_server,
            flow: TcpFlow::new(),
        }
    }

    pub fn has_ended(&self, from_client: bool) -> bool {
        if from_client {
            self.ended_client
        } else {
            self.ended_server
        }
    }

    pub fn both_ended(&self) -> bool {
        self.ended_client && self.ended_server
    }

    /// Mark `from_client`'s side ended. Returns `(both_ended, error_newly_set)`:
    /// `both_ended` is `true` if this transition just completed both sides
    /// (the caller should clear `flow.live`); `error_newly_set` is `true` if
    /// `err` was the first error recorded on this stream (the caller should
    /// emit the error hook exactly once, per that signal). Panics if this
    /// side was already ended: the engine emitting two end-of-stream events
    /// for the same direction is a protocol-invariant violation, not a
    /// recoverable fault.
    pub fn mark_ended(&mut self, from_client: bool, err: Option<String>) -> (bool, bool) {
        if self.has_ended(from_client) {
            error!(stream_id = self.stream_id, from_client, "stream already ended on this side");
            panic!("stream {} already ended from_client={}", self.stream_id, from_client);
        }

        if from_client {
            self.ended_client = true;
        } else {
            self.ended_server = true;
        }

        let error_newly_set = match err {
            Some(err) => self.flow.set_error_once(err),
            None => false,
        };

        (self.both_ended(), error_newly_set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // RFC 9000 stream id low bits: 0=client-bidi, 1=server-bidi,
    // 2=client-uni, 3=server-uni.
    const CLIENT_BIDI: u64 = 0;
    const SERVER_BIDI: u64 = 1;
    const CLIENT_UNI: u64 = 2;
    const SERVER_UNI: u64 = 3;

    #[test]
    fn bidirectional_stream_starts_unended_both_sides() {
        let s = QuicStream::new(CLIENT_BIDI, false);
        assert!(!s.has_ended(true));
        assert!(!s.has_ended(false));

        let s = QuicStream::new(SERVER_BIDI, false);
        assert!(!s.has_ended(true));
        assert!(!s.has_ended(false));
    }

    #[test]
    fn client_unidirectional_stream_server_side_starts_ended() {
        let s = QuicStream::new(CLIENT_UNI, false);
        assert!(!s.has_ended(true));
        assert!(s.has_ended(false));
    }

    #[test]
    fn server_unidirectional_stream_client_side_starts_ended() {
        let s = QuicStream::new(SERVER_UNI, false);
        assert!(s.has_ended(true));
        assert!(!s.has_ended(false));
    }

    #[test]
    fn mark_ended_is_monotonic_and_reports_completion() {
        let mut s = QuicStream::new(CLIENT_BIDI, false);
        assert_eq!(s.mark_ended(true, None), (false, false));
        assert!(s.has_ended(true));
        assert!(!s.has_ended(false));
        assert_eq!(s.mark_ended(false, None), (true, false));
        assert!(s.both_ended());
    }

    #[test]
    #[should_panic]
    fn mark_ended_twice_on_same_side_panics() {
        let mut s = QuicStream::new(CLIENT_BIDI, false);
        s.mark_ended(true, None);
        s.mark_ended(true, None);
    }

    #[test]
    fn mark_ended_records_error_once() {
        let mut s = QuicStream::new(CLIENT_BIDI, false);
        let (_, first_set) = s.mark_ended(true, Some("boom".into()));
        assert!(first_set);
        let (_, second_set) = s.mark_ended(false, Some("ignored".into()));
        assert!(!second_set);
        assert_eq!(s.flow.error.as_deref(), Some("boom"));
    }
}
