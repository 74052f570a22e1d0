//! Per-engine wakeup coalescing.
//!
//! Each `QuicLayer` surfaces a single outstanding timer request per endpoint
//! to the I/O runtime, coalesced to the earliest deadline the engine has
//! asked for. A new `RequestWakeup` is only emitted when no already-armed
//! deadline is at or before the engine's new deadline.

use std::time::Instant;

/// Opaque token handed back with `RequestWakeup`, echoed on the `Wakeup`
/// event so the layer can tell it apart from an unrelated timer fire.
pub type WakeupToken = u64;

#[derive(Default)]
pub struct WakeupRegistry {
    next_token: WakeupToken,
    armed: Option<(WakeupToken, Instant)>,
}

impl WakeupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide whether a new wakeup needs to be requested for `deadline`.
    /// Returns the token to arm if one is needed.
    pub fn arm(&mut self, deadline: Instant) -> Option<WakeupToken> {
        if let Some((_, existing)) = self.armed {
            if existing <= deadline {
                return None;
            }
        }
        self.next_token += 1;
        let token = self.next_token;
        self.armed = Some((token, deadline));
        Some(token)
    }

    /// Consume a fired wakeup. Returns `true` if `token` was the outstanding
    /// one (and clears it); a stale token (superseded by a later `arm`) is
    /// ignored.
    pub fn fire(&mut self, token: WakeupToken) -> bool {
        match self.armed {
            Some((armed_token, _)) if armed_token == token => {
                self.armed = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn first_arm_always_requests() {
        let mut reg = WakeupRegistry::new();
        let now = Instant::now();
        assert!(reg.arm(now + Duration::from_secs(1)).is_some());
    }

    #[test]
    fn later_equal_or_later_deadline_is_coalesced() {
        let mut reg = WakeupRegistry::new();
        let now = Instant::now();
        let token = reg.arm(now + Duration::from_secs(5)).unwrap();
        assert!(reg.arm(now + Duration::from_secs(10)).is_none());
        assert!(reg.fire(token));
    }

    #[test]
    fn earlier_deadline_rearms_with_new_token() {
        let mut reg = WakeupRegistry::new();
        let now = Instant::now();
        let first = reg.arm(now + Duration::from_secs(10)).unwrap();
        let second = reg.arm(now + Duration::from_secs(1)).unwrap();
        assert_ne!(first, second);
        // the stale first token no longer matches the outstanding one
        assert!(!reg.fire(first));
        assert!(reg.fire(second));
    }

    #[test]
    fn fire_clears_armed_state() {
        let mut reg = WakeupRegistry::new();
        let now = Instant::now();
        let token = reg.arm(now + Duration::from_secs(1)).unwrap();
        assert!(reg.fire(token));
        // armed slot is now empty, so any new deadline re-arms
        assert!(reg.arm(now + Duration::from_secs(100)).is_some());
    }
}
