//! State - elector の状態遷移

use serde::{Deserialize, Serialize};

/// ElectorState は elector の状態
///
/// 状態遷移:
/// - Idle -> Acquiring -> Leading
/// - Leading -> Renewing -> Leading (each successful renewal)
/// - Renewing -> Expired (no renewal landed within the renew deadline)
/// - Leading/Renewing -> Released (run loop cancelled while leading)
/// - Expired -> Acquiring (the elector keeps competing)
/// - any -> Stopped (run loop returned)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElectorState {
    /// Constructed, run loop not started.
    Idle,

    /// Polling the lease every retry period.
    Acquiring,

    /// Holding the lease, waiting for the next renewal tick.
    Leading,

    /// Holding the lease, renewal in progress against the deadline.
    Renewing,

    /// Leadership given up because the run loop was cancelled.
    Released,

    /// Leadership lost because the renew deadline passed.
    Expired,

    /// Run loop finished.
    Stopped,
}

impl ElectorState {
    /// Does this process currently act as leader?
    pub fn is_leading(self) -> bool {
        matches!(self, ElectorState::Leading | ElectorState::Renewing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_leading_and_renewing_count_as_leader() {
        assert!(ElectorState::Leading.is_leading());
        assert!(ElectorState::Renewing.is_leading());
        for state in [
            ElectorState::Idle,
            ElectorState::Acquiring,
            ElectorState::Released,
            ElectorState::Expired,
            ElectorState::Stopped,
        ] {
            assert!(!state.is_leading(), "{state:?}");
        }
    }
}
