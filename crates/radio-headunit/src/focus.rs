//! In-process audio-focus arbiter.
//!
//! The head unit is the only media player in the process, but the output can
//! be claimed from outside (phone call, navigation prompt).  A claim denies
//! further focus requests until released, and takes focus away from the
//! current holder.

use radio_core::{AudioFocus, FocusLoss};
use tracing::{debug, info};

#[derive(Debug, Default)]
pub struct FocusArbiter {
    held: bool,
    claimed_by: Option<FocusLoss>,
}

impl FocusArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an external claim.  Returns the loss the current holder must
    /// react to, if focus was held.
    pub fn claim(&mut self, kind: FocusLoss) -> Option<FocusLoss> {
        info!("focus: external claim ({:?})", kind);
        self.claimed_by = Some(kind);
        if self.held {
            self.held = false;
            Some(kind)
        } else {
            None
        }
    }

    /// Drop the external claim.  Playback is not resumed automatically.
    pub fn release_claim(&mut self) {
        if self.claimed_by.take().is_some() {
            info!("focus: external claim released");
        }
    }
}

impl AudioFocus for FocusArbiter {
    fn request(&mut self) -> bool {
        if let Some(kind) = self.claimed_by {
            debug!("focus: request denied, output claimed ({:?})", kind);
            return false;
        }
        self.held = true;
        true
    }

    fn abandon(&mut self) {
        self.held = false;
    }
}

/// Parse the claim kind used by the HTTP surface.
pub fn parse_loss(kind: &str) -> Option<FocusLoss> {
    match kind.to_ascii_lowercase().as_str() {
        "permanent" | "loss" => Some(FocusLoss::Permanent),
        "transient" => Some(FocusLoss::Transient),
        "duck" | "transient_can_duck" | "transient-can-duck" => {
            Some(FocusLoss::TransientCanDuck)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grant_and_abandon() {
        let mut arbiter = FocusArbiter::new();
        assert!(arbiter.request());
        assert!(arbiter.held);
        arbiter.abandon();
        assert!(!arbiter.held);
    }

    #[test]
    fn test_claim_takes_focus_from_holder() {
        let mut arbiter = FocusArbiter::new();
        arbiter.request();
        assert_eq!(arbiter.claim(FocusLoss::Transient), Some(FocusLoss::Transient));
        assert!(!arbiter.held);
        assert!(!arbiter.request());
    }

    #[test]
    fn test_claim_without_holder_reports_nothing() {
        let mut arbiter = FocusArbiter::new();
        assert_eq!(arbiter.claim(FocusLoss::Permanent), None);
        assert!(arbiter.claimed_by.is_some());
    }

    #[test]
    fn test_release_allows_requests_again() {
        let mut arbiter = FocusArbiter::new();
        arbiter.claim(FocusLoss::Permanent);
        arbiter.release_claim();
        assert!(arbiter.claimed_by.is_none());
        assert!(arbiter.request());
    }

    #[test]
    fn test_parse_loss() {
        assert_eq!(parse_loss("Transient"), Some(FocusLoss::Transient));
        assert_eq!(parse_loss("duck"), Some(FocusLoss::TransientCanDuck));
        assert_eq!(parse_loss("permanent"), Some(FocusLoss::Permanent));
        assert_eq!(parse_loss("gain"), None);
    }
}
