//! Barge-in detection while the assistant is speaking
//!
//! No hysteresis: the first sample above the threshold fires.

use crate::state::TurnId;
use tracing::info;

#[derive(Debug)]
pub struct InterruptionDetector {
    threshold: f32,
    armed_for: Option<TurnId>,
    fired: bool,
}

impl InterruptionDetector {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold,
            armed_for: None,
            fired: false,
        }
    }

    /// Start watching for barge-in during the given turn
    pub fn arm(&mut self, turn_id: TurnId) {
        self.armed_for = Some(turn_id);
        self.fired = false;
    }

    pub fn disarm(&mut self) {
        self.armed_for = None;
    }

    pub fn is_armed(&self) -> bool {
        self.armed_for.is_some()
    }

    pub fn set_threshold(&mut self, threshold: f32) {
        self.threshold = threshold;
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Returns true exactly once per armed turn, on the first loud sample
    pub fn observe(&mut self, turn_id: TurnId, level: f32) -> bool {
        if self.armed_for != Some(turn_id) || self.fired {
            return false;
        }
        if level > self.threshold {
            self.fired = true;
            info!(
                "🚫 Barge-in on {} (level {:.3} > {:.3})",
                turn_id, level, self.threshold
            );
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_once_per_turn() {
        let mut det = InterruptionDetector::new(0.3);
        det.arm(TurnId(4));
        assert!(!det.observe(TurnId(4), 0.1));
        assert!(det.observe(TurnId(4), 0.5));
        assert!(!det.observe(TurnId(4), 0.9));

        det.arm(TurnId(5));
        assert!(det.observe(TurnId(5), 0.9));
    }

    #[test]
    fn test_ignores_other_turns_and_disarmed_state() {
        let mut det = InterruptionDetector::new(0.3);
        assert!(!det.observe(TurnId(1), 0.9));

        det.arm(TurnId(2));
        assert!(!det.observe(TurnId(1), 0.9));

        det.disarm();
        assert!(!det.observe(TurnId(2), 0.9));
    }

    #[test]
    fn test_threshold_is_strict() {
        let mut det = InterruptionDetector::new(0.3);
        det.arm(TurnId(1));
        assert!(!det.observe(TurnId(1), 0.3));
        assert!(det.observe(TurnId(1), 0.31));
    }
}
