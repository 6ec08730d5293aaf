//! Time-gated latch turning per-frame motion flags into sparse triggers.

use std::time::{Duration, Instant};

/// Outcome of feeding one observation to the gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateDecision {
    /// Motion confirmed and far enough from the previous trigger.
    Fire,
    /// No motion, or motion inside the debounce window.
    Suppress,
}

/// At most one `Fire` per `interval`, no matter how many consecutive frames show motion.
#[derive(Clone, Debug)]
pub struct DebounceGate {
    interval: Duration,
    last_trigger: Option<Instant>,
}

impl DebounceGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_trigger: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn last_trigger(&self) -> Option<Instant> {
        self.last_trigger
    }

    /// Fires when `motion_detected` and strictly more than `interval` has passed
    /// since the last trigger (or there has never been one).
    pub fn observe(&mut self, motion_detected: bool, now: Instant) -> GateDecision {
        if !motion_detected {
            return GateDecision::Suppress;
        }
        let open = match self.last_trigger {
            None => true,
            Some(last) => now.saturating_duration_since(last) > self.interval,
        };
        if open {
            self.last_trigger = Some(now);
            GateDecision::Fire
        } else {
            GateDecision::Suppress
        }
    }
}
