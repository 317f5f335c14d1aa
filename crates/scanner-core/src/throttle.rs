//! Shared throttle state written by the resource monitor and read by the
//! scanner engine between probes.

use chrono::{DateTime, Utc};

/// Snapshot of the throttle's current effect on the scan loop.
///
/// Writer: `ResourceMonitor`. Readers: `ScannerEngine`. A read always
/// observes a coherent whole, never a torn mix of pre- and post-update
/// fields, because every mutation goes through `apply`/`escalate`/`release`
/// while the caller holds the guarding lock for the whole transition.
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottleState {
    pub active: bool,
    pub reason: String,
    pub dwell_multiplier: f64,
    pub chunk_duration_seconds: u64,
    pub skip_frequencies: u32,
    pub paused: bool,
    activated_at: Option<DateTime<Utc>>,
}

impl Default for ThrottleState {
    fn default() -> Self {
        ThrottleState {
            active: false,
            reason: String::new(),
            dwell_multiplier: 1.0,
            chunk_duration_seconds: 0,
            skip_frequencies: 0,
            paused: false,
            activated_at: None,
        }
    }
}

impl ThrottleState {
    pub fn new() -> Self {
        Self::default()
    }

    /// First activation, or an escalation while already active. Escalation
    /// is one-way: it never relaxes multipliers, only tightens them.
    pub fn apply(&mut self, reason: String, default_chunk_duration_seconds: u64, now: DateTime<Utc>) {
        if !self.active {
            self.active = true;
            self.dwell_multiplier = 1.5;
            self.chunk_duration_seconds = 45;
            self.skip_frequencies = 1;
            self.activated_at = Some(now);
        } else {
            self.chunk_duration_seconds = 60;
            self.skip_frequencies = 2;
        }
        let _ = default_chunk_duration_seconds;
        self.reason = reason;
    }

    /// True once `hysteresis_seconds` have elapsed since the throttle was
    /// first activated. Always false if the throttle is not active.
    pub fn hysteresis_elapsed(&self, hysteresis_seconds: u64, now: DateTime<Utc>) -> bool {
        match self.activated_at {
            Some(activated_at) => now - activated_at >= chrono::Duration::seconds(hysteresis_seconds as i64),
            None => false,
        }
    }

    pub fn release(&mut self, default_chunk_duration_seconds: u64) {
        self.active = false;
        self.reason.clear();
        self.dwell_multiplier = 1.0;
        self.skip_frequencies = 0;
        self.chunk_duration_seconds = default_chunk_duration_seconds;
        self.paused = false;
        self.activated_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_activation_sets_level_one() {
        let mut t = ThrottleState::new();
        let now = Utc::now();
        t.apply("cpu".to_string(), 30, now);
        assert!(t.active);
        assert_eq!(t.dwell_multiplier, 1.5);
        assert_eq!(t.chunk_duration_seconds, 45);
        assert_eq!(t.skip_frequencies, 1);
    }

    #[test]
    fn repeated_activation_escalates() {
        let mut t = ThrottleState::new();
        let now = Utc::now();
        t.apply("cpu".to_string(), 30, now);
        t.apply("cpu".to_string(), 30, now);
        assert_eq!(t.chunk_duration_seconds, 60);
        assert_eq!(t.skip_frequencies, 2);
        // escalation never touches dwell_multiplier downward
        assert_eq!(t.dwell_multiplier, 1.5);
    }

    #[test]
    fn release_restores_defaults() {
        let mut t = ThrottleState::new();
        let now = Utc::now();
        t.apply("cpu".to_string(), 30, now);
        t.paused = true;
        t.release(30);
        assert!(!t.active);
        assert_eq!(t.dwell_multiplier, 1.0);
        assert_eq!(t.skip_frequencies, 0);
        assert_eq!(t.chunk_duration_seconds, 30);
        assert!(!t.paused);
    }

    #[test]
    fn hysteresis_gates_release() {
        let mut t = ThrottleState::new();
        let t0 = Utc::now();
        t.apply("cpu".to_string(), 30, t0);
        assert!(!t.hysteresis_elapsed(30, t0 + chrono::Duration::seconds(10)));
        assert!(t.hysteresis_elapsed(30, t0 + chrono::Duration::seconds(31)));
    }

    #[test]
    fn inactive_throttle_never_reports_hysteresis_elapsed() {
        let t = ThrottleState::new();
        assert!(!t.hysteresis_elapsed(0, Utc::now()));
    }
}
