//! Adaptive inter-command timing.
//!
//! The engine pauses `current_delay` before every command. Successful replies
//! shrink the pause, errors and no-data replies grow it. The bounds depend on
//! the protocol family: CAN answers fast, ISO 9141-2 slowly.

use std::time::Duration;

use elm_protocol::{ProtocolId, ProtocolType};
use serde::{Deserialize, Serialize};

use crate::classifier::Classification;

/// Adapter-side adaptive timing mode (`ATAT0`/`1`/`2`), or host-fixed timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimingMode {
    Off,
    Normal,
    Aggressive,
    /// Adaptive timing could not be established; delays no longer adapt.
    Fixed,
}

impl TimingMode {
    pub fn at_command(self) -> Option<&'static str> {
        match self {
            TimingMode::Off => Some("ATAT0"),
            TimingMode::Normal => Some("ATAT1"),
            TimingMode::Aggressive => Some("ATAT2"),
            TimingMode::Fixed => None,
        }
    }
}

/// Timing bounds for one protocol family. All values in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimingProfile {
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_increment_ms")]
    pub increment_ms: u64,
    #[serde(default = "default_decrement_ms")]
    pub decrement_ms: u64,
    #[serde(default = "default_start_delay_ms")]
    pub start_delay_ms: u64,
    /// Adapter response timeout programmed with `ATST`.
    #[serde(default = "default_protocol_timeout_ms")]
    pub protocol_timeout_ms: u64,
}

fn default_min_delay_ms() -> u64 {
    20
}

fn default_max_delay_ms() -> u64 {
    500
}

fn default_increment_ms() -> u64 {
    50
}

fn default_decrement_ms() -> u64 {
    10
}

fn default_start_delay_ms() -> u64 {
    100
}

fn default_protocol_timeout_ms() -> u64 {
    // ATST64
    400
}

impl Default for TimingProfile {
    fn default() -> Self {
        Self {
            min_delay_ms: default_min_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            increment_ms: default_increment_ms(),
            decrement_ms: default_decrement_ms(),
            start_delay_ms: default_start_delay_ms(),
            protocol_timeout_ms: default_protocol_timeout_ms(),
        }
    }
}

fn scale(ms: u64, factor: f64) -> u64 {
    (ms as f64 * factor).round() as u64
}

impl TimingProfile {
    pub fn scaled(&self, factor: f64) -> Self {
        Self {
            min_delay_ms: scale(self.min_delay_ms, factor),
            max_delay_ms: scale(self.max_delay_ms, factor),
            increment_ms: scale(self.increment_ms, factor),
            decrement_ms: scale(self.decrement_ms, factor),
            start_delay_ms: scale(self.start_delay_ms, factor),
            protocol_timeout_ms: scale(self.protocol_timeout_ms, factor),
        }
    }

    /// Derive the profile for `protocol` from this base profile.
    pub fn for_protocol(&self, protocol: ProtocolId) -> Self {
        let factor = match protocol.protocol_type() {
            ProtocolType::Can => 0.6,
            ProtocolType::Iso9141 => 1.2,
            // 5-baud init KWP is the slower of the two.
            ProtocolType::Kwp if protocol.value() == 4 => 1.1,
            _ => 1.0,
        };
        self.scaled(factor)
    }

    /// `ATST<hex>`; the adapter counts in 4 ms units.
    pub fn timeout_command(&self) -> String {
        format!("ATST{:02X}", (self.protocol_timeout_ms / 4).clamp(1, 0xFF))
    }
}

/// Per-session delay state. `min <= current <= max` holds after every call.
#[derive(Debug, Clone)]
pub struct AdaptiveTiming {
    mode: TimingMode,
    current: Duration,
    min: Duration,
    max: Duration,
    increment: Duration,
    decrement: Duration,
    protocol_timeout: Duration,
}

impl AdaptiveTiming {
    pub fn new(profile: &TimingProfile) -> Self {
        let mut timing = Self {
            mode: TimingMode::Off,
            current: Duration::ZERO,
            min: Duration::ZERO,
            max: Duration::ZERO,
            increment: Duration::ZERO,
            decrement: Duration::ZERO,
            protocol_timeout: Duration::ZERO,
        };
        timing.apply_profile(profile, TimingMode::Off);
        timing
    }

    pub fn apply_profile(&mut self, profile: &TimingProfile, mode: TimingMode) {
        let min = profile.min_delay_ms.min(profile.max_delay_ms);
        let max = profile.min_delay_ms.max(profile.max_delay_ms);
        self.mode = mode;
        self.min = Duration::from_millis(min);
        self.max = Duration::from_millis(max);
        self.increment = Duration::from_millis(profile.increment_ms);
        self.decrement = Duration::from_millis(profile.decrement_ms);
        self.protocol_timeout = Duration::from_millis(profile.protocol_timeout_ms);
        self.current = Duration::from_millis(profile.start_delay_ms).clamp(self.min, self.max);
    }

    /// Stop adapting and pin the delay at its current value.
    pub fn fall_back_to_fixed(&mut self, protocol_timeout: Duration) {
        self.mode = TimingMode::Fixed;
        self.protocol_timeout = protocol_timeout;
    }

    pub fn set_mode(&mut self, mode: TimingMode) {
        self.mode = mode;
    }

    pub fn mode(&self) -> TimingMode {
        self.mode
    }

    pub fn current_delay(&self) -> Duration {
        self.current
    }

    pub fn min_delay(&self) -> Duration {
        self.min
    }

    pub fn max_delay(&self) -> Duration {
        self.max
    }

    pub fn protocol_timeout(&self) -> Duration {
        self.protocol_timeout
    }

    /// `ATST` command for the current protocol timeout (4 ms units).
    pub fn timeout_command(&self) -> String {
        let units = (self.protocol_timeout.as_millis() / 4).clamp(1, 0xFF);
        format!("ATST{units:02X}")
    }

    pub fn record_success(&mut self) {
        if self.mode == TimingMode::Fixed {
            return;
        }
        let step = match self.mode {
            TimingMode::Aggressive => self.decrement * 2,
            _ => self.decrement,
        };
        self.current = self.current.saturating_sub(step).max(self.min);
    }

    pub fn record_failure(&mut self) {
        if self.mode == TimingMode::Fixed {
            return;
        }
        self.current = (self.current + self.increment).min(self.max);
    }

    /// Feed one classified reply into the controller.
    pub fn adapt(&mut self, classification: &Classification) {
        match classification.timing_signal() {
            Some(true) => self.record_success(),
            Some(false) => self.record_failure(),
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn starts_at_start_delay() {
        let timing = AdaptiveTiming::new(&TimingProfile::default());
        assert_eq!(timing.current_delay(), ms(100));
        assert_eq!(timing.mode(), TimingMode::Off);
    }

    #[test]
    fn success_shrinks_failure_grows() {
        let mut timing = AdaptiveTiming::new(&TimingProfile::default());
        timing.record_success();
        assert_eq!(timing.current_delay(), ms(90));
        timing.record_failure();
        assert_eq!(timing.current_delay(), ms(140));
    }

    #[test]
    fn clamps_to_bounds() {
        let mut timing = AdaptiveTiming::new(&TimingProfile::default());
        for _ in 0..100 {
            timing.record_success();
        }
        assert_eq!(timing.current_delay(), ms(20));
        for _ in 0..100 {
            timing.record_failure();
        }
        assert_eq!(timing.current_delay(), ms(500));
    }

    #[test]
    fn fixed_mode_stops_adapting() {
        let mut timing = AdaptiveTiming::new(&TimingProfile::default());
        timing.fall_back_to_fixed(ms(400));
        timing.record_failure();
        timing.record_success();
        assert_eq!(timing.current_delay(), ms(100));
        assert_eq!(timing.mode(), TimingMode::Fixed);
    }

    #[test]
    fn adapts_from_classification() {
        let mut timing = AdaptiveTiming::new(&TimingProfile::default());
        timing.adapt(&crate::classifier::classify("NO DATA"));
        assert_eq!(timing.current_delay(), ms(150));
        timing.adapt(&crate::classifier::classify("SEARCHING..."));
        assert_eq!(timing.current_delay(), ms(150));
        timing.adapt(&crate::classifier::classify("43 00"));
        assert_eq!(timing.current_delay(), ms(140));
    }

    #[test]
    fn protocol_profiles() {
        let base = TimingProfile::default();
        let can = base.for_protocol(ProtocolId::new(6).unwrap());
        assert_eq!(can.start_delay_ms, 60);
        assert_eq!(can.protocol_timeout_ms, 240);
        let iso = base.for_protocol(ProtocolId::new(3).unwrap());
        assert_eq!(iso.max_delay_ms, 600);
        let kwp_slow = base.for_protocol(ProtocolId::new(4).unwrap());
        assert_eq!(kwp_slow.start_delay_ms, 110);
        let kwp_fast = base.for_protocol(ProtocolId::new(5).unwrap());
        assert_eq!(kwp_fast, base);
    }

    #[test]
    fn host_timeout_command_follows_profile() {
        let mut timing = AdaptiveTiming::new(&TimingProfile::default());
        assert_eq!(timing.timeout_command(), "ATST64");
        timing.fall_back_to_fixed(Duration::from_millis(1000));
        assert_eq!(timing.timeout_command(), "ATSTFA");
    }

    #[test]
    fn timeout_command_in_4ms_units() {
        assert_eq!(TimingProfile::default().timeout_command(), "ATST64");
        let long = TimingProfile {
            protocol_timeout_ms: 5000,
            ..TimingProfile::default()
        };
        assert_eq!(long.timeout_command(), "ATSTFF");
    }

    #[test]
    fn mode_commands() {
        assert_eq!(TimingMode::Off.at_command(), Some("ATAT0"));
        assert_eq!(TimingMode::Aggressive.at_command(), Some("ATAT2"));
        assert_eq!(TimingMode::Fixed.at_command(), None);
    }

    proptest! {
        #[test]
        fn delay_stays_within_bounds(
            min in 0u64..200,
            span in 0u64..800,
            start in 0u64..2000,
            inc in 0u64..300,
            dec in 0u64..300,
            aggressive in any::<bool>(),
            steps in proptest::collection::vec(any::<bool>(), 0..200),
        ) {
            let profile = TimingProfile {
                min_delay_ms: min,
                max_delay_ms: min + span,
                increment_ms: inc,
                decrement_ms: dec,
                start_delay_ms: start,
                protocol_timeout_ms: 400,
            };
            let mode = if aggressive { TimingMode::Aggressive } else { TimingMode::Normal };
            let mut timing = AdaptiveTiming::new(&profile);
            timing.apply_profile(&profile, mode);
            for success in steps {
                if success { timing.record_success() } else { timing.record_failure() }
                prop_assert!(timing.min_delay() <= timing.current_delay());
                prop_assert!(timing.current_delay() <= timing.max_delay());
            }
        }
    }
}
