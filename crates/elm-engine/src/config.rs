//! Engine configuration.
//!
//! Deserialized from the `[engine]` section of the scan configuration; every
//! field has a default so an empty section is valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::timing::TimingProfile;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Pause after `ATZ` while the adapter reboots.
    #[serde(default = "default_reset_delay_ms")]
    pub reset_delay_ms: u64,
    /// Pause after `ATSP<n>` before the first probe.
    #[serde(default = "default_protocol_delay_ms")]
    pub protocol_delay_ms: u64,
    #[serde(default = "default_at_timeout_ms")]
    pub at_timeout_ms: u64,
    #[serde(default = "default_can_data_timeout_ms")]
    pub can_data_timeout_ms: u64,
    /// Slow-init buses answer late; also used while the protocol is unknown.
    #[serde(default = "default_non_can_data_timeout_ms")]
    pub non_can_data_timeout_ms: u64,
    #[serde(default = "default_vin_can_timeout_ms")]
    pub vin_can_timeout_ms: u64,
    #[serde(default = "default_vin_non_can_timeout_ms")]
    pub vin_non_can_timeout_ms: u64,
    /// How long to wait for a reply owed to an abandoned command.
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
    #[serde(default = "default_dpn_attempts")]
    pub dpn_attempts: u32,
    #[serde(default = "default_dpn_retry_delay_ms")]
    pub dpn_retry_delay_ms: u64,
    #[serde(default = "default_initial_ping_attempts")]
    pub initial_ping_attempts: u32,
    #[serde(default = "default_candidate_ping_attempts")]
    pub candidate_ping_attempts: u32,
    #[serde(default = "default_ping_retry_delay_ms")]
    pub ping_retry_delay_ms: u64,
    #[serde(default = "default_dtc_attempts")]
    pub dtc_attempts: u32,
    #[serde(default = "default_dtc_backoff_ms")]
    pub dtc_backoff_ms: u64,
    #[serde(default = "default_vin_attempts")]
    pub vin_attempts: u32,
    #[serde(default = "default_vin_retry_delay_ms")]
    pub vin_retry_delay_ms: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Permit mode `04` (clear DTCs). Off unless explicitly enabled.
    #[serde(default)]
    pub allow_clear_dtcs: bool,
    #[serde(default)]
    pub timing: TimingProfile,
}

fn default_reset_delay_ms() -> u64 {
    1000
}

fn default_protocol_delay_ms() -> u64 {
    300
}

fn default_at_timeout_ms() -> u64 {
    1000
}

fn default_can_data_timeout_ms() -> u64 {
    2000
}

fn default_non_can_data_timeout_ms() -> u64 {
    5000
}

fn default_vin_can_timeout_ms() -> u64 {
    3000
}

fn default_vin_non_can_timeout_ms() -> u64 {
    6000
}

fn default_drain_timeout_ms() -> u64 {
    500
}

fn default_dpn_attempts() -> u32 {
    10
}

fn default_dpn_retry_delay_ms() -> u64 {
    500
}

fn default_initial_ping_attempts() -> u32 {
    5
}

fn default_candidate_ping_attempts() -> u32 {
    3
}

fn default_ping_retry_delay_ms() -> u64 {
    300
}

fn default_dtc_attempts() -> u32 {
    3
}

fn default_dtc_backoff_ms() -> u64 {
    1000
}

fn default_vin_attempts() -> u32 {
    3
}

fn default_vin_retry_delay_ms() -> u64 {
    1000
}

fn default_queue_capacity() -> usize {
    32
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reset_delay_ms: default_reset_delay_ms(),
            protocol_delay_ms: default_protocol_delay_ms(),
            at_timeout_ms: default_at_timeout_ms(),
            can_data_timeout_ms: default_can_data_timeout_ms(),
            non_can_data_timeout_ms: default_non_can_data_timeout_ms(),
            vin_can_timeout_ms: default_vin_can_timeout_ms(),
            vin_non_can_timeout_ms: default_vin_non_can_timeout_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
            dpn_attempts: default_dpn_attempts(),
            dpn_retry_delay_ms: default_dpn_retry_delay_ms(),
            initial_ping_attempts: default_initial_ping_attempts(),
            candidate_ping_attempts: default_candidate_ping_attempts(),
            ping_retry_delay_ms: default_ping_retry_delay_ms(),
            dtc_attempts: default_dtc_attempts(),
            dtc_backoff_ms: default_dtc_backoff_ms(),
            vin_attempts: default_vin_attempts(),
            vin_retry_delay_ms: default_vin_retry_delay_ms(),
            queue_capacity: default_queue_capacity(),
            allow_clear_dtcs: false,
            timing: TimingProfile::default(),
        }
    }
}

impl EngineConfig {
    pub fn at_timeout(&self) -> Duration {
        Duration::from_millis(self.at_timeout_ms)
    }

    pub fn data_timeout(&self, can: bool) -> Duration {
        Duration::from_millis(if can {
            self.can_data_timeout_ms
        } else {
            self.non_can_data_timeout_ms
        })
    }

    pub fn vin_timeout(&self, can: bool) -> Duration {
        Duration::from_millis(if can {
            self.vin_can_timeout_ms
        } else {
            self.vin_non_can_timeout_ms
        })
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_section_uses_defaults() {
        let config: EngineConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.dpn_attempts, 10);
        assert_eq!(config.dtc_attempts, 3);
        assert!(!config.allow_clear_dtcs);
    }

    #[test]
    fn partial_override() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"reset_delay_ms": 250, "timing": {"max_delay_ms": 900}}"#)
                .unwrap();
        assert_eq!(config.reset_delay_ms, 250);
        assert_eq!(config.timing.max_delay_ms, 900);
        assert_eq!(config.timing.min_delay_ms, 20);
    }

    #[test]
    fn non_can_waits_longer() {
        let config = EngineConfig::default();
        assert!(config.data_timeout(false) > config.data_timeout(true));
        assert!(config.data_timeout(true) > config.at_timeout());
        assert!(config.vin_timeout(false) > config.vin_timeout(true));
    }
}
