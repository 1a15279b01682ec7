//! Serializable session-level types shared between the engine and reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::{HeaderFormat, ProtocolType};

/// Lifecycle of the session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    #[default]
    Initialized,
    Configuring,
    Ready,
    Error,
}

/// Connection-level progress of the detection engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Initializing,
    EcuDetect,
    EcuDetected,
    Connected,
    Error,
}

/// Adapter formatting flags, as last acknowledged by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct CommFlags {
    pub header_enabled: bool,
    pub echo_enabled: bool,
    pub linefeeds_disabled: bool,
    pub spaces_disabled: bool,
}

impl Default for CommFlags {
    /// Power-on adapter defaults.
    fn default() -> Self {
        Self {
            header_enabled: false,
            echo_enabled: true,
            linefeeds_disabled: false,
            spaces_disabled: false,
        }
    }
}

impl CommFlags {
    /// Flags that retrieval parsing requires: everything off.
    pub const RETRIEVAL: CommFlags = CommFlags {
        header_enabled: false,
        echo_enabled: false,
        linefeeds_disabled: true,
        spaces_disabled: true,
    };

    pub fn is_clean_for_retrieval(&self) -> bool {
        *self == Self::RETRIEVAL
    }

    /// Detection keeps headers on for address discovery; spaces are stripped
    /// by the classifier either way.
    pub fn is_clean_for_detection(&self) -> bool {
        self.header_enabled && !self.echo_enabled && self.linefeeds_disabled
    }
}

/// Point-in-time copy of the session, attached to results and errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolSnapshot {
    pub session_id: Uuid,
    pub protocol_id: u8,
    pub protocol_name: String,
    pub protocol_type: ProtocolType,
    pub header_format: HeaderFormat,
    pub is_auto_detected: bool,
    pub ecu_addresses: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selected_ecu_address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<String>,
    pub comm_flags: CommFlags,
    pub lifecycle: LifecycleState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adapter_version: Option<String>,
    pub captured_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retrieval_flags() {
        assert!(CommFlags::RETRIEVAL.is_clean_for_retrieval());
        assert!(!CommFlags::default().is_clean_for_retrieval());
    }

    #[test]
    fn detection_flags_need_headers() {
        let flags = CommFlags {
            header_enabled: true,
            echo_enabled: false,
            linefeeds_disabled: true,
            spaces_disabled: false,
        };
        assert!(flags.is_clean_for_detection());
        assert!(!CommFlags::RETRIEVAL.is_clean_for_detection());
    }

    #[test]
    fn lifecycle_serialization() {
        assert_eq!(
            serde_json::to_string(&LifecycleState::Ready).unwrap(),
            r#""READY""#
        );
        assert_eq!(
            serde_json::to_string(&ConnectionState::EcuDetected).unwrap(),
            r#""ecu_detected""#
        );
    }
}
