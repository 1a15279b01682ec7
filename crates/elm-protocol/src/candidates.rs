//! Priority table of protocol configurations tried during detection.
//!
//! Lower `priority` values are tried first. Protocols without a table entry
//! get a configuration synthesized from their addressing width.

use serde::Serialize;

use crate::protocol::ProtocolId;

/// Functional broadcast header for 11-bit CAN.
pub const CAN_11BIT_BROADCAST_HEADER: &str = "7DF";
/// Physical engine ECU request header for 11-bit CAN.
pub const CAN_11BIT_ENGINE_HEADER: &str = "7E0";
/// Engine ECU response header for 11-bit CAN.
pub const CAN_11BIT_ENGINE_RESPONSE: &str = "7E8";
/// Functional broadcast header for 29-bit CAN.
pub const CAN_29BIT_BROADCAST_HEADER: &str = "18DB33F1";
/// Engine ECU response header for 29-bit CAN.
pub const CAN_29BIT_ENGINE_RESPONSE: &str = "18DAF110";
/// Flow-control header addressed to the 29-bit engine ECU.
pub const CAN_29BIT_FLOW_CONTROL_HEADER: &str = "18DA10F1";

/// One way of talking to the vehicle: protocol number plus CAN addressing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProtocolConfig {
    pub protocol: ProtocolId,
    pub priority: u8,
    pub description: &'static str,
    /// Request header (`ATSH`), CAN only.
    pub header: Option<&'static str>,
    /// Receive filter (`ATCF`), CAN only.
    pub receive_filter: Option<&'static str>,
    /// Header used for flow-control frames (`ATFCSH`), CAN only.
    pub flow_control_header: Option<&'static str>,
    /// Whether `ATCAF1` should be sent before probing.
    pub can_auto_format: bool,
}

impl ProtocolConfig {
    pub fn is_can(&self) -> bool {
        self.protocol.is_can()
    }

    /// The AT commands that configure CAN addressing for this candidate.
    pub fn can_commands(&self) -> Vec<String> {
        if !self.is_can() {
            return Vec::new();
        }
        let mut commands = Vec::new();
        if self.can_auto_format {
            commands.push("ATCAF1".to_string());
        }
        if let Some(header) = self.header {
            commands.push(format!("ATSH{header}"));
        }
        if let Some(filter) = self.receive_filter {
            commands.push(format!("ATCF{filter}"));
        }
        commands
    }
}

const fn can(
    id: u8,
    priority: u8,
    description: &'static str,
    header: &'static str,
    receive_filter: &'static str,
    flow_control_header: &'static str,
) -> ProtocolConfig {
    ProtocolConfig {
        protocol: ProtocolId::from_table(id),
        priority,
        description,
        header: Some(header),
        receive_filter: Some(receive_filter),
        flow_control_header: Some(flow_control_header),
        can_auto_format: true,
    }
}

const fn serial(id: u8, priority: u8, description: &'static str) -> ProtocolConfig {
    ProtocolConfig {
        protocol: ProtocolId::from_table(id),
        priority,
        description,
        header: None,
        receive_filter: None,
        flow_control_header: None,
        can_auto_format: false,
    }
}

/// Known-good configurations in detection order.
pub static PRIORITY_TABLE: &[ProtocolConfig] = &[
    can(6, 1, "CAN 11/500 broadcast", "7DF", "7E8", "7E0"),
    can(6, 2, "CAN 11/500 engine ECU", "7E0", "7E8", "7E0"),
    can(8, 3, "CAN 11/250 broadcast", "7DF", "7E8", "7E0"),
    can(8, 4, "CAN 11/250 engine ECU", "7E0", "7E8", "7E0"),
    can(7, 5, "CAN 29/500 broadcast", "18DB33F1", "18DAF110", "18DA10F1"),
    can(9, 6, "CAN 29/250 broadcast", "18DB33F1", "18DAF110", "18DA10F1"),
    serial(3, 7, "ISO 9141-2"),
    serial(4, 8, "ISO 14230-4 KWP slow init"),
    serial(5, 9, "ISO 14230-4 KWP fast init"),
    serial(1, 10, "SAE J1850 PWM"),
    serial(2, 11, "SAE J1850 VPW"),
    can(10, 12, "SAE J1939", "18DB33F1", "18DAF110", "18DA10F1"),
    can(11, 13, "USER1 CAN 11/125", "7DF", "7E8", "7E0"),
    can(12, 14, "USER2 CAN 11/50", "7DF", "7E8", "7E0"),
];

/// Priority assigned to configurations built on the fly.
const SYNTHESIZED_PRIORITY: u8 = 100;

/// Candidate configurations for a detected protocol, in try order.
///
/// `None` (or `Auto`) means nothing was detected: every table entry for
/// protocols 1–9 is returned.
pub fn candidates_for(detected: Option<ProtocolId>) -> Vec<ProtocolConfig> {
    let mut candidates: Vec<ProtocolConfig> = match detected {
        Some(protocol) if !protocol.is_auto() => {
            let matching: Vec<ProtocolConfig> = PRIORITY_TABLE
                .iter()
                .filter(|c| c.protocol == protocol)
                .cloned()
                .collect();
            if matching.is_empty() {
                synthesize(protocol)
            } else {
                matching
            }
        }
        _ => PRIORITY_TABLE
            .iter()
            .filter(|c| (1..=9).contains(&c.protocol.value()))
            .cloned()
            .collect(),
    };
    candidates.sort_by_key(|c| c.priority);
    candidates
}

/// Build configurations for a protocol that has no table entry.
pub fn synthesize(protocol: ProtocolId) -> Vec<ProtocolConfig> {
    if protocol.is_can() && protocol.is_29bit() {
        vec![ProtocolConfig {
            protocol,
            priority: SYNTHESIZED_PRIORITY,
            description: protocol.description(),
            header: Some(CAN_29BIT_BROADCAST_HEADER),
            receive_filter: None,
            flow_control_header: Some(CAN_29BIT_FLOW_CONTROL_HEADER),
            can_auto_format: true,
        }]
    } else if protocol.is_can() {
        [CAN_11BIT_BROADCAST_HEADER, CAN_11BIT_ENGINE_HEADER]
            .into_iter()
            .enumerate()
            .map(|(i, header)| ProtocolConfig {
                protocol,
                priority: SYNTHESIZED_PRIORITY + i as u8,
                description: protocol.description(),
                header: Some(header),
                receive_filter: None,
                flow_control_header: Some(CAN_11BIT_ENGINE_HEADER),
                can_auto_format: true,
            })
            .collect()
    } else {
        vec![ProtocolConfig {
            protocol,
            priority: SYNTHESIZED_PRIORITY,
            description: protocol.description(),
            header: None,
            receive_filter: None,
            flow_control_header: None,
            can_auto_format: false,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_protocol_has_a_candidate() {
        for id in 1..=20 {
            let protocol = ProtocolId::new(id).unwrap();
            let candidates = candidates_for(Some(protocol));
            assert!(!candidates.is_empty(), "protocol {id} has no candidates");
            assert!(candidates.iter().all(|c| c.protocol == protocol));
        }
    }

    #[test]
    fn candidates_in_priority_order() {
        for id in 0..=20 {
            let candidates = candidates_for(ProtocolId::new(id));
            assert!(
                candidates.windows(2).all(|w| w[0].priority <= w[1].priority),
                "protocol {id} candidates out of order"
            );
        }
    }

    #[test]
    fn undetected_falls_back_to_legacy_and_standard_can() {
        let candidates = candidates_for(None);
        assert_eq!(candidates.first().unwrap().protocol.value(), 6);
        assert!(candidates.iter().all(|c| (1..=9).contains(&c.protocol.value())));
        assert_eq!(candidates_for(Some(ProtocolId::AUTO)), candidates);
    }

    #[test]
    fn synthesized_11bit_has_two_headers() {
        let candidates = candidates_for(ProtocolId::new(13));
        let headers: Vec<_> = candidates.iter().filter_map(|c| c.header).collect();
        assert_eq!(headers, vec!["7DF", "7E0"]);
    }

    #[test]
    fn synthesized_29bit_uses_broadcast_header() {
        let candidates = candidates_for(ProtocolId::new(16));
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].header, Some("18DB33F1"));
    }

    #[test]
    fn can_commands_for_table_entry() {
        let first = &candidates_for(ProtocolId::new(6))[0];
        assert_eq!(first.can_commands(), vec!["ATCAF1", "ATSH7DF", "ATCF7E8"]);
        let kwp = &candidates_for(ProtocolId::new(4))[0];
        assert!(kwp.can_commands().is_empty());
    }
}
