use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::ProtocolSnapshot;

/// Which trouble-code memory a service mode reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TroubleCodeType {
    /// Mode 03: confirmed codes that lit the MIL.
    Current,
    /// Mode 07: detected during the current or last drive cycle.
    Pending,
    /// Mode 0A: cannot be cleared by a scan tool.
    Permanent,
}

/// One of the three OBD-II DTC read services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtcServiceMode {
    /// Request string sent to the adapter (e.g. `"03"`).
    pub request_code: &'static str,
    /// Positive response service byte (request + 0x40).
    pub response_byte: u8,
    pub name: &'static str,
    pub description: &'static str,
    pub trouble_code_type: TroubleCodeType,
}

impl DtcServiceMode {
    /// Positive response byte as two uppercase hex digits.
    pub fn response_prefix(&self) -> String {
        format!("{:02X}", self.response_byte)
    }

    pub fn all() -> [&'static DtcServiceMode; 3] {
        [&CURRENT_DTCS, &PENDING_DTCS, &PERMANENT_DTCS]
    }

    pub fn for_type(kind: TroubleCodeType) -> &'static DtcServiceMode {
        match kind {
            TroubleCodeType::Current => &CURRENT_DTCS,
            TroubleCodeType::Pending => &PENDING_DTCS,
            TroubleCodeType::Permanent => &PERMANENT_DTCS,
        }
    }
}

pub static CURRENT_DTCS: DtcServiceMode = DtcServiceMode {
    request_code: "03",
    response_byte: 0x43,
    name: "Current",
    description: "Stored diagnostic trouble codes",
    trouble_code_type: TroubleCodeType::Current,
};

pub static PENDING_DTCS: DtcServiceMode = DtcServiceMode {
    request_code: "07",
    response_byte: 0x47,
    name: "Pending",
    description: "Pending diagnostic trouble codes (current or last drive cycle)",
    trouble_code_type: TroubleCodeType::Pending,
};

pub static PERMANENT_DTCS: DtcServiceMode = DtcServiceMode {
    request_code: "0A",
    response_byte: 0x4A,
    name: "Permanent",
    description: "Permanent diagnostic trouble codes",
    trouble_code_type: TroubleCodeType::Permanent,
};

/// Verified result of one DTC read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DtcResponse {
    #[serde(rename = "type")]
    pub kind: String,
    pub service: String,
    pub service_name: String,
    pub service_description: String,
    pub trouble_code_type: TroubleCodeType,
    /// Header-stripped payload per frame; empty means "no codes".
    pub raw_frames: Vec<String>,
    /// Adapter text exactly as received.
    pub raw_string: String,
    pub protocol_info: ProtocolSnapshot,
    pub timestamp: DateTime<Utc>,
}

impl DtcResponse {
    pub const KIND: &'static str = "dtc";

    pub fn new(
        mode: &DtcServiceMode,
        raw_frames: Vec<String>,
        raw_string: impl Into<String>,
        protocol_info: ProtocolSnapshot,
    ) -> Self {
        Self {
            kind: Self::KIND.to_string(),
            service: mode.request_code.to_string(),
            service_name: mode.name.to_string(),
            service_description: mode.description.to_string(),
            trouble_code_type: mode.trouble_code_type,
            raw_frames,
            raw_string: raw_string.into(),
            protocol_info,
            timestamp: Utc::now(),
        }
    }

    /// True when the ECU reported no codes for this service.
    pub fn is_empty(&self) -> bool {
        self.raw_frames.is_empty()
    }
}

/// Decoded OBD-II Diagnostic Trouble Code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtcCode {
    /// Standard DTC string (e.g., "P0300", "C0035").
    pub code: String,
    /// DTC category derived from first character.
    pub category: DtcCategory,
}

/// DTC category based on first character of code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DtcCategory {
    /// P: Powertrain (engine, transmission).
    Powertrain,
    /// C: Chassis (ABS, steering).
    Chassis,
    /// B: Body (airbags, AC, lighting).
    Body,
    /// U: Network/Communication (CAN bus errors).
    Network,
}

impl DtcCode {
    pub fn new(code: impl Into<String>) -> Self {
        let code = code.into();
        let category = Self::parse_category(&code);
        Self { code, category }
    }

    /// Parse DTC category from the code string.
    pub fn parse_category(code: &str) -> DtcCategory {
        match code.chars().next() {
            Some('P' | 'p') => DtcCategory::Powertrain,
            Some('C' | 'c') => DtcCategory::Chassis,
            Some('B' | 'b') => DtcCategory::Body,
            Some('U' | 'u') => DtcCategory::Network,
            _ => DtcCategory::Powertrain, // Default per SAE J2012
        }
    }
}
