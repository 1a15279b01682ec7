//! ELM327 protocol numbers, their bus families, and addressing widths.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Highest protocol number in the table.
pub const MAX_PROTOCOL_ID: u8 = 20;

/// Protocol numbers that use 29-bit CAN identifiers.
const CAN_29BIT_IDS: &[u8] = &[7, 9, 10, 14, 16, 18, 20];

/// Response framing family reported for a protocol number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    Auto,
    J1850,
    Iso9141,
    Kwp,
    Can,
}

/// Bus family the session is currently talking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolType {
    Can,
    Iso9141,
    Kwp,
    J1850,
    Auto,
    #[default]
    Unknown,
}

/// Layout of the header bytes that precede each response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HeaderFormat {
    #[serde(rename = "can_11bit")]
    Can11Bit,
    #[serde(rename = "can_29bit")]
    Can29Bit,
    Kwp,
    Iso9141,
    J1850,
    #[default]
    Unknown,
}

impl HeaderFormat {
    pub fn is_can(self) -> bool {
        matches!(self, HeaderFormat::Can11Bit | HeaderFormat::Can29Bit)
    }
}

/// Static description of one protocol number.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolInfo {
    pub id: u8,
    pub description: &'static str,
    pub response_type: ResponseType,
}

const fn info(id: u8, description: &'static str, response_type: ResponseType) -> ProtocolInfo {
    ProtocolInfo {
        id,
        description,
        response_type,
    }
}

static PROTOCOL_TABLE: [ProtocolInfo; 21] = [
    info(0, "Automatic", ResponseType::Auto),
    info(1, "SAE J1850 PWM (41.6 kbaud)", ResponseType::J1850),
    info(2, "SAE J1850 VPW (10.4 kbaud)", ResponseType::J1850),
    info(3, "ISO 9141-2 (5 baud init, 10.4 kbaud)", ResponseType::Iso9141),
    info(4, "ISO 14230-4 KWP (5 baud init, 10.4 kbaud)", ResponseType::Kwp),
    info(5, "ISO 14230-4 KWP (fast init, 10.4 kbaud)", ResponseType::Kwp),
    info(6, "ISO 15765-4 CAN (11 bit ID, 500 kbaud)", ResponseType::Can),
    info(7, "ISO 15765-4 CAN (29 bit ID, 500 kbaud)", ResponseType::Can),
    info(8, "ISO 15765-4 CAN (11 bit ID, 250 kbaud)", ResponseType::Can),
    info(9, "ISO 15765-4 CAN (29 bit ID, 250 kbaud)", ResponseType::Can),
    info(10, "SAE J1939 CAN (29 bit ID, 250 kbaud)", ResponseType::Can),
    info(11, "USER1 CAN (11 bit ID, 125 kbaud)", ResponseType::Can),
    info(12, "USER2 CAN (11 bit ID, 50 kbaud)", ResponseType::Can),
    info(13, "ISO 15765-4 CAN (11 bit ID, 1000 kbaud)", ResponseType::Can),
    info(14, "ISO 15765-4 CAN (29 bit ID, 1000 kbaud)", ResponseType::Can),
    info(15, "ISO 15765-4 CAN (11 bit ID, 125 kbaud)", ResponseType::Can),
    info(16, "ISO 15765-4 CAN (29 bit ID, 125 kbaud)", ResponseType::Can),
    info(17, "ISO 15765-4 CAN (11 bit ID, 50 kbaud)", ResponseType::Can),
    info(18, "ISO 15765-4 CAN (29 bit ID, 50 kbaud)", ResponseType::Can),
    info(19, "ISO 15765-4 CAN (11 bit ID, 33.3 kbaud)", ResponseType::Can),
    info(20, "ISO 15765-4 CAN (29 bit ID, 33.3 kbaud)", ResponseType::Can),
];

#[derive(Debug, Error, PartialEq, Eq)]
#[error("protocol number {0} is outside 0..={MAX_PROTOCOL_ID}")]
pub struct InvalidProtocolId(pub u8);

/// An ELM327 protocol number, 0 (automatic) through 20.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct ProtocolId(u8);

impl ProtocolId {
    pub const AUTO: ProtocolId = ProtocolId(0);

    pub fn new(id: u8) -> Option<Self> {
        (id <= MAX_PROTOCOL_ID).then_some(Self(id))
    }

    /// Only for table literals; callers must pass an in-range number.
    pub(crate) const fn from_table(id: u8) -> Self {
        Self(id)
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn is_auto(self) -> bool {
        self.0 == 0
    }

    /// Every protocol number, `Auto` first.
    pub fn all() -> impl Iterator<Item = ProtocolId> {
        (0..=MAX_PROTOCOL_ID).map(ProtocolId)
    }

    pub fn info(self) -> &'static ProtocolInfo {
        &PROTOCOL_TABLE[self.0 as usize]
    }

    pub fn description(self) -> &'static str {
        self.info().description
    }

    pub fn response_type(self) -> ResponseType {
        self.info().response_type
    }

    pub fn is_can(self) -> bool {
        self.response_type() == ResponseType::Can
    }

    pub fn is_29bit(self) -> bool {
        CAN_29BIT_IDS.contains(&self.0)
    }

    pub fn protocol_type(self) -> ProtocolType {
        match self.response_type() {
            ResponseType::Auto => ProtocolType::Auto,
            ResponseType::J1850 => ProtocolType::J1850,
            ResponseType::Iso9141 => ProtocolType::Iso9141,
            ResponseType::Kwp => ProtocolType::Kwp,
            ResponseType::Can => ProtocolType::Can,
        }
    }

    pub fn header_format(self) -> HeaderFormat {
        match self.response_type() {
            ResponseType::Auto => HeaderFormat::Unknown,
            ResponseType::J1850 => HeaderFormat::J1850,
            ResponseType::Iso9141 => HeaderFormat::Iso9141,
            ResponseType::Kwp => HeaderFormat::Kwp,
            ResponseType::Can if self.is_29bit() => HeaderFormat::Can29Bit,
            ResponseType::Can => HeaderFormat::Can11Bit,
        }
    }

    /// `ATSP` command selecting this protocol.
    ///
    /// The adapter only accepts single hex digits up to `C`; the extended CAN
    /// variants (13–20) are selected through the standard 500 kbaud protocol
    /// of the same identifier width.
    pub fn set_command(self) -> String {
        let code = match self.0 {
            0..=12 => self.0,
            _ if self.is_29bit() => 7,
            _ => 6,
        };
        format!("ATSP{code:X}")
    }
}

impl Default for ProtocolId {
    fn default() -> Self {
        Self::AUTO
    }
}

impl TryFrom<u8> for ProtocolId {
    type Error = InvalidProtocolId;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        ProtocolId::new(value).ok_or(InvalidProtocolId(value))
    }
}

impl From<ProtocolId> for u8 {
    fn from(id: ProtocolId) -> Self {
        id.0
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.0, self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_indexed_by_id() {
        for id in ProtocolId::all() {
            assert_eq!(id.info().id, id.value());
        }
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(ProtocolId::new(21).is_none());
        assert_eq!(ProtocolId::try_from(42), Err(InvalidProtocolId(42)));
    }

    #[test]
    fn can_addressing_width() {
        let p6 = ProtocolId::new(6).unwrap();
        let p7 = ProtocolId::new(7).unwrap();
        let p10 = ProtocolId::new(10).unwrap();
        let p11 = ProtocolId::new(11).unwrap();
        assert_eq!(p6.header_format(), HeaderFormat::Can11Bit);
        assert_eq!(p7.header_format(), HeaderFormat::Can29Bit);
        assert_eq!(p10.header_format(), HeaderFormat::Can29Bit);
        assert_eq!(p11.header_format(), HeaderFormat::Can11Bit);
    }

    #[test]
    fn legacy_families() {
        assert_eq!(ProtocolId::new(1).unwrap().protocol_type(), ProtocolType::J1850);
        assert_eq!(ProtocolId::new(3).unwrap().header_format(), HeaderFormat::Iso9141);
        assert_eq!(ProtocolId::new(5).unwrap().protocol_type(), ProtocolType::Kwp);
        assert!(!ProtocolId::new(4).unwrap().is_can());
        assert_eq!(ProtocolId::AUTO.protocol_type(), ProtocolType::Auto);
    }

    #[test]
    fn set_commands() {
        assert_eq!(ProtocolId::AUTO.set_command(), "ATSP0");
        assert_eq!(ProtocolId::new(6).unwrap().set_command(), "ATSP6");
        assert_eq!(ProtocolId::new(12).unwrap().set_command(), "ATSPC");
        assert_eq!(ProtocolId::new(14).unwrap().set_command(), "ATSP7");
        assert_eq!(ProtocolId::new(15).unwrap().set_command(), "ATSP6");
    }

    #[test]
    fn serializes_as_number() {
        let id = ProtocolId::new(6).unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "6");
        let back: ProtocolId = serde_json::from_str("9").unwrap();
        assert_eq!(back.value(), 9);
        assert!(serde_json::from_str::<ProtocolId>("33").is_err());
    }
}
