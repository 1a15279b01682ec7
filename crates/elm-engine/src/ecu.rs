//! ECU address discovery from header-on replies.
//!
//! Each reply line is normalized, then the service-response marker (`41` for
//! mode 01, `7F01` for its negative response, `4902`/`4901` for mode 09)
//! marks the end of the address. The start is the last `.` before it, or the
//! line start. The span length decides the address layout:
//!
//! | span | layout | address |
//! |------|--------|---------|
//! | odd | CAN 11-bit header + frame type | 3 chars from start |
//! | 6 | ISO 9141 / KWP `<hdr><addr><fmt>` | 2 chars ending at the marker |
//! | 10 | CAN 29-bit header + frame type | 8 chars from start |
//! | other | unknown | the whole span |
//!
//! A known bit-width hint is tried before the span rule.

use std::sync::LazyLock;

use elm_protocol::HeaderFormat;
use regex::Regex;

use crate::classifier::normalize;

static RE_CAN_11BIT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^7E[0-9A-F]").unwrap());

/// Markers for a mode 01 probe.
pub const MODE_01_MARKERS: &[&str] = &["41", "7F01"];
/// Markers for the mode 09 probes used during detection.
pub const MODE_09_MARKERS: &[&str] = &["4902", "4901", "7F09"];

/// CAN addressing width, when already known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitFormatHint {
    Bit11,
    Bit29,
}

impl BitFormatHint {
    pub fn from_header_format(format: HeaderFormat) -> Option<Self> {
        match format {
            HeaderFormat::Can11Bit => Some(BitFormatHint::Bit11),
            HeaderFormat::Can29Bit => Some(BitFormatHint::Bit29),
            _ => None,
        }
    }
}

fn hinted_address(line: &str, hint: BitFormatHint) -> Option<String> {
    match hint {
        BitFormatHint::Bit29 if line.starts_with("18DA") => line.get(..8).map(str::to_string),
        BitFormatHint::Bit11 if RE_CAN_11BIT_LINE.is_match(line) => line.get(..3).map(str::to_string),
        _ => None,
    }
}

fn span_address(line: &str, markers: &[&str]) -> Option<String> {
    let end = markers.iter().filter_map(|m| line.find(m)).min()?;
    let start = line[..end].rfind('.').map_or(0, |dot| dot + 1);
    let span = &line[start..end];
    let address = match span.len() {
        0 => return None,
        len if len % 2 == 1 => span.get(..3)?,
        6 => span.get(4..)?,
        10 => span.get(..8)?,
        _ => span,
    };
    Some(address.to_string())
}

/// Extract the address from one normalized line.
pub fn address_in_line(line: &str, markers: &[&str], hint: Option<BitFormatHint>) -> Option<String> {
    hint.and_then(|h| hinted_address(line, h))
        .or_else(|| span_address(line, markers))
}

/// All distinct addresses in a raw reply, in discovery order.
pub fn extract_ecu_addresses(
    raw: &str,
    markers: &[&str],
    hint: Option<BitFormatHint>,
) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for line in raw.split(['\r', '\n']) {
        let line = normalize(line);
        if line.is_empty() {
            continue;
        }
        if let Some(address) = address_in_line(&line, markers, hint) {
            if !found.contains(&address) {
                found.push(address);
            }
        }
    }
    found
}

/// Request header that targets `address` under `format`.
pub fn header_for_address(address: &str, format: HeaderFormat) -> String {
    match format {
        HeaderFormat::Can11Bit if address.starts_with("7E") => address.to_string(),
        HeaderFormat::Can11Bit => format!("7E{address}"),
        HeaderFormat::Can29Bit if address.starts_with("18DA") => address.to_string(),
        HeaderFormat::Can29Bit => format!("18DA{address}"),
        HeaderFormat::Iso9141 | HeaderFormat::Kwp => format!("68{address}6B"),
        HeaderFormat::J1850 | HeaderFormat::Unknown => address.to_string(),
    }
}
