//! Format verification and frame extraction for DTC replies.

use std::sync::LazyLock;

use elm_protocol::{DtcServiceMode, HeaderFormat};
use regex::Regex;

use crate::classifier::{Classification, ResponseKind, classify, lines};

static RE_CAN_11BIT_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^7E[1-9A-F]").unwrap());

static RE_CAN_29BIT_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^18DAF1[0-9A-F]{2}").unwrap());

static RE_FRAME_INDEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9A-F]:.+").unwrap());

static RE_SERVICE_RESPONSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(43|47|4A|7F)").unwrap());

// ISO 9141-2 / J1850 `48 6B 10`, KWP `83 F1 10`.
static RE_LEGACY_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([0-9A-F]{2}6B[0-9A-F]{2}|8[0-9A-F]F1[0-9A-F]{2})").unwrap()
});

static RE_DECIMAL_BYTES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]{1,3}(,[0-9]{1,3})+,?$").unwrap());

// ISO-TP byte count printed before indexed segments.
static RE_LENGTH_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^0[0-9A-F]{1,3}$").unwrap());

/// Texts that mean "no codes stored".
const EMPTY_MARKERS: &[&str] = &["NODATA", "NODTCS"];
const EMPTY_REPLIES: &[&str] = &["OK", "NONE", "NOERROR"];

fn is_can_header_line(line: &str) -> bool {
    RE_CAN_11BIT_HEADER.is_match(line) || RE_CAN_29BIT_HEADER.is_match(line)
}

/// Whether a DTC reply passes format verification.
///
/// CAN replies must carry a recognizable response header or, with headers
/// off, an indexed segment or a service-response line. Other buses accept a
/// legacy header, the service response byte, or a decimal byte list.
pub fn verify_dtc_reply(
    reply: &Classification,
    mode: &DtcServiceMode,
    format: HeaderFormat,
    headers_enabled: bool,
) -> bool {
    if reply.kind.is_error() || reply.is_empty() {
        return false;
    }
    let prefix = mode.response_prefix();
    lines(&reply.raw).iter().any(|line| {
        if format.is_can() {
            is_can_header_line(line)
                || (!headers_enabled
                    && (RE_FRAME_INDEX.is_match(line) || RE_SERVICE_RESPONSE.is_match(line)))
        } else {
            RE_LEGACY_HEADER.is_match(line)
                || (line.contains(mode.request_code) && line.contains(prefix.as_str()))
                || line.starts_with(prefix.as_str())
                || RE_DECIMAL_BYTES.is_match(line)
        }
    })
}

/// Strip the PCI byte(s) after a CAN header: first frames carry `1LLL`,
/// single and consecutive frames one byte.
fn strip_pci(rest: &str) -> &str {
    let pci_len = if rest.starts_with('1') { 4 } else { 2 };
    rest.get(pci_len..).unwrap_or_default()
}

fn decimal_to_hex(line: &str) -> Option<String> {
    line.split(',')
        .filter(|b| !b.is_empty())
        .map(|b| b.parse::<u8>().ok().map(|v| format!("{v:02X}")))
        .collect()
}

/// Header-stripped payload of each frame in a DTC reply.
pub fn extract_frames(raw: &str, mode: &DtcServiceMode, format: HeaderFormat) -> Vec<String> {
    let mut frames = Vec::new();
    for line in lines(raw) {
        if classify(&line).kind == ResponseKind::Searching
            || line == mode.request_code
            || RE_LENGTH_TOKEN.is_match(&line)
        {
            continue;
        }

        let payload = if format.is_can() && RE_CAN_29BIT_HEADER.is_match(&line) {
            strip_pci(&line[8..]).to_string()
        } else if format.is_can() && RE_CAN_11BIT_HEADER.is_match(&line) {
            strip_pci(&line[3..]).to_string()
        } else if !format.is_can() && RE_LEGACY_HEADER.is_match(&line) {
            // Header, then payload, then a checksum byte.
            let body = &line[6..];
            body.get(..body.len().saturating_sub(2))
                .unwrap_or_default()
                .to_string()
        } else if RE_FRAME_INDEX.is_match(&line) {
            line[2..].to_string()
        } else if RE_DECIMAL_BYTES.is_match(&line) {
            match decimal_to_hex(&line) {
                Some(hex) => hex,
                None => continue,
            }
        } else {
            line
        };

        if !payload.is_empty() {
            frames.push(payload);
        }
    }
    frames
}

/// Payload with only zero bytes after the service byte (and the CAN count
/// byte, which is zero too when nothing is stored).
fn is_zero_frame(frame: &str, prefix: &str) -> bool {
    let body = frame.strip_prefix(prefix).unwrap_or(frame);
    body.chars().all(|c| c == '0')
}

/// A CAN header followed by nothing but zeros, e.g. `7E8 00`.
fn is_bare_zero_frame(line: &str) -> bool {
    let body = if RE_CAN_29BIT_HEADER.is_match(line) {
        &line[8..]
    } else if RE_CAN_11BIT_HEADER.is_match(line) {
        &line[3..]
    } else {
        return false;
    };
    !body.is_empty() && body.chars().all(|c| c == '0')
}

/// Whether a reply means "no trouble codes". `NO DATA` counts.
pub fn is_empty_reply(reply: &Classification, mode: &DtcServiceMode, format: HeaderFormat) -> bool {
    if reply.kind == ResponseKind::NoData {
        return true;
    }
    let text = reply.normalized.as_str();
    if EMPTY_MARKERS.iter().any(|m| text.contains(m)) || EMPTY_REPLIES.contains(&text) {
        return true;
    }
    if reply.kind.is_error() {
        return false;
    }
    let reply_lines = lines(&reply.raw);
    if !reply_lines.is_empty() && reply_lines.iter().all(|l| is_bare_zero_frame(l)) {
        return true;
    }
    let prefix = mode.response_prefix();
    let frames = extract_frames(&reply.raw, mode, format);
    !frames.is_empty() && frames.iter().all(|f| is_zero_frame(f, &prefix))
}
