//! Payload decoders: trouble codes and the supported-PID bitmap.

use elm_protocol::{DtcCode, DtcResponse, DtcServiceMode};

use crate::classifier::normalize;

/// Decode two raw bytes into a standard DTC code string (e.g., "P0300").
pub fn decode_dtc_bytes(b1: u8, b2: u8) -> Option<String> {
    if b1 == 0x00 && b2 == 0x00 {
        return None;
    }

    let category = ['P', 'C', 'B', 'U'][usize::from(b1 >> 6)];
    let digit1 = (b1 >> 4) & 0x03;
    let digit2 = b1 & 0x0F;
    let digit3 = (b2 >> 4) & 0x0F;
    let digit4 = b2 & 0x0F;

    Some(format!("{category}{digit1}{digit2:X}{digit3:X}{digit4:X}"))
}

/// Parse a run of hex digit pairs. A trailing odd nibble is ignored.
pub fn hex_bytes(hex: &str) -> Option<Vec<u8>> {
    if !hex.is_ascii() {
        return None;
    }
    (0..hex.len() / 2)
        .map(|i| u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok())
        .collect()
}

/// Decode header-stripped frames of one service mode into trouble codes.
///
/// CAN replies carry a count byte after the service byte; other buses pack
/// three codes per frame with no count. Frames without the service byte are
/// continuations of a multi-frame reply.
pub fn decode_dtc_frames(frames: &[String], mode: &DtcServiceMode, can: bool) -> Vec<DtcCode> {
    let prefix = mode.response_prefix();
    let payload = if can {
        can_payload(frames, &prefix)
    } else {
        legacy_payload(frames, &prefix)
    };
    let Some(bytes) = hex_bytes(&payload) else {
        return Vec::new();
    };
    let mut codes: Vec<DtcCode> = Vec::new();
    for pair in bytes.chunks_exact(2) {
        if let Some(code) = decode_dtc_bytes(pair[0], pair[1]) {
            if !codes.iter().any(|c| c.code == code) {
                codes.push(DtcCode::new(code));
            }
        }
    }
    codes
}

/// Concatenate CAN code bytes. A response's count byte bounds how much of
/// the following frames belongs to it, so a continuation that happens to
/// start with the service byte is still read as codes.
fn can_payload(frames: &[String], prefix: &str) -> String {
    let mut payload = String::new();
    // Hex digits still owed to the current response.
    let mut remaining: Option<usize> = None;
    for frame in frames {
        let frame = normalize(frame);
        if remaining.is_none() && frame.starts_with("7F") {
            continue;
        }
        let data = match (remaining, frame.strip_prefix(prefix)) {
            (Some(_), _) => frame.as_str(),
            (None, Some(rest)) => {
                let count = rest
                    .get(..2)
                    .and_then(|count| usize::from_str_radix(count, 16).ok())
                    .unwrap_or(0);
                remaining = Some(count * 4);
                rest.get(2..).unwrap_or_default()
            }
            (None, None) if frame.chars().all(|c| c.is_ascii_hexdigit()) => frame.as_str(),
            (None, None) => continue,
        };
        match remaining {
            Some(owed) => {
                let take = owed.min(data.len());
                payload.push_str(data.get(..take).unwrap_or_default());
                remaining = (owed > take).then_some(owed - take);
            }
            None => payload.push_str(data),
        }
    }
    payload
}

fn legacy_payload(frames: &[String], prefix: &str) -> String {
    let mut payload = String::new();
    for frame in frames {
        let frame = normalize(frame);
        if frame.starts_with("7F") {
            continue;
        }
        match frame.strip_prefix(prefix) {
            Some(rest) => payload.push_str(rest),
            None if frame.chars().all(|c| c.is_ascii_hexdigit()) => payload.push_str(&frame),
            None => {}
        }
    }
    payload
}

/// Decode a retrieval result.
pub fn decode_dtc_response(response: &DtcResponse) -> Vec<DtcCode> {
    let mode = DtcServiceMode::for_type(response.trouble_code_type);
    decode_dtc_frames(
        &response.raw_frames,
        mode,
        response.protocol_info.header_format.is_can(),
    )
}

/// Supported mode-01 PIDs from a `0100` reply, merged across ECUs.
pub fn supported_pids(raw: &str) -> Vec<u8> {
    let mut pids: Vec<u8> = Vec::new();
    for line in raw.split(['\r', '\n']) {
        let line = normalize(line);
        let Some(at) = line.find("4100") else {
            continue;
        };
        let Some(bitmap) = line
            .get(at + 4..at + 12)
            .and_then(|hex| u32::from_str_radix(hex, 16).ok())
        else {
            continue;
        };
        for bit in 0..32u8 {
            if bitmap & (0x8000_0000 >> bit) != 0 {
                pids.push(bit + 1);
            }
        }
    }
    pids.sort_unstable();
    pids.dedup();
    pids
}
