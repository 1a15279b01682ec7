//! VIN retrieval (mode 09 PID 02).

use std::time::Duration;

use elm_protocol::{CAN_11BIT_ENGINE_RESPONSE, HeaderFormat, VIN_LENGTH, VinRecord};

use super::{RetrievalContext, current_context};
use crate::classifier::{Classification, ResponseKind, lines};
use crate::decoder::hex_bytes;
use crate::ecu::header_for_address;
use crate::engine::ProtocolEngine;
use crate::error::{EngineError, EngineResult};
use crate::flow_control::{self, FlowControlConfig, extended_ladder, looks_truncated};
use crate::telegram;

pub const VIN_REQUEST: &str = "0902";
const VIN_MARKER: &str = "4902";

/// Response header at the start of a CAN line. A line that is nothing but
/// a header fragment has none.
fn can_header(line: &str, format: HeaderFormat) -> Option<&str> {
    let len = match format {
        HeaderFormat::Can29Bit if line.starts_with("18DA") => 8,
        HeaderFormat::Can11Bit if line.starts_with("7E") => 3,
        _ => return None,
    };
    if line.len() > len { line.get(..len) } else { None }
}

/// Group headered lines by responding ECU, in order of first appearance.
fn group_by_header<'a>(
    lines: &'a [String],
    format: HeaderFormat,
) -> Vec<(&'a str, Vec<&'a str>)> {
    let mut groups: Vec<(&str, Vec<&str>)> = Vec::new();
    for line in lines {
        let Some(header) = can_header(line, format) else {
            continue;
        };
        match groups.iter_mut().find(|(h, _)| *h == header) {
            Some((_, members)) => members.push(line.as_str()),
            None => groups.push((header, vec![line.as_str()])),
        }
    }
    groups
}

/// One ECU's frames, split on header boundaries so a single unbroken blob
/// works too.
fn reassemble_ecu(header: &str, lines: &[&str]) -> String {
    let frames: Vec<String> = lines
        .iter()
        .flat_map(|line| line.split(header))
        .filter(|segment| !segment.is_empty())
        .map(|segment| format!("{header}{segment}"))
        .collect();
    reassemble_can(&frames, header.len())
}

/// Concatenate headered CAN frames, dropping header and PCI. The first
/// frame's `1LLL` byte count bounds the result.
fn reassemble_can(frames: &[String], header_len: usize) -> String {
    let mut payload = String::new();
    let mut expected = None;
    for frame in frames {
        let Some(body) = frame.get(header_len..) else {
            continue;
        };
        let rest = if let Some(first) = body.strip_prefix('1') {
            expected = first
                .get(..3)
                .and_then(|len| usize::from_str_radix(len, 16).ok())
                .map(|bytes| bytes * 2);
            first.get(3..)
        } else {
            body.get(2..)
        };
        payload.push_str(rest.unwrap_or_default());
    }
    if let Some(expected) = expected {
        payload.truncate(expected.min(payload.len()));
    }
    payload
}

/// Turn a raw VIN reply into one hex blob that still carries the `4902`
/// marker.
///
/// Headered CAN frames are grouped per ECU, split on header boundaries and
/// stripped. The first ECU whose frames carry a VIN wins. Indexed segments
/// go through the telegram assembler; legacy buses repeat the `4902NN`
/// prefix on every line, which is kept only once.
pub fn reassemble(raw: &str, format: HeaderFormat) -> String {
    let text_lines: Vec<String> = lines(raw)
        .into_iter()
        .filter(|l| !l.contains("SEARCHING") && l != VIN_REQUEST)
        .collect();
    let Some(first) = text_lines.first() else {
        return String::new();
    };

    if can_header(first, format).is_some() {
        let blobs: Vec<String> = group_by_header(&text_lines, format)
            .into_iter()
            .map(|(header, members)| reassemble_ecu(header, &members))
            .collect();
        let decodable = blobs.iter().position(|blob| parse_vin(blob).is_some());
        return blobs
            .into_iter()
            .nth(decodable.unwrap_or(0))
            .unwrap_or_default();
    }

    if text_lines.iter().any(|l| l.contains(':')) {
        return telegram::assemble(raw)
            .map(|t| t.payload)
            .unwrap_or_default();
    }

    let mut blob = String::new();
    for line in &text_lines {
        let line = strip_legacy_header(line);
        match line.find(VIN_MARKER) {
            Some(at) if !blob.is_empty() => {
                blob.push_str(line.get(at + VIN_MARKER.len() + 2..).unwrap_or_default());
            }
            Some(at) => blob.push_str(&line[at..]),
            None => blob.push_str(line),
        }
    }
    blob
}

/// `48 6B 10 … cs` framing on ISO 9141-2 / J1850 lines, `8x F1 10 … cs`
/// on KWP.
fn strip_legacy_header(line: &str) -> &str {
    let headered = match line.get(2..4) {
        Some("6B") => true,
        Some("F1") => line.starts_with('8'),
        _ => false,
    };
    if headered && line.len() > 8 && !line.starts_with(VIN_MARKER) {
        line.get(6..line.len() - 2).unwrap_or(line)
    } else {
        line
    }
}

/// Decode a VIN from a reassembled hex blob: find `4902`, skip the item
/// count byte, then read ASCII. Zero padding is skipped. Anything other than
/// exactly 17 characters is a parse failure.
pub fn parse_vin(blob: &str) -> Option<String> {
    let at = blob.find(VIN_MARKER)?;
    let data = blob.get(at + VIN_MARKER.len() + 2..)?;
    let bytes = hex_bytes(data)?;
    let vin: String = bytes
        .into_iter()
        .filter(|&b| b != 0x00)
        .map(char::from)
        .collect();
    (vin.len() == VIN_LENGTH && vin.chars().all(|c| c.is_ascii_graphic())).then_some(vin)
}

/// Reads the VIN through a `ProtocolEngine`.
#[derive(Debug, Default)]
pub struct VinRetriever {
    context: Option<RetrievalContext>,
}

impl VinRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn context(&self) -> Option<&RetrievalContext> {
        self.context.as_ref()
    }

    /// Retrieve and decode the VIN. An adapter error aborts immediately.
    pub async fn retrieve(&mut self, engine: &mut ProtocolEngine) -> EngineResult<VinRecord> {
        if !engine.session().is_ready() || engine.session().active_protocol_id().is_auto() {
            return Err(EngineError::NotReady {
                state: engine.session().lifecycle(),
            });
        }
        let attempts = engine.config().vin_attempts.max(1);
        let delay = Duration::from_millis(engine.config().vin_retry_delay_ms);

        for attempt in 1..=attempts {
            match self.attempt(engine).await {
                Ok(record) => {
                    if record.valid {
                        tracing::info!(vin = %record.vin, attempt, "VIN retrieved");
                    } else {
                        tracing::warn!(vin = %record.vin, attempt, "VIN has invalid format");
                    }
                    return Ok(record);
                }
                Err(err) if err.is_fatal() || matches!(err, EngineError::Adapter { .. }) => {
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "VIN attempt failed");
                }
            }
            if attempt < attempts {
                tokio::time::sleep(delay).await;
            }
        }
        Err(engine.exhausted("VIN retrieval", attempts))
    }

    /// Flow-control header for VIN replies: the ECU response header, else
    /// `7E8`.
    fn flow_control_header(context: &RetrievalContext) -> String {
        context
            .selected_ecu_address
            .as_deref()
            .map(|address| header_for_address(address, context.header_format))
            .unwrap_or_else(|| CAN_11BIT_ENGINE_RESPONSE.to_string())
    }

    async fn attempt(&mut self, engine: &mut ProtocolEngine) -> EngineResult<VinRecord> {
        let context = current_context(&mut self.context, engine.session()).clone();
        let can = context.is_can();
        let timeout = engine.config().vin_timeout(can);
        let header = Self::flow_control_header(&context);

        if can {
            let preset = FlowControlConfig {
                header_address: header.clone(),
                data: "300008",
                mode: 1,
                label: "VIN preset",
            };
            for command in preset.commands() {
                engine.at_lenient(&command).await?;
            }
        }

        let mut reply = engine
            .send_request_with_timeout(VIN_REQUEST, timeout)
            .await?;
        self.check_adapter_error(&reply)?;

        if can && !reply.kind.is_error() && looks_truncated(&reply) {
            reply = flow_control::recover_truncated(
                engine,
                &extended_ladder(&header),
                VIN_REQUEST,
                timeout,
            )
            .await?;
            self.check_adapter_error(&reply)?;
        }

        if reply.kind == ResponseKind::NoData || !reply.is_usable() {
            return Err(EngineError::Malformed {
                command: VIN_REQUEST.into(),
                response: reply.raw,
            });
        }

        let blob = reassemble(&reply.raw, context.header_format);
        match parse_vin(&blob) {
            Some(vin) => Ok(VinRecord::new(vin)),
            None => Err(EngineError::Malformed {
                command: VIN_REQUEST.into(),
                response: reply.raw,
            }),
        }
    }

    fn check_adapter_error(&self, reply: &Classification) -> EngineResult<()> {
        if reply.kind.is_adapter_error() {
            return Err(EngineError::Adapter {
                command: VIN_REQUEST.into(),
                response: reply.raw.clone(),
                kind: reply.kind,
            });
        }
        Ok(())
    }
}
