//! CAN flow-control tuning.
//!
//! Multi-frame replies stall or overflow when the adapter's flow-control
//! frame does not suit the ECU. The tuner walks a fixed ladder of
//! configurations, re-sending the probe after each, and keeps the first one
//! that yields a complete reply.

use std::time::Duration;

use elm_protocol::{CAN_11BIT_ENGINE_HEADER, CAN_29BIT_FLOW_CONTROL_HEADER, HeaderFormat};

use crate::classifier::{Classification, ResponseKind};
use crate::engine::ProtocolEngine;
use crate::error::EngineResult;

/// Replies shorter than this (normalized) look cut off.
pub const TRUNCATION_THRESHOLD: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowControlConfig {
    pub header_address: String,
    /// Flow-control frame data: frame type, block size, separation time.
    pub data: &'static str,
    pub mode: u8,
    pub label: &'static str,
}

impl FlowControlConfig {
    fn new(header: &str, data: &'static str, mode: u8, label: &'static str) -> Self {
        Self {
            header_address: header.to_string(),
            data,
            mode,
            label,
        }
    }

    /// `ATFCSH`, `ATFCSD`, `ATFCSM`, in that order.
    pub fn commands(&self) -> [String; 3] {
        [
            format!("ATFCSH{}", self.header_address),
            format!("ATFCSD{}", self.data),
            format!("ATFCSM{}", self.mode),
        ]
    }
}

/// The four-step ladder used by detection and DTC retrieval.
pub fn standard_ladder(header: &str) -> Vec<FlowControlConfig> {
    vec![
        FlowControlConfig::new(header, "300000", 1, "standard"),
        FlowControlConfig::new(header, "300000", 0, "no wait"),
        FlowControlConfig::new(header, "300008", 1, "extended wait"),
        FlowControlConfig::new(header, "300400", 1, "different block size"),
    ]
}

/// The six-step ladder used for VIN retrieval. The last two rungs retry with
/// the 29-bit flow-control header.
pub fn extended_ladder(header: &str) -> Vec<FlowControlConfig> {
    vec![
        FlowControlConfig::new(header, "300000", 1, "standard"),
        FlowControlConfig::new(header, "300008", 1, "extended wait"),
        FlowControlConfig::new(header, "300010", 1, "long wait"),
        FlowControlConfig::new(header, "300400", 1, "different block size"),
        FlowControlConfig::new(CAN_29BIT_FLOW_CONTROL_HEADER, "300000", 1, "29-bit standard"),
        FlowControlConfig::new(CAN_29BIT_FLOW_CONTROL_HEADER, "300008", 1, "29-bit extended wait"),
    ]
}

/// The adapter ran out of buffer or flow control failed outright.
pub fn is_overflow(reply: &Classification) -> bool {
    reply.kind == ResponseKind::BufferFull || reply.normalized.contains("FBERROR")
}

/// Overflowed, or non-empty but too short to be a whole reply.
pub fn looks_truncated(reply: &Classification) -> bool {
    if is_overflow(reply) {
        return true;
    }
    !reply.is_empty()
        && reply.normalized.len() < TRUNCATION_THRESHOLD
        && !reply.kind.is_error()
        && reply.kind != ResponseKind::NoData
}

/// Outcome of a successful ladder walk.
#[derive(Debug, Clone)]
pub struct Tuned {
    pub config: FlowControlConfig,
    pub reply: Classification,
}

/// Walk `ladder`, probing with `probe` after each configuration.
///
/// Returns `None` when no rung produced a complete reply. Only a transport
/// failure is an error.
pub async fn tune(
    engine: &mut ProtocolEngine,
    ladder: &[FlowControlConfig],
    probe: &str,
    timeout: Duration,
) -> EngineResult<Option<Tuned>> {
    for (step, config) in ladder.iter().enumerate() {
        let mut applied = true;
        for command in config.commands() {
            if !engine.at_lenient(&command).await? {
                applied = false;
                break;
            }
        }
        if !applied {
            tracing::warn!(step, label = config.label, "adapter rejected flow-control setting");
            continue;
        }

        let reply = match engine.send_request_with_timeout(probe, timeout).await {
            Ok(reply) => reply,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => {
                tracing::debug!(step, label = config.label, error = %err, "probe failed");
                continue;
            }
        };

        if reply.is_usable() && !looks_truncated(&reply) {
            tracing::info!(
                step,
                label = config.label,
                header = %config.header_address,
                data = config.data,
                mode = config.mode,
                "flow control tuned"
            );
            return Ok(Some(Tuned {
                config: config.clone(),
                reply,
            }));
        }
        tracing::debug!(step, label = config.label, kind = ?reply.kind, "flow-control rung rejected");
    }
    tracing::warn!(probe, "flow-control ladder exhausted");
    Ok(None)
}

/// Tune with `ladder`, then take the tuned reply or re-send `request` once.
pub async fn recover_truncated(
    engine: &mut ProtocolEngine,
    ladder: &[FlowControlConfig],
    request: &str,
    timeout: Duration,
) -> EngineResult<Classification> {
    match tune(engine, ladder, request, timeout).await? {
        Some(tuned) => Ok(tuned.reply),
        None => engine.send_request_with_timeout(request, timeout).await,
    }
}

/// Tester-side flow-control header for a CAN addressing width.
pub fn default_flow_control_header(format: HeaderFormat) -> &'static str {
    match format {
        HeaderFormat::Can29Bit => CAN_29BIT_FLOW_CONTROL_HEADER,
        _ => CAN_11BIT_ENGINE_HEADER,
    }
}
