//! Request safety guard. The engine only reads unless told otherwise.
//!
//! Allowed OBD-II service modes:
//! - 0x01: Show current data (`0100` probe)
//! - 0x02: Show freeze frame data
//! - 0x03: Show stored DTCs
//! - 0x07: Show pending DTCs
//! - 0x09: Request vehicle information (VIN)
//! - 0x0A: Show permanent DTCs
//!
//! Mode 0x04 (clear DTCs) is allowed only when the configuration enables it.
//! Every other mode is blocked. AT commands go to the adapter, not the
//! vehicle, and are never checked.

use crate::error::{EngineError, EngineResult};

/// OBD-II modes allowed in read-only operation.
pub const ALLOWED_MODES: &[u8] = &[0x01, 0x02, 0x03, 0x07, 0x09, 0x0A];

/// Clear stored DTCs and reset monitors.
pub const MODE_CLEAR_DTCS: u8 = 0x04;

/// Validates that an OBD-II mode is allowed under the current safety policy.
pub fn is_mode_allowed(mode: u8, allow_clear: bool) -> bool {
    ALLOWED_MODES.contains(&mode) || (allow_clear && mode == MODE_CLEAR_DTCS)
}

/// Check a request string before it is sent.
pub fn check_request(command: &str, allow_clear: bool) -> EngineResult<()> {
    let command = command.trim();
    if command.get(..2).is_some_and(|p| p.eq_ignore_ascii_case("AT")) {
        return Ok(());
    }
    let mode = command
        .get(..2)
        .and_then(|m| u8::from_str_radix(m, 16).ok());
    match mode {
        Some(mode) if is_mode_allowed(mode, allow_clear) => Ok(()),
        _ => Err(EngineError::SafetyViolation {
            command: command.to_string(),
        }),
    }
}
