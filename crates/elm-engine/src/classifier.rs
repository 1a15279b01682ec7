//! Response classifier: raw adapter text → normalized text + response kind.
//!
//! Every call site consumes the `ResponseKind` tag instead of matching
//! adapter strings itself. Checks run in a fixed priority order; the first
//! match wins.

use serde::{Deserialize, Serialize};

/// Unrecognized, non-empty replies count as usable. Adapters in the wild
/// emit vendor chatter that would otherwise block retrieval.
pub const LENIENT_UNKNOWN: bool = true;

/// Fixed set of response kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseKind {
    NoData,
    CanError,
    BusError,
    Error,
    BufferFull,
    Searching,
    Stopped,
    UnableToConnect,
    Model,
    Prompt,
    Ok,
    Unknown,
}

impl ResponseKind {
    /// `ERROR`, `BUS ERROR` and `CAN ERROR`: the adapter lost the protocol.
    pub fn is_adapter_error(self) -> bool {
        matches!(
            self,
            ResponseKind::Error | ResponseKind::CanError | ResponseKind::BusError
        )
    }

    /// Any kind that means the request failed at the adapter or bus level.
    /// `NoData` and `BufferFull` are not errors.
    pub fn is_error(self) -> bool {
        self.is_adapter_error()
            || matches!(self, ResponseKind::Stopped | ResponseKind::UnableToConnect)
    }
}

/// Result of classifying one adapter reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub raw: String,
    pub normalized: String,
    pub kind: ResponseKind,
}

impl Classification {
    /// A reply that carries hex payload.
    pub fn is_data(&self) -> bool {
        self.kind == ResponseKind::Ok && is_hex_payload(&self.normalized)
    }

    /// Whether the adapter acknowledged an AT command.
    pub fn is_ok(&self) -> bool {
        self.kind == ResponseKind::Ok && self.normalized.contains("OK")
    }

    pub fn is_empty(&self) -> bool {
        self.normalized.is_empty()
    }

    /// Non-error, non-empty, and not a no-data reply.
    pub fn is_usable(&self) -> bool {
        if self.is_empty() {
            return false;
        }
        match self.kind {
            ResponseKind::Ok | ResponseKind::Model | ResponseKind::Prompt => true,
            ResponseKind::Unknown => LENIENT_UNKNOWN,
            _ => false,
        }
    }

    /// Feedback for adaptive timing: `Some(true)` on success, `Some(false)`
    /// on error or no data, `None` when the reply says nothing about timing.
    pub fn timing_signal(&self) -> Option<bool> {
        if self.kind.is_error()
            || matches!(self.kind, ResponseKind::NoData | ResponseKind::BufferFull)
        {
            Some(false)
        } else if self.is_usable() {
            Some(true)
        } else {
            None
        }
    }
}

/// Strip CR, LF, spaces and NULs, then uppercase.
pub fn normalize(raw: &str) -> String {
    raw.chars()
        .filter(|c| !matches!(c, '\r' | '\n' | ' ' | '\0'))
        .collect::<String>()
        .to_uppercase()
}

/// At least two characters, hex digits only.
pub fn is_hex_payload(text: &str) -> bool {
    text.len() >= 2 && text.chars().all(|c| c.is_ascii_hexdigit())
}

/// Classify an already-normalized string.
pub fn kind_of(normalized: &str) -> ResponseKind {
    if normalized.contains("NODATA") {
        ResponseKind::NoData
    } else if normalized.contains("CANERROR") {
        ResponseKind::CanError
    } else if normalized.contains("BUSERROR") {
        ResponseKind::BusError
    } else if normalized.contains("ERROR") {
        ResponseKind::Error
    } else if normalized.contains("BUFFERFULL") {
        ResponseKind::BufferFull
    } else if normalized.contains("SEARCHING") {
        ResponseKind::Searching
    } else if normalized.contains("STOPPED") {
        ResponseKind::Stopped
    } else if normalized.contains("UNABLE") {
        ResponseKind::UnableToConnect
    } else if normalized.contains("MODEL") {
        ResponseKind::Model
    } else if normalized.contains('>') {
        ResponseKind::Prompt
    } else if normalized.contains("OK") || is_hex_payload(normalized) {
        ResponseKind::Ok
    } else {
        ResponseKind::Unknown
    }
}

/// Classify a raw adapter reply.
pub fn classify(raw: &str) -> Classification {
    let normalized = normalize(raw);
    let kind = kind_of(&normalized);
    Classification {
        raw: raw.to_string(),
        normalized,
        kind,
    }
}

/// Split a reply into normalized, non-empty lines.
pub fn lines(raw: &str) -> Vec<String> {
    raw.split(['\r', '\n'])
        .map(normalize)
        .filter(|l| !l.is_empty())
        .collect()
}
