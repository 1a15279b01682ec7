//! DTC and VIN retrieval on top of a detected session.
//!
//! Retrievers never write the session. Each keeps a `RetrievalContext`
//! captured from it and re-checks that context against the live session
//! before every use.

pub mod dtc;
pub mod verify;
pub mod vin;

pub use dtc::DtcRetriever;
pub use vin::VinRetriever;

use elm_protocol::{HeaderFormat, ProtocolId};
use uuid::Uuid;

use crate::error::EngineError;
use crate::session::Session;

/// Protocol facts a retriever relies on between calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrievalContext {
    pub session_id: Uuid,
    pub protocol: ProtocolId,
    pub header_format: HeaderFormat,
    pub header: Option<String>,
    pub selected_ecu_address: Option<String>,
}

impl RetrievalContext {
    pub fn capture(session: &Session) -> Self {
        Self {
            session_id: session.id(),
            protocol: session.active_protocol_id(),
            header_format: session.header_format(),
            header: session.header().map(str::to_string),
            selected_ecu_address: session.selected_ecu_address().map(str::to_string),
        }
    }

    pub fn is_can(&self) -> bool {
        self.header_format.is_can()
    }

    /// Whether this context still describes `session`.
    pub fn matches(&self, session: &Session) -> bool {
        *self == Self::capture(session)
    }

    /// Re-capture from `session` if the protocol or addressing moved.
    /// Returns the mismatch that forced the refresh, if any.
    pub fn refresh(&mut self, session: &Session) -> Option<EngineError> {
        if self.matches(session) {
            return None;
        }
        let mismatch = EngineError::ProtocolMismatch {
            cached: self.protocol.value(),
            live: session.active_protocol_id().value(),
        };
        tracing::warn!(error = %mismatch, "refreshing retrieval context");
        *self = Self::capture(session);
        Some(mismatch)
    }
}

/// Refresh `slot`, capturing on first use.
pub(crate) fn current_context<'a>(
    slot: &'a mut Option<RetrievalContext>,
    session: &Session,
) -> &'a RetrievalContext {
    if let Some(context) = slot.as_mut() {
        context.refresh(session);
    }
    slot.get_or_insert_with(|| RetrievalContext::capture(session))
}
