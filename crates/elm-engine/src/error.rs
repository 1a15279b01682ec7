//! Protocol engine error types.

use elm_protocol::{LifecycleState, ProtocolSnapshot};
use thiserror::Error;

use crate::classifier::ResponseKind;

/// Errors surfaced by the protocol engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Unrecoverable transport failure; a full reconnection is required.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The adapter answered with `ERROR`, `BUS ERROR` or `CAN ERROR`.
    #[error("adapter reported {kind:?} for `{command}`: {response}")]
    Adapter {
        command: String,
        response: String,
        kind: ResponseKind,
    },

    #[error("`{command}` timed out after {timeout_ms}ms")]
    Timeout { command: String, timeout_ms: u64 },

    #[error("protocol changed underneath the retriever: cached {cached}, live {live}")]
    ProtocolMismatch { cached: u8, live: u8 },

    #[error("malformed response to `{command}`: {response:?}")]
    Malformed { command: String, response: String },

    /// An AT configuration command was not acknowledged with `OK`.
    #[error("adapter rejected `{command}`: {response:?}")]
    Configuration { command: String, response: String },

    #[error("session not ready (lifecycle {state:?})")]
    NotReady { state: LifecycleState },

    #[error("protocol detection failed: {0}")]
    Detection(String),

    #[error("request `{command}` is blocked by the safety policy")]
    SafetyViolation { command: String },

    #[error("command queue closed")]
    QueueClosed,

    /// A bounded recovery loop ran out of attempts.
    #[error("{operation} failed after {attempts} attempt(s); last command `{last_command}`, last response {last_response:?}")]
    Exhausted {
        operation: &'static str,
        attempts: u32,
        last_command: String,
        last_response: String,
        protocol: Box<ProtocolSnapshot>,
    },
}

impl EngineError {
    /// Fatal errors abort every pending operation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Transport(_) | EngineError::QueueClosed)
    }
}

/// Convenience alias for engine results.
pub type EngineResult<T> = Result<T, EngineError>;
