//! ELM327 protocol engine.
//!
//! Drives an AT-command adapter through a serialized command queue:
//! initialization, protocol detection with CAN flow-control negotiation,
//! adaptive timing, and DTC/VIN retrieval on top of the detected session.

pub mod classifier;
pub mod command;
pub mod config;
pub mod decoder;
pub mod detection;
pub mod ecu;
pub mod engine;
pub mod error;
pub mod flow_control;
pub mod mock;
pub mod retrieval;
pub mod safety;
pub mod session;
pub mod telegram;
pub mod timing;
pub mod transport;

pub use classifier::{Classification, ResponseKind, classify};
pub use config::EngineConfig;
pub use detection::DetectionOutcome;
pub use engine::ProtocolEngine;
pub use error::{EngineError, EngineResult};
pub use retrieval::{DtcRetriever, RetrievalContext, VinRetriever};
pub use session::Session;
pub use timing::{TimingMode, TimingProfile};
pub use transport::{Transport, TransportFailure, TransportResult};
