//! Transport port abstraction.
//!
//! `Transport` moves command strings to the adapter and reply strings back.
//! It knows nothing about protocol semantics. Two impls ship with the
//! workspace:
//! - `MockTransport`: all platforms, scripted replies (in `mock.rs`)
//! - `TcpTransport`: Wi-Fi ELM327 adapters (in the `elm-scan` crate)
//!
//! The channel is half-duplex: callers must not write a new command until the
//! previous reply has been read. `CommandQueue` enforces that.

use async_trait::async_trait;
use thiserror::Error;

/// Unrecoverable transport failure. Not a parseable adapter response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TransportFailure(pub String);

impl From<std::io::Error> for TransportFailure {
    fn from(err: std::io::Error) -> Self {
        TransportFailure(err.to_string())
    }
}

pub type TransportResult<T> = Result<T, TransportFailure>;

/// Trait for adapter transport implementations.
#[async_trait]
pub trait Transport: Send {
    /// Write one command. The implementation appends the line terminator.
    async fn write_command(&mut self, command: &str) -> TransportResult<()>;

    /// Read one complete reply, up to but excluding the `>` prompt.
    ///
    /// May wait forever if the adapter never answers; callers bound it with a
    /// timeout.
    async fn read_reply(&mut self) -> TransportResult<String>;

    /// Write a command and read its reply.
    async fn send(&mut self, command: &str) -> TransportResult<String> {
        self.write_command(command).await?;
        self.read_reply().await
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn write_command(&mut self, command: &str) -> TransportResult<()> {
        (**self).write_command(command).await
    }

    async fn read_reply(&mut self) -> TransportResult<String> {
        (**self).read_reply().await
    }
}
