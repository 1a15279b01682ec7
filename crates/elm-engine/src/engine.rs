//! The protocol engine.
//!
//! `ProtocolEngine` owns the live `Session`, the adaptive timing state and a
//! handle to the command queue. Detection, DTC and VIN retrieval are built on
//! the primitives here: every command passes the adaptive delay, the queue
//! and the classifier, in that order.

use std::time::Duration;

use elm_protocol::{ConnectionState, LifecycleState, ProtocolSnapshot};

use crate::classifier::{Classification, ResponseKind, classify};
use crate::command::{CommandEnvelope, CommandHandle};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::safety;
use crate::session::{ReadyPurpose, Session};
use crate::timing::AdaptiveTiming;
use crate::transport::Transport;

/// Commands that put the adapter into clean retrieval formatting.
pub const RETRIEVAL_SETUP: [&str; 4] = ["ATH0", "ATE0", "ATL0", "ATS0"];

pub struct ProtocolEngine {
    commands: CommandHandle,
    pub(crate) session: Session,
    pub(crate) timing: AdaptiveTiming,
    config: EngineConfig,
    last_command: String,
    last_response: String,
}

impl ProtocolEngine {
    /// Spawn the command queue over `transport`. Requires a tokio runtime.
    pub fn new<T: Transport + 'static>(transport: T, config: EngineConfig) -> Self {
        let commands =
            CommandHandle::spawn(transport, config.queue_capacity, config.drain_timeout());
        Self::with_handle(commands, config)
    }

    /// Build an engine over an existing queue handle.
    pub fn with_handle(commands: CommandHandle, config: EngineConfig) -> Self {
        Self {
            commands,
            session: Session::new(),
            timing: AdaptiveTiming::new(&config.timing),
            config,
            last_command: String::new(),
            last_response: String::new(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn timing(&self) -> &AdaptiveTiming {
        &self.timing
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn snapshot(&self) -> ProtocolSnapshot {
        self.session.snapshot()
    }

    /// The most recent command written to the adapter.
    pub fn last_command(&self) -> &str {
        &self.last_command
    }

    /// Raw text of the most recent reply, or the error that replaced it.
    pub fn last_response(&self) -> &str {
        &self.last_response
    }

    /// Send one command: adaptive pause, queue, classify, adapt.
    pub async fn execute(&mut self, envelope: CommandEnvelope) -> EngineResult<Classification> {
        let delay = self.timing.current_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        tracing::debug!(
            command = %envelope.command,
            delay_ms = delay.as_millis() as u64,
            timeout_ms = envelope.timeout.as_millis() as u64,
            "sending command"
        );

        self.last_command.clone_from(&envelope.command);
        match self.commands.execute(envelope.clone()).await {
            Ok(raw) => {
                let classification = classify(&raw);
                tracing::debug!(
                    command = %envelope.command,
                    kind = ?classification.kind,
                    response = %classification.normalized,
                    "command answered"
                );
                if let Some(expected) = envelope.expect {
                    if expected != classification.kind {
                        tracing::debug!(
                            command = %envelope.command,
                            ?expected,
                            kind = ?classification.kind,
                            "unexpected reply kind"
                        );
                    }
                }
                self.timing.adapt(&classification);
                self.last_response.clone_from(&classification.raw);
                Ok(classification)
            }
            Err(err) => {
                self.last_response = err.to_string();
                if err.is_fatal() {
                    tracing::error!(command = %envelope.command, error = %err, "fatal transport failure");
                    self.session.reset_protocol();
                    self.session.mark_error();
                    self.session.set_connection(ConnectionState::Error);
                } else if matches!(err, EngineError::Timeout { .. }) {
                    tracing::warn!(command = %envelope.command, error = %err, "command timed out");
                    self.timing.record_failure();
                }
                Err(err)
            }
        }
    }

    /// Send an AT command with the AT timeout.
    pub async fn send_at(&mut self, command: &str) -> EngineResult<Classification> {
        let envelope =
            CommandEnvelope::new(command, self.config.at_timeout()).expecting(ResponseKind::Ok);
        self.execute(envelope).await
    }

    /// Send an AT command that must be acknowledged with `OK`.
    pub async fn at_ok(&mut self, command: &str) -> EngineResult<()> {
        let reply = self.send_at(command).await?;
        if reply.kind.is_adapter_error() {
            return Err(EngineError::Adapter {
                command: command.to_string(),
                response: reply.raw,
                kind: reply.kind,
            });
        }
        if !reply.is_ok() {
            return Err(EngineError::Configuration {
                command: command.to_string(),
                response: reply.raw,
            });
        }
        self.session.apply_acknowledged(command);
        Ok(())
    }

    /// Like `at_ok`, but a rejection or timeout only yields `false`.
    pub async fn at_lenient(&mut self, command: &str) -> EngineResult<bool> {
        match self.at_ok(command).await {
            Ok(()) => Ok(true),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                tracing::debug!(command, error = %err, "optional command not accepted");
                Ok(false)
            }
        }
    }

    /// Timeout for a data request under the active protocol. Unknown
    /// protocols get the slow-bus timeout.
    pub fn data_timeout(&self) -> Duration {
        self.config.data_timeout(self.session.is_can())
    }

    /// Send an OBD request with the protocol-dependent data timeout.
    pub async fn send_request(&mut self, command: &str) -> EngineResult<Classification> {
        let timeout = self.data_timeout();
        self.send_request_with_timeout(command, timeout).await
    }

    pub async fn send_request_with_timeout(
        &mut self,
        command: &str,
        timeout: Duration,
    ) -> EngineResult<Classification> {
        safety::check_request(command, self.config.allow_clear_dtcs)?;
        self.execute(CommandEnvelope::new(command, timeout)).await
    }

    /// Put the adapter into clean retrieval formatting and re-enter `Ready`.
    /// Any rejected command leaves the session in `Error`.
    pub async fn configure_for_retrieval(&mut self) -> EngineResult<()> {
        self.session.begin_configuring();
        for command in RETRIEVAL_SETUP {
            if let Err(err) = self.at_ok(command).await {
                self.session.mark_error();
                return Err(err);
            }
        }
        if self.session.mark_ready(ReadyPurpose::Retrieval) {
            Ok(())
        } else {
            Err(EngineError::NotReady {
                state: self.session.lifecycle(),
            })
        }
    }

    /// Fail unless detection has produced a usable session.
    pub(crate) fn require_protocol(&self) -> EngineResult<()> {
        let session = &self.session;
        let usable = matches!(
            session.lifecycle(),
            LifecycleState::Ready | LifecycleState::Error | LifecycleState::Configuring
        ) && !session.active_protocol_id().is_auto();
        if usable {
            Ok(())
        } else {
            Err(EngineError::NotReady {
                state: session.lifecycle(),
            })
        }
    }

    /// Clear stored DTCs (mode `04`). Refused unless enabled in the config.
    pub async fn clear_dtcs(&mut self) -> EngineResult<()> {
        safety::check_request("04", self.config.allow_clear_dtcs)?;
        self.require_protocol()?;
        self.configure_for_retrieval().await?;

        let reply = self.send_request("04").await?;
        if reply.kind.is_adapter_error() {
            return Err(EngineError::Adapter {
                command: "04".into(),
                response: reply.raw,
                kind: reply.kind,
            });
        }
        if reply.normalized.starts_with("44") {
            tracing::info!("stored DTCs cleared");
            Ok(())
        } else {
            Err(EngineError::Malformed {
                command: "04".into(),
                response: reply.raw,
            })
        }
    }

    /// Close the protocol and start a fresh session.
    pub async fn disconnect(&mut self) -> EngineResult<()> {
        let result = self.send_at("ATPC").await;
        self.session.reset();
        self.timing = AdaptiveTiming::new(&self.config.timing);
        match result {
            Err(err) if err.is_fatal() => Err(err),
            _ => Ok(()),
        }
    }

    /// Failure report for a bounded loop that ran out of attempts.
    pub(crate) fn exhausted(&self, operation: &'static str, attempts: u32) -> EngineError {
        EngineError::Exhausted {
            operation,
            attempts,
            last_command: self.last_command.clone(),
            last_response: self.last_response.clone(),
            protocol: Box::new(self.snapshot()),
        }
    }
}
