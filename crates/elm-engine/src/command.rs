//! Serialized command queue.
//!
//! The adapter channel is half-duplex, so one task owns the transport and
//! executes commands strictly in arrival order. Callers hand over a
//! `CommandEnvelope` and await the reply on a oneshot channel.
//!
//! A command that was written cannot be unsent. When a read times out, or the
//! caller stops waiting, the reply is still owed by the adapter; the actor
//! counts it as stale and discards it before writing the next command.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use crate::classifier::ResponseKind;
use crate::error::{EngineError, EngineResult};
use crate::transport::{Transport, TransportFailure};

/// One command plus how long to wait for its reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEnvelope {
    pub command: String,
    pub timeout: Duration,
    /// Reply kind the caller expects; informational.
    pub expect: Option<ResponseKind>,
}

impl CommandEnvelope {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
            expect: None,
        }
    }

    pub fn expecting(mut self, kind: ResponseKind) -> Self {
        self.expect = Some(kind);
        self
    }

    pub fn is_at(&self) -> bool {
        self.command
            .get(..2)
            .is_some_and(|p| p.eq_ignore_ascii_case("AT"))
    }
}

struct QueuedCommand {
    envelope: CommandEnvelope,
    reply_tx: oneshot::Sender<EngineResult<String>>,
}

/// Cloneable handle to the command queue task.
#[derive(Clone)]
pub struct CommandHandle {
    tx: mpsc::Sender<QueuedCommand>,
}

impl CommandHandle {
    /// Spawn the queue task. It runs until every handle is dropped.
    pub fn spawn<T>(transport: T, capacity: usize, drain_timeout: Duration) -> Self
    where
        T: Transport + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let queue = CommandQueue {
            transport: Box::new(transport),
            rx,
            drain_timeout,
            stale_replies: 0,
            failure: None,
        };
        tokio::spawn(queue.run());
        Self { tx }
    }

    /// Queue a command and wait for its raw reply.
    ///
    /// Dropping the returned future does not cancel a command that was
    /// already queued.
    pub async fn execute(&self, envelope: CommandEnvelope) -> EngineResult<String> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(QueuedCommand { envelope, reply_tx })
            .await
            .map_err(|_| EngineError::QueueClosed)?;
        reply_rx.await.map_err(|_| EngineError::QueueClosed)?
    }
}

struct CommandQueue {
    transport: Box<dyn Transport>,
    rx: mpsc::Receiver<QueuedCommand>,
    drain_timeout: Duration,
    /// Replies owed by the adapter for commands whose read gave up.
    stale_replies: usize,
    /// Set once the transport fails; every later command fails with it.
    failure: Option<String>,
}

impl CommandQueue {
    async fn run(mut self) {
        while let Some(queued) = self.rx.recv().await {
            if let Some(reason) = &self.failure {
                let _ = queued.reply_tx.send(Err(EngineError::Transport(reason.clone())));
                continue;
            }

            let result = match self.drain_stale().await {
                Ok(()) => self.exchange(&queued.envelope).await,
                Err(failure) => Err(EngineError::Transport(failure.0)),
            };

            if let Err(EngineError::Transport(reason)) = &result {
                self.fail_all(reason.clone());
            }

            if queued.reply_tx.send(result).is_err() {
                tracing::debug!(
                    command = %queued.envelope.command,
                    "caller abandoned command; reply discarded"
                );
            }
        }
        tracing::debug!("command queue closed");
    }

    async fn drain_stale(&mut self) -> Result<(), TransportFailure> {
        while self.stale_replies > 0 {
            self.stale_replies -= 1;
            match timeout(self.drain_timeout, self.transport.read_reply()).await {
                Ok(Ok(discarded)) => {
                    tracing::debug!(reply = %discarded.trim(), "discarded stale reply");
                }
                Ok(Err(failure)) => return Err(failure),
                Err(_) => {
                    tracing::debug!("stale reply never arrived");
                }
            }
        }
        Ok(())
    }

    async fn exchange(&mut self, envelope: &CommandEnvelope) -> EngineResult<String> {
        self.transport
            .write_command(&envelope.command)
            .await
            .map_err(|f| EngineError::Transport(f.0))?;

        match timeout(envelope.timeout, self.transport.read_reply()).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(failure)) => Err(EngineError::Transport(failure.0)),
            Err(_) => {
                self.stale_replies += 1;
                Err(EngineError::Timeout {
                    command: envelope.command.clone(),
                    timeout_ms: envelope.timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Fatal transport failure: fail everything already queued.
    fn fail_all(&mut self, reason: String) {
        tracing::error!(reason = %reason, "transport failed; clearing command queue");
        let mut cleared = 0usize;
        while let Ok(pending) = self.rx.try_recv() {
            let _ = pending
                .reply_tx
                .send(Err(EngineError::Transport(reason.clone())));
            cleared += 1;
        }
        if cleared > 0 {
            tracing::warn!(cleared, "failed queued commands after transport failure");
        }
        self.stale_replies = 0;
        self.failure = Some(reason);
    }
}
