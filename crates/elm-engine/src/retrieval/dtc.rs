//! DTC retrieval for service modes 03, 07 and 0A.
//!
//! One attempt:
//!
//! 1. Clean retrieval formatting (`ATH0`, `ATE0`, `ATL0`, `ATS0`).
//! 2. Send the request code.
//! 3. Empty or `NO DATA` replies return an empty response.
//! 4. Truncated CAN replies go through the flow-control ladder.
//! 5. Replies failing verification go through the timing ladder, after
//!    which the previous timing is put back.
//!
//! Whole attempts are retried with a backoff. An adapter error re-detects the
//! protocol before the next attempt.

use std::time::Duration;

use elm_protocol::{
    CURRENT_DTCS, DtcResponse, DtcServiceMode, LifecycleState, PENDING_DTCS, PERMANENT_DTCS,
};

use super::verify::{extract_frames, is_empty_reply, verify_dtc_reply};
use super::{RetrievalContext, current_context};
use crate::classifier::Classification;
use crate::engine::ProtocolEngine;
use crate::error::{EngineError, EngineResult};
use crate::flow_control::{
    self, default_flow_control_header, is_overflow, looks_truncated, standard_ladder,
};
use crate::timing::TimingMode;

/// Adaptive-timing mode and `ATST` value tried when a reply fails
/// verification: aggressive/medium, normal/long, aggressive/short, off/long.
pub const TIMING_LADDER: [(TimingMode, &str); 4] = [
    (TimingMode::Aggressive, "ATST32"),
    (TimingMode::Normal, "ATSTFF"),
    (TimingMode::Aggressive, "ATST19"),
    (TimingMode::Off, "ATSTFF"),
];

/// Reads trouble codes through a `ProtocolEngine`.
#[derive(Debug, Default)]
pub struct DtcRetriever {
    context: Option<RetrievalContext>,
    /// Timing mode to return to after the timing ladder touched the adapter.
    ladder_baseline: Option<TimingMode>,
}

impl DtcRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context captured on the last call.
    pub fn context(&self) -> Option<&RetrievalContext> {
        self.context.as_ref()
    }

    /// Mode 03.
    pub async fn current(&mut self, engine: &mut ProtocolEngine) -> EngineResult<DtcResponse> {
        self.retrieve(engine, &CURRENT_DTCS).await
    }

    /// Mode 07.
    pub async fn pending(&mut self, engine: &mut ProtocolEngine) -> EngineResult<DtcResponse> {
        self.retrieve(engine, &PENDING_DTCS).await
    }

    /// Mode 0A.
    pub async fn permanent(&mut self, engine: &mut ProtocolEngine) -> EngineResult<DtcResponse> {
        self.retrieve(engine, &PERMANENT_DTCS).await
    }

    /// Read one service mode, retrying whole attempts.
    pub async fn retrieve(
        &mut self,
        engine: &mut ProtocolEngine,
        mode: &DtcServiceMode,
    ) -> EngineResult<DtcResponse> {
        engine.require_protocol()?;
        let attempts = engine.config().dtc_attempts.max(1);
        let backoff = Duration::from_millis(engine.config().dtc_backoff_ms);

        for attempt in 1..=attempts {
            match self.attempt(engine, mode).await {
                Ok(response) => {
                    tracing::info!(
                        service = mode.request_code,
                        attempt,
                        frames = response.raw_frames.len(),
                        "DTC retrieval complete"
                    );
                    return Ok(response);
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err @ EngineError::Adapter { .. }) => {
                    tracing::warn!(service = mode.request_code, attempt, error = %err, "adapter error, re-detecting");
                    if let Err(redetect) = engine.redetect().await {
                        if redetect.is_fatal() {
                            return Err(redetect);
                        }
                        tracing::warn!(error = %redetect, "re-detection failed");
                    }
                }
                Err(err) => {
                    tracing::warn!(service = mode.request_code, attempt, error = %err, "DTC attempt failed");
                }
            }
            if attempt < attempts {
                tokio::time::sleep(backoff).await;
            }
        }

        let exhausted = engine.exhausted("DTC retrieval", attempts);
        self.restore_timing(engine).await?;
        if engine.session().lifecycle() == LifecycleState::Error {
            if let Err(err) = engine.at_lenient("ATPC").await {
                tracing::warn!(error = %err, "protocol close after failed retrieval");
            }
        }
        Err(exhausted)
    }

    async fn attempt(
        &mut self,
        engine: &mut ProtocolEngine,
        mode: &DtcServiceMode,
    ) -> EngineResult<DtcResponse> {
        let context = current_context(&mut self.context, engine.session()).clone();
        engine.require_protocol()?;
        engine.configure_for_retrieval().await?;

        let request = mode.request_code;
        let format = context.header_format;
        let headers_enabled = engine.session().comm_flags().header_enabled;
        let timeout = engine.data_timeout();

        let mut reply = match engine.send_request_with_timeout(request, timeout).await {
            Ok(reply) => Some(reply),
            Err(err @ EngineError::Timeout { .. }) => {
                tracing::debug!(service = request, error = %err, "request timed out");
                None
            }
            Err(err) => return Err(err),
        };

        if let Some(current) = &reply {
            if current.kind.is_adapter_error() {
                return Err(EngineError::Adapter {
                    command: request.to_string(),
                    response: current.raw.clone(),
                    kind: current.kind,
                });
            }
            if is_empty_reply(current, mode, format) {
                return Ok(self.build(engine, mode, Vec::new(), &current.raw));
            }
            let verified = verify_dtc_reply(current, mode, format, headers_enabled);
            let truncated = is_overflow(current) || (!verified && looks_truncated(current));
            if context.is_can() && !current.kind.is_error() && truncated {
                let header = default_flow_control_header(format);
                let recovered = flow_control::recover_truncated(
                    engine,
                    &standard_ladder(header),
                    request,
                    timeout,
                )
                .await?;
                if is_empty_reply(&recovered, mode, format) {
                    return Ok(self.build(engine, mode, Vec::new(), &recovered.raw));
                }
                reply = Some(recovered);
            }
        }

        let verified = reply
            .filter(|r| verify_dtc_reply(r, mode, format, headers_enabled) && !is_overflow(r));
        let reply = match verified {
            Some(reply) => reply,
            None => match self.timing_ladder(engine, mode, timeout).await? {
                Some(reply) => {
                    self.restore_timing(engine).await?;
                    reply
                }
                None => {
                    return Err(EngineError::Malformed {
                        command: request.to_string(),
                        response: engine.last_response().to_string(),
                    });
                }
            },
        };

        if is_empty_reply(&reply, mode, format) {
            return Ok(self.build(engine, mode, Vec::new(), &reply.raw));
        }
        let frames = extract_frames(&reply.raw, mode, format);
        Ok(self.build(engine, mode, frames, &reply.raw))
    }

    /// Retry the request under each timing configuration until a reply
    /// is non-error, non-empty and verifies (or says "no codes").
    async fn timing_ladder(
        &mut self,
        engine: &mut ProtocolEngine,
        mode: &DtcServiceMode,
        timeout: Duration,
    ) -> EngineResult<Option<Classification>> {
        let format = engine.session().header_format();
        let headers_enabled = engine.session().comm_flags().header_enabled;

        self.ladder_baseline.get_or_insert(engine.timing().mode());
        for (step, (timing_mode, timeout_command)) in TIMING_LADDER.into_iter().enumerate() {
            if let Some(command) = timing_mode.at_command() {
                if engine.at_lenient(command).await? {
                    engine.timing.set_mode(timing_mode);
                }
            }
            engine.at_lenient(timeout_command).await?;

            let reply = match engine.send_request_with_timeout(mode.request_code, timeout).await {
                Ok(reply) => reply,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    tracing::debug!(step, error = %err, "timing rung failed");
                    continue;
                }
            };
            if reply.kind.is_error() || reply.is_empty() {
                tracing::debug!(step, kind = ?reply.kind, "timing rung rejected");
                continue;
            }
            if is_empty_reply(&reply, mode, format)
                || verify_dtc_reply(&reply, mode, format, headers_enabled)
            {
                tracing::info!(step, mode = ?timing_mode, timeout = timeout_command, "timing ladder recovered reply");
                return Ok(Some(reply));
            }
        }
        Ok(None)
    }

    /// Return the adapter and the host-side mode to the timing in effect
    /// before the ladder ran.
    async fn restore_timing(&mut self, engine: &mut ProtocolEngine) -> EngineResult<()> {
        let Some(baseline) = self.ladder_baseline.take() else {
            return Ok(());
        };
        if let Some(command) = baseline.at_command() {
            engine.at_lenient(command).await?;
        }
        let timeout = engine.timing().timeout_command();
        engine.at_lenient(&timeout).await?;
        engine.timing.set_mode(baseline);
        tracing::debug!(mode = ?baseline, %timeout, "timing restored after ladder");
        Ok(())
    }

    fn build(
        &self,
        engine: &ProtocolEngine,
        mode: &DtcServiceMode,
        frames: Vec<String>,
        raw: &str,
    ) -> DtcResponse {
        DtcResponse::new(mode, frames, raw, engine.snapshot())
    }
}
