//! One-shot scan: connect, detect, read trouble codes and the VIN.
//!
//! Individual read failures are recorded in the report and the scan moves
//! on. Fatal transport errors end the scan with whatever was collected.

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use elm_engine::decoder::decode_dtc_response;
use elm_engine::{
    DetectionOutcome, DtcRetriever, EngineError, ProtocolEngine, TimingMode, VinRetriever,
};
use elm_protocol::{DtcCode, DtcResponse, DtcServiceMode, ProtocolSnapshot, VinRecord};

use crate::config::ScanOptions;

/// Overall outcome of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    /// Every requested read succeeded.
    Completed,
    /// Detection succeeded but at least one read failed.
    Partial,
    /// Connection or detection failed.
    Failed,
}

/// One DTC service read, decoded.
#[derive(Debug, Clone, Serialize)]
pub struct DtcReport {
    pub response: DtcResponse,
    pub codes: Vec<DtcCode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanReport {
    pub status: ScanStatus,
    pub adapter_version: Option<String>,
    pub detection: Option<DetectionOutcome>,
    pub timing_mode: Option<TimingMode>,
    pub dtcs: Vec<DtcReport>,
    pub vin: Option<VinRecord>,
    pub errors: Vec<String>,
    /// Session state at the end of the scan, before disconnecting.
    pub protocol: ProtocolSnapshot,
    pub latency_ms: u64,
    pub finished_at: DateTime<Utc>,
}

struct ScanProgress {
    detection: Option<DetectionOutcome>,
    timing_mode: Option<TimingMode>,
    dtcs: Vec<DtcReport>,
    vin: Option<VinRecord>,
    errors: Vec<String>,
}

impl ScanProgress {
    fn record(&mut self, stage: &str, err: &EngineError) {
        tracing::warn!(stage, error = %err, "scan step failed");
        self.errors.push(format!("{stage}: {err}"));
    }
}

/// Run a full scan on a freshly constructed engine.
pub async fn run_scan(engine: &mut ProtocolEngine, options: &ScanOptions) -> ScanReport {
    let start = Instant::now();
    let mut progress = ScanProgress {
        detection: None,
        timing_mode: None,
        dtcs: Vec::new(),
        vin: None,
        errors: Vec::new(),
    };

    let fatal = scan_steps(engine, options, &mut progress).await.err();
    if let Some(err) = &fatal {
        progress.record("scan aborted", err);
    }

    let status = if progress.detection.is_none() {
        ScanStatus::Failed
    } else if progress.errors.is_empty() {
        ScanStatus::Completed
    } else {
        ScanStatus::Partial
    };
    let adapter_version = engine.session().adapter_version().map(str::to_string);
    let protocol = engine.snapshot();

    if fatal.is_none() {
        if let Err(err) = engine.disconnect().await {
            tracing::warn!(error = %err, "disconnect failed");
        }
    }

    let report = ScanReport {
        status,
        adapter_version,
        detection: progress.detection,
        timing_mode: progress.timing_mode,
        dtcs: progress.dtcs,
        vin: progress.vin,
        errors: progress.errors,
        protocol,
        latency_ms: start.elapsed().as_millis() as u64,
        finished_at: Utc::now(),
    };
    tracing::info!(
        status = ?report.status,
        dtc_reads = report.dtcs.len(),
        vin = report.vin.as_ref().map(|v| v.vin.as_str()),
        latency_ms = report.latency_ms,
        "scan finished"
    );
    report
}

/// Only fatal errors escape; everything else lands in `progress.errors`.
async fn scan_steps(
    engine: &mut ProtocolEngine,
    options: &ScanOptions,
    progress: &mut ScanProgress,
) -> Result<(), EngineError> {
    let detection = match engine.connect().await {
        Ok(outcome) => outcome,
        Err(err) if err.is_fatal() => return Err(err),
        Err(err) => {
            progress.record("detection", &err);
            return Ok(());
        }
    };
    tracing::info!(
        protocol = detection.protocol.value(),
        description = detection.config.description,
        ecus = ?detection.ecu_addresses,
        "protocol detected"
    );
    progress.detection = Some(detection);

    match engine.establish_timing().await {
        Ok(mode) => progress.timing_mode = Some(mode),
        Err(err) if err.is_fatal() => return Err(err),
        Err(err) => progress.record("timing", &err),
    }

    let mut dtc = DtcRetriever::new();
    for kind in &options.dtc_modes {
        let mode = DtcServiceMode::for_type(*kind);
        match dtc.retrieve(engine, mode).await {
            Ok(response) => {
                let codes = decode_dtc_response(&response);
                tracing::info!(service = mode.request_code, count = codes.len(), "DTCs read");
                progress.dtcs.push(DtcReport { response, codes });
            }
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => progress.record(mode.name, &err),
        }
    }

    if options.read_vin {
        match VinRetriever::new().retrieve(engine).await {
            Ok(record) => progress.vin = Some(record),
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => progress.record("vin", &err),
        }
    }
    Ok(())
}
