//! Protocol detection.
//!
//! Runs once per connection attempt:
//!
//! 1. `ATZ`, then wait for the adapter to reboot.
//! 2. Base init: echo off, linefeeds off, headers on (address discovery
//!    needs them), response timeout, adaptive timing off.
//! 3. `ATSP0` and up to five `0100` pings until an ECU address shows up.
//! 4. `ATDPN` until the adapter stops searching.
//! 5. Candidate configurations from the priority table.
//! 6. Each candidate in order: `ATSP<n>`, pings, CAN addressing, a mode 09
//!    probe with flow-control tuning, then address extraction and commit.

use std::time::Duration;

use elm_protocol::{ConnectionState, ProtocolConfig, ProtocolId, candidates_for};
use serde::Serialize;

use crate::classifier::{Classification, ResponseKind, normalize};
use crate::command::CommandEnvelope;
use crate::decoder::supported_pids;
use crate::ecu::{BitFormatHint, MODE_01_MARKERS, MODE_09_MARKERS, extract_ecu_addresses};
use crate::engine::ProtocolEngine;
use crate::error::{EngineError, EngineResult};
use crate::flow_control::{self, default_flow_control_header, looks_truncated, standard_ladder};
use crate::session::ReadyPurpose;
use crate::timing::TimingMode;

/// Formatting commands sent after reset. The timeout command follows.
pub const BASE_INIT: [&str; 3] = ["ATE0", "ATL0", "ATH1"];

/// Probes tried after a candidate answers `0100`.
const VEHICLE_INFO_PROBES: [&str; 2] = ["0902", "0901"];

/// Parsed `ATDPN` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DpnReply {
    pub protocol: ProtocolId,
    /// The adapter prefixed the number with `A`.
    pub auto_prefix: bool,
}

/// Parse `A6`, `6` or `A` (protocol 10). Single digits are hex.
pub fn parse_dpn(raw: &str) -> Option<DpnReply> {
    let text = normalize(raw);
    let (auto_prefix, digits) = match text.strip_prefix('A') {
        Some(rest) if !rest.is_empty() => (true, rest),
        _ => (false, text.as_str()),
    };
    let value = if digits.len() == 1 {
        u8::from_str_radix(digits, 16).ok()?
    } else {
        digits.parse::<u8>().ok()?
    };
    let protocol = ProtocolId::new(value).filter(|p| !p.is_auto())?;
    Some(DpnReply {
        protocol,
        auto_prefix,
    })
}

/// Adapter identification from an `ATZ`/`ATI` reply.
pub fn adapter_version(raw: &str) -> Option<String> {
    let lines: Vec<&str> = raw
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|l| !l.is_empty() && *l != ">" && !l.eq_ignore_ascii_case("ATZ"))
        .filter(|l| !l.eq_ignore_ascii_case("ATI"))
        .collect();
    lines
        .iter()
        .find(|l| l.to_ascii_uppercase().contains("ELM"))
        .or(lines.last())
        .map(|l| l.to_string())
}

/// Result of a successful detection.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionOutcome {
    pub protocol: ProtocolId,
    pub is_auto_detected: bool,
    pub config: ProtocolConfig,
    pub ecu_addresses: Vec<String>,
    pub selected_ecu_address: Option<String>,
}

/// Replies and addresses from a successful ping.
struct Ping {
    reply: Classification,
    addresses: Vec<String>,
}

impl ProtocolEngine {
    /// Reset the adapter, run base init and detect the protocol.
    pub async fn connect(&mut self) -> EngineResult<DetectionOutcome> {
        self.session.reset();
        self.session.set_connection(ConnectionState::Connecting);
        if let Err(err) = self.initialize_adapter().await {
            self.session.mark_error();
            self.session.set_connection(ConnectionState::Error);
            return Err(err);
        }
        self.detect_protocol().await
    }

    async fn initialize_adapter(&mut self) -> EngineResult<()> {
        let reset_timeout =
            self.config().at_timeout() + Duration::from_millis(self.config().reset_delay_ms);
        let banner = self
            .execute(CommandEnvelope::new("ATZ", reset_timeout))
            .await?;
        self.session.apply_acknowledged("ATZ");
        tokio::time::sleep(Duration::from_millis(self.config().reset_delay_ms)).await;
        self.session.set_connection(ConnectionState::Initializing);

        for command in BASE_INIT {
            self.at_ok(command).await?;
        }
        let timeout_command = self.config().timing.timeout_command();
        self.at_ok(&timeout_command).await?;
        if self.at_lenient("ATAT0").await? {
            self.timing.set_mode(TimingMode::Off);
        }

        let ati = self.send_at("ATI").await;
        let version = match &ati {
            Ok(reply) if reply.is_usable() => adapter_version(&reply.raw),
            _ => None,
        }
        .or_else(|| adapter_version(&banner.raw));
        if let Some(version) = version {
            tracing::info!(version = %version, "adapter identified");
            self.session.set_adapter_version(version);
        }
        Ok(())
    }

    /// Steps 3 to 6: auto protocol, `ATDPN`, then the candidate loop.
    pub async fn detect_protocol(&mut self) -> EngineResult<DetectionOutcome> {
        self.session.set_connection(ConnectionState::EcuDetect);
        self.session.begin_configuring();

        match self.detect_inner().await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.session.mark_error();
                self.session.set_connection(ConnectionState::Error);
                Err(err)
            }
        }
    }

    /// Forget the protocol and detect again from `ATSP0`. Used when the
    /// adapter reports a bus error during retrieval.
    pub async fn redetect(&mut self) -> EngineResult<DetectionOutcome> {
        tracing::warn!(
            protocol = self.session.active_protocol_id().value(),
            "re-detecting protocol"
        );
        self.session.reset_protocol();
        self.at_ok("ATH1").await?;
        self.detect_protocol().await
    }

    async fn detect_inner(&mut self) -> EngineResult<DetectionOutcome> {
        self.at_ok("ATSP0").await?;

        let attempts = self.config().initial_ping_attempts;
        if let Some(ping) = self.ping_for_ecus(attempts, None).await? {
            tracing::info!(addresses = ?ping.addresses, "ECU answered under automatic protocol");
        }

        let detected = self.query_protocol_number().await?;
        let candidates = candidates_for(detected.map(|d| d.protocol));
        tracing::info!(
            detected = detected.map(|d| d.protocol.value()),
            candidates = candidates.len(),
            "trying candidate configurations"
        );

        for candidate in &candidates {
            match self.try_candidate(candidate).await {
                Ok(Some(hit)) => return self.commit_detection(candidate, detected.is_some(), hit),
                Ok(None) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    tracing::warn!(
                        protocol = candidate.protocol.value(),
                        priority = candidate.priority,
                        error = %err,
                        "candidate failed"
                    );
                }
            }
        }
        Err(EngineError::Detection(format!(
            "none of {} candidate configuration(s) answered",
            candidates.len()
        )))
    }

    /// Ping `0100` up to `attempts` times until an ECU address is found.
    async fn ping_for_ecus(
        &mut self,
        attempts: u32,
        hint: Option<BitFormatHint>,
    ) -> EngineResult<Option<Ping>> {
        let delay = Duration::from_millis(self.config().ping_retry_delay_ms);
        for attempt in 1..=attempts {
            match self.send_request("0100").await {
                Ok(reply) => {
                    let addresses = extract_ecu_addresses(&reply.raw, MODE_01_MARKERS, hint);
                    if !addresses.is_empty() {
                        return Ok(Some(Ping { reply, addresses }));
                    }
                    tracing::debug!(attempt, kind = ?reply.kind, "no ECU address in ping reply");
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => tracing::debug!(attempt, error = %err, "ping failed"),
            }
            if attempt < attempts {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(None)
    }

    /// Ask the adapter which protocol it settled on.
    async fn query_protocol_number(&mut self) -> EngineResult<Option<DpnReply>> {
        let attempts = self.config().dpn_attempts;
        let delay = Duration::from_millis(self.config().dpn_retry_delay_ms);
        for attempt in 1..=attempts {
            let reply = match self.send_at("ATDPN").await {
                Ok(reply) => reply,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    tracing::debug!(attempt, error = %err, "ATDPN failed");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };
            if reply.is_empty() || reply.kind == ResponseKind::Searching {
                tracing::debug!(attempt, "adapter still searching");
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
                continue;
            }
            let parsed = parse_dpn(&reply.raw);
            if parsed.is_none() {
                tracing::warn!(response = %reply.normalized, "unparseable ATDPN reply");
            }
            return Ok(parsed);
        }
        Ok(None)
    }

    async fn try_candidate(&mut self, candidate: &ProtocolConfig) -> EngineResult<Option<CandidateHit>> {
        let protocol = candidate.protocol;
        tracing::info!(
            protocol = protocol.value(),
            priority = candidate.priority,
            description = candidate.description,
            "trying candidate"
        );
        if !self.at_lenient(&protocol.set_command()).await? {
            return Ok(None);
        }
        tokio::time::sleep(Duration::from_millis(self.config().protocol_delay_ms)).await;

        let hint = BitFormatHint::from_header_format(protocol.header_format());
        let attempts = self.config().candidate_ping_attempts;
        let ping = self.ping_for_ecus(attempts, hint).await?;

        for command in candidate.can_commands() {
            self.at_lenient(&command).await?;
        }

        let probe = self.probe_vehicle_info(candidate, hint).await?;
        let mut addresses = probe.unwrap_or_default();
        if addresses.is_empty() {
            if let Some(ping) = &ping {
                addresses = ping.addresses.clone();
            }
        }
        if addresses.is_empty() {
            return Ok(None);
        }
        Ok(Some(CandidateHit {
            addresses,
            ping_reply: ping.map(|p| p.reply),
        }))
    }

    /// Mode 09 probe. Returns the addresses found in the first usable reply.
    async fn probe_vehicle_info(
        &mut self,
        candidate: &ProtocolConfig,
        hint: Option<BitFormatHint>,
    ) -> EngineResult<Option<Vec<String>>> {
        let can = candidate.is_can();
        if can {
            self.at_lenient("ATFCSM0").await?;
        }
        let timeout = self.config().data_timeout(can);
        for probe in VEHICLE_INFO_PROBES {
            let mut reply = match self.send_request_with_timeout(probe, timeout).await {
                Ok(reply) => reply,
                Err(err) if err.is_fatal() => return Err(err),
                Err(_) => continue,
            };
            if can && !reply.kind.is_error() && looks_truncated(&reply) {
                let header = candidate
                    .flow_control_header
                    .unwrap_or_else(|| default_flow_control_header(candidate.protocol.header_format()));
                reply =
                    flow_control::recover_truncated(self, &standard_ladder(header), probe, timeout)
                        .await?;
            }
            if reply.is_usable() && !looks_truncated(&reply) {
                return Ok(Some(extract_ecu_addresses(&reply.raw, MODE_09_MARKERS, hint)));
            }
        }
        Ok(None)
    }

    fn commit_detection(
        &mut self,
        candidate: &ProtocolConfig,
        auto_detected: bool,
        hit: CandidateHit,
    ) -> EngineResult<DetectionOutcome> {
        let protocol = candidate.protocol;
        self.session
            .commit_protocol(protocol, auto_detected, candidate.header.map(str::to_string));
        for address in &hit.addresses {
            self.session.add_ecu_address(address);
        }
        if let Some(reply) = &hit.ping_reply {
            self.session.set_supported_pids(supported_pids(&reply.raw));
        }
        if !self.session.mark_ready(ReadyPurpose::Detection) {
            return Err(EngineError::NotReady {
                state: self.session.lifecycle(),
            });
        }
        let profile = self.config().timing.for_protocol(protocol);
        self.timing.apply_profile(&profile, TimingMode::Off);
        self.session.set_connection(ConnectionState::EcuDetected);
        self.session.set_connection(ConnectionState::Connected);

        tracing::info!(
            protocol = protocol.value(),
            description = protocol.description(),
            auto_detected,
            addresses = ?hit.addresses,
            "protocol detected"
        );
        Ok(DetectionOutcome {
            protocol,
            is_auto_detected: auto_detected,
            config: candidate.clone(),
            ecu_addresses: self.session.ecu_addresses().to_vec(),
            selected_ecu_address: self.session.selected_ecu_address().map(str::to_string),
        })
    }

    /// Enable adaptive timing with the profile of the active protocol, or
    /// fall back to fixed timing if the adapter refuses.
    pub async fn establish_timing(&mut self) -> EngineResult<TimingMode> {
        let profile = self
            .config()
            .timing
            .for_protocol(self.session.active_protocol_id());
        let accepted = self.at_lenient("ATAT1").await?;
        if accepted && self.at_lenient(&profile.timeout_command()).await? {
            self.timing.apply_profile(&profile, TimingMode::Normal);
        } else {
            let fallback = self.config().timing;
            tracing::warn!("adaptive timing rejected; using fixed timing");
            self.at_lenient(&fallback.timeout_command()).await?;
            self.timing
                .fall_back_to_fixed(Duration::from_millis(fallback.protocol_timeout_ms));
        }
        Ok(self.timing.mode())
    }
}

struct CandidateHit {
    addresses: Vec<String>,
    ping_reply: Option<Classification>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::mock::MockTransport;
    use elm_protocol::{HeaderFormat, LifecycleState};

    fn base_adapter() -> MockTransport {
        let mock = MockTransport::new();
        mock.on("ATZ", "ATZ\r\r\rELM327 v1.5");
        for cmd in ["ATE0", "ATL0", "ATH1", "ATST64", "ATAT0", "ATAT1", "ATSP0", "ATPC"] {
            mock.on(cmd, "OK");
        }
        mock.on("ATI", "ELM327 v1.5");
        mock
    }

    fn can11_vehicle() -> MockTransport {
        let mock = base_adapter();
        mock.on_sequence("0100", ["SEARCHING...\r7E8 06 41 00 BE 3E A8 13"]);
        mock.on("0100", "7E8 06 41 00 BE 3E A8 13");
        mock.on_sequence("ATDPN", ["SEARCHING...", "6\r"]);
        for cmd in ["ATSP6", "ATCAF1", "ATSH7DF", "ATCF7E8", "ATFCSM0"] {
            mock.on(cmd, "OK");
        }
        mock.on(
            "0902",
            "7E8 10 14 49 02 01 31 44 34\r7E8 21 47 50 30 30 52 35 35\r7E8 22 42 31 32 33 34 35 36",
        );
        mock
    }

    #[test]
    fn dpn_parsing() {
        assert_eq!(
            parse_dpn("A6"),
            Some(DpnReply {
                protocol: ProtocolId::new(6).unwrap(),
                auto_prefix: true
            })
        );
        assert_eq!(parse_dpn("6\r").map(|d| d.auto_prefix), Some(false));
        assert_eq!(parse_dpn("A").map(|d| d.protocol.value()), Some(10));
        assert_eq!(parse_dpn("AC").map(|d| d.protocol.value()), Some(12));
        assert_eq!(parse_dpn("A13").map(|d| d.protocol.value()), Some(13));
        assert_eq!(parse_dpn("0"), None);
        assert_eq!(parse_dpn("?"), None);
        assert_eq!(parse_dpn("99"), None);
    }

    #[test]
    fn adapter_banner() {
        assert_eq!(
            adapter_version("ATZ\r\r\rELM327 v1.5\r\r>").as_deref(),
            Some("ELM327 v1.5")
        );
        assert_eq!(adapter_version("OBDLink MX").as_deref(), Some("OBDLink MX"));
        assert_eq!(adapter_version("\r\r"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn searching_then_protocol_six() {
        let mock = can11_vehicle();
        let mut engine = ProtocolEngine::new(mock.clone(), EngineConfig::default());
        let outcome = engine.connect().await.unwrap();

        assert_eq!(outcome.protocol.value(), 6);
        assert!(outcome.is_auto_detected);
        assert_eq!(outcome.config.header, Some("7DF"));
        assert_eq!(outcome.selected_ecu_address.as_deref(), Some("7E8"));

        let session = engine.session();
        assert_eq!(session.lifecycle(), LifecycleState::Ready);
        assert_eq!(session.connection(), ConnectionState::Connected);
        assert_eq!(session.header_format(), HeaderFormat::Can11Bit);
        assert_eq!(session.adapter_version(), Some("ELM327 v1.5"));
        assert!(session.supported_pids().contains(&0x0C));
        assert_eq!(mock.sent_count("ATDPN"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn init_sequence_order() {
        let mock = can11_vehicle();
        let mut engine = ProtocolEngine::new(mock.clone(), EngineConfig::default());
        engine.connect().await.unwrap();
        let sent = mock.sent();
        assert_eq!(
            &sent[..8],
            &["ATZ", "ATE0", "ATL0", "ATH1", "ATST64", "ATAT0", "ATI", "ATSP0"]
        );
        let sp6 = sent.iter().position(|c| c == "ATSP6").unwrap();
        let fcsm = sent.iter().position(|c| c == "ATFCSM0").unwrap();
        let probe = sent.iter().position(|c| c == "0902").unwrap();
        assert!(sp6 < fcsm && fcsm < probe);
    }

    #[tokio::test(start_paused = true)]
    async fn undetected_protocol_tries_table_in_order() {
        let mock = base_adapter();
        mock.on("ATDPN", "?");
        for cmd in ["ATSP6", "ATSP8", "ATSP7", "ATSP9", "ATSP3"] {
            mock.on(cmd, "OK");
        }
        let mut engine = ProtocolEngine::new(mock.clone(), EngineConfig::default());
        let err = engine.connect().await.unwrap_err();
        assert!(matches!(err, EngineError::Detection(_)));
        assert_eq!(engine.session().lifecycle(), LifecycleState::Error);

        let order: Vec<String> = mock
            .sent()
            .into_iter()
            .filter(|c| c.starts_with("ATSP") && c != "ATSP0")
            .collect();
        assert_eq!(
            order,
            [
                "ATSP6", "ATSP6", "ATSP8", "ATSP8", "ATSP7", "ATSP9", "ATSP3", "ATSP4", "ATSP5",
                "ATSP1", "ATSP2"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn iso9141_vehicle_detected() {
        let mock = base_adapter();
        mock.on("ATDPN", "A3");
        mock.on("ATSP3", "OK");
        mock.on_sequence("0100", ["SEARCHING...\rBUS INIT: ...OK\r48 6B 10 41 00 BE 3E B8 11 FA"]);
        mock.on("0100", "48 6B 10 41 00 BE 3E B8 11 FA");
        mock.on("0902", "NO DATA");
        mock.on("0901", "NO DATA");
        let mut engine = ProtocolEngine::new(mock.clone(), EngineConfig::default());
        let outcome = engine.connect().await.unwrap();

        assert_eq!(outcome.protocol.value(), 3);
        assert_eq!(outcome.ecu_addresses, vec!["10"]);
        assert_eq!(mock.sent_count("ATFCSM0"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn establish_timing_falls_back_to_fixed() {
        let mock = can11_vehicle();
        mock.on("ATAT1", "?");
        let mut engine = ProtocolEngine::new(mock.clone(), EngineConfig::default());
        engine.connect().await.unwrap();
        assert_eq!(engine.establish_timing().await.unwrap(), TimingMode::Fixed);
    }

    #[tokio::test(start_paused = true)]
    async fn establish_timing_uses_can_profile() {
        let mock = can11_vehicle();
        mock.on("ATST3C", "OK");
        let mut engine = ProtocolEngine::new(mock.clone(), EngineConfig::default());
        engine.connect().await.unwrap();
        assert_eq!(engine.establish_timing().await.unwrap(), TimingMode::Normal);
        assert_eq!(engine.timing().max_delay(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn transport_loss_aborts_detection() {
        let mock = base_adapter();
        mock.fail_on("ATSP0");
        let mut engine = ProtocolEngine::new(mock.clone(), EngineConfig::default());
        let err = engine.connect().await.unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(engine.session().connection(), ConnectionState::Error);
    }
}
