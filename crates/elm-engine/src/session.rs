//! Session state: the single source of truth for the active protocol,
//! addressing, adapter flags and lifecycle.
//!
//! Mutators are crate-private. Detection writes the protocol fields; the
//! retrievers only read them and re-check `last_protocol_id` before trusting
//! anything they cached.

use chrono::Utc;
use elm_protocol::{
    CommFlags, ConnectionState, HeaderFormat, LifecycleState, ProtocolId, ProtocolSnapshot,
    ProtocolType,
};
use uuid::Uuid;

/// What a transition into `Ready` is validated for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyPurpose {
    /// Headers stay on for address discovery.
    Detection,
    /// Headers, echo, linefeeds and spaces all off.
    Retrieval,
}

#[derive(Debug, Clone)]
pub struct Session {
    id: Uuid,
    active_protocol_id: ProtocolId,
    last_protocol_id: ProtocolId,
    protocol_type: ProtocolType,
    header_format: HeaderFormat,
    is_auto_detected: bool,
    ecu_addresses: Vec<String>,
    selected_ecu_address: Option<String>,
    header: Option<String>,
    comm_flags: CommFlags,
    lifecycle: LifecycleState,
    connection: ConnectionState,
    adapter_version: Option<String>,
    supported_pids: Vec<u8>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::now_v7(),
            active_protocol_id: ProtocolId::AUTO,
            last_protocol_id: ProtocolId::AUTO,
            protocol_type: ProtocolType::Unknown,
            header_format: HeaderFormat::Unknown,
            is_auto_detected: false,
            ecu_addresses: Vec::new(),
            selected_ecu_address: None,
            header: None,
            comm_flags: CommFlags::default(),
            lifecycle: LifecycleState::Initialized,
            connection: ConnectionState::Disconnected,
            adapter_version: None,
            supported_pids: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn active_protocol_id(&self) -> ProtocolId {
        self.active_protocol_id
    }

    pub fn last_protocol_id(&self) -> ProtocolId {
        self.last_protocol_id
    }

    /// The last commit changed the protocol.
    pub fn protocol_changed(&self) -> bool {
        self.last_protocol_id != self.active_protocol_id
    }

    pub fn protocol_type(&self) -> ProtocolType {
        self.protocol_type
    }

    pub fn header_format(&self) -> HeaderFormat {
        self.header_format
    }

    pub fn is_can(&self) -> bool {
        self.header_format.is_can()
    }

    pub fn is_auto_detected(&self) -> bool {
        self.is_auto_detected
    }

    pub fn ecu_addresses(&self) -> &[String] {
        &self.ecu_addresses
    }

    pub fn selected_ecu_address(&self) -> Option<&str> {
        self.selected_ecu_address.as_deref()
    }

    /// Request header set with `ATSH`, if any.
    pub fn header(&self) -> Option<&str> {
        self.header.as_deref()
    }

    pub fn comm_flags(&self) -> CommFlags {
        self.comm_flags
    }

    pub fn lifecycle(&self) -> LifecycleState {
        self.lifecycle
    }

    pub fn is_ready(&self) -> bool {
        self.lifecycle == LifecycleState::Ready
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn adapter_version(&self) -> Option<&str> {
        self.adapter_version.as_deref()
    }

    pub fn supported_pids(&self) -> &[u8] {
        &self.supported_pids
    }

    pub fn snapshot(&self) -> ProtocolSnapshot {
        ProtocolSnapshot {
            session_id: self.id,
            protocol_id: self.active_protocol_id.value(),
            protocol_name: self.active_protocol_id.description().to_string(),
            protocol_type: self.protocol_type,
            header_format: self.header_format,
            is_auto_detected: self.is_auto_detected,
            ecu_addresses: self.ecu_addresses.clone(),
            selected_ecu_address: self.selected_ecu_address.clone(),
            header: self.header.clone(),
            comm_flags: self.comm_flags,
            lifecycle: self.lifecycle,
            adapter_version: self.adapter_version.clone(),
            captured_at: Utc::now(),
        }
    }

    pub(crate) fn set_connection(&mut self, state: ConnectionState) {
        if self.connection != state {
            tracing::debug!(from = ?self.connection, to = ?state, "connection state");
            self.connection = state;
        }
    }

    pub(crate) fn set_adapter_version(&mut self, version: impl Into<String>) {
        self.adapter_version = Some(version.into());
    }

    pub(crate) fn set_supported_pids(&mut self, pids: Vec<u8>) {
        self.supported_pids = pids;
    }

    pub(crate) fn begin_configuring(&mut self) {
        self.lifecycle = LifecycleState::Configuring;
    }

    pub(crate) fn mark_error(&mut self) {
        if self.lifecycle != LifecycleState::Error {
            tracing::warn!(from = ?self.lifecycle, "session lifecycle demoted to ERROR");
        }
        self.lifecycle = LifecycleState::Error;
    }

    /// Record the effect of an acknowledged formatting command.
    pub(crate) fn apply_acknowledged(&mut self, command: &str) {
        let flags = &mut self.comm_flags;
        match command.to_ascii_uppercase().as_str() {
            "ATE0" => flags.echo_enabled = false,
            "ATE1" => flags.echo_enabled = true,
            "ATL0" => flags.linefeeds_disabled = true,
            "ATL1" => flags.linefeeds_disabled = false,
            "ATS0" => flags.spaces_disabled = true,
            "ATS1" => flags.spaces_disabled = false,
            "ATH0" => flags.header_enabled = false,
            "ATH1" => flags.header_enabled = true,
            // ATZ and ATD restore power-on formatting.
            "ATZ" | "ATD" => *flags = CommFlags::default(),
            _ => {}
        }
    }

    /// Commit a detected protocol and its addressing.
    pub(crate) fn commit_protocol(
        &mut self,
        protocol: ProtocolId,
        auto_detected: bool,
        header: Option<String>,
    ) {
        self.last_protocol_id = self.active_protocol_id;
        self.active_protocol_id = protocol;
        self.protocol_type = protocol.protocol_type();
        self.header_format = protocol.header_format();
        self.is_auto_detected = auto_detected;
        self.header = header;
        if self.protocol_changed() {
            tracing::debug!(
                from = self.last_protocol_id.value(),
                to = protocol.value(),
                "active protocol changed"
            );
        }
    }

    /// Add a discovered ECU address. The first one becomes selected.
    pub(crate) fn add_ecu_address(&mut self, address: &str) {
        if address.is_empty() {
            return;
        }
        if !self.ecu_addresses.iter().any(|a| a == address) {
            self.ecu_addresses.push(address.to_string());
        }
        if self.selected_ecu_address.is_none() {
            self.selected_ecu_address = Some(address.to_string());
        }
    }

    /// Transition into `Ready`, re-validating the invariant first. A violation
    /// demotes to `Error` and returns false.
    pub(crate) fn mark_ready(&mut self, purpose: ReadyPurpose) -> bool {
        let protocol = self.active_protocol_id;
        let consistent = !protocol.is_auto()
            && self.protocol_type == protocol.protocol_type()
            && self.header_format == protocol.header_format();
        let flags_ok = match purpose {
            ReadyPurpose::Detection => self.comm_flags.is_clean_for_detection(),
            ReadyPurpose::Retrieval => self.comm_flags.is_clean_for_retrieval(),
        };
        if consistent && flags_ok {
            self.lifecycle = LifecycleState::Ready;
            true
        } else {
            tracing::warn!(
                protocol = protocol.value(),
                ?purpose,
                consistent,
                flags = ?self.comm_flags,
                "ready invariant violated"
            );
            self.mark_error();
            false
        }
    }

    /// Forget the protocol and addressing; keep identity and flags.
    pub(crate) fn reset_protocol(&mut self) {
        self.last_protocol_id = self.active_protocol_id;
        self.active_protocol_id = ProtocolId::AUTO;
        self.protocol_type = ProtocolType::Unknown;
        self.header_format = HeaderFormat::Unknown;
        self.is_auto_detected = false;
        self.ecu_addresses.clear();
        self.selected_ecu_address = None;
        self.header = None;
        self.supported_pids.clear();
        self.lifecycle = LifecycleState::Initialized;
    }

    /// Start over as a fresh session for a new connection.
    pub(crate) fn reset(&mut self) {
        *self = Self::new();
    }
}
