//! Shared test harness for E2E tests.
//!
//! `SimulatedAdapter` answers like an ELM327 wired to one vehicle: it tracks
//! the selected protocol, header and flow-control settings, and formats ECU
//! replies the way the adapter prints them for each bus.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use elm_engine::mock::{MockReply, MockTransport};
use elm_engine::{EngineConfig, ProtocolEngine};

pub const ADAPTER_BANNER: &str = "ELM327 v1.5";

/// A vehicle on the other side of the adapter.
#[derive(Debug, Clone)]
pub struct Vehicle {
    /// ELM327 protocol number the ECU speaks.
    pub protocol: u8,
    pub current: Vec<&'static str>,
    pub pending: Vec<&'static str>,
    pub permanent: Vec<&'static str>,
    pub vin: Option<&'static str>,
    /// Multi-frame replies overflow unless flow control is `300008`, mode 1.
    pub needs_extended_wait: bool,
    /// The next `n` sends of this request answer `CAN ERROR`.
    pub bus_errors: Option<(&'static str, u32)>,
    /// Ignition off: no ECU answers anything.
    pub silent: bool,
}

impl Vehicle {
    pub fn new(protocol: u8) -> Self {
        Self {
            protocol,
            current: Vec::new(),
            pending: Vec::new(),
            permanent: Vec::new(),
            vin: None,
            needs_extended_wait: false,
            bus_errors: None,
            silent: false,
        }
    }

    /// A vehicle whose ECUs never answer.
    pub fn unplugged() -> Self {
        Self {
            silent: true,
            ..Self::new(0)
        }
    }

    pub fn with_current(mut self, codes: &[&'static str]) -> Self {
        self.current = codes.to_vec();
        self
    }

    pub fn with_pending(mut self, codes: &[&'static str]) -> Self {
        self.pending = codes.to_vec();
        self
    }

    pub fn with_permanent(mut self, codes: &[&'static str]) -> Self {
        self.permanent = codes.to_vec();
        self
    }

    pub fn with_vin(mut self, vin: &'static str) -> Self {
        self.vin = Some(vin);
        self
    }

    pub fn needing_extended_wait(mut self) -> Self {
        self.needs_extended_wait = true;
        self
    }

    pub fn with_bus_errors(mut self, request: &'static str, count: u32) -> Self {
        self.bus_errors = Some((request, count));
        self
    }

    fn is_can(&self) -> bool {
        (6..=9).contains(&self.protocol)
    }

    fn is_29bit(&self) -> bool {
        matches!(self.protocol, 7 | 9)
    }

    /// Messages the ECU sends for `request`, or `None` if it stays silent.
    fn answer(&self, request: &str) -> Option<Vec<Vec<u8>>> {
        if self.silent {
            return None;
        }
        match request {
            "0100" => Some(vec![vec![0x41, 0x00, 0xBE, 0x3E, 0xA8, 0x13]]),
            "0902" => self.vin.map(|vin| self.vin_messages(vin)),
            "03" => Some(self.dtc_messages(0x43, &self.current)),
            "07" => Some(self.dtc_messages(0x47, &self.pending)),
            "0A" => Some(self.dtc_messages(0x4A, &self.permanent)),
            _ => None,
        }
    }

    fn vin_messages(&self, vin: &str) -> Vec<Vec<u8>> {
        if self.is_can() {
            let mut message = vec![0x49, 0x02, 0x01];
            message.extend(vin.bytes());
            return vec![message];
        }
        // Five messages of four bytes; the first is zero padded.
        let mut data = vec![0u8; 3];
        data.extend(vin.bytes());
        data.chunks(4)
            .enumerate()
            .map(|(i, chunk)| {
                let mut message = vec![0x49, 0x02, i as u8 + 1];
                message.extend_from_slice(chunk);
                message
            })
            .collect()
    }

    fn dtc_messages(&self, service: u8, codes: &[&str]) -> Vec<Vec<u8>> {
        let bytes: Vec<u8> = codes.iter().flat_map(|code| encode_dtc(code)).collect();
        if self.is_can() {
            let mut message = vec![service, codes.len() as u8];
            message.extend(bytes);
            return vec![message];
        }
        if bytes.is_empty() {
            return vec![vec![service, 0, 0, 0, 0, 0, 0]];
        }
        bytes
            .chunks(6)
            .map(|chunk| {
                let mut message = vec![service];
                message.extend_from_slice(chunk);
                message.resize(7, 0);
                message
            })
            .collect()
    }
}

/// `P0143` → `[0x01, 0x43]`.
pub fn encode_dtc(code: &str) -> [u8; 2] {
    let category: u8 = match code.as_bytes()[0] {
        b'P' => 0,
        b'C' => 1,
        b'B' => 2,
        _ => 3,
    };
    let digits = u16::from_str_radix(&code[1..], 16).unwrap();
    let value = (u16::from(category) << 14) | digits;
    value.to_be_bytes()
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

struct AdapterState {
    vehicle: Vehicle,
    /// `0` is automatic.
    selected: u8,
    /// The automatic search has found the vehicle.
    searched: bool,
    headers: bool,
    fc_data: String,
    fc_mode: u8,
    dpn_searching: u32,
    dpn_unsupported: bool,
}

impl AdapterState {
    fn new(vehicle: Vehicle) -> Self {
        Self {
            vehicle,
            selected: 0,
            searched: false,
            headers: false,
            fc_data: "300000".to_string(),
            fc_mode: 0,
            dpn_searching: 0,
            dpn_unsupported: false,
        }
    }

    fn respond(&mut self, command: &str) -> String {
        match command.strip_prefix("AT") {
            Some(at) => self.respond_at(at),
            None => self.respond_obd(command),
        }
    }

    fn respond_at(&mut self, at: &str) -> String {
        match at {
            "Z" => {
                self.selected = 0;
                self.searched = false;
                self.headers = false;
                self.fc_mode = 0;
                format!("\r\r{ADAPTER_BANNER}")
            }
            "I" => ADAPTER_BANNER.to_string(),
            "H0" => {
                self.headers = false;
                "OK".to_string()
            }
            "H1" => {
                self.headers = true;
                "OK".to_string()
            }
            "DPN" => self.describe_protocol(),
            _ => {
                if let Some(code) = at.strip_prefix("SP") {
                    self.selected = u8::from_str_radix(code, 16).unwrap_or(0);
                    self.searched = false;
                } else if let Some(data) = at.strip_prefix("FCSD") {
                    self.fc_data = data.to_string();
                } else if let Some(mode) = at.strip_prefix("FCSM") {
                    self.fc_mode = mode.parse().unwrap_or(0);
                }
                "OK".to_string()
            }
        }
    }

    fn describe_protocol(&mut self) -> String {
        if self.dpn_unsupported {
            return "?".to_string();
        }
        if self.dpn_searching > 0 {
            self.dpn_searching -= 1;
            return "SEARCHING...".to_string();
        }
        match self.selected {
            0 if self.searched => format!("A{:X}", self.vehicle.protocol),
            0 => "0".to_string(),
            n => format!("{n:X}"),
        }
    }

    fn respond_obd(&mut self, request: &str) -> String {
        if let Some((erroring, remaining)) = self.vehicle.bus_errors.as_mut() {
            if *erroring == request && *remaining > 0 {
                *remaining -= 1;
                return "CAN ERROR".to_string();
            }
        }

        let mut preamble = String::new();
        if self.selected == 0 && !self.searched {
            self.searched = true;
            preamble.push_str("SEARCHING...\r");
        } else if self.selected != 0 && self.selected != self.vehicle.protocol {
            return if (6..=9).contains(&self.selected) {
                "NO DATA".to_string()
            } else {
                "UNABLE TO CONNECT".to_string()
            };
        }

        let Some(messages) = self.vehicle.answer(request) else {
            return format!("{preamble}NO DATA");
        };
        let body = if self.vehicle.is_can() {
            let multi_frame = messages.iter().any(|m| m.len() > 7);
            let tuned = self.fc_mode == 1 && self.fc_data == "300008";
            if multi_frame && self.vehicle.needs_extended_wait && !tuned {
                return "BUFFER FULL".to_string();
            }
            messages
                .iter()
                .map(|m| self.format_can(m))
                .collect::<Vec<_>>()
                .join("\r")
        } else {
            messages
                .iter()
                .map(|m| self.format_legacy(m))
                .collect::<Vec<_>>()
                .join("\r")
        };
        format!("{preamble}{body}\r\r")
    }

    fn can_header(&self) -> &'static str {
        if self.vehicle.is_29bit() {
            "18 DA F1 10"
        } else {
            "7E8"
        }
    }

    fn format_can(&self, message: &[u8]) -> String {
        let len = message.len();
        let header = self.can_header();
        if len <= 7 {
            return if self.headers {
                format!("{header} {len:02X} {}", hex(message))
            } else {
                hex(message)
            };
        }

        let (first, rest) = message.split_at(6);
        let consecutive: Vec<Vec<u8>> = rest
            .chunks(7)
            .map(|chunk| {
                let mut frame = chunk.to_vec();
                frame.resize(7, 0);
                frame
            })
            .collect();

        let mut lines = Vec::new();
        if self.headers {
            lines.push(format!(
                "{header} 1{:X} {:02X} {}",
                len >> 8,
                len & 0xFF,
                hex(first)
            ));
            for (i, frame) in consecutive.iter().enumerate() {
                lines.push(format!("{header} 2{:X} {}", (i + 1) % 16, hex(frame)));
            }
        } else {
            lines.push(format!("{len:03X}"));
            lines.push(format!("0: {}", hex(first)));
            for (i, frame) in consecutive.iter().enumerate() {
                lines.push(format!("{:X}: {}", (i + 1) % 16, hex(frame)));
            }
        }
        lines.join("\r")
    }

    fn format_legacy(&self, message: &[u8]) -> String {
        if !self.headers {
            return hex(message);
        }
        let mut frame = match self.vehicle.protocol {
            4 | 5 => vec![0x80 | message.len() as u8, 0xF1, 0x10],
            _ => vec![0x48, 0x6B, 0x10],
        };
        frame.extend_from_slice(message);
        let checksum = frame.iter().fold(0u8, |sum, b| sum.wrapping_add(*b));
        frame.push(checksum);
        hex(&frame)
    }
}

/// Scripted ELM327 plus the vehicle behind it.
#[derive(Clone)]
pub struct SimulatedAdapter {
    pub mock: MockTransport,
    state: Arc<Mutex<AdapterState>>,
}

impl SimulatedAdapter {
    pub fn new(vehicle: Vehicle) -> Self {
        let mock = MockTransport::new();
        let state = Arc::new(Mutex::new(AdapterState::new(vehicle)));
        let shared = state.clone();
        mock.set_responder(move |command| {
            Some(MockReply::Text(shared.lock().unwrap().respond(command)))
        });
        Self { mock, state }
    }

    /// `ATDPN` answers `SEARCHING...` for the next `polls` queries.
    pub fn dpn_searching(self, polls: u32) -> Self {
        self.state.lock().unwrap().dpn_searching = polls;
        self
    }

    /// `ATDPN` is not understood.
    pub fn dpn_unsupported(self) -> Self {
        self.state.lock().unwrap().dpn_unsupported = true;
        self
    }

    /// Unplug the adapter and plug it into another vehicle.
    pub fn swap_vehicle(&self, vehicle: Vehicle) {
        self.state.lock().unwrap().vehicle = vehicle;
    }

    pub fn headers_enabled(&self) -> bool {
        self.state.lock().unwrap().headers
    }

    pub fn flow_control(&self) -> (String, u8) {
        let state = self.state.lock().unwrap();
        (state.fc_data.clone(), state.fc_mode)
    }

    pub fn engine(&self) -> ProtocolEngine {
        ProtocolEngine::new(self.mock.clone(), EngineConfig::default())
    }

    /// Commands sent, in order.
    pub fn sent(&self) -> Vec<String> {
        self.mock.sent()
    }

    /// Protocol numbers selected with `ATSP`, in order.
    pub fn selected_protocols(&self) -> Vec<String> {
        self.mock
            .sent()
            .into_iter()
            .filter_map(|c| c.strip_prefix("ATSP").map(str::to_string))
            .collect()
    }
}

pub const SAMPLE_VIN: &str = "1D4GP00R55B123456";

pub fn can11_vehicle() -> Vehicle {
    Vehicle::new(6)
        .with_current(&["P0143", "P0196"])
        .with_vin(SAMPLE_VIN)
}

pub fn can29_vehicle() -> Vehicle {
    Vehicle::new(7)
        .with_current(&["P0300"])
        .with_vin("WVWZZZ1JZXW000001")
}

pub fn iso9141_vehicle() -> Vehicle {
    Vehicle::new(3)
        .with_current(&["P0171", "P0174", "P0420", "P0300"])
        .with_vin("JT2BG22K1W0123456")
}

pub fn kwp_vehicle() -> Vehicle {
    Vehicle::new(5).with_pending(&["P0455"]).with_vin("WF0XXXGCDX1234567")
}

pub fn j1850_vehicle() -> Vehicle {
    Vehicle::new(2)
        .with_permanent(&["P0442"])
        .with_vin("1GNEK13Z62R123456")
}
