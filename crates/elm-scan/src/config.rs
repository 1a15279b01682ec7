//! Scan configuration, loadable from TOML.

use elm_engine::EngineConfig;
use elm_protocol::TroubleCodeType;
use serde::Deserialize;

/// Top-level configuration for the scan tool.
#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    pub adapter: AdapterConfig,
    /// Engine timing, retry budgets and safety policy.
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub scan: ScanOptions,
}

/// Where the Wi-Fi adapter listens.
#[derive(Debug, Clone, Deserialize)]
pub struct AdapterConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

/// What to read once the protocol is detected.
#[derive(Debug, Clone, Deserialize)]
pub struct ScanOptions {
    #[serde(default = "default_dtc_modes")]
    pub dtc_modes: Vec<TroubleCodeType>,
    #[serde(default = "default_read_vin")]
    pub read_vin: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            dtc_modes: default_dtc_modes(),
            read_vin: default_read_vin(),
        }
    }
}

fn default_port() -> u16 {
    35000
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_dtc_modes() -> Vec<TroubleCodeType> {
    vec![
        TroubleCodeType::Current,
        TroubleCodeType::Pending,
        TroubleCodeType::Permanent,
    ]
}

fn default_read_vin() -> bool {
    true
}

impl ScanConfig {
    /// Load config from a TOML file path.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }
}
