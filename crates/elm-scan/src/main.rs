//! elm-scan: one-shot diagnostic scan through a Wi-Fi ELM327 adapter.
//!
//! Connects, detects the vehicle protocol, reads trouble codes and the VIN,
//! and prints the report as JSON on stdout.

use std::time::Duration;

use tracing_subscriber::EnvFilter;

use elm_engine::ProtocolEngine;
use elm_scan::config::ScanConfig;
use elm_scan::scan::{self, ScanStatus};
use elm_scan::tcp::TcpTransport;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .json()
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "elm-scan starting");

    // ── Load config ─────────────────────────────────────────────
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "elm-scan.toml".to_string());

    let config = ScanConfig::from_file(&config_path)?;
    tracing::info!(
        host = %config.adapter.host,
        port = config.adapter.port,
        "config loaded"
    );

    // ── Adapter link ────────────────────────────────────────────
    let transport = TcpTransport::connect(
        &config.adapter.host,
        config.adapter.port,
        Duration::from_secs(config.adapter.connect_timeout_secs),
    )
    .await?;

    // ── Scan ────────────────────────────────────────────────────
    let mut engine = ProtocolEngine::new(transport, config.engine.clone());
    let report = scan::run_scan(&mut engine, &config.scan).await;

    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.status == ScanStatus::Failed {
        anyhow::bail!("scan failed: {}", report.errors.join("; "));
    }
    Ok(())
}
