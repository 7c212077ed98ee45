//! Write a text command to a characteristic of the first matching device.
//!
//! Run with: cargo run --example write_chara -- "led on"

use ble_scan_kit::{
    BtleplugAdapter, GattInspector, InspectionBudgets, Result, ScanConfig, ScanSession,
};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Write a UTF-8 command to a characteristic.
#[derive(Parser, Debug)]
#[command(author, about, version)]
struct Args {
    /// Command to write
    cmd: String,

    /// Text to look for in the advertisement of the target device
    #[arg(short = 'n', long, default_value = "MyESP")]
    name: String,

    /// Characteristic to write to
    #[arg(short = 'u', long, default_value = "beb5483e-36e1-4688-b7f5-ea07361b26a8")]
    uuid: Uuid,

    /// Scan window in seconds
    #[arg(short = 't', long, default_value_t = 5)]
    scan_timeout: u64,

    /// Bluetooth adapter index
    #[arg(short = 'i', long, default_value_t = 0)]
    hci: usize,

    /// Write without response
    #[arg(long)]
    no_response: bool,

    /// Debug logging
    #[arg(short = 'd', long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.debug { "ble_scan_kit=debug" } else { "ble_scan_kit=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.parse().unwrap()),
        )
        .init();

    let adapter = Arc::new(BtleplugAdapter::with_index(args.hci).await?);
    let mut session = ScanSession::new(
        adapter.clone(),
        ScanConfig::fixed(Duration::from_secs(args.scan_timeout.max(1))),
        GattInspector::disabled(),
    );
    let outcome = session.run(&mut |_: &ble_scan_kit::Discovery| {}).await?;

    let Some(device) = outcome
        .devices
        .iter()
        .find(|d| d.scan_data.iter().any(|e| e.value.contains(&args.name)))
    else {
        println!("No device advertising {:?} found", args.name);
        return Ok(());
    };

    println!("Writing {:?} to {}", args.cmd, device.summary());
    GattInspector::new(InspectionBudgets::default())
        .write_characteristic(
            adapter.as_ref(),
            device,
            &args.uuid,
            args.cmd.as_bytes(),
            !args.no_response,
        )
        .await?;
    Ok(())
}
