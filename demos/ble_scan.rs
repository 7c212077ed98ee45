//! Scan for BLE devices and dump the GATT table of every match.
//!
//! Run with: cargo run --example ble_scan -- [FILTER]... --scan-timeout 5

use ble_scan_kit::{
    BtleplugAdapter, DeviceFilter, DiscoveredDevice, Discovery, DiscoveryHandler, GattInspector,
    InspectionBudgets, InspectionReport, Result, ScanConfig, ScanSession,
};
use clap::Parser;
use std::sync::Arc;

/// Scan for BLE devices, then connect and read their characteristics.
#[derive(Parser, Debug)]
#[command(author, about, version)]
struct Args {
    /// Addresses, service UUIDs or local names to allow (all devices when empty)
    filter: Vec<String>,

    /// Bluetooth adapter index
    #[arg(short = 'i', long, default_value_t = 0)]
    hci: usize,

    /// Scan window in seconds, 0 to scan until interrupted
    #[arg(short = 't', long, default_value_t = 3)]
    scan_timeout: u64,

    /// Passive scan
    #[arg(long)]
    passive: bool,

    /// Connection attempts, 0 to skip GATT inspection
    #[arg(short = 's', long, default_value_t = 3)]
    conn_svc: u32,

    /// Characteristic enumeration attempts per service
    #[arg(short = 'c', long, default_value_t = 3)]
    get_chara: u32,

    /// Read attempts per characteristic
    #[arg(short = 'r', long, default_value_t = 3)]
    read_chara: u32,

    /// Debug logging
    #[arg(short = 'd', long)]
    debug: bool,
}

struct Printer;

impl Printer {
    fn print_report(device: &DiscoveredDevice, result: &Result<InspectionReport>) {
        match result {
            Ok(report) if report.is_empty() => {}
            Ok(report) => {
                println!("{}", device.summary());
                for line in report.lines() {
                    println!("  {}", line);
                }
            }
            Err(e) => println!("{}: {}", device.address, e),
        }
    }
}

impl DiscoveryHandler for Printer {
    fn on_discovery(&mut self, discovery: &Discovery) {
        println!("{} {}", discovery.class.marker(), discovery.device.summary());
        for line in discovery.device.advertisement_lines() {
            println!("    {}", line);
        }
        if let Some(result) = &discovery.inspection {
            Self::print_report(&discovery.device, result);
        }
    }

    fn on_inspection(&mut self, device: &DiscoveredDevice, result: &Result<InspectionReport>) {
        Self::print_report(device, result);
    }
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
    let config = ScanConfig::from_timeout_secs(args.scan_timeout)
        .with_filter(DeviceFilter::new(&args.filter))
        .with_passive(args.passive);
    let inspector = GattInspector::new(InspectionBudgets::with_attempts(
        args.conn_svc,
        args.get_chara,
        args.read_chara,
    ));

    let mut session = ScanSession::new(adapter, config, inspector);
    let stop = session.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.stop();
        }
    });

    let outcome = session.run(&mut Printer).await?;
    println!(
        "{} events, {} devices",
        outcome.events,
        outcome.devices.len()
    );
    Ok(())
}
