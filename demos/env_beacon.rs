//! Print averaged readings from environmental beacons.
//!
//! Run with: cargo run --example env_beacon -- --ave-n 5 [ADDRESS]...

use ble_scan_kit::{
    BeaconApp, BeaconConfig, BtleplugAdapter, DeviceFilter, ReadingSink, Result, SensorReading,
};
use clap::Parser;
use std::sync::Arc;

/// Listen for battery, temperature and humidity beacons.
#[derive(Parser, Debug)]
#[command(author, about, version)]
struct Args {
    /// Beacon addresses to listen to (all beacons when empty)
    addresses: Vec<String>,

    /// Number of readings to average
    #[arg(short = 'a', long, default_value_t = 1)]
    ave_n: usize,

    /// Bluetooth adapter index
    #[arg(short = 'i', long, default_value_t = 0)]
    hci: usize,

    /// Debug logging
    #[arg(short = 'd', long)]
    debug: bool,
}

struct ConsoleSink {
    verbose: bool,
}

impl ReadingSink for ConsoleSink {
    fn on_reading(&mut self, battery: f64, temperature: f64, humidity: f64) {
        println!("{}", SensorReading::new(battery, temperature, humidity));
    }

    fn on_device_discovered(&mut self, summary: &str) {
        if self.verbose {
            println!("{}", summary);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.debug { "ble_scan_kit=debug" } else { "ble_scan_kit=warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(level.parse().unwrap()),
        )
        .init();

    let adapter = Arc::new(BtleplugAdapter::with_index(args.hci).await?);
    let config = BeaconConfig::default()
        .with_filter(DeviceFilter::new(&args.addresses))
        .with_history_size(args.ave_n);

    let mut app = BeaconApp::new(adapter, config);
    let stop = app.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.stop();
        }
    });

    app.run(&mut ConsoleSink { verbose: args.debug }).await?;
    Ok(())
}
