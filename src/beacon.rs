//! Environmental beacon readings.
//!
//! [`BeaconApp`] runs a continuous scan, decodes the service data of beacons
//! that advertise the configured service, and hands averaged readings to a
//! [`ReadingSink`].

use std::sync::Arc;
use tracing::{debug, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::ble::adapter::BleAdapter;
use crate::ble::uuids::ENV_BEACON_SERVICE_UUID;
use crate::data::{ReadingHistory, SensorReading};
use crate::error::Result;
use crate::inspector::GattInspector;
use crate::registry::DeviceFilter;
use crate::session::{Discovery, DiscoveryHandler, ScanConfig, ScanOutcome, ScanSession, StopHandle};

/// Beacon scan configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BeaconConfig {
    /// Allow-list of beacons.
    pub filter: DeviceFilter,
    /// Service the beacons advertise.
    pub service_uuid: Uuid,
    /// Number of readings averaged per metric.
    pub history_size: usize,
    /// Passive scanning.
    pub passive: bool,
}

impl Default for BeaconConfig {
    fn default() -> Self {
        Self {
            filter: DeviceFilter::allow_all(),
            service_uuid: ENV_BEACON_SERVICE_UUID,
            history_size: 1,
            passive: false,
        }
    }
}

impl BeaconConfig {
    /// Set the allow-list.
    pub fn with_filter(mut self, filter: DeviceFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Set the averaging window.
    pub fn with_history_size(mut self, history_size: usize) -> Self {
        self.history_size = history_size;
        self
    }
}

/// Receives averaged beacon readings.
pub trait ReadingSink {
    /// Called with the trailing means after every decoded reading.
    ///
    /// Values are unrounded; round them when presenting, as
    /// [`SensorReading`]'s `Display` does.
    fn on_reading(&mut self, battery: f64, temperature: f64, humidity: f64);

    /// Called with the summary line of every accepted discovery.
    fn on_device_discovered(&mut self, _summary: &str) {}
}

impl<F> ReadingSink for F
where
    F: FnMut(f64, f64, f64),
{
    fn on_reading(&mut self, battery: f64, temperature: f64, humidity: f64) {
        self(battery, temperature, humidity)
    }
}

/// Continuous beacon scanner.
pub struct BeaconApp {
    session: ScanSession,
    service_uuid: Uuid,
    history: ReadingHistory,
    span: Span,
}

impl BeaconApp {
    /// Create an app logging under a `beacon_app` span.
    pub fn new(adapter: Arc<dyn BleAdapter>, config: BeaconConfig) -> Self {
        Self::with_span(adapter, config, info_span!("beacon_app"))
    }

    /// Create an app logging under `span`.
    pub fn with_span(adapter: Arc<dyn BleAdapter>, config: BeaconConfig, span: Span) -> Self {
        let scan = ScanConfig::continuous()
            .with_filter(config.filter)
            .with_passive(config.passive);
        let session = ScanSession::with_span(
            adapter,
            scan,
            GattInspector::disabled(),
            info_span!(parent: &span, "scan_session"),
        );
        Self {
            session,
            service_uuid: config.service_uuid,
            history: ReadingHistory::new(config.history_size),
            span,
        }
    }

    /// Handle that stops [`BeaconApp::run`].
    pub fn stop_handle(&self) -> StopHandle {
        self.session.stop_handle()
    }

    /// Readings averaged so far.
    pub fn history(&self) -> &ReadingHistory {
        &self.history
    }

    /// Scan until stopped or the adapter closes, feeding `sink`.
    ///
    /// # Errors
    ///
    /// Returns an error only if scanning cannot start.
    pub async fn run<S>(&mut self, sink: &mut S) -> Result<ScanOutcome>
    where
        S: ReadingSink + ?Sized,
    {
        let Self {
            session,
            service_uuid,
            history,
            span,
        } = self;
        let service_uuid = *service_uuid;
        let mut handler = BeaconHandler {
            sink,
            history,
            service_uuid,
        };

        async move {
            info!("Listening for beacons advertising {}", service_uuid);
            session.run(&mut handler).await
        }
        .instrument(span.clone())
        .await
    }
}

struct BeaconHandler<'a, S: ?Sized> {
    sink: &'a mut S,
    history: &'a mut ReadingHistory,
    service_uuid: Uuid,
}

impl<S> DiscoveryHandler for BeaconHandler<'_, S>
where
    S: ReadingSink + ?Sized,
{
    fn on_discovery(&mut self, discovery: &Discovery) {
        let device = &discovery.device;
        self.sink.on_device_discovered(&device.summary());

        if !device.advertises_service(&self.service_uuid) {
            return;
        }
        let Some(hex) = device.service_data_hex().filter(|hex| !hex.is_empty()) else {
            return;
        };

        match SensorReading::from_hex(hex) {
            Ok(reading) => {
                let mean = self.history.push(reading);
                debug!("{}: {} (mean {})", device.address, reading, mean);
                self.sink
                    .on_reading(mean.battery, mean.temperature, mean.humidity);
            }
            Err(e) => warn!("Discarding reading from {}: {}", device.address, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::adapter::DiscoveryEvent;
    use crate::ble::advertising::{ScanDataEntry, AD_TYPE_COMPLETE_16B_SERVICES, AD_TYPE_SERVICE_16B_DATA};
    use crate::testing::ScriptedAdapter;

    fn beacon(address: &str, service_data: &str) -> DiscoveryEvent {
        DiscoveryEvent::new_device(
            address,
            vec![
                ScanDataEntry::new(
                    AD_TYPE_COMPLETE_16B_SERVICES,
                    ENV_BEACON_SERVICE_UUID.to_string(),
                ),
                ScanDataEntry::new(AD_TYPE_SERVICE_16B_DATA, service_data),
            ],
        )
    }

    #[derive(Default)]
    struct Recorder {
        readings: Vec<(f64, f64, f64)>,
        summaries: Vec<String>,
    }

    impl ReadingSink for Recorder {
        fn on_reading(&mut self, battery: f64, temperature: f64, humidity: f64) {
            self.readings.push((battery, temperature, humidity));
        }

        fn on_device_discovered(&mut self, summary: &str) {
            self.summaries.push(summary.to_string());
        }
    }

    #[tokio::test]
    async fn test_readings_are_averaged() {
        let mut first = beacon("aa:bb:cc:dd:ee:01", "e1ff00006419000000");
        first.rssi = -50;
        let second = DiscoveryEvent {
            is_new_device: false,
            ..beacon("aa:bb:cc:dd:ee:01", "e1ff0000321b000000")
        };
        let adapter = Arc::new(ScriptedAdapter::new(vec![first, second]));
        let mut app = BeaconApp::new(adapter, BeaconConfig::default().with_history_size(2));

        let mut recorder = Recorder::default();
        app.run(&mut recorder).await.unwrap();

        assert_eq!(
            recorder.readings,
            vec![(100.0, 25.0, 0.0), (75.0, 26.0, 0.0)]
        );
        assert_eq!(recorder.summaries.len(), 2);
        assert_eq!(app.history().len(), 2);
    }

    #[tokio::test]
    async fn test_decode_error_does_not_stop_scan() {
        let adapter = Arc::new(ScriptedAdapter::new(vec![
            beacon("aa:bb:cc:dd:ee:01", "e1ff"),
            beacon("aa:bb:cc:dd:ee:02", "zz"),
            beacon("aa:bb:cc:dd:ee:03", "e1ff00006419800000"),
        ]));
        let mut app = BeaconApp::new(adapter, BeaconConfig::default());

        let mut readings = Vec::new();
        let outcome = app
            .run(&mut |b: f64, t: f64, h: f64| readings.push((b, t, h)))
            .await
            .unwrap();

        assert_eq!(outcome.events, 3);
        assert_eq!(readings, vec![(100.0, 25.5, 0.0)]);
    }

    #[tokio::test]
    async fn test_sink_receives_unrounded_means() {
        let adapter = Arc::new(ScriptedAdapter::new(vec![beacon(
            "aa:bb:cc:dd:ee:01",
            "e1ff0000641996321a",
        )]));
        let mut app = BeaconApp::new(adapter, BeaconConfig::default());

        let mut readings = Vec::new();
        app.run(&mut |b: f64, t: f64, h: f64| readings.push((b, t, h)))
            .await
            .unwrap();

        assert_eq!(readings, vec![(100.0, 25.5859375, 50.1015625)]);
        assert_eq!(
            SensorReading::new(100.0, 25.5859375, 50.1015625).to_string(),
            "battery: 100 % temperature: 25.6 'C humidity: 50.1 %"
        );
    }

    #[tokio::test]
    async fn test_other_services_are_ignored() {
        let plain = DiscoveryEvent::new_device(
            "aa:bb:cc:dd:ee:01",
            vec![ScanDataEntry::new(AD_TYPE_SERVICE_16B_DATA, "e1ff00006419000000")],
        );
        let adapter = Arc::new(ScriptedAdapter::new(vec![plain]));
        let mut app = BeaconApp::new(adapter.clone(), BeaconConfig::default());

        let mut recorder = Recorder::default();
        app.run(&mut recorder).await.unwrap();

        assert!(recorder.readings.is_empty());
        assert_eq!(recorder.summaries.len(), 1);
        assert_eq!(adapter.connect_calls(), 0);
        assert!(adapter.scans()[0].duration.is_none());
    }
}
