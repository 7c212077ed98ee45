//! Scan sessions.
//!
//! A [`ScanSession`] drives one scan window through `Idle -> Scanning ->
//! Draining -> Idle`. Every discovery event is classified by the
//! [`DeviceRegistry`] and fully handled before the next one is polled.
//!
//! In continuous mode (`duration: None`) accepted devices are inspected as
//! soon as they are seen. In fixed-duration mode inspection waits until the
//! window closes and then walks the registry in discovery order.

use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, info_span, trace, warn, Instrument, Span};

use crate::ble::adapter::{BleAdapter, ScanOptions};
use crate::error::Result;
use crate::inspector::{GattInspector, InspectionReport};
use crate::registry::{DeviceFilter, DeviceRegistry, DiscoveredDevice, DiscoveryClass};

/// Scan window configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanConfig {
    /// Length of the scan window. `None` scans until stopped.
    pub duration: Option<Duration>,
    /// Passive scanning.
    pub passive: bool,
    /// Allow-list applied to every event.
    pub filter: DeviceFilter,
}

impl ScanConfig {
    /// A fixed-length scan.
    pub fn fixed(duration: Duration) -> Self {
        Self {
            duration: Some(duration),
            ..Self::default()
        }
    }

    /// A scan that runs until stopped.
    pub fn continuous() -> Self {
        Self::default()
    }

    /// Build from a timeout in seconds, where zero means continuous.
    pub fn from_timeout_secs(secs: u64) -> Self {
        if secs == 0 {
            Self::continuous()
        } else {
            Self::fixed(Duration::from_secs(secs))
        }
    }

    /// Set the allow-list.
    pub fn with_filter(mut self, filter: DeviceFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Set passive scanning.
    pub fn with_passive(mut self, passive: bool) -> Self {
        self.passive = passive;
        self
    }

    /// Check if the scan runs until stopped.
    pub fn is_continuous(&self) -> bool {
        self.duration.is_none()
    }
}

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionState {
    /// Not scanning.
    #[default]
    Idle,
    /// Consuming discovery events.
    Scanning,
    /// Scan window closed, running deferred inspections.
    Draining,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
            Self::Draining => write!(f, "Draining"),
        }
    }
}

/// An accepted discovery, handed to a [`DiscoveryHandler`].
#[derive(Debug)]
pub struct Discovery {
    /// [`DiscoveryClass::New`] or [`DiscoveryClass::UpdatedKnown`].
    pub class: DiscoveryClass,
    /// The device as recorded after this event.
    pub device: DiscoveredDevice,
    /// Inspection result, present only in continuous mode with inspection enabled.
    pub inspection: Option<Result<InspectionReport>>,
}

/// Receives discoveries from a session.
pub trait DiscoveryHandler {
    /// Called for every accepted discovery event.
    fn on_discovery(&mut self, discovery: &Discovery);

    /// Called for each deferred inspection of a fixed-duration session.
    fn on_inspection(&mut self, _device: &DiscoveredDevice, _result: &Result<InspectionReport>) {}
}

impl<F> DiscoveryHandler for F
where
    F: FnMut(&Discovery),
{
    fn on_discovery(&mut self, discovery: &Discovery) {
        self(discovery)
    }
}

/// Requests that a running session stop.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Ask the session to stop after the event it is handling.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    /// Check if a stop has been requested.
    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

/// What a finished session saw.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Discovery events received.
    pub events: usize,
    /// Accepted devices, in discovery order.
    pub devices: Vec<DiscoveredDevice>,
    /// Deferred inspections of a fixed-duration session, by address.
    pub inspections: Vec<(String, Result<InspectionReport>)>,
    /// The session ended through its [`StopHandle`].
    pub stopped: bool,
}

/// One scan window over an adapter.
pub struct ScanSession {
    adapter: Arc<dyn BleAdapter>,
    config: ScanConfig,
    registry: DeviceRegistry,
    inspector: GattInspector,
    state: SessionState,
    stop_tx: Arc<watch::Sender<bool>>,
    span: Span,
}

impl ScanSession {
    /// Create a session logging under a `scan_session` span.
    pub fn new(adapter: Arc<dyn BleAdapter>, config: ScanConfig, inspector: GattInspector) -> Self {
        Self::with_span(adapter, config, inspector, info_span!("scan_session"))
    }

    /// Create a session logging under `span`.
    pub fn with_span(
        adapter: Arc<dyn BleAdapter>,
        config: ScanConfig,
        inspector: GattInspector,
        span: Span,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            adapter,
            registry: DeviceRegistry::new(config.filter.clone()),
            config,
            inspector,
            state: SessionState::Idle,
            stop_tx: Arc::new(stop_tx),
            span,
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The configuration in use.
    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Devices accepted by the current or last run.
    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Handle that stops the session from another task.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
        }
    }

    /// Run one scan window, reporting accepted devices to `handler`.
    ///
    /// The registry is cleared first. A stop requested before the call makes
    /// it return as soon as the scan has started.
    ///
    /// # Errors
    ///
    /// Returns an error only if the adapter cannot start scanning. Decode and
    /// GATT failures are logged and the scan continues.
    pub async fn run<H>(&mut self, handler: &mut H) -> Result<ScanOutcome>
    where
        H: DiscoveryHandler + ?Sized,
    {
        let span = self.span.clone();
        let outcome = self.scan_window(handler).instrument(span).await;
        self.state = SessionState::Idle;
        self.stop_tx.send_replace(false);
        outcome
    }

    async fn scan_window<H>(&mut self, handler: &mut H) -> Result<ScanOutcome>
    where
        H: DiscoveryHandler + ?Sized,
    {
        self.registry.clear();
        let options = ScanOptions {
            duration: self.config.duration,
            passive: self.config.passive,
        };

        let mut events = self.adapter.scan(options).await?;
        self.state = SessionState::Scanning;
        info!("Scanning ({})", describe_window(self.config.duration));

        let mut stop_rx = self.stop_tx.subscribe();
        let mut outcome = ScanOutcome::default();

        loop {
            if *stop_rx.borrow_and_update() {
                outcome.stopped = true;
                break;
            }

            let event = tokio::select! {
                biased;
                _ = stop_rx.changed() => continue,
                event = events.next() => event,
            };
            let Some(event) = event else {
                break;
            };

            outcome.events += 1;
            let class = self.registry.observe(&event);
            if !class.is_accepted() {
                trace!("{} {} ({})", class.marker(), event.address, class);
                continue;
            }

            let Some(device) = self.registry.get(&event.address).cloned() else {
                continue;
            };
            log_device(class, &device);

            let inspection = if self.config.is_continuous() && self.inspector.is_enabled() {
                Some(self.inspect(&device).await)
            } else {
                None
            };

            handler.on_discovery(&Discovery {
                class,
                device,
                inspection,
            });
        }

        if outcome.stopped {
            if let Err(e) = self.adapter.stop_scan().await {
                warn!("Failed to stop scan: {}", e);
            }
        }
        drop(events);

        self.state = SessionState::Draining;
        debug!("Scan window closed after {} events", outcome.events);

        outcome.devices = self.registry.snapshot();
        if !self.config.is_continuous() && self.inspector.is_enabled() {
            for device in &outcome.devices {
                let result = self.inspect(device).await;
                handler.on_inspection(device, &result);
                outcome.inspections.push((device.address.clone(), result));
            }
        }

        info!("{} devices found", outcome.devices.len());
        Ok(outcome)
    }

    async fn inspect(&self, device: &DiscoveredDevice) -> Result<InspectionReport> {
        let result = self.inspector.inspect(self.adapter.as_ref(), device).await;
        if let Err(e) = &result {
            warn!("Inspection of {} failed: {}", device.address, e);
        }
        result
    }
}

fn describe_window(duration: Option<Duration>) -> String {
    match duration {
        Some(d) => format!("{:?}", d),
        None => "until stopped".to_string(),
    }
}

fn log_device(class: DiscoveryClass, device: &DiscoveredDevice) {
    info!("{} {}", class.marker(), device.summary());
    for line in device.advertisement_lines() {
        debug!("    {}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::adapter::{DiscoveryEvent, MockGattConnection};
    use crate::inspector::InspectionBudgets;
    use crate::testing::ScriptedAdapter;
    use pretty_assertions::assert_eq;

    fn adapter(events: Vec<DiscoveryEvent>) -> Arc<ScriptedAdapter> {
        Arc::new(ScriptedAdapter::new(events))
    }

    fn idle_connection() -> MockGattConnection {
        let mut conn = MockGattConnection::new();
        conn.expect_services().returning(|| Ok(vec![]));
        conn.expect_disconnect().times(1).returning(|| Ok(()));
        conn
    }

    #[tokio::test]
    async fn test_fixed_window_defers_inspection() {
        let adapter = Arc::new(
            ScriptedAdapter::new(vec![
                DiscoveryEvent::new_device("aa:bb:cc:dd:ee:01", vec![]),
                DiscoveryEvent::new_device("aa:bb:cc:dd:ee:02", vec![]),
                DiscoveryEvent::updated("aa:bb:cc:dd:ee:01", vec![]),
            ])
            .with_connection(idle_connection())
            .with_connection(idle_connection()),
        );
        let mut session = ScanSession::new(
            adapter.clone(),
            ScanConfig::fixed(Duration::from_secs(5)),
            GattInspector::new(InspectionBudgets::default()),
        );

        let mut seen = Vec::new();
        let mut handler = |d: &Discovery| {
            assert!(d.inspection.is_none());
            seen.push((d.class, d.device.address.clone()));
        };
        let outcome = session.run(&mut handler).await.unwrap();

        assert_eq!(
            seen,
            vec![
                (DiscoveryClass::New, "aa:bb:cc:dd:ee:01".to_string()),
                (DiscoveryClass::New, "aa:bb:cc:dd:ee:02".to_string()),
                (DiscoveryClass::UpdatedKnown, "aa:bb:cc:dd:ee:01".to_string()),
            ]
        );
        assert_eq!(outcome.events, 3);
        assert_eq!(outcome.devices.len(), 2);
        let inspected: Vec<&str> = outcome.inspections.iter().map(|(a, _)| a.as_str()).collect();
        assert_eq!(inspected, vec!["aa:bb:cc:dd:ee:01", "aa:bb:cc:dd:ee:02"]);
        assert!(outcome.inspections.iter().all(|(_, r)| r.is_ok()));
        assert_eq!(adapter.connect_calls(), 2);
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(adapter.scans()[0].duration, Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_continuous_inspects_immediately() {
        let adapter = Arc::new(
            ScriptedAdapter::new(vec![DiscoveryEvent::new_device("aa:bb:cc:dd:ee:01", vec![])])
                .with_connection(idle_connection()),
        );
        let mut session = ScanSession::new(
            adapter.clone(),
            ScanConfig::continuous(),
            GattInspector::new(InspectionBudgets::default()),
        );

        let mut reports = 0;
        let mut handler = |d: &Discovery| {
            if let Some(Ok(report)) = &d.inspection {
                assert!(report.is_empty());
                reports += 1;
            }
        };
        let outcome = session.run(&mut handler).await.unwrap();

        assert_eq!(reports, 1);
        assert!(outcome.inspections.is_empty());
        assert_eq!(adapter.connect_calls(), 1);
    }

    fn non_connectable() -> Vec<DiscoveryEvent> {
        vec![DiscoveryEvent::new_device("aa:bb:cc:dd:ee:01", vec![]).with_connectable(false)]
    }

    #[tokio::test]
    async fn test_non_connectable_never_connects_continuous() {
        let adapter = adapter(non_connectable());
        let mut session = ScanSession::new(
            adapter.clone(),
            ScanConfig::continuous(),
            GattInspector::new(InspectionBudgets::default()),
        );

        let mut seen = 0;
        let outcome = session
            .run(&mut |d: &Discovery| {
                assert!(matches!(&d.inspection, Some(Ok(report)) if report.is_empty()));
                seen += 1;
            })
            .await
            .unwrap();

        assert_eq!(seen, 1);
        assert_eq!(outcome.devices.len(), 1);
        assert_eq!(adapter.connect_calls(), 0);
    }

    #[tokio::test]
    async fn test_non_connectable_never_connects_fixed() {
        let adapter = adapter(non_connectable());
        let mut session = ScanSession::new(
            adapter.clone(),
            ScanConfig::fixed(Duration::from_secs(1)),
            GattInspector::new(InspectionBudgets::default()),
        );

        let outcome = session.run(&mut |_: &Discovery| {}).await.unwrap();

        assert_eq!(outcome.events, 1);
        assert_eq!(outcome.devices.len(), 1);
        assert_eq!(outcome.inspections.len(), 1);
        let (address, report) = &outcome.inspections[0];
        assert_eq!(address, "aa:bb:cc:dd:ee:01");
        assert!(report.as_ref().unwrap().is_empty());
        assert_eq!(adapter.connect_calls(), 0);
    }

    #[tokio::test]
    async fn test_filtered_devices_are_not_reported() {
        let adapter = adapter(vec![
            DiscoveryEvent::new_device("aa:bb:cc:dd:ee:01", vec![]),
            DiscoveryEvent::new_device("aa:bb:cc:dd:ee:02", vec![]),
        ]);
        let config = ScanConfig::fixed(Duration::from_secs(1))
            .with_filter(DeviceFilter::new(["aa:bb:cc:dd:ee:02"]));
        let mut session = ScanSession::new(adapter, config, GattInspector::disabled());

        let mut seen = Vec::new();
        let outcome = session
            .run(&mut |d: &Discovery| seen.push(d.device.address.clone()))
            .await
            .unwrap();

        assert_eq!(seen, vec!["aa:bb:cc:dd:ee:02".to_string()]);
        assert_eq!(outcome.events, 2);
        assert_eq!(outcome.devices.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_handle_ends_continuous_scan() {
        let adapter = Arc::new(
            ScriptedAdapter::new(vec![DiscoveryEvent::new_device("aa:bb:cc:dd:ee:01", vec![])])
                .holding_open(),
        );
        let mut session = ScanSession::new(
            adapter.clone(),
            ScanConfig::continuous(),
            GattInspector::disabled(),
        );
        let stop = session.stop_handle();

        let outcome = session
            .run(&mut |_: &Discovery| stop.stop())
            .await
            .unwrap();

        assert!(outcome.stopped);
        assert_eq!(outcome.events, 1);
        assert_eq!(adapter.stop_calls(), 1);
        assert!(!session.stop_handle().is_stopped());
    }

    #[test]
    fn test_config_from_timeout() {
        assert!(ScanConfig::from_timeout_secs(0).is_continuous());
        assert_eq!(
            ScanConfig::from_timeout_secs(10).duration,
            Some(Duration::from_secs(10))
        );
        assert_eq!(SessionState::default(), SessionState::Idle);
    }
}
