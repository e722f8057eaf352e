//! Monitoring context.
//!
//! A [`Monitor`] owns the reading store, the per-patient device addresses and
//! the single active transport. Activating a patient stops whatever transport
//! was running before starting a new one.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::buffer::ReadingStore;
use crate::config::{ClientConfig, EndpointConfig, EndpointHandle};
use crate::reading::{ConnectionState, Reading};
use crate::subscribe::{Handlers, Subscription};
use crate::transport::{build_transport, TransportError, TransportKind, VitalsTransport};

struct Active {
    patient: String,
    transport: Arc<dyn VitalsTransport>,
    subscription: Subscription,
    handlers: Handlers,
    /// Watching the monitor-wide endpoint rather than a patient's own.
    shared_endpoint: bool,
}

impl Active {
    fn stop(self) -> String {
        self.transport.disconnect();
        self.subscription.unsubscribe();
        tracing::info!("Stopped {} monitoring of {}", self.transport.kind(), self.patient);
        self.patient
    }
}

/// Owns everything one monitoring session needs.
pub struct Monitor {
    config: ClientConfig,
    endpoint: EndpointHandle,
    store: ReadingStore,
    devices: RwLock<HashMap<String, EndpointHandle>>,
    active: Mutex<Option<Active>>,
}

impl Monitor {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            endpoint: EndpointHandle::new(config.endpoint.clone()),
            store: ReadingStore::new(config.buffer_capacity),
            devices: RwLock::new(HashMap::new()),
            active: Mutex::new(None),
            config,
        }
    }

    pub fn store(&self) -> &ReadingStore {
        &self.store
    }

    /// Endpoint used by patients without a device address of their own.
    pub fn endpoint(&self) -> &EndpointHandle {
        &self.endpoint
    }

    /// Assign a device address to a patient.
    ///
    /// If that patient is being monitored, the running transport follows the
    /// new address. A transport that was started on the shared endpoint is
    /// rebuilt against the patient's own one.
    pub fn set_device_address(&self, patient: &str, address: &str) -> Result<(), TransportError> {
        let config = EndpointConfig::parse(address)?;
        let created = {
            let mut devices = self.devices.write();
            match devices.get(patient) {
                Some(handle) => {
                    handle.set(config);
                    false
                }
                None => {
                    devices.insert(patient.to_string(), EndpointHandle::new(config));
                    true
                }
            }
        };
        tracing::info!("Device address for {} set to {}", patient, address);

        if created {
            let restart = self
                .active
                .lock()
                .as_ref()
                .filter(|a| a.patient == patient && a.shared_endpoint)
                .map(|a| (a.transport.kind(), a.handlers.clone()));
            if let Some((kind, handlers)) = restart {
                self.activate(patient, kind, handlers)?;
            }
        }
        Ok(())
    }

    /// The patient's device address, or the shared default.
    pub fn device_address(&self, patient: &str) -> EndpointConfig {
        self.endpoint_for(patient).0.current()
    }

    /// The patient's endpoint, and whether it is the shared one.
    fn endpoint_for(&self, patient: &str) -> (EndpointHandle, bool) {
        match self.devices.read().get(patient) {
            Some(handle) => (handle.clone(), false),
            None => (self.endpoint.clone(), true),
        }
    }

    /// Start monitoring `patient` over `kind`, replacing any active session.
    pub fn activate(
        &self,
        patient: &str,
        kind: TransportKind,
        handlers: Handlers,
    ) -> Result<(), TransportError> {
        self.deactivate();

        let cfg = ClientConfig {
            transport: kind,
            source: patient.to_string(),
            ..self.config.clone()
        };
        let (endpoint, shared_endpoint) = self.endpoint_for(patient);
        tracing::info!("Starting {} monitoring of {} at {}", kind, patient, endpoint.current());

        let transport = build_transport(&cfg, endpoint, self.store.clone())?;
        let subscription = transport.set_handlers(handlers.clone());
        transport.connect();

        let previous = self.active.lock().replace(Active {
            patient: patient.to_string(),
            transport: Arc::from(transport),
            subscription,
            handlers,
            shared_endpoint,
        });
        // Lost a race with a concurrent activate.
        if let Some(previous) = previous {
            previous.stop();
        }
        Ok(())
    }

    /// Stop the active transport. Returns the patient that was monitored.
    pub fn deactivate(&self) -> Option<String> {
        let active = self.active.lock().take();
        active.map(Active::stop)
    }

    pub fn current_patient(&self) -> Option<String> {
        self.active.lock().as_ref().map(|a| a.patient.clone())
    }

    pub fn active_kind(&self) -> Option<TransportKind> {
        self.active.lock().as_ref().map(|a| a.transport.kind())
    }

    pub fn state(&self) -> ConnectionState {
        self.active
            .lock()
            .as_ref()
            .map_or(ConnectionState::Disconnected, |a| a.transport.state())
    }

    pub fn is_device_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Restart the active transport against its current endpoint.
    pub fn reconnect(&self) {
        let transport = self.active.lock().as_ref().map(|a| a.transport.clone());
        if let Some(transport) = transport {
            transport.reconnect();
        }
    }

    pub fn readings(&self, patient: &str) -> Vec<Reading> {
        self.store.snapshot(patient)
    }

    pub fn latest(&self, patient: &str) -> Option<Reading> {
        self.store.latest(patient)
    }

    /// Drop a patient's buffered readings. Returns how many were dropped.
    pub fn clear(&self, patient: &str) -> usize {
        self.store.clear(patient)
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.deactivate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PullSettings;
    use crate::simulator::{DeviceSimulator, Fallback, SimulatorSettings};
    use crate::testing::{recording_handlers, wait_for, wait_until, Event};
    use std::time::Duration;

    fn fast_config(address: &str) -> ClientConfig {
        ClientConfig {
            endpoint: EndpointConfig::parse(address).unwrap(),
            pull: PullSettings {
                poll_interval: Duration::from_millis(10),
                request_timeout: Duration::from_millis(500),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_device_addresses() {
        let monitor = Monitor::new(fast_config("shared-device:81"));
        assert_eq!(monitor.device_address("pat_001").host, "shared-device");

        monitor.set_device_address("pat_001", "192.168.31.111").unwrap();
        assert_eq!(monitor.device_address("pat_001").host, "192.168.31.111");
        assert_eq!(monitor.device_address("pat_002").host, "shared-device");

        assert!(monitor.set_device_address("pat_001", "gopher://x").is_err());
        assert_eq!(monitor.device_address("pat_001").host, "192.168.31.111");
    }

    #[tokio::test]
    async fn test_activate_fills_patient_buffer() {
        let sim = DeviceSimulator::new(SimulatorSettings::default())
            .spawn_local()
            .await
            .unwrap();
        let monitor = Monitor::new(fast_config(&sim.address()));

        monitor.activate("pat_001", TransportKind::Pull, Handlers::new()).unwrap();
        assert_eq!(monitor.current_patient().as_deref(), Some("pat_001"));
        assert_eq!(monitor.active_kind(), Some(TransportKind::Pull));

        assert!(
            wait_until(|| monitor.readings("pat_001").len() >= 20, Duration::from_secs(5)).await
        );
        assert!(monitor.is_device_connected());
        assert!(monitor.latest("pat_001").is_some());

        assert_eq!(monitor.deactivate().as_deref(), Some("pat_001"));
        assert_eq!(monitor.deactivate(), None);
        assert!(!monitor.is_device_connected());

        let buffered = monitor.readings("pat_001").len();
        assert_eq!(monitor.clear("pat_001"), buffered);
        assert!(monitor.readings("pat_001").is_empty());
    }

    #[tokio::test]
    async fn test_switching_patients_stops_previous_transport() {
        let first = DeviceSimulator::new(SimulatorSettings::default())
            .spawn_local()
            .await
            .unwrap();
        let second = DeviceSimulator::new(SimulatorSettings::default())
            .with_fallback(Fallback::Synthetic)
            .spawn_local()
            .await
            .unwrap();

        let monitor = Monitor::new(fast_config(&first.address()));
        monitor.set_device_address("pat_002", &second.address()).unwrap();

        monitor.activate("pat_001", TransportKind::Pull, Handlers::new()).unwrap();
        assert!(
            wait_until(|| !monitor.readings("pat_001").is_empty(), Duration::from_secs(5)).await
        );

        monitor.activate("pat_002", TransportKind::Pull, Handlers::new()).unwrap();
        assert_eq!(monitor.current_patient().as_deref(), Some("pat_002"));
        assert!(
            wait_until(|| !monitor.readings("pat_002").is_empty(), Duration::from_secs(5)).await
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        let settled = first.vitals_requests();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(first.vitals_requests(), settled);

        // Patient 1's history survives the switch.
        assert!(!monitor.readings("pat_001").is_empty());
        assert_eq!(monitor.store().sources(), vec!["pat_001", "pat_002"]);
    }

    #[tokio::test]
    async fn test_address_change_moves_active_transport() {
        let first = DeviceSimulator::new(SimulatorSettings::default())
            .spawn_local()
            .await
            .unwrap();
        let second = DeviceSimulator::new(SimulatorSettings::default())
            .spawn_local()
            .await
            .unwrap();

        let monitor = Monitor::new(fast_config("unused:81"));
        monitor.set_device_address("pat_001", &first.address()).unwrap();
        monitor.activate("pat_001", TransportKind::Pull, Handlers::new()).unwrap();
        assert!(wait_until(|| first.vitals_requests() > 0, Duration::from_secs(5)).await);

        monitor.set_device_address("pat_001", &second.address()).unwrap();
        assert!(wait_until(|| second.vitals_requests() > 0, Duration::from_secs(5)).await);
        monitor.deactivate();
    }

    #[tokio::test]
    async fn test_address_set_after_activate_moves_transport() {
        let shared = DeviceSimulator::new(SimulatorSettings::default())
            .spawn_local()
            .await
            .unwrap();
        let own = DeviceSimulator::new(SimulatorSettings::default())
            .spawn_local()
            .await
            .unwrap();

        let monitor = Monitor::new(fast_config(&shared.address()));
        monitor.activate("pat_001", TransportKind::Pull, Handlers::new()).unwrap();
        assert!(wait_until(|| shared.vitals_requests() > 0, Duration::from_secs(5)).await);

        monitor.set_device_address("pat_001", &own.address()).unwrap();
        assert!(wait_until(|| own.vitals_requests() > 0, Duration::from_secs(5)).await);
        assert_eq!(monitor.current_patient().as_deref(), Some("pat_001"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let settled = shared.vitals_requests();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(shared.vitals_requests(), settled);
        monitor.deactivate();
    }

    #[tokio::test]
    async fn test_deactivate_fires_disconnect() {
        let sim = DeviceSimulator::new(SimulatorSettings::default())
            .spawn_local()
            .await
            .unwrap();
        let monitor = Monitor::new(fast_config(&sim.address()));
        let (handlers, mut events) = recording_handlers();
        monitor.activate("pat_001", TransportKind::Pull, handlers).unwrap();
        loop {
            match wait_for(&mut events, Duration::from_secs(5)).await {
                Some(Event::Connect) => break,
                Some(_) => continue,
                None => panic!("no connect event"),
            }
        }

        monitor.deactivate();
        let mut rest = Vec::new();
        while let Ok(event) = events.try_recv() {
            rest.push(event);
        }
        assert!(matches!(rest.last(), Some(Event::Disconnect)));
        assert_eq!(rest.iter().filter(|e| matches!(e, Event::Disconnect)).count(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(events.try_recv().is_err());
    }
}
