/*!
 * The assembled test bench.
 *
 * [`TestBench`] builds one link per configured instrument and wires the
 * drivers into the safety monitor, watchdog, control service, sensor
 * poller and test automation. Startup is ordered: the safety monitor must
 * come up or nothing else starts; every other instrument is optional and
 * only reduces what the bench can do.
 */
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use futures::future::join_all;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use pumpbench_core::config::{devices, Config};
use pumpbench_core::event::DynBus;
use pumpbench_core::logging::component_span;
use pumpbench_core::record::RecordSink;
use pumpbench_core::topics::{SYSTEM_HEALTH, SYSTEM_STATUS};
use pumpbench_core::utils::spawn_and_log;
use pumpbench_devices::{
    BridgeSet, DeviceStatus, Driver, FlowMeter, Link, MeterKind, PressureKind, PressureSensor, RelayIo,
    SinglePhasePowerMeter, ThreePhasePowerMeter,
};

use crate::automation::{AutomationHandle, TestAutomation};
use crate::control::ControlService;
use crate::error::Result;
use crate::safety::{SafetyGate, SafetyMonitor};
use crate::sensors::{SensorPoller, Sensors};
use crate::watchdog::Watchdog;

const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

const DEVICE_NAMES: [&str; 8] = [
    devices::FLOW_METER,
    devices::PRESSURE_POSITIVE,
    devices::PRESSURE_VACUUM,
    devices::DC_METER,
    devices::AC110V_METER,
    devices::AC220V_METER,
    devices::AC220V_3P_METER,
    devices::RELAY_IO,
];

/// Every service of the bench, owned in one place
pub struct TestBench {
    config: Config,
    bus: DynBus,
    links: HashMap<String, Arc<Link>>,
    relay: RelayIo,
    safety: Arc<SafetyMonitor>,
    control: Arc<ControlService>,
    poller: Arc<SensorPoller>,
    automation: Option<TestAutomation>,
    handle: AutomationHandle,
    bridges: BridgeSet,
    token: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl std::fmt::Debug for TestBench {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestBench")
            .field("links", &self.links.keys().collect::<Vec<_>>())
            .field("tasks", &self.tasks.len())
            .finish_non_exhaustive()
    }
}

impl TestBench {
    /// Build the bench with a link for every configured instrument
    pub fn from_config(config: Config, bus: DynBus, sink: Arc<dyn RecordSink>) -> Result<Self> {
        let mut links = HashMap::new();
        for name in DEVICE_NAMES {
            let link_config = config.device(name)?;
            links.insert(name.to_string(), Arc::new(Link::from_config(name, link_config)));
        }
        Self::with_links(config, links, bus, sink)
    }

    /// Build the bench over existing links, keyed by device name
    pub fn with_links(
        config: Config,
        links: HashMap<String, Arc<Link>>,
        bus: DynBus,
        sink: Arc<dyn RecordSink>,
    ) -> Result<Self> {
        let link = |name: &str| -> Result<Arc<Link>> {
            links
                .get(name)
                .cloned()
                .ok_or_else(|| pumpbench_core::error::Error::config(format!("No link for device '{}'", name)).into())
        };

        let relay = RelayIo::new(link(devices::RELAY_IO)?);
        let sensors = Sensors {
            flow: FlowMeter::new(link(devices::FLOW_METER)?),
            pressure_positive: PressureSensor::new(link(devices::PRESSURE_POSITIVE)?, PressureKind::Positive),
            pressure_vacuum: PressureSensor::new(link(devices::PRESSURE_VACUUM)?, PressureKind::Vacuum),
            dc: SinglePhasePowerMeter::new(link(devices::DC_METER)?, MeterKind::Dc),
            ac110: SinglePhasePowerMeter::new(link(devices::AC110V_METER)?, MeterKind::Ac110),
            ac220: SinglePhasePowerMeter::new(link(devices::AC220V_METER)?, MeterKind::Ac220),
            ac220_3p: ThreePhasePowerMeter::new(link(devices::AC220V_3P_METER)?),
        };

        let safety = Arc::new(SafetyMonitor::new(relay.clone(), config.safety.clone(), bus.clone()));
        let gate: Arc<dyn SafetyGate> = safety.clone();
        let control = Arc::new(ControlService::new(relay.clone(), gate.clone(), bus.clone()));
        let poller = Arc::new(SensorPoller::new(sensors, bus.clone(), sink.clone(), config.sensors.clone()));
        let automation = TestAutomation::new(
            bus.clone(),
            sink,
            gate,
            control.clone(),
            Some(poller.clone()),
            config.automation.clone(),
        );
        let handle = automation.handle();
        let bridges = BridgeSet::new(&config.bridges);

        Ok(Self {
            config,
            bus,
            links,
            relay,
            safety,
            control,
            poller,
            automation: Some(automation),
            handle,
            bridges,
            token: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    /// Handle for commanding tests
    pub fn automation(&self) -> AutomationHandle {
        self.handle.clone()
    }

    /// The safety monitor
    pub fn safety(&self) -> &Arc<SafetyMonitor> {
        &self.safety
    }

    /// The control service
    pub fn control(&self) -> &Arc<ControlService> {
        &self.control
    }

    /// The sensor poller
    pub fn poller(&self) -> &Arc<SensorPoller> {
        &self.poller
    }

    /// Status of every instrument link
    pub fn device_status(&self) -> Vec<(String, DeviceStatus)> {
        let mut status: Vec<_> = self
            .links
            .iter()
            .map(|(name, link)| (name.clone(), link.status()))
            .collect();
        status.sort_by(|a, b| a.0.cmp(&b.0));
        status
    }

    /// Names of the instruments whose link is connected
    pub fn connected_devices(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .links
            .iter()
            .filter(|(_, link)| link.is_connected())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Bring the bench up
    ///
    /// Fails only when the safety monitor cannot start.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        if self.automation.is_none() {
            bail!("Test bench already started");
        }
        self.safety
            .start()
            .await
            .context("Safety monitor failed to start, refusing to run")?;
        let Some(automation) = self.automation.take() else {
            bail!("Test bench already started");
        };

        let connected = self.poller.connect_all().await;
        if !self.control.is_ready() {
            if let Err(e) = self.relay.link().connect().await {
                warn!("Control relay unavailable: {}", e);
            }
        }

        let watchdog = Watchdog::new(
            self.safety.heartbeat(),
            self.relay.clone(),
            self.bus.clone(),
            self.config.watchdog.clone(),
        );
        let token = self.token.clone();
        self.tasks.push((
            "watchdog",
            tokio::spawn(watchdog.run(token.clone()).instrument(component_span("watchdog", None))),
        ));
        self.tasks.push((
            "sensors",
            tokio::spawn(self.poller.clone().run(token.clone()).instrument(component_span("sensors", None))),
        ));
        self.tasks.push((
            "control",
            spawn_and_log(
                "control",
                self.control.clone().run(token.clone()).instrument(component_span("control", None)),
            ),
        ));
        self.tasks.push((
            "automation",
            spawn_and_log(
                "automation",
                automation.run(token).instrument(component_span("automation", None)),
            ),
        ));

        let bridges = self.bridges.start().await;
        info!(sensors = connected, bridges, "Test bench started");
        self.publish_status("running");
        self.publish_health();
        Ok(())
    }

    /// Bring the bench down
    pub async fn shutdown(&mut self) {
        info!("Shutting down test bench");
        self.token.cancel();
        self.safety.stop().await;

        let joins = self
            .tasks
            .drain(..)
            .map(|(name, task)| async move { (name, tokio::time::timeout(TASK_JOIN_TIMEOUT, task).await) });
        for (name, result) in join_all(joins).await {
            match result {
                Ok(Ok(())) => debug!(task = name, "Task finished"),
                Ok(Err(e)) => warn!(task = name, "Task ended abnormally: {}", e),
                Err(_) => warn!(task = name, "Task did not stop in time"),
            }
        }

        self.bridges.stop().await;
        for link in self.links.values() {
            link.disconnect().await;
        }
        self.publish_status("stopped");
        info!("Test bench stopped");
    }

    fn publish_status(&self, status: &str) {
        if let Err(e) = self.bus.publish(SYSTEM_STATUS, json!({"status": status})) {
            debug!("Failed to publish system status: {}", e);
        }
    }

    fn publish_health(&self) {
        let devices: serde_json::Map<_, _> = self
            .device_status()
            .into_iter()
            .map(|(name, status)| (name, json!(status)))
            .collect();
        let health = json!({
            "devices": devices,
            "connected": self.connected_devices(),
            "missing_sensors": self.poller.missing_devices(),
            "safety": self.safety.state(),
        });
        if let Err(e) = self.bus.publish(SYSTEM_HEALTH, health) {
            debug!("Failed to publish system health: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pumpbench_core::config::{AutomationConfig, SafetyConfig, SensorsConfig};
    use pumpbench_core::event::{MessageBus, SharedEventBus};
    use pumpbench_core::record::MemoryRecordSink;
    use pumpbench_core::topics::SENSOR_FLOW;
    use pumpbench_devices::mock::{MockConnector, MockDevice};
    use tokio_test::{assert_err, assert_ok};

    use crate::types::{TestConfig, TestState};

    struct Rig {
        bench: TestBench,
        mocks: HashMap<String, Arc<MockDevice>>,
        connectors: HashMap<String, Arc<MockConnector>>,
        sink: Arc<MemoryRecordSink>,
        bus: SharedEventBus,
    }

    fn config() -> Config {
        Config {
            safety: SafetyConfig {
                period_ms: 10,
                queue_capacity: 100,
                join_timeout_ms: 500,
            },
            sensors: SensorsConfig {
                poll_ms: 50,
                min_publish_interval_ms: 10,
            },
            automation: AutomationConfig {
                init_delay_ms: 10,
                ready_delay_ms: 10,
                completed_delay_ms: 10,
                stopped_delay_ms: 10,
                progress_interval_s: 10,
                default_duration_s: 1,
            },
            bridges: Vec::new(),
            ..Config::default()
        }
    }

    fn rig() -> Rig {
        let mut mocks = HashMap::new();
        let mut connectors = HashMap::new();
        let mut links = HashMap::new();
        for name in DEVICE_NAMES {
            let device = MockDevice::new();
            let connector = MockConnector::new(device.clone());
            let link = Link::tcp_with_connector(name, 1, Duration::from_secs(1), connector.clone());
            links.insert(name.to_string(), Arc::new(link));
            mocks.insert(name.to_string(), device);
            connectors.insert(name.to_string(), connector);
        }
        // cover closed, no emergency stop
        mocks[devices::RELAY_IO].set_discrete(0, &[false, true]);

        let bus = SharedEventBus::new();
        let sink = Arc::new(MemoryRecordSink::new());
        let bench = TestBench::with_links(config(), links, Arc::new(bus.clone()), sink.clone()).unwrap();
        Rig {
            bench,
            mocks,
            connectors,
            sink,
            bus,
        }
    }

    #[test]
    fn test_from_default_config_builds_every_link() {
        let bench = TestBench::from_config(
            Config::default(),
            Arc::new(SharedEventBus::new()),
            Arc::new(MemoryRecordSink::new()),
        )
        .unwrap();
        assert_eq!(bench.device_status().len(), DEVICE_NAMES.len());
        assert!(bench.connected_devices().is_empty());
    }

    #[test]
    fn test_missing_device_config_is_rejected() {
        let mut config = Config::default();
        config.devices.remove(devices::RELAY_IO);
        let result = TestBench::from_config(config, Arc::new(SharedEventBus::new()), Arc::new(MemoryRecordSink::new()));
        assert!(result.is_err());
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
    async fn test_full_run_records_and_shuts_down() {
        let mut rig = rig();
        rig.mocks[devices::FLOW_METER].set_holding(0x0000, &[500]);
        let mut flow = rig.bus.subscribe(SENSOR_FLOW).unwrap();

        assert_ok!(rig.bench.start().await);
        let reading = tokio::time::timeout(Duration::from_secs(2), flow.recv()).await.unwrap().unwrap();
        assert_eq!(reading.payload["instantaneous_flow"], 50.0);

        // let the safety thread take its first sample
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rig.bench.safety().state().cover_closed);

        let handle = rig.bench.automation();
        let config = TestConfig {
            test_id: Some("BENCH1".to_string()),
            duration: Some(1),
            auto_start: true,
            ..TestConfig::default()
        };
        handle.start_test(config).await.unwrap();
        let mut state = handle.subscribe();
        tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == TestState::Completed))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(rig.sink.session_ids(), vec!["BENCH1".to_string()]);
        assert!(!rig.sink.readings("BENCH1").is_empty());

        rig.bench.shutdown().await;
        assert!(!rig.bench.safety().is_running());
        assert!(rig.bench.connected_devices().is_empty());
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
    async fn test_unreachable_relay_is_fatal() {
        let mut rig = rig();
        rig.connectors[devices::RELAY_IO].refuse_connections(true);

        assert_err!(rig.bench.start().await);
        assert!(!rig.bench.safety().is_running());
    }

    #[test_log::test(tokio::test(flavor = "multi_thread", worker_threads = 2))]
    async fn test_missing_sensor_degrades() {
        let mut rig = rig();
        rig.connectors[devices::PRESSURE_VACUUM].refuse_connections(true);

        assert_ok!(rig.bench.start().await);
        assert_eq!(rig.bench.poller().missing_devices(), vec![devices::PRESSURE_VACUUM]);
        assert!(rig.bench.control().is_ready());
        assert_err!(rig.bench.start().await);

        rig.bench.shutdown().await;
        assert!(!rig.bench.poller().sensors().flow.is_connected());
    }
}
