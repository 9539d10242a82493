/*!
 * Sensor polling.
 *
 * The poller samples every measuring instrument once per period, publishes
 * each reading on its topic and, while a test session is open, hands one
 * flat [`Reading`] to the record sink. A failed instrument is skipped for
 * that tick; the others are still sampled.
 */
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use pumpbench_core::config::{devices, SensorsConfig};
use pumpbench_core::event::DynBus;
use pumpbench_core::record::RecordSink;
use pumpbench_core::topics::{
    SENSOR_FLOW, SENSOR_POWER_AC110, SENSOR_POWER_AC220, SENSOR_POWER_AC220_3P, SENSOR_POWER_DC,
    SENSOR_PRESSURE_POSITIVE, SENSOR_PRESSURE_VACUUM, TEST_RECORD,
};
use pumpbench_core::types::{to_unix_seconds, Reading};
use pumpbench_devices::{
    Driver, FlowMeter, MeterKind, PressureSensor, SinglePhasePowerMeter, ThreePhasePowerMeter,
};

/// Rate limiter in front of the bus
///
/// A topic is published at most once per interval. A payload arriving
/// sooner replaces the topic's pending payload instead.
#[derive(Debug)]
pub struct ThrottledPublisher {
    bus: DynBus,
    min_interval: Duration,
    last_publish: HashMap<String, Instant>,
    pending: HashMap<String, Value>,
}

impl ThrottledPublisher {
    /// Publisher allowing one message per topic every `min_interval`
    pub fn new(bus: DynBus, min_interval: Duration) -> Self {
        Self {
            bus,
            min_interval,
            last_publish: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    /// Publish now if the topic's interval has passed, otherwise keep as pending
    pub fn publish_if_needed(&mut self, topic: &str, payload: Value) -> bool {
        let now = Instant::now();
        match self.last_publish.get(topic) {
            Some(at) if now.duration_since(*at) < self.min_interval => {
                trace!(topic, "Publish throttled");
                self.pending.insert(topic.to_string(), payload);
                false
            }
            _ => {
                self.send(topic, payload, now);
                true
            }
        }
    }

    /// Publish every pending payload; returns how many were sent
    pub fn flush_pending(&mut self) -> usize {
        let now = Instant::now();
        let pending: Vec<(String, Value)> = self.pending.drain().collect();
        let count = pending.len();
        for (topic, payload) in pending {
            self.send(&topic, payload, now);
        }
        count
    }

    /// Publish regardless of the interval
    pub fn force_publish(&mut self, topic: &str, payload: Value) {
        self.send(topic, payload, Instant::now());
    }

    /// Number of topics with a pending payload
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn send(&mut self, topic: &str, payload: Value, now: Instant) {
        self.pending.remove(topic);
        self.last_publish.insert(topic.to_string(), now);
        if let Err(e) = self.bus.publish(topic, payload) {
            debug!(topic, "Failed to publish sensor reading: {}", e);
        }
    }
}

/// The measuring instruments of the bench
#[derive(Debug, Clone)]
pub struct Sensors {
    /// Flow meter
    pub flow: FlowMeter,
    /// Positive pressure transmitter
    pub pressure_positive: PressureSensor,
    /// Vacuum pressure transmitter
    pub pressure_vacuum: PressureSensor,
    /// DC supply meter
    pub dc: SinglePhasePowerMeter,
    /// AC 110V supply meter
    pub ac110: SinglePhasePowerMeter,
    /// AC 220V supply meter
    pub ac220: SinglePhasePowerMeter,
    /// AC 220V three-phase supply meter
    pub ac220_3p: ThreePhasePowerMeter,
}

impl Sensors {
    /// Every instrument with its device name
    pub fn drivers(&self) -> [(&'static str, &dyn Driver); 7] {
        [
            (devices::FLOW_METER, &self.flow),
            (devices::PRESSURE_POSITIVE, &self.pressure_positive),
            (devices::PRESSURE_VACUUM, &self.pressure_vacuum),
            (devices::DC_METER, &self.dc),
            (devices::AC110V_METER, &self.ac110),
            (devices::AC220V_METER, &self.ac220),
            (devices::AC220V_3P_METER, &self.ac220_3p),
        ]
    }
}

/// Periodic sampler of the bench instruments
#[derive(Debug)]
pub struct SensorPoller {
    sensors: Sensors,
    publisher: Mutex<ThrottledPublisher>,
    bus: DynBus,
    sink: Arc<dyn RecordSink>,
    config: SensorsConfig,
}

impl SensorPoller {
    /// Poller over `sensors`, recording into `sink`
    pub fn new(sensors: Sensors, bus: DynBus, sink: Arc<dyn RecordSink>, config: SensorsConfig) -> Self {
        let publisher = ThrottledPublisher::new(bus.clone(), Duration::from_millis(config.min_publish_interval_ms));
        Self {
            sensors,
            publisher: Mutex::new(publisher),
            bus,
            sink,
            config,
        }
    }

    /// The polled instruments
    pub fn sensors(&self) -> &Sensors {
        &self.sensors
    }

    /// Connect every instrument; returns how many are connected
    ///
    /// Failures are logged and leave the poller running with fewer
    /// instruments.
    pub async fn connect_all(&self) -> usize {
        let mut connected = 0;
        for (name, driver) in self.sensors.drivers() {
            match driver.connect().await {
                Ok(()) => connected += 1,
                Err(e) => warn!(device = name, "Sensor unavailable: {}", e),
            }
        }
        info!(connected, total = self.sensors.drivers().len(), "Sensors connected");
        connected
    }

    /// Disconnect every instrument
    pub async fn disconnect_all(&self) {
        for (_, driver) in self.sensors.drivers() {
            driver.disconnect().await;
        }
    }

    /// Names of instruments that are not connected
    pub fn missing_devices(&self) -> Vec<&'static str> {
        self.sensors
            .drivers()
            .into_iter()
            .filter(|(_, driver)| !driver.is_connected())
            .map(|(name, _)| name)
            .collect()
    }

    /// Sample until cancelled
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        info!(poll_ms = self.config.poll_ms, "Sensor poller started");
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.poll_ms));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    self.publisher.lock().flush_pending();
                    self.poll_once().await;
                }
            }
        }
        debug!("Sensor poller stopped");
    }

    /// Sample every connected instrument once
    pub async fn poll_once(&self) -> Reading {
        let mut reading = Reading::now();
        let timestamp = to_unix_seconds(reading.timestamp);
        let sensors = &self.sensors;

        if let Some(flow) = sample(devices::FLOW_METER, &sensors.flow, sensors.flow.read_all()).await {
            reading
                .set_opt("flow_instantaneous", flow.instantaneous_flow)
                .set_opt("flow_cumulative", flow.cumulative_flow);
            self.publish(SENSOR_FLOW, &flow, timestamp);
        }

        let pressures = [
            ("pressure_positive", SENSOR_PRESSURE_POSITIVE, &sensors.pressure_positive),
            ("pressure_vacuum", SENSOR_PRESSURE_VACUUM, &sensors.pressure_vacuum),
        ];
        for (name, topic, sensor) in pressures {
            if let Some(pressure) = sample(name, sensor, sensor.read_all()).await {
                reading.set(name, pressure.pressure_mpa);
                self.publish(topic, &pressure, timestamp);
            }
        }

        for meter in [&sensors.dc, &sensors.ac110, &sensors.ac220] {
            let kind = meter.kind();
            if let Some(power) = sample(kind.as_str(), meter, meter.read_all()).await {
                reading
                    .set_opt(format!("{}_voltage", kind), power.voltage)
                    .set_opt(format!("{}_current", kind), power.current)
                    .set_opt(format!("{}_power", kind), power.active_power);
                self.publish(power_topic(kind), &power, timestamp);
            }
        }

        let meter = &sensors.ac220_3p;
        if let Some(power) = sample(devices::AC220V_3P_METER, meter, meter.read_all()).await {
            reading
                .set_opt("ac220_3p_voltage_a", power.voltage_a)
                .set_opt("ac220_3p_voltage_b", power.voltage_b)
                .set_opt("ac220_3p_voltage_c", power.voltage_c)
                .set_opt("ac220_3p_current_a", power.current_a)
                .set_opt("ac220_3p_current_b", power.current_b)
                .set_opt("ac220_3p_current_c", power.current_c)
                .set_opt("ac220_3p_total_power", power.total_active_power);
            self.publish(SENSOR_POWER_AC220_3P, &power, timestamp);
        }

        self.record(&reading);
        reading
    }

    fn publish<T: Serialize>(&self, topic: &str, reading: &T, timestamp: f64) {
        match serde_json::to_value(reading) {
            Ok(Value::Object(mut payload)) => {
                payload.insert("timestamp".to_string(), Value::from(timestamp));
                self.publisher.lock().publish_if_needed(topic, Value::Object(payload));
            }
            Ok(other) => debug!(topic, payload = %other, "Reading is not an object"),
            Err(e) => debug!(topic, "Failed to serialize reading: {}", e),
        }
    }

    fn record(&self, reading: &Reading) {
        let Some(test_id) = self.sink.active_session() else {
            return;
        };
        if reading.is_empty() {
            trace!(test_id, "Nothing measured this tick");
            return;
        }
        if let Err(e) = self.sink.record(reading) {
            warn!(test_id, "Failed to record reading: {}", e);
        }

        let mut payload = reading.to_json();
        if let Value::Object(map) = &mut payload {
            map.insert("test_id".to_string(), Value::from(test_id));
        }
        if let Err(e) = self.bus.publish(TEST_RECORD, payload) {
            debug!("Failed to publish test record: {}", e);
        }
    }
}

fn power_topic(kind: MeterKind) -> &'static str {
    match kind {
        MeterKind::Dc => SENSOR_POWER_DC,
        MeterKind::Ac110 => SENSOR_POWER_AC110,
        MeterKind::Ac220 => SENSOR_POWER_AC220,
    }
}

async fn sample<T, F>(name: &str, driver: &dyn Driver, read: F) -> Option<T>
where
    F: Future<Output = pumpbench_devices::Result<T>>,
{
    if !driver.is_connected() {
        return None;
    }
    match read.await {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(device = name, "Sensor read failed: {}", e);
            None
        }
    }
}
