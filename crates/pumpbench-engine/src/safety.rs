/*!
 * Safety monitor.
 *
 * A dedicated thread samples the relay board's digital inputs every period
 * and acts on emergency-stop and cover edges itself, without waiting on the
 * async runtime. The async side sees three things only: the heartbeat the
 * thread stamps before each sample, the latest [`SafetyState`] through a
 * watch channel, and a bounded queue of samples that a runtime task
 * republishes to the bus.
 */
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

use pumpbench_core::config::SafetyConfig;
use pumpbench_core::event::DynBus;
use pumpbench_core::topics::{SAFETY_ALERT, SAFETY_STATUS};
use pumpbench_core::types::unix_timestamp;
use pumpbench_devices::drivers::relay_io::{COVER_CLOSED_BIT, EMERGENCY_STOP_BIT};
use pumpbench_devices::{Driver, RelayIo};

use crate::error::{Error, Result};

/// Interlock state derived from the digital inputs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SafetyState {
    /// Emergency stop button pressed
    pub emergency_stop_active: bool,
    /// Test cover closed
    pub cover_closed: bool,
    /// Locked by an emergency stop until the button is released
    pub system_locked: bool,
}

impl SafetyState {
    /// First interlock that forbids starting, if any
    pub fn start_blocker(&self) -> Option<&'static str> {
        if self.emergency_stop_active {
            Some("Emergency stop is active, release it and retry")
        } else if !self.cover_closed {
            Some("Test cover is open, close it and retry")
        } else if self.system_locked {
            Some("System is locked, check the safety state")
        } else {
            None
        }
    }
}

/// One sample as published on the bus
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SafetySample {
    /// Emergency stop input
    pub emergency_stop: bool,
    /// Cover input
    pub cover_closed: bool,
    /// Lock after handling the sample
    pub system_locked: bool,
    /// Sample time, unix seconds
    pub timestamp: f64,
}

/// Gate consulted before a test start or an actuator command
pub trait SafetyGate: Send + Sync {
    /// `Ok` when starting is safe, otherwise the first interlock message
    fn check_start_conditions(&self) -> Result<()>;
}

/// Liveness stamp written by the sampling thread
#[derive(Debug)]
pub struct Heartbeat {
    origin: Instant,
    last_micros: AtomicU64,
}

impl Heartbeat {
    /// A heartbeat stamped now
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_micros: AtomicU64::new(0),
        }
    }

    /// Stamp the current time
    pub fn beat(&self) {
        let micros = self.origin.elapsed().as_micros() as u64;
        self.last_micros.store(micros, Ordering::Release);
    }

    /// Time since the last stamp
    pub fn age(&self) -> Duration {
        let last = Duration::from_micros(self.last_micros.load(Ordering::Acquire));
        self.origin.elapsed().saturating_sub(last)
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

struct Worker {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
    publisher: tokio::task::JoinHandle<()>,
}

/// Fixed-cadence interlock monitor
pub struct SafetyMonitor {
    relay: RelayIo,
    config: SafetyConfig,
    bus: DynBus,
    heartbeat: Arc<Heartbeat>,
    state: Arc<watch::Sender<SafetyState>>,
    worker: Mutex<Option<Worker>>,
}

impl std::fmt::Debug for SafetyMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafetyMonitor")
            .field("state", &self.state())
            .field("running", &self.is_running())
            .finish()
    }
}

impl SafetyMonitor {
    /// Monitor sampling through `relay`
    pub fn new(relay: RelayIo, config: SafetyConfig, bus: DynBus) -> Self {
        let (state, _) = watch::channel(SafetyState::default());
        Self {
            relay,
            config,
            bus,
            heartbeat: Arc::new(Heartbeat::new()),
            state: Arc::new(state),
            worker: Mutex::new(None),
        }
    }

    /// Latest interlock state
    pub fn state(&self) -> SafetyState {
        *self.state.borrow()
    }

    /// Watch the interlock state
    pub fn subscribe(&self) -> watch::Receiver<SafetyState> {
        self.state.subscribe()
    }

    /// Heartbeat stamped by the sampling thread
    pub fn heartbeat(&self) -> Arc<Heartbeat> {
        self.heartbeat.clone()
    }

    /// Relay board the monitor samples
    pub fn relay(&self) -> &RelayIo {
        &self.relay
    }

    /// Whether the sampling thread is running
    pub fn is_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .map_or(false, |worker| !worker.thread.is_finished())
    }

    /// Connect the relay board and start sampling
    ///
    /// Fails when the board cannot be reached; the bench must not run
    /// without the monitor.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        if let Err(e) = self.relay.connect().await {
            error!("Relay board unreachable, safety monitor cannot start: {}", e);
            return Err(e.into());
        }

        let (queue, samples) = mpsc::channel(self.config.queue_capacity.max(1));
        let stop = Arc::new(AtomicBool::new(false));
        let mut sampler = Sampler {
            relay: self.relay.clone(),
            heartbeat: self.heartbeat.clone(),
            state: self.state.clone(),
            queue,
            current: self.state(),
            failing: false,
        };
        let period = Duration::from_millis(self.config.period_ms);
        let thread_stop = stop.clone();
        self.heartbeat.beat();
        let thread = std::thread::Builder::new()
            .name("safety-monitor".to_string())
            .spawn(move || sampler.run(period, &thread_stop))
            .map_err(|e| Error::other(format!("Failed to spawn safety thread: {}", e)))?;
        let publisher = tokio::spawn(publish_samples(samples, self.bus.clone()));

        *self.worker.lock() = Some(Worker { stop, thread, publisher });
        info!(period_ms = self.config.period_ms, "Safety monitor started");
        Ok(())
    }

    /// Stop sampling
    ///
    /// The thread is given a bounded time to finish its current tick; the
    /// publisher is cancelled after that.
    pub async fn stop(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        worker.stop.store(true, Ordering::SeqCst);

        let join_timeout = Duration::from_millis(self.config.join_timeout_ms);
        let thread = worker.thread;
        match tokio::time::timeout(join_timeout, tokio::task::spawn_blocking(move || thread.join())).await {
            Ok(Ok(Ok(()))) => debug!("Safety thread joined"),
            Ok(_) => warn!("Safety thread ended abnormally"),
            Err(_) => warn!(timeout_ms = self.config.join_timeout_ms, "Safety thread did not stop in time"),
        }
        worker.publisher.abort();
        info!("Safety monitor stopped");
    }
}

impl SafetyGate for SafetyMonitor {
    fn check_start_conditions(&self) -> Result<()> {
        match self.state().start_blocker() {
            Some(message) => Err(Error::safety_interlock(message)),
            None => Ok(()),
        }
    }
}

/// The sampling loop; lives on the safety thread
struct Sampler {
    relay: RelayIo,
    heartbeat: Arc<Heartbeat>,
    state: Arc<watch::Sender<SafetyState>>,
    queue: mpsc::Sender<SafetySample>,
    current: SafetyState,
    failing: bool,
}

impl Sampler {
    fn run(&mut self, period: Duration, stop: &AtomicBool) {
        debug!("Safety sampling started");
        while !stop.load(Ordering::SeqCst) {
            let started = Instant::now();
            self.tick();
            let elapsed = started.elapsed();
            if elapsed >= period {
                warn!(
                    elapsed_ms = elapsed.as_secs_f64() * 1000.0,
                    period_ms = period.as_millis() as u64,
                    "Safety tick overran its period"
                );
            } else {
                std::thread::sleep(period - elapsed);
            }
        }
        debug!("Safety sampling stopped");
    }

    fn tick(&mut self) {
        // stamped before any I/O so a hung read still shows as a stall
        self.heartbeat.beat();

        let inputs = match self.relay.read_digital_inputs_sync() {
            Ok(inputs) => inputs,
            Err(e) => {
                if !self.failing {
                    warn!("Digital input read failed, skipping tick: {}", e);
                    self.failing = true;
                } else {
                    trace!("Digital input read failed: {}", e);
                }
                return;
            }
        };
        if self.failing {
            info!("Digital input reads recovered");
            self.failing = false;
        }

        let emergency = inputs & EMERGENCY_STOP_BIT != 0;
        let cover_closed = inputs & COVER_CLOSED_BIT != 0;
        let mut next = self.current;

        if emergency && !next.emergency_stop_active {
            self.emergency_stop();
            next.system_locked = true;
        } else if !emergency && next.emergency_stop_active {
            info!("Emergency stop released, system unlocked");
            next.system_locked = false;
        }

        if !cover_closed && next.cover_closed {
            warn!("Test cover opened, cutting motor power");
            if let Err(e) = self.relay.power_off_all_sync() {
                error!("Failed to cut motor power: {}", e);
            }
        } else if cover_closed && !next.cover_closed {
            info!("Test cover closed");
        }

        next.emergency_stop_active = emergency;
        next.cover_closed = cover_closed;
        if next != self.current {
            self.current = next;
            self.state.send_replace(next);
        }

        let sample = SafetySample {
            emergency_stop: emergency,
            cover_closed,
            system_locked: next.system_locked,
            timestamp: unix_timestamp(),
        };
        if self.queue.try_send(sample).is_err() {
            trace!("Safety queue full, sample dropped");
        }
    }

    fn emergency_stop(&self) {
        error!("Emergency stop pressed, shutting down");
        if let Err(e) = self.relay.all_relays_off_sync() {
            error!("Failed to switch relays off: {}", e);
        }
        if let Err(e) = self.relay.set_valves_sync(true, true, false, false) {
            error!("Failed to open bleed valves: {}", e);
        }
        error!("Emergency stop executed: power cut, bleed valves open, system locked");
    }
}

async fn publish_samples(mut samples: mpsc::Receiver<SafetySample>, bus: DynBus) {
    while let Some(sample) = samples.recv().await {
        match serde_json::to_value(sample) {
            Ok(payload) => {
                if let Err(e) = bus.publish(SAFETY_STATUS, payload) {
                    debug!("Failed to publish safety status: {}", e);
                }
            }
            Err(e) => debug!("Failed to encode safety status: {}", e),
        }

        let alert = if sample.emergency_stop {
            Some(json!({"type": "emergency", "message": "Emergency stop active"}))
        } else if !sample.cover_closed {
            Some(json!({"type": "warning", "message": "Test cover open"}))
        } else {
            None
        };
        if let Some(alert) = alert {
            if let Err(e) = bus.publish(SAFETY_ALERT, alert) {
                debug!("Failed to publish safety alert: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pumpbench_core::event::{MessageBus, SharedEventBus};
    use pumpbench_devices::mock::{MockConnector, MockDevice};
    use pumpbench_devices::protocol::Request;
    use pumpbench_devices::Link;

    fn relay(device: &Arc<MockDevice>) -> (RelayIo, Arc<MockConnector>) {
        let connector = MockConnector::new(device.clone());
        let link = Link::tcp_with_connector("relay_io", 1, Duration::from_secs(1), connector.clone());
        (RelayIo::new(Arc::new(link)), connector)
    }

    fn sampler(relay: RelayIo, capacity: usize) -> (Sampler, mpsc::Receiver<SafetySample>) {
        let (queue, samples) = mpsc::channel(capacity);
        let (state, _) = watch::channel(SafetyState::default());
        let sampler = Sampler {
            relay,
            heartbeat: Arc::new(Heartbeat::new()),
            state: Arc::new(state),
            queue,
            current: SafetyState::default(),
            failing: false,
        };
        (sampler, samples)
    }

    #[tokio::test]
    async fn test_emergency_edge_cuts_power_then_opens_bleed_valves() {
        let device = MockDevice::new();
        let (relay, _) = relay(&device);
        relay.connect().await.unwrap();
        let (mut sampler, _samples) = sampler(relay, 8);

        device.set_discrete(0, &[false, true]);
        sampler.tick();
        assert!(sampler.current.cover_closed);
        assert!(device.writes().is_empty());

        device.set_discrete(0, &[true, true]);
        sampler.tick();
        assert!(sampler.current.emergency_stop_active);
        assert!(sampler.current.system_locked);
        assert_eq!(
            device.writes(),
            vec![
                Request::WriteMultipleCoils { address: 0, values: vec![false; 8] },
                Request::WriteMultipleCoils {
                    address: 0,
                    values: vec![true, true, false, false, false, false, false, false]
                },
            ]
        );

        // held button: no further actuation
        sampler.tick();
        assert_eq!(device.writes().len(), 2);

        device.set_discrete(0, &[false, true]);
        sampler.tick();
        assert!(!sampler.current.emergency_stop_active);
        assert!(!sampler.current.system_locked);
    }

    #[tokio::test]
    async fn test_cover_opening_cuts_only_motor_power() {
        let device = MockDevice::new();
        let (relay, _) = relay(&device);
        relay.connect().await.unwrap();
        let (mut sampler, _samples) = sampler(relay, 8);

        device.set_discrete(0, &[false, true]);
        sampler.tick();
        device.set_discrete(0, &[false, false]);
        sampler.tick();

        assert_eq!(
            device.writes(),
            vec![Request::WriteMultipleCoils { address: 4, values: vec![false; 4] }]
        );
        assert!(!sampler.current.system_locked);
    }

    #[tokio::test]
    async fn test_failed_read_still_beats_and_changes_nothing() {
        let device = MockDevice::new();
        let (relay, _) = relay(&device);
        relay.connect().await.unwrap();
        let (mut sampler, mut samples) = sampler(relay, 8);

        std::thread::sleep(Duration::from_millis(20));
        device.set_offline(true);
        sampler.tick();

        assert!(sampler.heartbeat.age() < Duration::from_millis(20));
        assert_eq!(sampler.current, SafetyState::default());
        assert!(samples.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_queue_drops_new_samples() {
        let device = MockDevice::new();
        let (relay, _) = relay(&device);
        relay.connect().await.unwrap();
        let (mut sampler, mut samples) = sampler(relay, 1);

        device.set_discrete(0, &[false, true]);
        sampler.tick();
        device.set_discrete(0, &[false, false]);
        sampler.tick();

        let kept = samples.try_recv().unwrap();
        assert!(kept.cover_closed);
        assert!(samples.try_recv().is_err());
    }

    #[test]
    fn test_start_blockers_in_order() {
        let mut state = SafetyState {
            emergency_stop_active: true,
            cover_closed: false,
            system_locked: true,
        };
        assert!(state.start_blocker().unwrap().starts_with("Emergency stop"));
        state.emergency_stop_active = false;
        assert!(state.start_blocker().unwrap().starts_with("Test cover"));
        state.cover_closed = true;
        assert!(state.start_blocker().unwrap().starts_with("System is locked"));
        state.system_locked = false;
        assert_eq!(state.start_blocker(), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_monitor_samples_and_publishes() {
        let device = MockDevice::new();
        device.set_discrete(0, &[false, true]);
        let (relay, _) = relay(&device);
        let bus = SharedEventBus::new();
        let mut status = bus.subscribe(SAFETY_STATUS).unwrap();
        let monitor = SafetyMonitor::new(relay, SafetyConfig::default(), Arc::new(bus));
        let mut state = monitor.subscribe();

        assert!(monitor.check_start_conditions().is_err());
        monitor.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| s.cover_closed))
            .await
            .unwrap()
            .unwrap();
        assert!(monitor.check_start_conditions().is_ok());

        let message = tokio::time::timeout(Duration::from_secs(2), status.recv()).await.unwrap().unwrap();
        assert_eq!(message.payload["cover_closed"], true);

        device.set_discrete(0, &[true, true]);
        tokio::time::timeout(Duration::from_secs(2), state.wait_for(|s| s.system_locked))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(monitor.check_start_conditions(), Err(Error::SafetyInterlock(_))));

        monitor.stop().await;
        assert!(!monitor.is_running());
    }

    #[tokio::test]
    async fn test_start_fails_without_relay_board() {
        let device = MockDevice::new();
        let (relay, connector) = relay(&device);
        connector.refuse_connections(true);
        let monitor = SafetyMonitor::new(relay, SafetyConfig::default(), Arc::new(SharedEventBus::new()));

        assert!(monitor.start().await.is_err());
        assert!(!monitor.is_running());
    }
}
