/*!
 * Watchdog over the safety thread's heartbeat.
 *
 * When the heartbeat goes stale the watchdog alerts once and forces every
 * relay off through the blocking pool. It re-arms only after the heartbeat
 * is fresh again.
 */
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use pumpbench_core::config::WatchdogConfig;
use pumpbench_core::error::Error as CoreError;
use pumpbench_core::event::DynBus;
use pumpbench_core::topics::SAFETY_ALERT;
use pumpbench_core::types::unix_timestamp;
use pumpbench_core::utils::with_timeout;
use pumpbench_devices::RelayIo;

use crate::safety::Heartbeat;

/// Fail-safe trigger for a stalled safety loop
#[derive(Debug)]
pub struct Watchdog {
    heartbeat: Arc<Heartbeat>,
    relay: RelayIo,
    bus: DynBus,
    config: WatchdogConfig,
    triggered: bool,
}

impl Watchdog {
    /// Watch `heartbeat`, cutting power through `relay` on a stall
    pub fn new(heartbeat: Arc<Heartbeat>, relay: RelayIo, bus: DynBus, config: WatchdogConfig) -> Self {
        Self {
            heartbeat,
            relay,
            bus,
            config,
            triggered: false,
        }
    }

    /// Whether the current stall has already been handled
    pub fn is_triggered(&self) -> bool {
        self.triggered
    }

    /// Poll until cancelled
    pub async fn run(mut self, token: CancellationToken) {
        info!(timeout_ms = self.config.timeout_ms, "Watchdog started");
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.poll_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    self.check().await;
                }
            }
        }
        debug!("Watchdog stopped");
    }

    /// One poll; returns whether the fail-safe fired
    pub async fn check(&mut self) -> bool {
        let elapsed = self.heartbeat.age();
        if elapsed > Duration::from_millis(self.config.timeout_ms) {
            if !self.triggered {
                self.triggered = true;
                self.fire(elapsed).await;
                return true;
            }
        } else if self.triggered {
            self.triggered = false;
            info!("Safety loop heartbeat recovered, watchdog re-armed");
        }
        false
    }

    async fn fire(&self, elapsed: Duration) {
        error!(
            elapsed_ms = elapsed.as_millis() as u64,
            "Safety loop stalled, forcing fail-safe"
        );

        let alert = json!({
            "type": "critical",
            "message": "Safety loop stalled, emergency stop triggered",
            "elapsed_time": elapsed.as_secs_f64(),
            "timestamp": unix_timestamp(),
        });
        if let Err(e) = self.bus.publish(SAFETY_ALERT, alert) {
            error!("Failed to publish watchdog alert: {}", e);
        }

        let relay = self.relay.clone();
        let failsafe = async move {
            tokio::task::spawn_blocking(move || relay.all_relays_off_sync())
                .await
                .map_err(|e| CoreError::runtime(format!("Fail-safe task failed: {}", e)))?
                .map_err(|e| CoreError::runtime(e.to_string()))
        };
        match with_timeout(Duration::from_millis(self.config.failsafe_timeout_ms), failsafe).await {
            Ok(()) => error!("Fail-safe executed, all relays off"),
            Err(e) => error!("Fail-safe failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pumpbench_core::event::{MessageBus, SharedEventBus};
    use pumpbench_devices::mock::{MockConnector, MockDevice};
    use pumpbench_devices::protocol::Request;
    use pumpbench_devices::{Driver, Link};

    fn config() -> WatchdogConfig {
        WatchdogConfig {
            timeout_ms: 50,
            poll_ms: 10,
            failsafe_timeout_ms: 1000,
        }
    }

    async fn watchdog(device: &Arc<MockDevice>, bus: SharedEventBus) -> (Watchdog, Arc<Heartbeat>) {
        let link = Link::tcp_with_connector("relay_io", 1, Duration::from_secs(1), MockConnector::new(device.clone()));
        let relay = RelayIo::new(Arc::new(link));
        relay.connect().await.unwrap();
        let heartbeat = Arc::new(Heartbeat::new());
        (Watchdog::new(heartbeat.clone(), relay, Arc::new(bus), config()), heartbeat)
    }

    #[tokio::test]
    async fn test_stall_fires_once_until_recovery() {
        let device = MockDevice::new();
        let bus = SharedEventBus::new();
        let mut alerts = bus.subscribe(SAFETY_ALERT).unwrap();
        let (mut watchdog, heartbeat) = watchdog(&device, bus).await;

        heartbeat.beat();
        assert!(!watchdog.check().await);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(watchdog.check().await);
        assert!(!watchdog.check().await);
        assert!(watchdog.is_triggered());

        let alert = alerts.recv().await.unwrap();
        assert_eq!(alert.payload["type"], "critical");
        assert!(alert.payload["elapsed_time"].as_f64().unwrap() > 0.05);
        assert_eq!(
            device.writes(),
            vec![Request::WriteMultipleCoils { address: 0, values: vec![false; 8] }]
        );

        heartbeat.beat();
        assert!(!watchdog.check().await);
        assert!(!watchdog.is_triggered());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(watchdog.check().await);
        assert_eq!(device.writes().len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_relay_still_alerts() {
        let device = MockDevice::new();
        let bus = SharedEventBus::new();
        let mut alerts = bus.subscribe(SAFETY_ALERT).unwrap();
        let (mut watchdog, _) = watchdog(&device, bus).await;
        device.set_offline(true);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(watchdog.check().await);
        assert_eq!(alerts.recv().await.unwrap().payload["type"], "critical");
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let device = MockDevice::new();
        let (watchdog, heartbeat) = watchdog(&device, SharedEventBus::new()).await;
        heartbeat.beat();
        let token = CancellationToken::new();
        let task = tokio::spawn(watchdog.run(token.clone()));

        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
        assert!(device.writes().is_empty());
    }
}
