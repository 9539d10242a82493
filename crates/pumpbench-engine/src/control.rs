/*!
 * Valve and supply control.
 *
 * Every actuator command passes the safety gate first. Commands also arrive
 * as JSON on the valve and power topics; the outcome is published back on
 * the same topic.
 */
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use pumpbench_core::event::{BusMessage, BusReceiver, DynBus};
use pumpbench_core::topics::{CONTROL_POWER, CONTROL_VALVE};
use pumpbench_devices::{Driver, PowerSupply, RelayIo, Valve};

use crate::error::Result;
use crate::safety::SafetyGate;

/// Valve command body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValveCommand {
    /// Which valve
    pub valve: Valve,
    /// Open when true
    pub state: bool,
}

/// Power command body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PowerCommand {
    /// Which supply
    pub power_type: PowerSupply,
    /// On when true
    pub state: bool,
}

/// Actuator control behind the safety gate
pub struct ControlService {
    relay: RelayIo,
    safety: Arc<dyn SafetyGate>,
    bus: DynBus,
}

impl std::fmt::Debug for ControlService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlService").field("relay", &self.relay).finish_non_exhaustive()
    }
}

impl ControlService {
    /// Control through `relay`, gated by `safety`
    pub fn new(relay: RelayIo, safety: Arc<dyn SafetyGate>, bus: DynBus) -> Self {
        Self { relay, safety, bus }
    }

    /// Relay board used for control
    pub fn relay(&self) -> &RelayIo {
        &self.relay
    }

    /// Whether the relay board is connected
    pub fn is_ready(&self) -> bool {
        self.relay.is_connected()
    }

    /// Open or close a valve
    pub async fn set_valve(&self, valve: Valve, state: bool) -> Result<()> {
        self.safety.check_start_conditions()?;
        self.relay.set_relay(valve.channel(), state).await?;
        info!(%valve, state, "Valve switched");
        Ok(())
    }

    /// Switch a supply on or off
    pub async fn set_power(&self, supply: PowerSupply, state: bool) -> Result<()> {
        self.safety.check_start_conditions()?;
        self.relay.set_relay(supply.channel(), state).await?;
        info!(power_type = %supply, state, "Supply switched");
        Ok(())
    }

    /// Switch everything off, then open the bleed valves
    ///
    /// Both steps are attempted; the first failure is returned.
    pub async fn emergency_shutdown(&self) -> Result<()> {
        error!("Running emergency shutdown");
        let off = self.relay.all_relays_off().await;
        if let Err(e) = &off {
            error!("Failed to switch relays off: {}", e);
        }

        let bleed = BTreeMap::from([
            (Valve::A.channel(), true),
            (Valve::B.channel(), true),
            (Valve::C.channel(), false),
            (Valve::D.channel(), false),
        ]);
        let open = self.relay.set_relays(&bleed).await;
        if let Err(e) = &open {
            error!("Failed to open bleed valves: {}", e);
        }

        off.and(open)?;
        info!("Emergency shutdown complete");
        Ok(())
    }

    /// Serve valve and power commands from the bus until cancelled
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> Result<()> {
        let mut valves = self.bus.subscribe(CONTROL_VALVE)?;
        let mut power = self.bus.subscribe(CONTROL_POWER)?;
        info!("Control command loop started");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                message = next_message(&mut valves, CONTROL_VALVE) => match message {
                    Some(message) => self.on_valve(&message).await,
                    None => break,
                },
                message = next_message(&mut power, CONTROL_POWER) => match message {
                    Some(message) => self.on_power(&message).await,
                    None => break,
                },
            }
        }
        debug!("Control command loop stopped");
        Ok(())
    }

    async fn on_valve(&self, message: &BusMessage) {
        if is_result(&message.payload) {
            return;
        }
        let reply = match message.decode::<ValveCommand>() {
            Ok(command) => match self.set_valve(command.valve, command.state).await {
                Ok(()) => json!({"status": "success", "valve": command.valve, "state": command.state}),
                Err(e) => {
                    warn!(valve = %command.valve, "Valve command refused: {}", e);
                    json!({"status": "error", "message": e.to_string()})
                }
            },
            Err(e) => {
                warn!(payload = %message.payload, "Malformed valve command: {}", e);
                json!({"status": "error", "message": format!("Malformed valve command: {}", e)})
            }
        };
        self.reply(CONTROL_VALVE, reply);
    }

    async fn on_power(&self, message: &BusMessage) {
        if is_result(&message.payload) {
            return;
        }
        let reply = match message.decode::<PowerCommand>() {
            Ok(command) => match self.set_power(command.power_type, command.state).await {
                Ok(()) => json!({"status": "success", "power_type": command.power_type, "state": command.state}),
                Err(e) => {
                    warn!(power_type = %command.power_type, "Power command refused: {}", e);
                    json!({"status": "error", "message": e.to_string()})
                }
            },
            Err(e) => {
                warn!(payload = %message.payload, "Malformed power command: {}", e);
                json!({"status": "error", "message": format!("Malformed power command: {}", e)})
            }
        };
        self.reply(CONTROL_POWER, reply);
    }

    fn reply(&self, topic: &str, payload: Value) {
        if let Err(e) = self.bus.publish(topic, payload) {
            debug!(topic, "Failed to publish command result: {}", e);
        }
    }
}

// Our own result envelopes come back on the command topic
fn is_result(payload: &Value) -> bool {
    payload.get("status").is_some()
}

/// Next message on a subscription; `None` once the topic is closed
pub(crate) async fn next_message(receiver: &mut BusReceiver, topic: &str) -> Option<BusMessage> {
    loop {
        match receiver.recv().await {
            Ok(message) => return Some(message),
            Err(RecvError::Lagged(skipped)) => warn!(topic, skipped, "Command subscriber lagged"),
            Err(RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use parking_lot::Mutex;

    use crate::error::Error;
    use pumpbench_core::event::{MessageBus, SharedEventBus};
    use pumpbench_devices::mock::{MockConnector, MockDevice};
    use pumpbench_devices::protocol::Request;
    use pumpbench_devices::Link;

    #[derive(Default)]
    struct Gate(Mutex<Option<&'static str>>);

    impl SafetyGate for Gate {
        fn check_start_conditions(&self) -> Result<()> {
            match *self.0.lock() {
                Some(message) => Err(Error::safety_interlock(message)),
                None => Ok(()),
            }
        }
    }

    async fn service(device: &Arc<MockDevice>, gate: Arc<Gate>, bus: SharedEventBus) -> Arc<ControlService> {
        let link = Link::tcp_with_connector("relay_io", 1, Duration::from_secs(1), MockConnector::new(device.clone()));
        let relay = RelayIo::new(Arc::new(link));
        relay.connect().await.unwrap();
        Arc::new(ControlService::new(relay, gate, Arc::new(bus)))
    }

    #[tokio::test]
    async fn test_valve_and_power_channels() {
        let device = MockDevice::new();
        let control = service(&device, Arc::new(Gate::default()), SharedEventBus::new()).await;

        control.set_valve(Valve::C, true).await.unwrap();
        control.set_power(PowerSupply::Ac220ThreePhase, true).await.unwrap();
        assert_eq!(
            device.writes(),
            vec![
                Request::WriteSingleCoil { address: 2, value: true },
                Request::WriteSingleCoil { address: 7, value: true },
            ]
        );
    }

    #[tokio::test]
    async fn test_open_cover_refuses_without_writing() {
        let device = MockDevice::new();
        let gate = Arc::new(Gate(Mutex::new(Some("Test cover is open"))));
        let control = service(&device, gate, SharedEventBus::new()).await;

        let err = control.set_valve(Valve::A, true).await.unwrap_err();
        assert!(matches!(err, Error::SafetyInterlock(_)));
        assert_eq!(device.call_count(), 0);
    }

    #[tokio::test]
    async fn test_emergency_shutdown_sequence() {
        let device = MockDevice::new();
        let control = service(&device, Arc::new(Gate::default()), SharedEventBus::new()).await;

        control.emergency_shutdown().await.unwrap();
        assert_eq!(
            device.writes(),
            vec![
                Request::WriteMultipleCoils { address: 0, values: vec![false; 8] },
                Request::WriteMultipleCoils { address: 0, values: vec![true, true, false, false] },
            ]
        );
        assert_eq!(device.coils(0, 8), vec![true, true, false, false, false, false, false, false]);
    }

    #[tokio::test]
    async fn test_bus_commands_get_results_on_same_topic() {
        let device = MockDevice::new();
        let bus = SharedEventBus::new();
        let mut results = bus.subscribe(CONTROL_VALVE).unwrap();
        let control = service(&device, Arc::new(Gate::default()), bus.clone()).await;
        let token = CancellationToken::new();
        let task = tokio::spawn(control.run(token.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;

        bus.publish(CONTROL_VALVE, json!({"valve": "b", "state": true})).unwrap();
        results.recv().await.unwrap();
        let reply = results.recv().await.unwrap();
        assert_eq!(reply.payload["status"], "success");
        assert_eq!(reply.payload["valve"], "B");

        bus.publish(CONTROL_POWER, json!({"power_type": "gas", "state": true})).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        token.cancel();
        task.await.unwrap().unwrap();
        // the result envelope was not taken for a second command
        assert_eq!(device.writes(), vec![Request::WriteSingleCoil { address: 1, value: true }]);
    }
}
