/*!
 * Eight-channel relay board with digital inputs.
 *
 * Relay channel `n` (1..=8) is coil `n - 1`. Channels 1-4 drive valves A-D,
 * channels 5-8 the DC, AC110, AC220 and AC220 three-phase supplies. Digital
 * input 0 is the emergency stop, input 1 the test cover.
 *
 * The `_sync` operations run on the caller's thread through the link's
 * blocking path; they exist for the safety worker and the watchdog fail-safe.
 */
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::Driver;
use crate::codec::bits_to_u8;
use crate::error::{DeviceError, Result};
use crate::link::Link;

/// Number of relay channels
pub const CHANNELS: u8 = 8;
/// Emergency stop input bit
pub const EMERGENCY_STOP_BIT: u8 = 0b01;
/// Cover closed input bit
pub const COVER_CLOSED_BIT: u8 = 0b10;

const FIRST_POWER_COIL: u16 = 4;

/// A solenoid valve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Valve {
    /// Bleed valve A
    #[serde(alias = "a")]
    A,
    /// Bleed valve B
    #[serde(alias = "b")]
    B,
    /// Valve C
    #[serde(alias = "c")]
    C,
    /// Valve D
    #[serde(alias = "d")]
    D,
}

impl Valve {
    /// Every valve, in channel order
    pub const ALL: [Valve; 4] = [Valve::A, Valve::B, Valve::C, Valve::D];

    /// Relay channel of the valve
    pub fn channel(self) -> u8 {
        match self {
            Valve::A => 1,
            Valve::B => 2,
            Valve::C => 3,
            Valve::D => 4,
        }
    }
}

impl fmt::Display for Valve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A switchable supply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PowerSupply {
    /// DC supply
    #[serde(rename = "dc")]
    Dc,
    /// AC 110V supply
    #[serde(rename = "ac110")]
    Ac110,
    /// AC 220V supply
    #[serde(rename = "ac220")]
    Ac220,
    /// AC 220V three-phase supply
    #[serde(rename = "ac220_3p")]
    Ac220ThreePhase,
}

impl PowerSupply {
    /// Relay channel of the supply
    pub fn channel(self) -> u8 {
        match self {
            PowerSupply::Dc => 5,
            PowerSupply::Ac110 => 6,
            PowerSupply::Ac220 => 7,
            PowerSupply::Ac220ThreePhase => 8,
        }
    }

    /// Wire name
    pub fn as_str(self) -> &'static str {
        match self {
            PowerSupply::Dc => "dc",
            PowerSupply::Ac110 => "ac110",
            PowerSupply::Ac220 => "ac220",
            PowerSupply::Ac220ThreePhase => "ac220_3p",
        }
    }
}

impl fmt::Display for PowerSupply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relay board driver
#[derive(Debug, Clone)]
pub struct RelayIo {
    link: Arc<Link>,
}

impl RelayIo {
    /// Driver over `link`
    pub fn new(link: Arc<Link>) -> Self {
        Self { link }
    }

    fn coil(channel: u8) -> Result<u16> {
        if (1..=CHANNELS).contains(&channel) {
            Ok(u16::from(channel - 1))
        } else {
            Err(DeviceError::validation(format!(
                "Invalid relay channel {} (expected 1-{})",
                channel, CHANNELS
            )))
        }
    }

    /// Switch one relay
    pub async fn set_relay(&self, channel: u8, state: bool) -> Result<()> {
        let coil = Self::coil(channel)?;
        self.link.write_single_coil(coil, state).await?;
        debug!(channel, state, "Relay set");
        Ok(())
    }

    /// Switch several relays with one batched write
    ///
    /// The write spans the lowest to the highest valid channel requested;
    /// channels inside the span that were not requested are switched off.
    /// Channels outside 1-8 are dropped with a warning.
    pub async fn set_relays(&self, states: &BTreeMap<u8, bool>) -> Result<()> {
        let (start, values) = Self::relay_span(states)?;
        self.link.write_multiple_coils(start, &values).await?;
        debug!(?states, "Relays set");
        Ok(())
    }

    fn relay_span(states: &BTreeMap<u8, bool>) -> Result<(u16, Vec<bool>)> {
        let valid: BTreeMap<u16, bool> = states
            .iter()
            .filter_map(|(channel, state)| match Self::coil(*channel) {
                Ok(coil) => Some((coil, *state)),
                Err(_) => {
                    warn!(channel, "Ignoring invalid relay channel");
                    None
                }
            })
            .collect();

        let (first, last) = match (valid.keys().next(), valid.keys().next_back()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => return Err(DeviceError::validation("No valid relay channel requested")),
        };
        let values = (first..=last)
            .map(|coil| valid.get(&coil).copied().unwrap_or(false))
            .collect();
        Ok((first, values))
    }

    /// Switch every relay off
    pub async fn all_relays_off(&self) -> Result<()> {
        self.link.write_multiple_coils(0, &[false; CHANNELS as usize]).await
    }

    /// Current relay states, channel 1 first
    pub async fn read_relays(&self) -> Result<Vec<bool>> {
        self.link.read_coils(0, u16::from(CHANNELS)).await
    }

    /// Digital inputs as a byte, bit 0 first
    pub async fn read_digital_inputs(&self) -> Result<u8> {
        let bits = self.link.read_discrete_inputs(0, 8).await?;
        Ok(bits_to_u8(&bits))
    }

    /// Blocking [`RelayIo::read_digital_inputs`]
    pub fn read_digital_inputs_sync(&self) -> Result<u8> {
        let bits = self.link.read_discrete_inputs_blocking(0, 8)?;
        Ok(bits_to_u8(&bits))
    }

    /// Blocking [`RelayIo::all_relays_off`]
    pub fn all_relays_off_sync(&self) -> Result<()> {
        self.link.write_multiple_coils_blocking(0, &[false; CHANNELS as usize])
    }

    /// Set the four valves and switch every supply off, blocking
    pub fn set_valves_sync(&self, a: bool, b: bool, c: bool, d: bool) -> Result<()> {
        self.link
            .write_multiple_coils_blocking(0, &[a, b, c, d, false, false, false, false])
    }

    /// Switch every supply off, leaving the valves alone, blocking
    pub fn power_off_all_sync(&self) -> Result<()> {
        self.link
            .write_multiple_coils_blocking(FIRST_POWER_COIL, &[false; 4])
    }
}

impl Driver for RelayIo {
    fn link(&self) -> &Arc<Link> {
        &self.link
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::mock::{MockConnector, MockDevice};
    use crate::protocol::Request;

    async fn relay(device: &Arc<MockDevice>) -> RelayIo {
        let link = Link::tcp_with_connector("relay_io", 1, Duration::from_secs(1), MockConnector::new(device.clone()));
        let relay = RelayIo::new(Arc::new(link));
        relay.connect().await.unwrap();
        relay
    }

    #[tokio::test]
    async fn test_invalid_channel_is_rejected_before_io() {
        let device = MockDevice::new();
        let relay = relay(&device).await;

        assert!(matches!(relay.set_relay(9, true).await, Err(DeviceError::Validation(_))));
        assert!(matches!(relay.set_relay(0, true).await, Err(DeviceError::Validation(_))));
        assert_eq!(device.call_count(), 0);
        assert_eq!(relay.status().total_requests, 0);
    }

    #[tokio::test]
    async fn test_set_relay_maps_channel_to_coil() {
        let device = MockDevice::new();
        let relay = relay(&device).await;

        relay.set_relay(5, true).await.unwrap();
        assert_eq!(device.writes(), vec![Request::WriteSingleCoil { address: 4, value: true }]);
    }

    #[tokio::test]
    async fn test_set_relays_writes_the_span() {
        let device = MockDevice::new();
        device.set_coils(0, &[true; 8]);
        let relay = relay(&device).await;

        let states = BTreeMap::from([(2, true), (5, true), (12, true)]);
        relay.set_relays(&states).await.unwrap();
        assert_eq!(
            device.writes(),
            vec![Request::WriteMultipleCoils {
                address: 1,
                values: vec![true, false, false, true],
            }]
        );
        assert_eq!(
            relay.read_relays().await.unwrap(),
            vec![true, true, false, false, true, true, true, true]
        );
    }

    #[tokio::test]
    async fn test_set_relays_without_valid_channels() {
        let device = MockDevice::new();
        let relay = relay(&device).await;

        let states = BTreeMap::from([(0, true), (9, false)]);
        assert!(matches!(relay.set_relays(&states).await, Err(DeviceError::Validation(_))));
        assert_eq!(device.call_count(), 0);
    }

    #[tokio::test]
    async fn test_digital_inputs_pack_lsb_first() {
        let device = MockDevice::new();
        device.set_discrete(0, &[true, true, false, false, false, false, false, true]);
        let relay = relay(&device).await;

        let inputs = relay.read_digital_inputs().await.unwrap();
        assert_eq!(inputs, 0b1000_0011);
        assert_ne!(inputs & EMERGENCY_STOP_BIT, 0);
        assert_ne!(inputs & COVER_CLOSED_BIT, 0);
    }

    #[tokio::test]
    async fn test_sync_fast_paths() {
        let device = MockDevice::new();
        device.set_coils(0, &[true; 8]);
        device.set_discrete(1, &[true]);
        let relay = relay(&device).await;

        let worker = relay.clone();
        tokio::task::spawn_blocking(move || {
            assert_eq!(worker.read_digital_inputs_sync().unwrap(), COVER_CLOSED_BIT);
            worker.power_off_all_sync().unwrap();
        })
        .await
        .unwrap();
        assert_eq!(device.coils(0, 8), vec![true, true, true, true, false, false, false, false]);

        let worker = relay.clone();
        tokio::task::spawn_blocking(move || {
            worker.all_relays_off_sync().unwrap();
            worker.set_valves_sync(true, true, false, false).unwrap();
        })
        .await
        .unwrap();
        assert_eq!(device.coils(0, 8), vec![true, true, false, false, false, false, false, false]);
        assert_eq!(
            device.writes()[1],
            Request::WriteMultipleCoils { address: 0, values: vec![false; 8] }
        );
    }

    #[test]
    fn test_command_names() {
        let valve: Valve = serde_json::from_str("\"a\"").unwrap();
        assert_eq!(valve.channel(), 1);
        let supply: PowerSupply = serde_json::from_str("\"ac220_3p\"").unwrap();
        assert_eq!(supply.channel(), 8);
        assert_eq!(PowerSupply::Ac110.to_string(), "ac110");
    }
}
