/*!
 * Power meters.
 *
 * Every field is a signed 32-bit value over two registers, high word first.
 * Voltage is raw / 100, current raw / 1000, power raw / 100.
 */
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{pair, partial, Driver};
use crate::codec::{decode_i32, CURRENT_SCALE, POWER_SCALE, VOLTAGE_SCALE};
use crate::error::Result;
use crate::link::Link;

/// Which supply a single-phase meter measures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeterKind {
    /// DC supply
    Dc,
    /// AC 110V supply
    Ac110,
    /// AC 220V supply
    Ac220,
}

impl MeterKind {
    /// Reading key prefix
    pub fn as_str(&self) -> &'static str {
        match self {
            MeterKind::Dc => "dc",
            MeterKind::Ac110 => "ac110",
            MeterKind::Ac220 => "ac220",
        }
    }
}

impl fmt::Display for MeterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

async fn read_scaled(link: &Link, address: u16, scale: f64) -> Result<f64> {
    let regs = link.read_holding_registers(address, 2).await?;
    let [hi, lo] = pair(&regs)?;
    let raw = decode_i32(hi, lo);
    Ok(f64::from(raw) / scale)
}

/// One single-phase sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SinglePhaseReading {
    /// V
    pub voltage: Option<f64>,
    /// A
    pub current: Option<f64>,
    /// W
    pub active_power: Option<f64>,
    /// VAR
    pub reactive_power: Option<f64>,
}

/// Single-phase meter driver
#[derive(Debug, Clone)]
pub struct SinglePhasePowerMeter {
    link: Arc<Link>,
    kind: MeterKind,
}

impl SinglePhasePowerMeter {
    const VOLTAGE: u16 = 0x0000;
    const CURRENT: u16 = 0x0002;
    const ACTIVE_POWER: u16 = 0x0004;
    const REACTIVE_POWER: u16 = 0x0006;

    /// Driver of the given kind over `link`
    pub fn new(link: Arc<Link>, kind: MeterKind) -> Self {
        Self { link, kind }
    }

    /// Supply measured
    pub fn kind(&self) -> MeterKind {
        self.kind
    }

    /// Voltage in V
    pub async fn read_voltage(&self) -> Result<f64> {
        read_scaled(&self.link, Self::VOLTAGE, VOLTAGE_SCALE).await
    }

    /// Current in A
    pub async fn read_current(&self) -> Result<f64> {
        read_scaled(&self.link, Self::CURRENT, CURRENT_SCALE).await
    }

    /// Active power in W
    pub async fn read_active_power(&self) -> Result<f64> {
        read_scaled(&self.link, Self::ACTIVE_POWER, POWER_SCALE).await
    }

    /// Reactive power in VAR
    pub async fn read_reactive_power(&self) -> Result<f64> {
        read_scaled(&self.link, Self::REACTIVE_POWER, POWER_SCALE).await
    }

    /// Every field; fails only if every read fails
    pub async fn read_all(&self) -> Result<SinglePhaseReading> {
        let [voltage, current, active_power, reactive_power] = partial([
            self.read_voltage().await,
            self.read_current().await,
            self.read_active_power().await,
            self.read_reactive_power().await,
        ])?;
        debug!(meter = %self.kind, ?voltage, ?current, ?active_power, "Power meter sample");
        Ok(SinglePhaseReading {
            voltage,
            current,
            active_power,
            reactive_power,
        })
    }
}

impl Driver for SinglePhasePowerMeter {
    fn link(&self) -> &Arc<Link> {
        &self.link
    }
}

/// A phase of a three-phase supply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Phase A
    A,
    /// Phase B
    B,
    /// Phase C
    C,
}

/// One three-phase sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThreePhaseReading {
    /// V
    pub voltage_a: Option<f64>,
    /// V
    pub voltage_b: Option<f64>,
    /// V
    pub voltage_c: Option<f64>,
    /// A
    pub current_a: Option<f64>,
    /// A
    pub current_b: Option<f64>,
    /// A
    pub current_c: Option<f64>,
    /// W
    pub total_active_power: Option<f64>,
}

/// Three-phase meter driver
#[derive(Debug, Clone)]
pub struct ThreePhasePowerMeter {
    link: Arc<Link>,
}

impl ThreePhasePowerMeter {
    const TOTAL_ACTIVE_POWER: u16 = 0x000C;

    /// Driver over `link`
    pub fn new(link: Arc<Link>) -> Self {
        Self { link }
    }

    /// Phase voltage in V
    pub async fn read_voltage(&self, phase: Phase) -> Result<f64> {
        let address = match phase {
            Phase::A => 0x0000,
            Phase::B => 0x0002,
            Phase::C => 0x0004,
        };
        read_scaled(&self.link, address, VOLTAGE_SCALE).await
    }

    /// Phase current in A
    pub async fn read_current(&self, phase: Phase) -> Result<f64> {
        let address = match phase {
            Phase::A => 0x0006,
            Phase::B => 0x0008,
            Phase::C => 0x000A,
        };
        read_scaled(&self.link, address, CURRENT_SCALE).await
    }

    /// Total active power in W
    pub async fn read_total_active_power(&self) -> Result<f64> {
        read_scaled(&self.link, Self::TOTAL_ACTIVE_POWER, POWER_SCALE).await
    }

    /// Every field; fails only if every read fails
    pub async fn read_all(&self) -> Result<ThreePhaseReading> {
        let [voltage_a, voltage_b, voltage_c, current_a, current_b, current_c, total_active_power] =
            partial([
                self.read_voltage(Phase::A).await,
                self.read_voltage(Phase::B).await,
                self.read_voltage(Phase::C).await,
                self.read_current(Phase::A).await,
                self.read_current(Phase::B).await,
                self.read_current(Phase::C).await,
                self.read_total_active_power().await,
            ])?;
        Ok(ThreePhaseReading {
            voltage_a,
            voltage_b,
            voltage_c,
            current_a,
            current_b,
            current_c,
            total_active_power,
        })
    }
}

impl Driver for ThreePhasePowerMeter {
    fn link(&self) -> &Arc<Link> {
        &self.link
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::codec::encode_i32;
    use crate::mock::{MockConnector, MockDevice};

    async fn link(device: &Arc<MockDevice>) -> Arc<Link> {
        let link = Link::tcp_with_connector("meter", 1, Duration::from_secs(1), MockConnector::new(device.clone()));
        link.connect().await.unwrap();
        Arc::new(link)
    }

    #[tokio::test]
    async fn test_single_phase_scales() {
        let device = MockDevice::new();
        device.set_holding(0x0000, &encode_i32(22_050));
        device.set_holding(0x0002, &encode_i32(-1_500));
        device.set_holding(0x0004, &encode_i32(33_075));
        device.set_holding(0x0006, &encode_i32(0));
        let meter = SinglePhasePowerMeter::new(link(&device).await, MeterKind::Ac220);

        assert_eq!(meter.read_voltage().await.unwrap(), 220.5);
        assert_eq!(meter.read_current().await.unwrap(), -1.5);
        assert_eq!(meter.read_active_power().await.unwrap(), 330.75);

        let reading = meter.read_all().await.unwrap();
        assert_eq!(reading.reactive_power, Some(0.0));
    }

    #[tokio::test]
    async fn test_three_phase_offsets() {
        let device = MockDevice::new();
        let mut regs = Vec::new();
        for raw in [23_000, 23_100, 23_200, 1_000, 2_000, 3_000, 150_000] {
            regs.extend_from_slice(&encode_i32(raw));
        }
        device.set_holding(0, &regs);
        let meter = ThreePhasePowerMeter::new(link(&device).await);

        let reading = meter.read_all().await.unwrap();
        assert_eq!(reading.voltage_a, Some(230.0));
        assert_eq!(reading.voltage_b, Some(231.0));
        assert_eq!(reading.voltage_c, Some(232.0));
        assert_eq!(reading.current_a, Some(1.0));
        assert_eq!(reading.current_c, Some(3.0));
        assert_eq!(reading.total_active_power, Some(1500.0));
    }

    #[tokio::test]
    async fn test_read_all_fails_only_when_every_field_fails() {
        let device = MockDevice::new();
        let meter = SinglePhasePowerMeter::new(link(&device).await, MeterKind::Dc);

        device.fail_next(3);
        let reading = meter.read_all().await.unwrap();
        assert_eq!(reading.voltage, None);
        assert_eq!(reading.reactive_power, Some(0.0));

        device.set_offline(true);
        assert!(meter.read_all().await.is_err());
    }
}
