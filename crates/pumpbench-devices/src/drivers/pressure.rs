/*!
 * Pressure transmitters, positive and vacuum.
 *
 * Both read the process value at 0x1000 as u16 * 0.1 MPa. The vacuum
 * variant then maps the value to `-p / 1000`, or 0.0 when `p` is not
 * positive. That conversion is reproduced from the instrument integration as
 * found and does not invert the simulator's encoding; do not change it
 * without the transmitter datasheet.
 */
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{single, Driver};
use crate::codec::{decode_u16, MPA_TO_KGCM2, PRESSURE_FACTOR};
use crate::error::Result;
use crate::link::Link;

const PROCESS_VALUE: u16 = 0x1000;

/// Which transmitter a driver talks to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PressureKind {
    /// 0 to 1.0 MPa
    Positive,
    /// 0 to -0.1 MPa
    Vacuum,
}

impl fmt::Display for PressureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PressureKind::Positive => f.write_str("positive"),
            PressureKind::Vacuum => f.write_str("vacuum"),
        }
    }
}

/// One pressure sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PressureReading {
    /// MPa
    pub pressure_mpa: f64,
    /// kg/cm², positive transmitter only
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub pressure_kgcm2: Option<f64>,
    /// kPa, vacuum transmitter only
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub pressure_kpa: Option<f64>,
}

/// Pressure transmitter driver
#[derive(Debug, Clone)]
pub struct PressureSensor {
    link: Arc<Link>,
    kind: PressureKind,
}

impl PressureSensor {
    /// Driver of the given kind over `link`
    pub fn new(link: Arc<Link>, kind: PressureKind) -> Self {
        Self { link, kind }
    }

    /// Transmitter kind
    pub fn kind(&self) -> PressureKind {
        self.kind
    }

    /// Pressure in MPa
    pub async fn read_pressure(&self) -> Result<f64> {
        let regs = self.link.read_holding_registers(PROCESS_VALUE, 1).await?;
        let raw = decode_u16(single(&regs)?);
        let pressure = self.convert(raw);
        debug!(kind = %self.kind, raw, pressure, "Pressure");
        Ok(pressure)
    }

    /// Pressure in kg/cm²
    pub async fn read_pressure_kgcm2(&self) -> Result<f64> {
        Ok(self.read_pressure().await? * MPA_TO_KGCM2)
    }

    /// Pressure with the secondary unit of this transmitter kind
    pub async fn read_all(&self) -> Result<PressureReading> {
        let pressure_mpa = self.read_pressure().await?;
        Ok(match self.kind {
            PressureKind::Positive => PressureReading {
                pressure_mpa,
                pressure_kgcm2: Some(pressure_mpa * MPA_TO_KGCM2),
                pressure_kpa: None,
            },
            PressureKind::Vacuum => PressureReading {
                pressure_mpa,
                pressure_kgcm2: None,
                pressure_kpa: Some(pressure_mpa * 1000.0),
            },
        })
    }

    fn convert(&self, raw: u16) -> f64 {
        let pressure = f64::from(raw) * PRESSURE_FACTOR;
        match self.kind {
            PressureKind::Positive => pressure,
            PressureKind::Vacuum if pressure > 0.0 => -pressure / 1000.0,
            PressureKind::Vacuum => 0.0,
        }
    }
}

impl Driver for PressureSensor {
    fn link(&self) -> &Arc<Link> {
        &self.link
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::mock::{MockConnector, MockDevice};

    async fn sensor(device: &Arc<MockDevice>, kind: PressureKind) -> PressureSensor {
        let link = Link::tcp_with_connector("pressure", 2, Duration::from_secs(1), MockConnector::new(device.clone()));
        let sensor = PressureSensor::new(Arc::new(link), kind);
        sensor.connect().await.unwrap();
        sensor
    }

    #[tokio::test]
    async fn test_positive_pressure() {
        let device = MockDevice::new();
        device.set_holding(0x1000, &[5]);
        let sensor = sensor(&device, PressureKind::Positive).await;

        let pressure = sensor.read_pressure().await.unwrap();
        assert!((pressure - 0.5).abs() < 1e-9);
        let kgcm2 = sensor.read_pressure_kgcm2().await.unwrap();
        assert!((kgcm2 - 5.0986).abs() < 1e-9);

        let reading = sensor.read_all().await.unwrap();
        assert!(reading.pressure_kgcm2.is_some());
        assert!(reading.pressure_kpa.is_none());
    }

    #[tokio::test]
    async fn test_vacuum_conversion() {
        let device = MockDevice::new();
        device.set_holding(0x1000, &[500]);
        let sensor = sensor(&device, PressureKind::Vacuum).await;

        let pressure = sensor.read_pressure().await.unwrap();
        assert!((pressure + 0.05).abs() < 1e-9);
        let reading = sensor.read_all().await.unwrap();
        assert!((reading.pressure_kpa.unwrap() + 50.0).abs() < 1e-9);

        device.set_holding(0x1000, &[0]);
        assert_eq!(sensor.read_pressure().await.unwrap(), 0.0);
    }

    #[test]
    fn test_reading_serializes_only_present_units() {
        let reading = PressureReading {
            pressure_mpa: 0.1,
            pressure_kgcm2: None,
            pressure_kpa: Some(100.0),
        };
        let json = serde_json::to_value(reading).unwrap();
        assert!(json.get("pressure_kgcm2").is_none());
        assert_eq!(json["pressure_kpa"], 100.0);
    }
}
