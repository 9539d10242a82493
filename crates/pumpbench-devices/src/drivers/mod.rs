/*!
 * Instrument drivers.
 *
 * Each driver wraps one [`Link`] and turns raw registers into physical
 * quantities. Single reads return a `Result`; `read_all` returns whatever
 * subset succeeded and fails only when every underlying read failed.
 */
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{DeviceError, Result};
use crate::link::Link;
use crate::status::DeviceStatus;

pub mod flow_meter;
pub mod power_meter;
pub mod pressure;
pub mod relay_io;

pub use flow_meter::{FlowMeter, FlowReading};
pub use power_meter::{
    MeterKind, Phase, SinglePhasePowerMeter, SinglePhaseReading, ThreePhasePowerMeter, ThreePhaseReading,
};
pub use pressure::{PressureKind, PressureReading, PressureSensor};
pub use relay_io::{PowerSupply, RelayIo, Valve};

/// Common behavior of every driver
#[async_trait]
pub trait Driver: Send + Sync {
    /// The link the driver talks over
    fn link(&self) -> &Arc<Link>;

    /// Connect the underlying link
    async fn connect(&self) -> Result<()> {
        self.link().connect().await
    }

    /// Disconnect the underlying link
    async fn disconnect(&self) {
        self.link().disconnect().await
    }

    /// Whether the underlying link is connected
    fn is_connected(&self) -> bool {
        self.link().is_connected()
    }

    /// Status of the underlying link
    fn status(&self) -> DeviceStatus {
        self.link().status()
    }
}

/// Keep successful values; fail only if nothing succeeded
pub(crate) fn partial<const N: usize>(results: [Result<f64>; N]) -> Result<[Option<f64>; N]> {
    let mut values = [None; N];
    let mut last_error = None;
    for (slot, result) in values.iter_mut().zip(results) {
        match result {
            Ok(value) => *slot = Some(value),
            Err(e) => last_error = Some(e),
        }
    }
    match last_error {
        Some(e) if values.iter().all(Option::is_none) => Err(e),
        _ => Ok(values),
    }
}

/// Two registers or a frame error
pub(crate) fn pair(regs: &[u16]) -> Result<[u16; 2]> {
    match regs {
        [hi, lo, ..] => Ok([*hi, *lo]),
        _ => Err(DeviceError::frame(format!("Expected 2 registers, got {}", regs.len()))),
    }
}

/// One register or a frame error
pub(crate) fn single(regs: &[u16]) -> Result<u16> {
    regs.first()
        .copied()
        .ok_or_else(|| DeviceError::frame("Expected 1 register, got none"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_keeps_successes() {
        let values = partial([Ok(1.0), Err(DeviceError::NotConnected)]).unwrap();
        assert_eq!(values, [Some(1.0), None]);
    }

    #[test]
    fn test_partial_fails_when_nothing_succeeds() {
        let result = partial([Err(DeviceError::NotConnected), Err(DeviceError::timeout("slow"))]);
        assert!(matches!(result, Err(DeviceError::Timeout(_))));
    }

    #[test]
    fn test_register_helpers() {
        assert_eq!(pair(&[1, 2]).unwrap(), [1, 2]);
        assert!(pair(&[1]).is_err());
        assert!(single(&[]).is_err());
    }
}
