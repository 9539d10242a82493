/*!
 * pumpbench devices
 *
 * This crate provides the field-bus side of the bench: the register codec,
 * framed links over TCP and serial lines, the instrument drivers and the
 * RTU-to-TCP bridge.
 */

#![warn(missing_docs)]

pub mod bridge;
pub mod codec;
pub mod drivers;
pub mod error;
pub mod link;
pub mod protocol;
pub mod status;
pub mod transport;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use bridge::{BridgeEndpoint, BridgeSet};
pub use drivers::{
    Driver, FlowMeter, MeterKind, Phase, PowerSupply, PressureKind, PressureSensor, RelayIo,
    SinglePhasePowerMeter, ThreePhasePowerMeter, Valve,
};
pub use error::{DeviceError, Result};
pub use link::Link;
pub use status::{DeviceHealth, DeviceStatus};

/// pumpbench devices crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
