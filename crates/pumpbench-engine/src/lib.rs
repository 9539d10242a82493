/*!
 * Pumpbench Engine
 *
 * This crate runs the pump test bench: the safety monitor and its
 * watchdog, valve and supply control, sensor polling, and the test state
 * machine with its automation. [`TestBench`] assembles all of them from a
 * configuration.
 */

#![warn(missing_docs)]

// Re-export core types
pub use pumpbench_core::prelude;

pub mod automation;
pub mod bench;
pub mod control;
pub mod error;
pub mod safety;
pub mod sensors;
pub mod state_machine;
pub mod types;
pub mod watchdog;

// Re-export main types for convenience
pub use automation::{AutomationHandle, TestAutomation, TestCommand};
pub use bench::TestBench;
pub use control::{ControlService, PowerCommand, ValveCommand};
pub use error::{Error, Result};
pub use safety::{Heartbeat, SafetyGate, SafetyMonitor, SafetyState};
pub use sensors::{SensorPoller, Sensors, ThrottledPublisher};
pub use state_machine::{AsyncStateHandler, MachineState, StateHandler, StateMachine, TransitionRecord};
pub use types::{TestConfig, TestContext, TestState};
pub use watchdog::Watchdog;

/// Pumpbench engine crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
