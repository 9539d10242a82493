/*!
 * Prelude module for pumpbench core.
 *
 * This module re-exports commonly used types and functions from the core crate
 * to make them easier to import.
 */

// Re-export error types
pub use crate::error::{Error, Result};

// Re-export core types
pub use crate::types::{unix_timestamp, Reading};

// Re-export bus types
pub use crate::event::{BusMessage, BusReceiver, DynBus, EventBus, MessageBus, SharedEventBus};

// Re-export record sinks
pub use crate::record::{CsvRecordSink, MemoryRecordSink, NullRecordSink, RecordSink};

// Re-export config types
pub use crate::config::{Config, ConfigBuilder, LinkConfig, SharedConfig};

// Re-export utility functions
pub use crate::utils::{retry_blocking, spawn_and_log, with_timeout};

pub use tracing::{debug, error, info, trace, warn};
