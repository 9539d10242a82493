/*!
 * Error types for device links, drivers and the bridge.
 */
use thiserror::Error;

use pumpbench_core::error::Error as CoreError;

use crate::protocol::ExceptionCode;

/// Error type for device operations
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The link is unreachable or the transport failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// The device answered with an exception frame
    #[error("Device returned exception: {0}")]
    Protocol(ExceptionCode),

    /// A malformed or unexpected frame was received
    #[error("Frame error: {0}")]
    Frame(String),

    /// A request was rejected before any I/O
    #[error("Validation error: {0}")]
    Validation(String),

    /// The link is not connected
    #[error("Device not connected")]
    NotConnected,

    /// The device did not answer in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// A forwarded bridge request did not complete in time
    #[error("Bridge forward timed out after {0:?}")]
    ForwardTimeout(std::time::Duration),

    /// The port worker of a serial link has gone away
    #[error("Port worker gone: {0}")]
    WorkerGone(String),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),
}

/// Result type for device operations
pub type Result<T> = std::result::Result<T, DeviceError>;

impl DeviceError {
    /// Create a new transport error
    pub fn transport<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Transport(msg.as_ref().to_string())
    }

    /// Create a new frame error
    pub fn frame<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Frame(msg.as_ref().to_string())
    }

    /// Create a new validation error
    pub fn validation<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Validation(msg.as_ref().to_string())
    }

    /// Create a new timeout error
    pub fn timeout<S: AsRef<str>>(msg: S) -> Self {
        DeviceError::Timeout(msg.as_ref().to_string())
    }

    /// Whether the error means the connection itself is unusable
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            DeviceError::Transport(_) | DeviceError::Timeout(_) | DeviceError::Frame(_)
        )
    }
}

impl From<std::io::Error> for DeviceError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                DeviceError::Timeout(err.to_string())
            }
            _ => DeviceError::Transport(err.to_string()),
        }
    }
}

impl From<serialport::Error> for DeviceError {
    fn from(err: serialport::Error) -> Self {
        DeviceError::Transport(err.to_string())
    }
}

impl From<nix::Error> for DeviceError {
    fn from(err: nix::Error) -> Self {
        DeviceError::Transport(err.to_string())
    }
}
