/*!
 * Error types for the pumpbench engine crate.
 */
use thiserror::Error;

/// Error type for engine operations
#[derive(Error, Debug)]
pub enum Error {
    /// State machine error
    #[error("State machine error: {0}")]
    StateMachine(String),

    /// A command arrived in a state that does not accept it
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A safety interlock refused the operation
    #[error("Safety interlock: {0}")]
    SafetyInterlock(String),

    /// Device error
    #[error("Device error: {0}")]
    Device(#[from] pumpbench_devices::DeviceError),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] pumpbench_core::error::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Other error
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a new state machine error
    pub fn state_machine<S: AsRef<str>>(msg: S) -> Self {
        Error::StateMachine(msg.as_ref().to_string())
    }

    /// Create a new invalid state error
    pub fn invalid_state<S: AsRef<str>>(msg: S) -> Self {
        Error::InvalidState(msg.as_ref().to_string())
    }

    /// Create a new safety interlock error
    pub fn safety_interlock<S: AsRef<str>>(msg: S) -> Self {
        Error::SafetyInterlock(msg.as_ref().to_string())
    }

    /// Create a new other error
    pub fn other<S: AsRef<str>>(msg: S) -> Self {
        Error::Other(msg.as_ref().to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_errors_convert() {
        let err: Error = pumpbench_devices::DeviceError::NotConnected.into();
        assert!(matches!(err, Error::Device(_)));
        assert_eq!(Error::safety_interlock("cover open").to_string(), "Safety interlock: cover open");
    }
}
