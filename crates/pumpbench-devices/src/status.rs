/*!
 * Link health bookkeeping.
 */
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Consecutive failures after which a link is unhealthy
pub const UNHEALTHY_AFTER: u32 = 5;
/// Consecutive failures after which a link is degraded
pub const DEGRADED_AFTER: u32 = 2;

/// Coarse health of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceHealth {
    /// Answering normally
    Healthy,
    /// A few consecutive failures
    Degraded,
    /// Many consecutive failures
    Unhealthy,
    /// Not connected
    Offline,
}

impl fmt::Display for DeviceHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceHealth::Healthy => "healthy",
            DeviceHealth::Degraded => "degraded",
            DeviceHealth::Unhealthy => "unhealthy",
            DeviceHealth::Offline => "offline",
        };
        f.write_str(name)
    }
}

/// Request counters and health of one link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Current health
    pub health: DeviceHealth,
    /// Failures since the last success
    pub consecutive_errors: u32,
    /// Failures overall
    pub error_count: u64,
    /// Requests overall
    pub total_requests: u64,
    /// Successful requests overall
    pub successful_requests: u64,
    /// Time of the last success
    pub last_success_time: Option<DateTime<Utc>>,
    /// Time of the last failure
    pub last_error_time: Option<DateTime<Utc>>,
    /// Message of the last failure
    pub last_error: Option<String>,
}

impl Default for DeviceStatus {
    fn default() -> Self {
        Self {
            health: DeviceHealth::Offline,
            consecutive_errors: 0,
            error_count: 0,
            total_requests: 0,
            successful_requests: 0,
            last_success_time: None,
            last_error_time: None,
            last_error: None,
        }
    }
}

impl DeviceStatus {
    /// Record a successful request
    pub(crate) fn record_success(&mut self) {
        self.total_requests += 1;
        self.successful_requests += 1;
        self.consecutive_errors = 0;
        self.last_success_time = Some(Utc::now());
        self.health = DeviceHealth::Healthy;
    }

    /// Record a failed request
    pub(crate) fn record_error<S: AsRef<str>>(&mut self, message: S) {
        self.total_requests += 1;
        self.error_count += 1;
        self.consecutive_errors += 1;
        self.last_error_time = Some(Utc::now());
        self.last_error = Some(message.as_ref().to_string());

        if self.consecutive_errors >= UNHEALTHY_AFTER {
            self.health = DeviceHealth::Unhealthy;
        } else if self.consecutive_errors >= DEGRADED_AFTER {
            self.health = DeviceHealth::Degraded;
        }
    }

    /// Record a successful connect
    pub(crate) fn record_connected(&mut self) {
        self.consecutive_errors = 0;
        self.last_success_time = Some(Utc::now());
        self.health = DeviceHealth::Healthy;
    }

    /// Record a failed connect; the link stays offline
    pub(crate) fn record_connect_error<S: AsRef<str>>(&mut self, message: S) {
        self.error_count += 1;
        self.last_error_time = Some(Utc::now());
        self.last_error = Some(message.as_ref().to_string());
    }

    /// Record a disconnect
    pub(crate) fn record_offline(&mut self) {
        self.health = DeviceHealth::Offline;
    }

    /// Fraction of requests that succeeded, 0.0 before the first request
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }

    /// Whether the link currently answers
    pub fn is_available(&self) -> bool {
        matches!(self.health, DeviceHealth::Healthy | DeviceHealth::Degraded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_status_is_offline() {
        let status = DeviceStatus::default();
        assert_eq!(status.health, DeviceHealth::Offline);
        assert_eq!(status.success_rate(), 0.0);
        assert!(!status.is_available());
    }

    #[test]
    fn test_error_thresholds() {
        let mut status = DeviceStatus::default();
        status.record_connected();

        status.record_error("timeout");
        assert_eq!(status.health, DeviceHealth::Healthy);
        status.record_error("timeout");
        assert_eq!(status.health, DeviceHealth::Degraded);
        status.record_error("timeout");
        status.record_error("timeout");
        assert_eq!(status.health, DeviceHealth::Degraded);
        status.record_error("timeout");
        assert_eq!(status.health, DeviceHealth::Unhealthy);
        assert_eq!(status.consecutive_errors, 5);

        status.record_success();
        assert_eq!(status.consecutive_errors, 0);
        assert_eq!(status.health, DeviceHealth::Healthy);
        assert_eq!(status.error_count, 5);
        assert_eq!(status.total_requests, 6);
        assert!((status.success_rate() - 1.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_status_serializes_lowercase_health() {
        let json = serde_json::to_value(DeviceStatus::default()).unwrap();
        assert_eq!(json["health"], "offline");
    }
}
