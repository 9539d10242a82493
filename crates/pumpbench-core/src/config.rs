/*!
 * Configuration management for pumpbench.
 *
 * This module provides functionality to load, validate, and access configuration
 * settings for the bench: device links, safety cadence, watchdog limits, sensor
 * polling, test sequencing delays and the RTU bridge set.
 */
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config as ConfigLib, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Well-known device names used by the bench
pub mod devices {
    /// Flow meter
    pub const FLOW_METER: &str = "flow_meter";
    /// DC power meter
    pub const DC_METER: &str = "dc_meter";
    /// AC 110V power meter
    pub const AC110V_METER: &str = "ac110v_meter";
    /// AC 220V power meter
    pub const AC220V_METER: &str = "ac220v_meter";
    /// AC 220V three-phase power meter
    pub const AC220V_3P_METER: &str = "ac220v_3p_meter";
    /// Positive pressure sensor
    pub const PRESSURE_POSITIVE: &str = "pressure_positive";
    /// Vacuum pressure sensor
    pub const PRESSURE_VACUUM: &str = "pressure_vacuum";
    /// Relay I/O module
    pub const RELAY_IO: &str = "relay_io";
}

/// Core configuration for pumpbench
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// General configuration
    #[serde(default)]
    pub general: GeneralConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Device links keyed by device name
    #[serde(default = "default_devices")]
    pub devices: HashMap<String, LinkConfig>,

    /// Safety monitor configuration
    #[serde(default)]
    pub safety: SafetyConfig,

    /// Watchdog configuration
    #[serde(default)]
    pub watchdog: WatchdogConfig,

    /// Sensor polling configuration
    #[serde(default)]
    pub sensors: SensorsConfig,

    /// Test automation configuration
    #[serde(default)]
    pub automation: AutomationConfig,

    /// RTU-to-TCP bridges
    #[serde(default = "default_bridges")]
    pub bridges: Vec<BridgeConfig>,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub app_name: String,

    /// Data directory, test records are written below it
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to use JSON format for logs
    #[serde(default)]
    pub json_format: bool,

    /// Whether to include the event target in log lines
    #[serde(default = "default_true")]
    pub with_target: bool,
}

/// Serial line parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit
    #[serde(alias = "N")]
    None,
    /// Even parity
    #[serde(alias = "E")]
    Even,
    /// Odd parity
    #[serde(alias = "O")]
    Odd,
}

impl Default for Parity {
    fn default() -> Self {
        Parity::None
    }
}

/// UART framing parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UartConfig {
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Parity
    #[serde(default)]
    pub parity: Parity,

    /// Data bits (5-8)
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,

    /// Stop bits (1 or 2)
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
}

impl UartConfig {
    /// Create a UART config with the given baud rate and parity, 8 data bits and 1 stop bit
    pub fn new(baud_rate: u32, parity: Parity) -> Self {
        Self {
            baud_rate,
            parity,
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
        }
    }

    /// Duration of one character on the line, used to size inter-frame gaps
    pub fn char_time(&self) -> Duration {
        let parity_bits = if self.parity == Parity::None { 0 } else { 1 };
        let bits = 1 + u64::from(self.data_bits) + parity_bits + u64::from(self.stop_bits);
        Duration::from_micros(bits * 1_000_000 / u64::from(self.baud_rate.max(1)))
    }
}

impl Default for UartConfig {
    fn default() -> Self {
        Self::new(default_baud_rate(), Parity::None)
    }
}

/// Transport of a device link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Modbus TCP
    Tcp {
        /// Host name or address
        host: String,
        /// TCP port
        port: u16,
    },
    /// Modbus RTU over a serial line
    Serial {
        /// Serial device path
        path: String,
        /// UART framing
        #[serde(default)]
        uart: UartConfig,
    },
}

impl TransportConfig {
    /// Human readable endpoint, used in logs
    pub fn endpoint(&self) -> String {
        match self {
            TransportConfig::Tcp { host, port } => format!("{}:{}", host, port),
            TransportConfig::Serial { path, uart } => {
                format!("{}@{}", path, uart.baud_rate)
            }
        }
    }
}

/// Configuration of one device link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkConfig {
    /// Device (slave) id on the bus
    pub unit_id: u8,

    /// Per-request timeout in milliseconds
    #[serde(default = "default_link_timeout_ms")]
    pub timeout_ms: u64,

    /// Transport
    pub transport: TransportConfig,
}

impl LinkConfig {
    /// Link to a TCP-hosted device
    pub fn tcp<S: AsRef<str>>(host: S, port: u16, unit_id: u8) -> Self {
        Self {
            unit_id,
            timeout_ms: default_link_timeout_ms(),
            transport: TransportConfig::Tcp {
                host: host.as_ref().to_string(),
                port,
            },
        }
    }

    /// Link to a serial device
    pub fn serial<S: AsRef<str>>(path: S, uart: UartConfig, unit_id: u8) -> Self {
        Self {
            unit_id,
            timeout_ms: default_link_timeout_ms(),
            transport: TransportConfig::Serial {
                path: path.as_ref().to_string(),
                uart,
            },
        }
    }

    /// Per-request timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Safety monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyConfig {
    /// Sampling period in milliseconds
    #[serde(default = "default_safety_period_ms")]
    pub period_ms: u64,

    /// Capacity of the sampled-state queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Bound on joining the sampling thread at shutdown, in milliseconds
    #[serde(default = "default_join_timeout_ms")]
    pub join_timeout_ms: u64,
}

/// Watchdog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Heartbeat age that triggers the fail-safe, in milliseconds
    #[serde(default = "default_watchdog_timeout_ms")]
    pub timeout_ms: u64,

    /// Poll interval in milliseconds
    #[serde(default = "default_watchdog_poll_ms")]
    pub poll_ms: u64,

    /// Bound on the fail-safe relay write, in milliseconds
    #[serde(default = "default_failsafe_timeout_ms")]
    pub failsafe_timeout_ms: u64,
}

/// Sensor polling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorsConfig {
    /// Poll interval in milliseconds
    #[serde(default = "default_sensor_poll_ms")]
    pub poll_ms: u64,

    /// Minimum interval between two publishes on one topic, in milliseconds
    #[serde(default = "default_min_publish_interval_ms")]
    pub min_publish_interval_ms: u64,
}

/// Test automation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutomationConfig {
    /// Delay at the end of initialization
    #[serde(default = "default_init_delay_ms")]
    pub init_delay_ms: u64,

    /// Delay before an auto-started test begins running
    #[serde(default = "default_ready_delay_ms")]
    pub ready_delay_ms: u64,

    /// Delay before a completed test returns to idle
    #[serde(default = "default_completed_delay_ms")]
    pub completed_delay_ms: u64,

    /// Delay before a stopped test returns to idle
    #[serde(default = "default_stopped_delay_ms")]
    pub stopped_delay_ms: u64,

    /// Progress publish interval in seconds
    #[serde(default = "default_progress_interval_s")]
    pub progress_interval_s: u64,

    /// Test duration used when a test config does not give one
    #[serde(default = "default_duration_s")]
    pub default_duration_s: i64,
}

/// One RTU-to-TCP bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Path at which the virtual serial endpoint is published
    pub path: String,

    /// Host of the TCP-hosted device
    #[serde(default = "default_host")]
    pub tcp_host: String,

    /// Port of the TCP-hosted device
    pub tcp_port: u16,

    /// Unit id served on the serial side and addressed on the TCP side
    pub unit_id: u8,

    /// UART framing of the serial side
    #[serde(default)]
    pub uart: UartConfig,

    /// Bound on one forwarded request, in milliseconds
    #[serde(default = "default_forward_timeout_ms")]
    pub forward_timeout_ms: u64,
}

impl BridgeConfig {
    /// Link configuration for the TCP side of this bridge
    pub fn target(&self) -> LinkConfig {
        LinkConfig::tcp(&self.tcp_host, self.tcp_port, self.unit_id)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            logging: LoggingConfig::default(),
            devices: default_devices(),
            safety: SafetyConfig::default(),
            watchdog: WatchdogConfig::default(),
            sensors: SensorsConfig::default(),
            automation: AutomationConfig::default(),
            bridges: default_bridges(),
        }
    }
}

impl Config {
    /// Look up the link configuration of a device
    pub fn device(&self, name: &str) -> Result<&LinkConfig> {
        self.devices
            .get(name)
            .ok_or_else(|| Error::config(format!("No link configured for device '{}'", name)))
    }

    /// Render the configuration as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
            with_target: true,
        }
    }
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            period_ms: default_safety_period_ms(),
            queue_capacity: default_queue_capacity(),
            join_timeout_ms: default_join_timeout_ms(),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_watchdog_timeout_ms(),
            poll_ms: default_watchdog_poll_ms(),
            failsafe_timeout_ms: default_failsafe_timeout_ms(),
        }
    }
}

impl Default for SensorsConfig {
    fn default() -> Self {
        Self {
            poll_ms: default_sensor_poll_ms(),
            min_publish_interval_ms: default_min_publish_interval_ms(),
        }
    }
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            init_delay_ms: default_init_delay_ms(),
            ready_delay_ms: default_ready_delay_ms(),
            completed_delay_ms: default_completed_delay_ms(),
            stopped_delay_ms: default_stopped_delay_ms(),
            progress_interval_s: default_progress_interval_s(),
            default_duration_s: default_duration_s(),
        }
    }
}

fn default_app_name() -> String {
    "pumpbench".to_string()
}

fn default_data_dir() -> String {
    "./data/test_records".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_link_timeout_ms() -> u64 {
    1000
}

fn default_safety_period_ms() -> u64 {
    10
}

fn default_queue_capacity() -> usize {
    100
}

fn default_join_timeout_ms() -> u64 {
    1000
}

fn default_watchdog_timeout_ms() -> u64 {
    500
}

fn default_watchdog_poll_ms() -> u64 {
    100
}

fn default_failsafe_timeout_ms() -> u64 {
    1000
}

fn default_sensor_poll_ms() -> u64 {
    1000
}

fn default_min_publish_interval_ms() -> u64 {
    100
}

fn default_init_delay_ms() -> u64 {
    500
}

fn default_ready_delay_ms() -> u64 {
    1000
}

fn default_completed_delay_ms() -> u64 {
    2000
}

fn default_stopped_delay_ms() -> u64 {
    1000
}

fn default_progress_interval_s() -> u64 {
    10
}

fn default_duration_s() -> i64 {
    60
}

fn default_forward_timeout_ms() -> u64 {
    2000
}

/// The simulator device set on localhost
fn default_devices() -> HashMap<String, LinkConfig> {
    [
        (devices::FLOW_METER, 5020, 1),
        (devices::DC_METER, 5021, 1),
        (devices::AC110V_METER, 5022, 2),
        (devices::AC220V_METER, 5023, 3),
        (devices::AC220V_3P_METER, 5024, 4),
        (devices::PRESSURE_POSITIVE, 5025, 2),
        (devices::PRESSURE_VACUUM, 5026, 3),
        (devices::RELAY_IO, 5027, 1),
    ]
    .into_iter()
    .map(|(name, port, unit_id)| (name.to_string(), LinkConfig::tcp(default_host(), port, unit_id)))
    .collect()
}

fn default_bridges() -> Vec<BridgeConfig> {
    [
        ("/dev/ttySIM0", 5021, 1, 57600, Parity::None),
        ("/dev/ttySIM0_1", 5022, 2, 57600, Parity::None),
        ("/dev/ttySIM0_2", 5023, 3, 57600, Parity::None),
        ("/dev/ttySIM0_3", 5024, 4, 57600, Parity::None),
        ("/dev/ttySIM1", 5020, 1, 19200, Parity::None),
        ("/dev/ttySIM2", 5027, 1, 115200, Parity::None),
        ("/dev/ttySIM3", 5025, 2, 19200, Parity::Even),
        ("/dev/ttySIM3_1", 5026, 3, 19200, Parity::Even),
    ]
    .into_iter()
    .map(|(path, tcp_port, unit_id, baud_rate, parity)| BridgeConfig {
        path: path.to_string(),
        tcp_host: default_host(),
        tcp_port,
        unit_id,
        uart: UartConfig::new(baud_rate, parity),
        forward_timeout_ms: default_forward_timeout_ms(),
    })
    .collect()
}

/// A builder for creating a configuration
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config_file: Option<String>,
    environment_prefix: Option<String>,
    override_with: Option<Config>,
}

impl ConfigBuilder {
    /// Create a new ConfigBuilder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the config file path
    pub fn with_config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_file = Some(path.as_ref().to_string_lossy().to_string());
        self
    }

    /// Set the environment variable prefix for configuration
    pub fn with_environment_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.environment_prefix = Some(prefix.as_ref().to_string());
        self
    }

    /// Override with an existing config
    pub fn override_with(mut self, config: Config) -> Self {
        self.override_with = Some(config);
        self
    }

    /// Build the configuration
    pub fn build(self) -> Result<Config> {
        if let Some(config) = self.override_with {
            return Ok(config);
        }

        let default_config = Config::default();
        let mut config_builder = ConfigLib::builder().add_source(
            ConfigLib::try_from(&default_config)
                .map_err(|e| Error::config(format!("Failed to create default config: {}", e)))?,
        );

        if let Some(config_file) = self.config_file {
            let path = Path::new(&config_file);
            if path.exists() {
                debug!("Loading configuration from {}", config_file);
                config_builder = config_builder.add_source(File::with_name(&config_file));
            } else {
                debug!("Configuration file {} does not exist, using defaults", config_file);
            }
        }

        if let Some(prefix) = self.environment_prefix {
            debug!("Loading configuration from environment variables with prefix {}", prefix);
            config_builder = config_builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config: Config = config_builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build configuration: {}", e)))?
            .try_deserialize()
            .map_err(|e| Error::config(format!("Failed to deserialize configuration: {}", e)))?;

        config.validate()?;
        info!(devices = config.devices.len(), bridges = config.bridges.len(), "Configuration loaded");
        Ok(config)
    }
}

impl Config {
    /// Reject settings the bench cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.safety.period_ms == 0 {
            return Err(Error::config("safety.period_ms must be positive"));
        }
        if self.safety.queue_capacity == 0 {
            return Err(Error::config("safety.queue_capacity must be positive"));
        }
        if self.watchdog.poll_ms == 0 || self.watchdog.timeout_ms <= self.watchdog.poll_ms {
            return Err(Error::config(
                "watchdog.timeout_ms must be larger than a positive watchdog.poll_ms",
            ));
        }
        for (name, link) in &self.devices {
            if let TransportConfig::Serial { uart, .. } = &link.transport {
                if !(5..=8).contains(&uart.data_bits) || !(1..=2).contains(&uart.stop_bits) {
                    return Err(Error::config(format!("Invalid UART framing for device '{}'", name)));
                }
            }
        }
        Ok(())
    }
}

/// A thread-safe reference to a configuration
#[derive(Debug, Clone)]
pub struct SharedConfig(Arc<Config>);

impl SharedConfig {
    /// Create a new SharedConfig
    pub fn new(config: Config) -> Self {
        Self(Arc::new(config))
    }

    /// Get a reference to the config
    pub fn get(&self) -> &Config {
        &self.0
    }
}

impl From<Config> for SharedConfig {
    fn from(config: Config) -> Self {
        Self::new(config)
    }
}

impl AsRef<Config> for SharedConfig {
    fn as_ref(&self) -> &Config {
        self.get()
    }
}
