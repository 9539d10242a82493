/*!
 * Message bus topics.
 */

/// Flow meter readings
pub const SENSOR_FLOW: &str = "pump/sensors/flow";
/// Positive pressure readings
pub const SENSOR_PRESSURE_POSITIVE: &str = "pump/sensors/pressure/positive";
/// Vacuum pressure readings
pub const SENSOR_PRESSURE_VACUUM: &str = "pump/sensors/pressure/vacuum";
/// DC power meter readings
pub const SENSOR_POWER_DC: &str = "pump/sensors/power/dc";
/// AC 110V power meter readings
pub const SENSOR_POWER_AC110: &str = "pump/sensors/power/ac110";
/// AC 220V power meter readings
pub const SENSOR_POWER_AC220: &str = "pump/sensors/power/ac220";
/// AC 220V three-phase power meter readings
pub const SENSOR_POWER_AC220_3P: &str = "pump/sensors/power/ac220_3p";

/// Valve commands and their results
pub const CONTROL_VALVE: &str = "pump/control/valve";
/// Power commands and their results
pub const CONTROL_POWER: &str = "pump/control/power";
/// Test sequencing commands
pub const CONTROL_TEST: &str = "pump/control/test";

/// Sampled safety state
pub const SAFETY_STATUS: &str = "pump/safety/status";
/// Safety and watchdog alerts
pub const SAFETY_ALERT: &str = "pump/system/alert";

/// Overall system status
pub const SYSTEM_STATUS: &str = "pump/system/status";
/// Link health reports
pub const SYSTEM_HEALTH: &str = "pump/system/health";

/// Test records
pub const TEST_RECORD: &str = "pump/test/record";
/// Test sequencing status
pub const TEST_STATUS: &str = "pump/test/status";

/// Every sensor topic, in publish order
pub const SENSOR_TOPICS: [&str; 7] = [
    SENSOR_FLOW,
    SENSOR_PRESSURE_POSITIVE,
    SENSOR_PRESSURE_VACUUM,
    SENSOR_POWER_DC,
    SENSOR_POWER_AC110,
    SENSOR_POWER_AC220,
    SENSOR_POWER_AC220_3P,
];
