/*!
 * Core data types for pumpbench.
 */
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Seconds since the Unix epoch as a float, the timestamp format of bus payloads
pub fn unix_timestamp() -> f64 {
    to_unix_seconds(Utc::now())
}

/// Convert a UTC time to fractional Unix seconds
pub fn to_unix_seconds(time: DateTime<Utc>) -> f64 {
    time.timestamp_millis() as f64 / 1000.0
}

/// One flat sample of every measured quantity, keyed by column name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Sample time
    pub timestamp: DateTime<Utc>,
    /// Column values; absent columns were not measured this tick
    pub values: BTreeMap<String, f64>,
}

impl Reading {
    /// Create an empty reading stamped with the current time
    pub fn now() -> Self {
        Self {
            timestamp: Utc::now(),
            values: BTreeMap::new(),
        }
    }

    /// Set one column
    pub fn set<S: Into<String>>(&mut self, key: S, value: f64) -> &mut Self {
        self.values.insert(key.into(), value);
        self
    }

    /// Set one column if a value is present
    pub fn set_opt<S: Into<String>>(&mut self, key: S, value: Option<f64>) -> &mut Self {
        if let Some(value) = value {
            self.values.insert(key.into(), value);
        }
        self
    }

    /// Get one column
    pub fn get(&self, key: &str) -> Option<f64> {
        self.values.get(key).copied()
    }

    /// Whether no column was measured
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Flatten into a JSON object with a `timestamp` field
    pub fn to_json(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert("timestamp".into(), serde_json::json!(to_unix_seconds(self.timestamp)));
        for (key, value) in &self.values {
            map.insert(key.clone(), serde_json::json!(value));
        }
        serde_json::Value::Object(map)
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reading@{} ({} values)", self.timestamp, self.values.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reading_columns() {
        let mut reading = Reading::now();
        assert!(reading.is_empty());

        reading
            .set("flow_instantaneous", 50.0)
            .set_opt("pressure_vacuum", None)
            .set_opt("pressure_positive", Some(0.5));

        assert_eq!(reading.get("flow_instantaneous"), Some(50.0));
        assert_eq!(reading.get("pressure_vacuum"), None);
        assert_eq!(reading.values.len(), 2);

        let json = reading.to_json();
        assert_eq!(json["pressure_positive"], 0.5);
        assert!(json["timestamp"].as_f64().unwrap() > 0.0);
    }

    #[test]
    fn test_unix_seconds() {
        let time = DateTime::parse_from_rfc3339("2024-01-01T00:00:01.500Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(to_unix_seconds(time), 1_704_067_201.5);
    }
}
