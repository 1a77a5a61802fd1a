// Timeouts, topics, and the configuration source
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

// Runtime loop frequency
pub const LOOP_HZ: u64 = 50;

// Command timeout for the runtime watchdog
pub const CMD_TIMEOUT: Duration = Duration::from_millis(250);

// Nodes silent for longer than this latch the platform fault
pub const DEFAULT_CAN_TIMEOUT: Duration = Duration::from_secs(7);

// Host heartbeat period, well inside the drives' 1 s consumer timeout
pub const HEARTBEAT_PERIOD: Duration = Duration::from_millis(200);

// Zenoh topics
pub const TOPIC_CMD_JOINTS: &str = "base/cmd/joints"; // commands
pub const TOPIC_STATE_JOINTS: &str = "base/state/joints"; // telemetry
pub const TOPIC_HEALTH: &str = "base/state/health"; // health status

// Default platform configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/platform.json";

/// Error types for configuration lookup
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required key [{section}] {key}")]
    Missing { section: String, key: String },

    #[error("Key [{section}] {key} is not a valid {expected}")]
    WrongType {
        section: String,
        key: String,
        expected: &'static str,
    },

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Typed key lookup grouped by section
///
/// Implementors only provide the raw `get_*` accessors; the `required_*`
/// and `optional_*` variants are derived from them.
pub trait ConfigSource {
    /// `Ok(None)` when the key is absent, `Err` when present with the wrong type
    fn get_i64(&self, section: &str, key: &str) -> Result<Option<i64>, ConfigError>;
    fn get_f64(&self, section: &str, key: &str) -> Result<Option<f64>, ConfigError>;
    fn get_bool(&self, section: &str, key: &str) -> Result<Option<bool>, ConfigError>;
    fn get_string(&self, section: &str, key: &str) -> Result<Option<String>, ConfigError>;

    fn required_i64(&self, section: &str, key: &str) -> Result<i64, ConfigError> {
        self.get_i64(section, key)?
            .ok_or_else(|| missing(section, key))
    }

    fn required_f64(&self, section: &str, key: &str) -> Result<f64, ConfigError> {
        self.get_f64(section, key)?
            .ok_or_else(|| missing(section, key))
    }

    fn required_bool(&self, section: &str, key: &str) -> Result<bool, ConfigError> {
        self.get_bool(section, key)?
            .ok_or_else(|| missing(section, key))
    }

    fn required_string(&self, section: &str, key: &str) -> Result<String, ConfigError> {
        self.get_string(section, key)?
            .ok_or_else(|| missing(section, key))
    }

    fn optional_i64(&self, section: &str, key: &str, default: i64) -> Result<i64, ConfigError> {
        Ok(self.get_i64(section, key)?.unwrap_or(default))
    }

    fn optional_f64(&self, section: &str, key: &str, default: f64) -> Result<f64, ConfigError> {
        Ok(self.get_f64(section, key)?.unwrap_or(default))
    }
}

fn missing(section: &str, key: &str) -> ConfigError {
    ConfigError::Missing {
        section: section.to_string(),
        key: key.to_string(),
    }
}

fn wrong_type(section: &str, key: &str, expected: &'static str) -> ConfigError {
    ConfigError::WrongType {
        section: section.to_string(),
        key: key.to_string(),
        expected,
    }
}

/// JSON document of the form `{ "section": { "key": value } }`
#[derive(Debug, Clone)]
pub struct JsonConfig {
    root: Value,
}

impl JsonConfig {
    pub fn from_value(root: Value) -> Self {
        Self { root }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(Self::from_value(serde_json::from_str(&text)?))
    }

    fn lookup(&self, section: &str, key: &str) -> Option<&Value> {
        self.root.get(section)?.get(key)
    }
}

impl ConfigSource for JsonConfig {
    fn get_i64(&self, section: &str, key: &str) -> Result<Option<i64>, ConfigError> {
        match self.lookup(section, key) {
            None => Ok(None),
            Some(v) => v
                .as_i64()
                .map(Some)
                .ok_or_else(|| wrong_type(section, key, "integer")),
        }
    }

    fn get_f64(&self, section: &str, key: &str) -> Result<Option<f64>, ConfigError> {
        match self.lookup(section, key) {
            None => Ok(None),
            Some(v) => v
                .as_f64()
                .map(Some)
                .ok_or_else(|| wrong_type(section, key, "number")),
        }
    }

    fn get_bool(&self, section: &str, key: &str) -> Result<Option<bool>, ConfigError> {
        match self.lookup(section, key) {
            None => Ok(None),
            // Integer flags (0 / 1) are accepted as well
            Some(Value::Number(n)) => n
                .as_i64()
                .map(|i| Some(i != 0))
                .ok_or_else(|| wrong_type(section, key, "bool")),
            Some(v) => v
                .as_bool()
                .map(Some)
                .ok_or_else(|| wrong_type(section, key, "bool")),
        }
    }

    fn get_string(&self, section: &str, key: &str) -> Result<Option<String>, ConfigError> {
        match self.lookup(section, key) {
            None => Ok(None),
            Some(v) => v
                .as_str()
                .map(|s| Some(s.to_string()))
                .ok_or_else(|| wrong_type(section, key, "string")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn source() -> JsonConfig {
        JsonConfig::from_value(json!({
            "geom": { "radius_wheel_mm": 80, "offset": 12.5 },
            "config": { "wheel1_drive_motor": 1, "wheel1_steer_motor": false },
            "bus": { "port": "/dev/ttyACM0" }
        }))
    }

    #[test]
    fn test_required_lookup() {
        let cfg = source();
        assert_eq!(cfg.required_i64("geom", "radius_wheel_mm").unwrap(), 80);
        assert_eq!(cfg.required_f64("geom", "radius_wheel_mm").unwrap(), 80.0);
        assert_eq!(cfg.required_string("bus", "port").unwrap(), "/dev/ttyACM0");
        assert!(cfg.required_bool("config", "wheel1_drive_motor").unwrap());
        assert!(!cfg.required_bool("config", "wheel1_steer_motor").unwrap());
    }

    #[test]
    fn test_missing_required_key_fails() {
        let cfg = source();
        let err = cfg.required_f64("geom", "dist_steer_axis_mm").unwrap_err();
        assert!(matches!(err, ConfigError::Missing { .. }));
        assert!(cfg.required_i64("nope", "radius_wheel_mm").is_err());
    }

    #[test]
    fn test_optional_defaults_and_type_errors() {
        let cfg = source();
        assert_eq!(cfg.optional_f64("geom", "missing", 7.0).unwrap(), 7.0);
        assert_eq!(cfg.optional_f64("geom", "offset", 0.0).unwrap(), 12.5);
        assert!(matches!(
            cfg.optional_i64("geom", "offset", 0),
            Err(ConfigError::WrongType { .. })
        ));
    }
}
