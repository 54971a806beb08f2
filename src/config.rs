use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{IgathaError, Result};
use crate::proximity::{PathLossExponent, MAX_DISTANCE_PRECISION};

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    // ── Threshold detectors ──
    /// 3.0 g ~= dropping the phone on a hard surface
    pub acceleration_threshold_g: f64,
    /// 6.0 rad/s ~= almost a full rotation in one second
    pub rotation_threshold_rad_s: f64,
    /// 0.1 kPa ~= altitude change of 8 to 12 meters
    pub pressure_threshold_kpa: f64,
    pub sensor_update_interval_ms: u64,

    // ── Incident correlation ──
    pub correlation_window_secs: f64,

    // ── Emergency lifecycle ──
    pub confirmation_grace_period_secs: f64,

    // ── Proximity ──
    /// Weight of a new RSSI sample in the moving average
    pub rssi_smoothing_factor: f64,
    pub path_loss_exponent: PathLossExponent,
    /// Calibrated RSSI at 1 meter
    pub tx_power_dbm: f64,
    pub distance_precision: u32,
    pub stale_device_window_secs: f64,

    // ── Radio ──
    pub beacon_service_id: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            acceleration_threshold_g: 3.0,
            rotation_threshold_rad_s: 6.0,
            pressure_threshold_kpa: 0.1,
            sensor_update_interval_ms: 100,
            correlation_window_secs: 1.5,
            confirmation_grace_period_secs: 120.0,
            rssi_smoothing_factor: 0.18,
            path_loss_exponent: PathLossExponent::Urban,
            tx_power_dbm: -59.0,
            distance_precision: 3,
            stale_device_window_secs: 300.0,
            beacon_service_id: "1802".to_string(),
        }
    }
}

impl Config {
    /// Parse and validate a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config = Self::from_toml_str(&text)?;
        log::info!("Loaded config from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("acceleration_threshold_g", self.acceleration_threshold_g),
            ("rotation_threshold_rad_s", self.rotation_threshold_rad_s),
            ("pressure_threshold_kpa", self.pressure_threshold_kpa),
            ("correlation_window_secs", self.correlation_window_secs),
            (
                "confirmation_grace_period_secs",
                self.confirmation_grace_period_secs,
            ),
            ("stale_device_window_secs", self.stale_device_window_secs),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(IgathaError::InvalidConfig(format!(
                    "{name} must be positive, got {value}"
                )));
            }
        }

        if !(self.rssi_smoothing_factor > 0.0 && self.rssi_smoothing_factor <= 1.0) {
            return Err(IgathaError::InvalidConfig(format!(
                "rssi_smoothing_factor must be in (0, 1], got {}",
                self.rssi_smoothing_factor
            )));
        }
        if self.sensor_update_interval_ms == 0 {
            return Err(IgathaError::InvalidConfig(
                "sensor_update_interval_ms must be non-zero".to_string(),
            ));
        }
        if self.distance_precision > MAX_DISTANCE_PRECISION {
            return Err(IgathaError::InvalidConfig(format!(
                "distance_precision must be at most {MAX_DISTANCE_PRECISION}, got {}",
                self.distance_precision
            )));
        }
        if !self.tx_power_dbm.is_finite() {
            return Err(IgathaError::InvalidConfig(
                "tx_power_dbm must be finite".to_string(),
            ));
        }
        if self.beacon_service_id.trim().is_empty() {
            return Err(IgathaError::InvalidConfig(
                "beacon_service_id must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs_f64(self.confirmation_grace_period_secs)
    }

    pub fn sensor_update_interval(&self) -> Duration {
        Duration::from_millis(self.sensor_update_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reference_defaults() {
        let config = Config::default();
        assert_eq!(config.acceleration_threshold_g, 3.0);
        assert_eq!(config.rotation_threshold_rad_s, 6.0);
        assert_eq!(config.pressure_threshold_kpa, 0.1);
        assert_eq!(config.correlation_window_secs, 1.5);
        assert_eq!(config.grace_period(), Duration::from_secs(120));
        assert_eq!(config.rssi_smoothing_factor, 0.18);
        assert_eq!(config.path_loss_exponent, PathLossExponent::Urban);
        assert_eq!(config.stale_device_window_secs, 300.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            correlation_window_secs = 2.0
            path_loss_exponent = "indoor"
            "#,
        )
        .unwrap();
        assert_eq!(config.correlation_window_secs, 2.0);
        assert_eq!(config.path_loss_exponent, PathLossExponent::Indoor);
        assert_eq!(config.acceleration_threshold_g, 3.0);
    }

    #[test]
    fn test_rejects_unknown_keys() {
        let err = Config::from_toml_str("not_a_setting = 1").unwrap_err();
        assert!(matches!(err, IgathaError::ConfigParse(_)));
    }

    #[test]
    fn test_rejects_invalid_values() {
        let err = Config::from_toml_str("rssi_smoothing_factor = 1.5").unwrap_err();
        assert!(matches!(err, IgathaError::InvalidConfig(_)));

        let err = Config::from_toml_str("correlation_window_secs = 0.0").unwrap_err();
        assert!(matches!(err, IgathaError::InvalidConfig(_)));

        let err = Config::from_toml_str("sensor_update_interval_ms = 0").unwrap_err();
        assert!(matches!(err, IgathaError::InvalidConfig(_)));

        let err = Config::from_toml_str("distance_precision = 400").unwrap_err();
        assert!(matches!(err, IgathaError::InvalidConfig(_)));
        assert!(Config::from_toml_str("distance_precision = 12").is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("igatha.toml");
        std::fs::write(&path, "confirmation_grace_period_secs = 30.0\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.grace_period(), Duration::from_secs(30));
    }
}
