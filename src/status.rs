use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::clock::Timestamp;
use crate::emergency::{Availability, EmergencyManager, EmergencyState};
use crate::error::Result;
use crate::proximity::{DeviceView, ProximityTracker};
use crate::sensors::SensorKind;

/// Point-in-time view of the whole safety core, written as JSON for dashboards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    /// Wall-clock capture time, RFC 3339
    pub generated_at: String,
    /// Monotonic time of capture
    pub monotonic_secs: Timestamp,
    pub state: EmergencyState,
    pub availability: Availability,
    pub detection_enabled: bool,
    pub incidents_detected: u64,
    pub accel_exceeded: u64,
    pub gyro_exceeded: u64,
    pub baro_exceeded: u64,
    pub confirmation_deadline: Option<Timestamp>,
    pub devices_total: usize,
    pub devices_fresh: usize,
    pub devices: Vec<DeviceView>,
}

impl StatusSnapshot {
    pub fn capture(manager: &EmergencyManager, tracker: &ProximityTracker, now: Timestamp) -> Self {
        let devices = tracker.devices(now);
        Self {
            generated_at: Utc::now().to_rfc3339(),
            monotonic_secs: now,
            state: manager.state(),
            availability: manager.availability(),
            detection_enabled: manager.is_detection_enabled(),
            incidents_detected: manager.incident_count(),
            accel_exceeded: manager.exceeded_count(SensorKind::Acceleration),
            gyro_exceeded: manager.exceeded_count(SensorKind::Rotation),
            baro_exceeded: manager.exceeded_count(SensorKind::PressureDelta),
            confirmation_deadline: manager.confirmation_deadline(),
            devices_total: devices.len(),
            devices_fresh: devices.iter().filter(|d| !d.stale).count(),
            devices,
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}
