use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::clock::{Clock, Timestamp};
use crate::emergency::EmergencyManager;

/// Physical channel behind a threshold detector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Acceleration,
    Rotation,
    PressureDelta,
}

impl SensorKind {
    pub const ALL: [SensorKind; 3] = [
        SensorKind::Acceleration,
        SensorKind::Rotation,
        SensorKind::PressureDelta,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            SensorKind::Acceleration => "accel",
            SensorKind::Rotation => "gyro",
            SensorKind::PressureDelta => "baro",
        }
    }
}

impl std::fmt::Display for SensorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Raw reading as delivered by a platform sensor.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Reading {
    /// 3-axis vector: g-units for acceleration, rad/s for rotation
    Motion(Vector3<f64>),
    /// Absolute pressure in kPa
    Pressure(f64),
}

impl Reading {
    pub fn motion(x: f64, y: f64, z: f64) -> Self {
        Reading::Motion(Vector3::new(x, y, z))
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SensorSample {
    pub kind: SensorKind,
    pub reading: Reading,
    pub timestamp: Timestamp,
}

impl SensorSample {
    pub fn new(kind: SensorKind, reading: Reading, timestamp: Timestamp) -> Self {
        Self {
            kind,
            reading,
            timestamp,
        }
    }
}

/// Platform adapter for one physical sensor.
pub trait SensorSource: Send + Sync {
    fn kind(&self) -> SensorKind;

    fn is_available(&self) -> bool;

    /// Latest reading, or None if nothing new is ready.
    fn read(&self) -> Option<Reading>;
}

/// Polls `source` at `period` and feeds the emergency manager until `shutdown` flips.
///
/// Availability transitions are forwarded as they are observed; readings are
/// only taken while the source reports itself available.
pub async fn sample_loop(
    source: Arc<dyn SensorSource>,
    manager: EmergencyManager,
    clock: Arc<dyn Clock>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> u64 {
    let kind = source.kind();
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sample_count = 0u64;
    let mut last_available = None;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        let available = source.is_available();
        if last_available != Some(available) {
            manager.set_sensor_availability(kind, available);
            last_available = Some(available);
        }
        if !available {
            continue;
        }

        if let Some(reading) = source.read() {
            manager.observe_sample(SensorSample::new(kind, reading, clock.now()));
            sample_count += 1;
            if sample_count % 500 == 0 {
                log::debug!("[{}] {} samples", kind, sample_count);
            }
        }
    }

    log::info!("[{}] sampling stopped after {} samples", kind, sample_count);
    sample_count
}
