use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::clock::Timestamp;
use crate::config::Config;
use crate::detector::ThresholdDetector;
use crate::sensors::{SensorKind, SensorSample};

/// A single threshold crossing on one channel.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExceededEvent {
    pub kind: SensorKind,
    pub occurred_at: Timestamp,
    pub magnitude: f64,
}

/// All three channels crossed their thresholds within the correlation window.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub detected_at: Timestamp,
    /// Per-kind time of the crossing that completed the set
    pub triggers: Vec<(SensorKind, Timestamp)>,
}

impl Incident {
    /// Time between the earliest and latest contributing crossing.
    pub fn spread(&self) -> f64 {
        let times = self.triggers.iter().map(|(_, t)| *t);
        let first = times.clone().fold(f64::INFINITY, f64::min);
        let last = times.fold(f64::NEG_INFINITY, f64::max);
        if first.is_finite() && last.is_finite() {
            last - first
        } else {
            0.0
        }
    }
}

// ─── Correlator ──────────────────────────────────────────────────────────────

/// Fuses exceeded-events into incidents by temporal correlation.
///
/// Keeps only the most recent crossing per kind. Entries older than the window
/// are retained (not evicted) so a fresh pair can still combine with a later
/// third crossing; the map is cleared only when an incident fires.
#[derive(Clone, Debug)]
pub struct IncidentCorrelator {
    window: f64,
    last_seen: HashMap<SensorKind, Timestamp>,
}

impl IncidentCorrelator {
    pub fn new(window_secs: f64) -> Self {
        Self {
            window: window_secs,
            last_seen: HashMap::with_capacity(SensorKind::ALL.len()),
        }
    }

    pub fn window(&self) -> f64 {
        self.window
    }

    pub fn last_seen(&self, kind: SensorKind) -> Option<Timestamp> {
        self.last_seen.get(&kind).copied()
    }

    pub fn recorded(&self) -> usize {
        self.last_seen.len()
    }

    pub fn clear(&mut self) {
        self.last_seen.clear();
    }

    /// Records the event then checks for an incident as of `now`.
    pub fn on_exceeded(&mut self, event: &ExceededEvent, now: Timestamp) -> Option<Incident> {
        self.last_seen.insert(event.kind, event.occurred_at);
        self.check_for_incident(now)
    }

    fn check_for_incident(&mut self, now: Timestamp) -> Option<Incident> {
        if self.last_seen.len() < SensorKind::ALL.len() {
            return None;
        }

        if self
            .last_seen
            .values()
            .any(|&seen| now - seen > self.window)
        {
            return None;
        }

        let mut triggers: Vec<(SensorKind, Timestamp)> =
            self.last_seen.drain().collect();
        triggers.sort_by_key(|(kind, _)| *kind);
        Some(Incident {
            detected_at: now,
            triggers,
        })
    }
}

// ─── Detector set ────────────────────────────────────────────────────────────

/// The three threshold detectors and the correlator behind one entry point.
///
/// Owned by the emergency manager under a single lock, so samples arriving
/// concurrently from the three channels are serialized here.
#[derive(Clone, Debug)]
pub struct IncidentDetector {
    detectors: [ThresholdDetector; 3],
    correlator: IncidentCorrelator,
    available: HashMap<SensorKind, bool>,
    active: bool,
    exceeded_counts: HashMap<SensorKind, u64>,
}

impl IncidentDetector {
    pub fn new(config: &Config) -> Self {
        Self {
            detectors: [
                ThresholdDetector::new(SensorKind::Acceleration, config.acceleration_threshold_g),
                ThresholdDetector::new(SensorKind::Rotation, config.rotation_threshold_rad_s),
                ThresholdDetector::new(SensorKind::PressureDelta, config.pressure_threshold_kpa),
            ],
            correlator: IncidentCorrelator::new(config.correlation_window_secs),
            available: SensorKind::ALL.iter().map(|k| (*k, true)).collect(),
            active: false,
            exceeded_counts: HashMap::new(),
        }
    }

    /// True only if all three sensors are present.
    pub fn is_available(&self) -> bool {
        SensorKind::ALL
            .iter()
            .all(|k| self.available.get(k).copied().unwrap_or(false))
    }

    pub fn sensor_available(&self, kind: SensorKind) -> bool {
        self.available.get(&kind).copied().unwrap_or(false)
    }

    /// Returns true if the aggregate availability changed.
    pub fn set_available(&mut self, kind: SensorKind, available: bool) -> bool {
        let before = self.is_available();
        self.available.insert(kind, available);
        before != self.is_available()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn start(&mut self) -> bool {
        if !self.is_available() {
            return false;
        }
        if !self.active {
            self.detectors.iter_mut().for_each(ThresholdDetector::start);
            self.correlator.clear();
            self.active = true;
            log::info!("Incident detection started");
        }
        true
    }

    pub fn stop(&mut self) {
        if self.active {
            log::info!("Incident detection stopped");
        }
        self.detectors.iter_mut().for_each(ThresholdDetector::stop);
        self.correlator.clear();
        self.active = false;
    }

    pub fn correlator(&self) -> &IncidentCorrelator {
        &self.correlator
    }

    pub fn exceeded_count(&self, kind: SensorKind) -> u64 {
        self.exceeded_counts.get(&kind).copied().unwrap_or(0)
    }

    /// Runs one sample through its detector and, on a crossing, the correlator.
    pub fn observe(&mut self, sample: &SensorSample, now: Timestamp) -> Option<Incident> {
        if !self.active {
            return None;
        }
        let detector = self.detectors.iter_mut().find(|d| d.kind() == sample.kind)?;
        let event = detector.observe(sample)?;
        log::debug!(
            "[{}] exceeded threshold: {:.3} at {:.3}s",
            event.kind,
            event.magnitude,
            event.occurred_at
        );
        self.on_exceeded(&event, now)
    }

    /// Feeds a crossing that was thresholded elsewhere.
    pub fn on_exceeded(&mut self, event: &ExceededEvent, now: Timestamp) -> Option<Incident> {
        if !self.active {
            return None;
        }
        *self.exceeded_counts.entry(event.kind).or_insert(0) += 1;
        self.correlator.on_exceeded(event, now)
    }
}
