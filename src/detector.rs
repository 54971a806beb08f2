use crate::incident::ExceededEvent;
use crate::sensors::{Reading, SensorKind, SensorSample};

/// Emits an `ExceededEvent` for every sample whose magnitude is strictly above
/// the threshold. No hysteresis and no debounce.
///
/// Motion channels use the Euclidean norm of the 3-axis reading. The pressure
/// channel uses the absolute difference from a baseline captured on the first
/// sample after each `start`; that first sample never emits.
#[derive(Clone, Debug)]
pub struct ThresholdDetector {
    kind: SensorKind,
    threshold: f64,
    started: bool,
    baseline: Option<f64>,
}

impl ThresholdDetector {
    pub fn new(kind: SensorKind, threshold: f64) -> Self {
        Self {
            kind,
            threshold,
            started: false,
            baseline: None,
        }
    }

    pub fn kind(&self) -> SensorKind {
        self.kind
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn baseline(&self) -> Option<f64> {
        self.baseline
    }

    /// Starts accepting samples. The pressure baseline is re-established on every start.
    pub fn start(&mut self) {
        self.started = true;
        self.baseline = None;
    }

    pub fn stop(&mut self) {
        self.started = false;
        self.baseline = None;
    }

    pub fn observe(&mut self, sample: &SensorSample) -> Option<ExceededEvent> {
        if !self.started || sample.kind != self.kind {
            return None;
        }

        let magnitude = self.magnitude(&sample.reading)?;
        if magnitude > self.threshold {
            Some(ExceededEvent {
                kind: self.kind,
                occurred_at: sample.timestamp,
                magnitude,
            })
        } else {
            None
        }
    }

    fn magnitude(&mut self, reading: &Reading) -> Option<f64> {
        match (self.kind, reading) {
            (SensorKind::Acceleration | SensorKind::Rotation, Reading::Motion(v)) => Some(v.norm()),
            (SensorKind::PressureDelta, Reading::Pressure(kpa)) => match self.baseline {
                Some(baseline) => Some((kpa - baseline).abs()),
                None => {
                    self.baseline = Some(*kpa);
                    None
                }
            },
            (kind, reading) => {
                log::warn!("[{}] ignoring mismatched reading {:?}", kind, reading);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn accel(x: f64, y: f64, z: f64, t: f64) -> SensorSample {
        SensorSample::new(SensorKind::Acceleration, Reading::motion(x, y, z), t)
    }

    fn pressure(kpa: f64, t: f64) -> SensorSample {
        SensorSample::new(SensorKind::PressureDelta, Reading::Pressure(kpa), t)
    }

    #[test]
    fn test_not_started_emits_nothing() {
        let mut detector = ThresholdDetector::new(SensorKind::Acceleration, 3.0);
        assert!(detector.observe(&accel(10.0, 0.0, 0.0, 0.0)).is_none());
    }

    #[test]
    fn test_motion_magnitude_strictly_above() {
        let mut detector = ThresholdDetector::new(SensorKind::Acceleration, 3.0);
        detector.start();

        // exactly at the threshold is not above it
        assert!(detector.observe(&accel(0.0, 3.0, 0.0, 0.0)).is_none());

        let event = detector.observe(&accel(2.0, 2.0, 2.0, 0.5)).unwrap();
        assert_eq!(event.kind, SensorKind::Acceleration);
        assert_eq!(event.occurred_at, 0.5);
        assert_relative_eq!(event.magnitude, 12.0_f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_every_qualifying_sample_emits() {
        let mut detector = ThresholdDetector::new(SensorKind::Rotation, 6.0);
        detector.start();
        let emitted = (0..5)
            .filter_map(|i| {
                detector.observe(&SensorSample::new(
                    SensorKind::Rotation,
                    Reading::motion(0.0, 0.0, 7.0),
                    i as f64 * 0.1,
                ))
            })
            .count();
        assert_eq!(emitted, 5);
    }

    #[test]
    fn test_pressure_baseline_on_first_sample() {
        let mut detector = ThresholdDetector::new(SensorKind::PressureDelta, 0.1);
        detector.start();

        assert!(detector.observe(&pressure(101.3, 0.0)).is_none());
        assert_eq!(detector.baseline(), Some(101.3));

        assert!(detector.observe(&pressure(101.35, 0.1)).is_none());
        let event = detector.observe(&pressure(101.15, 0.2)).unwrap();
        assert_relative_eq!(event.magnitude, 0.15, epsilon = 1e-9);
    }

    #[test]
    fn test_pressure_baseline_reset_on_restart() {
        let mut detector = ThresholdDetector::new(SensorKind::PressureDelta, 0.1);
        detector.start();
        detector.observe(&pressure(101.3, 0.0));

        detector.stop();
        detector.start();
        assert_eq!(detector.baseline(), None);

        // New baseline, so a reading far from the old one is the new reference
        assert!(detector.observe(&pressure(99.0, 1.0)).is_none());
        assert!(detector.observe(&pressure(99.05, 1.1)).is_none());
    }

    #[test]
    fn test_mismatched_samples_ignored() {
        let mut detector = ThresholdDetector::new(SensorKind::Acceleration, 3.0);
        detector.start();
        assert!(detector.observe(&pressure(500.0, 0.0)).is_none());

        let wrong_kind = SensorSample::new(SensorKind::Rotation, Reading::motion(9.0, 9.0, 9.0), 0.0);
        assert!(detector.observe(&wrong_kind).is_none());
    }
}
