// emergency.rs: emergency lifecycle
//
// Single writer for EmergencyState. Every public operation takes the one
// lifecycle lock, so user actions, sensor callbacks and the confirmation
// timer are serialized; the first transition wins and a timer fire that
// finds the state already moved on is ignored.
//
//   Idle ──start_detector──▶ Monitoring ──incident──▶ PendingConfirmation
//                                ▲                      │         │
//                                └──── respond_okay ────┘         │ grace elapsed
//                                                                 ▼ / need_help
//   Idle/Monitoring ─────────── start_sos ────────────────────▶ Active
//   Active ──stop_sos──▶ Monitoring (or Idle if detection is off)
//   any ──stop_detector──▶ Idle (distress stopped first)

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::clock::{Clock, Timestamp};
use crate::config::Config;
use crate::error::{IgathaError, Result};
use crate::events::{EmergencyEvent, EventBus, Subscription, SubscriptionId};
use crate::incident::{ExceededEvent, Incident, IncidentDetector};
use crate::sensors::{SensorKind, SensorSample};
use crate::timer::{Scheduler, TimerHandle};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EmergencyState {
    Idle,
    Monitoring,
    PendingConfirmation,
    Active,
}

/// Short-range advertiser carrying only the well-known service identifier.
///
/// `start`/`stop` are called with the lifecycle lock held and must return
/// quickly without calling back into the manager.
pub trait RadioBeacon: Send + Sync {
    fn start(&self);
    fn stop(&self);
    fn is_advertising(&self) -> bool;
    fn is_available(&self) -> bool;
}

/// Audible siren. Same calling constraints as `RadioBeacon`.
pub trait AlarmOutput: Send + Sync {
    fn start(&self);
    fn stop(&self);
    fn is_active(&self) -> bool;
    fn is_available(&self) -> bool;
}

/// Aggregate availability/activity flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    /// All three sensors present and the SOS path usable
    pub detector_available: bool,
    pub detector_active: bool,
    /// Beacon and alarm both usable
    pub sos_available: bool,
    /// Beacon advertising or alarm sounding
    pub sos_active: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserResponse {
    /// "I'm okay"
    Okay,
    /// "Need help"
    NeedHelp,
}

struct ConfirmationTimer {
    handle: TimerHandle,
    generation: u64,
    deadline: Timestamp,
}

struct Inner {
    state: EmergencyState,
    detector: IncidentDetector,
    /// Set by a successful start; detection resumes on its own when availability returns
    detection_enabled: bool,
    timer: Option<ConfirmationTimer>,
    timer_generation: u64,
    incidents: u64,
    last_availability: Availability,
    shut_down: bool,
}

struct Shared {
    inner: Mutex<Inner>,
    beacon: Arc<dyn RadioBeacon>,
    alarm: Arc<dyn AlarmOutput>,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    bus: EventBus,
    grace_period: Duration,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(timer) = inner.timer.take() {
            timer.handle.cancel();
        }
        if inner.state == EmergencyState::Active {
            self.beacon.stop();
            self.alarm.stop();
        }
        inner.detector.stop();
    }
}

/// Owns the incident detector and the lifecycle. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct EmergencyManager {
    shared: Arc<Shared>,
}

impl EmergencyManager {
    pub fn new(
        config: &Config,
        beacon: Arc<dyn RadioBeacon>,
        alarm: Arc<dyn AlarmOutput>,
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let detector = IncidentDetector::new(config);
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: EmergencyState::Idle,
                detector,
                detection_enabled: false,
                timer: None,
                timer_generation: 0,
                incidents: 0,
                last_availability: Availability::default(),
                shut_down: false,
            }),
            beacon,
            alarm,
            scheduler,
            clock,
            bus: EventBus::new(),
            grace_period: config.grace_period(),
        });
        let manager = Self { shared };
        {
            let mut inner = manager.lock();
            inner.last_availability = manager.compute_availability(&inner);
        }
        manager
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned lifecycle must still be stoppable
        self.shared
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    // ─── Queries ─────────────────────────────────────────────────────────────

    pub fn state(&self) -> EmergencyState {
        self.lock().state
    }

    pub fn availability(&self) -> Availability {
        let inner = self.lock();
        self.compute_availability(&inner)
    }

    pub fn is_sos_available(&self) -> bool {
        self.availability().sos_available
    }

    pub fn is_sos_active(&self) -> bool {
        self.availability().sos_active
    }

    pub fn is_detector_available(&self) -> bool {
        self.availability().detector_available
    }

    pub fn is_detector_active(&self) -> bool {
        self.lock().detector.is_active()
    }

    pub fn is_detection_enabled(&self) -> bool {
        self.lock().detection_enabled
    }

    pub fn incident_count(&self) -> u64 {
        self.lock().incidents
    }

    pub fn exceeded_count(&self, kind: SensorKind) -> u64 {
        self.lock().detector.exceeded_count(kind)
    }

    /// When the pending confirmation escalates, if one is pending.
    pub fn confirmation_deadline(&self) -> Option<Timestamp> {
        self.lock().timer.as_ref().map(|t| t.deadline)
    }

    pub fn has_pending_timer(&self) -> bool {
        self.lock().timer.is_some()
    }

    pub fn grace_period(&self) -> Duration {
        self.shared.grace_period
    }

    pub fn subscribe(&self) -> Subscription {
        self.shared.bus.subscribe()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.bus.unsubscribe(id)
    }

    // ─── Detection ───────────────────────────────────────────────────────────

    /// Enables detection. Returns whether detection is running afterwards;
    /// a no-op returning false if prerequisites are unavailable.
    pub fn start_detector(&self) -> bool {
        let mut inner = self.lock();
        if inner.shut_down {
            return false;
        }
        let started = self.resume_detection(&mut inner);
        if started {
            inner.detection_enabled = true;
        }
        started
    }

    pub fn try_start_detector(&self) -> Result<()> {
        if self.start_detector() {
            Ok(())
        } else {
            Err(IgathaError::DetectorUnavailable)
        }
    }

    /// Disables detection, stopping any distress broadcast first.
    pub fn stop_detector(&self) {
        let mut inner = self.lock();
        inner.detection_enabled = false;
        self.halt_detection(&mut inner, true);
        self.publish_availability(&mut inner);
    }

    /// Feeds one raw sensor sample through its threshold detector.
    pub fn observe_sample(&self, sample: SensorSample) {
        let mut inner = self.lock();
        let now = self.shared.clock.now();
        if let Some(incident) = inner.detector.observe(&sample, now) {
            self.handle_incident(&mut inner, incident);
        }
    }

    /// Feeds an already-thresholded crossing straight to the correlator.
    pub fn observe_exceeded(&self, event: ExceededEvent) {
        let mut inner = self.lock();
        let now = self.shared.clock.now();
        if let Some(incident) = inner.detector.on_exceeded(&event, now) {
            self.handle_incident(&mut inner, incident);
        }
    }

    // ─── Distress ────────────────────────────────────────────────────────────

    /// Manual SOS. Returns whether distress is active afterwards.
    pub fn start_sos(&self) -> bool {
        let mut inner = self.lock();
        if inner.shut_down {
            return false;
        }
        match inner.state {
            EmergencyState::Active => return true,
            // Same as answering "need help"
            EmergencyState::PendingConfirmation => {
                self.activate(&mut inner);
                return true;
            }
            EmergencyState::Idle | EmergencyState::Monitoring => {}
        }
        if !self.sos_available() {
            log::warn!("SOS requested but beacon or alarm is unavailable");
            return false;
        }
        self.activate(&mut inner);
        true
    }

    pub fn try_start_sos(&self) -> Result<()> {
        if self.start_sos() {
            Ok(())
        } else {
            Err(IgathaError::SosUnavailable)
        }
    }

    pub fn stop_sos(&self) {
        let mut inner = self.lock();
        match inner.state {
            EmergencyState::Active => self.deactivate(&mut inner),
            EmergencyState::PendingConfirmation => {
                log::info!("SOS stopped during confirmation; cancelling escalation");
                self.transition(&mut inner, EmergencyState::Monitoring);
            }
            EmergencyState::Idle | EmergencyState::Monitoring => {}
        }
    }

    pub fn respond(&self, response: UserResponse) {
        match response {
            UserResponse::Okay => self.respond_okay(),
            UserResponse::NeedHelp => self.need_help(),
        }
    }

    /// "I'm okay": cancels a pending escalation, or stops an active broadcast.
    pub fn respond_okay(&self) {
        let mut inner = self.lock();
        match inner.state {
            EmergencyState::PendingConfirmation => {
                log::info!("User confirmed okay; escalation cancelled");
                self.transition(&mut inner, EmergencyState::Monitoring);
            }
            EmergencyState::Active => self.deactivate(&mut inner),
            EmergencyState::Idle | EmergencyState::Monitoring => {}
        }
    }

    /// "Need help": escalates immediately.
    pub fn need_help(&self) {
        let mut inner = self.lock();
        if inner.shut_down {
            return;
        }
        match inner.state {
            EmergencyState::Active => {}
            EmergencyState::PendingConfirmation => self.activate(&mut inner),
            EmergencyState::Idle | EmergencyState::Monitoring => {
                if self.sos_available() {
                    self.activate(&mut inner);
                } else {
                    log::warn!("Help requested but beacon or alarm is unavailable");
                }
            }
        }
    }

    // ─── Availability ────────────────────────────────────────────────────────

    pub fn set_sensor_availability(&self, kind: SensorKind, available: bool) {
        let mut inner = self.lock();
        if inner.detector.sensor_available(kind) != available {
            if available {
                log::info!("[{}] sensor available", kind);
            } else {
                log::warn!("[{}] sensor unavailable", kind);
            }
        }
        inner.detector.set_available(kind, available);
        self.reconcile(&mut inner);
    }

    /// Called by the beacon adapter after its availability changed.
    pub fn notify_beacon_availability(&self) {
        let mut inner = self.lock();
        self.reconcile(&mut inner);
    }

    /// Called by the alarm adapter after its availability changed.
    pub fn notify_alarm_availability(&self) {
        let mut inner = self.lock();
        self.reconcile(&mut inner);
    }

    /// Stops distress and detection, cancels timers and closes the event bus.
    pub fn shutdown(&self) {
        let mut inner = self.lock();
        if inner.shut_down {
            return;
        }
        inner.detection_enabled = false;
        self.halt_detection(&mut inner, true);
        inner.shut_down = true;
        log::info!("Emergency manager shut down");
        drop(inner);
        self.shared.bus.close();
    }

    // ─── Internals (lock held) ───────────────────────────────────────────────

    fn sos_available(&self) -> bool {
        self.shared.beacon.is_available() && self.shared.alarm.is_available()
    }

    fn compute_availability(&self, inner: &Inner) -> Availability {
        let sos_available = self.sos_available();
        Availability {
            detector_available: inner.detector.is_available() && sos_available,
            detector_active: inner.detector.is_active(),
            sos_available,
            sos_active: self.shared.beacon.is_advertising() || self.shared.alarm.is_active(),
        }
    }

    fn publish_availability(&self, inner: &mut Inner) {
        let current = self.compute_availability(inner);
        if current != inner.last_availability {
            inner.last_availability = current;
            self.shared.bus.publish(EmergencyEvent::AvailabilityChanged(current));
        }
    }

    fn transition(&self, inner: &mut Inner, to: EmergencyState) {
        if to != EmergencyState::PendingConfirmation {
            Self::cancel_timer(inner);
        }
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        log::info!("Emergency state {:?} -> {:?}", from, to);
        self.shared
            .bus
            .publish(EmergencyEvent::StateChanged { from, to });
    }

    fn cancel_timer(inner: &mut Inner) {
        if let Some(timer) = inner.timer.take() {
            timer.handle.cancel();
        }
    }

    /// Starts detection if enabled and possible; moves Idle to Monitoring.
    fn resume_detection(&self, inner: &mut Inner) -> bool {
        if !self.compute_availability(inner).detector_available {
            log::warn!("Detector unavailable; detection not started");
            self.publish_availability(inner);
            return false;
        }
        if !inner.detector.is_active() {
            inner.detector.start();
        }
        if inner.state == EmergencyState::Idle {
            self.transition(inner, EmergencyState::Monitoring);
        }
        self.publish_availability(inner);
        true
    }

    /// Stops detection. With `stop_distress`, an active broadcast goes too.
    fn halt_detection(&self, inner: &mut Inner, stop_distress: bool) {
        if stop_distress && inner.state == EmergencyState::Active {
            self.command_off();
        }
        inner.detector.stop();
        match inner.state {
            EmergencyState::Active if !stop_distress => {}
            _ => self.transition(inner, EmergencyState::Idle),
        }
    }

    fn handle_incident(&self, inner: &mut Inner, incident: Incident) {
        inner.incidents += 1;
        log::warn!(
            "Incident detected at {:.3}s (spread {:.3}s)",
            incident.detected_at,
            incident.spread()
        );
        self.shared
            .bus
            .publish(EmergencyEvent::IncidentDetected(incident));

        match inner.state {
            EmergencyState::Monitoring | EmergencyState::PendingConfirmation => {
                let deadline = self.start_confirmation_timer(inner);
                self.transition(inner, EmergencyState::PendingConfirmation);
                self.shared
                    .bus
                    .publish(EmergencyEvent::ConfirmationRequested { deadline });
            }
            EmergencyState::Active | EmergencyState::Idle => {
                log::debug!("Incident ignored in state {:?}", inner.state);
            }
        }
    }

    fn start_confirmation_timer(&self, inner: &mut Inner) -> Timestamp {
        Self::cancel_timer(inner);

        inner.timer_generation += 1;
        let generation = inner.timer_generation;
        let deadline = self.shared.clock.now() + self.shared.grace_period.as_secs_f64();
        let weak = Arc::downgrade(&self.shared);
        let handle = self.shared.scheduler.schedule(
            self.shared.grace_period,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    EmergencyManager { shared }.on_confirmation_elapsed(generation);
                }
            }),
        );
        inner.timer = Some(ConfirmationTimer {
            handle,
            generation,
            deadline,
        });
        deadline
    }

    fn on_confirmation_elapsed(&self, generation: u64) {
        let mut inner = self.lock();
        let current = inner.timer.as_ref().map(|t| t.generation);
        if inner.state != EmergencyState::PendingConfirmation || current != Some(generation) {
            log::debug!(
                "Ignoring stale confirmation timer {} in state {:?}",
                generation,
                inner.state
            );
            return;
        }
        log::warn!("No response within grace period; escalating to SOS");
        self.activate(&mut inner);
    }

    fn activate(&self, inner: &mut Inner) {
        Self::cancel_timer(inner);
        self.shared.beacon.start();
        self.shared.alarm.start();
        self.transition(inner, EmergencyState::Active);
        self.shared.bus.publish(EmergencyEvent::SosStarted);
        self.publish_availability(inner);
    }

    fn command_off(&self) {
        self.shared.alarm.stop();
        self.shared.beacon.stop();
        self.shared.bus.publish(EmergencyEvent::SosStopped);
    }

    fn deactivate(&self, inner: &mut Inner) {
        self.command_off();
        let to = if inner.detector.is_active() {
            EmergencyState::Monitoring
        } else {
            EmergencyState::Idle
        };
        self.transition(inner, to);
        self.publish_availability(inner);
    }

    /// Applies availability changes. Detection loss forces detection out;
    /// SOS loss while active is only reported.
    fn reconcile(&self, inner: &mut Inner) {
        if inner.shut_down {
            return;
        }
        let availability = self.compute_availability(inner);
        if !availability.detector_available && inner.detector.is_active() {
            log::warn!("Detector became unavailable; stopping detection");
            self.halt_detection(inner, false);
        } else if availability.detector_available
            && inner.detection_enabled
            && !inner.detector.is_active()
        {
            log::info!("Detector available again; resuming detection");
            self.resume_detection(inner);
        }
        if inner.state == EmergencyState::Active && !availability.sos_available {
            log::warn!("SOS degraded: beacon or alarm unavailable while active");
        }
        self.publish_availability(inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::sensors::Reading;
    use crate::simulation::{SimulatedAlarm, SimulatedBeacon};
    use crate::timer::ManualScheduler;

    struct Harness {
        manager: EmergencyManager,
        scheduler: ManualScheduler,
        beacon: Arc<SimulatedBeacon>,
        alarm: Arc<SimulatedAlarm>,
    }

    impl Harness {
        fn new() -> Self {
            let clock = ManualClock::new(0.0);
            let scheduler = ManualScheduler::new(clock.clone());
            let beacon = Arc::new(SimulatedBeacon::new("1802"));
            let alarm = Arc::new(SimulatedAlarm::new());
            let manager = EmergencyManager::new(
                &Config::default(),
                beacon.clone(),
                alarm.clone(),
                Arc::new(scheduler.clone()),
                Arc::new(clock),
            );
            Self {
                manager,
                scheduler,
                beacon,
                alarm,
            }
        }

        fn clock(&self) -> &ManualClock {
            self.scheduler.clock()
        }

        fn exceed(&self, kind: SensorKind, t: f64) {
            self.clock().set(t);
            self.manager.observe_exceeded(ExceededEvent {
                kind,
                occurred_at: t,
                magnitude: 10.0,
            });
        }

        fn trigger_incident(&self) {
            let t = self.clock().now();
            self.exceed(SensorKind::Acceleration, t);
            self.exceed(SensorKind::Rotation, t + 0.1);
            self.exceed(SensorKind::PressureDelta, t + 0.2);
        }

        fn assert_timer_invariant(&self) {
            let pending = self.manager.state() == EmergencyState::PendingConfirmation;
            assert_eq!(self.manager.has_pending_timer(), pending);
            assert_eq!(self.scheduler.pending(), usize::from(pending));
        }
    }

    #[test]
    fn test_start_detector_enters_monitoring() {
        let h = Harness::new();
        assert_eq!(h.manager.state(), EmergencyState::Idle);
        assert!(h.manager.start_detector());
        assert_eq!(h.manager.state(), EmergencyState::Monitoring);
        assert!(h.manager.is_detector_active());

        // idempotent
        assert!(h.manager.start_detector());
        assert_eq!(h.manager.state(), EmergencyState::Monitoring);
    }

    #[test]
    fn test_start_detector_requires_availability() {
        let h = Harness::new();
        h.manager.set_sensor_availability(SensorKind::Rotation, false);
        assert!(!h.manager.start_detector());
        assert_eq!(h.manager.state(), EmergencyState::Idle);
        assert!(h.manager.try_start_detector().unwrap_err().is_unavailable());

        let h = Harness::new();
        h.alarm.set_available(false);
        assert!(!h.manager.start_detector());
        assert_eq!(h.manager.state(), EmergencyState::Idle);
    }

    #[test]
    fn test_failed_start_stays_idle_after_availability_returns() {
        let h = Harness::new();
        h.manager.set_sensor_availability(SensorKind::Rotation, false);
        assert!(!h.manager.start_detector());
        assert!(!h.manager.is_detection_enabled());

        h.manager.set_sensor_availability(SensorKind::Rotation, true);
        assert_eq!(h.manager.state(), EmergencyState::Idle);
        assert!(!h.manager.is_detector_active());

        h.alarm.set_available(false);
        assert!(!h.manager.start_detector());
        h.alarm.set_available(true);
        h.manager.notify_alarm_availability();
        assert_eq!(h.manager.state(), EmergencyState::Idle);
        assert!(!h.manager.is_detection_enabled());
    }

    #[test]
    fn test_incident_requests_confirmation() {
        let h = Harness::new();
        let events = h.manager.subscribe();
        h.manager.start_detector();
        h.trigger_incident();

        assert_eq!(h.manager.state(), EmergencyState::PendingConfirmation);
        assert_eq!(h.manager.incident_count(), 1);
        let deadline = h.manager.confirmation_deadline().unwrap();
        assert!((deadline - 120.2).abs() < 1e-9);
        h.assert_timer_invariant();

        let received = events.drain();
        assert!(received
            .iter()
            .any(|e| matches!(e, EmergencyEvent::IncidentDetected(_))));
        assert!(received
            .iter()
            .any(|e| matches!(e, EmergencyEvent::ConfirmationRequested { .. })));
    }

    #[test]
    fn test_grace_period_escalates_exactly_once() {
        let h = Harness::new();
        h.manager.start_detector();
        h.trigger_incident();

        h.scheduler.advance(119.0);
        assert_eq!(h.manager.state(), EmergencyState::PendingConfirmation);
        assert_eq!(h.beacon.start_count(), 0);

        h.scheduler.advance(1.5);
        assert_eq!(h.manager.state(), EmergencyState::Active);
        assert!(h.beacon.is_advertising());
        assert!(h.alarm.is_active());
        h.assert_timer_invariant();

        h.scheduler.advance(1000.0);
        assert_eq!(h.beacon.start_count(), 1);
        assert_eq!(h.alarm.start_count(), 1);
    }

    #[test]
    fn test_respond_okay_cancels_escalation() {
        let h = Harness::new();
        h.manager.start_detector();
        h.trigger_incident();

        h.scheduler.advance(60.0);
        h.manager.respond(UserResponse::Okay);
        assert_eq!(h.manager.state(), EmergencyState::Monitoring);
        h.assert_timer_invariant();

        h.scheduler.advance(500.0);
        assert_eq!(h.manager.state(), EmergencyState::Monitoring);
        assert_eq!(h.beacon.start_count(), 0);
        assert_eq!(h.alarm.start_count(), 0);
    }

    #[test]
    fn test_need_help_escalates_immediately() {
        let h = Harness::new();
        h.manager.start_detector();
        h.trigger_incident();

        h.manager.respond(UserResponse::NeedHelp);
        assert_eq!(h.manager.state(), EmergencyState::Active);
        h.assert_timer_invariant();

        h.scheduler.advance(200.0);
        assert_eq!(h.beacon.start_count(), 1);
    }

    #[test]
    fn test_manual_sos_while_pending_escalates() {
        let h = Harness::new();
        h.manager.start_detector();
        h.trigger_incident();

        assert!(h.manager.start_sos());
        assert_eq!(h.manager.state(), EmergencyState::Active);
        h.assert_timer_invariant();
        h.scheduler.advance(200.0);
        assert_eq!(h.beacon.start_count(), 1);
    }

    #[test]
    fn test_stale_timer_fire_is_ignored() {
        let h = Harness::new();
        h.manager.start_detector();
        h.trigger_incident();

        // A fire that lost the race with the user's answer
        let generation = h.manager.lock().timer.as_ref().map(|t| t.generation).unwrap();
        h.manager.respond_okay();
        h.manager.on_confirmation_elapsed(generation);
        assert_eq!(h.manager.state(), EmergencyState::Monitoring);
        assert_eq!(h.beacon.start_count(), 0);
    }

    #[test]
    fn test_second_incident_restarts_grace_period() {
        let h = Harness::new();
        h.manager.start_detector();
        h.trigger_incident();

        h.scheduler.advance(100.0);
        h.trigger_incident();
        h.assert_timer_invariant();

        // The first deadline passes without escalation
        h.scheduler.advance(30.0);
        assert_eq!(h.manager.state(), EmergencyState::PendingConfirmation);

        h.scheduler.advance(100.0);
        assert_eq!(h.manager.state(), EmergencyState::Active);
        assert_eq!(h.beacon.start_count(), 1);
    }

    #[test]
    fn test_stop_sos_returns_to_monitoring() {
        let h = Harness::new();
        h.manager.start_detector();
        assert!(h.manager.start_sos());
        assert_eq!(h.manager.state(), EmergencyState::Active);

        h.manager.stop_sos();
        assert_eq!(h.manager.state(), EmergencyState::Monitoring);
        assert!(!h.beacon.is_advertising());
        assert!(!h.alarm.is_active());
        h.assert_timer_invariant();
    }

    #[test]
    fn test_manual_sos_from_idle_and_stop_to_idle() {
        let h = Harness::new();
        assert!(h.manager.start_sos());
        assert_eq!(h.manager.state(), EmergencyState::Active);
        assert!(!h.manager.is_detector_active());

        h.manager.stop_sos();
        assert_eq!(h.manager.state(), EmergencyState::Idle);
    }

    #[test]
    fn test_manual_sos_ignores_detector_availability() {
        let h = Harness::new();
        h.manager.set_sensor_availability(SensorKind::PressureDelta, false);
        assert!(h.manager.start_sos());
        assert_eq!(h.manager.state(), EmergencyState::Active);
    }

    #[test]
    fn test_manual_sos_requires_sos_availability() {
        let h = Harness::new();
        h.beacon.set_available(false);
        assert!(!h.manager.start_sos());
        assert_eq!(h.manager.state(), EmergencyState::Idle);
        assert!(matches!(
            h.manager.try_start_sos(),
            Err(IgathaError::SosUnavailable)
        ));
    }

    #[test]
    fn test_sos_idempotence() {
        let h = Harness::new();
        h.manager.start_detector();
        h.manager.start_sos();
        h.manager.start_sos();
        assert_eq!(h.beacon.start_count(), 1);

        h.manager.stop_sos();
        h.manager.stop_sos();
        assert_eq!(h.beacon.stop_count(), 1);
        assert_eq!(h.manager.state(), EmergencyState::Monitoring);
    }

    #[test]
    fn test_stop_detector_stops_distress_first() {
        let h = Harness::new();
        h.manager.start_detector();
        h.manager.start_sos();

        h.manager.stop_detector();
        assert_eq!(h.manager.state(), EmergencyState::Idle);
        assert!(!h.beacon.is_advertising());
        assert!(!h.alarm.is_active());
        assert!(!h.manager.is_detector_active());
    }

    #[test]
    fn test_stop_detector_cancels_pending_escalation() {
        let h = Harness::new();
        h.manager.start_detector();
        h.trigger_incident();

        h.manager.stop_detector();
        assert_eq!(h.manager.state(), EmergencyState::Idle);
        h.assert_timer_invariant();

        h.scheduler.advance(500.0);
        assert_eq!(h.beacon.start_count(), 0);
    }

    #[test]
    fn test_sensor_loss_forces_idle_and_recovery_resumes() {
        let h = Harness::new();
        h.manager.start_detector();
        h.trigger_incident();

        h.manager.set_sensor_availability(SensorKind::Acceleration, false);
        assert_eq!(h.manager.state(), EmergencyState::Idle);
        h.assert_timer_invariant();
        assert!(h.manager.is_detection_enabled());

        h.manager.set_sensor_availability(SensorKind::Acceleration, true);
        assert_eq!(h.manager.state(), EmergencyState::Monitoring);
    }

    #[test]
    fn test_sos_loss_while_active_only_reports() {
        let h = Harness::new();
        let events = h.manager.subscribe();
        h.manager.start_sos();
        events.drain();

        h.alarm.set_available(false);
        h.manager.notify_alarm_availability();

        assert_eq!(h.manager.state(), EmergencyState::Active);
        assert!(!h.manager.availability().sos_available);
        assert!(events.drain().iter().any(|e| matches!(
            e,
            EmergencyEvent::AvailabilityChanged(a) if !a.sos_available
        )));
    }

    #[test]
    fn test_sos_loss_while_pending_forces_idle() {
        let h = Harness::new();
        h.manager.start_detector();
        h.trigger_incident();
        assert_eq!(h.manager.state(), EmergencyState::PendingConfirmation);

        h.alarm.set_available(false);
        h.manager.notify_alarm_availability();
        assert_eq!(h.manager.state(), EmergencyState::Idle);
        assert!(!h.manager.is_detector_active());
        h.assert_timer_invariant();

        h.scheduler.advance(500.0);
        assert_eq!(h.beacon.start_count(), 0);
        assert_eq!(h.alarm.start_count(), 0);
    }

    #[test]
    fn test_concurrent_crossings_are_serialized() {
        let h = Harness::new();
        h.manager.start_detector();

        for round in 0..50u64 {
            let t = round as f64 * 10.0;
            h.clock().set(t);
            let barrier = Arc::new(std::sync::Barrier::new(SensorKind::ALL.len()));
            let threads: Vec<_> = SensorKind::ALL
                .iter()
                .map(|&kind| {
                    let manager = h.manager.clone();
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        barrier.wait();
                        manager.observe_exceeded(ExceededEvent {
                            kind,
                            occurred_at: t,
                            magnitude: 10.0,
                        });
                    })
                })
                .collect();
            for thread in threads {
                thread.join().unwrap();
            }

            assert_eq!(h.manager.incident_count(), round + 1);
            assert_eq!(h.manager.state(), EmergencyState::PendingConfirmation);
            assert_eq!(h.manager.lock().detector.correlator().recorded(), 0);
            h.manager.respond_okay();
        }
        h.assert_timer_invariant();
    }

    #[test]
    fn test_samples_drive_incident() {
        let h = Harness::new();
        h.manager.start_detector();

        let samples = [
            (SensorKind::PressureDelta, Reading::Pressure(101.3), 0.0),
            (SensorKind::Acceleration, Reading::motion(0.0, 3.5, 0.0), 0.1),
            (SensorKind::Rotation, Reading::motion(0.0, 0.0, 6.5), 0.5),
            (SensorKind::PressureDelta, Reading::Pressure(101.0), 0.9),
        ];
        for (kind, reading, t) in samples {
            h.clock().set(t);
            h.manager.observe_sample(SensorSample::new(kind, reading, t));
        }
        assert_eq!(h.manager.state(), EmergencyState::PendingConfirmation);
        assert_eq!(h.manager.exceeded_count(SensorKind::PressureDelta), 1);
    }

    #[test]
    fn test_shutdown_stops_everything() {
        let h = Harness::new();
        let events = h.manager.subscribe();
        h.manager.start_detector();
        h.manager.start_sos();

        h.manager.shutdown();
        assert_eq!(h.manager.state(), EmergencyState::Idle);
        assert!(!h.beacon.is_advertising());
        assert!(!h.manager.start_detector());
        assert!(!h.manager.start_sos());

        events.drain();
        assert_eq!(events.recv(), None);
    }

    #[test]
    fn test_state_events_are_ordered() {
        let h = Harness::new();
        let events = h.manager.subscribe();
        h.manager.start_detector();
        h.trigger_incident();
        h.scheduler.advance(121.0);
        h.manager.stop_sos();

        let transitions: Vec<_> = events
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                EmergencyEvent::StateChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(
            transitions,
            vec![
                EmergencyState::Monitoring,
                EmergencyState::PendingConfirmation,
                EmergencyState::Active,
                EmergencyState::Monitoring,
            ]
        );
    }
}
