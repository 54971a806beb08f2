// simulation.rs: in-process stand-ins for platform adapters
//
// Used by the `igatha` binary when no real radios or sensors exist, and by
// tests. Readings follow the same slow sine drift a phone at rest shows;
// `trigger_fall` queues a burst that crosses every default threshold.

use std::collections::VecDeque;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::clock::Clock;
use crate::emergency::{AlarmOutput, RadioBeacon};
use crate::proximity::{DeviceId, RadioScanner, ScanObservation};
use crate::sensors::{Reading, SensorKind, SensorSource};

/// Sea-level pressure in kPa
const BASELINE_KPA: f64 = 101.325;

// ─── Outputs ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct SimulatedBeacon {
    service_id: String,
    available: AtomicBool,
    advertising: AtomicBool,
    starts: AtomicU32,
    stops: AtomicU32,
}

impl SimulatedBeacon {
    pub fn new(service_id: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            available: AtomicBool::new(true),
            advertising: AtomicBool::new(false),
            starts: AtomicU32::new(0),
            stops: AtomicU32::new(0),
        }
    }

    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        if !available {
            self.advertising.store(false, Ordering::SeqCst);
        }
    }

    pub fn start_count(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }
}

impl RadioBeacon for SimulatedBeacon {
    fn start(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.is_available() {
            self.advertising.store(true, Ordering::SeqCst);
            log::info!("[beacon] advertising service {}", self.service_id);
        } else {
            log::warn!("[beacon] start requested while radio is off");
        }
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.advertising.swap(false, Ordering::SeqCst) {
            log::info!("[beacon] advertising stopped");
        }
    }

    fn is_advertising(&self) -> bool {
        self.advertising.load(Ordering::SeqCst)
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct SimulatedAlarm {
    available: AtomicBool,
    sounding: AtomicBool,
    starts: AtomicU32,
    stops: AtomicU32,
}

impl SimulatedAlarm {
    pub fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            sounding: AtomicBool::new(false),
            starts: AtomicU32::new(0),
            stops: AtomicU32::new(0),
        }
    }

    /// Audio output can disappear while sounding; the siren keeps its commanded state.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn start_count(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> u32 {
        self.stops.load(Ordering::SeqCst)
    }
}

impl Default for SimulatedAlarm {
    fn default() -> Self {
        Self::new()
    }
}

impl AlarmOutput for SimulatedAlarm {
    fn start(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if !self.sounding.swap(true, Ordering::SeqCst) {
            log::info!("[alarm] siren on");
        }
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.sounding.swap(false, Ordering::SeqCst) {
            log::info!("[alarm] siren off");
        }
    }

    fn is_active(&self) -> bool {
        self.sounding.load(Ordering::SeqCst)
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

// ─── Sensors ─────────────────────────────────────────────────────────────────

/// Mock sensor: resting drift plus any queued readings, which take priority.
#[derive(Debug)]
pub struct SimulatedSensor {
    kind: SensorKind,
    available: AtomicBool,
    tick: AtomicU64,
    queued: Mutex<VecDeque<Reading>>,
}

impl SimulatedSensor {
    pub fn new(kind: SensorKind) -> Self {
        Self {
            kind,
            available: AtomicBool::new(true),
            tick: AtomicU64::new(0),
            queued: Mutex::new(VecDeque::new()),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn push(&self, reading: Reading) {
        self.queued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(reading);
    }

    /// Queues an impact: a few readings well above this channel's default threshold.
    pub fn trigger_fall(&self) {
        let burst: Vec<Reading> = match self.kind {
            SensorKind::Acceleration => vec![
                Reading::motion(0.4, 3.6, 1.2),
                Reading::motion(-1.1, 4.2, 0.3),
                Reading::motion(0.0, 0.2, 1.0),
            ],
            SensorKind::Rotation => vec![
                Reading::motion(6.4, 1.0, 0.5),
                Reading::motion(3.0, 7.1, 0.2),
                Reading::motion(0.1, 0.0, 0.1),
            ],
            // ~12 m drop
            SensorKind::PressureDelta => vec![
                Reading::Pressure(BASELINE_KPA + 0.03),
                Reading::Pressure(BASELINE_KPA + 0.15),
                Reading::Pressure(BASELINE_KPA + 0.16),
            ],
        };
        let mut queued = self.queued.lock().unwrap_or_else(|e| e.into_inner());
        queued.extend(burst);
    }

    fn resting(&self) -> Reading {
        let t = self.tick.fetch_add(1, Ordering::Relaxed) as f64 * 0.02;
        match self.kind {
            SensorKind::Acceleration => Reading::motion(
                (t * 2.0 * PI).sin() * 0.05,
                (t * 2.0 * PI).cos() * 0.03,
                1.0 + (t * PI).sin() * 0.01,
            ),
            SensorKind::Rotation => Reading::motion(
                (t * 0.5).sin() * 0.05,
                (t * 0.3).cos() * 0.03,
                (t * 1.0).sin() * 0.1,
            ),
            SensorKind::PressureDelta => Reading::Pressure(BASELINE_KPA + (t * 0.1).sin() * 0.005),
        }
    }
}

impl SensorSource for SimulatedSensor {
    fn kind(&self) -> SensorKind {
        self.kind
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn read(&self) -> Option<Reading> {
        let queued = self
            .queued
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        Some(queued.unwrap_or_else(|| self.resting()))
    }
}

// ─── Scanner ─────────────────────────────────────────────────────────────────

/// Peers advertising the distress service at fixed base signal levels.
/// Each advertisement is stamped with `clock` when polled.
pub struct SimulatedScanner {
    available: AtomicBool,
    peers: Vec<(DeviceId, f64)>,
    tick: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl SimulatedScanner {
    /// `peers` are (radio address, base RSSI in dBm).
    pub fn new(peers: &[(&str, f64)], clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            available: AtomicBool::new(true),
            peers: peers
                .iter()
                .map(|(address, rssi)| (DeviceId::from_address(address), *rssi))
                .collect(),
            tick: AtomicU64::new(0),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn peer_ids(&self) -> Vec<DeviceId> {
        self.peers.iter().map(|(id, _)| id.clone()).collect()
    }
}

impl RadioScanner for SimulatedScanner {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn poll(&self) -> Vec<ScanObservation> {
        let t = self.tick.fetch_add(1, Ordering::Relaxed) as f64;
        let heard_at = self.clock.now();
        self.peers
            .iter()
            .enumerate()
            .map(|(i, (id, base))| ScanObservation {
                device: id.clone(),
                // multipath fading, a few dB either way
                rssi: base + (t * 0.7 + i as f64).sin() * 4.0,
                timestamp: heard_at,
            })
            .collect()
    }
}
