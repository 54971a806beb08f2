use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};

use crate::clock::Timestamp;
use crate::config::Config;

/// Key for deriving pseudonymous device ids from radio addresses.
const DEVICE_ID_CONTEXT: &str = "igatha 2024-01 device id";

/// Most decimals a distance is rounded to.
pub const MAX_DISTANCE_PRECISION: u32 = 12;

/// Environment-dependent path-loss exponent n.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathLossExponent {
    FreeSpace,
    Indoor,
    #[default]
    Urban,
}

impl PathLossExponent {
    pub fn value(&self) -> f64 {
        match self {
            PathLossExponent::FreeSpace => 2.0,
            PathLossExponent::Indoor => 3.0,
            PathLossExponent::Urban => 4.0,
        }
    }
}

// ─── Device identity ─────────────────────────────────────────────────────────

/// Opaque, stable peer identifier. Never carries the raw radio address.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(String);

impl DeviceId {
    /// Wraps an identifier that is already opaque.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives a pseudonymous id from a radio address (keyed blake3, 128 bits hex).
    pub fn from_address(address: &str) -> Self {
        let digest = blake3::derive_key(DEVICE_ID_CONTEXT, address.trim().as_bytes());
        Self(hex::encode(&digest[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, upper-cased, for display.
    pub fn short_label(&self) -> String {
        self.0.chars().take(8).collect::<String>().to_uppercase()
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ─── Distance model ──────────────────────────────────────────────────────────

/// Log-distance path-loss model.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DistanceModel {
    pub tx_power_dbm: f64,
    pub exponent: PathLossExponent,
    pub precision: u32,
}

impl DistanceModel {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tx_power_dbm: config.tx_power_dbm,
            exponent: config.path_loss_exponent,
            precision: config.distance_precision,
        }
    }

    /// d = 10^((txPower - rssi) / (10 * n)), rounded to `precision` decimals
    /// (capped at `MAX_DISTANCE_PRECISION`).
    pub fn estimate(&self, rssi: f64) -> f64 {
        let exponent = (self.tx_power_dbm - rssi) / (10.0 * self.exponent.value());
        let distance = 10f64.powf(exponent);
        let digits = i32::try_from(self.precision.min(MAX_DISTANCE_PRECISION)).unwrap_or(0);
        let scale = 10f64.powi(digits);
        (distance * scale).round() / scale
    }
}

impl Default for DistanceModel {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

// ─── Tracker ─────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
struct Device {
    smoothed_signal: f64,
    first_seen: Timestamp,
    last_seen: Timestamp,
    observations: u64,
    /// Insertion order, for stable ranking of equal signals
    seq: u64,
}

/// Read-only view of one tracked peer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceView {
    pub id: DeviceId,
    pub short_label: String,
    pub smoothed_signal: f64,
    pub distance_m: f64,
    pub first_seen: Timestamp,
    pub last_seen: Timestamp,
    pub observations: u64,
    pub stale: bool,
}

#[derive(Default)]
struct TrackerState {
    devices: HashMap<DeviceId, Device>,
    next_seq: u64,
}

/// Smoothed signal, distance and freshness for every peer seen advertising
/// the distress service. Entries are never removed, only reported stale.
pub struct ProximityTracker {
    state: RwLock<TrackerState>,
    smoothing_factor: f64,
    stale_window: f64,
    model: DistanceModel,
}

impl ProximityTracker {
    pub fn new(config: &Config) -> Self {
        Self {
            state: RwLock::new(TrackerState::default()),
            smoothing_factor: config.rssi_smoothing_factor,
            stale_window: config.stale_device_window_secs,
            model: DistanceModel::from_config(config),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, TrackerState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, TrackerState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn model(&self) -> &DistanceModel {
        &self.model
    }

    /// Records one signal reading and returns the updated smoothed value.
    ///
    /// The first reading of a device is taken as-is; later readings blend in
    /// with weight `smoothing_factor`. Non-finite readings are dropped and
    /// return `None`.
    pub fn observe(&self, id: DeviceId, raw_signal: f64, timestamp: Timestamp) -> Option<f64> {
        if !raw_signal.is_finite() {
            log::warn!("[scan] {} dropped non-finite rssi {}", id.short_label(), raw_signal);
            return None;
        }
        let alpha = self.smoothing_factor;
        let mut state = self.write();
        let seq = state.next_seq;
        let mut inserted = false;
        let device = state.devices.entry(id).or_insert_with(|| {
            inserted = true;
            Device {
                smoothed_signal: raw_signal,
                first_seen: timestamp,
                last_seen: timestamp,
                observations: 0,
                seq,
            }
        });
        if device.observations > 0 {
            device.smoothed_signal = alpha * raw_signal + (1.0 - alpha) * device.smoothed_signal;
        }
        device.observations += 1;
        device.last_seen = timestamp;
        let smoothed = device.smoothed_signal;
        if inserted {
            state.next_seq += 1;
        }
        Some(smoothed)
    }

    pub fn estimate_distance(&self, smoothed_signal: f64) -> f64 {
        self.model.estimate(smoothed_signal)
    }

    fn is_stale_at(&self, device: &Device, now: Timestamp) -> bool {
        now - device.last_seen > self.stale_window
    }

    fn view(&self, id: &DeviceId, device: &Device, now: Timestamp) -> DeviceView {
        DeviceView {
            id: id.clone(),
            short_label: id.short_label(),
            smoothed_signal: device.smoothed_signal,
            distance_m: self.model.estimate(device.smoothed_signal),
            first_seen: device.first_seen,
            last_seen: device.last_seen,
            observations: device.observations,
            stale: self.is_stale_at(device, now),
        }
    }

    /// All peers, strongest smoothed signal first. Ties keep first-seen order.
    pub fn devices(&self, now: Timestamp) -> Vec<DeviceView> {
        let state = self.read();
        let mut ranked: Vec<(&DeviceId, &Device)> = state.devices.iter().collect();
        ranked.sort_by(|(_, a), (_, b)| {
            b.smoothed_signal
                .total_cmp(&a.smoothed_signal)
                .then(a.seq.cmp(&b.seq))
        });
        ranked
            .into_iter()
            .map(|(id, device)| self.view(id, device, now))
            .collect()
    }

    pub fn device(&self, id: &DeviceId, now: Timestamp) -> Option<DeviceView> {
        let state = self.read();
        state
            .devices
            .get(id)
            .map(|device| self.view(id, device, now))
    }

    pub fn is_stale(&self, id: &DeviceId, now: Timestamp) -> Option<bool> {
        let state = self.read();
        state.devices.get(id).map(|d| self.is_stale_at(d, now))
    }

    pub fn len(&self) -> usize {
        self.read().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fresh_count(&self, now: Timestamp) -> usize {
        let state = self.read();
        state
            .devices
            .values()
            .filter(|d| !self.is_stale_at(d, now))
            .count()
    }
}

// ─── Scanning ────────────────────────────────────────────────────────────────

/// One advertisement of the distress service heard by the scanner.
#[derive(Clone, Debug, PartialEq)]
pub struct ScanObservation {
    pub device: DeviceId,
    pub rssi: f64,
    /// When the radio heard it, on the same clock as the tracker queries
    pub timestamp: Timestamp,
}

/// Platform adapter for the short-range radio scanner.
pub trait RadioScanner: Send + Sync {
    fn is_available(&self) -> bool;

    /// Advertisements heard since the previous poll.
    fn poll(&self) -> Vec<ScanObservation>;
}

/// Pumps scanner observations into the tracker until `shutdown` flips.
/// Scanning pauses while the scanner reports itself unavailable.
pub async fn scan_loop(
    scanner: Arc<dyn RadioScanner>,
    tracker: Arc<ProximityTracker>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> u64 {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut observed = 0u64;
    let mut scanning = false;

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

        let available = scanner.is_available();
        if available != scanning {
            if available {
                log::info!("[scan] radio available, scanning");
            } else {
                log::warn!("[scan] radio unavailable, scanning paused");
            }
            scanning = available;
        }
        if !scanning {
            continue;
        }

        for observation in scanner.poll() {
            let Some(smoothed) = tracker.observe(
                observation.device.clone(),
                observation.rssi,
                observation.timestamp,
            ) else {
                continue;
            };
            log::debug!(
                "[scan] {} rssi {:.1} smoothed {:.1}",
                observation.device.short_label(),
                observation.rssi,
                smoothed
            );
            observed += 1;
        }
    }

    log::info!(
        "[scan] stopped after {} observations of {} devices",
        observed,
        tracker.len()
    );
    observed
}
