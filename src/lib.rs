//! Personal-safety core: fall/incident detection, a confirmation-gated
//! emergency lifecycle driving a distress beacon and siren, and proximity
//! tracking of nearby peers broadcasting distress.
//!
//! Platform radios, audio and sensors sit behind the `RadioBeacon`,
//! `AlarmOutput`, `RadioScanner` and `SensorSource` traits; `simulation`
//! provides in-process stand-ins.

pub mod clock;
pub mod config;
pub mod detector;
pub mod emergency;
pub mod error;
pub mod events;
pub mod incident;
pub mod proximity;
pub mod sensors;
pub mod simulation;
pub mod status;
pub mod timer;

pub use clock::{Clock, ManualClock, MonotonicClock, Timestamp, TokioClock};
pub use config::Config;
pub use emergency::{
    AlarmOutput, Availability, EmergencyManager, EmergencyState, RadioBeacon, UserResponse,
};
pub use error::{IgathaError, Result};
pub use events::{EmergencyEvent, Subscription};
pub use incident::{ExceededEvent, Incident, IncidentCorrelator, IncidentDetector};
pub use proximity::{DeviceId, DeviceView, PathLossExponent, ProximityTracker, RadioScanner};
pub use sensors::{Reading, SensorKind, SensorSample, SensorSource};
pub use timer::{ManualScheduler, Scheduler, TimerHandle, TokioScheduler};
