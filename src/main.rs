use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep, Duration, Instant};

use igatha_rs::emergency::{EmergencyManager, EmergencyState, UserResponse};
use igatha_rs::events::EmergencyEvent;
use igatha_rs::proximity::{scan_loop, ProximityTracker};
use igatha_rs::sensors::{sample_loop, SensorKind, SensorSource};
use igatha_rs::simulation::{SimulatedAlarm, SimulatedBeacon, SimulatedScanner, SimulatedSensor};
use igatha_rs::status::StatusSnapshot;
use igatha_rs::{Clock, Config, MonotonicClock, TokioScheduler};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Scenario {
    /// Phone at rest, nothing happens
    Quiet,
    /// Impact on all three sensors at --event-at
    Fall,
    /// User presses SOS at --event-at
    Manual,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum AutoRespond {
    None,
    Okay,
    Help,
}

#[derive(Parser, Debug)]
#[command(name = "igatha")]
#[command(about = "Personal-safety core running against simulated sensors and radios", long_about = None)]
struct Args {
    /// Duration in seconds (0 = continuous)
    #[arg(value_name = "SECONDS", default_value = "30")]
    duration: u64,

    /// TOML config file; defaults apply to missing keys
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "fall")]
    scenario: Scenario,

    /// Seconds after start at which the scenario event happens
    #[arg(long, default_value = "5")]
    event_at: f64,

    /// How the simulated user answers "are you okay?"
    #[arg(long, value_enum, default_value = "none")]
    auto_respond: AutoRespond,

    /// Seconds the simulated user takes to answer
    #[arg(long, default_value = "3")]
    respond_after: f64,

    /// Override the confirmation grace period (seconds)
    #[arg(long)]
    grace_period: Option<f64>,

    /// Number of simulated peers broadcasting distress nearby
    #[arg(long, default_value = "3")]
    peers: usize,

    /// Output directory
    #[arg(long, default_value = "igatha_sessions")]
    output_dir: PathBuf,
}

const PEER_ADDRESSES: [(&str, f64); 5] = [
    ("5C:F3:70:1A:22:01", -58.0),
    ("5C:F3:70:1A:22:02", -71.0),
    ("A4:C1:38:9E:10:7B", -84.0),
    ("A4:C1:38:9E:10:7C", -66.0),
    ("F0:08:D1:44:05:E9", -92.0),
];

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match args.config.as_ref() {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(secs) = args.grace_period {
        config.confirmation_grace_period_secs = secs;
    }
    config.validate()?;

    println!("[{}] Igatha starting", ts_now());
    println!("  Duration: {} seconds (0=continuous)", args.duration);
    println!("  Scenario: {:?} at {:.1}s", args.scenario, args.event_at);
    println!("  Auto respond: {:?}", args.auto_respond);
    println!("  Grace period: {:.0}s", config.confirmation_grace_period_secs);
    println!("  Output Dir: {}", args.output_dir.display());

    std::fs::create_dir_all(&args.output_dir)?;

    // Adapters
    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());
    let beacon = Arc::new(SimulatedBeacon::new(config.beacon_service_id.clone()));
    let alarm = Arc::new(SimulatedAlarm::new());
    let sensors: Vec<Arc<SimulatedSensor>> = SensorKind::ALL
        .iter()
        .map(|kind| Arc::new(SimulatedSensor::new(*kind)))
        .collect();
    let peers = &PEER_ADDRESSES[..args.peers.min(PEER_ADDRESSES.len())];
    let scanner = Arc::new(SimulatedScanner::new(peers, Arc::clone(&clock)));

    let manager = EmergencyManager::new(
        &config,
        beacon,
        alarm,
        Arc::new(TokioScheduler::current()?),
        Arc::clone(&clock),
    );
    let tracker = Arc::new(ProximityTracker::new(&config));

    // Event log on its own thread; ends when the manager shuts down
    let events = manager.subscribe();
    let event_printer = std::thread::spawn(move || {
        while let Some(event) = events.recv() {
            print_event(&event);
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();
    for sensor in &sensors {
        let source: Arc<dyn SensorSource> = sensor.clone();
        tasks.push(tokio::spawn(sample_loop(
            source,
            manager.clone(),
            Arc::clone(&clock),
            config.sensor_update_interval(),
            shutdown_rx.clone(),
        )));
    }
    let scan_task = tokio::spawn(scan_loop(
        scanner,
        Arc::clone(&tracker),
        Duration::from_secs(1),
        shutdown_rx,
    ));

    if !manager.start_detector() {
        println!("[{}] Detector unavailable, running proximity only", ts_now());
    }

    let start = Instant::now();
    let mut event_fired = false;
    let mut pending_since: Option<Instant> = None;
    let mut last_status_update = Instant::now();
    let status_path = args.output_dir.join("live_status.json");

    println!("[{}] Monitoring...", ts_now());

    loop {
        let elapsed = start.elapsed().as_secs_f64();
        if args.duration > 0 && elapsed >= args.duration as f64 {
            println!("[{}] Duration reached, stopping...", ts_now());
            break;
        }

        if !event_fired && elapsed >= args.event_at {
            event_fired = true;
            match args.scenario {
                Scenario::Quiet => {}
                Scenario::Fall => {
                    println!("[{}] Simulating fall", ts_now());
                    sensors.iter().for_each(|s| s.trigger_fall());
                }
                Scenario::Manual => {
                    println!("[{}] Simulating SOS button", ts_now());
                    if let Err(e) = manager.try_start_sos() {
                        println!("[{}] SOS failed: {}", ts_now(), e);
                    }
                }
            }
        }

        if manager.state() == EmergencyState::PendingConfirmation {
            let since = *pending_since.get_or_insert_with(Instant::now);
            if since.elapsed().as_secs_f64() >= args.respond_after {
                match args.auto_respond {
                    AutoRespond::None => {}
                    AutoRespond::Okay => manager.respond(UserResponse::Okay),
                    AutoRespond::Help => manager.respond(UserResponse::NeedHelp),
                }
            }
        } else {
            pending_since = None;
        }

        if last_status_update.elapsed() >= Duration::from_secs(2) {
            let snapshot = StatusSnapshot::capture(&manager, &tracker, clock.now());
            if let Err(e) = snapshot.save(&status_path) {
                log::warn!("Failed to write {}: {}", status_path.display(), e);
            }
            last_status_update = Instant::now();
        }

        tokio::select! {
            _ = sleep(Duration::from_millis(100)) => {}
            _ = tokio::signal::ctrl_c() => {
                println!("[{}] Interrupted, stopping...", ts_now());
                break;
            }
        }
    }

    // Shutdown: stop loops, then the lifecycle
    let _ = shutdown_tx.send(true);
    let mut samples = 0u64;
    for task in tasks {
        samples += task.await?;
    }
    let observations = scan_task.await?;

    let final_status = StatusSnapshot::capture(&manager, &tracker, clock.now());
    manager.shutdown();
    let _ = event_printer.join();

    let final_path = args
        .output_dir
        .join(format!("status_{}_final.json", ts_now_clean()));
    final_status.save(&final_path)?;
    println!("[{}] Final status written to {}", ts_now(), final_path.display());

    println!("\n=== Final Stats ===");
    println!("Final state: {:?}", final_status.state);
    println!("Sensor samples: {}", samples);
    println!("Incidents: {}", final_status.incidents_detected);
    println!("Scan observations: {}", observations);
    for device in &final_status.devices {
        println!(
            "  {}  {:>6.1} dBm  {:>8.3} m{}",
            device.short_label,
            device.smoothed_signal,
            device.distance_m,
            if device.stale { "  (stale)" } else { "" }
        );
    }

    Ok(())
}

fn print_event(event: &EmergencyEvent) {
    match event {
        EmergencyEvent::StateChanged { from, to } => {
            println!("[{}] State: {:?} -> {:?}", ts_now(), from, to)
        }
        EmergencyEvent::IncidentDetected(incident) => println!(
            "[{}] Incident detected (spread {:.2}s)",
            ts_now(),
            incident.spread()
        ),
        EmergencyEvent::ConfirmationRequested { deadline } => println!(
            "[{}] Are you okay? Escalating at t={:.1}s",
            ts_now(),
            deadline
        ),
        EmergencyEvent::SosStarted => println!("[{}] SOS ACTIVE", ts_now()),
        EmergencyEvent::SosStopped => println!("[{}] SOS stopped", ts_now()),
        EmergencyEvent::AvailabilityChanged(availability) => println!(
            "[{}] Availability: detector={} sos={}",
            ts_now(),
            availability.detector_available,
            availability.sos_available
        ),
    }
}

fn ts_now() -> String {
    Utc::now().format("%H:%M:%S").to_string()
}

fn ts_now_clean() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}
