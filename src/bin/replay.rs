use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use clap::Parser;
use flate2::read::GzDecoder;
use igatha_rs::config::Config;
use igatha_rs::incident::IncidentDetector;
use igatha_rs::sensors::{Reading, SensorKind, SensorSample};
use serde::Deserialize;
use serde_json::json;

#[derive(Parser, Debug)]
struct Args {
    /// Path to a recorded sample log (.json or .json.gz)
    #[arg(long, conflicts_with = "log_dir")]
    log: Option<PathBuf>,

    /// Directory of sample logs to batch replay (processes *.json[.gz])
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// TOML config with detector thresholds
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the correlation window (seconds)
    #[arg(long)]
    window: Option<f64>,
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum LoggedSample {
    Acceleration { timestamp: f64, x: f64, y: f64, z: f64 },
    Rotation { timestamp: f64, x: f64, y: f64, z: f64 },
    Pressure { timestamp: f64, kpa: f64 },
}

impl LoggedSample {
    fn into_sample(self) -> SensorSample {
        match self {
            LoggedSample::Acceleration { timestamp, x, y, z } => {
                SensorSample::new(SensorKind::Acceleration, Reading::motion(x, y, z), timestamp)
            }
            LoggedSample::Rotation { timestamp, x, y, z } => {
                SensorSample::new(SensorKind::Rotation, Reading::motion(x, y, z), timestamp)
            }
            LoggedSample::Pressure { timestamp, kpa } => {
                SensorSample::new(SensorKind::PressureDelta, Reading::Pressure(kpa), timestamp)
            }
        }
    }
}

#[derive(Deserialize)]
struct LogFile {
    samples: Vec<LoggedSample>,
}

fn load_log(path: &Path) -> anyhow::Result<LogFile> {
    let file = File::open(path)?;
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        let reader = BufReader::new(GzDecoder::new(file));
        Ok(serde_json::from_reader(reader)?)
    } else {
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }
}

fn run_once(path: &Path, config: &Config) -> anyhow::Result<serde_json::Value> {
    let log = load_log(path)?;
    let mut detector = IncidentDetector::new(config);
    detector.start();

    let mut incidents = Vec::new();
    let mut sample_count = 0usize;
    let mut last_timestamp = f64::NEG_INFINITY;
    for logged in log.samples {
        let sample = logged.into_sample();
        if sample.timestamp < last_timestamp {
            log::warn!(
                "{}: sample at {:.3}s is out of order (after {:.3}s)",
                path.display(),
                sample.timestamp,
                last_timestamp
            );
        }
        last_timestamp = last_timestamp.max(sample.timestamp);
        sample_count += 1;

        // Replayed time: now is the latest timestamp seen
        if let Some(incident) = detector.observe(&sample, last_timestamp) {
            println!(
                "[INCIDENT] t={:.3}s spread={:.3}s",
                incident.detected_at,
                incident.spread()
            );
            incidents.push(incident);
        }
    }

    Ok(json!({
        "log": path.display().to_string(),
        "samples": sample_count,
        "correlation_window_secs": config.correlation_window_secs,
        "exceeded": {
            "accel": detector.exceeded_count(SensorKind::Acceleration),
            "gyro": detector.exceeded_count(SensorKind::Rotation),
            "baro": detector.exceeded_count(SensorKind::PressureDelta),
        },
        "incident_count": incidents.len(),
        "incidents": incidents,
    }))
}

fn is_sample_log(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    path.is_file() && (name.ends_with(".json") || name.ends_with(".json.gz"))
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();

    let mut config = match args.config.as_ref() {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(window) = args.window {
        config.correlation_window_secs = window;
    }
    config.validate()?;

    let mut results = Vec::new();
    if let Some(dir) = args.log_dir.as_ref() {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if is_sample_log(&path) {
                paths.push(path);
            }
        }
        paths.sort();
        for path in paths {
            match run_once(&path, &config) {
                Ok(res) => results.push(res),
                Err(e) => eprintln!("Failed {}: {}", path.display(), e),
            }
        }
    } else if let Some(log) = args.log.as_ref() {
        results.push(run_once(log, &config)?);
    } else {
        anyhow::bail!("Provide --log or --log-dir");
    }

    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}
