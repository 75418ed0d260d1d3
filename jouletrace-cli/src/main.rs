use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use cli::{Cli, Commands};
use jouletrace_core::calibrator::IdleCalibrator;
use jouletrace_core::model::{MeasurementRequest, ResponseStatus};
use jouletrace_core::orchestrator::MeasurementService;
use jouletrace_core::rapl::RaplReader;
use jouletrace_core::topology::SocketTopology;
use jouletrace_core::validator::PythonSubprocessValidator;
use jouletrace_core::AppConfig;

mod cli;

/// `jtrace measure` exit codes, distinct per outcome so calling scripts can
/// branch without parsing the response body.
const EXIT_COMPLETED: i32 = 0;
const EXIT_MEASUREMENT_FAILED: i32 = 1;
const EXIT_VALIDATION_FAILED: i32 = 2;
const EXIT_BUSY: i32 = 3;
const EXIT_CANCELLED: i32 = 4;

fn main() -> Result<()> {
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::init_from_env(env);

    let cli = Cli::parse();
    let config = AppConfig::load_with_env(cli.config.as_deref()).context("loading configuration")?;

    let exit_code = match cli.command {
        Commands::Calibrate { socket, duration, strict } => {
            run_calibrate(&config, socket, duration, strict)?;
            EXIT_COMPLETED
        }
        Commands::Measure { request } => run_measure(&config, &request)?,
        Commands::Topology => {
            run_topology()?;
            EXIT_COMPLETED
        }
        Commands::LockStatus => {
            run_lock_status(&config)?;
            EXIT_COMPLETED
        }
    };

    std::process::exit(exit_code);
}

fn run_calibrate(config: &AppConfig, socket: u32, duration: Option<f64>, strict: bool) -> Result<()> {
    let topology = SocketTopology::discover().context("discovering topology")?;
    let mut reader = RaplReader::discover(&config.rapl.sysfs_root, Duration::from_millis(config.rapl.cache_ttl_millis))
        .context("discovering RAPL zones")?;
    let duration = Duration::from_secs_f64(duration.unwrap_or(config.calibration.default_duration_seconds));

    let mut calibrator = IdleCalibrator::new(&mut reader, &topology);
    let profile = calibrator
        .calibrate(socket, duration, config.calibration.validity_window_days)
        .context("calibrating idle power")?;

    info!(
        "socket {socket}: idle power {:.2} W (CV {:.2}%) over {} samples",
        profile.idle_power_watts, profile.cv_percent, profile.measurements
    );

    if strict && profile.cv_percent > 5.0 {
        anyhow::bail!("CV% {:.2} exceeds the strict threshold; profile not written", profile.cv_percent);
    }

    let path = std::path::Path::new(&config.calibration.profile_path);
    profile.save(path).context("saving calibration profile")?;
    println!("wrote calibration profile to {}", path.display());
    Ok(())
}

fn run_measure(config: &AppConfig, request_path: &std::path::Path) -> Result<i32> {
    let text = std::fs::read_to_string(request_path).with_context(|| format!("reading {}", request_path.display()))?;
    let request: MeasurementRequest = serde_json::from_str(&text).context("parsing measurement request")?;

    let topology = SocketTopology::discover().context("discovering topology")?;
    let validator = Arc::new(PythonSubprocessValidator::new(config.executor.interpreter_cmd.clone()));
    let service = MeasurementService::new(config.clone(), topology, validator).context("constructing measurement service")?;

    let cancel = AtomicBool::new(false);
    let response = service.measure(&request, &cancel);
    let exit_code = match response.status {
        ResponseStatus::Completed => EXIT_COMPLETED,
        ResponseStatus::ValidationFailed => EXIT_VALIDATION_FAILED,
        ResponseStatus::Busy => EXIT_BUSY,
        ResponseStatus::Cancelled => EXIT_CANCELLED,
        ResponseStatus::Failed => EXIT_MEASUREMENT_FAILED,
    };
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(exit_code)
}

fn run_topology() -> Result<()> {
    let topology = SocketTopology::discover().context("discovering topology")?;
    for socket in topology.socket_ids() {
        let cpus = topology.cpus_of(socket)?;
        println!("socket {socket}: cpus {cpus:?}");
    }
    Ok(())
}

fn run_lock_status(config: &AppConfig) -> Result<()> {
    let lock = jouletrace_core::lock::SerializationLock::new(
        &config.lock.redis_url,
        &config.lock.key,
        Duration::from_secs(config.lock.lease_seconds),
        Duration::from_millis(config.lock.acquire_poll_millis),
    )
    .context("connecting to lock backend")?;

    match lock.acquire_guarded(Duration::from_millis(0))? {
        Some(_guard) => println!("lock is currently free (acquired and released for this check)"),
        None => println!("lock is currently held"),
    }
    Ok(())
}

