//! Socket executor (C5): runs one measured trial of the candidate code,
//! pinned to a fixed CPU core, bracketed by RAPL reads.

use std::io::{Read, Write};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::calibration::CalibrationProfile;
use crate::error::{JouleTraceError, Result};
use crate::model::{MeasurementRequest, TrialResult};
use crate::rapl::{rollover_aware_delta, EnergyReader};
use crate::topology::SocketTopology;

/// Stable driver asset: reads `(code, entry_point, inputs, min_wall_time)`
/// from stdin as one JSON blob. No code templating, so nothing the
/// candidate's source text contains can corrupt the generated program.
const DRIVER_SOURCE: &str = include_str!("driver.py");

#[derive(Serialize)]
struct DriverPayload<'a> {
    code: &'a str,
    entry_point: &'a str,
    inputs: &'a [crate::model::InputShape],
    min_wall_time_seconds: f64,
}

enum ChildOutcome {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

fn pin_to_cpu(cpu: u32) -> std::io::Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu as usize, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Caps RLIMIT_AS to `bytes`, clamped to the existing hard limit. Never
/// raises the limit, and never touches RLIMIT_CPU: a SIGXCPU on the child
/// would not help us and nothing here enforces wall-clock time this way.
fn cap_address_space(bytes: u64) -> std::io::Result<()> {
    unsafe {
        let mut current: libc::rlimit = std::mem::zeroed();
        if libc::getrlimit(libc::RLIMIT_AS, &mut current) != 0 {
            return Err(std::io::Error::last_os_error());
        }
        let requested = bytes as libc::rlim_t;
        let new_soft = if current.rlim_max == libc::RLIM_INFINITY {
            requested
        } else {
            requested.min(current.rlim_max)
        };
        let new_limit = libc::rlimit {
            rlim_cur: new_soft,
            rlim_max: current.rlim_max,
        };
        if libc::setrlimit(libc::RLIMIT_AS, &new_limit) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

fn become_process_group_leader() -> std::io::Result<()> {
    if unsafe { libc::setpgid(0, 0) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Waits for `child` to exit, racing a timeout against external cancellation.
/// A background watcher thread polls `cancel` independently of the main
/// poll loop below, so a trial can be killed mid-wait rather than only
/// between trials.
fn wait_with_timeout(child: &mut Child, timeout: Duration, cancel: &AtomicBool) -> std::io::Result<ChildOutcome> {
    let pid = child.id() as i32;
    let done = AtomicBool::new(false);
    let cancelled = AtomicBool::new(false);

    thread::scope(|scope| {
        scope.spawn(|| {
            while !done.load(Ordering::SeqCst) {
                if cancel.load(Ordering::SeqCst) {
                    cancelled.store(true, Ordering::SeqCst);
                    unsafe {
                        libc::kill(-pid, libc::SIGKILL);
                    }
                    return;
                }
                thread::sleep(Duration::from_millis(20));
            }
        });

        let start = Instant::now();
        let outcome = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Ok(ChildOutcome::Exited(status)),
                Ok(None) => {}
                Err(e) => break Err(e),
            }
            if cancelled.load(Ordering::SeqCst) {
                let _ = child.wait();
                break Ok(ChildOutcome::Cancelled);
            }
            if start.elapsed() >= timeout {
                unsafe {
                    libc::kill(-pid, libc::SIGKILL);
                }
                let _ = child.wait();
                break Ok(ChildOutcome::TimedOut);
            }
            thread::sleep(Duration::from_millis(20));
        };
        done.store(true, Ordering::SeqCst);
        outcome
    })
}

pub struct SocketExecutor<'a> {
    reader: &'a mut dyn EnergyReader,
    topology: &'a SocketTopology,
    interpreter_cmd: &'a [String],
    settle_delay: Duration,
}

impl<'a> SocketExecutor<'a> {
    pub fn new(
        reader: &'a mut dyn EnergyReader,
        topology: &'a SocketTopology,
        interpreter_cmd: &'a [String],
        settle_delay: Duration,
    ) -> Self {
        SocketExecutor {
            reader,
            topology,
            interpreter_cmd,
            settle_delay,
        }
    }

    pub fn run_trial(
        &mut self,
        request: &MeasurementRequest,
        profile: &CalibrationProfile,
        cpu_core: u32,
        trial_index: usize,
        cancel: &AtomicBool,
    ) -> Result<TrialResult> {
        let socket_id = self.topology.socket_of(cpu_core)?;

        // Scoped acquisition: the driver file is removed on drop regardless
        // of how this function returns, including on an early `?`.
        let mut driver_file = tempfile::Builder::new()
            .prefix("jouletrace-driver-")
            .suffix(".py")
            .tempfile()
            .map_err(|e| JouleTraceError::TrialFailed(format!("creating driver file: {e}")))?;
        driver_file
            .write_all(DRIVER_SOURCE.as_bytes())
            .map_err(|e| JouleTraceError::TrialFailed(format!("writing driver file: {e}")))?;
        driver_file
            .flush()
            .map_err(|e| JouleTraceError::TrialFailed(format!("flushing driver file: {e}")))?;
        let driver_path = driver_file.path().to_path_buf();

        let inputs: Vec<crate::model::InputShape> = request.test_cases.iter().map(|t| t.input.clone()).collect();
        let payload = DriverPayload {
            code: &request.code,
            entry_point: &request.entry_point,
            inputs: &inputs,
            min_wall_time_seconds: request.min_trial_wall_seconds,
        };
        let payload_json = serde_json::to_vec(&payload)
            .map_err(|e| JouleTraceError::TrialFailed(format!("encoding driver payload: {e}")))?;

        let memory_limit_bytes = request.memory_limit_mb * 1024 * 1024;
        let timeout = Duration::from_secs_f64(request.timeout_seconds);

        let mut cmd = Command::new(&self.interpreter_cmd[0]);
        cmd.args(&self.interpreter_cmd[1..]);
        cmd.arg(&driver_path);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());

        // Safety: the closure only calls async-signal-safe libc functions
        // (sched_setaffinity, getrlimit/setrlimit, setpgid) between fork and
        // exec, and performs no allocation on the Rust side.
        unsafe {
            cmd.pre_exec(move || {
                become_process_group_leader()?;
                pin_to_cpu(cpu_core)?;
                cap_address_space(memory_limit_bytes)?;
                Ok(())
            });
        }

        self.reader.invalidate(socket_id);
        thread::sleep(self.settle_delay);
        let before = self.reader.read(socket_id)?;
        let wall_start = Instant::now();

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => return Ok(TrialResult::failed(trial_index, cpu_core, format!("spawn failed: {e}"))),
        };

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(&payload_json);
            // drop closes stdin, signaling EOF to the driver
        }

        let mut stderr_handle = child.stderr.take();
        let stderr_reader = thread::spawn(move || {
            let mut buf = String::new();
            if let Some(stderr) = stderr_handle.as_mut() {
                let _ = stderr.read_to_string(&mut buf);
            }
            buf
        });

        let outcome = match wait_with_timeout(&mut child, timeout, cancel) {
            Ok(o) => o,
            Err(e) => return Ok(TrialResult::failed(trial_index, cpu_core, format!("wait failed: {e}"))),
        };

        let wall_duration = wall_start.elapsed().as_secs_f64();
        self.reader.invalidate(socket_id);
        thread::sleep(self.settle_delay);
        let after = self.reader.read(socket_id)?;

        let stderr_text = stderr_reader.join().unwrap_or_default();

        match outcome {
            ChildOutcome::Cancelled => {
                return Ok(TrialResult::failed(trial_index, cpu_core, "cancelled"));
            }
            ChildOutcome::TimedOut => {
                return Ok(TrialResult::failed(trial_index, cpu_core, "timeout"));
            }
            ChildOutcome::Exited(status) if !status.success() => {
                let reason = if stderr_text.trim().is_empty() {
                    format!("exited with {status}")
                } else {
                    stderr_text.trim().to_string()
                };
                return Ok(TrialResult::failed(trial_index, cpu_core, reason));
            }
            ChildOutcome::Exited(_) => {}
        }

        let wrap_range = self.reader.package_wrap_range_joules(socket_id)?;
        let raw_package = rollover_aware_delta(before.package_joules, after.package_joules, wrap_range)?;
        let raw_dram = rollover_aware_delta(before.dram_joules, after.dram_joules, wrap_range).unwrap_or(0.0);

        let baseline = profile.baseline_energy_joules(wall_duration);
        let net_package = (raw_package - baseline).max(0.0);
        let net_total = net_package + raw_dram.max(0.0);

        Ok(TrialResult {
            trial_index,
            success: true,
            failure_reason: None,
            wall_duration_seconds: wall_duration,
            raw_package_joules: raw_package,
            raw_dram_joules: raw_dram,
            baseline_joules: baseline,
            net_package_joules: net_package,
            net_total_joules: net_total,
            cpu_core,
        })
    }
}
