//! Idle-power calibrator (C4): samples the RAPL reader at 1 Hz while a
//! socket is verified idle, producing a [`CalibrationProfile`].

use std::collections::HashSet;
use std::fs;
use std::thread;
use std::time::{Duration, Instant};

use log::warn;

use crate::calibration::CalibrationProfile;
use crate::error::{JouleTraceError, Result};
use crate::rapl::RaplReader;
use crate::topology::SocketTopology;

const WARMUP_DISCARD_DURATION: Duration = Duration::from_secs(1);
const SAMPLE_PERIOD: Duration = Duration::from_secs(1);
const CV_WARNING_THRESHOLD_PERCENT: f64 = 5.0;

/// Expands a `Cpus_allowed_list` value like `0,4-6` into the set of CPU ids.
fn expand_cpu_list(text: &str) -> HashSet<u32> {
    let mut set = HashSet::new();
    for part in text.trim().split(',') {
        if let Some((start, end)) = part.split_once('-') {
            if let (Ok(start), Ok(end)) = (start.parse::<u32>(), end.parse::<u32>()) {
                set.extend(start..=end);
            }
        } else if let Ok(n) = part.parse::<u32>() {
            set.insert(n);
        }
    }
    set
}

/// Returns true if no process other than the calling one has its CPU
/// affinity pinned onto one of `socket_cpus`.
fn socket_is_idle(socket_cpus: &[u32]) -> anyhow::Result<bool> {
    let socket_cpus: HashSet<u32> = socket_cpus.iter().copied().collect();
    let own_pid = std::process::id();

    for entry in fs::read_dir("/proc")? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(pid_str) = file_name.to_str() else { continue };
        let Ok(pid) = pid_str.parse::<u32>() else { continue };
        if pid == own_pid {
            continue;
        }

        let status_path = entry.path().join("status");
        let Ok(status) = fs::read_to_string(&status_path) else { continue };
        let Some(line) = status.lines().find(|l| l.starts_with("Cpus_allowed_list:")) else { continue };
        let list = line.trim_start_matches("Cpus_allowed_list:").trim();
        let allowed = expand_cpu_list(list);

        // A process pinned exactly onto the isolated socket's CPUs (and
        // nothing else) is presumed to be using it; a process that merely
        // may run anywhere (the common case) is not in the way.
        if !allowed.is_empty() && allowed.is_subset(&socket_cpus) {
            return Ok(false);
        }
    }
    Ok(true)
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn sample_stddev(values: &[f64], mean_value: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let variance = values.iter().map(|v| (v - mean_value).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

pub struct IdleCalibrator<'a> {
    reader: &'a mut RaplReader,
    topology: &'a SocketTopology,
}

impl<'a> IdleCalibrator<'a> {
    pub fn new(reader: &'a mut RaplReader, topology: &'a SocketTopology) -> Self {
        IdleCalibrator { reader, topology }
    }

    pub fn calibrate(&mut self, socket_id: u32, duration: Duration, valid_until_days: i64) -> Result<CalibrationProfile> {
        self.reader.read(socket_id)?; // fails fast with EnergyUnavailable if the socket cannot be read at all

        let socket_cpus = self.topology.cpus_of(socket_id)?;
        let idle = socket_is_idle(socket_cpus)
            .map_err(|e| JouleTraceError::SocketNotIdle(format!("checking process affinities: {e}")))?;
        if !idle {
            return Err(JouleTraceError::SocketNotIdle(format!(
                "a process is pinned to one or more CPUs of socket {socket_id}"
            )));
        }

        self.reader.invalidate(socket_id);
        let warmup_start = self.reader.read(socket_id)?;
        thread::sleep(WARMUP_DISCARD_DURATION);
        self.reader.invalidate(socket_id);
        let mut previous = self.reader.read(socket_id)?;
        let mut previous_at = Instant::now();
        let _ = warmup_start; // discarded: only used to settle the counter before the real window

        let mut power_samples = Vec::new();
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            thread::sleep(SAMPLE_PERIOD);
            self.reader.invalidate(socket_id);
            let now_reading = self.reader.read(socket_id)?;
            let now_at = Instant::now();

            let elapsed = (now_at - previous_at).as_secs_f64();
            if elapsed > 0.0 {
                let delta_j = now_reading.package_joules - previous.package_joules;
                if delta_j >= 0.0 {
                    power_samples.push(delta_j / elapsed);
                }
            }
            previous = now_reading;
            previous_at = now_at;
        }

        if power_samples.is_empty() {
            return Err(JouleTraceError::EnergyUnavailable(
                "no usable power samples collected during calibration".into(),
            ));
        }

        let mean_power = mean(&power_samples);
        let stddev = sample_stddev(&power_samples, mean_power);
        let cv_percent = if mean_power > 0.0 { stddev / mean_power * 100.0 } else { 0.0 };
        if cv_percent > CV_WARNING_THRESHOLD_PERCENT {
            warn!("socket {socket_id} idle-power CV% is {cv_percent:.2}, above the {CV_WARNING_THRESHOLD_PERCENT}% warning threshold");
        }

        let timestamp = time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .map_err(|e| JouleTraceError::Config(format!("formatting calibration timestamp: {e}")))?;

        Ok(CalibrationProfile {
            socket_id,
            idle_power_watts: median(&power_samples),
            mean_power_watts: mean_power,
            stddev_watts: stddev,
            cv_percent,
            measurements: power_samples.len(),
            duration_seconds: duration.as_secs_f64(),
            timestamp,
            valid_until_days,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_cpu_list_handles_ranges_and_singles() {
        let set = expand_cpu_list("0,4-6");
        assert_eq!(set, HashSet::from([0, 4, 5, 6]));
    }

    #[test]
    fn median_and_stddev_on_known_data() {
        let values = vec![10.0, 12.0, 11.0, 13.0, 9.0];
        assert_eq!(median(&values), 11.0);
        let m = mean(&values);
        assert!((m - 11.0).abs() < 1e-9);
        let sd = sample_stddev(&values, m);
        assert!(sd > 0.0);
    }
}
