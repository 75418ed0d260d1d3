//! Statistical aggregator (C6): drives the executor across sequential
//! trials with cooldown, computing robust statistics and stopping early
//! once the target coefficient of variation is reached.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use log::info;

use crate::calibration::CalibrationProfile;
use crate::error::{JouleTraceError, Result};
use crate::executor::SocketExecutor;
use crate::model::{AggregatedResult, Confidence, MeasurementRequest, TrialResult};

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

fn assess_confidence(cv_percent: f64, successful: usize, min_trials: usize) -> Confidence {
    if successful < min_trials {
        return Confidence::Low;
    }
    if cv_percent < 5.0 {
        Confidence::High
    } else if cv_percent < 10.0 {
        Confidence::Medium
    } else {
        Confidence::Low
    }
}

pub struct StatisticalAggregator<'a> {
    executor: SocketExecutor<'a>,
}

impl<'a> StatisticalAggregator<'a> {
    pub fn new(executor: SocketExecutor<'a>) -> Self {
        StatisticalAggregator { executor }
    }

    pub fn aggregate(
        &mut self,
        request: &MeasurementRequest,
        profile: &CalibrationProfile,
        cpu_core: u32,
        cancel: &AtomicBool,
    ) -> Result<AggregatedResult> {
        let mut successful: Vec<TrialResult> = Vec::new();
        let mut failed_trials = 0usize;
        let mut stopped_early = false;
        let mut stop_reason = String::new();

        let mut trial_index = 0usize;
        while trial_index < request.max_trials {
            if cancel.load(Ordering::SeqCst) {
                return Err(JouleTraceError::Cancelled);
            }

            let trial = self.executor.run_trial(request, profile, cpu_core, trial_index, cancel)?;
            if !trial.success {
                failed_trials += 1;
                info!(
                    "trial {trial_index} failed: {}",
                    trial.failure_reason.as_deref().unwrap_or("unknown")
                );
                trial_index += 1;
                continue;
            }
            successful.push(trial);

            if successful.len() >= request.min_trials {
                let energies: Vec<f64> = successful.iter().map(|t| t.net_total_joules).collect();
                let m = mean(&energies);
                let cv_percent = if m > 0.0 { sample_stddev(&energies, m) / m * 100.0 } else { 0.0 };
                if cv_percent < request.target_cv_percent {
                    stopped_early = true;
                    stop_reason = "achieved target coefficient of variation".to_string();
                    trial_index += 1;
                    break;
                }
            }

            trial_index += 1;
            if trial_index >= request.max_trials {
                stop_reason = "max trials reached".to_string();
                break;
            }
            thread::sleep(Duration::from_secs_f64(request.cooldown_seconds));
        }

        if successful.is_empty() {
            return Err(JouleTraceError::AllTrialsFailed(format!(
                "all {failed_trials} trial(s) failed"
            )));
        }
        if successful.len() < request.min_trials {
            log::warn!(
                "only {} of the requested minimum {} trials succeeded",
                successful.len(),
                request.min_trials
            );
        }

        let energies: Vec<f64> = successful.iter().map(|t| t.net_total_joules).collect();
        let durations: Vec<f64> = successful.iter().map(|t| t.wall_duration_seconds).collect();
        let mean_energy = mean(&energies);
        let stddev_energy = sample_stddev(&energies, mean_energy);
        let cv_percent = if mean_energy > 0.0 { stddev_energy / mean_energy * 100.0 } else { 0.0 };
        let median_duration = median(&durations);
        let mean_power = if median_duration > 0.0 { mean_energy / median_duration } else { 0.0 };

        let total_trials = successful.len() + failed_trials;
        let confidence = assess_confidence(cv_percent, successful.len(), request.min_trials);

        Ok(AggregatedResult {
            successful_trials: successful.len(),
            failed_trials,
            total_trials,
            median_net_energy_joules: median(&energies),
            mean_net_energy_joules: mean_energy,
            stddev_net_energy_joules: stddev_energy,
            cv_percent,
            median_duration_seconds: median_duration,
            mean_power_watts: mean_power,
            confidence,
            stopped_early,
            stop_reason,
            trials: successful,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_trial_has_zero_stddev_and_low_confidence() {
        let values = vec![10.0];
        let m = mean(&values);
        assert_eq!(sample_stddev(&values, m), 0.0);
        assert_eq!(assess_confidence(0.0, 1, 3), Confidence::Low);
    }

    #[test]
    fn confidence_thresholds() {
        assert_eq!(assess_confidence(4.0, 5, 3), Confidence::High);
        assert_eq!(assess_confidence(7.0, 5, 3), Confidence::Medium);
        assert_eq!(assess_confidence(12.0, 5, 3), Confidence::Low);
    }

    #[test]
    fn median_even_and_odd() {
        assert_eq!(median(&[1.0, 2.0, 3.0]), 2.0);
        assert_eq!(median(&[1.0, 2.0, 3.0, 4.0]), 2.5);
    }
}
