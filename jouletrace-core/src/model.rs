use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One test input: dispatched to the user's entry point according to its shape.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputShape {
    Mapping(serde_json::Map<String, Value>),
    Sequence(Vec<Value>),
    Scalar(Value),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TestCase {
    pub input: InputShape,
    pub expected_output: Option<Value>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MeasurementRequest {
    pub request_id: String,
    pub code: String,
    pub entry_point: String,
    pub test_cases: Vec<TestCase>,

    #[serde(default = "defaults::timeout_seconds")]
    pub timeout_seconds: f64,
    #[serde(default = "defaults::memory_limit_mb")]
    pub memory_limit_mb: u64,

    #[serde(default = "defaults::min_trials")]
    pub min_trials: usize,
    #[serde(default = "defaults::max_trials")]
    pub max_trials: usize,
    #[serde(default = "defaults::target_cv_percent")]
    pub target_cv_percent: f64,
    #[serde(default = "defaults::cooldown_seconds")]
    pub cooldown_seconds: f64,
    #[serde(default = "defaults::min_trial_wall_seconds")]
    pub min_trial_wall_seconds: f64,
}

impl MeasurementRequest {
    /// Structural validation only; does not touch the filesystem or the
    /// isolated socket.
    pub fn validate(&self) -> Result<(), String> {
        if self.code.trim().is_empty() {
            return Err("code must not be empty".into());
        }
        if self.entry_point.trim().is_empty() {
            return Err("entry_point must not be empty".into());
        }
        if self.test_cases.is_empty() {
            return Err("test_cases must not be empty".into());
        }
        if !(1.0..=300.0).contains(&self.timeout_seconds) {
            return Err("timeout_seconds must be in [1, 300]".into());
        }
        if !(64..=8192).contains(&self.memory_limit_mb) {
            return Err("memory_limit_mb must be in [64, 8192]".into());
        }
        if self.min_trials == 0 || self.min_trials > self.max_trials {
            return Err("min_trials must be >= 1 and <= max_trials".into());
        }
        if self.max_trials > 100 {
            return Err("max_trials must be <= 100".into());
        }
        Ok(())
    }
}

mod defaults {
    pub fn timeout_seconds() -> f64 {
        30.0
    }
    pub fn memory_limit_mb() -> u64 {
        512
    }
    pub fn min_trials() -> usize {
        3
    }
    pub fn max_trials() -> usize {
        20
    }
    pub fn target_cv_percent() -> f64 {
        5.0
    }
    pub fn cooldown_seconds() -> f64 {
        0.5
    }
    pub fn min_trial_wall_seconds() -> f64 {
        0.1
    }
}

/// An instantaneous cumulative-energy sample from one socket.
#[derive(Clone, Copy, Debug, Default)]
pub struct EnergyReading {
    pub socket_id: u32,
    pub package_joules: f64,
    pub dram_joules: f64,
}

#[derive(Clone, Debug)]
pub struct TrialResult {
    pub trial_index: usize,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub wall_duration_seconds: f64,
    pub raw_package_joules: f64,
    pub raw_dram_joules: f64,
    pub baseline_joules: f64,
    pub net_package_joules: f64,
    pub net_total_joules: f64,
    pub cpu_core: u32,
}

impl TrialResult {
    pub fn failed(trial_index: usize, cpu_core: u32, reason: impl Into<String>) -> Self {
        TrialResult {
            trial_index,
            success: false,
            failure_reason: Some(reason.into()),
            wall_duration_seconds: 0.0,
            raw_package_joules: 0.0,
            raw_dram_joules: 0.0,
            baseline_joules: 0.0,
            net_package_joules: 0.0,
            net_total_joules: 0.0,
            cpu_core,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Confidence::High => "high",
            Confidence::Medium => "medium",
            Confidence::Low => "low",
        };
        f.write_str(s)
    }
}

#[derive(Clone, Debug)]
pub struct AggregatedResult {
    pub successful_trials: usize,
    pub failed_trials: usize,
    pub total_trials: usize,
    pub trials: Vec<TrialResult>,
    pub median_net_energy_joules: f64,
    pub mean_net_energy_joules: f64,
    pub stddev_net_energy_joules: f64,
    pub cv_percent: f64,
    pub median_duration_seconds: f64,
    pub mean_power_watts: f64,
    pub confidence: Confidence,
    pub stopped_early: bool,
    pub stop_reason: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CorrectnessReport {
    pub is_correct: bool,
    pub passed_tests: usize,
    pub total_tests: usize,
    pub summary: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Completed,
    ValidationFailed,
    Cancelled,
    Failed,
    Busy,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnergyMetrics {
    pub median_package_energy_joules: f64,
    pub median_ram_energy_joules: f64,
    pub median_total_energy_joules: f64,
    pub median_execution_time_seconds: f64,
    pub energy_per_test_case_joules: f64,
    pub power_consumption_watts: f64,
    pub energy_efficiency_score: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MeasurementEnvironment {
    pub meter_type: String,
    pub measurement_core: u32,
    pub timestamp: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub request_id: String,
    pub status: ResponseStatus,
    pub validation: Option<CorrectnessReport>,
    pub energy_metrics: Option<EnergyMetrics>,
    pub measurement_environment: Option<MeasurementEnvironment>,
    pub processing_time_seconds: f64,
    pub failure_reason: Option<String>,
}
