//! Typed configuration, loaded from an optional TOML file and overridable by
//! `JOULETRACE_<SECTION>_<FIELD>` environment variables. Every field has a
//! default matching the value named in the component design, so an absent or
//! empty config file is valid.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{JouleTraceError, Result};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RaplConfig {
    pub sysfs_root: String,
    pub cache_ttl_millis: u64,
}

impl Default for RaplConfig {
    fn default() -> Self {
        RaplConfig {
            sysfs_root: "/sys/class/powercap/intel-rapl".to_string(),
            cache_ttl_millis: 100,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub profile_path: String,
    pub validity_window_days: i64,
    pub default_duration_seconds: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        CalibrationConfig {
            profile_path: "/var/lib/jouletrace/calibration.json".to_string(),
            validity_window_days: 7,
            default_duration_seconds: 30.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub redis_url: String,
    pub key: String,
    pub lease_seconds: u64,
    pub acquire_poll_millis: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        LockConfig {
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
            key: "jouletrace:socket0:lock".to_string(),
            lease_seconds: 300,
            acquire_poll_millis: 500,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    pub min_trials: usize,
    pub max_trials: usize,
    pub target_cv_percent: f64,
    pub cooldown_seconds: f64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        AggregatorConfig {
            min_trials: 3,
            max_trials: 20,
            target_cv_percent: 5.0,
            cooldown_seconds: 0.5,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub settle_delay_millis: u64,
    pub min_trial_wall_seconds: f64,
    pub default_timeout_seconds: f64,
    pub default_memory_limit_mb: u64,
    pub interpreter_cmd: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            settle_delay_millis: 2,
            min_trial_wall_seconds: 0.1,
            default_timeout_seconds: 30.0,
            default_memory_limit_mb: 512,
            interpreter_cmd: vec!["python3".to_string()],
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub rapl: RaplConfig,
    pub calibration: CalibrationConfig,
    pub lock: LockConfig,
    pub aggregator: AggregatorConfig,
    pub executor: ExecutorConfig,
}

impl AppConfig {
    /// Loads from `path` if it exists, else returns defaults. Does not apply
    /// environment overrides by itself; see [`AppConfig::load_with_env`].
    pub fn load(path: &Path) -> Result<AppConfig> {
        if !path.exists() {
            return Ok(AppConfig::default());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| JouleTraceError::Config(format!("reading {}: {e}", path.display())))?;
        toml::from_str(&text).map_err(|e| JouleTraceError::Config(format!("parsing {}: {e}", path.display())))
    }

    /// Loads from `path` (or the `JOULETRACE_CONFIG` environment variable, or
    /// defaults if neither is set/present) and applies any `JOULETRACE_*`
    /// environment overrides on top.
    pub fn load_with_env(path: Option<&Path>) -> Result<AppConfig> {
        let resolved = match path {
            Some(p) => Some(p.to_path_buf()),
            None => std::env::var("JOULETRACE_CONFIG").ok().map(Into::into),
        };
        let mut config = match resolved {
            Some(p) => AppConfig::load(&p)?,
            None => AppConfig::default(),
        };
        apply_env_overrides(&mut config);
        Ok(config)
    }
}

fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(v) = std::env::var("JOULETRACE_RAPL_SYSFS_ROOT") {
        config.rapl.sysfs_root = v;
    }
    if let Ok(v) = std::env::var("JOULETRACE_CALIBRATION_PROFILE_PATH") {
        config.calibration.profile_path = v;
    }
    if let Ok(v) = std::env::var("JOULETRACE_LOCK_REDIS_URL") {
        config.lock.redis_url = v;
    }
    if let Ok(v) = std::env::var("JOULETRACE_LOCK_KEY") {
        config.lock.key = v;
    }
    if let Ok(v) = std::env::var("JOULETRACE_AGGREGATOR_MIN_TRIALS") {
        if let Ok(n) = v.parse() {
            config.aggregator.min_trials = n;
        }
    }
    if let Ok(v) = std::env::var("JOULETRACE_AGGREGATOR_MAX_TRIALS") {
        if let Ok(n) = v.parse() {
            config.aggregator.max_trials = n;
        }
    }
    if let Ok(v) = std::env::var("JOULETRACE_AGGREGATOR_TARGET_CV_PERCENT") {
        if let Ok(n) = v.parse() {
            config.aggregator.target_cv_percent = n;
        }
    }
    if let Ok(v) = std::env::var("JOULETRACE_EXECUTOR_INTERPRETER_CMD") {
        config.executor.interpreter_cmd = v.split_whitespace().map(str::to_owned).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_component_design() {
        let config = AppConfig::default();
        assert_eq!(config.calibration.validity_window_days, 7);
        assert_eq!(config.aggregator.min_trials, 3);
        assert_eq!(config.aggregator.max_trials, 20);
        assert_eq!(config.aggregator.target_cv_percent, 5.0);
        assert_eq!(config.lock.lease_seconds, 300);
        assert_eq!(config.executor.interpreter_cmd, vec!["python3".to_string()]);
    }

    #[test]
    fn absent_file_yields_defaults() {
        let config = AppConfig::load(Path::new("/nonexistent/jouletrace.toml")).unwrap();
        assert_eq!(config.aggregator.min_trials, AppConfig::default().aggregator.min_trials);
    }
}
