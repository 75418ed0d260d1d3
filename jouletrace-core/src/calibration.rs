//! Calibration profile (C3): load/validate/persist a per-socket idle-power
//! baseline record.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::{JouleTraceError, Result};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CalibrationProfile {
    pub socket_id: u32,
    pub idle_power_watts: f64,
    pub mean_power_watts: f64,
    pub stddev_watts: f64,
    pub cv_percent: f64,
    pub measurements: usize,
    pub duration_seconds: f64,
    pub timestamp: String,
    pub valid_until_days: i64,
}

impl CalibrationProfile {
    pub fn load(path: &Path) -> Result<CalibrationProfile> {
        if !path.exists() {
            return Err(JouleTraceError::MissingCalibration(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| JouleTraceError::InvalidCalibration(format!("reading {}: {e}", path.display())))?;
        let profile: CalibrationProfile = serde_json::from_str(&text)
            .map_err(|e| JouleTraceError::InvalidCalibration(format!("parsing {}: {e}", path.display())))?;
        if profile.idle_power_watts <= 0.0 {
            return Err(JouleTraceError::InvalidCalibration(format!(
                "idle_power_watts must be positive, got {}",
                profile.idle_power_watts
            )));
        }
        Ok(profile)
    }

    /// `(usable, reason)` — reason is `"ok"` when usable, else the cause.
    pub fn is_usable(&self) -> (bool, String) {
        if self.idle_power_watts <= 0.0 {
            return (false, "idle_power_watts is not positive".to_string());
        }
        let captured_at = match OffsetDateTime::parse(&self.timestamp, &Rfc3339) {
            Ok(t) => t,
            Err(e) => return (false, format!("unparseable timestamp: {e}")),
        };
        let age_days = (OffsetDateTime::now_utc() - captured_at).whole_days();
        if age_days > self.valid_until_days {
            return (false, format!("expired: captured {age_days} days ago, valid for {}", self.valid_until_days));
        }
        (true, "ok".to_string())
    }

    pub fn baseline_energy_joules(&self, duration_seconds: f64) -> f64 {
        self.idle_power_watts * duration_seconds
    }

    /// Writes the profile atomically: a sibling temp file is written and
    /// fsynced, then renamed over `path`, so readers never observe a partial
    /// record.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| JouleTraceError::Config(format!("creating {}: {e}", parent.display())))?;
        }
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| JouleTraceError::Config(format!("serializing calibration profile: {e}")))?;

        let tmp_path = tmp_sibling(path);
        {
            let mut file = std::fs::File::create(&tmp_path)
                .map_err(|e| JouleTraceError::Config(format!("creating {}: {e}", tmp_path.display())))?;
            file.write_all(json.as_bytes())
                .map_err(|e| JouleTraceError::Config(format!("writing {}: {e}", tmp_path.display())))?;
            file.sync_all()
                .map_err(|e| JouleTraceError::Config(format!("fsyncing {}: {e}", tmp_path.display())))?;
        }
        std::fs::rename(&tmp_path, path)
            .map_err(|e| JouleTraceError::Config(format!("renaming {} to {}: {e}", tmp_path.display(), path.display())))?;
        Ok(())
    }
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}
