use thiserror::Error;

/// Top-level error taxonomy for a measurement request.
///
/// Component-internal plumbing (file I/O, parsing) uses `anyhow::Result` and
/// is converted into one of these variants with `.context(...)` at the
/// component boundary, never surfaced to a caller as a raw `anyhow::Error`.
#[derive(Error, Debug)]
pub enum JouleTraceError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("RAPL energy counters unavailable: {0}")]
    EnergyUnavailable(String),

    #[error("bad CPU/socket id: {0}")]
    BadCpu(String),

    #[error("no calibration profile found at {0}")]
    MissingCalibration(String),

    #[error("calibration profile is invalid: {0}")]
    InvalidCalibration(String),

    #[error("calibration profile is stale: {0}")]
    StaleCalibration(String),

    #[error("socket is not idle: {0}")]
    SocketNotIdle(String),

    #[error("rollover delta is ambiguous (possible double wrap): {0}")]
    RolloverAmbiguous(String),

    #[error("trial failed: {0}")]
    TrialFailed(String),

    #[error("all trials failed: {0}")]
    AllTrialsFailed(String),

    #[error("isolated socket is busy: {0}")]
    Busy(String),

    #[error("measurement was cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, JouleTraceError>;
