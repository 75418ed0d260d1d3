//! Measurement orchestrator (C8): the request-level state machine —
//! validate request, validate correctness, acquire the serialization lock,
//! load calibration, aggregate, finalize — guaranteeing lock release on
//! every exit path.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{error, info};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::aggregator::StatisticalAggregator;
use crate::calibration::CalibrationProfile;
use crate::config::AppConfig;
use crate::executor::SocketExecutor;
use crate::lock::{LockBackend, SerializationLock};
use crate::model::{
    AggregatedResult, EnergyMetrics, MeasurementEnvironment, MeasurementRequest, ResponseEnvelope, ResponseStatus,
};
use crate::rapl::{EnergyReader, RaplReader};
use crate::topology::SocketTopology;
use crate::validator::CorrectnessValidator;

/// Builds a fresh energy reader on demand. A factory rather than a shared
/// reader because discovery can fail (e.g. sysfs went away) and each
/// measurement should retry discovery rather than reuse a reader that
/// might be holding stale file handles.
pub type ReaderFactory = Box<dyn Fn() -> crate::error::Result<Box<dyn EnergyReader>> + Send + Sync>;

/// Explicit, caller-constructed service: owns the topology, lock, and
/// calibration path; never a lazily-initialized global singleton.
pub struct MeasurementService {
    config: AppConfig,
    topology: SocketTopology,
    lock: Box<dyn LockBackend>,
    validator: Arc<dyn CorrectnessValidator>,
    calibration_path: PathBuf,
    cpu_core: u32,
    reader_factory: ReaderFactory,
}

impl MeasurementService {
    /// Production constructor: a real powercap reader and a real Redis-backed
    /// lock, both built from `config`.
    pub fn new(
        config: AppConfig,
        topology: SocketTopology,
        validator: Arc<dyn CorrectnessValidator>,
    ) -> crate::error::Result<MeasurementService> {
        let lock = SerializationLock::new(
            &config.lock.redis_url,
            &config.lock.key,
            Duration::from_secs(config.lock.lease_seconds),
            Duration::from_millis(config.lock.acquire_poll_millis),
        )?;
        let sysfs_root = config.rapl.sysfs_root.clone();
        let cache_ttl = Duration::from_millis(config.rapl.cache_ttl_millis);
        let reader_factory: ReaderFactory = Box::new(move || {
            RaplReader::discover(&sysfs_root, cache_ttl).map(|r| Box::new(r) as Box<dyn EnergyReader>)
        });
        Self::with_backends(config, topology, validator, Box::new(lock), reader_factory)
    }

    /// Fully-injectable constructor: accepts any lock and energy-reader
    /// backend, so scenarios can run against a fake lock and an in-memory
    /// reader without Redis or RAPL hardware.
    pub fn with_backends(
        config: AppConfig,
        topology: SocketTopology,
        validator: Arc<dyn CorrectnessValidator>,
        lock: Box<dyn LockBackend>,
        reader_factory: ReaderFactory,
    ) -> crate::error::Result<MeasurementService> {
        let cpu_core = *topology
            .one_cpu_per_socket()?
            .get(&0)
            .ok_or_else(|| crate::error::JouleTraceError::BadCpu("socket 0 has no CPUs".into()))?;
        let calibration_path = PathBuf::from(&config.calibration.profile_path);

        Ok(MeasurementService {
            config,
            topology,
            lock,
            validator,
            calibration_path,
            cpu_core,
            reader_factory,
        })
    }

    pub fn measure(&self, request: &MeasurementRequest, cancel: &AtomicBool) -> ResponseEnvelope {
        let start = Instant::now();

        if let Err(reason) = request.validate() {
            return self.finalize(
                request,
                start,
                ResponseStatus::Failed,
                None,
                None,
                Some(format!("bad request: {reason}")),
            );
        }

        let timeout = Duration::from_secs_f64(request.timeout_seconds);
        let validation = match self.validator.validate(&request.code, &request.entry_point, &request.test_cases, timeout) {
            Ok(v) => v,
            Err(e) => {
                return self.finalize(request, start, ResponseStatus::Failed, None, None, Some(e.to_string()));
            }
        };
        if !validation.is_correct {
            return self.finalize(
                request,
                start,
                ResponseStatus::ValidationFailed,
                Some(validation),
                None,
                None,
            );
        }

        if cancel.load(Ordering::SeqCst) {
            return self.finalize(request, start, ResponseStatus::Cancelled, Some(validation), None, None);
        }

        let acquire_timeout = Duration::from_secs(self.config.lock.lease_seconds);
        let guard = match crate::lock::acquire_guarded(self.lock.as_ref(), acquire_timeout) {
            Ok(Some(g)) => g,
            Ok(None) => {
                return self.finalize(
                    request,
                    start,
                    ResponseStatus::Busy,
                    Some(validation),
                    None,
                    Some("could not acquire the isolated-socket lock in time".into()),
                );
            }
            Err(e) => {
                return self.finalize(request, start, ResponseStatus::Failed, Some(validation), None, Some(e.to_string()));
            }
        };

        // Lock is held for the remainder of this function; `guard` releases
        // it on every return path, including the early returns below, via
        // `Drop`.
        let result = self.measure_under_lock(request, cancel);
        drop(guard);

        match result {
            Ok(aggregated) => {
                let energy_metrics = self.build_energy_metrics(&aggregated, request.test_cases.len());
                let env = self.build_environment();
                self.finalize(request, start, ResponseStatus::Completed, Some(validation), Some((aggregated, energy_metrics, env)), None)
            }
            Err(crate::error::JouleTraceError::Cancelled) => {
                self.finalize(request, start, ResponseStatus::Cancelled, Some(validation), None, None)
            }
            Err(e) => {
                error!("measurement failed for request {}: {e}", request.request_id);
                self.finalize(request, start, ResponseStatus::Failed, Some(validation), None, Some(e.to_string()))
            }
        }
    }

    fn measure_under_lock(
        &self,
        request: &MeasurementRequest,
        cancel: &AtomicBool,
    ) -> crate::error::Result<AggregatedResult> {
        let profile = CalibrationProfile::load(&self.calibration_path)?;
        let (usable, reason) = profile.is_usable();
        if !usable {
            return Err(crate::error::JouleTraceError::StaleCalibration(reason));
        }

        let mut reader = (self.reader_factory)()?;
        let settle_delay = Duration::from_millis(self.config.executor.settle_delay_millis);
        let executor = SocketExecutor::new(reader.as_mut(), &self.topology, &self.config.executor.interpreter_cmd, settle_delay);
        let mut aggregator = StatisticalAggregator::new(executor);
        aggregator.aggregate(request, &profile, self.cpu_core, cancel)
    }

    fn build_energy_metrics(&self, aggregated: &AggregatedResult, test_case_count: usize) -> EnergyMetrics {
        let per_test = if test_case_count > 0 {
            aggregated.median_net_energy_joules / test_case_count as f64
        } else {
            0.0
        };
        let median_dram: f64 = if aggregated.trials.is_empty() {
            0.0
        } else {
            let mut dram: Vec<f64> = aggregated.trials.iter().map(|t| t.raw_dram_joules).collect();
            dram.sort_by(|a, b| a.partial_cmp(b).unwrap());
            dram[dram.len() / 2]
        };
        let efficiency = if aggregated.median_net_energy_joules > 0.0 {
            1.0 / aggregated.median_net_energy_joules
        } else {
            0.0
        };
        EnergyMetrics {
            median_package_energy_joules: aggregated.median_net_energy_joules - median_dram,
            median_ram_energy_joules: median_dram,
            median_total_energy_joules: aggregated.median_net_energy_joules,
            median_execution_time_seconds: aggregated.median_duration_seconds,
            energy_per_test_case_joules: per_test,
            power_consumption_watts: aggregated.mean_power_watts,
            energy_efficiency_score: efficiency,
        }
    }

    fn build_environment(&self) -> MeasurementEnvironment {
        MeasurementEnvironment {
            meter_type: "rapl-powercap".to_string(),
            measurement_core: self.cpu_core,
            timestamp: OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn finalize(
        &self,
        request: &MeasurementRequest,
        start: Instant,
        status: ResponseStatus,
        validation: Option<crate::model::CorrectnessReport>,
        success_parts: Option<(AggregatedResult, EnergyMetrics, MeasurementEnvironment)>,
        failure_reason: Option<String>,
    ) -> ResponseEnvelope {
        info!("request {} finished with status {:?}", request.request_id, status);
        let (energy_metrics, measurement_environment) = match success_parts {
            Some((_, metrics, env)) => (Some(metrics), Some(env)),
            None => (None, None),
        };
        ResponseEnvelope {
            request_id: request.request_id.clone(),
            status,
            validation,
            energy_metrics,
            measurement_environment,
            processing_time_seconds: start.elapsed().as_secs_f64(),
            failure_reason,
        }
    }
}
