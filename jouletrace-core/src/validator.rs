//! Correctness validator (A4): an external collaborator in the production
//! system, implemented here as a trait plus a reference subprocess-based
//! implementation, sufficient to gate energy measurement on correctness
//! (the energy path never runs for code that fails its test cases).

use std::io::Write;
use std::process::{Command, Stdio};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{JouleTraceError, Result};
use crate::model::{CorrectnessReport, InputShape, TestCase};

const VALIDATOR_DRIVER_SOURCE: &str = include_str!("validator_driver.py");

pub trait CorrectnessValidator: Send + Sync {
    fn validate(
        &self,
        code: &str,
        entry_point: &str,
        test_cases: &[TestCase],
        timeout: Duration,
    ) -> Result<CorrectnessReport>;
}

#[derive(Serialize)]
struct DriverPayload<'a> {
    code: &'a str,
    entry_point: &'a str,
    inputs: &'a [InputShape],
}

#[derive(Deserialize)]
struct SingleOutcome {
    ok: bool,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct DriverOutput {
    #[serde(default)]
    outputs: Vec<SingleOutcome>,
    #[serde(default)]
    error: Option<String>,
}

/// Compares actual vs. expected output, tolerating floating-point noise.
fn values_match(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            (a - b).abs() <= 1e-9_f64.max(b.abs() * 1e-9)
        }
        (Value::Array(a), Value::Array(b)) => a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_match(x, y)),
        _ => actual == expected,
    }
}

/// Runs the candidate through the same kind of subprocess mechanism used
/// for measured trials, but without CPU pinning or energy bracketing, and
/// compares each actual output against the expected one.
pub struct PythonSubprocessValidator {
    interpreter_cmd: Vec<String>,
}

impl PythonSubprocessValidator {
    pub fn new(interpreter_cmd: Vec<String>) -> Self {
        PythonSubprocessValidator { interpreter_cmd }
    }
}

impl CorrectnessValidator for PythonSubprocessValidator {
    fn validate(
        &self,
        code: &str,
        entry_point: &str,
        test_cases: &[TestCase],
        timeout: Duration,
    ) -> Result<CorrectnessReport> {
        let mut driver_file = tempfile::Builder::new()
            .prefix("jouletrace-validator-")
            .suffix(".py")
            .tempfile()
            .map_err(|e| JouleTraceError::BadRequest(format!("creating validator driver file: {e}")))?;
        driver_file
            .write_all(VALIDATOR_DRIVER_SOURCE.as_bytes())
            .map_err(|e| JouleTraceError::BadRequest(format!("writing validator driver file: {e}")))?;

        let inputs: Vec<InputShape> = test_cases.iter().map(|t| t.input.clone()).collect();
        let payload = DriverPayload {
            code,
            entry_point,
            inputs: &inputs,
        };
        let payload_json = serde_json::to_vec(&payload)
            .map_err(|e| JouleTraceError::BadRequest(format!("encoding validator payload: {e}")))?;

        let mut cmd = Command::new(&self.interpreter_cmd[0]);
        cmd.args(&self.interpreter_cmd[1..]);
        cmd.arg(driver_file.path());
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| JouleTraceError::BadRequest(format!("spawning validator subprocess: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            let _ = stdin.write_all(&payload_json);
        }

        let start = std::time::Instant::now();
        loop {
            if child.try_wait().ok().flatten().is_some() {
                break;
            }
            if start.elapsed() >= timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(CorrectnessReport {
                    is_correct: false,
                    passed_tests: 0,
                    total_tests: test_cases.len(),
                    summary: Some("validation timed out".to_string()),
                });
            }
            std::thread::sleep(Duration::from_millis(20));
        }

        let output = child
            .wait_with_output()
            .map_err(|e| JouleTraceError::BadRequest(format!("collecting validator output: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let driver_output: DriverOutput = match serde_json::from_str(stdout.trim()) {
            Ok(o) => o,
            Err(_) => {
                return Ok(CorrectnessReport {
                    is_correct: false,
                    passed_tests: 0,
                    total_tests: test_cases.len(),
                    summary: Some(format!(
                        "validator produced no parseable output (exit {:?}): {}",
                        output.status.code(),
                        String::from_utf8_lossy(&output.stderr).trim()
                    )),
                });
            }
        };

        if let Some(err) = driver_output.error {
            return Ok(CorrectnessReport {
                is_correct: false,
                passed_tests: 0,
                total_tests: test_cases.len(),
                summary: Some(err),
            });
        }

        let mut passed = 0usize;
        let mut first_failure = None;
        for (i, (outcome, case)) in driver_output.outputs.iter().zip(test_cases).enumerate() {
            let case_passed = match (&outcome.ok, &case.expected_output) {
                (false, _) => false,
                (true, None) => true,
                (true, Some(expected)) => values_match(&outcome.value, expected),
            };
            if case_passed {
                passed += 1;
            } else if first_failure.is_none() {
                first_failure = Some(format!(
                    "test case {i}: got {:?}, expected {:?}",
                    outcome.value, case.expected_output
                ));
            }
        }

        let total = test_cases.len();
        Ok(CorrectnessReport {
            is_correct: passed == total,
            passed_tests: passed,
            total_tests: total,
            summary: first_failure,
        })
    }
}

/// Validator stand-ins for tests that should not depend on a `python3`
/// interpreter being present.
pub mod testing {
    use std::time::Duration;

    use super::CorrectnessValidator;
    use crate::error::Result;
    use crate::model::{CorrectnessReport, TestCase};

    /// Always reports the fixed outcome it was built with, ignoring its
    /// arguments.
    pub struct StubValidator {
        report: CorrectnessReport,
    }

    impl StubValidator {
        pub fn always_correct(test_case_count: usize) -> Self {
            StubValidator {
                report: CorrectnessReport {
                    is_correct: true,
                    passed_tests: test_case_count,
                    total_tests: test_case_count,
                    summary: None,
                },
            }
        }

        pub fn always_incorrect(test_case_count: usize, summary: impl Into<String>) -> Self {
            StubValidator {
                report: CorrectnessReport {
                    is_correct: false,
                    passed_tests: 0,
                    total_tests: test_case_count,
                    summary: Some(summary.into()),
                },
            }
        }
    }

    impl CorrectnessValidator for StubValidator {
        fn validate(&self, _code: &str, _entry_point: &str, _test_cases: &[TestCase], _timeout: Duration) -> Result<CorrectnessReport> {
            Ok(self.report.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_tolerance_allows_tiny_noise() {
        assert!(values_match(&Value::from(1.0000000001), &Value::from(1.0)));
        assert!(!values_match(&Value::from(1.2), &Value::from(1.0)));
    }

    #[test]
    fn array_comparison_is_elementwise() {
        let a = Value::from(vec![1, 2, 3]);
        let b = Value::from(vec![1, 2, 3]);
        assert!(values_match(&a, &b));
    }
}
