//! Test evaluation of a workspace.
//!
//! The [`TestRunner`] trait is the seam between orchestration and whatever
//! runs the project's tests. [`CommandTestRunner`] runs a configured command
//! and parses pytest-style (and cargo-style) summary lines.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::{info, instrument, warn};

use crate::core::types::EvaluationResult;
use crate::io::process::{command_from_argv, run_command_with_timeout};

pub const TIMEOUT_MARKER: &str = "<timeout>";
pub const RUNNER_ERROR_MARKER: &str = "<runner-error>";

/// Produces an [`EvaluationResult`] for a directory and a set of targets.
pub trait TestRunner: Send + Sync {
    fn evaluate(&self, workdir: &Path, targets: &[String]) -> Result<EvaluationResult>;
}

/// Runs `argv + targets` inside the workspace.
#[derive(Debug, Clone)]
pub struct CommandTestRunner {
    pub argv: Vec<String>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    /// When set, the combined output of every run is written here.
    pub log_path: Option<PathBuf>,
}

impl TestRunner for CommandTestRunner {
    #[instrument(skip_all, fields(workdir = %workdir.display(), targets = targets.len()))]
    fn evaluate(&self, workdir: &Path, targets: &[String]) -> Result<EvaluationResult> {
        let mut argv = self.argv.clone();
        argv.extend(targets.iter().cloned());
        let cmd = command_from_argv(&argv, workdir)?;
        let output = match run_command_with_timeout(cmd, None, self.timeout, self.output_limit_bytes)
        {
            Ok(output) => output,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "test runner could not start");
                return Ok(EvaluationResult::unavailable(RUNNER_ERROR_MARKER));
            }
        };
        let text = output.combined_text("tests");
        if let Some(log_path) = &self.log_path {
            if let Some(parent) = log_path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create log dir {}", parent.display()))?;
            }
            fs::write(log_path, &text)
                .with_context(|| format!("write test log {}", log_path.display()))?;
        }
        let elapsed_s = output.elapsed.as_secs_f64();
        if output.timed_out {
            return Ok(EvaluationResult {
                elapsed_s,
                ..EvaluationResult::unavailable(TIMEOUT_MARKER)
            });
        }
        let counts = parse_test_summary(&text);
        let result = EvaluationResult {
            ok: output.status.success(),
            passed: counts.passed,
            failed: counts.failed,
            failing_tests: counts.failing_tests,
            elapsed_s,
        };
        info!(ok = result.ok, passed = result.passed, failed = result.failed, "evaluation finished");
        Ok(result)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestCounts {
    pub passed: u64,
    pub failed: u64,
    pub failing_tests: Vec<String>,
}

static PASSED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)\s+passed").expect("regex"));
static FAILED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)\s+failed").expect("regex"));
static ERRORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s+errors?\b").expect("regex"));
static FAILING_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:FAILED|ERROR)\s+(\S+)").expect("regex"));

fn sum_matches(re: &Regex, text: &str) -> u64 {
    re.captures_iter(text)
        .filter_map(|caps| caps.get(1)?.as_str().parse::<u64>().ok())
        .sum()
}

/// Parse counts and failing test ids from runner output.
///
/// Collection errors count as failures.
pub fn parse_test_summary(text: &str) -> TestCounts {
    let failing_tests = text
        .lines()
        .filter_map(|line| FAILING_LINE.captures(line.trim_end()))
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
        .collect();
    TestCounts {
        passed: sum_matches(&PASSED, text),
        failed: sum_matches(&FAILED, text) + sum_matches(&ERRORS, text),
        failing_tests,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pytest_quiet_summary() {
        let output = "..F\nFAILED proj/tests/test_app.py::test_add - assert 1 == 5\n1 failed, 2 passed in 0.03s\n";
        let counts = parse_test_summary(output);
        assert_eq!(counts.passed, 2);
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.failing_tests, vec!["proj/tests/test_app.py::test_add"]);
    }

    #[test]
    fn parses_cargo_summaries_across_binaries() {
        let output = "test result: ok. 3 passed; 0 failed; 0 ignored\n\ntest result: FAILED. 1 passed; 2 failed; 0 ignored\n";
        let counts = parse_test_summary(output);
        assert_eq!(counts.passed, 4);
        assert_eq!(counts.failed, 2);
    }

    #[test]
    fn collection_errors_count_as_failures() {
        let counts = parse_test_summary("ERROR tests/test_x.py\n1 error in 0.01s\n");
        assert_eq!(counts.failed, 1);
        assert_eq!(counts.failing_tests, vec!["tests/test_x.py"]);
    }

    #[cfg(unix)]
    #[test]
    fn command_runner_reports_status_and_counts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = CommandTestRunner {
            argv: vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo '2 passed in 0.01s'".to_string(),
            ],
            timeout: Duration::from_secs(10),
            output_limit_bytes: 10_000,
            log_path: Some(temp.path().join("logs/tests.log")),
        };
        let result = runner.evaluate(temp.path(), &[]).expect("evaluate");
        assert!(result.ok);
        assert_eq!(result.passed, 2);
        assert!(temp.path().join("logs/tests.log").exists());
    }

    #[test]
    fn missing_binary_is_a_failed_evaluation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = CommandTestRunner {
            argv: vec!["definitely-not-a-real-binary-flowgate".to_string()],
            timeout: Duration::from_secs(5),
            output_limit_bytes: 1_000,
            log_path: None,
        };
        let result = runner.evaluate(temp.path(), &[]).expect("evaluate");
        assert!(!result.ok);
        assert_eq!(result.failing_tests, vec![RUNNER_ERROR_MARKER]);
    }
}
