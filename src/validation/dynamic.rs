//! # Dynamic Check
//!
//! Optional test execution with per-file coverage. The runner executes
//! arbitrary project code, so every run is bounded by a hard timeout and the
//! child is killed when the timeout fires.
//!
//! Failures here are warnings to the pipeline, never rejections.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use super::syntax::excerpt;

// ─── Error ────────────────────────────────────────────────────────────────────

/// Errors produced by a test runner.
#[derive(Debug, Error)]
pub enum TestRunError {
    /// The test command could not be started.
    #[error("could not start test command: {0}")]
    Spawn(String),

    /// The run exceeded its time budget and was killed.
    #[error("test run timed out after {0:?}")]
    Timeout(Duration),

    /// The coverage report was missing or malformed.
    #[error("coverage report {path}: {reason}")]
    CoverageReport {
        /// Report location.
        path: String,
        /// What went wrong.
        reason: String,
    },
}

// ─── Summary ──────────────────────────────────────────────────────────────────

/// Outcome of one test run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestRunSummary {
    /// Whether the test command exited successfully.
    pub passed: bool,
    /// Line coverage percentage keyed by path relative to the project root.
    pub coverage: BTreeMap<String, f64>,
    /// Tail of the command output.
    pub output_excerpt: String,
    /// Wall time in milliseconds.
    pub elapsed_ms: u64,
}

// ─── Runner trait ─────────────────────────────────────────────────────────────

/// Pluggable dynamic check.
#[async_trait]
pub trait TestRunner: Send + Sync {
    /// Run the tests for `project_root`. `files` are the files that changed.
    async fn run(&self, project_root: &Path, files: &[String]) -> Result<TestRunSummary, TestRunError>;
}

/// Runs a shell-free command and optionally reads a coverage.py JSON report.
#[derive(Debug, Clone)]
pub struct CommandTestRunner {
    command: Vec<String>,
    timeout: Duration,
    coverage_report: Option<PathBuf>,
}

impl CommandTestRunner {
    /// `command` is `[program, args...]`; `coverage_report` is relative to
    /// the project root.
    pub fn new(command: Vec<String>, timeout: Duration, coverage_report: Option<PathBuf>) -> Self {
        Self {
            command,
            timeout,
            coverage_report,
        }
    }
}

#[async_trait]
impl TestRunner for CommandTestRunner {
    async fn run(&self, project_root: &Path, files: &[String]) -> Result<TestRunSummary, TestRunError> {
        use tokio::process::Command;

        let Some((program, args)) = self.command.split_first() else {
            return Err(TestRunError::Spawn("empty test command".to_string()));
        };

        debug!(program = %program, changed = files.len(), "starting test run");
        let start = Instant::now();
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(project_root).kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Err(_) => return Err(TestRunError::Timeout(self.timeout)),
            Ok(Err(e)) => return Err(TestRunError::Spawn(format!("{program}: {e}"))),
            Ok(Ok(o)) => o,
        };
        let elapsed_ms = start.elapsed().as_millis() as u64;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));

        let coverage = match &self.coverage_report {
            Some(rel) => {
                let path = project_root.join(rel);
                let raw = tokio::fs::read_to_string(&path).await.map_err(|e| {
                    TestRunError::CoverageReport {
                        path: path.display().to_string(),
                        reason: e.to_string(),
                    }
                })?;
                parse_coverage_report(&raw).map_err(|reason| TestRunError::CoverageReport {
                    path: path.display().to_string(),
                    reason,
                })?
            }
            None => BTreeMap::new(),
        };

        let passed = output.status.success();
        info!(passed, elapsed_ms, covered_files = coverage.len(), "test run finished");

        Ok(TestRunSummary {
            passed,
            coverage,
            output_excerpt: excerpt(text.trim()),
            elapsed_ms,
        })
    }
}

/// Read `files.<path>.summary.percent_covered` from a coverage.py JSON report.
///
/// # Errors
///
/// A description of why the report is unusable.
pub fn parse_coverage_report(raw: &str) -> Result<BTreeMap<String, f64>, String> {
    let value: serde_json::Value = serde_json::from_str(raw).map_err(|e| e.to_string())?;
    let files = value
        .get("files")
        .and_then(|f| f.as_object())
        .ok_or_else(|| "no `files` object".to_string())?;

    Ok(files
        .iter()
        .filter_map(|(path, entry)| {
            let pct = entry
                .get("summary")
                .and_then(|s| s.get("percent_covered"))
                .and_then(|p| p.as_f64())?;
            Some((normalize_report_path(path), pct))
        })
        .collect())
}

fn normalize_report_path(path: &str) -> String {
    path.trim_start_matches("./").replace('\\', "/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_coverage_report() {
        let raw = r#"{
            "meta": {"version": "7.4"},
            "files": {
                "pkg/a.py": {"summary": {"percent_covered": 87.5}},
                "./pkg/b.py": {"summary": {"percent_covered": 12}},
                "pkg/c.py": {"summary": {}}
            }
        }"#;
        let cov = parse_coverage_report(raw).unwrap();
        assert_eq!(cov.len(), 2);
        assert_eq!(cov["pkg/a.py"], 87.5);
        assert_eq!(cov["pkg/b.py"], 12.0);
    }

    #[test]
    fn test_coverage_report_without_files_rejected() {
        assert!(parse_coverage_report(r#"{"totals": {}}"#).is_err());
        assert!(parse_coverage_report("not json").is_err());
    }

    #[tokio::test]
    async fn test_empty_command_is_spawn_error() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let runner = CommandTestRunner::new(vec![], Duration::from_secs(1), None);
        let err = runner.run(dir.path(), &[]).await.unwrap_err();
        assert!(matches!(err, TestRunError::Spawn(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_exit_status_is_reported() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let ok = CommandTestRunner::new(vec!["true".into()], Duration::from_secs(10), None);
        assert!(ok.run(dir.path(), &[]).await.unwrap().passed);
        let bad = CommandTestRunner::new(vec!["false".into()], Duration::from_secs(10), None);
        assert!(!bad.run(dir.path(), &[]).await.unwrap().passed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_run() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let runner = CommandTestRunner::new(
            vec!["sleep".into(), "5".into()],
            Duration::from_millis(100),
            None,
        );
        let err = runner.run(dir.path(), &[]).await.unwrap_err();
        assert!(matches!(err, TestRunError::Timeout(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_coverage_read_after_run() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        std::fs::write(
            dir.path().join("coverage.json"),
            r#"{"files": {"m.py": {"summary": {"percent_covered": 40.0}}}}"#,
        )
        .unwrap();
        let runner = CommandTestRunner::new(
            vec!["true".into()],
            Duration::from_secs(10),
            Some(PathBuf::from("coverage.json")),
        );
        let summary = runner.run(dir.path(), &["m.py".into()]).await.unwrap();
        assert_eq!(summary.coverage.get("m.py"), Some(&40.0));
    }
}
