//! # Syntax & Quality Validation Pipeline
//!
//! Re-validates the files a mutation run touched, against their on-disk
//! content:
//!
//! ```text
//! Pending ─► SyntaxChecked ─┬─ any failure ──────────────► Rejected
//!                           └─► QualityScored ───────────► Accepted
//! ```
//!
//! ## Guarantees
//! - Syntax is the only hard gate. One failing file rejects the set and
//!   quality scoring is skipped.
//! - Quality scoring and the optional test run are advisory; their failures
//!   become warnings.
//! - Files whose mutation failed are never validated; they are listed in
//!   [`ValidationReport::excluded`].
//!
//! ## NOT Responsible For
//! - Deciding what to do with a rejection (the cycle driver does)
//! - Persisting metrics (the proposal ledger does)

pub mod dynamic;
pub mod quality;
pub mod syntax;

use std::{
    collections::BTreeMap,
    fmt::Write as _,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::mutation::MutationReport;
use dynamic::{TestRunSummary, TestRunner};
use quality::{score_bytes, FileQuality, QualityConfig, QualityMetrics, SourceLanguage};
use syntax::{SyntaxOutcome, SyntaxRegistry};

// ─── Error ────────────────────────────────────────────────────────────────────

/// Errors produced while configuring or driving the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// A configured syntax command has no program.
    #[error("syntax command for .{extension} files is empty")]
    EmptyCommand {
        /// File extension the command was configured for.
        extension: String,
    },

    /// The state machine was driven along an edge it does not have.
    #[error("illegal validation transition {from:?} -> {to:?}")]
    InvalidTransition {
        /// Current state.
        from: ValidationState,
        /// Requested state.
        to: ValidationState,
    },
}

// ─── State machine ────────────────────────────────────────────────────────────

/// Validation progress for one set of files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidationState {
    /// Nothing checked yet.
    Pending,
    /// Every file went through its syntax checker.
    SyntaxChecked,
    /// Quality signals computed.
    QualityScored,
    /// All files passed syntax.
    Accepted,
    /// At least one file failed syntax.
    Rejected,
}

impl ValidationState {
    /// Whether `next` is a legal successor.
    pub fn can_transition_to(self, next: ValidationState) -> bool {
        use ValidationState::*;
        matches!(
            (self, next),
            (Pending, SyntaxChecked)
                | (SyntaxChecked, QualityScored)
                | (SyntaxChecked, Rejected)
                | (QualityScored, Accepted)
        )
    }

    /// `true` for `Accepted` and `Rejected`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Accepted | Self::Rejected)
    }
}

struct Machine {
    state: ValidationState,
    trail: Vec<ValidationState>,
}

impl Machine {
    fn new() -> Self {
        Self {
            state: ValidationState::Pending,
            trail: vec![ValidationState::Pending],
        }
    }

    fn advance(&mut self, next: ValidationState) -> Result<(), ValidationError> {
        if !self.state.can_transition_to(next) {
            return Err(ValidationError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!(from = ?self.state, to = ?next, "validation transition");
        self.state = next;
        self.trail.push(next);
        Ok(())
    }
}

// ─── Report ───────────────────────────────────────────────────────────────────

/// Output of one validation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Terminal state: `Accepted` or `Rejected`.
    pub status: ValidationState,
    /// Syntax failures keyed by relative path.
    pub per_file_errors: BTreeMap<String, String>,
    /// Quality signals; absent when syntax rejected the set.
    pub quality_metrics: Option<QualityMetrics>,
    /// Every syntax verdict, including passes and unchecked files.
    pub syntax: BTreeMap<String, SyntaxOutcome>,
    /// Dynamic check result, when one ran to completion.
    pub tests: Option<TestRunSummary>,
    /// Advisory problems that did not affect the verdict.
    pub warnings: Vec<String>,
    /// Files left out because their mutation failed.
    pub excluded: Vec<String>,
    /// States visited, in order.
    pub trail: Vec<ValidationState>,
}

impl ValidationReport {
    /// `true` if the files were accepted.
    pub fn is_accepted(&self) -> bool {
        self.status == ValidationState::Accepted
    }

    /// Text to feed back to the generator after a rejection.
    pub fn corrective_context(&self) -> Option<String> {
        if self.is_accepted() {
            return None;
        }
        let mut out = String::from("The previous patch was rejected. These files fail to parse:\n");
        for (file, err) in &self.per_file_errors {
            let _ = writeln!(out, "- {file}: {err}");
        }
        if !self.excluded.is_empty() {
            let _ = writeln!(
                out,
                "These files could not be patched and were left out: {}",
                self.excluded.join(", ")
            );
        }
        out.push_str("Return a corrected patch plan.");
        Some(out)
    }
}

// ─── Pipeline ─────────────────────────────────────────────────────────────────

/// Validates files under a project root.
#[derive(Clone)]
pub struct ValidationPipeline {
    project_root: PathBuf,
    syntax: SyntaxRegistry,
    quality: QualityConfig,
    test_runner: Option<Arc<dyn TestRunner>>,
}

impl ValidationPipeline {
    /// Pipeline with the given checkers and quality thresholds.
    pub fn new(project_root: impl Into<PathBuf>, syntax: SyntaxRegistry, quality: QualityConfig) -> Self {
        Self {
            project_root: project_root.into(),
            syntax,
            quality,
            test_runner: None,
        }
    }

    /// Attach a dynamic check.
    pub fn with_test_runner(mut self, runner: Arc<dyn TestRunner>) -> Self {
        self.test_runner = Some(runner);
        self
    }

    /// The project root files are resolved against.
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Validate what a mutation run applied.
    ///
    /// # Errors
    ///
    /// Only [`ValidationError::InvalidTransition`], which indicates a bug.
    pub async fn validate_mutation(
        &self,
        report: &MutationReport,
    ) -> Result<ValidationReport, ValidationError> {
        self.validate(&report.validation_targets(), &report.failed_files())
            .await
    }

    /// Validate `files` (relative paths). `excluded` is carried into the
    /// report untouched.
    ///
    /// # Errors
    ///
    /// Only [`ValidationError::InvalidTransition`], which indicates a bug.
    pub async fn validate(
        &self,
        files: &[String],
        excluded: &[String],
    ) -> Result<ValidationReport, ValidationError> {
        let mut machine = Machine::new();
        let mut per_file_errors = BTreeMap::new();
        let mut syntax = BTreeMap::new();
        let mut warnings = Vec::new();
        let mut contents: Vec<(&String, Vec<u8>)> = Vec::with_capacity(files.len());

        // ── Syntax ────────────────────────────────────────────────────────
        for file in files {
            let path = self.project_root.join(file);
            let outcome = match tokio::fs::read(&path).await {
                Err(e) => SyntaxOutcome::Failed(format!("cannot read file: {e}")),
                Ok(bytes) => {
                    let outcome = match std::str::from_utf8(&bytes) {
                        Ok(source) => self.syntax.check(&path, source).await,
                        Err(e) => SyntaxOutcome::Failed(format!("not valid UTF-8: {e}")),
                    };
                    contents.push((file, bytes));
                    outcome
                }
            };

            match &outcome {
                SyntaxOutcome::Passed => debug!(file = %file, "syntax passed"),
                SyntaxOutcome::Failed(err) => {
                    warn!(file = %file, error = %err, "syntax check failed");
                    per_file_errors.insert(file.clone(), err.clone());
                }
                SyntaxOutcome::Unchecked(why) => {
                    debug!(file = %file, reason = %why, "syntax unchecked");
                    warnings.push(format!("{file}: syntax not checked: {why}"));
                }
            }
            syntax.insert(file.clone(), outcome);
        }
        machine.advance(ValidationState::SyntaxChecked)?;

        if !per_file_errors.is_empty() {
            machine.advance(ValidationState::Rejected)?;
            info!(
                failed = per_file_errors.len(),
                checked = files.len(),
                "validation rejected"
            );
            return Ok(ValidationReport {
                status: machine.state,
                per_file_errors,
                quality_metrics: None,
                syntax,
                tests: None,
                warnings,
                excluded: excluded.to_vec(),
                trail: machine.trail,
            });
        }

        // ── Quality ───────────────────────────────────────────────────────
        let mut per_file: BTreeMap<String, FileQuality> = BTreeMap::new();
        for (file, bytes) in &contents {
            let language = Path::new(file.as_str())
                .extension()
                .and_then(|e| e.to_str())
                .map(SourceLanguage::for_extension)
                .unwrap_or(SourceLanguage::Plain);
            match score_bytes(file, bytes, language, &self.quality) {
                Ok(q) => {
                    debug!(
                        file = %file,
                        cyclomatic_max = q.cyclomatic_max,
                        duplicated = q.duplicated_block_count,
                        score = q.quality_score,
                        "quality scored"
                    );
                    per_file.insert((*file).clone(), q);
                }
                Err(e) => {
                    warn!(file = %file, error = %e, "quality scoring failed");
                    warnings.push(format!("quality scoring skipped: {e}"));
                }
            }
        }

        let tests = self.run_tests(files, &mut per_file, &mut warnings).await;
        let metrics = QualityMetrics::from_files(per_file);
        machine.advance(ValidationState::QualityScored)?;
        machine.advance(ValidationState::Accepted)?;

        info!(
            files = files.len(),
            quality_score = metrics.quality_score,
            warnings = warnings.len(),
            "validation accepted"
        );

        Ok(ValidationReport {
            status: machine.state,
            per_file_errors,
            quality_metrics: Some(metrics),
            syntax,
            tests,
            warnings,
            excluded: excluded.to_vec(),
            trail: machine.trail,
        })
    }

    async fn run_tests(
        &self,
        files: &[String],
        per_file: &mut BTreeMap<String, FileQuality>,
        warnings: &mut Vec<String>,
    ) -> Option<TestRunSummary> {
        let runner = self.test_runner.as_ref()?;
        if files.is_empty() {
            return None;
        }
        match runner.run(&self.project_root, files).await {
            Ok(summary) => {
                if !summary.passed {
                    warnings.push(format!("tests failed: {}", summary.output_excerpt));
                }
                for (file, quality) in per_file.iter_mut() {
                    quality.coverage_percent = summary.coverage.get(file).copied();
                }
                Some(summary)
            }
            Err(e) => {
                warn!(error = %e, "dynamic check failed");
                warnings.push(e.to_string());
                None
            }
        }
    }
}
