//! # Declarative Pipeline Configuration
//!
//! ## Responsibility
//! Describe every tunable of a patch pipeline in one TOML file:
//! ```toml
//! [project]
//! root = "."
//! backup_suffix = ".bak"
//! rollback_on_reject = true
//!
//! [validation]
//! syntax_timeout_s = 30
//! test_command = ["pytest", "--cov", "--cov-report=json"]
//! coverage_report = "coverage.json"
//!
//! [validation.syntax_commands]
//! sh = ["bash", "-n", "{file}"]
//!
//! [proposals]
//! max_cyclomatic = 10
//! min_coverage_percent = 60.0
//! ```
//!
//! ## Guarantees
//! - Every section and field is optional; omitted values take documented defaults
//! - Validated: semantic constraints are checked before a config is accepted
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Building the cycle from config (that belongs to `cycle`)
//! - Tracing setup (that belongs to `init_tracing`)

pub mod loader;
pub mod validation;

use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{
    mutation::{MutationConfig, DEFAULT_BACKUP_SUFFIX},
    proposals::ProposalThresholds,
    recovery::{RecoveryConfig, DEFAULT_DIAGNOSTIC_PREFIX_CHARS},
    validation::{quality::QualityConfig, syntax::default_syntax_commands},
};

// ── Default value functions ──────────────────────────────────────────────

fn default_project_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_backup_suffix() -> String {
    DEFAULT_BACKUP_SUFFIX.to_string()
}

fn default_diagnostic_prefix_chars() -> usize {
    DEFAULT_DIAGNOSTIC_PREFIX_CHARS
}

/// Default external syntax check timeout: 30 seconds.
fn default_syntax_timeout_s() -> u64 {
    30
}

/// Default test run timeout: 300 seconds.
fn default_test_timeout_s() -> u64 {
    300
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from(".patch-pipeline/improvements.json")
}

/// Default proposal cooldown: one hour.
fn default_cooldown_s() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for a patch pipeline.
///
/// # Panics
///
/// This type never panics during construction or access.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Project tree and backup naming.
    pub project: ProjectSection,
    /// Document recovery settings.
    pub recovery: RecoverySection,
    /// Syntax checks and the optional test run.
    pub validation: ValidationSection,
    /// Duplicated-block detector thresholds.
    pub quality: QualityConfig,
    /// Improvement proposal thresholds and ledger.
    pub proposals: ProposalsSection,
}

impl PipelineConfig {
    /// Settings for the mutation engine.
    pub fn mutation_config(&self) -> MutationConfig {
        MutationConfig {
            project_root: self.project.root.clone(),
            backup_suffix: self.project.backup_suffix.clone(),
        }
    }

    /// Settings for the recovery engine.
    pub fn recovery_config(&self) -> RecoveryConfig {
        RecoveryConfig {
            diagnostic_prefix_chars: self.recovery.diagnostic_prefix_chars,
        }
    }

    /// Ledger location, resolved against the project root when relative.
    pub fn ledger_path(&self) -> PathBuf {
        if self.proposals.ledger_path.is_absolute() {
            self.proposals.ledger_path.clone()
        } else {
            self.project.root.join(&self.proposals.ledger_path)
        }
    }
}

// ── Sections ─────────────────────────────────────────────────────────────

/// Where patches are applied.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct ProjectSection {
    /// Directory every plan path is relative to.
    pub root: PathBuf,
    /// Appended to a file name to name its backup.
    pub backup_suffix: String,
    /// Restore backups when a cycle is rejected or only partly applied.
    pub rollback_on_reject: bool,
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            root: default_project_root(),
            backup_suffix: default_backup_suffix(),
            rollback_on_reject: false,
        }
    }
}

/// Document recovery settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct RecoverySection {
    /// Input characters quoted back in an unparseable-output error.
    pub diagnostic_prefix_chars: usize,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            diagnostic_prefix_chars: default_diagnostic_prefix_chars(),
        }
    }
}

/// Syntax checks and the dynamic test run.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct ValidationSection {
    /// Time budget for one external syntax command.
    pub syntax_timeout_s: u64,
    /// Test command run in the project root after syntax passes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_command: Option<Vec<String>>,
    /// coverage.py JSON report written by the test command, relative to
    /// the project root.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coverage_report: Option<PathBuf>,
    /// Hard time budget for the test command.
    pub test_timeout_s: u64,
    /// Extension → compile-only command. `{file}` is replaced by the path.
    /// Entries override the built-in JSON, TOML and brace checkers.
    pub syntax_commands: BTreeMap<String, Vec<String>>,
}

impl ValidationSection {
    /// External syntax check budget.
    pub fn syntax_timeout(&self) -> Duration {
        Duration::from_secs(self.syntax_timeout_s)
    }

    /// Test run budget.
    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test_timeout_s)
    }
}

impl Default for ValidationSection {
    fn default() -> Self {
        Self {
            syntax_timeout_s: default_syntax_timeout_s(),
            test_command: None,
            coverage_report: None,
            test_timeout_s: default_test_timeout_s(),
            syntax_commands: default_syntax_commands(),
        }
    }
}

/// Improvement proposal generation.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct ProposalsSection {
    /// Record proposals after accepted cycles.
    pub enabled: bool,
    /// Complexity above which a `Refactor` is proposed.
    pub max_cyclomatic: u32,
    /// Coverage below which an `Enhance` is proposed.
    pub min_coverage_percent: f64,
    /// Ledger file; relative paths are resolved against the project root.
    pub ledger_path: PathBuf,
    /// Seconds before the same file and kind may be proposed again.
    pub cooldown_s: u64,
}

impl ProposalsSection {
    /// Thresholds for [`crate::proposals::generate`].
    pub fn thresholds(&self) -> ProposalThresholds {
        ProposalThresholds {
            max_cyclomatic: self.max_cyclomatic,
            min_coverage_percent: self.min_coverage_percent,
        }
    }

    /// Cooldown as a duration.
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_s)
    }
}

impl Default for ProposalsSection {
    fn default() -> Self {
        let thresholds = ProposalThresholds::default();
        Self {
            enabled: default_true(),
            max_cyclomatic: thresholds.max_cyclomatic,
            min_coverage_percent: thresholds.min_coverage_percent,
            ledger_path: default_ledger_path(),
            cooldown_s: default_cooldown_s(),
        }
    }
}

/// Export the JSON Schema for [`PipelineConfig`].
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails (should not
/// happen for a well-formed schema).
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(PipelineConfig);
    serde_json::to_string_pretty(&schema)
}
