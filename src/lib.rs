//! # tokio-patch-pipeline
//!
//! Turns patch proposals from an untrusted text generator into backed-up,
//! validated file changes.
//!
//! ## Architecture
//!
//! Strictly sequential stages, leaves first:
//! ```text
//! raw text → recovery → plan → mutation → validation → proposals
//! ```
//!
//! - [`recovery`]: staged repair of noisy structured output
//! - [`plan`]: typed patch operations, checked for internal consistency
//! - [`mutation`]: ordered application with per-file backups and rollback
//! - [`validation`]: syntax gate, quality signals, optional test run
//! - [`proposals`]: metrics-driven objectives persisted to a ledger
//! - [`cycle`]: one pass through all of the above

// ── Lint policy (aerospace-grade) ─────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod config;
pub mod cycle;
pub mod generator;
pub mod mutation;
pub mod plan;
pub mod proposals;
pub mod recovery;
pub mod validation;

// Re-exports for convenience
pub use config::{loader::load_from_file, validation::ConfigError, PipelineConfig};
pub use cycle::{CycleOutcome, CycleReport, PatchCycle};
pub use generator::{Generator, GeneratorReply, SlotGate};
pub use mutation::{apply_plan, MutationEngine, MutationError, MutationReport, MutationStatus};
pub use plan::{build_plan, PatchOperation, PatchPlan, PlanError};
pub use proposals::{generate, ImprovementProposal, ProposalKind};
pub use proposals::ledger::LedgerError;
pub use recovery::{recover, recover_with_trace, RecoveredDocument, RecoveryError};
pub use validation::{ValidationError, ValidationPipeline, ValidationReport, ValidationState};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"`: structured JSON output for log aggregators
/// - anything else (including unset): human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`PipelineError::TracingInit`] if the global subscriber has
/// already been set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
///
/// # Example
///
/// ```no_run
/// # use tokio_patch_pipeline::{init_tracing, PipelineError};
/// # fn example() -> Result<(), PipelineError> {
/// init_tracing()?;
/// # Ok(()) }
/// ```
pub fn init_tracing() -> Result<(), PipelineError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(std::io::stderr)
            .try_init(),
    };

    result.map_err(|e| PipelineError::TracingInit(e.to_string()))
}

/// Top-level pipeline errors.
///
/// Every component error converts into a variant here, so callers that do
/// not care which stage failed can use `?` throughout.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// No document could be recovered from generator output.
    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    /// A recovered document is not a valid patch plan.
    #[error(transparent)]
    Plan(#[from] PlanError),

    /// The project root cannot be used.
    #[error(transparent)]
    Mutation(#[from] MutationError),

    /// The validation pipeline is misconfigured.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The improvement ledger could not be read or written.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The global tracing subscriber could not be installed.
    #[error("tracing init failed: {0}")]
    TracingInit(String),
}
