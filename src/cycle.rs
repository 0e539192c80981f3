//! # Patch Cycle
//!
//! Runs one generator reply through the whole pipeline:
//!
//! ```text
//! raw text ─► recover ─► build_plan ─► apply ─► validate ─┬─► Accepted ─► proposals
//!                │            │           │                ├─► Rejected ──► (rollback)
//!                ▼            ▼           ▼                └─► PartiallyApplied ─► (rollback)
//!         Unrecoverable  InvalidPlan  NothingApplied
//! ```
//!
//! ## Guarantees
//! - Stages run strictly in order; a stage is skipped, never interrupted.
//! - The generator is never retried here. Every non-accepted outcome carries
//!   corrective context so the orchestrator can decide to retry.
//! - A plan is applied at most once.
//!
//! ## NOT Responsible For
//! - Choosing objectives or retry policy (the orchestrator)
//! - Serializing concurrent cycles over overlapping files

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, info_span, warn, Instrument};

use crate::{
    config::PipelineConfig,
    generator::{Generator, SlotGate},
    mutation::{MutationEngine, MutationReport, MutationStatus, RollbackReport},
    plan::build_plan,
    proposals::{ledger::JsonFileLedger, ImprovementProposal, ProposalGenerator},
    recovery::{DocumentRecovery, RecoveredDocument, RecoveryStage},
    validation::{
        dynamic::CommandTestRunner, syntax::SyntaxRegistry, ValidationPipeline, ValidationReport,
    },
    PipelineError,
};

// ─── Outcome ──────────────────────────────────────────────────────────────────

/// How a cycle ended.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// The generator call failed or returned nothing.
    GeneratorFailed {
        /// Reported error.
        error: String,
    },
    /// No document could be recovered from the reply.
    Unrecoverable {
        /// Recovery diagnostic.
        error: String,
        /// Text for the next prompt.
        corrective_context: String,
    },
    /// A document was recovered but is not a valid plan.
    InvalidPlan {
        /// Plan diagnostic.
        error: String,
        /// Offending operation, when one is to blame.
        index: Option<usize>,
        /// Text for the next prompt.
        corrective_context: String,
    },
    /// The plan was valid but no operation applied.
    NothingApplied {
        /// Mutation record.
        mutation: MutationReport,
        /// Text for the next prompt.
        corrective_context: String,
    },
    /// At least one applied file failed its syntax check.
    Rejected {
        /// Mutation record.
        mutation: MutationReport,
        /// Validation record.
        validation: ValidationReport,
        /// Present when the run was rolled back.
        rollback: Option<RollbackReport>,
        /// Text for the next prompt.
        corrective_context: String,
    },
    /// Applied files validated but some operations failed to apply.
    PartiallyApplied {
        /// Mutation record.
        mutation: MutationReport,
        /// Validation record.
        validation: ValidationReport,
        /// Present when the run was rolled back.
        rollback: Option<RollbackReport>,
        /// Text for the next prompt.
        corrective_context: String,
    },
    /// Every operation applied and validated.
    Accepted {
        /// Mutation record.
        mutation: MutationReport,
        /// Validation record.
        validation: ValidationReport,
        /// Proposals recorded for later cycles.
        proposals: Vec<ImprovementProposal>,
    },
}

impl CycleOutcome {
    /// `true` only for [`CycleOutcome::Accepted`].
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Accepted { .. })
    }

    /// Text to feed back to the generator, for outcomes that have one.
    pub fn corrective_context(&self) -> Option<&str> {
        match self {
            Self::Unrecoverable {
                corrective_context, ..
            }
            | Self::InvalidPlan {
                corrective_context, ..
            }
            | Self::NothingApplied {
                corrective_context, ..
            }
            | Self::Rejected {
                corrective_context, ..
            }
            | Self::PartiallyApplied {
                corrective_context, ..
            } => Some(corrective_context),
            Self::GeneratorFailed { .. } | Self::Accepted { .. } => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::GeneratorFailed { .. } => "generator_failed",
            Self::Unrecoverable { .. } => "unrecoverable",
            Self::InvalidPlan { .. } => "invalid_plan",
            Self::NothingApplied { .. } => "nothing_applied",
            Self::Rejected { .. } => "rejected",
            Self::PartiallyApplied { .. } => "partially_applied",
            Self::Accepted { .. } => "accepted",
        }
    }
}

/// A finished cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    /// Stage that recovered the document, if recovery succeeded.
    pub recovery_stage: Option<RecoveryStage>,
    /// Repair stages that changed the text.
    pub repairs_applied: Vec<String>,
    /// The plan's rationale, if a plan was built.
    pub analysis: Option<String>,
    /// Advisory problems (for example a ledger that could not be written).
    pub warnings: Vec<String>,
    /// How the cycle ended.
    #[serde(flatten)]
    pub outcome: CycleOutcome,
}

impl CycleReport {
    fn bare(outcome: CycleOutcome) -> Self {
        Self {
            recovery_stage: None,
            repairs_applied: Vec::new(),
            analysis: None,
            warnings: Vec::new(),
            outcome,
        }
    }
}

// ─── Driver ───────────────────────────────────────────────────────────────────

/// Wires the pipeline stages together.
#[derive(Clone)]
pub struct PatchCycle {
    recovery: DocumentRecovery,
    mutation: MutationEngine,
    validation: ValidationPipeline,
    proposals: Option<ProposalGenerator>,
    rollback_on_reject: bool,
}

impl PatchCycle {
    /// Cycle without proposal generation or rollback.
    pub fn new(
        recovery: DocumentRecovery,
        mutation: MutationEngine,
        validation: ValidationPipeline,
    ) -> Self {
        Self {
            recovery,
            mutation,
            validation,
            proposals: None,
            rollback_on_reject: false,
        }
    }

    /// Build every stage from a validated configuration.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Validation`] for an unusable syntax command,
    /// [`PipelineError::Ledger`] if the proposal ledger cannot be initialised.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let root = &config.project.root;
        let syntax = SyntaxRegistry::with_commands(
            &config.validation.syntax_commands,
            config.validation.syntax_timeout(),
        )?;
        let mut validation = ValidationPipeline::new(root, syntax, config.quality.clone());
        if let Some(command) = &config.validation.test_command {
            validation = validation.with_test_runner(Arc::new(CommandTestRunner::new(
                command.clone(),
                config.validation.test_timeout(),
                config.validation.coverage_report.clone(),
            )));
        }

        let mut cycle = Self::new(
            DocumentRecovery::new(config.recovery_config()),
            MutationEngine::new(config.mutation_config()),
            validation,
        )
        .with_rollback_on_reject(config.project.rollback_on_reject);

        if config.proposals.enabled {
            let ledger = JsonFileLedger::new(config.ledger_path());
            ledger.initialize()?;
            cycle = cycle.with_proposals(ProposalGenerator::new(
                config.proposals.thresholds(),
                Arc::new(ledger),
                config.proposals.cooldown(),
            ));
        }
        Ok(cycle)
    }

    /// Record proposals after accepted cycles.
    pub fn with_proposals(mut self, generator: ProposalGenerator) -> Self {
        self.proposals = Some(generator);
        self
    }

    /// Restore backups when validation rejects or the plan only partly applied.
    pub fn with_rollback_on_reject(mut self, enabled: bool) -> Self {
        self.rollback_on_reject = enabled;
        self
    }

    /// Send `prompt` through `generator`, gated by `gate`, then run the reply.
    ///
    /// # Errors
    ///
    /// See [`run_reply`](Self::run_reply).
    pub async fn run_prompt(
        &self,
        generator: &dyn Generator,
        gate: &dyn SlotGate,
        prompt: &str,
    ) -> Result<CycleReport, PipelineError> {
        gate.acquire().await;
        let reply = generator.generate(prompt).await;
        if let Some(error) = &reply.error {
            gate.backoff(error);
        }
        gate.release();

        match (reply.raw_text, reply.error) {
            (Some(raw), _) if !raw.trim().is_empty() => self.run_reply(&raw).await,
            (_, Some(error)) => {
                warn!(error = %error, "generator call failed");
                Ok(CycleReport::bare(CycleOutcome::GeneratorFailed { error }))
            }
            _ => Ok(CycleReport::bare(CycleOutcome::GeneratorFailed {
                error: "generator returned an empty reply".to_string(),
            })),
        }
    }

    /// Run one raw generator reply through the pipeline.
    ///
    /// # Errors
    ///
    /// Only conditions fatal to the run: an unusable project root, or a
    /// validation state machine fault. Everything else is an outcome.
    pub async fn run_reply(&self, raw: &str) -> Result<CycleReport, PipelineError> {
        let span = info_span!("patch_cycle", input_chars = raw.len());
        let report = self.run_reply_inner(raw).instrument(span).await?;
        info!(outcome = report.outcome.label(), "patch cycle finished");
        Ok(report)
    }

    async fn run_reply_inner(&self, raw: &str) -> Result<CycleReport, PipelineError> {
        let recovery = match self.recovery.recover_with_trace(raw) {
            Ok(r) => r,
            Err(e) => {
                let corrective_context = format!(
                    "Your previous reply could not be parsed as a JSON object ({e}). \
                     Reply with a single JSON object with an \"analysis\" string and an \
                     \"operations\" array."
                );
                return Ok(CycleReport::bare(CycleOutcome::Unrecoverable {
                    error: e.to_string(),
                    corrective_context,
                }));
            }
        };

        let mut analysis = None;
        let mut warnings = Vec::new();
        let outcome = self
            .run_document(&recovery.document, &mut analysis, &mut warnings)
            .await?;

        Ok(CycleReport {
            recovery_stage: Some(recovery.stage),
            repairs_applied: recovery
                .repairs_applied
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            analysis,
            warnings,
            outcome,
        })
    }

    async fn run_document(
        &self,
        document: &RecoveredDocument,
        analysis: &mut Option<String>,
        warnings: &mut Vec<String>,
    ) -> Result<CycleOutcome, PipelineError> {
        // ── Plan ──────────────────────────────────────────────────────────
        let plan = match build_plan(document) {
            Ok(p) => p,
            Err(e) => {
                let corrective_context = format!(
                    "Your previous patch plan was invalid: {e}. Fix that operation and resend the whole plan."
                );
                return Ok(CycleOutcome::InvalidPlan {
                    error: e.to_string(),
                    index: e.index(),
                    corrective_context,
                });
            }
        };
        *analysis = Some(plan.analysis.clone());

        // ── Mutation ──────────────────────────────────────────────────────
        let mutation = self.mutation.apply(&plan)?;
        if mutation.status == MutationStatus::Failed {
            let corrective_context = mutation_context(&mutation);
            return Ok(CycleOutcome::NothingApplied {
                mutation,
                corrective_context,
            });
        }

        // ── Validation ────────────────────────────────────────────────────
        let validation = self.validation.validate_mutation(&mutation).await?;

        if !validation.is_accepted() {
            let corrective_context = validation
                .corrective_context()
                .unwrap_or_else(|| mutation_context(&mutation));
            let rollback = self.maybe_rollback(&mutation);
            return Ok(CycleOutcome::Rejected {
                mutation,
                validation,
                rollback,
                corrective_context,
            });
        }

        if mutation.status == MutationStatus::Partial {
            let corrective_context = mutation_context(&mutation);
            let rollback = self.maybe_rollback(&mutation);
            return Ok(CycleOutcome::PartiallyApplied {
                mutation,
                validation,
                rollback,
                corrective_context,
            });
        }

        // ── Proposals ─────────────────────────────────────────────────────
        let mut proposals = Vec::new();
        if let (Some(generator), Some(metrics)) = (&self.proposals, &validation.quality_metrics) {
            match generator.propose(metrics) {
                Ok(p) => proposals = p,
                Err(e) => {
                    warn!(error = %e, "could not record improvement proposals");
                    warnings.push(format!("proposals not recorded: {e}"));
                }
            }
        }

        Ok(CycleOutcome::Accepted {
            mutation,
            validation,
            proposals,
        })
    }

    fn maybe_rollback(&self, mutation: &MutationReport) -> Option<RollbackReport> {
        self.rollback_on_reject
            .then(|| self.mutation.rollback(mutation))
    }
}

fn mutation_context(mutation: &MutationReport) -> String {
    if mutation.errors.is_empty() {
        return "Your previous patch plan contained no operations. Resend it with at least one operation."
            .to_string();
    }
    let mut out = String::from("Some operations of your previous patch plan could not be applied:\n");
    for failure in &mutation.errors {
        out.push_str("- ");
        out.push_str(&failure.to_string());
        out.push('\n');
    }
    out.push_str(
        "Quote block_to_replace / block_to_delete exactly as they appear in the current file, \
         and make each block unique.",
    );
    out
}
