//! # Metrics-Driven Proposal Generator
//!
//! Turns quality metrics into improvement objectives for the next cycle.
//!
//! ## Rules
//! - `cyclomatic_max > max_cyclomatic` emits a `Refactor` proposal.
//! - `coverage_percent < min_coverage_percent` emits an `Enhance` proposal
//!   (only when coverage is known).
//!
//! ## Rate limiting
//! A `(file, kind)` pair already recorded in the ledger within the cooldown
//! window is not proposed again, so one stubborn file cannot flood the
//! ledger cycle after cycle.
//!
//! ## NOT Responsible For
//! - Applying anything. Proposals are objectives, never patches.

pub mod ledger;

use std::{fmt, sync::Arc};

use chrono::{DateTime, Duration, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::validation::quality::{FileQuality, QualityMetrics};
use ledger::{ImprovementLedger, LedgerEntry, LedgerError};

// ─── Types ────────────────────────────────────────────────────────────────────

/// Threshold configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct ProposalThresholds {
    /// Complexity above which a file should be refactored.
    pub max_cyclomatic: u32,
    /// Coverage below which a file needs more tests.
    pub min_coverage_percent: f64,
}

impl Default for ProposalThresholds {
    fn default() -> Self {
        Self {
            max_cyclomatic: 10,
            min_coverage_percent: 60.0,
        }
    }
}

/// What a proposal asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProposalKind {
    /// Reduce complexity or duplication without changing behaviour.
    Refactor,
    /// Add tests for uncovered code.
    Enhance,
}

impl fmt::Display for ProposalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Refactor => "Refactor",
            Self::Enhance => "Enhance",
        })
    }
}

/// A candidate objective for a later cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImprovementProposal {
    /// File the proposal is about.
    pub file_path: String,
    /// Requested kind of work.
    pub operation_kind: ProposalKind,
    /// The metric that triggered it.
    pub reason: String,
    /// What the generator should do.
    pub guidance: String,
}

impl ImprovementProposal {
    /// The proposal as an objective prompt for the generator.
    pub fn objective(&self) -> String {
        format!(
            "{kind} {file}. Why: {reason}. {guidance}",
            kind = self.operation_kind,
            file = self.file_path,
            reason = self.reason,
            guidance = self.guidance,
        )
    }
}

// ─── Pure generation ──────────────────────────────────────────────────────────

/// Proposals for every file in `metrics` that crosses a threshold, in
/// file order, `Refactor` before `Enhance`.
pub fn generate(metrics: &QualityMetrics, thresholds: &ProposalThresholds) -> Vec<ImprovementProposal> {
    let mut out = Vec::new();
    for (file, q) in &metrics.per_file {
        if q.cyclomatic_max > thresholds.max_cyclomatic {
            out.push(refactor(file, q, thresholds));
        }
        if let Some(coverage) = q.coverage_percent {
            if coverage < thresholds.min_coverage_percent {
                out.push(enhance(file, coverage, thresholds));
            }
        }
    }
    out
}

fn refactor(file: &str, q: &FileQuality, t: &ProposalThresholds) -> ImprovementProposal {
    let mut guidance = format!(
        "Split the most complex functions in {file} into smaller ones so none exceeds complexity {}.",
        t.max_cyclomatic
    );
    if q.duplicated_block_count > 0 {
        guidance.push_str(&format!(
            " Extract the {} duplicated block(s) into shared helpers.",
            q.duplicated_block_count
        ));
    }
    guidance.push_str(" Behaviour must not change.");

    ImprovementProposal {
        file_path: file.to_string(),
        operation_kind: ProposalKind::Refactor,
        reason: format!(
            "cyclomatic complexity {} exceeds {} (average {:.1})",
            q.cyclomatic_max, t.max_cyclomatic, q.cyclomatic_avg
        ),
        guidance,
    }
}

fn enhance(file: &str, coverage: f64, t: &ProposalThresholds) -> ImprovementProposal {
    ImprovementProposal {
        file_path: file.to_string(),
        operation_kind: ProposalKind::Enhance,
        reason: format!(
            "line coverage {coverage:.1}% is below {:.1}%",
            t.min_coverage_percent
        ),
        guidance: format!(
            "Add tests that exercise the uncovered paths of {file} until coverage reaches {:.0}%.",
            t.min_coverage_percent
        ),
    }
}

// ─── Ledger-backed generator ──────────────────────────────────────────────────

/// Generates proposals and appends them to a ledger, honouring a cooldown.
#[derive(Clone)]
pub struct ProposalGenerator {
    thresholds: ProposalThresholds,
    ledger: Arc<dyn ImprovementLedger>,
    cooldown: Duration,
}

impl ProposalGenerator {
    /// Generator writing to `ledger`.
    pub fn new(
        thresholds: ProposalThresholds,
        ledger: Arc<dyn ImprovementLedger>,
        cooldown: std::time::Duration,
    ) -> Self {
        Self {
            thresholds,
            ledger,
            cooldown: Duration::from_std(cooldown).unwrap_or_else(|_| Duration::weeks(52 * 100)),
        }
    }

    /// The ledger proposals are written to.
    pub fn ledger(&self) -> &Arc<dyn ImprovementLedger> {
        &self.ledger
    }

    /// Generate, drop proposals still on cooldown, record the rest.
    ///
    /// # Errors
    ///
    /// [`LedgerError`] if the ledger cannot be read or written.
    pub fn propose(&self, metrics: &QualityMetrics) -> Result<Vec<ImprovementProposal>, LedgerError> {
        self.propose_at(metrics, Utc::now())
    }

    /// [`propose`](Self::propose) with an explicit clock.
    ///
    /// # Errors
    ///
    /// [`LedgerError`] if the ledger cannot be read or written.
    pub fn propose_at(
        &self,
        metrics: &QualityMetrics,
        now: DateTime<Utc>,
    ) -> Result<Vec<ImprovementProposal>, LedgerError> {
        let mut fresh = Vec::new();
        for proposal in generate(metrics, &self.thresholds) {
            let last = self
                .ledger
                .last_recorded(&proposal.file_path, proposal.operation_kind)?;
            if let Some(last) = last {
                if now.signed_duration_since(last) < self.cooldown {
                    debug!(
                        file = %proposal.file_path,
                        kind = %proposal.operation_kind,
                        "proposal on cooldown"
                    );
                    continue;
                }
            }
            fresh.push(proposal);
        }

        let entries: Vec<LedgerEntry> = fresh
            .iter()
            .cloned()
            .map(|proposal| LedgerEntry {
                proposal,
                recorded_at: now,
            })
            .collect();
        self.ledger.append(&entries)?;

        if !fresh.is_empty() {
            info!(count = fresh.len(), "improvement proposals recorded");
        }
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::ledger::InMemoryLedger;
    use std::collections::BTreeMap;

    fn quality(max: u32, coverage: Option<f64>) -> FileQuality {
        FileQuality {
            cyclomatic_max: max,
            cyclomatic_avg: f64::from(max) / 2.0,
            function_count: 2,
            duplicated_block_count: 0,
            coverage_percent: coverage,
            quality_score: 0.5,
        }
    }

    fn metrics(files: &[(&str, u32, Option<f64>)]) -> QualityMetrics {
        let per_file: BTreeMap<_, _> = files
            .iter()
            .map(|&(f, max, cov)| (f.to_string(), quality(max, cov)))
            .collect();
        QualityMetrics::from_files(per_file)
    }

    #[test]
    fn test_thresholds_select_kinds() {
        let m = metrics(&[
            ("a.py", 15, Some(90.0)),
            ("b.py", 3, Some(20.0)),
            ("c.py", 3, None),
            ("d.py", 30, Some(10.0)),
        ]);
        let props = generate(&m, &ProposalThresholds::default());
        let got: Vec<_> = props
            .iter()
            .map(|p| (p.file_path.as_str(), p.operation_kind))
            .collect();
        assert_eq!(
            got,
            vec![
                ("a.py", ProposalKind::Refactor),
                ("b.py", ProposalKind::Enhance),
                ("d.py", ProposalKind::Refactor),
                ("d.py", ProposalKind::Enhance),
            ]
        );
    }

    #[test]
    fn test_threshold_boundaries_are_strict() {
        let t = ProposalThresholds::default();
        let m = metrics(&[("a.py", t.max_cyclomatic, Some(t.min_coverage_percent))]);
        assert!(generate(&m, &t).is_empty());
    }

    #[test]
    fn test_objective_mentions_file_and_reason() {
        let m = metrics(&[("a.py", 15, None)]);
        let p = &generate(&m, &ProposalThresholds::default())[0];
        let obj = p.objective();
        assert!(obj.starts_with("Refactor a.py"));
        assert!(obj.contains("15"));
    }

    #[test]
    fn test_cooldown_suppresses_repeat_proposals() {
        let ledger = Arc::new(InMemoryLedger::new());
        let generator = ProposalGenerator::new(
            ProposalThresholds::default(),
            ledger.clone(),
            std::time::Duration::from_secs(3600),
        );
        let m = metrics(&[("a.py", 15, None)]);
        let t0 = Utc::now();

        assert_eq!(generator.propose_at(&m, t0).unwrap().len(), 1);
        assert!(generator
            .propose_at(&m, t0 + Duration::minutes(30))
            .unwrap()
            .is_empty());
        assert_eq!(
            generator
                .propose_at(&m, t0 + Duration::hours(2))
                .unwrap()
                .len(),
            1
        );
        assert_eq!(ledger.entries().unwrap().len(), 2);
    }
}
