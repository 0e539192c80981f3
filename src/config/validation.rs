//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`PipelineConfig`] that cannot
//! be expressed through the type system alone (range checks, cross-field
//! invariants).
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use super::PipelineConfig;

/// Errors arising from configuration parsing, validation, or I/O.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "validation.test_timeout_s").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

fn invalid(field: impl Into<String>, value: impl Into<String>, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.into(),
        value: value.into(),
        reason: reason.into(),
    }
}

/// Validate all semantic constraints on a [`PipelineConfig`].
///
/// Collects every violation before returning so the caller sees the full
/// scope of issues at once.
///
/// # Errors
///
/// `Err(Vec<ConfigError>)` with every violation found.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &PipelineConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Project ──────────────────────────────────────────────────────
    let suffix = &config.project.backup_suffix;
    if suffix.is_empty() {
        errors.push(invalid(
            "project.backup_suffix",
            "\"\"",
            "must not be empty, or backups would overwrite their originals",
        ));
    } else if suffix.contains('/') || suffix.contains('\\') {
        errors.push(invalid(
            "project.backup_suffix",
            format!("{suffix:?}"),
            "must not contain path separators",
        ));
    }

    if config.project.root.as_os_str().is_empty() {
        errors.push(invalid("project.root", "\"\"", "must not be empty"));
    }

    // ── Recovery ─────────────────────────────────────────────────────
    if config.recovery.diagnostic_prefix_chars == 0 {
        errors.push(invalid(
            "recovery.diagnostic_prefix_chars",
            "0",
            "must be at least 1",
        ));
    }

    // ── Validation ───────────────────────────────────────────────────
    if config.validation.syntax_timeout_s == 0 {
        errors.push(invalid("validation.syntax_timeout_s", "0", "must be at least 1"));
    }
    if config.validation.test_timeout_s == 0 {
        errors.push(invalid("validation.test_timeout_s", "0", "must be at least 1"));
    }

    for (ext, command) in &config.validation.syntax_commands {
        let field = format!("validation.syntax_commands.{ext}");
        if ext.is_empty() || ext.contains('/') || ext.starts_with('.') {
            errors.push(invalid(
                field.clone(),
                format!("{ext:?}"),
                "extension must be bare, like \"py\"",
            ));
        }
        if command.first().map_or(true, |p| p.trim().is_empty()) {
            errors.push(invalid(field, format!("{command:?}"), "command must name a program"));
        }
    }

    match &config.validation.test_command {
        Some(cmd) if cmd.first().map_or(true, |p| p.trim().is_empty()) => {
            errors.push(invalid(
                "validation.test_command",
                format!("{cmd:?}"),
                "command must name a program",
            ));
        }
        None if config.validation.coverage_report.is_some() => {
            errors.push(invalid(
                "validation.coverage_report",
                config
                    .validation
                    .coverage_report
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default(),
                "requires validation.test_command to produce it",
            ));
        }
        _ => {}
    }

    // ── Quality ──────────────────────────────────────────────────────
    if config.quality.min_block_lines < 2 {
        errors.push(invalid(
            "quality.min_block_lines",
            config.quality.min_block_lines.to_string(),
            "must be at least 2",
        ));
    }
    if config.quality.min_occurrences < 2 {
        errors.push(invalid(
            "quality.min_occurrences",
            config.quality.min_occurrences.to_string(),
            "must be at least 2",
        ));
    }

    // ── Proposals ────────────────────────────────────────────────────
    let pct = config.proposals.min_coverage_percent;
    if !(0.0..=100.0).contains(&pct) {
        errors.push(invalid(
            "proposals.min_coverage_percent",
            pct.to_string(),
            "must be between 0.0 and 100.0",
        ));
    }
    if config.proposals.max_cyclomatic == 0 {
        errors.push(invalid("proposals.max_cyclomatic", "0", "must be at least 1"));
    }
    if config.proposals.enabled && config.proposals.ledger_path.as_os_str().is_empty() {
        errors.push(invalid(
            "proposals.ledger_path",
            "\"\"",
            "must be set when proposals are enabled",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn fields(result: Result<(), Vec<ConfigError>>) -> Vec<String> {
        result
            .unwrap_err()
            .into_iter()
            .map(|e| match e {
                ConfigError::InvalidField { field, .. } => field,
                other => other.to_string(),
            })
            .collect()
    }

    #[test]
    fn test_validate_default_config_passes() {
        assert!(validate(&PipelineConfig::default()).is_ok());
    }

    #[test]
    fn test_validate_empty_backup_suffix_fails() {
        let mut c = PipelineConfig::default();
        c.project.backup_suffix = String::new();
        assert_eq!(fields(validate(&c)), vec!["project.backup_suffix"]);
    }

    #[test]
    fn test_validate_backup_suffix_with_separator_fails() {
        let mut c = PipelineConfig::default();
        c.project.backup_suffix = "/../x".into();
        assert_eq!(fields(validate(&c)), vec!["project.backup_suffix"]);
    }

    #[test]
    fn test_validate_empty_root_fails() {
        let mut c = PipelineConfig::default();
        c.project.root = PathBuf::new();
        assert_eq!(fields(validate(&c)), vec!["project.root"]);
    }

    #[test]
    fn test_validate_zero_prefix_fails() {
        let mut c = PipelineConfig::default();
        c.recovery.diagnostic_prefix_chars = 0;
        assert_eq!(fields(validate(&c)), vec!["recovery.diagnostic_prefix_chars"]);
    }

    #[test]
    fn test_validate_zero_timeouts_fail() {
        let mut c = PipelineConfig::default();
        c.validation.syntax_timeout_s = 0;
        c.validation.test_timeout_s = 0;
        assert_eq!(
            fields(validate(&c)),
            vec!["validation.syntax_timeout_s", "validation.test_timeout_s"]
        );
    }

    #[test]
    fn test_validate_bad_syntax_command_fails() {
        let mut c = PipelineConfig::default();
        c.validation.syntax_commands.insert("js".into(), vec![]);
        c.validation
            .syntax_commands
            .insert(".ts".into(), vec!["tsc".into()]);
        let got = fields(validate(&c));
        assert_eq!(got.len(), 2);
        assert!(got.contains(&"validation.syntax_commands.js".to_string()));
        assert!(got.contains(&"validation.syntax_commands..ts".to_string()));
    }

    #[test]
    fn test_validate_empty_test_command_fails() {
        let mut c = PipelineConfig::default();
        c.validation.test_command = Some(vec![" ".into()]);
        assert_eq!(fields(validate(&c)), vec!["validation.test_command"]);
    }

    #[test]
    fn test_validate_coverage_without_test_command_fails() {
        let mut c = PipelineConfig::default();
        c.validation.coverage_report = Some(PathBuf::from("coverage.json"));
        assert_eq!(fields(validate(&c)), vec!["validation.coverage_report"]);
    }

    #[test]
    fn test_validate_quality_thresholds() {
        let mut c = PipelineConfig::default();
        c.quality.min_block_lines = 1;
        c.quality.min_occurrences = 0;
        assert_eq!(
            fields(validate(&c)),
            vec!["quality.min_block_lines", "quality.min_occurrences"]
        );
    }

    #[test]
    fn test_validate_proposal_ranges() {
        let mut c = PipelineConfig::default();
        c.proposals.min_coverage_percent = 101.0;
        c.proposals.max_cyclomatic = 0;
        c.proposals.ledger_path = PathBuf::new();
        assert_eq!(
            fields(validate(&c)),
            vec![
                "proposals.min_coverage_percent",
                "proposals.max_cyclomatic",
                "proposals.ledger_path"
            ]
        );
    }

    #[test]
    fn test_validate_disabled_proposals_allow_empty_ledger_path() {
        let mut c = PipelineConfig::default();
        c.proposals.enabled = false;
        c.proposals.ledger_path = PathBuf::new();
        assert!(validate(&c).is_ok());
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut c = PipelineConfig::default();
        c.project.backup_suffix = String::new();
        c.validation.test_timeout_s = 0;
        c.proposals.max_cyclomatic = 0;
        assert_eq!(validate(&c).unwrap_err().len(), 3);
    }
}
