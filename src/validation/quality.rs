//! # Quality Scoring
//!
//! Heuristic structural signals for one source file: a cyclomatic
//! complexity distribution over its functions and a duplicated-block count,
//! folded into a single score in `[0, 1]`.
//!
//! These are gates for a decision, not exact metrics. Function boundaries
//! come from indentation (Python) or brace depth (everything else), and
//! complexity is `1 + decision points` counted lexically.
//!
//! ## Score
//! ```text
//! complexity_penalty = min(1, (0.7·max + 0.3·avg) / COMPLEXITY_CEILING)
//! duplication_penalty = min(1, duplicated_blocks / DUPLICATION_CEILING)
//! score = 1 − (COMPLEXITY_WEIGHT·complexity_penalty + DUPLICATION_WEIGHT·duplication_penalty)
//! ```

use std::collections::{BTreeMap, HashMap};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Complexity at which the complexity penalty saturates.
pub const COMPLEXITY_CEILING: f64 = 25.0;
/// Duplicated-block count at which the duplication penalty saturates.
pub const DUPLICATION_CEILING: f64 = 10.0;
/// Share of the score driven by complexity.
pub const COMPLEXITY_WEIGHT: f64 = 0.6;
/// Share of the score driven by duplication.
pub const DUPLICATION_WEIGHT: f64 = 0.4;
/// Within the complexity penalty, weight of the worst function.
pub const MAX_COMPLEXITY_SHARE: f64 = 0.7;

// ─── Error ────────────────────────────────────────────────────────────────────

/// Reasons a file could not be scored. Always advisory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QualityError {
    /// The file could not be read as UTF-8 text.
    #[error("cannot read {file}: {reason}")]
    Unreadable {
        /// Relative path.
        file: String,
        /// Underlying error.
        reason: String,
    },

    /// The file looks binary.
    #[error("{file} looks like a binary file")]
    Binary {
        /// Relative path.
        file: String,
    },
}

// ─── Config & results ─────────────────────────────────────────────────────────

/// Duplicated-block detector thresholds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct QualityConfig {
    /// Consecutive significant lines forming one block.
    pub min_block_lines: usize,
    /// Occurrences needed for a block to count as duplicated.
    pub min_occurrences: usize,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_block_lines: 6,
            min_occurrences: 2,
        }
    }
}

/// Signals for one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileQuality {
    /// Highest per-function complexity.
    pub cyclomatic_max: u32,
    /// Mean per-function complexity.
    pub cyclomatic_avg: f64,
    /// Functions found; 0 means the whole file was scored as one unit.
    pub function_count: usize,
    /// Distinct blocks occurring at least `min_occurrences` times.
    pub duplicated_block_count: usize,
    /// Line coverage from the dynamic check, when it ran.
    pub coverage_percent: Option<f64>,
    /// Composite score in `[0, 1]`; higher is better.
    pub quality_score: f64,
}

/// Signals for every scored file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    /// Per-file signals keyed by relative path.
    pub per_file: BTreeMap<String, FileQuality>,
    /// Mean of the per-file scores; 1.0 when nothing was scored.
    pub quality_score: f64,
}

impl QualityMetrics {
    /// Build from per-file results, computing the aggregate score.
    pub fn from_files(per_file: BTreeMap<String, FileQuality>) -> Self {
        let quality_score = if per_file.is_empty() {
            1.0
        } else {
            per_file.values().map(|f| f.quality_score).sum::<f64>() / per_file.len() as f64
        };
        Self {
            per_file,
            quality_score,
        }
    }
}

// ─── Language model ───────────────────────────────────────────────────────────

/// Lexical family used for segmentation and decision counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceLanguage {
    /// Indentation-scoped, `#` comments.
    Python,
    /// Brace-scoped, `match` arms count as decisions.
    Rust,
    /// Other brace-scoped languages.
    BraceLike,
    /// Anything else: scored as a single unit.
    Plain,
}

impl SourceLanguage {
    /// Family for a file extension.
    pub fn for_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "py" | "pyi" => Self::Python,
            "rs" => Self::Rust,
            "c" | "h" | "cpp" | "hpp" | "cc" | "java" | "js" | "jsx" | "ts" | "tsx" | "mjs"
            | "go" | "cs" | "kt" | "swift" => Self::BraceLike,
            _ => Self::Plain,
        }
    }

    fn decision_words(self) -> &'static [&'static str] {
        match self {
            Self::Python => &["if", "elif", "for", "while", "except", "and", "or", "case"],
            Self::Rust => &["if", "for", "while"],
            Self::BraceLike => &["if", "for", "while", "case", "catch"],
            Self::Plain => &["if", "for", "while", "case"],
        }
    }

    fn line_comment(self) -> &'static str {
        match self {
            Self::Python => "#",
            _ => "//",
        }
    }
}

// ─── Scoring ──────────────────────────────────────────────────────────────────

/// Score `source` as a file of `language`.
pub fn score_source(source: &str, language: SourceLanguage, cfg: &QualityConfig) -> FileQuality {
    let lines: Vec<&str> = source.lines().collect();
    let segments = match language {
        SourceLanguage::Python => python_functions(&lines),
        SourceLanguage::Rust | SourceLanguage::BraceLike => brace_functions(&lines, language),
        SourceLanguage::Plain => Vec::new(),
    };
    let function_count = segments.len();

    let complexities: Vec<u32> = if segments.is_empty() {
        vec![complexity(&lines, language)]
    } else {
        segments
            .iter()
            .map(|&(start, end)| complexity(&lines[start..end], language))
            .collect()
    };

    let cyclomatic_max = complexities.iter().copied().max().unwrap_or(1);
    let cyclomatic_avg =
        complexities.iter().map(|&c| f64::from(c)).sum::<f64>() / complexities.len() as f64;
    let duplicated_block_count = duplicated_blocks(&lines, language, cfg);

    FileQuality {
        cyclomatic_max,
        cyclomatic_avg,
        function_count,
        duplicated_block_count,
        coverage_percent: None,
        quality_score: composite_score(cyclomatic_max, cyclomatic_avg, duplicated_block_count),
    }
}

/// Score a file's bytes, rejecting binary or non-UTF-8 content.
///
/// # Errors
///
/// [`QualityError`] when the content is not text.
pub fn score_bytes(
    file: &str,
    bytes: &[u8],
    language: SourceLanguage,
    cfg: &QualityConfig,
) -> Result<FileQuality, QualityError> {
    if bytes.contains(&0) {
        return Err(QualityError::Binary {
            file: file.to_string(),
        });
    }
    let source = std::str::from_utf8(bytes).map_err(|e| QualityError::Unreadable {
        file: file.to_string(),
        reason: e.to_string(),
    })?;
    Ok(score_source(source, language, cfg))
}

/// The fixed weighting function.
pub fn composite_score(cyclomatic_max: u32, cyclomatic_avg: f64, duplicated_blocks: usize) -> f64 {
    let blended = MAX_COMPLEXITY_SHARE * f64::from(cyclomatic_max)
        + (1.0 - MAX_COMPLEXITY_SHARE) * cyclomatic_avg;
    let complexity_penalty = (blended / COMPLEXITY_CEILING).min(1.0);
    let duplication_penalty = (duplicated_blocks as f64 / DUPLICATION_CEILING).min(1.0);
    (1.0 - (COMPLEXITY_WEIGHT * complexity_penalty + DUPLICATION_WEIGHT * duplication_penalty))
        .clamp(0.0, 1.0)
}

/// `1 + decision points` over `lines`.
fn complexity(lines: &[&str], language: SourceLanguage) -> u32 {
    let words = language.decision_words();
    let mut decisions = 0u32;

    for raw in lines {
        let line = code_part(raw, language);
        for token in line.split(|c: char| !(c.is_alphanumeric() || c == '_')) {
            if words.contains(&token) {
                decisions += 1;
            }
        }
        if language != SourceLanguage::Python {
            decisions += line.matches("&&").count() as u32;
            decisions += line.matches("||").count() as u32;
        }
        match language {
            SourceLanguage::Rust => {
                decisions += line.matches("=>").count() as u32;
                decisions += line.matches('?').count() as u32;
            }
            SourceLanguage::BraceLike => {
                decisions += line.matches(" ? ").count() as u32;
            }
            _ => {}
        }
    }
    1 + decisions
}

/// The line with string literals blanked and any trailing comment removed.
fn code_part(line: &str, language: SourceLanguage) -> String {
    let comment = language.line_comment();
    let mut out = String::with_capacity(line.len());
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (i, c) in line.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
                out.push(c);
            }
            continue;
        }
        if line[i..].starts_with(comment) {
            break;
        }
        // Single quotes are char literals or lifetimes in Rust.
        if c == '"' || (c == '\'' && language != SourceLanguage::Rust) {
            quote = Some(c);
        }
        out.push(c);
    }
    out
}

/// Half-open line ranges of Python `def` bodies.
fn python_functions(lines: &[&str]) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    for (start, line) in lines.iter().enumerate() {
        let trimmed = line.trim_start();
        if !(trimmed.starts_with("def ") || trimmed.starts_with("async def ")) {
            continue;
        }
        let indent = line.len() - trimmed.len();
        let mut end = start + 1;
        while end < lines.len() {
            let next = lines[end];
            let next_trimmed = next.trim_start();
            if !next_trimmed.is_empty() && next.len() - next_trimmed.len() <= indent {
                break;
            }
            end += 1;
        }
        out.push((start, end));
    }
    out
}

const CONTROL_KEYWORDS: &[&str] = &[
    "if", "else", "for", "while", "switch", "catch", "do", "match", "loop", "return", "try",
];

fn looks_like_function_header(line: &str) -> bool {
    let trimmed = line.trim_start();
    let first_word = trimmed
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .next()
        .unwrap_or("");
    if CONTROL_KEYWORDS.contains(&first_word) || trimmed.starts_with('}') {
        return false;
    }
    let has_keyword = trimmed
        .split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .any(|w| matches!(w, "fn" | "function" | "func"));
    let c_style = trimmed.contains('(')
        && trimmed.trim_end().ends_with('{')
        && !trimmed.contains('=')
        && !trimmed.contains(';');
    has_keyword || c_style
}

/// Half-open line ranges of brace-delimited function bodies. Nested
/// functions are folded into their enclosing one.
fn brace_functions(lines: &[&str], language: SourceLanguage) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        if !looks_like_function_header(lines[i]) {
            i += 1;
            continue;
        }
        let start = i;
        let mut depth = 0i64;
        let mut opened = false;
        let mut j = i;
        while j < lines.len() {
            let code = code_part(lines[j], language);
            for c in code.chars() {
                match c {
                    '{' => {
                        depth += 1;
                        opened = true;
                    }
                    '}' => depth -= 1,
                    _ => {}
                }
            }
            // A declaration without a body (trait method, prototype).
            if !opened && code.trim_end().ends_with(';') {
                break;
            }
            j += 1;
            if opened && depth <= 0 {
                break;
            }
        }
        if opened {
            out.push((start, j));
            i = j.max(start + 1);
        } else {
            i = start + 1;
        }
    }
    out
}

/// Distinct windows of `min_block_lines` significant lines that occur at
/// least `min_occurrences` times.
fn duplicated_blocks(lines: &[&str], language: SourceLanguage, cfg: &QualityConfig) -> usize {
    let window = cfg.min_block_lines.max(1);
    let significant: Vec<String> = lines
        .iter()
        .map(|l| {
            code_part(l, language)
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
        })
        .filter(|l| l.chars().any(|c| c.is_alphanumeric()))
        .collect();

    if significant.len() < window {
        return 0;
    }

    let mut counts: HashMap<&[String], usize> = HashMap::new();
    for block in significant.windows(window) {
        *counts.entry(block).or_insert(0) += 1;
    }
    counts
        .values()
        .filter(|&&n| n >= cfg.min_occurrences.max(2))
        .count()
}
