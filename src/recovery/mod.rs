//! # Structured-Document Recovery
//!
//! Turns noisy generator text into a single well-formed JSON object.
//!
//! ## Fallback chain
//! ```text
//! raw ─► boundary extraction ─► strict parse ──ok──► Direct
//!                                   │ err
//!                                   ▼
//!                 COMMON_REPAIRS ─► strict parse ──ok──► CommonRepair
//!                                   │ err
//!                                   ▼
//!             AGGRESSIVE_REPAIRS ─► strict parse ──ok──► AggressiveRepair
//!                                   │ err
//!                                   ▼
//!                         RecoveryError::Unparseable
//! ```
//!
//! ## Guarantees
//! - A successful result is a JSON object that re-serializes cleanly.
//! - Validity is always decided by `serde_json`, never assumed from a repair.
//! - Pure: the only side effect is `tracing` output.

pub mod repair;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use repair::{RepairStage, AGGRESSIVE_REPAIRS, COMMON_REPAIRS};

/// Default number of input characters echoed back in an `Unparseable` error.
pub const DEFAULT_DIAGNOSTIC_PREFIX_CHARS: usize = 200;

// ─── Error ────────────────────────────────────────────────────────────────────

/// Errors produced by document recovery.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecoveryError {
    /// The generator returned nothing but whitespace.
    #[error("generator output is empty")]
    EmptyInput,

    /// Every stage of the fallback chain failed.
    #[error("unparseable generator output: {message} (input began: {prefix:?})")]
    Unparseable {
        /// Diagnostic from the last strict parse attempt.
        message: String,
        /// Truncated prefix of the original input.
        prefix: String,
    },
}

// ─── Document ─────────────────────────────────────────────────────────────────

/// A parsed, syntactically valid object-shaped document.
///
/// Values are `serde_json::Value`, a closed tagged union
/// (null/bool/number/string/array/object); consumers match on it exhaustively.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecoveredDocument(Map<String, Value>);

impl RecoveredDocument {
    /// Wrap an existing object map.
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    /// Wrap `value` if it is an object.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(map) => Some(Self(map)),
            _ => None,
        }
    }

    /// Look up a top-level field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Borrow the underlying map.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Consume the document, returning the underlying map.
    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// Serialize with the canonical compact serializer.
    pub fn to_canonical_string(&self) -> String {
        Value::Object(self.0.clone()).to_string()
    }
}

// ─── Trace ────────────────────────────────────────────────────────────────────

/// The stage of the fallback chain that produced a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryStage {
    /// The extracted span parsed without any repair.
    Direct,
    /// The common repair pass was needed.
    CommonRepair,
    /// The aggressive repair pass was needed.
    AggressiveRepair,
}

/// A recovered document plus how it was obtained.
#[derive(Debug, Clone, PartialEq)]
pub struct Recovery {
    /// The recovered document.
    pub document: RecoveredDocument,
    /// Which stage produced it.
    pub stage: RecoveryStage,
    /// Names of repair stages that actually changed the text, in order.
    pub repairs_applied: Vec<&'static str>,
}

// ─── Engine ───────────────────────────────────────────────────────────────────

/// Configuration for [`DocumentRecovery`].
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// How many input characters to keep in `Unparseable` diagnostics.
    pub diagnostic_prefix_chars: usize,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            diagnostic_prefix_chars: DEFAULT_DIAGNOSTIC_PREFIX_CHARS,
        }
    }
}

/// Staged recovery engine. Stateless apart from its configuration.
#[derive(Debug, Clone, Default)]
pub struct DocumentRecovery {
    cfg: RecoveryConfig,
}

impl DocumentRecovery {
    /// Create an engine with the given configuration.
    pub fn new(cfg: RecoveryConfig) -> Self {
        Self { cfg }
    }

    /// Recover a document, discarding the trace.
    ///
    /// # Errors
    ///
    /// [`RecoveryError::EmptyInput`] for blank input,
    /// [`RecoveryError::Unparseable`] when every stage fails.
    pub fn recover(&self, raw: &str) -> Result<RecoveredDocument, RecoveryError> {
        self.recover_with_trace(raw).map(|r| r.document)
    }

    /// Recover a document and report which stage produced it.
    ///
    /// # Errors
    ///
    /// Same as [`recover`](Self::recover).
    pub fn recover_with_trace(&self, raw: &str) -> Result<Recovery, RecoveryError> {
        if raw.trim().is_empty() {
            return Err(RecoveryError::EmptyInput);
        }

        let candidate = extract_candidate(raw);
        let mut last_error = match parse_object(candidate) {
            Ok(document) => {
                debug!("document parsed without repair");
                return Ok(Recovery {
                    document,
                    stage: RecoveryStage::Direct,
                    repairs_applied: Vec::new(),
                });
            }
            Err(e) => e,
        };
        debug!(error = %last_error, "direct parse failed");

        let mut text = candidate.to_string();
        let mut repairs_applied = Vec::new();
        let passes: [(RecoveryStage, &[&dyn RepairStage]); 2] = [
            (RecoveryStage::CommonRepair, COMMON_REPAIRS),
            (RecoveryStage::AggressiveRepair, AGGRESSIVE_REPAIRS),
        ];

        for (stage, repairs) in passes {
            text = run_repairs(repairs, text, &mut repairs_applied);
            match parse_object(&text) {
                Ok(document) => {
                    debug!(?stage, repairs = ?repairs_applied, "document recovered");
                    return Ok(Recovery {
                        document,
                        stage,
                        repairs_applied,
                    });
                }
                Err(e) => {
                    debug!(?stage, error = %e, "parse still failing after repair pass");
                    last_error = e;
                }
            }
        }

        let prefix: String = raw.chars().take(self.cfg.diagnostic_prefix_chars).collect();
        warn!(error = %last_error, input_chars = raw.chars().count(), "document recovery exhausted");
        Err(RecoveryError::Unparseable {
            message: last_error,
            prefix,
        })
    }
}

/// Recover a document using the default configuration.
///
/// # Errors
///
/// See [`DocumentRecovery::recover`].
pub fn recover(raw: &str) -> Result<RecoveredDocument, RecoveryError> {
    DocumentRecovery::default().recover(raw)
}

/// Recover a document with a trace using the default configuration.
///
/// # Errors
///
/// See [`DocumentRecovery::recover`].
pub fn recover_with_trace(raw: &str) -> Result<Recovery, RecoveryError> {
    DocumentRecovery::default().recover_with_trace(raw)
}

// ─── Internals ────────────────────────────────────────────────────────────────

fn run_repairs(
    repairs: &[&dyn RepairStage],
    mut text: String,
    applied: &mut Vec<&'static str>,
) -> String {
    for stage in repairs {
        let next = stage.apply(&text);
        if next != text {
            debug!(stage = stage.name(), "repair stage rewrote candidate");
            applied.push(stage.name());
            text = next;
        }
    }
    text
}

fn parse_object(text: &str) -> Result<RecoveredDocument, String> {
    let value: Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    let kind = match &value {
        Value::Object(_) => "object",
        Value::Array(_) => "array",
        Value::String(_) => "string",
        Value::Number(_) => "number",
        Value::Bool(_) => "bool",
        Value::Null => "null",
    };
    RecoveredDocument::from_value(value)
        .ok_or_else(|| format!("top-level value is a {kind}, expected an object"))
}

/// Strip a surrounding code fence (```` ```lang ```` ... ```` ``` ````).
fn strip_fences(raw: &str) -> &str {
    let mut body = raw.trim();
    if let Some(rest) = body.strip_prefix("```") {
        body = match rest.find('\n') {
            Some(nl) => &rest[nl + 1..],
            None => rest,
        };
    }
    if let Some(rest) = body.trim_end().strip_suffix("```") {
        body = rest;
    }
    body.trim()
}

/// Locate the span most likely to hold the document.
///
/// Greedy: from the first `{` to the last `}` anywhere in the text. Output
/// truncated before its final `}` keeps everything from the first `{`.
fn extract_candidate(raw: &str) -> &str {
    let body = strip_fences(raw);
    match (body.find('{'), body.rfind('}')) {
        (Some(start), Some(end)) if start < end => &body[start..=end],
        (Some(start), _) => &body[start..],
        _ => body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> RecoveredDocument {
        RecoveredDocument::from_value(value).unwrap()
    }

    #[test]
    fn test_empty_input_is_rejected() {
        assert_eq!(recover(""), Err(RecoveryError::EmptyInput));
        assert_eq!(recover("  \n\t "), Err(RecoveryError::EmptyInput));
    }

    #[test]
    fn test_valid_document_parses_directly() {
        let r = recover_with_trace(r#"{"a": 1}"#).unwrap();
        assert_eq!(r.stage, RecoveryStage::Direct);
        assert!(r.repairs_applied.is_empty());
        assert_eq!(r.document, doc(json!({"a": 1})));
    }

    #[test]
    fn test_fenced_single_quoted_trailing_comma_scenario() {
        let raw = "```json\n{key: 'value', \"ops\": [1,2,]}\n```";
        let r = recover_with_trace(raw).unwrap();
        assert_eq!(r.document, doc(json!({"key": "value", "ops": [1, 2]})));
        assert_eq!(r.stage, RecoveryStage::AggressiveRepair);
        assert!(r.repairs_applied.contains(&"quote_bare_tokens"));
        assert!(r.repairs_applied.contains(&"strip_trailing_commas"));
    }

    #[test]
    fn test_prose_around_document_is_ignored() {
        let raw = "Sure! Here is the plan:\n{\"analysis\": \"x\", \"operations\": []}\nLet me know.";
        assert_eq!(
            recover(raw).unwrap(),
            doc(json!({"analysis": "x", "operations": []}))
        );
    }

    #[test]
    fn test_windows_path_is_recovered_in_common_pass() {
        let r = recover_with_trace(r#"{"file_path": "src\lib.rs"}"#).unwrap();
        assert_eq!(r.stage, RecoveryStage::CommonRepair);
        assert_eq!(r.document, doc(json!({"file_path": "src\\lib.rs"})));
    }

    #[test]
    fn test_truncated_output_is_balanced() {
        let raw = r#"{"analysis": "cut", "operations": [{"file_path": "a.rs", "content": "fn main() {"#;
        let r = recover_with_trace(raw).unwrap();
        assert_eq!(r.stage, RecoveryStage::AggressiveRepair);
        assert_eq!(
            r.document,
            doc(json!({
                "analysis": "cut",
                "operations": [{"file_path": "a.rs", "content": "fn main() {"}]
            }))
        );
    }

    #[test]
    fn test_top_level_array_is_unparseable() {
        let err = recover("```\n[1, 2, 3]\n```").unwrap_err();
        assert!(
            matches!(&err, RecoveryError::Unparseable { message, .. } if message.contains("expected an object")),
            "{err:?}"
        );
    }

    #[test]
    fn test_unparseable_carries_truncated_prefix() {
        let engine = DocumentRecovery::new(RecoveryConfig {
            diagnostic_prefix_chars: 5,
        });
        let err = engine.recover("no document here at all").unwrap_err();
        assert!(
            matches!(&err, RecoveryError::Unparseable { prefix, message } if prefix == "no do" && !message.is_empty()),
            "{err:?}"
        );
    }

    #[test]
    fn test_extract_candidate_is_greedy() {
        assert_eq!(extract_candidate("x {a} y {b} z"), "{a} y {b}");
        assert_eq!(extract_candidate("x {a"), "{a");
        assert_eq!(extract_candidate("```rust\nplain\n```"), "plain");
    }

    #[test]
    fn test_canonical_string_round_trips() {
        let d = doc(json!({"a": [1, {"b": null}], "c": "\"q\""}));
        assert_eq!(recover(&d.to_canonical_string()).unwrap(), d);
    }
}
