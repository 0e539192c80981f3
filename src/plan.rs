//! # Patch Plan Model
//!
//! Typed representation of a generator's edit proposal, built from a
//! [`RecoveredDocument`] and checked for internal consistency before any
//! file is touched.
//!
//! ## Document shape
//! ```json
//! {
//!   "analysis": "why these edits",
//!   "operations": [
//!     {"file_path": "src/a.rs", "operation": "INSERT", "content": "..."},
//!     {"file_path": "src/b.rs", "operation": "REPLACE", "block_to_replace": null, "content": "..."},
//!     {"file_path": "src/c.rs", "operation": "DELETE_BLOCK", "block_to_delete": "..."}
//!   ]
//! }
//! ```
//!
//! ## Guarantees
//! - `Insert`/`Replace` always carry content; `DeleteBlock` always carries a block.
//! - Every `file_path` is relative, free of `..`, and in normal form
//!   (`./a//b.rs` becomes `a/b.rs`), so one file has one spelling.
//! - The error names the first invalid operation and its index.

use std::path::{Component, Path};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::recovery::RecoveredDocument;

// ─── Error ────────────────────────────────────────────────────────────────────

/// Reasons a recovered document cannot become a [`PatchPlan`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    /// The document has no `operations` array.
    #[error("document has no `operations` array")]
    MissingOperationsList,

    /// An operation is not an object or lacks `file_path` / `operation`.
    #[error("operation {index} is malformed: {reason}")]
    MalformedOperation {
        /// Position in the `operations` array.
        index: usize,
        /// What is wrong with it.
        reason: String,
    },

    /// The `operation` field names no known kind.
    #[error("operation {index} has unknown kind {kind:?} (expected INSERT, REPLACE or DELETE_BLOCK)")]
    UnknownOperation {
        /// Position in the `operations` array.
        index: usize,
        /// The kind as written by the generator.
        kind: String,
    },

    /// An `Insert` or `Replace` has no `content`.
    #[error("operation {index} on {file_path} is missing `content`")]
    MissingContent {
        /// Position in the `operations` array.
        index: usize,
        /// Target file.
        file_path: String,
    },

    /// A `DeleteBlock` has no `block_to_delete`.
    #[error("operation {index} on {file_path} is missing `block_to_delete`")]
    MissingBlockToDelete {
        /// Position in the `operations` array.
        index: usize,
        /// Target file.
        file_path: String,
    },

    /// A `Replace` has no `block_to_replace` key (null is allowed).
    #[error("operation {index} on {file_path} is missing `block_to_replace` (use null for a whole-file replace)")]
    MissingBlockToReplace {
        /// Position in the `operations` array.
        index: usize,
        /// Target file.
        file_path: String,
    },

    /// The path is absolute or climbs out of the project root.
    #[error("operation {index} targets unsafe path {file_path:?}")]
    UnsafePath {
        /// Position in the `operations` array.
        index: usize,
        /// The offending path.
        file_path: String,
    },
}

impl PlanError {
    /// Index of the offending operation, if the error concerns one.
    pub fn index(&self) -> Option<usize> {
        match self {
            Self::MissingOperationsList => None,
            Self::MalformedOperation { index, .. }
            | Self::UnknownOperation { index, .. }
            | Self::MissingContent { index, .. }
            | Self::MissingBlockToDelete { index, .. }
            | Self::MissingBlockToReplace { index, .. }
            | Self::UnsafePath { index, .. } => Some(*index),
        }
    }
}

// ─── Operations ───────────────────────────────────────────────────────────────

/// Kind of a patch operation, as named in generator output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// Create a file or add content to it.
    Insert,
    /// Replace a whole file or one exact block.
    Replace,
    /// Remove one exact block.
    DeleteBlock,
}

impl OperationKind {
    /// Parse a kind name. Case-insensitive; `-` and spaces count as `_`.
    pub fn parse(raw: &str) -> Option<Self> {
        let norm = raw.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        match norm.as_str() {
            "INSERT" => Some(Self::Insert),
            "REPLACE" => Some(Self::Replace),
            "DELETE_BLOCK" | "DELETEBLOCK" | "DELETE" => Some(Self::DeleteBlock),
            _ => None,
        }
    }

    /// Canonical wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Replace => "REPLACE",
            Self::DeleteBlock => "DELETE_BLOCK",
        }
    }
}

/// One file edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PatchOperation {
    /// Create `file_path` with `content`, or append `content` to it.
    Insert {
        /// Path relative to the project root.
        file_path: String,
        /// Text to write.
        content: String,
    },
    /// Replace the whole file (`block_to_replace == None`) or one exact block.
    Replace {
        /// Path relative to the project root.
        file_path: String,
        /// Replacement text.
        content: String,
        /// Exact text to replace; `None` means the whole file.
        block_to_replace: Option<String>,
    },
    /// Remove one exact block.
    DeleteBlock {
        /// Path relative to the project root.
        file_path: String,
        /// Exact text to remove.
        block_to_delete: String,
    },
}

impl PatchOperation {
    /// The file this operation targets.
    pub fn file_path(&self) -> &str {
        match self {
            Self::Insert { file_path, .. }
            | Self::Replace { file_path, .. }
            | Self::DeleteBlock { file_path, .. } => file_path,
        }
    }

    /// The operation's kind.
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Insert { .. } => OperationKind::Insert,
            Self::Replace { .. } => OperationKind::Replace,
            Self::DeleteBlock { .. } => OperationKind::DeleteBlock,
        }
    }
}

/// An ordered list of edits plus the generator's rationale.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PatchPlan {
    /// Free-text rationale.
    pub analysis: String,
    /// Edits, applied in order.
    pub operations: Vec<PatchOperation>,
}

impl PatchPlan {
    /// Number of operations.
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// `true` if there is nothing to apply.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Distinct target files in first-seen order.
    pub fn target_files(&self) -> Vec<&str> {
        let mut files: Vec<&str> = Vec::new();
        for op in &self.operations {
            if !files.contains(&op.file_path()) {
                files.push(op.file_path());
            }
        }
        files
    }
}

// ─── Builder ──────────────────────────────────────────────────────────────────

/// Build a [`PatchPlan`] from a recovered document.
///
/// Every operation is checked; the error returned is the one for the lowest
/// index, so a generator retry can target it.
///
/// # Errors
///
/// See [`PlanError`].
pub fn build_plan(doc: &RecoveredDocument) -> Result<PatchPlan, PlanError> {
    let Some(Value::Array(raw_ops)) = doc.get("operations") else {
        return Err(PlanError::MissingOperationsList);
    };

    let analysis = match doc.get("analysis") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => {
            debug!("plan has no analysis text");
            String::new()
        }
        Some(other) => other.to_string(),
    };

    let mut operations = Vec::with_capacity(raw_ops.len());
    let mut errors = Vec::new();
    for (index, raw) in raw_ops.iter().enumerate() {
        match parse_operation(index, raw) {
            Ok(op) => operations.push(op),
            Err(e) => errors.push(e),
        }
    }

    if let Some(first) = errors.first() {
        warn!(
            invalid = errors.len(),
            total = raw_ops.len(),
            first = %first,
            "patch plan rejected"
        );
        return Err(first.clone());
    }

    debug!(operations = operations.len(), "patch plan built");
    Ok(PatchPlan {
        analysis,
        operations,
    })
}

fn parse_operation(index: usize, raw: &Value) -> Result<PatchOperation, PlanError> {
    let malformed = |reason: &str| PlanError::MalformedOperation {
        index,
        reason: reason.to_string(),
    };

    let Value::Object(obj) = raw else {
        return Err(malformed("expected an object"));
    };

    let file_path = match obj.get("file_path") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        Some(Value::String(_)) => return Err(malformed("`file_path` is empty")),
        Some(_) => return Err(malformed("`file_path` must be a string")),
        None => return Err(malformed("missing `file_path`")),
    };

    let kind = match obj.get("operation") {
        Some(Value::String(s)) => OperationKind::parse(s).ok_or_else(|| {
            PlanError::UnknownOperation {
                index,
                kind: s.clone(),
            }
        })?,
        Some(_) => return Err(malformed("`operation` must be a string")),
        None => return Err(malformed("missing `operation`")),
    };

    let Some(file_path) = normalize_relative(&file_path) else {
        return Err(PlanError::UnsafePath { index, file_path });
    };

    let content = || match obj.get("content") {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Null) | None => Err(PlanError::MissingContent {
            index,
            file_path: file_path.clone(),
        }),
        Some(_) => Err(malformed("`content` must be a string")),
    };

    match kind {
        OperationKind::Insert => Ok(PatchOperation::Insert {
            content: content()?,
            file_path: file_path.clone(),
        }),
        OperationKind::Replace => {
            let content = content()?;
            let block_to_replace = match obj.get("block_to_replace") {
                None => {
                    return Err(PlanError::MissingBlockToReplace { index, file_path });
                }
                Some(Value::Null) => None,
                Some(Value::String(s)) if s.is_empty() => {
                    return Err(malformed("`block_to_replace` is empty"));
                }
                Some(Value::String(s)) => Some(s.clone()),
                Some(_) => return Err(malformed("`block_to_replace` must be a string or null")),
            };
            Ok(PatchOperation::Replace {
                file_path,
                content,
                block_to_replace,
            })
        }
        OperationKind::DeleteBlock => match obj.get("block_to_delete") {
            Some(Value::String(s)) if !s.is_empty() => Ok(PatchOperation::DeleteBlock {
                file_path,
                block_to_delete: s.clone(),
            }),
            Some(Value::String(_)) => Err(malformed("`block_to_delete` is empty")),
            Some(Value::Null) | None => Err(PlanError::MissingBlockToDelete { index, file_path }),
            Some(_) => Err(malformed("`block_to_delete` must be a string")),
        },
    }
}

/// Normal form of a plan path: `/`-separated `Normal` components only.
///
/// `./a.py`, `a.py` and `.//a.py` all become `a.py`. `None` for absolute
/// paths, paths with `..`, and paths that name no file.
pub fn normalize_relative(path: &str) -> Option<String> {
    if path.starts_with('/') || path.starts_with('\\') {
        return None;
    }
    let mut parts = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}
