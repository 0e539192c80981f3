//! # Improvement Ledger
//!
//! Durable record of every proposal the generator has emitted. The on-disk
//! form is a JSON document with one top-level array:
//!
//! ```json
//! { "improvements": [ { "file_path": "...", "operation_kind": "Refactor", ... } ] }
//! ```
//!
//! ## Guarantees
//! - Appends only. Existing entries and any other top-level keys are carried
//!   over verbatim, including entries this crate cannot parse.
//! - A missing ledger file is initialised to `{"improvements": []}`.
//! - Writes go through a sibling temp file and a rename, so a crash never
//!   leaves a truncated ledger.

use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use super::{ImprovementProposal, ProposalKind};

/// Top-level key holding the entry array.
pub const LEDGER_KEY: &str = "improvements";

// ─── Error ────────────────────────────────────────────────────────────────────

/// Errors produced by a ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The ledger file could not be read or written.
    #[error("ledger I/O on {path}: {source}")]
    Io {
        /// Ledger location.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The ledger file exists but is not a ledger document.
    #[error("ledger {path} is malformed: {reason}")]
    Malformed {
        /// Ledger location.
        path: String,
        /// What is wrong with it.
        reason: String,
    },
}

// ─── Entry ────────────────────────────────────────────────────────────────────

/// A proposal plus when it was recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// The proposal.
    #[serde(flatten)]
    pub proposal: ImprovementProposal,
    /// When it was appended.
    pub recorded_at: DateTime<Utc>,
}

// ─── Trait ────────────────────────────────────────────────────────────────────

/// Append-only store of proposals.
pub trait ImprovementLedger: Send + Sync {
    /// Append `entries` in order.
    fn append(&self, entries: &[LedgerEntry]) -> Result<(), LedgerError>;

    /// Every readable entry, oldest first.
    fn entries(&self) -> Result<Vec<LedgerEntry>, LedgerError>;

    /// Most recent time a proposal of `kind` for `file_path` was recorded.
    fn last_recorded(
        &self,
        file_path: &str,
        kind: ProposalKind,
    ) -> Result<Option<DateTime<Utc>>, LedgerError> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| e.proposal.file_path == file_path && e.proposal.operation_kind == kind)
            .map(|e| e.recorded_at)
            .max())
    }
}

// ─── In-memory ────────────────────────────────────────────────────────────────

/// Ledger that lives for the life of the process.
#[derive(Debug, Default)]
pub struct InMemoryLedger {
    entries: Mutex<Vec<LedgerEntry>>,
}

impl InMemoryLedger {
    /// Empty ledger.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ImprovementLedger for InMemoryLedger {
    fn append(&self, entries: &[LedgerEntry]) -> Result<(), LedgerError> {
        self.entries.lock().extend_from_slice(entries);
        Ok(())
    }

    fn entries(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        Ok(self.entries.lock().clone())
    }
}

// ─── JSON file ────────────────────────────────────────────────────────────────

/// Ledger persisted as a JSON document.
#[derive(Debug)]
pub struct JsonFileLedger {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl JsonFileLedger {
    /// Ledger at `path`. Nothing is touched until the first call.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Ledger location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write an empty ledger if none exists yet.
    ///
    /// # Errors
    ///
    /// [`LedgerError::Io`] if the file cannot be created.
    pub fn initialize(&self) -> Result<(), LedgerError> {
        let _guard = self.write_lock.lock();
        if self.path.exists() {
            return Ok(());
        }
        let mut doc = Map::new();
        doc.insert(LEDGER_KEY.to_string(), Value::Array(Vec::new()));
        self.write_document(&doc)
    }

    fn io_err(&self, source: std::io::Error) -> LedgerError {
        LedgerError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }

    fn malformed(&self, reason: impl Into<String>) -> LedgerError {
        LedgerError::Malformed {
            path: self.path.display().to_string(),
            reason: reason.into(),
        }
    }

    /// Read the document, or an empty one if the file does not exist.
    fn read_document(&self) -> Result<Map<String, Value>, LedgerError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut doc = Map::new();
                doc.insert(LEDGER_KEY.to_string(), Value::Array(Vec::new()));
                return Ok(doc);
            }
            Err(e) => return Err(self.io_err(e)),
        };
        let doc = match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(doc)) => doc,
            Ok(_) => return Err(self.malformed("top level is not an object")),
            Err(e) => return Err(self.malformed(e.to_string())),
        };
        match doc.get(LEDGER_KEY) {
            Some(Value::Array(_)) => Ok(doc),
            _ => Err(self.malformed(format!("missing `{LEDGER_KEY}` array"))),
        }
    }

    fn write_document(&self, doc: &Map<String, Value>) -> Result<(), LedgerError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }
        let body = serde_json::to_string_pretty(doc).map_err(|e| self.malformed(e.to_string()))?;
        let mut tmp_name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        tmp_name.push(".tmp");
        let tmp = self.path.with_file_name(tmp_name);
        fs::write(&tmp, body).map_err(|e| self.io_err(e))?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            self.io_err(e)
        })
    }
}

impl ImprovementLedger for JsonFileLedger {
    fn append(&self, entries: &[LedgerEntry]) -> Result<(), LedgerError> {
        if entries.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock();
        let mut doc = self.read_document()?;
        let new_values = entries
            .iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| self.malformed(e.to_string()))?;
        match doc.get_mut(LEDGER_KEY) {
            Some(Value::Array(items)) => items.extend(new_values),
            _ => return Err(self.malformed(format!("missing `{LEDGER_KEY}` array"))),
        }
        self.write_document(&doc)?;
        debug!(path = %self.path.display(), appended = entries.len(), "ledger updated");
        Ok(())
    }

    fn entries(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        let doc = self.read_document()?;
        let Some(Value::Array(items)) = doc.get(LEDGER_KEY) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            match serde_json::from_value::<LedgerEntry>(item.clone()) {
                Ok(entry) => out.push(entry),
                Err(e) => warn!(path = %self.path.display(), index = i, error = %e, "skipping unreadable ledger entry"),
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(file: &str, kind: ProposalKind, secs: i64) -> LedgerEntry {
        LedgerEntry {
            proposal: ImprovementProposal {
                file_path: file.into(),
                operation_kind: kind,
                reason: "r".into(),
                guidance: "g".into(),
            },
            recorded_at: Utc.timestamp_opt(secs, 0).single().expect("test: valid timestamp"),
        }
    }

    #[test]
    fn test_initialize_writes_empty_ledger() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let ledger = JsonFileLedger::new(dir.path().join("state/ledger.json"));
        ledger.initialize().unwrap();
        let raw = fs::read_to_string(ledger.path()).unwrap();
        let v: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(v, serde_json::json!({"improvements": []}));
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let ledger = JsonFileLedger::new(dir.path().join("ledger.json"));
        ledger.append(&[entry("a.py", ProposalKind::Refactor, 10)]).unwrap();
        ledger.append(&[entry("b.py", ProposalKind::Enhance, 20)]).unwrap();

        let all = ledger.entries().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].proposal.file_path, "a.py");
        assert_eq!(all[1].proposal.operation_kind, ProposalKind::Enhance);
        assert!(!dir.path().join("ledger.json.tmp").exists());
    }

    #[test]
    fn test_foreign_content_preserved() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let path = dir.path().join("ledger.json");
        fs::write(
            &path,
            r#"{"version": 2, "improvements": [{"legacy": true}]}"#,
        )
        .unwrap();
        let ledger = JsonFileLedger::new(&path);
        ledger.append(&[entry("a.py", ProposalKind::Refactor, 1)]).unwrap();

        let v: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(v["version"], 2);
        assert_eq!(v["improvements"].as_array().unwrap().len(), 2);
        assert_eq!(v["improvements"][0], serde_json::json!({"legacy": true}));
        // The legacy entry is skipped, not fatal.
        assert_eq!(ledger.entries().unwrap().len(), 1);
    }

    #[test]
    fn test_malformed_ledger_is_an_error() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let path = dir.path().join("ledger.json");
        fs::write(&path, r#"{"other": []}"#).unwrap();
        let ledger = JsonFileLedger::new(&path);
        assert!(matches!(
            ledger.append(&[entry("a.py", ProposalKind::Refactor, 1)]),
            Err(LedgerError::Malformed { .. })
        ));
        assert_eq!(fs::read_to_string(&path).unwrap(), r#"{"other": []}"#);
    }

    #[test]
    fn test_last_recorded_filters_by_file_and_kind() {
        let ledger = InMemoryLedger::new();
        ledger
            .append(&[
                entry("a.py", ProposalKind::Refactor, 10),
                entry("a.py", ProposalKind::Refactor, 30),
                entry("a.py", ProposalKind::Enhance, 50),
                entry("b.py", ProposalKind::Refactor, 70),
            ])
            .unwrap();
        let last = ledger.last_recorded("a.py", ProposalKind::Refactor).unwrap();
        assert_eq!(last.map(|t| t.timestamp()), Some(30));
        assert_eq!(ledger.last_recorded("c.py", ProposalKind::Refactor).unwrap(), None);
    }
}
