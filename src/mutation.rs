//! # File Mutation Engine
//!
//! Applies a validated [`PatchPlan`] to a project tree, one operation at a
//! time, against the live filesystem.
//!
//! ## Guarantees
//! - Operations run strictly in plan order; later ones see earlier writes.
//! - An existing file is copied to `<name><suffix>` before its first
//!   mutation in a run, and before it is read. No backup, no write.
//! - A failed operation never aborts the run; it is recorded and the next
//!   operation proceeds.
//! - Backups are never deleted here, and no operation may write to one.
//! - Paths are compared in normal form: `a.py` and `./a.py` are one file.
//!
//! ## NOT Responsible For
//! - Deciding whether the result is acceptable (that belongs to `validation`)
//! - Serializing concurrent runs over the same files (the orchestrator does)

use std::{
    collections::{HashMap, HashSet},
    fmt, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::plan::{normalize_relative, OperationKind, PatchOperation, PatchPlan};

/// Suffix appended to a file name to form its backup's name.
pub const DEFAULT_BACKUP_SUFFIX: &str = ".bak";

// ─── Error ────────────────────────────────────────────────────────────────────

/// Conditions fatal to a whole mutation run.
#[derive(Debug, Error)]
pub enum MutationError {
    /// The project root is missing, not a directory, or unreadable.
    #[error("project root {path} is not usable: {reason}")]
    RootInaccessible {
        /// The configured root.
        path: String,
        /// Why it was rejected.
        reason: String,
    },
}

// ─── Report types ─────────────────────────────────────────────────────────────

/// Overall outcome of a mutation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationStatus {
    /// Every operation applied.
    Success,
    /// Some operations applied and some failed; the tree is in a mixed state.
    Partial,
    /// The plan was empty or nothing applied.
    Failed,
}

/// A pre-mutation copy of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBackup {
    /// The file that was about to be overwritten.
    pub original_path: PathBuf,
    /// Where its previous content now lives.
    pub backup_path: PathBuf,
}

/// An operation that was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedOperation {
    /// Index in the plan.
    pub index: usize,
    /// Target path, relative to the project root.
    pub file: String,
    /// Kind of operation.
    pub kind: OperationKind,
    /// Backup holding the file's content from before this run, if it existed.
    pub backup_path: Option<PathBuf>,
    /// `true` if the file did not exist before this run.
    pub created: bool,
}

/// Why a single operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// The block to replace or delete does not occur in the file.
    BlockNotFound,
    /// The block occurs more than once.
    AmbiguousBlock,
    /// `DeleteBlock` on a file that does not exist.
    FileNotFound,
    /// The backup copy could not be written, so the file was not touched.
    BackupFailed,
    /// Reading or writing the file failed.
    Io,
    /// The path is absolute or leaves the project root.
    UnsafePath,
    /// The path names a backup file.
    BackupTarget,
}

impl FailureKind {
    fn label(self) -> &'static str {
        match self {
            Self::BlockNotFound => "block not found",
            Self::AmbiguousBlock => "ambiguous block",
            Self::FileNotFound => "file not found",
            Self::BackupFailed => "backup failed",
            Self::Io => "i/o error",
            Self::UnsafePath => "unsafe path",
            Self::BackupTarget => "backup file targeted",
        }
    }
}

/// A recoverable per-operation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationFailure {
    /// Index in the plan.
    pub index: usize,
    /// Target path, relative to the project root.
    pub file_path: String,
    /// Failure category.
    pub kind: FailureKind,
    /// Raw diagnostic.
    pub detail: String,
}

impl fmt::Display for OperationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "operation {} on {}: {}: {}",
            self.index,
            self.file_path,
            self.kind.label(),
            self.detail
        )
    }
}

/// Immutable record of one mutation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationReport {
    /// Overall outcome.
    pub status: MutationStatus,
    /// Applied operations, in plan order.
    pub applied: Vec<AppliedOperation>,
    /// Failed operations, in plan order.
    pub errors: Vec<OperationFailure>,
    /// Every backup written during the run.
    pub backups: Vec<FileBackup>,
}

impl MutationReport {
    /// Files with at least one applied operation, first-seen order.
    pub fn touched_files(&self) -> Vec<String> {
        dedup(self.applied.iter().map(|a| a.file.as_str()))
    }

    /// Files with at least one failed operation, first-seen order.
    pub fn failed_files(&self) -> Vec<String> {
        dedup(self.errors.iter().map(|e| e.file_path.as_str()))
    }

    /// Files that may be validated: touched, and with no failed operation.
    pub fn validation_targets(&self) -> Vec<String> {
        let failed = self.failed_files();
        self.touched_files()
            .into_iter()
            .filter(|f| !failed.contains(f))
            .collect()
    }

    /// Errors rendered as strings.
    pub fn error_messages(&self) -> Vec<String> {
        self.errors.iter().map(ToString::to_string).collect()
    }
}

fn dedup<'a>(items: impl Iterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in items {
        if !out.iter().any(|o| o == item) {
            out.push(item.to_string());
        }
    }
    out
}

fn classify(applied: usize, failed: usize) -> MutationStatus {
    match (applied, failed) {
        (0, _) => MutationStatus::Failed,
        (_, 0) => MutationStatus::Success,
        _ => MutationStatus::Partial,
    }
}

/// What [`MutationEngine::rollback`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    /// Files restored from their backups.
    pub restored: Vec<PathBuf>,
    /// Files created by the run and now removed.
    pub removed: Vec<PathBuf>,
    /// Restore or removal failures.
    pub errors: Vec<String>,
}

// ─── Engine ───────────────────────────────────────────────────────────────────

/// Configuration for [`MutationEngine`].
#[derive(Debug, Clone)]
pub struct MutationConfig {
    /// Directory all plan paths are relative to.
    pub project_root: PathBuf,
    /// Appended to a file name to name its backup.
    pub backup_suffix: String,
}

impl MutationConfig {
    /// Config for `project_root` with the default backup suffix.
    pub fn new(project_root: impl Into<PathBuf>) -> Self {
        Self {
            project_root: project_root.into(),
            backup_suffix: DEFAULT_BACKUP_SUFFIX.to_string(),
        }
    }
}

/// Per-run bookkeeping.
#[derive(Default)]
struct RunState {
    backups: HashMap<String, PathBuf>,
    created: HashSet<String>,
    written_backups: Vec<FileBackup>,
}

type OpResult = Result<AppliedOperation, (FailureKind, String)>;

/// Applies patch plans to a project tree.
#[derive(Debug, Clone)]
pub struct MutationEngine {
    cfg: MutationConfig,
}

impl MutationEngine {
    /// Create an engine.
    pub fn new(cfg: MutationConfig) -> Self {
        Self { cfg }
    }

    /// The configured project root.
    pub fn project_root(&self) -> &Path {
        &self.cfg.project_root
    }

    /// Backup path used for `path`.
    pub fn backup_path_for(&self, path: &Path) -> PathBuf {
        let mut name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(&self.cfg.backup_suffix);
        path.with_file_name(name)
    }

    /// Apply every operation of `plan` in order.
    ///
    /// # Errors
    ///
    /// [`MutationError::RootInaccessible`] if the project root cannot be
    /// used. Every other failure is recorded in the report.
    pub fn apply(&self, plan: &PatchPlan) -> Result<MutationReport, MutationError> {
        self.check_root()?;

        if plan.is_empty() {
            warn!("patch plan has no operations");
            return Ok(MutationReport {
                status: MutationStatus::Failed,
                applied: Vec::new(),
                errors: Vec::new(),
                backups: Vec::new(),
            });
        }

        let mut state = RunState::default();
        let mut applied = Vec::new();
        let mut errors = Vec::new();

        for (index, op) in plan.operations.iter().enumerate() {
            match self.apply_one(index, op, &mut state) {
                Ok(done) => {
                    info!(
                        index,
                        file = %done.file,
                        kind = done.kind.as_str(),
                        created = done.created,
                        "operation applied"
                    );
                    applied.push(done);
                }
                Err((kind, detail)) => {
                    let failure = OperationFailure {
                        index,
                        file_path: normalize_relative(op.file_path())
                            .unwrap_or_else(|| op.file_path().to_string()),
                        kind,
                        detail,
                    };
                    warn!(%failure, "operation failed");
                    errors.push(failure);
                }
            }
        }

        let status = classify(applied.len(), errors.len());
        info!(
            ?status,
            applied = applied.len(),
            failed = errors.len(),
            backups = state.written_backups.len(),
            "mutation run finished"
        );

        Ok(MutationReport {
            status,
            applied,
            errors,
            backups: state.written_backups,
        })
    }

    /// Undo a run: restore backed-up files and remove files it created.
    ///
    /// Backups are left in place.
    pub fn rollback(&self, report: &MutationReport) -> RollbackReport {
        let mut out = RollbackReport::default();

        // Newest first, so a chain of backups unwinds to the oldest content.
        for backup in report.backups.iter().rev() {
            match fs::copy(&backup.backup_path, &backup.original_path) {
                Ok(_) => out.restored.push(backup.original_path.clone()),
                Err(e) => out.errors.push(format!(
                    "restore {} from {}: {e}",
                    backup.original_path.display(),
                    backup.backup_path.display()
                )),
            }
        }

        let created = dedup(
            report
                .applied
                .iter()
                .filter(|a| a.created)
                .map(|a| a.file.as_str()),
        );
        for file in created {
            let path = self.cfg.project_root.join(&file);
            match fs::remove_file(&path) {
                Ok(()) => out.removed.push(path),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => out.errors.push(format!("remove {}: {e}", path.display())),
            }
        }

        info!(
            restored = out.restored.len(),
            removed = out.removed.len(),
            errors = out.errors.len(),
            "rollback finished"
        );
        out
    }

    // ── Private ───────────────────────────────────────────────────────────

    fn check_root(&self) -> Result<(), MutationError> {
        let root = &self.cfg.project_root;
        let inaccessible = |reason: String| MutationError::RootInaccessible {
            path: root.display().to_string(),
            reason,
        };
        let meta = fs::metadata(root).map_err(|e| inaccessible(e.to_string()))?;
        if !meta.is_dir() {
            return Err(inaccessible("not a directory".to_string()));
        }
        fs::read_dir(root).map_err(|e| inaccessible(e.to_string()))?;
        Ok(())
    }

    fn apply_one(&self, index: usize, op: &PatchOperation, state: &mut RunState) -> OpResult {
        let rel = normalize_relative(op.file_path()).ok_or_else(|| {
            (
                FailureKind::UnsafePath,
                format!("{:?} is not a relative path inside the project", op.file_path()),
            )
        })?;
        let rel = rel.as_str();
        let path = self.cfg.project_root.join(rel);
        if self.is_backup_path(&path, state) {
            return Err((
                FailureKind::BackupTarget,
                format!("{rel} is a backup file and cannot be patched"),
            ));
        }
        let applied = |backup_path: Option<PathBuf>, created: bool| AppliedOperation {
            index,
            file: rel.to_string(),
            kind: op.kind(),
            backup_path,
            created,
        };

        if path.exists() && !path.is_file() {
            return Err((FailureKind::Io, "target is not a regular file".to_string()));
        }

        if !path.exists() {
            return match op {
                PatchOperation::Insert { content, .. } | PatchOperation::Replace { content, .. } => {
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)
                            .map_err(|e| (FailureKind::Io, format!("create directories: {e}")))?;
                    }
                    write_atomic(&path, content).map_err(|e| (FailureKind::Io, e))?;
                    state.created.insert(rel.to_string());
                    Ok(applied(None, true))
                }
                PatchOperation::DeleteBlock { .. } => Err((
                    FailureKind::FileNotFound,
                    format!("{} does not exist", path.display()),
                )),
            };
        }

        let backup_path = self.ensure_backup(rel, &path, state)?;
        let current = fs::read_to_string(&path)
            .map_err(|e| (FailureKind::Io, format!("read {}: {e}", path.display())))?;

        let updated = match op {
            PatchOperation::Insert { content, .. } => append(current, content),
            PatchOperation::Replace {
                content,
                block_to_replace: None,
                ..
            } => content.clone(),
            PatchOperation::Replace {
                content,
                block_to_replace: Some(block),
                ..
            } => replace_exactly_once(&current, block, content)?,
            PatchOperation::DeleteBlock {
                block_to_delete, ..
            } => replace_exactly_once(&current, block_to_delete, "")?,
        };

        write_atomic(&path, &updated).map_err(|e| (FailureKind::Io, e))?;
        let created = state.created.contains(rel);
        Ok(applied(backup_path, created))
    }

    /// `true` if `path` is a backup written in this run or carries the
    /// backup suffix.
    fn is_backup_path(&self, path: &Path, state: &RunState) -> bool {
        let suffix = &self.cfg.backup_suffix;
        let has_suffix = !suffix.is_empty()
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(suffix.as_str()));
        has_suffix || state.backups.values().any(|b| b == path)
    }

    /// Back up `path` the first time it is touched in this run.
    ///
    /// Files created earlier in the same run get no backup.
    fn ensure_backup(
        &self,
        rel: &str,
        path: &Path,
        state: &mut RunState,
    ) -> Result<Option<PathBuf>, (FailureKind, String)> {
        if let Some(existing) = state.backups.get(rel) {
            return Ok(Some(existing.clone()));
        }
        if state.created.contains(rel) {
            return Ok(None);
        }

        let backup_path = self.backup_path_for(path);
        fs::copy(path, &backup_path).map_err(|e| {
            (
                FailureKind::BackupFailed,
                format!("copy to {}: {e}", backup_path.display()),
            )
        })?;
        debug!(file = rel, backup = %backup_path.display(), "backup written");

        state.backups.insert(rel.to_string(), backup_path.clone());
        state.written_backups.push(FileBackup {
            original_path: path.to_path_buf(),
            backup_path: backup_path.clone(),
        });
        Ok(Some(backup_path))
    }
}

/// Apply `plan` under `project_root` with default settings.
///
/// # Errors
///
/// See [`MutationEngine::apply`].
pub fn apply_plan(
    plan: &PatchPlan,
    project_root: impl Into<PathBuf>,
) -> Result<MutationReport, MutationError> {
    MutationEngine::new(MutationConfig::new(project_root)).apply(plan)
}

// ─── Text edits ───────────────────────────────────────────────────────────────

fn append(mut current: String, content: &str) -> String {
    if !current.is_empty() && !current.ends_with('\n') {
        current.push('\n');
    }
    current.push_str(content);
    current
}

fn replace_exactly_once(
    haystack: &str,
    block: &str,
    replacement: &str,
) -> Result<String, (FailureKind, String)> {
    if block.is_empty() {
        return Err((FailureKind::BlockNotFound, "block is empty".to_string()));
    }
    match count_occurrences(haystack, block) {
        0 => Err((
            FailureKind::BlockNotFound,
            format!("block not present: {:?}", preview(block)),
        )),
        1 => Ok(haystack.replacen(block, replacement, 1)),
        n => Err((
            FailureKind::AmbiguousBlock,
            format!("block occurs {n} times: {:?}", preview(block)),
        )),
    }
}

/// Occurrences of `needle`, overlapping ones included.
fn count_occurrences(haystack: &str, needle: &str) -> usize {
    let step = needle.chars().next().map_or(1, char::len_utf8);
    let mut count = 0;
    let mut start = 0;
    while let Some(pos) = haystack[start..].find(needle) {
        count += 1;
        start += pos + step;
    }
    count
}

fn preview(block: &str) -> String {
    const MAX: usize = 80;
    if block.chars().count() <= MAX {
        block.to_string()
    } else {
        let head: String = block.chars().take(MAX).collect();
        format!("{head}…")
    }
}

/// Write through a sibling temp file and rename over the target.
fn write_atomic(path: &Path, content: &str) -> Result<(), String> {
    let mut tmp_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    tmp_name.push(".patch-tmp");
    let tmp = path.with_file_name(tmp_name);

    if let Err(e) = fs::write(&tmp, content) {
        let _ = fs::remove_file(&tmp);
        return Err(format!("write {}: {e}", tmp.display()));
    }
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        format!("rename onto {}: {e}", path.display())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(root: &Path) -> MutationEngine {
        MutationEngine::new(MutationConfig::new(root))
    }

    fn plan(ops: Vec<PatchOperation>) -> PatchPlan {
        PatchPlan {
            analysis: "test".into(),
            operations: ops,
        }
    }

    fn replace_whole(file: &str, content: &str) -> PatchOperation {
        PatchOperation::Replace {
            file_path: file.into(),
            content: content.into(),
            block_to_replace: None,
        }
    }

    fn delete(file: &str, block: &str) -> PatchOperation {
        PatchOperation::DeleteBlock {
            file_path: file.into(),
            block_to_delete: block.into(),
        }
    }

    #[test]
    fn test_replace_null_creates_file_without_backup() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let report = engine(dir.path())
            .apply(&plan(vec![replace_whole("a.py", "x=1")]))
            .unwrap();

        assert_eq!(report.status, MutationStatus::Success);
        assert_eq!(fs::read_to_string(dir.path().join("a.py")).unwrap(), "x=1");
        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.applied[0].backup_path, None);
        assert!(report.applied[0].created);
        assert!(report.backups.is_empty());
    }

    #[test]
    fn test_insert_creates_parent_directories() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let report = engine(dir.path())
            .apply(&plan(vec![PatchOperation::Insert {
                file_path: "src/deep/mod.rs".into(),
                content: "pub fn f() {}\n".into(),
            }]))
            .unwrap();
        assert_eq!(report.status, MutationStatus::Success);
        assert!(dir.path().join("src/deep/mod.rs").is_file());
    }

    #[test]
    fn test_insert_appends_to_existing_file() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        fs::write(dir.path().join("a.txt"), "one").unwrap();
        engine(dir.path())
            .apply(&plan(vec![PatchOperation::Insert {
                file_path: "a.txt".into(),
                content: "two\n".into(),
            }]))
            .unwrap();
        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn test_block_replace_exact_single_match() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        fs::write(dir.path().join("a.rs"), "fn a() {}\nfn b() {}\n").unwrap();
        let report = engine(dir.path())
            .apply(&plan(vec![PatchOperation::Replace {
                file_path: "a.rs".into(),
                content: "fn b() { todo() }".into(),
                block_to_replace: Some("fn b() {}".into()),
            }]))
            .unwrap();
        assert_eq!(report.status, MutationStatus::Success);
        assert_eq!(
            fs::read_to_string(dir.path().join("a.rs")).unwrap(),
            "fn a() {}\nfn b() { todo() }\n"
        );
    }

    #[test]
    fn test_ambiguous_block_is_a_recoverable_error() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        fs::write(dir.path().join("a.rs"), "x\nx\n").unwrap();
        let report = engine(dir.path())
            .apply(&plan(vec![delete("a.rs", "x")]))
            .unwrap();
        assert_eq!(report.status, MutationStatus::Failed);
        assert_eq!(report.errors[0].kind, FailureKind::AmbiguousBlock);
        assert_eq!(fs::read_to_string(dir.path().join("a.rs")).unwrap(), "x\nx\n");
    }

    #[test]
    fn test_delete_on_missing_file_fails() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let report = engine(dir.path())
            .apply(&plan(vec![delete("nope.rs", "x")]))
            .unwrap();
        assert_eq!(report.errors[0].kind, FailureKind::FileNotFound);
        assert!(!dir.path().join("nope.rs").exists());
    }

    #[test]
    fn test_later_operations_see_earlier_writes() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        fs::write(dir.path().join("m.py"), "old\n").unwrap();
        let report = engine(dir.path())
            .apply(&plan(vec![
                replace_whole("m.py", "keep\nremove_me\n"),
                delete("m.py", "remove_me\n"),
            ]))
            .unwrap();
        assert_eq!(report.status, MutationStatus::Success);
        assert_eq!(fs::read_to_string(dir.path().join("m.py")).unwrap(), "keep\n");
    }

    #[test]
    fn test_backup_holds_pre_run_content_once_per_file() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        fs::write(dir.path().join("m.py"), "original").unwrap();
        let eng = engine(dir.path());
        let report = eng
            .apply(&plan(vec![
                replace_whole("m.py", "first"),
                replace_whole("m.py", "second"),
            ]))
            .unwrap();

        assert_eq!(report.backups.len(), 1);
        let backup = eng.backup_path_for(&dir.path().join("m.py"));
        assert_eq!(report.backups[0].backup_path, backup);
        assert_eq!(fs::read_to_string(&backup).unwrap(), "original");
        assert_eq!(report.applied[1].backup_path.as_ref(), Some(&backup));
    }

    #[test]
    fn test_partial_classification() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        fs::write(dir.path().join("b.py"), "content\n").unwrap();
        let report = engine(dir.path())
            .apply(&plan(vec![
                replace_whole("a.py", "x=1"),
                delete("b.py", "absent"),
            ]))
            .unwrap();
        assert_eq!(report.status, MutationStatus::Partial);
        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].kind, FailureKind::BlockNotFound);
        assert_eq!(report.validation_targets(), vec!["a.py".to_string()]);
        assert_eq!(report.failed_files(), vec!["b.py".to_string()]);
    }

    #[test]
    fn test_empty_plan_is_failed() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let report = engine(dir.path()).apply(&PatchPlan::default()).unwrap();
        assert_eq!(report.status, MutationStatus::Failed);
        assert!(report.applied.is_empty() && report.errors.is_empty());
    }

    #[test]
    fn test_missing_root_is_fatal() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let err = engine(&dir.path().join("missing"))
            .apply(&plan(vec![replace_whole("a.py", "x")]))
            .unwrap_err();
        assert!(matches!(err, MutationError::RootInaccessible { .. }));
    }

    #[test]
    fn test_backup_failure_skips_only_that_file() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        fs::write(dir.path().join("a.py"), "a").unwrap();
        fs::write(dir.path().join("b.py"), "b").unwrap();
        // A directory squatting on the backup name makes the copy fail.
        fs::create_dir(dir.path().join("a.py.bak")).unwrap();

        let report = engine(dir.path())
            .apply(&plan(vec![
                replace_whole("a.py", "A"),
                replace_whole("b.py", "B"),
            ]))
            .unwrap();

        assert_eq!(report.status, MutationStatus::Partial);
        assert_eq!(report.errors[0].kind, FailureKind::BackupFailed);
        assert_eq!(fs::read_to_string(dir.path().join("a.py")).unwrap(), "a");
        assert_eq!(fs::read_to_string(dir.path().join("b.py")).unwrap(), "B");
    }

    #[test]
    fn test_rollback_restores_and_removes() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        fs::write(dir.path().join("old.py"), "before").unwrap();
        let eng = engine(dir.path());
        let report = eng
            .apply(&plan(vec![
                replace_whole("old.py", "after"),
                replace_whole("new.py", "fresh"),
            ]))
            .unwrap();

        let rb = eng.rollback(&report);
        assert!(rb.errors.is_empty(), "{:?}", rb.errors);
        assert_eq!(fs::read_to_string(dir.path().join("old.py")).unwrap(), "before");
        assert!(!dir.path().join("new.py").exists());
        assert!(dir.path().join("old.py.bak").exists());
    }

    #[test]
    fn test_one_file_under_two_spellings_is_backed_up_once() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        fs::write(dir.path().join("a.py"), "ORIGINAL\n").unwrap();
        let eng = engine(dir.path());
        let report = eng
            .apply(&plan(vec![
                replace_whole("a.py", "FIRST\n"),
                replace_whole("./a.py", "SECOND\n"),
            ]))
            .unwrap();

        assert_eq!(report.status, MutationStatus::Success);
        assert_eq!(report.backups.len(), 1);
        assert_eq!(report.touched_files(), vec!["a.py".to_string()]);
        assert_eq!(
            fs::read_to_string(dir.path().join("a.py.bak")).unwrap(),
            "ORIGINAL\n"
        );

        eng.rollback(&report);
        assert_eq!(fs::read_to_string(dir.path().join("a.py")).unwrap(), "ORIGINAL\n");
    }

    #[test]
    fn test_backup_files_cannot_be_patched() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        fs::write(dir.path().join("a.py"), "ORIGINAL\n").unwrap();
        let eng = engine(dir.path());
        let report = eng
            .apply(&plan(vec![
                replace_whole("a.py", "FIRST\n"),
                replace_whole("a.py.bak", "X"),
                replace_whole("./a.py.bak", "X"),
            ]))
            .unwrap();

        assert_eq!(report.status, MutationStatus::Partial);
        assert_eq!(report.errors.len(), 2);
        assert!(report.errors.iter().all(|e| e.kind == FailureKind::BackupTarget));
        assert_eq!(report.backups.len(), 1);
        assert_eq!(
            fs::read_to_string(dir.path().join("a.py.bak")).unwrap(),
            "ORIGINAL\n"
        );

        eng.rollback(&report);
        assert_eq!(fs::read_to_string(dir.path().join("a.py")).unwrap(), "ORIGINAL\n");
    }

    #[test]
    fn test_rollback_unwinds_newest_backup_first() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let file = dir.path().join("a.py");
        let bak = dir.path().join("a.py.bak");
        let bak_bak = dir.path().join("a.py.bak.bak");
        fs::write(&file, "SECOND").unwrap();
        fs::write(&bak, "X").unwrap();
        fs::write(&bak_bak, "ORIGINAL").unwrap();
        let report = MutationReport {
            status: MutationStatus::Success,
            applied: Vec::new(),
            errors: Vec::new(),
            backups: vec![
                FileBackup {
                    original_path: file.clone(),
                    backup_path: bak.clone(),
                },
                FileBackup {
                    original_path: bak.clone(),
                    backup_path: bak_bak,
                },
            ],
        };

        let rb = engine(dir.path()).rollback(&report);
        assert!(rb.errors.is_empty(), "{:?}", rb.errors);
        assert_eq!(rb.restored, vec![bak, file.clone()]);
        assert_eq!(fs::read_to_string(&file).unwrap(), "ORIGINAL");
    }

    #[test]
    fn test_overlapping_block_is_ambiguous() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        fs::write(dir.path().join("a.txt"), "aaa").unwrap();
        let report = engine(dir.path())
            .apply(&plan(vec![delete("a.txt", "aa")]))
            .unwrap();
        assert_eq!(report.errors[0].kind, FailureKind::AmbiguousBlock);
        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "aaa");
    }

    #[test]
    fn test_count_occurrences_includes_overlaps() {
        assert_eq!(count_occurrences("aaa", "aa"), 2);
        assert_eq!(count_occurrences("ééé", "éé"), 2);
        assert_eq!(count_occurrences("abcabc", "abc"), 2);
        assert_eq!(count_occurrences("abc", "x"), 0);
    }

    #[test]
    fn test_unsafe_path_in_hand_built_plan_fails() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let report = engine(dir.path())
            .apply(&plan(vec![replace_whole("../escape.py", "x")]))
            .unwrap();
        assert_eq!(report.status, MutationStatus::Failed);
        assert_eq!(report.errors[0].kind, FailureKind::UnsafePath);
    }

    #[test]
    fn test_failure_display_carries_index_and_path() {
        let f = OperationFailure {
            index: 3,
            file_path: "x.rs".into(),
            kind: FailureKind::BlockNotFound,
            detail: "block not present".into(),
        };
        let s = f.to_string();
        assert!(s.contains("operation 3") && s.contains("x.rs"));
    }

    #[test]
    fn test_no_temp_files_left_behind() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        engine(dir.path())
            .apply(&plan(vec![replace_whole("a.py", "x")]))
            .unwrap();
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.py".to_string()]);
    }
}
