//! # Syntax Checkers
//!
//! One checker per file extension. In-process checkers cover structured
//! data and brace-delimited languages; anything else is delegated to a
//! configured compile-only command.
//!
//! ## Graceful degradation
//! A checker that cannot run (missing interpreter, timeout) yields
//! [`SyntaxOutcome::Unchecked`] rather than a failure. Only a definite
//! syntax error rejects a file.

use std::{
    collections::{BTreeMap, HashMap},
    path::Path,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::ValidationError;

/// Placeholder replaced by the checked file's path in command arguments.
pub const FILE_PLACEHOLDER: &str = "{file}";

/// Characters of process output kept in a failure message.
const OUTPUT_EXCERPT_CHARS: usize = 500;

// ─── Outcome ──────────────────────────────────────────────────────────────────

/// Result of checking one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum SyntaxOutcome {
    /// The file parsed.
    Passed,
    /// The file has a syntax error.
    Failed(String),
    /// No verdict could be reached.
    Unchecked(String),
}

impl SyntaxOutcome {
    /// `true` unless the file definitely failed.
    pub fn is_ok(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

// ─── Checker trait ────────────────────────────────────────────────────────────

/// A syntax check for one family of files.
#[async_trait]
pub trait SyntaxChecker: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Check `source`, which was read from `path`.
    async fn check(&self, path: &Path, source: &str) -> SyntaxOutcome;
}

/// Strict JSON parse.
pub struct JsonChecker;

#[async_trait]
impl SyntaxChecker for JsonChecker {
    fn name(&self) -> &str {
        "json"
    }

    async fn check(&self, _path: &Path, source: &str) -> SyntaxOutcome {
        match serde_json::from_str::<serde_json::Value>(source) {
            Ok(_) => SyntaxOutcome::Passed,
            Err(e) => SyntaxOutcome::Failed(e.to_string()),
        }
    }
}

/// Strict TOML parse.
pub struct TomlChecker;

#[async_trait]
impl SyntaxChecker for TomlChecker {
    fn name(&self) -> &str {
        "toml"
    }

    async fn check(&self, _path: &Path, source: &str) -> SyntaxOutcome {
        match source.parse::<toml::Table>() {
            Ok(_) => SyntaxOutcome::Passed,
            Err(e) => SyntaxOutcome::Failed(e.to_string().trim_end().to_string()),
        }
    }
}

// ─── Delimiter balance ────────────────────────────────────────────────────────

/// Lexical flavour of a brace-delimited language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// `'x'` char literals, `'a` lifetimes, `r#"..."#` raw strings.
    Rust,
    /// `'x'` char literals.
    CLike,
    /// `'...'` strings and `` `...` `` template literals.
    JavaScript,
    /// `'x'` runes and `` `...` `` raw strings.
    Go,
}

impl Dialect {
    /// Dialect for a file extension, if it is a brace language.
    pub fn for_extension(ext: &str) -> Option<Self> {
        match ext {
            "rs" => Some(Self::Rust),
            "c" | "h" | "cpp" | "hpp" | "cc" | "java" => Some(Self::CLike),
            "js" | "jsx" | "ts" | "tsx" | "mjs" => Some(Self::JavaScript),
            "go" => Some(Self::Go),
            _ => None,
        }
    }
}

/// Checks that `()[]{}` nest correctly outside strings and comments.
pub struct DelimiterChecker {
    dialect: Dialect,
}

impl DelimiterChecker {
    /// Checker for `dialect`.
    pub fn new(dialect: Dialect) -> Self {
        Self { dialect }
    }

    /// Scan `source`; `Err` describes the first imbalance.
    pub fn scan(&self, source: &str) -> Result<(), String> {
        let chars: Vec<char> = source.chars().collect();
        let mut stack: Vec<(char, usize)> = Vec::new();
        let mut line = 1usize;
        let mut i = 0usize;

        while i < chars.len() {
            let c = chars[i];
            let next = chars.get(i + 1).copied();
            match c {
                '\n' => {
                    line += 1;
                    i += 1;
                }
                '/' if next == Some('/') => {
                    while i < chars.len() && chars[i] != '\n' {
                        i += 1;
                    }
                }
                '/' if next == Some('*') => {
                    let start = line;
                    i += 2;
                    loop {
                        match chars.get(i) {
                            None => return Err(format!("line {start}: unterminated block comment")),
                            Some('*') if chars.get(i + 1) == Some(&'/') => {
                                i += 2;
                                break;
                            }
                            Some('\n') => {
                                line += 1;
                                i += 1;
                            }
                            Some(_) => i += 1,
                        }
                    }
                }
                'r' if self.dialect == Dialect::Rust && starts_raw_string(&chars, i) => {
                    let start = line;
                    i = skip_raw_string(&chars, i, &mut line)
                        .ok_or_else(|| format!("line {start}: unterminated raw string"))?;
                }
                '"' => {
                    let start = line;
                    i = skip_quoted(&chars, i, '"', &mut line)
                        .ok_or_else(|| format!("line {start}: unterminated string"))?;
                }
                '`' if matches!(self.dialect, Dialect::JavaScript | Dialect::Go) => {
                    let start = line;
                    i = skip_quoted(&chars, i, '`', &mut line)
                        .ok_or_else(|| format!("line {start}: unterminated template string"))?;
                }
                '\'' if self.dialect == Dialect::JavaScript => {
                    let start = line;
                    i = skip_quoted(&chars, i, '\'', &mut line)
                        .ok_or_else(|| format!("line {start}: unterminated string"))?;
                }
                '\'' => i = skip_char_literal(&chars, i),
                '(' | '[' | '{' => {
                    stack.push((c, line));
                    i += 1;
                }
                ')' | ']' | '}' => {
                    let want = opener_for(c);
                    match stack.pop() {
                        Some((open, _)) if open == want => {}
                        Some((open, opened)) => {
                            return Err(format!(
                                "line {line}: found `{c}` but `{open}` opened on line {opened} is still open"
                            ))
                        }
                        None => return Err(format!("line {line}: unmatched `{c}`")),
                    }
                    i += 1;
                }
                _ => i += 1,
            }
        }

        match stack.last() {
            Some((open, opened)) => Err(format!("line {opened}: `{open}` is never closed")),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SyntaxChecker for DelimiterChecker {
    fn name(&self) -> &str {
        "delimiters"
    }

    async fn check(&self, _path: &Path, source: &str) -> SyntaxOutcome {
        match self.scan(source) {
            Ok(()) => SyntaxOutcome::Passed,
            Err(e) => SyntaxOutcome::Failed(e),
        }
    }
}

fn opener_for(closer: char) -> char {
    match closer {
        ')' => '(',
        ']' => '[',
        _ => '{',
    }
}

/// Index just past the closing `quote`, or `None` at end of input.
fn skip_quoted(chars: &[char], start: usize, quote: char, line: &mut usize) -> Option<usize> {
    let mut i = start + 1;
    while let Some(&c) = chars.get(i) {
        match c {
            '\\' => i += 2,
            '\n' => {
                *line += 1;
                i += 1;
            }
            c if c == quote => return Some(i + 1),
            _ => i += 1,
        }
    }
    None
}

/// `'x'` and `'\n'` are skipped whole; a lone `'` (a lifetime) is stepped over.
fn skip_char_literal(chars: &[char], start: usize) -> usize {
    match (chars.get(start + 1), chars.get(start + 2)) {
        (Some('\\'), Some(_)) => {
            // Past the escaped character, then up to the closing quote.
            let limit = (start + 12).min(chars.len());
            (start + 3..limit)
                .find(|&i| chars[i] == '\'' || chars[i] == '\n')
                .filter(|&i| chars[i] == '\'')
                .map_or(start + 1, |i| i + 1)
        }
        (Some(_), Some('\'')) => start + 3,
        _ => start + 1,
    }
}

fn starts_raw_string(chars: &[char], i: usize) -> bool {
    if i > 0 && (chars[i - 1].is_alphanumeric() || chars[i - 1] == '_') {
        return false;
    }
    let mut j = i + 1;
    while chars.get(j) == Some(&'#') {
        j += 1;
    }
    chars.get(j) == Some(&'"')
}

fn skip_raw_string(chars: &[char], start: usize, line: &mut usize) -> Option<usize> {
    let mut i = start + 1;
    let mut hashes = 0usize;
    while chars.get(i) == Some(&'#') {
        hashes += 1;
        i += 1;
    }
    i += 1;
    while let Some(&c) = chars.get(i) {
        if c == '\n' {
            *line += 1;
        }
        if c == '"' && (1..=hashes).all(|k| chars.get(i + k) == Some(&'#')) {
            return Some(i + 1 + hashes);
        }
        i += 1;
    }
    None
}

// ─── External command ─────────────────────────────────────────────────────────

/// Runs a compile-only command; exit status zero means the file parsed.
pub struct CommandChecker {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandChecker {
    /// Build from `[program, args...]`; `{file}` in an argument is replaced
    /// by the file's path (appended if no argument mentions it).
    ///
    /// # Errors
    ///
    /// [`ValidationError::EmptyCommand`] if `command` is empty.
    pub fn new(extension: &str, command: &[String], timeout: Duration) -> Result<Self, ValidationError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| ValidationError::EmptyCommand {
                extension: extension.to_string(),
            })?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
        })
    }

    fn render_args(&self, path: &Path) -> Vec<String> {
        let file = path.display().to_string();
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|a| a.replace(FILE_PLACEHOLDER, &file))
            .collect();
        if !self.args.iter().any(|a| a.contains(FILE_PLACEHOLDER)) {
            args.push(file);
        }
        args
    }
}

#[async_trait]
impl SyntaxChecker for CommandChecker {
    fn name(&self) -> &str {
        &self.program
    }

    async fn check(&self, path: &Path, _source: &str) -> SyntaxOutcome {
        use tokio::process::Command;

        // Runs in the caller's working directory: `path` may be relative to it.
        let mut cmd = Command::new(&self.program);
        cmd.args(self.render_args(path)).kill_on_drop(true);

        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Err(_) => SyntaxOutcome::Unchecked(format!(
                "{} timed out after {:?}",
                self.program, self.timeout
            )),
            Ok(Err(e)) => SyntaxOutcome::Unchecked(format!("could not run {}: {e}", self.program)),
            Ok(Ok(output)) if output.status.success() => SyntaxOutcome::Passed,
            Ok(Ok(output)) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                let stdout = String::from_utf8_lossy(&output.stdout);
                let text = if stderr.trim().is_empty() { stdout } else { stderr };
                SyntaxOutcome::Failed(format!(
                    "exit={}: {}",
                    output.status,
                    excerpt(text.trim())
                ))
            }
        }
    }
}

/// Last `OUTPUT_EXCERPT_CHARS` characters of `text`; compilers report the
/// error near the end.
pub(crate) fn excerpt(text: &str) -> String {
    let count = text.chars().count();
    if count <= OUTPUT_EXCERPT_CHARS {
        text.to_string()
    } else {
        text.chars().skip(count - OUTPUT_EXCERPT_CHARS).collect()
    }
}

// ─── Registry ─────────────────────────────────────────────────────────────────

/// Compiles the file named by `argv[1]` without writing bytecode.
const PYTHON_COMPILE_SCRIPT: &str =
    "import sys; p = sys.argv[1]; compile(open(p, 'rb').read(), p, 'exec', dont_inherit=True)";

/// Default external checks, keyed by extension.
///
/// Python is compiled in memory so no `__pycache__` lands in the project.
pub fn default_syntax_commands() -> BTreeMap<String, Vec<String>> {
    let mut map = BTreeMap::new();
    map.insert(
        "py".to_string(),
        vec![
            "python3".to_string(),
            "-c".to_string(),
            PYTHON_COMPILE_SCRIPT.to_string(),
            FILE_PLACEHOLDER.to_string(),
        ],
    );
    map
}

/// Maps file extensions to checkers.
#[derive(Clone, Default)]
pub struct SyntaxRegistry {
    by_extension: HashMap<String, Arc<dyn SyntaxChecker>>,
}

impl SyntaxRegistry {
    /// In-process checkers for JSON, TOML and brace languages.
    pub fn builtin() -> Self {
        let mut reg = Self::default();
        reg.register("json", Arc::new(JsonChecker));
        reg.register("toml", Arc::new(TomlChecker));
        for ext in [
            "rs", "c", "h", "cpp", "hpp", "cc", "java", "js", "jsx", "ts", "tsx", "mjs", "go",
        ] {
            if let Some(dialect) = Dialect::for_extension(ext) {
                reg.register(ext, Arc::new(DelimiterChecker::new(dialect)));
            }
        }
        reg
    }

    /// Built-ins plus one [`CommandChecker`] per entry of `commands`.
    /// Commands override built-ins for the same extension.
    ///
    /// # Errors
    ///
    /// [`ValidationError::EmptyCommand`] for an empty command.
    pub fn with_commands(
        commands: &BTreeMap<String, Vec<String>>,
        timeout: Duration,
    ) -> Result<Self, ValidationError> {
        let mut reg = Self::builtin();
        for (ext, command) in commands {
            reg.register(ext, Arc::new(CommandChecker::new(ext, command, timeout)?));
        }
        Ok(reg)
    }

    /// Register or replace the checker for `extension`.
    pub fn register(&mut self, extension: &str, checker: Arc<dyn SyntaxChecker>) {
        self.by_extension
            .insert(extension.trim_start_matches('.').to_ascii_lowercase(), checker);
    }

    /// Checker for `path`, by extension.
    pub fn checker_for(&self, path: &Path) -> Option<Arc<dyn SyntaxChecker>> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        self.by_extension.get(&ext).cloned()
    }

    /// Check one file.
    pub async fn check(&self, path: &Path, source: &str) -> SyntaxOutcome {
        match self.checker_for(path) {
            Some(checker) => {
                debug!(file = %path.display(), checker = checker.name(), "syntax check");
                checker.check(path, source).await
            }
            None => SyntaxOutcome::Unchecked("no syntax checker for this file type".to_string()),
        }
    }
}
