//! Text-level repair stages for malformed generator output.
//!
//! Each stage is a pure `&str -> String` rewrite behind [`RepairStage`].
//! Stages never decide whether the result is valid; the strict parser in
//! [`super`] re-checks after every pass.
//!
//! Every stage is idempotent: feeding a stage its own output returns that
//! output unchanged.

/// A single pure rewrite applied to candidate document text.
pub trait RepairStage: Send + Sync {
    /// Short machine-friendly name, used in recovery traces and logs.
    fn name(&self) -> &'static str;

    /// Rewrite `input`. Must not panic on any input.
    fn apply(&self, input: &str) -> String;
}

/// Repairs for the mistakes generators make most often, applied in order.
pub const COMMON_REPAIRS: &[&dyn RepairStage] = &[
    &EscapeStrayBackslashes,
    &QuoteBareTokens,
    &NormalizeQuotes,
    &TrimBeforeClosers,
];

/// Structural repairs for truncated or over-punctuated output, applied in order.
pub const AGGRESSIVE_REPAIRS: &[&dyn RepairStage] = &[&BalanceClosers, &StripTrailingCommas];

// ─── Scanner helpers ──────────────────────────────────────────────────────────

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$' || c == '-'
}

fn is_closer(c: char) -> bool {
    c == '}' || c == ']'
}

/// Copy a quoted literal starting at `chars[start]` (the opening quote)
/// verbatim into `out`, honouring backslash escapes. Returns the index just
/// past the closing quote, or `chars.len()` if the literal is unterminated.
fn copy_quoted(chars: &[char], start: usize, out: &mut String) -> usize {
    let quote = chars[start];
    out.push(quote);
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        out.push(c);
        i += 1;
        if c == '\\' {
            if let Some(&next) = chars.get(i) {
                out.push(next);
                i += 1;
            }
        } else if c == quote {
            break;
        }
    }
    i
}

fn last_significant(out: &str) -> Option<char> {
    out.trim_end().chars().last()
}

// ─── (a) Stray backslashes ────────────────────────────────────────────────────

/// Doubles every backslash that does not start a recognised escape sequence.
///
/// Recognised: `\" \\ \/ \b \f \n \r \t \'` and `\u` followed by four hex
/// digits. File paths such as `src\lib.rs` are the usual offenders.
#[derive(Debug, Clone, Copy, Default)]
pub struct EscapeStrayBackslashes;

impl RepairStage for EscapeStrayBackslashes {
    fn name(&self) -> &'static str {
        "escape_stray_backslashes"
    }

    fn apply(&self, input: &str) -> String {
        let chars: Vec<char> = input.chars().collect();
        let mut out = String::with_capacity(input.len() + 8);
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            if c != '\\' {
                out.push(c);
                i += 1;
                continue;
            }
            match chars.get(i + 1) {
                Some(&next @ ('"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | '\'')) => {
                    out.push('\\');
                    out.push(next);
                    i += 2;
                }
                Some('u')
                    if chars.len() >= i + 6
                        && chars[i + 2..i + 6].iter().all(|h| h.is_ascii_hexdigit()) =>
                {
                    out.extend(&chars[i..i + 6]);
                    i += 6;
                }
                _ => {
                    out.push_str("\\\\");
                    i += 1;
                }
            }
        }
        out
    }
}

// ─── (b) Bare keys and values ─────────────────────────────────────────────────

/// Quotes bare identifier keys (`key: ...`) and bare non-literal values
/// (`"key": some text`).
///
/// A bare value runs to the next `,`, `}`, `]` or newline. `true`, `false`
/// and `null` stay bare; Python-style `True`, `False` and `None` are mapped
/// to their JSON spelling.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuoteBareTokens;

impl RepairStage for QuoteBareTokens {
    fn name(&self) -> &'static str {
        "quote_bare_tokens"
    }

    fn apply(&self, input: &str) -> String {
        let chars: Vec<char> = input.chars().collect();
        let mut out = String::with_capacity(input.len() + 16);
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            if c == '"' || c == '\'' {
                i = copy_quoted(&chars, i, &mut out);
                continue;
            }
            let at_boundary = i == 0 || !(is_ident_char(chars[i - 1]) || chars[i - 1] == '.');
            if !(is_ident_start(c) && at_boundary) {
                out.push(c);
                i += 1;
                continue;
            }

            if last_significant(&out) == Some(':') {
                let mut end = i;
                while end < chars.len() && !matches!(chars[end], ',' | '}' | ']' | '\n') {
                    end += 1;
                }
                let raw: String = chars[i..end].iter().collect();
                let value = raw.trim_end();
                let trailing = &raw[value.len()..];
                match value {
                    "true" | "false" | "null" => out.push_str(value),
                    "True" => out.push_str("true"),
                    "False" => out.push_str("false"),
                    "None" => out.push_str("null"),
                    _ => {
                        out.push('"');
                        out.push_str(&value.replace('"', "\\\""));
                        out.push('"');
                    }
                }
                out.push_str(trailing);
                i = end;
                continue;
            }

            let mut end = i;
            while end < chars.len() && is_ident_char(chars[end]) {
                end += 1;
            }
            let mut look = end;
            while look < chars.len() && chars[look].is_whitespace() {
                look += 1;
            }
            let token: String = chars[i..end].iter().collect();
            if chars.get(look) == Some(&':') {
                out.push('"');
                out.push_str(&token);
                out.push('"');
            } else {
                out.push_str(&token);
            }
            i = end;
        }
        out
    }
}

// ─── (c) Single quotes ────────────────────────────────────────────────────────

/// Rewrites single-quoted literals as double-quoted ones.
///
/// Double quotes inside a converted literal are escaped; `\'` becomes a
/// plain apostrophe everywhere. Apostrophes inside double-quoted strings are
/// left alone.
#[derive(Debug, Clone, Copy, Default)]
pub struct NormalizeQuotes;

impl RepairStage for NormalizeQuotes {
    fn name(&self) -> &'static str {
        "normalize_quotes"
    }

    fn apply(&self, input: &str) -> String {
        let chars: Vec<char> = input.chars().collect();
        let mut out = String::with_capacity(input.len());
        let mut i = 0;
        while i < chars.len() {
            match chars[i] {
                '"' => {
                    out.push('"');
                    i += 1;
                    while i < chars.len() {
                        let c = chars[i];
                        if c == '\\' {
                            match chars.get(i + 1) {
                                Some('\'') => out.push('\''),
                                Some(&next) => {
                                    out.push('\\');
                                    out.push(next);
                                }
                                None => out.push('\\'),
                            }
                            i += 2;
                            continue;
                        }
                        out.push(c);
                        i += 1;
                        if c == '"' {
                            break;
                        }
                    }
                }
                '\'' => {
                    out.push('"');
                    i += 1;
                    while i < chars.len() {
                        let c = chars[i];
                        match c {
                            '\\' => {
                                match chars.get(i + 1) {
                                    Some('\'') => out.push('\''),
                                    Some(&next) => {
                                        out.push('\\');
                                        out.push(next);
                                    }
                                    None => out.push('\\'),
                                }
                                i += 2;
                            }
                            '\'' => {
                                out.push('"');
                                i += 1;
                                break;
                            }
                            '"' => {
                                out.push_str("\\\"");
                                i += 1;
                            }
                            _ => {
                                out.push(c);
                                i += 1;
                            }
                        }
                    }
                }
                c => {
                    out.push(c);
                    i += 1;
                }
            }
        }
        out
    }
}

// ─── (d) Whitespace before closers ────────────────────────────────────────────

/// Removes whitespace that sits immediately before `}` or `]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrimBeforeClosers;

impl RepairStage for TrimBeforeClosers {
    fn name(&self) -> &'static str {
        "trim_before_closers"
    }

    fn apply(&self, input: &str) -> String {
        let chars: Vec<char> = input.chars().collect();
        let mut out = String::with_capacity(input.len());
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            if c == '"' || c == '\'' {
                i = copy_quoted(&chars, i, &mut out);
                continue;
            }
            if c.is_whitespace() {
                let mut end = i;
                while end < chars.len() && chars[end].is_whitespace() {
                    end += 1;
                }
                if !chars.get(end).is_some_and(|&next| is_closer(next)) {
                    out.extend(&chars[i..end]);
                }
                i = end;
                continue;
            }
            out.push(c);
            i += 1;
        }
        out
    }
}

// ─── Aggressive: trailing commas ──────────────────────────────────────────────

/// Drops commas that are followed (after whitespace or further commas) by a
/// closing brace or bracket.
#[derive(Debug, Clone, Copy, Default)]
pub struct StripTrailingCommas;

impl RepairStage for StripTrailingCommas {
    fn name(&self) -> &'static str {
        "strip_trailing_commas"
    }

    fn apply(&self, input: &str) -> String {
        let chars: Vec<char> = input.chars().collect();
        let mut out = String::with_capacity(input.len());
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            if c == '"' {
                i = copy_quoted(&chars, i, &mut out);
                continue;
            }
            if c == ',' {
                let mut look = i + 1;
                while look < chars.len() && (chars[look].is_whitespace() || chars[look] == ',') {
                    look += 1;
                }
                if chars.get(look).is_some_and(|&next| is_closer(next)) {
                    i += 1;
                    continue;
                }
            }
            out.push(c);
            i += 1;
        }
        out
    }
}

// ─── Aggressive: unbalanced closers ───────────────────────────────────────────

/// Restores bracket structure damaged by truncation.
///
/// Closes an unterminated string, completes a dangling `"key":` with `null`,
/// then appends the missing `}` / `]` in nesting order. A closer that skips
/// over open brackets gets the skipped closers inserted before it; a closer
/// with no matching opener is dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct BalanceClosers;

impl RepairStage for BalanceClosers {
    fn name(&self) -> &'static str {
        "balance_closers"
    }

    fn apply(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len() + 8);
        let mut expected: Vec<char> = Vec::new();
        let mut in_string = false;
        let mut escaped = false;

        for c in input.chars() {
            if in_string {
                out.push(c);
                if escaped {
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    in_string = false;
                }
                continue;
            }
            match c {
                '"' => {
                    in_string = true;
                    out.push(c);
                }
                '{' => {
                    expected.push('}');
                    out.push(c);
                }
                '[' => {
                    expected.push(']');
                    out.push(c);
                }
                '}' | ']' => {
                    if let Some(pos) = expected.iter().rposition(|&e| e == c) {
                        while expected.len() > pos + 1 {
                            if let Some(skipped) = expected.pop() {
                                out.push(skipped);
                            }
                        }
                        expected.pop();
                        out.push(c);
                    }
                }
                _ => out.push(c),
            }
        }

        if in_string {
            if escaped {
                out.push('\\');
            }
            out.push('"');
        }
        if !expected.is_empty() && last_significant(&out) == Some(':') {
            out.push_str(" null");
        }
        while let Some(closer) = expected.pop() {
            out.push(closer);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_stages() -> Vec<&'static dyn RepairStage> {
        COMMON_REPAIRS
            .iter()
            .chain(AGGRESSIVE_REPAIRS.iter())
            .copied()
            .collect()
    }

    // ── (a) ───────────────────────────────────────────────────────────────

    #[test]
    fn test_stray_backslash_in_path_is_doubled() {
        let out = EscapeStrayBackslashes.apply(r#"{"p": "src\lib.rs"}"#);
        assert_eq!(out, r#"{"p": "src\\lib.rs"}"#);
    }

    #[test]
    fn test_recognised_escapes_are_kept() {
        let input = r#"{"a": "line\nquote\" slash\/ tab\t \u00e9"}"#;
        assert_eq!(EscapeStrayBackslashes.apply(input), input);
    }

    #[test]
    fn test_short_unicode_escape_is_treated_as_stray() {
        assert_eq!(EscapeStrayBackslashes.apply(r"\u12"), r"\\u12");
    }

    #[test]
    fn test_trailing_backslash_is_doubled() {
        assert_eq!(EscapeStrayBackslashes.apply("abc\\"), "abc\\\\");
    }

    // ── (b) ───────────────────────────────────────────────────────────────

    #[test]
    fn test_bare_keys_are_quoted() {
        let out = QuoteBareTokens.apply("{key: 1, other_key : 2}");
        assert_eq!(out, r#"{"key": 1, "other_key" : 2}"#);
    }

    #[test]
    fn test_bare_values_are_quoted() {
        let out = QuoteBareTokens.apply(r#"{"kind": REPLACE, "n": 3}"#);
        assert_eq!(out, r#"{"kind": "REPLACE", "n": 3}"#);
    }

    #[test]
    fn test_bare_value_with_colon_is_one_value() {
        let out = QuoteBareTokens.apply("{url: http://example.com/x}");
        assert_eq!(out, r#"{"url": "http://example.com/x"}"#);
    }

    #[test]
    fn test_literals_stay_bare_and_python_literals_map() {
        let out = QuoteBareTokens.apply("{a: true, b: None, c: False, d: null}");
        assert_eq!(out, r#"{"a": true, "b": null, "c": false, "d": null}"#);
    }

    #[test]
    fn test_quoted_content_is_untouched() {
        let input = r#"{"text": "key: value", 'other': 'x: y'}"#;
        assert_eq!(QuoteBareTokens.apply(input), input);
    }

    #[test]
    fn test_numbers_with_exponent_are_not_tokens() {
        let input = r#"{"n": 1e5}"#;
        assert_eq!(QuoteBareTokens.apply(input), input);
    }

    // ── (c) ───────────────────────────────────────────────────────────────

    #[test]
    fn test_single_quotes_become_double() {
        let out = NormalizeQuotes.apply("{'a': 'b \"c\" it\\'s'}");
        assert_eq!(out, r#"{"a": "b \"c\" it's"}"#);
    }

    #[test]
    fn test_apostrophe_inside_double_string_survives() {
        let input = r#"{"a": "don't"}"#;
        assert_eq!(NormalizeQuotes.apply(input), input);
    }

    // ── (d) ───────────────────────────────────────────────────────────────

    #[test]
    fn test_whitespace_before_closers_is_removed() {
        assert_eq!(
            TrimBeforeClosers.apply("{\"a\": [1, 2 ]\n}"),
            "{\"a\": [1, 2]}"
        );
    }

    #[test]
    fn test_whitespace_inside_strings_is_kept() {
        let input = r#"{"a": "x ]"}"#;
        assert_eq!(TrimBeforeClosers.apply(input), input);
    }

    // ── Aggressive ────────────────────────────────────────────────────────

    #[test]
    fn test_trailing_commas_are_stripped() {
        assert_eq!(
            StripTrailingCommas.apply(r#"{"a": [1, 2,], "b": 3,}"#),
            r#"{"a": [1, 2], "b": 3}"#
        );
    }

    #[test]
    fn test_commas_inside_strings_are_kept() {
        let input = r#"{"a": ",]"}"#;
        assert_eq!(StripTrailingCommas.apply(input), input);
    }

    #[test]
    fn test_missing_closers_are_appended_in_nesting_order() {
        assert_eq!(
            BalanceClosers.apply(r#"{"a": [1, {"b": 2"#),
            r#"{"a": [1, {"b": 2}]}"#
        );
    }

    #[test]
    fn test_unterminated_string_is_closed() {
        assert_eq!(
            BalanceClosers.apply(r#"{"a": "trunc"#),
            r#"{"a": "trunc"}"#
        );
    }

    #[test]
    fn test_dangling_key_gets_null() {
        assert_eq!(BalanceClosers.apply(r#"{"a": 1, "b":"#), r#"{"a": 1, "b": null}"#);
    }

    #[test]
    fn test_skipped_closer_is_inserted() {
        assert_eq!(BalanceClosers.apply(r#"{"a": [1, 2}"#), r#"{"a": [1, 2]}"#);
    }

    #[test]
    fn test_stray_closer_is_dropped() {
        assert_eq!(BalanceClosers.apply(r#"{"a": 1}}"#), r#"{"a": 1}"#);
    }

    // ── Idempotence ───────────────────────────────────────────────────────

    #[test]
    fn test_every_stage_is_idempotent_on_noisy_samples() {
        let samples = [
            "{key: 'value', \"ops\": [1,2,]}",
            r#"{"path": "C:\Users\me\file.txt", "n": 1"#,
            "{a: it's here, b: 'x\\'y', c: [True, None,,]  }",
            r#"{"a": "unterminated \"#,
            "}}{[:,'\"\\",
            "plain prose with no structure",
            "",
        ];
        for stage in all_stages() {
            for sample in samples {
                let once = stage.apply(sample);
                let twice = stage.apply(&once);
                assert_eq!(once, twice, "stage {} not idempotent on {sample:?}", stage.name());
            }
        }
    }

    #[test]
    fn test_stages_leave_valid_json_unchanged() {
        let valid = r#"{"analysis": "ok", "operations": [{"file_path": "a.rs", "n": -1.5e3, "flag": true, "none": null}]}"#;
        for stage in all_stages() {
            assert_eq!(stage.apply(valid), valid, "stage {} rewrote valid JSON", stage.name());
        }
    }

    #[test]
    fn test_stage_names_are_unique() {
        let mut names: Vec<_> = all_stages().iter().map(|s| s.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), COMMON_REPAIRS.len() + AGGRESSIVE_REPAIRS.len());
    }
}
