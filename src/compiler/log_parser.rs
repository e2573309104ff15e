//! Compiler log parsing.
//!
//! Extracts structured diagnostics from a TeX engine log: `!`-prefixed error blocks
//! (and `file:line: message` blocks under `-file-line-error`), the `l.NNN` marker that
//! follows them, and the source context printed alongside it.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Category of a compiler error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    Syntax,
    Font,
    Package,
    UndefinedCommand,
    Environment,
    Unknown,
}

/// One structured error extracted from a compiler log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub line_number: Option<u32>,
    pub kind: DiagnosticKind,
    pub message: String,
    pub context: String,
}

impl Diagnostic {
    pub fn unknown(message: impl Into<String>) -> Self {
        Self {
            line_number: None,
            kind: DiagnosticKind::Unknown,
            message: message.into(),
            context: String::new(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line_number {
            Some(line) => write!(f, "line {}: {}", line, self.message)?,
            None => write!(f, "{}", self.message)?,
        }
        if !self.context.is_empty() {
            write!(f, " (near: {})", self.context)?;
        }
        Ok(())
    }
}

const FONT_KEYWORDS: &[&str] = &["cannot be found", "not loadable", "tfm file", "font not found"];

const SYNTAX_KEYWORDS: &[&str] = &[
    "missing $",
    "missing {",
    "missing }",
    "extra {",
    "extra }",
    "mismatched",
    "runaway argument",
    "paragraph ended before",
    "extra alignment tab",
    "misplaced \\noalign",
    "misplaced \\omit",
    "display math should end with $$",
    "missing \\endgroup",
    "missing \\right",
    "extra \\right",
    "double superscript",
    "double subscript",
];

/// Classify an error message by keyword.
pub fn classify(message: &str) -> DiagnosticKind {
    let lower = message.to_lowercase();

    if FONT_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        return DiagnosticKind::Font;
    }
    if is_missing_style_file(&lower) || lower.contains("not found in the database") {
        return DiagnosticKind::Package;
    }
    if lower.contains("undefined control sequence") {
        return DiagnosticKind::UndefinedCommand;
    }
    if lower.contains("undefined environment") || is_environment_undefined(&lower) {
        return DiagnosticKind::Environment;
    }
    if SYNTAX_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        return DiagnosticKind::Syntax;
    }
    DiagnosticKind::Unknown
}

// file `foo.sty' not found
fn is_missing_style_file(lower: &str) -> bool {
    lower
        .find("file")
        .map(|start| &lower[start..])
        .and_then(|rest| rest.find(".sty'").map(|end| &rest[end..]))
        .map_or(false, |tail| tail.contains("not found"))
}

// environment foo undefined
fn is_environment_undefined(lower: &str) -> bool {
    lower.split_whitespace().collect::<Vec<_>>().windows(3).any(|w| {
        w[0] == "environment" && (w[2] == "undefined" || w[2] == "undefined.")
    })
}

/// `l.42 some context` -> (42, "some context")
fn parse_line_marker(line: &str) -> Option<(u32, &str)> {
    let rest = line.strip_prefix("l.")?;
    let digits_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    let number = rest[..digits_end].parse().ok()?;
    Some((number, rest[digits_end..].trim()))
}

/// `./document.tex:42: Undefined control sequence.` -> (42, message)
fn parse_file_line_error(line: &str) -> Option<(u32, &str)> {
    let marker = line.find(".tex:")?;
    let rest = &line[marker + ".tex:".len()..];
    let (number, message) = rest.split_once(": ")?;
    Some((number.parse().ok()?, message.trim()))
}

fn starts_error_block(line: &str) -> bool {
    line.starts_with('!') || parse_file_line_error(line).is_some()
}

/// Parse every distinct error in a compiler log, deduplicated by `(message, line)`.
pub fn parse_log(log: &str) -> Vec<Diagnostic> {
    let lines: Vec<&str> = log.lines().collect();
    let mut diagnostics = Vec::new();
    let mut seen: HashSet<(String, Option<u32>)> = HashSet::new();

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i];
        let (mut line_number, head) = if let Some(rest) = line.strip_prefix('!') {
            (None, rest.trim())
        } else if let Some((number, message)) = parse_file_line_error(line) {
            (Some(number), message)
        } else {
            i += 1;
            continue;
        };

        let mut message_parts = vec![head.to_string()];
        let mut j = i + 1;
        while j < lines.len() && !starts_error_block(lines[j]) && !lines[j].starts_with("l.") {
            let stripped = lines[j].trim();
            if !stripped.is_empty() {
                message_parts.push(stripped.to_string());
            }
            j += 1;
        }
        let message = message_parts.join(" ");

        let mut context_parts = Vec::new();
        for k in i..(j + 5).min(lines.len()) {
            if let Some((number, context)) = parse_line_marker(lines[k]) {
                line_number = line_number.or(Some(number));
                if !context.is_empty() {
                    context_parts.push(context.to_string());
                }
                if let Some(next) = lines.get(k + 1).map(|l| l.trim()) {
                    if !next.is_empty() {
                        context_parts.push(next.to_string());
                    }
                }
                break;
            }
        }

        if seen.insert((message.clone(), line_number)) {
            diagnostics.push(Diagnostic {
                line_number,
                kind: classify(&message),
                message,
                context: context_parts.join(" | "),
            });
        }

        i = j.max(i + 1);
    }

    diagnostics
}

/// Render diagnostics for a repair prompt, at most `limit` of them.
pub fn format_for_prompt(diagnostics: &[Diagnostic], limit: usize) -> String {
    let mut out: Vec<String> = diagnostics
        .iter()
        .take(limit)
        .enumerate()
        .map(|(n, d)| format!("{}. [{:?}] {}", n + 1, d.kind, d))
        .collect();
    if diagnostics.len() > limit {
        out.push(format!("... and {} more", diagnostics.len() - limit));
    }
    out.join("\n")
}

/// Last `lines` lines of a log, for error reports when no diagnostic was parsed.
pub fn log_tail(log: &str, lines: usize) -> String {
    let all: Vec<&str> = log.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}
