//! Structured-output extraction from model replies.
//!
//! Replies wrap their payload in prose and code fences. `BalancedScanner` walks the text
//! and yields every balanced `{...}` / `[...]` span in order of its opening delimiter,
//! honoring JSON string literals and escapes, so a stray brace in the prose never
//! swallows the real payload.

use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExtractError {
    #[error("no JSON payload found in response")]
    NoPayload,

    #[error("JSON payload did not match the expected shape: {0}")]
    Invalid(String),
}

/// Iterator over balanced delimiter spans.
pub struct BalancedScanner<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> BalancedScanner<'a> {
    pub fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }
}

impl<'a> Iterator for BalancedScanner<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let bytes = self.text.as_bytes();
        while self.pos < bytes.len() {
            let start = self.pos;
            self.pos += 1;
            if bytes[start] != b'{' && bytes[start] != b'[' {
                continue;
            }
            if let Some(end) = balanced_end(bytes, start) {
                return Some(&self.text[start..=end]);
            }
        }
        None
    }
}

/// Index of the delimiter closing the one at `start`, if the span balances.
fn balanced_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut stack: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => stack.push(b'}'),
            b'[' => stack.push(b']'),
            b'}' | b']' => {
                if stack.pop() != Some(byte) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

/// Body of the first fenced code block, if any. An unterminated fence runs to the end.
pub fn fenced_block(text: &str) -> Option<&str> {
    let open = text.find("```")?;
    let after = &text[open + 3..];
    let header_end = after.find('\n').unwrap_or(after.len());
    let header = after[..header_end].trim();
    let body = if header.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        &after[(header_end + 1).min(after.len())..]
    } else {
        after
    };
    let close = body.find("```").unwrap_or(body.len());
    Some(body[..close].trim())
}

/// Parse the first JSON payload in `text` that deserializes into `T`.
///
/// The fenced block is tried first, then the whole reply; each source is tried as-is
/// and then candidate by candidate.
pub fn extract_json_payload<T: DeserializeOwned>(text: &str) -> Result<T, ExtractError> {
    let mut sources = Vec::with_capacity(2);
    if let Some(block) = fenced_block(text) {
        sources.push(block);
    }
    sources.push(text.trim());

    let mut last_error = None;
    for source in sources {
        if let Ok(value) = serde_json::from_str::<T>(source) {
            return Ok(value);
        }
        for candidate in BalancedScanner::new(source) {
            match serde_json::from_str::<T>(candidate) {
                Ok(value) => return Ok(value),
                Err(e) => last_error = Some(e.to_string()),
            }
        }
    }

    Err(last_error.map_or(ExtractError::NoPayload, ExtractError::Invalid))
}

/// LaTeX body of a reply with any code fence stripped.
pub fn extract_latex(text: &str) -> String {
    fenced_block(text)
        .unwrap_or_else(|| text.trim())
        .to_string()
}
