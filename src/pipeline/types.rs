//! Pipeline data model.

use crate::compiler::Diagnostic;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

pub fn new_run_id() -> String {
    let ts = now_millis();
    let pid = std::process::id();
    let seq = RUN_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("run-{ts}-{pid}-{seq}")
}

/// A named section of an input document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSection {
    pub heading: String,
    pub text: String,
}

/// Extracted input document; never mutated by the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub id: String,
    pub name: String,
    pub text: String,
    #[serde(default)]
    pub sections: Vec<DocumentSection>,
}

impl SourceDocument {
    pub fn new(id: impl Into<String>, name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            text: text.into(),
            sections: Vec::new(),
        }
    }

    /// First `max_chars` characters of the text.
    pub fn excerpt(&self, max_chars: usize) -> String {
        let mut excerpt: String = self.text.chars().take(max_chars).collect();
        if self.text.chars().nth(max_chars).is_some() {
            excerpt.push_str("...");
        }
        excerpt
    }
}

/// Per-document analysis; degraded results stand in for failed analyses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub document_id: String,
    pub title: String,
    pub summary: String,
    pub key_topics: Vec<String>,
    pub key_points: Vec<String>,
    pub degraded: bool,
    pub warning: Option<String>,
}

/// Characters of source text kept as the summary of a degraded analysis
pub const DEGRADED_EXCERPT_CHARS: usize = 500;

impl AnalysisResult {
    pub fn degraded(document: &SourceDocument, reason: impl Into<String>) -> Self {
        Self {
            document_id: document.id.clone(),
            title: document.name.clone(),
            summary: document.excerpt(DEGRADED_EXCERPT_CHARS),
            key_topics: Vec::new(),
            key_points: Vec::new(),
            degraded: true,
            warning: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterSpec {
    /// 0-based outline position; the canonical chapter order
    pub index: usize,
    pub title: String,
    pub level: u8,
    /// Ids of the documents this chapter draws on
    pub source_refs: Vec<String>,
    pub generation_instructions: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendixSpec {
    pub title: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Outline {
    pub title: String,
    pub author: String,
    pub abstract_text: String,
    pub chapters: Vec<ChapterSpec>,
    pub appendices: Vec<AppendixSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChapterStatus {
    Ok,
    Degraded,
}

/// Exactly one per `ChapterSpec`, failed or not
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedChapter {
    pub chapter_index: usize,
    pub title: String,
    pub fragment_text: String,
    pub status: ChapterStatus,
    pub diagnostics: Vec<String>,
}

/// Document assembled from ordered chapter fragments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledDocument {
    pub preamble: String,
    pub fragments: Vec<String>,
    pub appendix: String,
    pub postamble: String,
}

impl AssembledDocument {
    pub fn render(&self) -> String {
        let mut text = self.preamble.trim_end().to_string();
        for fragment in &self.fragments {
            text.push_str("\n\n");
            text.push_str(fragment.trim());
        }
        if !self.appendix.trim().is_empty() {
            text.push_str("\n\n");
            text.push_str(self.appendix.trim());
        }
        text.push_str("\n\n");
        text.push_str(&self.postamble);
        text
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Success,
    Failure,
}

/// One full compile inside the fix loop
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileAttempt {
    /// 1-based
    pub attempt_number: usize,
    pub document_snapshot: String,
    pub outcome: AttemptOutcome,
    pub diagnostics: Vec<Diagnostic>,
    pub log: String,
}

impl CompileAttempt {
    /// Content digest of the compiled text.
    pub fn snapshot_digest(&self) -> String {
        hex::encode(blake3::hash(self.document_snapshot.as_bytes()).as_bytes())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Analyze,
    Outline,
    Chapters,
    Assemble,
    Compile,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Analyze => "analyze",
            Stage::Outline => "outline",
            Stage::Chapters => "chapters",
            Stage::Assemble => "assemble",
            Stage::Compile => "compile",
        }
    }

    /// Progress band `(start, end)` the stage reports within.
    pub fn progress_band(&self) -> (u8, u8) {
        match self {
            Stage::Analyze => (0, 25),
            Stage::Outline => (25, 35),
            Stage::Chapters => (35, 80),
            Stage::Assemble => (80, 85),
            Stage::Compile => (85, 100),
        }
    }

    /// Progress after `done` of `total` units of the stage.
    pub fn progress_at(&self, done: usize, total: usize) -> u8 {
        let (start, end) = self.progress_band();
        if total == 0 {
            return start;
        }
        let span = (end - start) as usize;
        start + (span * done.min(total) / total) as u8
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RunOutcome {
    Completed,
    Failed { stage: Stage, reason: String },
    Cancelled { stage: Stage },
}

/// State of one invocation; frozen once `outcome` is set
#[derive(Debug, Clone)]
pub struct PipelineRun {
    pub run_id: String,
    pub current_stage: Stage,
    pub progress: u8,
    pub warnings: Vec<String>,
    pub outcome: Option<RunOutcome>,
    pub final_document: Option<String>,
    pub artifact_ref: Option<PathBuf>,
    pub attempts: Vec<CompileAttempt>,
}

impl PipelineRun {
    pub fn new() -> Self {
        Self {
            run_id: new_run_id(),
            current_stage: Stage::Analyze,
            progress: 0,
            warnings: Vec::new(),
            outcome: None,
            final_document: None,
            artifact_ref: None,
            attempts: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.outcome.is_some()
    }
}

impl Default for PipelineRun {
    fn default() -> Self {
        Self::new()
    }
}
