//! Shared test utilities for integration tests
//!
//! Scripted gateway and compiler built on the public collaborator traits, plus
//! helpers for building orchestrators and outline replies.

use async_trait::async_trait;
use docforge::compiler::{
    CompileMode, CompileOutput, CompilerInvoker, Diagnostic, DiagnosticKind,
};
use docforge::config::PipelineSettings;
use docforge::error::{CompileError, GatewayError};
use docforge::pipeline::{PipelineOrchestrator, SourceDocument};
use docforge::provider::{
    ChatMessage, CompletionOptions, CompletionResponse, CompletionStream, ModelProviderClient,
    StreamChunk, TokenUsage,
};
use docforge::template::FsTemplateRegistry;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// What a prompt asks for, judged by its opening words
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Analysis,
    Outline,
    OutlineRepair,
    Chapter,
    Fix,
}

pub fn prompt_kind(prompt: &str) -> PromptKind {
    if prompt.starts_with("Analyze") {
        PromptKind::Analysis
    } else if prompt.starts_with("Plan") {
        PromptKind::Outline
    } else if prompt.starts_with("Your previous outline") {
        PromptKind::OutlineRepair
    } else if prompt.starts_with("Write chapter") {
        PromptKind::Chapter
    } else {
        PromptKind::Fix
    }
}

/// Title quoted in a chapter prompt's first line
pub fn chapter_title(prompt: &str) -> String {
    let first_line = prompt.lines().next().unwrap_or_default();
    first_line
        .rsplit(": \"")
        .next()
        .and_then(|rest| rest.split('"').next())
        .unwrap_or_default()
        .to_string()
}

/// Document text quoted at the end of a fix prompt
pub fn fix_document(prompt: &str) -> String {
    prompt
        .split_once("Document:\n")
        .map(|(_, document)| document.to_string())
        .unwrap_or_default()
}

pub fn outline_reply(titles: &[&str]) -> String {
    let chapters: Vec<serde_json::Value> = titles
        .iter()
        .map(|title| serde_json::json!({"title": title, "source_docs": [1]}))
        .collect();
    serde_json::json!({"title": "Combined Report", "author": "QA", "chapters": chapters})
        .to_string()
}

pub fn analysis_reply(title: &str) -> String {
    serde_json::json!({"title": title, "summary": format!("About {}", title), "key_topics": [title]})
        .to_string()
}

pub fn documents(count: usize) -> Vec<SourceDocument> {
    (1..=count)
        .map(|i| SourceDocument::new(format!("doc-{}", i), format!("source-{}.md", i), format!("Body of source {}.", i)))
        .collect()
}

type Script = Box<dyn Fn(&str) -> (Duration, Result<String, GatewayError>) + Send + Sync>;

/// Gateway answering from a script over the last user message.
///
/// Tracks concurrent calls per prompt kind so tests can assert fan-out bounds.
pub struct FakeGateway {
    script: Script,
    pub prompts: Mutex<Vec<String>>,
    in_flight: Mutex<Vec<(PromptKind, usize)>>,
    watermarks: Mutex<Vec<(PromptKind, usize)>>,
    pub active: Arc<AtomicUsize>,
}

struct InFlight<'a> {
    gateway: &'a FakeGateway,
    kind: PromptKind,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.gateway.active.fetch_sub(1, Ordering::SeqCst);
        let mut in_flight = self.gateway.in_flight.lock();
        if let Some(entry) = in_flight.iter_mut().find(|(k, _)| *k == self.kind) {
            entry.1 -= 1;
        }
    }
}

impl FakeGateway {
    pub fn new<F>(script: F) -> Self
    where
        F: Fn(&str) -> (Duration, Result<String, GatewayError>) + Send + Sync + 'static,
    {
        Self {
            script: Box::new(script),
            prompts: Mutex::new(Vec::new()),
            in_flight: Mutex::new(Vec::new()),
            watermarks: Mutex::new(Vec::new()),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Gateway that answers instantly.
    pub fn instant<F>(reply: F) -> Self
    where
        F: Fn(&str) -> Result<String, GatewayError> + Send + Sync + 'static,
    {
        Self::new(move |prompt| (Duration::ZERO, reply(prompt)))
    }

    pub fn watermark(&self, kind: PromptKind) -> usize {
        self.watermarks
            .lock()
            .iter()
            .find(|(k, _)| *k == kind)
            .map_or(0, |(_, n)| *n)
    }

    pub fn count(&self, kind: PromptKind) -> usize {
        self.prompts
            .lock()
            .iter()
            .filter(|p| prompt_kind(p) == kind)
            .count()
    }

    fn enter(&self, kind: PromptKind) -> InFlight<'_> {
        self.active.fetch_add(1, Ordering::SeqCst);
        let mut in_flight = self.in_flight.lock();
        let now = match in_flight.iter_mut().find(|(k, _)| *k == kind) {
            Some(entry) => {
                entry.1 += 1;
                entry.1
            }
            None => {
                in_flight.push((kind, 1));
                1
            }
        };
        let mut watermarks = self.watermarks.lock();
        match watermarks.iter_mut().find(|(k, _)| *k == kind) {
            Some(entry) => entry.1 = entry.1.max(now),
            None => watermarks.push((kind, now)),
        }
        InFlight {
            gateway: self,
            kind,
        }
    }

    async fn answer(&self, messages: &[ChatMessage]) -> Result<String, GatewayError> {
        let prompt = messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.prompts.lock().push(prompt.clone());
        let _guard = self.enter(prompt_kind(&prompt));
        let (delay, reply) = (self.script)(&prompt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        reply
    }
}

#[async_trait]
impl ModelProviderClient for FakeGateway {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        _options: CompletionOptions,
    ) -> Result<CompletionResponse, GatewayError> {
        Ok(CompletionResponse {
            content: self.answer(&messages).await?,
            model: "fake".to_string(),
            usage: TokenUsage::default(),
            finish_reason: Some("stop".to_string()),
        })
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        _options: CompletionOptions,
    ) -> Result<CompletionStream, GatewayError> {
        let content = self.answer(&messages).await?;
        let chunks = vec![
            Ok(StreamChunk::Empty),
            Ok(StreamChunk::Delta(content)),
            Ok(StreamChunk::Empty),
        ];
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    fn provider_name(&self) -> &str {
        "fake"
    }

    fn model_name(&self) -> &str {
        "fake"
    }
}

type Verdict = Box<dyn Fn(&str, CompileMode) -> bool + Send + Sync>;

/// One recorded compiler invocation
#[derive(Debug, Clone)]
pub struct CompileCall {
    pub mode: CompileMode,
    pub workdir: PathBuf,
    /// Entries already present in the working directory when the compile started
    pub preexisting: usize,
    pub success: bool,
}

/// Compiler whose verdict comes from a predicate; failures report a missing package.
pub struct FakeCompiler {
    verdict: Verdict,
    pub calls: Mutex<Vec<CompileCall>>,
}

impl FakeCompiler {
    pub fn new<F>(verdict: F) -> Self
    where
        F: Fn(&str, CompileMode) -> bool + Send + Sync + 'static,
    {
        Self {
            verdict: Box::new(verdict),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn passing() -> Self {
        Self::new(|_, _| true)
    }

    pub fn count(&self, mode: CompileMode) -> usize {
        self.calls.lock().iter().filter(|c| c.mode == mode).count()
    }
}

#[async_trait]
impl CompilerInvoker for FakeCompiler {
    async fn compile(
        &self,
        text: &str,
        mode: CompileMode,
        workdir: &Path,
    ) -> Result<CompileOutput, CompileError> {
        let preexisting = std::fs::read_dir(workdir)?.count();
        std::fs::write(workdir.join("document.tex"), text)?;
        std::fs::write(workdir.join("document.aux"), "\\relax")?;
        let success = (self.verdict)(text, mode);
        self.calls.lock().push(CompileCall {
            mode,
            workdir: workdir.to_path_buf(),
            preexisting,
            success,
        });

        if !success {
            return Ok(CompileOutput {
                success: false,
                artifact: None,
                log: "! LaTeX Error: File `missingpkg.sty' not found.\n".to_string(),
                diagnostics: vec![Diagnostic {
                    line_number: Some(3),
                    kind: DiagnosticKind::Package,
                    message: "LaTeX Error: File `missingpkg.sty' not found.".to_string(),
                    context: "\\usepackage{missingpkg}".to_string(),
                }],
            });
        }
        let artifact = match mode {
            CompileMode::Full => {
                let path = workdir.join("document.pdf");
                std::fs::write(&path, format!("%PDF {}", text.len()))?;
                Some(path)
            }
            CompileMode::Draft => None,
        };
        Ok(CompileOutput {
            success: true,
            artifact,
            log: "Output written on document.pdf".to_string(),
            diagnostics: vec![],
        })
    }
}

/// Orchestrator over the fakes with the built-in templates plus `custom_dir`.
pub fn orchestrator(
    gateway: Arc<FakeGateway>,
    compiler: Arc<FakeCompiler>,
    settings: PipelineSettings,
    custom_dir: &Path,
) -> PipelineOrchestrator {
    PipelineOrchestrator::new(
        gateway,
        compiler,
        Arc::new(FsTemplateRegistry::new(vec![], custom_dir.to_path_buf())),
        settings,
    )
}
