//! Scripted collaborators for stage unit tests.

use crate::compiler::{CompileMode, CompileOutput, CompilerInvoker, Diagnostic};
use crate::error::{CompileError, GatewayError};
use crate::provider::{
    ChatMessage, CompletionOptions, CompletionResponse, CompletionStream, ModelProviderClient,
    StreamChunk, TokenUsage,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

type Reply = Box<dyn Fn(&str) -> Result<String, GatewayError> + Send + Sync>;

/// Gateway answering from a closure over the last user message
pub struct ScriptedGateway {
    reply: Reply,
    delay: Duration,
    pub calls: AtomicUsize,
}

impl ScriptedGateway {
    pub fn new<F>(reply: F) -> Self
    where
        F: Fn(&str) -> Result<String, GatewayError> + Send + Sync + 'static,
    {
        Self {
            reply: Box::new(reply),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    async fn answer(&self, messages: &[ChatMessage]) -> Result<String, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let prompt = messages.last().map(|m| m.content.as_str()).unwrap_or_default();
        (self.reply)(prompt)
    }
}

#[async_trait]
impl ModelProviderClient for ScriptedGateway {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        _options: CompletionOptions,
    ) -> Result<CompletionResponse, GatewayError> {
        let content = self.answer(&messages).await?;
        Ok(CompletionResponse {
            content,
            model: "scripted".to_string(),
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
        let mid = content
            .char_indices()
            .nth(content.chars().count() / 2)
            .map_or(content.len(), |(i, _)| i);
        let chunks = vec![
            Ok(StreamChunk::Empty),
            Ok(StreamChunk::Delta(content[..mid].to_string())),
            Ok(StreamChunk::Empty),
            Ok(StreamChunk::Delta(content[mid..].to_string())),
            Ok(StreamChunk::Final(String::new())),
        ];
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    fn provider_name(&self) -> &str {
        "scripted"
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

/// Compiler that fails any document containing `\error`
pub struct ScriptedCompiler {
    pub calls: Mutex<Vec<(CompileMode, PathBuf)>>,
}

impl ScriptedCompiler {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn count(&self, mode: CompileMode) -> usize {
        self.calls.lock().iter().filter(|(m, _)| *m == mode).count()
    }
}

#[async_trait]
impl CompilerInvoker for ScriptedCompiler {
    async fn compile(
        &self,
        text: &str,
        mode: CompileMode,
        workdir: &Path,
    ) -> Result<CompileOutput, CompileError> {
        self.calls.lock().push((mode, workdir.to_path_buf()));
        if let Some(pos) = text.find("\\error") {
            let line = text[..pos].lines().count() as u32;
            return Ok(CompileOutput {
                success: false,
                artifact: None,
                log: format!("! Undefined control sequence.\nl.{} \\error\n", line),
                diagnostics: vec![Diagnostic {
                    line_number: Some(line),
                    kind: crate::compiler::DiagnosticKind::UndefinedCommand,
                    message: "Undefined control sequence.".to_string(),
                    context: "\\error".to_string(),
                }],
            });
        }
        let artifact = if mode == CompileMode::Full {
            let path = workdir.join("document.pdf");
            std::fs::write(&path, b"%PDF-1.5")?;
            Some(path)
        } else {
            None
        };
        Ok(CompileOutput {
            success: true,
            artifact,
            log: "Output written on document.pdf (1 page).".to_string(),
            diagnostics: vec![],
        })
    }
}
