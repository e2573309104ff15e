//! Chapter generation stage.
//!
//! Chapters are generated concurrently under the chapter width. Each task streams
//! its text, validates it in draft mode and regenerates once with the error in
//! context. A chapter that still fails is kept as `Degraded`, never dropped.

use super::fanout::{BoundedFanOut, FanOutError};
use super::types::{ChapterSpec, ChapterStatus, GeneratedChapter, Outline, SourceDocument, Stage};
use super::validate::ChapterValidator;
use super::{guarded, prompts};
use crate::compiler::log_parser::format_for_prompt;
use crate::config::PipelineSettings;
use crate::error::{CompileError, PipelineError};
use crate::extract::extract_latex;
use crate::provider::{collect_stream, ChatMessage, CompletionOptions, ModelProviderClient};
use crate::template::{escape_latex, SectionCommands};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// First attempt plus one regeneration
const MAX_CHAPTER_ATTEMPTS: usize = 2;

pub struct ChapterGenerator {
    gateway: Arc<dyn ModelProviderClient>,
    validator: Arc<ChapterValidator>,
    width: usize,
    timeout: Duration,
    max_prompt_diagnostics: usize,
}

struct ChapterContext {
    gateway: Arc<dyn ModelProviderClient>,
    validator: Arc<ChapterValidator>,
    outline: Outline,
    documents: Vec<SourceDocument>,
    commands: SectionCommands,
    timeout: Duration,
    max_prompt_diagnostics: usize,
}

impl ChapterGenerator {
    pub fn new(
        gateway: Arc<dyn ModelProviderClient>,
        validator: ChapterValidator,
        settings: &PipelineSettings,
    ) -> Self {
        Self {
            gateway,
            validator: Arc::new(validator),
            width: settings.batch_size_chapters,
            timeout: settings.chapter_timeout(),
            max_prompt_diagnostics: settings.max_prompt_diagnostics,
        }
    }

    /// One `GeneratedChapter` per outline chapter, in outline order. `on_chapter`
    /// sees them in completion order.
    pub async fn generate<C>(
        &self,
        outline: &Outline,
        documents: &[SourceDocument],
        commands: SectionCommands,
        cancel: &CancellationToken,
        on_chapter: C,
    ) -> Result<Vec<GeneratedChapter>, PipelineError>
    where
        C: FnMut(usize, &GeneratedChapter),
    {
        let context = Arc::new(ChapterContext {
            gateway: Arc::clone(&self.gateway),
            validator: Arc::clone(&self.validator),
            outline: outline.clone(),
            documents: documents.to_vec(),
            commands,
            timeout: self.timeout,
            max_prompt_diagnostics: self.max_prompt_diagnostics,
        });
        let fanout = BoundedFanOut::new(self.width, cancel.clone());

        fanout
            .run(
                outline.chapters.clone(),
                move |_, spec, child| {
                    let context = Arc::clone(&context);
                    async move { generate_chapter(context, spec, child).await }
                },
                on_chapter,
            )
            .await
            .map_err(|e| match e {
                FanOutError::Cancelled => PipelineError::Cancelled {
                    stage: Stage::Chapters.to_string(),
                },
                FanOutError::TaskLost { index } => PipelineError::ChapterGeneration {
                    chapter_index: index,
                    message: e.to_string(),
                },
            })
    }
}

impl ChapterContext {
    fn sources_for(&self, spec: &ChapterSpec) -> Vec<&SourceDocument> {
        let referenced: Vec<&SourceDocument> = self
            .documents
            .iter()
            .filter(|d| spec.source_refs.contains(&d.id))
            .collect();
        if referenced.is_empty() {
            self.documents.iter().collect()
        } else {
            referenced
        }
    }
}

async fn stream_text(
    gateway: &dyn ModelProviderClient,
    messages: Vec<ChatMessage>,
) -> Result<String, PipelineError> {
    let options = CompletionOptions::default().with_temperature(0.3);
    let stream = gateway.stream(messages, options).await?;
    Ok(collect_stream(stream).await?)
}

async fn generate_chapter(
    context: Arc<ChapterContext>,
    spec: ChapterSpec,
    cancel: CancellationToken,
) -> GeneratedChapter {
    let sources = context.sources_for(&spec);
    let mut feedback: Option<String> = None;
    let mut last_fragment: Option<String> = None;
    let mut diagnostics: Vec<String> = Vec::new();

    for attempt in 1..=MAX_CHAPTER_ATTEMPTS {
        let messages = prompts::chapter(
            &context.outline,
            &spec,
            &sources,
            context.commands,
            feedback.as_deref(),
        );
        let generated = guarded(
            &cancel,
            context.timeout,
            Stage::Chapters,
            stream_text(context.gateway.as_ref(), messages),
        )
        .await;

        let fragment = match generated {
            Ok(text) if !text.trim().is_empty() => extract_latex(&text),
            Ok(_) => {
                let message = generation_error(&spec, "empty response");
                diagnostics.push(message.clone());
                feedback = Some(message);
                continue;
            }
            Err(e) if e.is_cancellation() => {
                diagnostics.push(e.to_string());
                break;
            }
            Err(e) => {
                let message = generation_error(&spec, &e.to_string());
                debug!(chapter_index = spec.index, attempt, %message, "Chapter generation failed");
                diagnostics.push(message.clone());
                feedback = Some(message);
                continue;
            }
        };

        match context.validator.validate(&fragment, &cancel).await {
            Ok(report) if report.passed => return finished(&spec, fragment, ChapterStatus::Ok, diagnostics),
            Ok(report) => {
                let summary = format_for_prompt(&report.diagnostics, context.max_prompt_diagnostics);
                diagnostics.push(
                    PipelineError::ChapterValidation {
                        chapter_index: spec.index,
                        message: summary.clone(),
                    }
                    .to_string(),
                );
                debug!(chapter_index = spec.index, attempt, "Chapter failed validation");
                feedback = Some(summary);
                last_fragment = Some(fragment);
            }
            Err(CompileError::Cancelled) => {
                last_fragment = Some(fragment);
                break;
            }
            Err(e) => {
                warn!(chapter_index = spec.index, error = %e, "Chapter validation unavailable");
                diagnostics.push(format!("validation skipped: {}", e));
                return finished(&spec, fragment, ChapterStatus::Ok, diagnostics);
            }
        }
    }

    let fragment = last_fragment.unwrap_or_else(|| {
        placeholder(
            context.commands.for_level(spec.level),
            &spec.title,
            diagnostics.last().map(String::as_str).unwrap_or("no output"),
        )
    });
    warn!(chapter_index = spec.index, "Chapter degraded");
    finished(&spec, fragment, ChapterStatus::Degraded, diagnostics)
}

fn generation_error(spec: &ChapterSpec, message: &str) -> String {
    PipelineError::ChapterGeneration {
        chapter_index: spec.index,
        message: message.to_string(),
    }
    .to_string()
}

fn finished(
    spec: &ChapterSpec,
    fragment_text: String,
    status: ChapterStatus,
    diagnostics: Vec<String>,
) -> GeneratedChapter {
    GeneratedChapter {
        chapter_index: spec.index,
        title: spec.title.clone(),
        fragment_text,
        status,
        diagnostics,
    }
}

/// Heading-only fragment for a chapter that never produced text.
pub fn placeholder(command: &str, title: &str, reason: &str) -> String {
    let reason = reason.replace(['\n', '\r'], " ");
    format!(
        "{}{{{}}}\n% generation failed: {}\n",
        command,
        escape_latex(title),
        reason
    )
}
