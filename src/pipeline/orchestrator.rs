//! Pipeline orchestrator.
//!
//! Sequences the stages of one run, records its `PipelineRun` and emits the
//! ordered event stream. Exactly one `done` or `error` event ends every run.

use super::analyze::DocumentAnalyzer;
use super::assemble::assemble;
use super::chapters::ChapterGenerator;
use super::events::{EventReceiver, EventSink, PipelineEvent};
use super::fix_loop::FixLoop;
use super::outline::OutlinePlanner;
use super::types::{ChapterStatus, PipelineRun, RunOutcome, SourceDocument, Stage};
use super::validate::ChapterValidator;
use crate::compiler::CompilerInvoker;
use crate::config::PipelineSettings;
use crate::error::PipelineError;
use crate::provider::ModelProviderClient;
use crate::template::{FrontMatter, TemplateProvider};
use futures::stream::{BoxStream, StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// A spawned run: its event stream and the task that yields the final `PipelineRun`.
pub struct PipelineHandle {
    pub events: BoxStream<'static, PipelineEvent>,
    pub task: JoinHandle<PipelineRun>,
}

#[derive(Clone)]
pub struct PipelineOrchestrator {
    gateway: Arc<dyn ModelProviderClient>,
    compiler: Arc<dyn CompilerInvoker>,
    templates: Arc<dyn TemplateProvider>,
    settings: PipelineSettings,
    work_root: Option<PathBuf>,
}

impl PipelineOrchestrator {
    pub fn new(
        gateway: Arc<dyn ModelProviderClient>,
        compiler: Arc<dyn CompilerInvoker>,
        templates: Arc<dyn TemplateProvider>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            gateway,
            compiler,
            templates,
            settings,
            work_root: None,
        }
    }

    /// Parent directory for compile working directories; the system temp dir when unset.
    pub fn with_work_root(mut self, work_root: Option<PathBuf>) -> Self {
        self.work_root = work_root;
        self
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Spawn a run on the current runtime.
    pub fn run(
        &self,
        documents: Vec<SourceDocument>,
        template_id: impl Into<String>,
        cancel: CancellationToken,
    ) -> PipelineHandle {
        let (sink, receiver) = EventSink::channel();
        let orchestrator = self.clone();
        let template_id = template_id.into();
        let task = tokio::spawn(async move {
            orchestrator
                .execute(&documents, &template_id, &sink, &cancel)
                .await
        });
        PipelineHandle {
            events: receiver_stream(receiver),
            task,
        }
    }

    /// Run every stage, reporting through `events`.
    #[instrument(skip_all, fields(documents = documents.len(), template = %template_id))]
    pub async fn execute(
        &self,
        documents: &[SourceDocument],
        template_id: &str,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> PipelineRun {
        let mut run = PipelineRun::new();
        info!(run_id = %run.run_id, "Pipeline run started");

        let result = self
            .stages(&mut run, documents, template_id, events, cancel)
            .await;
        let stage = run.current_stage;

        match result {
            Ok(()) => {
                run.outcome = Some(RunOutcome::Completed);
                events.stage(Stage::Compile, 100, "Document compiled");
                events.emit(PipelineEvent::Done {
                    final_document: run.final_document.clone(),
                    artifact_ref: run.artifact_ref.clone(),
                    attempts: run.attempts.len(),
                    warnings: run.warnings.clone(),
                });
                info!(run_id = %run.run_id, attempts = run.attempts.len(), "Pipeline run completed");
            }
            Err(e) if e.is_cancellation() => {
                run.outcome = Some(RunOutcome::Cancelled { stage });
                events.emit(PipelineEvent::Error {
                    stage,
                    message: "cancelled".to_string(),
                });
                info!(run_id = %run.run_id, %stage, "Pipeline run cancelled");
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(run_id = %run.run_id, %stage, error = %reason, "Pipeline run failed");
                events.emit(PipelineEvent::Error {
                    stage,
                    message: reason.clone(),
                });
                run.outcome = Some(RunOutcome::Failed { stage, reason });
            }
        }
        run.progress = events.progress();
        run
    }

    async fn stages(
        &self,
        run: &mut PipelineRun,
        documents: &[SourceDocument],
        template_id: &str,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let settings = &self.settings;

        run.current_stage = Stage::Analyze;
        events.stage(
            Stage::Analyze,
            0,
            format!("Analyzing {} document(s)", documents.len()),
        );
        if documents.is_empty() {
            return Err(PipelineError::NoDocuments);
        }
        let template = self.templates.get_template(template_id)?;
        checkpoint(cancel, Stage::Analyze)?;

        let total = documents.len();
        let mut done = 0;
        let analyses = DocumentAnalyzer::new(Arc::clone(&self.gateway), settings)
            .analyze(documents, cancel, |_, result| {
                done += 1;
                events.stage(
                    Stage::Analyze,
                    Stage::Analyze.progress_at(done, total),
                    format!("Analyzed {}", result.title),
                );
            })
            .await?;
        for analysis in analyses.iter().filter(|a| a.degraded) {
            run.warnings.push(format!(
                "Document {} analysis degraded: {}",
                analysis.document_id,
                analysis.warning.as_deref().unwrap_or("unknown error")
            ));
        }

        run.current_stage = Stage::Outline;
        checkpoint(cancel, Stage::Outline)?;
        events.stage(Stage::Outline, Stage::Outline.progress_at(0, 1), "Planning outline");
        let outline = OutlinePlanner::new(Arc::clone(&self.gateway), settings)
            .plan(&analyses, &template, cancel)
            .await?;
        events.emit(PipelineEvent::Outline {
            structure: outline.clone(),
        });

        run.current_stage = Stage::Chapters;
        checkpoint(cancel, Stage::Chapters)?;
        let total = outline.chapters.len();
        events.stage(
            Stage::Chapters,
            Stage::Chapters.progress_at(0, total),
            format!("Generating {} chapter(s)", total),
        );
        let front = FrontMatter {
            title: outline.title.clone(),
            author: outline.author.clone(),
            abstract_text: outline.abstract_text.clone(),
        };
        let validator = ChapterValidator::new(
            Arc::clone(&self.compiler),
            template.render_preamble(&front),
            template.postamble.clone(),
            template.support_dirs.clone(),
        )
        .enabled(settings.validate_chapters)
        .with_work_root(self.work_root.clone());
        let mut done = 0;
        let chapters = ChapterGenerator::new(Arc::clone(&self.gateway), validator, settings)
            .generate(
                &outline,
                documents,
                template.section_commands(),
                cancel,
                |_, chapter| {
                    done += 1;
                    events.emit(PipelineEvent::Chunk {
                        chapter_index: chapter.chapter_index,
                        text: chapter.fragment_text.clone(),
                    });
                    events.stage(
                        Stage::Chapters,
                        Stage::Chapters.progress_at(done, total),
                        format!("Chapter {} of {} finished", done, total),
                    );
                },
            )
            .await?;
        for chapter in chapters.iter().filter(|c| c.status == ChapterStatus::Degraded) {
            run.warnings.push(format!(
                "Chapter {} ({}) degraded: {}",
                chapter.chapter_index + 1,
                chapter.title,
                chapter.diagnostics.last().map(String::as_str).unwrap_or("unknown error")
            ));
        }

        run.current_stage = Stage::Assemble;
        checkpoint(cancel, Stage::Assemble)?;
        events.stage(Stage::Assemble, Stage::Assemble.progress_at(0, 1), "Assembling document");
        let document = assemble(&template, &outline, &chapters).render();
        run.final_document = Some(document.clone());

        run.current_stage = Stage::Compile;
        checkpoint(cancel, Stage::Compile)?;
        let report = FixLoop::new(
            Arc::clone(&self.compiler),
            Some(Arc::clone(&self.gateway)),
            settings,
        )
        .with_support_dirs(template.support_dirs.clone())
        .with_work_root(self.work_root.clone())
        .run(&document, events, cancel)
        .await?;

        let succeeded = report.succeeded();
        let attempts = report.attempts.len();
        run.attempts = report.attempts;
        run.final_document = Some(report.document);
        run.artifact_ref = report.artifact_ref;
        if succeeded {
            return Ok(());
        }
        Err(report.error.unwrap_or_else(|| PipelineError::Compile {
            attempts,
            message: "compile did not succeed".to_string(),
        }))
    }
}

fn checkpoint(cancel: &CancellationToken, stage: Stage) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        return Err(PipelineError::Cancelled {
            stage: stage.to_string(),
        });
    }
    Ok(())
}

fn receiver_stream(receiver: EventReceiver) -> BoxStream<'static, PipelineEvent> {
    futures::stream::unfold(receiver, |mut receiver| async move {
        receiver.recv().await.map(|event| (event, receiver))
    })
    .boxed()
}
