//! Compile-validate-fix loop.
//!
//! ```text
//! Compiling --success--> Success
//! Compiling --failure, retries left, auto-fix--> Fixing --revision--> Compiling
//! Compiling --failure otherwise--> Failed
//! Fixing --repair error / no usable revision--> Failed
//! ```
//!
//! Every compile runs in its own fresh working directory, so an attempt never
//! sees files left behind by an earlier one. The loop runs at most
//! `max_retries + 1` compiles.

use super::events::{EventSink, PipelineEvent};
use super::types::{AttemptOutcome, CompileAttempt, Stage};
use super::{guarded, prompts};
use crate::compiler::log_parser::{format_for_prompt, log_tail};
use crate::compiler::{CompileMode, CompileOutput, CompileWorkdir, CompilerInvoker, Diagnostic};
use crate::config::PipelineSettings;
use crate::error::{CompileError, PipelineError};
use crate::extract::extract_latex;
use crate::provider::{CompletionOptions, ModelProviderClient};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Lines of compiler log quoted when no diagnostic could be parsed
const LOG_TAIL_LINES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixState {
    Compiling,
    Fixing,
    Success,
    Failed,
}

/// Terminal result of one loop run
#[derive(Debug)]
pub struct FixLoopReport {
    /// `Success` or `Failed`
    pub state: FixState,
    /// Text of the last compiled attempt
    pub document: String,
    /// Whether `document` differs from the input
    pub changed: bool,
    pub artifact_ref: Option<PathBuf>,
    pub attempts: Vec<CompileAttempt>,
    pub error: Option<PipelineError>,
}

impl FixLoopReport {
    pub fn succeeded(&self) -> bool {
        self.state == FixState::Success
    }
}

pub struct FixLoop {
    compiler: Arc<dyn CompilerInvoker>,
    gateway: Option<Arc<dyn ModelProviderClient>>,
    support_dirs: Vec<PathBuf>,
    work_root: Option<PathBuf>,
    max_retries: usize,
    auto_fix: bool,
    fix_timeout: Duration,
    max_prompt_diagnostics: usize,
    artifact_dir: Option<PathBuf>,
}

impl FixLoop {
    /// Without a gateway the loop compiles once and never attempts a repair.
    pub fn new(
        compiler: Arc<dyn CompilerInvoker>,
        gateway: Option<Arc<dyn ModelProviderClient>>,
        settings: &PipelineSettings,
    ) -> Self {
        Self {
            compiler,
            gateway,
            support_dirs: Vec::new(),
            work_root: None,
            max_retries: settings.max_retries,
            auto_fix: settings.auto_fix,
            fix_timeout: settings.fix_timeout(),
            max_prompt_diagnostics: settings.max_prompt_diagnostics,
            artifact_dir: settings.artifact_dir.clone(),
        }
    }

    pub fn with_support_dirs(mut self, support_dirs: Vec<PathBuf>) -> Self {
        self.support_dirs = support_dirs;
        self
    }

    pub fn with_work_root(mut self, work_root: Option<PathBuf>) -> Self {
        self.work_root = work_root;
        self
    }

    /// Drive `document` to a compiled artifact.
    ///
    /// Returns `Err` only on cancellation; compile and repair failures end in a
    /// `Failed` report.
    #[instrument(skip_all, fields(bytes = document.len()))]
    pub async fn run(
        &self,
        document: &str,
        events: &EventSink,
        cancel: &CancellationToken,
    ) -> Result<FixLoopReport, PipelineError> {
        let mut state = FixState::Compiling;
        let mut current = document.to_string();
        let mut attempt_number = 1;
        let mut attempts: Vec<CompileAttempt> = Vec::new();
        let mut artifact_ref = None;
        let mut error = None;

        loop {
            match state {
                FixState::Compiling => {
                    if cancel.is_cancelled() {
                        return Err(cancelled());
                    }
                    events.stage(
                        Stage::Compile,
                        Stage::Compile.progress_at(attempt_number - 1, self.max_retries + 1),
                        format!("Compile attempt {}", attempt_number),
                    );

                    let (outcome, persisted) = match self.compile_once(&current, cancel).await {
                        Ok(compiled) => compiled,
                        Err(CompileError::Cancelled) => return Err(cancelled()),
                        Err(CompileError::Timeout(secs)) => (
                            CompileOutput {
                                success: false,
                                artifact: None,
                                log: String::new(),
                                diagnostics: vec![Diagnostic::unknown(format!(
                                    "Compiler timed out after {}s",
                                    secs
                                ))],
                            },
                            None,
                        ),
                        Err(e) => {
                            warn!(attempt = attempt_number, error = %e, "Compiler could not run");
                            attempts.push(CompileAttempt {
                                attempt_number,
                                document_snapshot: current.clone(),
                                outcome: AttemptOutcome::Failure,
                                diagnostics: vec![Diagnostic::unknown(e.to_string())],
                                log: String::new(),
                            });
                            error = Some(PipelineError::Compiler(e));
                            state = FixState::Failed;
                            continue;
                        }
                    };

                    attempts.push(CompileAttempt {
                        attempt_number,
                        document_snapshot: current.clone(),
                        outcome: if outcome.success {
                            AttemptOutcome::Success
                        } else {
                            AttemptOutcome::Failure
                        },
                        diagnostics: outcome.diagnostics,
                        log: outcome.log,
                    });

                    if outcome.success {
                        info!(attempt = attempt_number, "Compile succeeded");
                        artifact_ref = persisted;
                        state = FixState::Success;
                    } else if self.auto_fix
                        && self.gateway.is_some()
                        && attempt_number <= self.max_retries
                    {
                        state = FixState::Fixing;
                    } else {
                        let message = attempts
                            .last()
                            .map(|a| self.summarize(a))
                            .unwrap_or_default();
                        error = Some(PipelineError::Compile {
                            attempts: attempts.len(),
                            message,
                        });
                        state = FixState::Failed;
                    }
                }
                FixState::Fixing => {
                    let Some(failed) = attempts.last() else {
                        state = FixState::Failed;
                        continue;
                    };
                    let diagnostics = self.summarize(failed);
                    match self.request_fix(&current, &diagnostics, attempt_number, cancel).await {
                        Ok(revised) => {
                            events.emit(PipelineEvent::Fix {
                                attempt_number,
                                message: format!(
                                    "Revised document after failed attempt {}",
                                    attempt_number
                                ),
                                revised_snapshot: revised.clone(),
                            });
                            current = revised;
                            attempt_number += 1;
                            state = FixState::Compiling;
                        }
                        Err(e) if e.is_cancellation() => return Err(e),
                        Err(e) => {
                            warn!(attempt = attempt_number, error = %e, "Automated fix failed");
                            error = Some(e);
                            state = FixState::Failed;
                        }
                    }
                }
                FixState::Success | FixState::Failed => break,
            }
        }

        Ok(FixLoopReport {
            state,
            changed: current != document,
            document: current,
            artifact_ref,
            attempts,
            error,
        })
    }

    async fn compile_once(
        &self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<(CompileOutput, Option<PathBuf>), CompileError> {
        let workdir = CompileWorkdir::create(self.work_root.as_deref(), &self.support_dirs)?;
        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CompileError::Cancelled),
            output = self.compiler.compile(text, CompileMode::Full, workdir.path()) => output?,
        };
        let persisted = match (&output.artifact, &self.artifact_dir) {
            (Some(artifact), Some(dir)) if output.success => {
                Some(persist_artifact(artifact, dir, text)?)
            }
            _ => None,
        };
        Ok((output, persisted))
    }

    async fn request_fix(
        &self,
        document: &str,
        diagnostics: &str,
        attempt_number: usize,
        cancel: &CancellationToken,
    ) -> Result<String, PipelineError> {
        let Some(gateway) = &self.gateway else {
            return Err(PipelineError::FixGeneration("no gateway configured".to_string()));
        };
        let messages = prompts::fix(document, diagnostics, attempt_number);
        let options = CompletionOptions::default().with_temperature(0.2);
        let work = async {
            let response = gateway.complete(messages, options).await?;
            Ok::<_, PipelineError>(response.content)
        };
        let reply = match guarded(cancel, self.fix_timeout, Stage::Compile, work).await {
            Ok(reply) => reply,
            Err(e) if e.is_cancellation() => return Err(e),
            Err(e) => return Err(PipelineError::FixGeneration(e.to_string())),
        };

        if let Some(reason) = reply.trim().strip_prefix(prompts::UNFIXABLE_MARKER) {
            return Err(PipelineError::FixGeneration(format!(
                "reported unfixable: {}",
                reason.trim()
            )));
        }
        let revised = extract_latex(&reply);
        if revised.is_empty() {
            return Err(PipelineError::FixGeneration("empty revision".to_string()));
        }
        if revised.trim() == document.trim() {
            return Err(PipelineError::FixGeneration(
                "revision is identical to the failing document".to_string(),
            ));
        }
        Ok(revised)
    }

    fn summarize(&self, attempt: &CompileAttempt) -> String {
        if attempt.diagnostics.is_empty() {
            log_tail(&attempt.log, LOG_TAIL_LINES)
        } else {
            format_for_prompt(&attempt.diagnostics, self.max_prompt_diagnostics)
        }
    }
}

fn cancelled() -> PipelineError {
    PipelineError::Cancelled {
        stage: Stage::Compile.to_string(),
    }
}

/// Copy the artifact out of the disposable working directory under a content-derived name.
fn persist_artifact(artifact: &Path, dir: &Path, text: &str) -> Result<PathBuf, CompileError> {
    std::fs::create_dir_all(dir)?;
    let digest = hex::encode(blake3::hash(text.as_bytes()).as_bytes());
    let extension = artifact
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("pdf");
    let target = dir.join(format!("document-{}.{}", &digest[..12], extension));
    std::fs::copy(artifact, &target)?;
    Ok(target)
}
