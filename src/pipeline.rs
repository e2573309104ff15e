//! Generation Pipeline
//!
//! Staged conversion of source documents into a compiled LaTeX document:
//! analyze → outline → chapters → assemble → compile/fix. Stages run strictly in
//! sequence; the analyze and chapters stages fan out under a width bound.

use crate::error::PipelineError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub mod analyze;
pub mod assemble;
pub mod chapters;
pub mod events;
pub mod fanout;
pub mod fix_loop;
pub mod orchestrator;
pub mod outline;
pub mod prompts;
pub mod types;
pub mod validate;

#[cfg(test)]
pub(crate) mod testing;

pub use events::{EventReceiver, EventSink, PipelineEvent};
pub use fix_loop::{FixLoop, FixLoopReport, FixState};
pub use orchestrator::{PipelineHandle, PipelineOrchestrator};
pub use types::{
    AnalysisResult, AppendixSpec, AssembledDocument, AttemptOutcome, ChapterSpec, ChapterStatus,
    CompileAttempt, DocumentSection, GeneratedChapter, Outline, PipelineRun, RunOutcome,
    SourceDocument, Stage,
};

/// Race `work` against the cancellation token and a deadline.
pub(crate) async fn guarded<T, F>(
    cancel: &CancellationToken,
    limit: Duration,
    stage: Stage,
    work: F,
) -> Result<T, PipelineError>
where
    F: Future<Output = Result<T, PipelineError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipelineError::Cancelled {
            stage: stage.to_string(),
        }),
        result = tokio::time::timeout(limit, work) => result.unwrap_or_else(|_| {
            Err(PipelineError::Timeout {
                stage: stage.to_string(),
            })
        }),
    }
}
