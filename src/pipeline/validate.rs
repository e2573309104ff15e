//! Draft-mode validation gate for chapter candidates.

use crate::compiler::{CompileMode, CompileWorkdir, CompilerInvoker, Diagnostic};
use crate::error::CompileError;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub passed: bool,
    pub diagnostics: Vec<Diagnostic>,
    pub log: String,
}

impl ValidationReport {
    fn skipped() -> Self {
        Self {
            passed: true,
            diagnostics: Vec::new(),
            log: String::new(),
        }
    }
}

/// Wraps a fragment in the document frame and compiles it in draft mode.
pub struct ChapterValidator {
    compiler: Arc<dyn CompilerInvoker>,
    enabled: bool,
    preamble: String,
    postamble: String,
    support_dirs: Vec<PathBuf>,
    work_root: Option<PathBuf>,
}

impl ChapterValidator {
    pub fn new(
        compiler: Arc<dyn CompilerInvoker>,
        preamble: String,
        postamble: String,
        support_dirs: Vec<PathBuf>,
    ) -> Self {
        Self {
            compiler,
            enabled: true,
            preamble,
            postamble,
            support_dirs,
            work_root: None,
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_work_root(mut self, work_root: Option<PathBuf>) -> Self {
        self.work_root = work_root;
        self
    }

    /// Full candidate text for a fragment.
    pub fn frame(&self, fragment: &str) -> String {
        format!(
            "{}\n\n{}\n\n{}",
            self.preamble.trim_end(),
            fragment.trim(),
            self.postamble
        )
    }

    /// Draft-compile `fragment` in a fresh working directory.
    pub async fn validate(
        &self,
        fragment: &str,
        cancel: &CancellationToken,
    ) -> Result<ValidationReport, CompileError> {
        if !self.enabled {
            return Ok(ValidationReport::skipped());
        }
        let workdir = CompileWorkdir::create(self.work_root.as_deref(), &self.support_dirs)?;
        let candidate = self.frame(fragment);
        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CompileError::Cancelled),
            output = self.compiler.compile(&candidate, CompileMode::Draft, workdir.path()) => output?,
        };
        Ok(ValidationReport {
            passed: output.success,
            diagnostics: output.diagnostics,
            log: output.log,
        })
    }
}
