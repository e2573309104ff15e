//! Compiler Invoker
//!
//! The typesetting engine as seen by the pipeline: compile a document text in a
//! working directory, in draft (structure check) or full (artifact) mode.

use crate::error::CompileError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub mod latex;
pub mod log_parser;
pub mod workdir;

pub use latex::LatexCompiler;
pub use log_parser::{Diagnostic, DiagnosticKind};
pub use workdir::CompileWorkdir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompileMode {
    /// Structure-only pass, no artifact
    Draft,
    /// Complete build producing the artifact
    Full,
}

/// Result of a compile that ran to completion
#[derive(Debug, Clone)]
pub struct CompileOutput {
    pub success: bool,
    /// Present only for a successful full compile; lives inside the working directory
    pub artifact: Option<PathBuf>,
    pub log: String,
    pub diagnostics: Vec<Diagnostic>,
}

#[async_trait]
pub trait CompilerInvoker: Send + Sync {
    /// Compile `text` inside `workdir`, which the caller owns exclusively.
    async fn compile(
        &self,
        text: &str,
        mode: CompileMode,
        workdir: &Path,
    ) -> Result<CompileOutput, CompileError>;
}
