//! Error types for the docforge generation pipeline.
//!
//! Collaborator failures (`GatewayError`, `CompileError`, `TemplateError`) are kept apart
//! from the run-level taxonomy in `PipelineError` so the orchestrator can decide, per
//! stage, whether a failure is isolated or fatal.

use thiserror::Error;

/// LLM gateway failures
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Provider request failed: {0}")]
    RequestFailed(String),

    #[error("Provider authentication failed: {0}")]
    AuthFailed(String),

    #[error("Provider rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Provider model not found: {0}")]
    ModelNotFound(String),

    #[error("Provider request timed out after {0}s")]
    Timeout(u64),

    #[error("Malformed provider response: {0}")]
    Malformed(String),
}

/// Compiler invocation failures. A compile that ran and reported errors is not a
/// `CompileError`; it is a `CompileOutput` with `success == false`.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("Failed to start compiler `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Compiler timed out after {0}s")]
    Timeout(u64),

    #[error("Working directory error: {0}")]
    Workdir(String),

    #[error("Compiler I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Compile cancelled")]
    Cancelled,
}

/// Template lookup failures
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Template not found: {0}")]
    NotFound(String),

    #[error("Invalid template id: {0}")]
    InvalidId(String),

    #[error("Invalid template metadata in {path}: {message}")]
    InvalidMeta { path: String, message: String },

    #[error("Template I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Run-level error taxonomy
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("No source documents supplied")]
    NoDocuments,

    #[error("Document analysis failed for {document_id}: {message}")]
    DocumentAnalysis {
        document_id: String,
        message: String,
    },

    #[error("Outline could not be parsed: {0}")]
    OutlineParse(String),

    #[error("Chapter {chapter_index} generation failed: {message}")]
    ChapterGeneration {
        chapter_index: usize,
        message: String,
    },

    #[error("Chapter {chapter_index} failed validation: {message}")]
    ChapterValidation {
        chapter_index: usize,
        message: String,
    },

    #[error("Compilation failed after {attempts} attempt(s): {message}")]
    Compile { attempts: usize, message: String },

    #[error("Automated fix failed: {0}")]
    FixGeneration(String),

    #[error("Timed out during {stage}")]
    Timeout { stage: String },

    #[error("Run cancelled during {stage}")]
    Cancelled { stage: String },

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Compiler error: {0}")]
    Compiler(#[from] CompileError),

    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// Whether this error is the caller's cancellation signal rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            PipelineError::Cancelled { .. }
                | PipelineError::Compiler(CompileError::Cancelled)
        )
    }
}

impl From<config::ConfigError> for PipelineError {
    fn from(err: config::ConfigError) -> Self {
        PipelineError::Config(err.to_string())
    }
}
