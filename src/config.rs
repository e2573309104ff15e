//! Configuration System
//!
//! Layered configuration for the generation pipeline: merge-policy defaults, the
//! global config file, workspace config files, then `DOCFORGE__*` environment
//! overrides. Validation collects every problem instead of stopping at the first.

use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub use crate::provider::{ProviderConfig, ProviderType};

mod facade;
mod merge;
mod sources;

pub use facade::ConfigLoader;
pub use sources::global_file::global_config_path;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocforgeConfig {
    /// LLM gateway used by every pipeline stage
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Fan-out widths, timeouts and fix-loop policy
    #[serde(default)]
    pub pipeline: PipelineSettings,

    /// Typesetting engine invocation
    #[serde(default)]
    pub compiler: CompilerSettings,

    /// Template registry locations
    #[serde(default)]
    pub templates: TemplateSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Orchestration policy for one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    /// Maximum concurrent document analysis calls
    #[serde(default = "default_batch_size_analysis")]
    pub batch_size_analysis: usize,

    /// Maximum concurrent chapter generation tasks
    #[serde(default = "default_batch_size_chapters")]
    pub batch_size_chapters: usize,

    #[serde(default = "default_analysis_timeout_secs")]
    pub analysis_timeout_secs: u64,

    #[serde(default = "default_outline_timeout_secs")]
    pub outline_timeout_secs: u64,

    /// Bound on a single chapter generation call (each retry gets its own budget)
    #[serde(default = "default_chapter_timeout_secs")]
    pub chapter_timeout_secs: u64,

    #[serde(default = "default_fix_timeout_secs")]
    pub fix_timeout_secs: u64,

    /// Fix-loop retry limit; at most `max_retries + 1` full compiles per run
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    #[serde(default = "default_true")]
    pub auto_fix: bool,

    /// Draft-compile each chapter before assembly
    #[serde(default = "default_true")]
    pub validate_chapters: bool,

    /// Diagnostics forwarded to repair prompts
    #[serde(default = "default_max_prompt_diagnostics")]
    pub max_prompt_diagnostics: usize,

    /// Where successful compile artifacts are copied; none keeps no artifact
    #[serde(default)]
    pub artifact_dir: Option<PathBuf>,
}

fn default_batch_size_analysis() -> usize {
    10
}

fn default_batch_size_chapters() -> usize {
    8
}

fn default_analysis_timeout_secs() -> u64 {
    180
}

fn default_outline_timeout_secs() -> u64 {
    180
}

fn default_chapter_timeout_secs() -> u64 {
    300
}

fn default_fix_timeout_secs() -> u64 {
    300
}

fn default_max_retries() -> usize {
    2
}

fn default_max_prompt_diagnostics() -> usize {
    10
}

fn default_true() -> bool {
    true
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            batch_size_analysis: default_batch_size_analysis(),
            batch_size_chapters: default_batch_size_chapters(),
            analysis_timeout_secs: default_analysis_timeout_secs(),
            outline_timeout_secs: default_outline_timeout_secs(),
            chapter_timeout_secs: default_chapter_timeout_secs(),
            fix_timeout_secs: default_fix_timeout_secs(),
            max_retries: default_max_retries(),
            auto_fix: true,
            validate_chapters: true,
            max_prompt_diagnostics: default_max_prompt_diagnostics(),
            artifact_dir: None,
        }
    }
}

impl PipelineSettings {
    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_secs(self.analysis_timeout_secs)
    }

    pub fn outline_timeout(&self) -> Duration {
        Duration::from_secs(self.outline_timeout_secs)
    }

    pub fn chapter_timeout(&self) -> Duration {
        Duration::from_secs(self.chapter_timeout_secs)
    }

    pub fn fix_timeout(&self) -> Duration {
        Duration::from_secs(self.fix_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size_analysis == 0 {
            return Err("batch_size_analysis must be at least 1".to_string());
        }
        if self.batch_size_chapters == 0 {
            return Err("batch_size_chapters must be at least 1".to_string());
        }
        let timeouts = [
            ("analysis_timeout_secs", self.analysis_timeout_secs),
            ("outline_timeout_secs", self.outline_timeout_secs),
            ("chapter_timeout_secs", self.chapter_timeout_secs),
            ("fix_timeout_secs", self.fix_timeout_secs),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, secs)| *secs == 0) {
            return Err(format!("{} must be greater than zero", name));
        }
        Ok(())
    }
}

/// Typesetting engine commands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerSettings {
    /// Draft (structure-only) pass program
    #[serde(default = "default_draft_program")]
    pub draft_program: String,

    #[serde(default = "default_draft_args")]
    pub draft_args: Vec<String>,

    /// Full pass program, resolves references and the table of contents
    #[serde(default = "default_full_program")]
    pub full_program: String,

    #[serde(default = "default_full_args")]
    pub full_args: Vec<String>,

    #[serde(default = "default_compile_timeout_secs")]
    pub timeout_secs: u64,

    /// Parent for per-attempt working directories (system temp dir when unset)
    #[serde(default)]
    pub work_root: Option<PathBuf>,
}

fn default_draft_program() -> String {
    "xelatex".to_string()
}

fn default_draft_args() -> Vec<String> {
    vec![
        "-interaction=nonstopmode".to_string(),
        "-halt-on-error".to_string(),
        "-draftmode".to_string(),
    ]
}

fn default_full_program() -> String {
    "latexmk".to_string()
}

fn default_full_args() -> Vec<String> {
    vec![
        "-xelatex".to_string(),
        "-interaction=nonstopmode".to_string(),
        "-halt-on-error".to_string(),
        "-file-line-error".to_string(),
    ]
}

fn default_compile_timeout_secs() -> u64 {
    120
}

impl Default for CompilerSettings {
    fn default() -> Self {
        Self {
            draft_program: default_draft_program(),
            draft_args: default_draft_args(),
            full_program: default_full_program(),
            full_args: default_full_args(),
            timeout_secs: default_compile_timeout_secs(),
            work_root: None,
        }
    }
}

impl CompilerSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.draft_program.trim().is_empty() || self.full_program.trim().is_empty() {
            return Err("Compiler programs cannot be empty".to_string());
        }
        if self.timeout_secs == 0 {
            return Err("Compiler timeout must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Template registry locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateSettings {
    /// Read-only template roots, scanned in order
    #[serde(default = "default_template_dirs")]
    pub dirs: Vec<PathBuf>,

    /// Writable root for user templates
    #[serde(default = "default_custom_dir")]
    pub custom_dir: PathBuf,
}

fn default_template_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("templates/builtin")]
}

fn default_custom_dir() -> PathBuf {
    PathBuf::from("templates/custom")
}

impl Default for TemplateSettings {
    fn default() -> Self {
        Self {
            dirs: default_template_dirs(),
            custom_dir: default_custom_dir(),
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Clone)]
pub enum ValidationError {
    Provider(String),
    Pipeline(String),
    Compiler(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Provider(msg) => write!(f, "Provider: {}", msg),
            ValidationError::Pipeline(msg) => write!(f, "Pipeline: {}", msg),
            ValidationError::Compiler(msg) => write!(f, "Compiler: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl DocforgeConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if let Err(e) = self.provider.validate() {
            errors.push(ValidationError::Provider(e));
        }
        if let Err(e) = self.pipeline.validate() {
            errors.push(ValidationError::Pipeline(e));
        }
        if let Err(e) = self.compiler.validate() {
            errors.push(ValidationError::Compiler(e));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
