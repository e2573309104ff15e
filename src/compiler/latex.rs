//! Process-based TeX engine invoker.

use super::log_parser::{parse_log, Diagnostic};
use super::{CompileMode, CompileOutput, CompilerInvoker};
use crate::config::CompilerSettings;
use crate::error::CompileError;
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, instrument};

const SOURCE_FILE: &str = "document.tex";
const LOG_FILE: &str = "document.log";
const ARTIFACT_FILE: &str = "document.pdf";

/// Runs `xelatex` (draft) or `latexmk -xelatex` (full) in the given directory.
pub struct LatexCompiler {
    settings: CompilerSettings,
}

impl LatexCompiler {
    pub fn new(settings: CompilerSettings) -> Self {
        Self { settings }
    }

    fn command_for(&self, mode: CompileMode) -> (&str, &[String]) {
        match mode {
            CompileMode::Draft => (
                self.settings.draft_program.as_str(),
                self.settings.draft_args.as_slice(),
            ),
            CompileMode::Full => (
                self.settings.full_program.as_str(),
                self.settings.full_args.as_slice(),
            ),
        }
    }
}

#[async_trait]
impl CompilerInvoker for LatexCompiler {
    #[instrument(skip(self, text, workdir), fields(bytes = text.len()))]
    async fn compile(
        &self,
        text: &str,
        mode: CompileMode,
        workdir: &Path,
    ) -> Result<CompileOutput, CompileError> {
        tokio::fs::write(workdir.join(SOURCE_FILE), text).await?;

        let (program, args) = self.command_for(mode);
        let child = Command::new(program)
            .args(args)
            .arg(SOURCE_FILE)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CompileError::Spawn {
                program: program.to_string(),
                source,
            })?;

        // dropping the wait future on timeout kills the child
        let output = tokio::time::timeout(self.settings.timeout(), child.wait_with_output())
            .await
            .map_err(|_| CompileError::Timeout(self.settings.timeout_secs))??;

        let log_path = workdir.join(LOG_FILE);
        let log = if log_path.is_file() {
            let bytes = tokio::fs::read(&log_path).await?;
            String::from_utf8_lossy(&bytes).into_owned()
        } else {
            format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            )
        };

        let artifact_path = workdir.join(ARTIFACT_FILE);
        let success = output.status.success()
            && (mode == CompileMode::Draft || artifact_path.is_file());
        let mut diagnostics = parse_log(&log);
        if !success && diagnostics.is_empty() {
            diagnostics.push(Diagnostic::unknown(format!(
                "{} exited with {}",
                program, output.status
            )));
        }
        debug!(success, diagnostics = diagnostics.len(), "Compile finished");

        Ok(CompileOutput {
            success,
            artifact: (success && mode == CompileMode::Full).then_some(artifact_path),
            log,
            diagnostics,
        })
    }
}
