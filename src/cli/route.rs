//! CLI route: single route table and run context. Dispatches to the pipeline, the
//! fix loop and the template registry.

use crate::cli::output::{
    format_event, format_fix_report, format_run_summary, format_templates_json,
    format_templates_text,
};
use crate::cli::parse::Commands;
use crate::compiler::{CompilerInvoker, LatexCompiler};
use crate::config::{ConfigLoader, DocforgeConfig, PipelineSettings};
use crate::pipeline::{
    EventSink, FixLoop, PipelineOrchestrator, RunOutcome, SourceDocument,
};
use crate::provider::{ModelProviderClient, ProviderFactory};
use crate::template::{FsTemplateRegistry, TemplateProvider};
use anyhow::{bail, Context};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Runtime context for CLI execution: workspace root and loaded configuration.
pub struct RunContext {
    workspace_root: PathBuf,
    config: DocforgeConfig,
}

impl RunContext {
    /// Create run context from workspace root and optional config path. Uses ConfigLoader only.
    pub fn new(workspace_root: PathBuf, config_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let config = match config_path {
            Some(ref path) => ConfigLoader::load_from_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => ConfigLoader::load(&workspace_root).context("Failed to load config")?,
        };
        config.pipeline.validate().map_err(anyhow::Error::msg)?;
        config.compiler.validate().map_err(anyhow::Error::msg)?;
        Ok(Self {
            workspace_root,
            config,
        })
    }

    /// Execute a CLI command via the single route table.
    pub async fn execute(&self, command: &Commands) -> anyhow::Result<String> {
        match command {
            Commands::Generate {
                template,
                files,
                output,
                json_events,
            } => {
                self.generate(template, files, output.as_deref(), *json_events)
                    .await
            }
            Commands::Compile {
                file,
                template,
                no_fix,
                max_retries,
            } => self.compile(file, template, *no_fix, *max_retries).await,
            Commands::Templates { format } => self.templates(format),
        }
    }

    async fn generate(
        &self,
        template_id: &str,
        files: &[PathBuf],
        output: Option<&Path>,
        json_events: bool,
    ) -> anyhow::Result<String> {
        let documents = read_documents(files)?;
        let mut settings = self.config.pipeline.clone();
        if settings.artifact_dir.is_none() {
            settings.artifact_dir = Some(artifact_dir_for(output, &self.workspace_root));
        }
        let orchestrator = PipelineOrchestrator::new(
            self.gateway()?,
            self.compiler(),
            self.registry(),
            settings,
        )
        .with_work_root(self.config.compiler.work_root.clone());

        let cancel = cancel_on_ctrl_c();
        let mut handle = orchestrator.run(documents, template_id, cancel);
        while let Some(event) = handle.events.next().await {
            if json_events {
                println!("{}", serde_json::to_string(&event)?);
            } else {
                eprintln!("{}", format_event(&event));
            }
        }
        let run = handle.task.await.context("Pipeline task failed")?;

        match &run.outcome {
            Some(RunOutcome::Completed) => {}
            Some(RunOutcome::Failed { stage, reason }) => {
                if let (Some(path), Some(document)) = (output, run.final_document.as_deref()) {
                    std::fs::write(path, document)?;
                    warn!(path = %path.display(), "Wrote last uncompiled document");
                }
                bail!("Generation failed during {}: {}", stage, reason)
            }
            Some(RunOutcome::Cancelled { stage }) => bail!("Generation cancelled during {}", stage),
            None => bail!("Pipeline ended without an outcome"),
        }

        let document = run.final_document.clone().unwrap_or_default();
        match output {
            Some(path) => {
                std::fs::write(path, &document)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                info!(path = %path.display(), "Wrote generated document");
                Ok(format!(
                    "{}\ndocument: {}",
                    format_run_summary(&run),
                    path.display()
                ))
            }
            None if json_events => Ok(format_run_summary(&run)),
            None => {
                eprintln!("{}", format_run_summary(&run));
                Ok(document)
            }
        }
    }

    async fn compile(
        &self,
        file: &Path,
        template_id: &str,
        no_fix: bool,
        max_retries: Option<usize>,
    ) -> anyhow::Result<String> {
        let document = std::fs::read_to_string(file)
            .with_context(|| format!("Failed to read {}", file.display()))?;
        let template = self.registry().get_template(template_id)?;

        let mut settings: PipelineSettings = self.config.pipeline.clone();
        if no_fix {
            settings.auto_fix = false;
        }
        if let Some(max_retries) = max_retries {
            settings.max_retries = max_retries;
        }
        if settings.artifact_dir.is_none() {
            settings.artifact_dir = Some(artifact_dir_for(Some(file), &self.workspace_root));
        }
        let gateway = if settings.auto_fix {
            Some(self.gateway()?)
        } else {
            None
        };

        let fix_loop = FixLoop::new(self.compiler(), gateway, &settings)
            .with_support_dirs(template.support_dirs.clone())
            .with_work_root(self.config.compiler.work_root.clone());
        let events = EventSink::from_callback(|event| eprintln!("{}", format_event(&event)));
        let report = fix_loop.run(&document, &events, &cancel_on_ctrl_c()).await?;

        let mut summary = format_fix_report(&report);
        if report.changed {
            let revised = repaired_path(file);
            std::fs::write(&revised, &report.document)
                .with_context(|| format!("Failed to write {}", revised.display()))?;
            summary.push_str(&format!("\nrepaired document: {}", revised.display()));
        }
        if !report.succeeded() {
            bail!(summary);
        }
        Ok(summary)
    }

    fn templates(&self, format: &str) -> anyhow::Result<String> {
        let templates = self.registry().list_templates()?;
        match format {
            "json" => Ok(format_templates_json(&templates)?),
            "text" => Ok(format_templates_text(&templates)),
            other => bail!("Unknown format: {} (expected text or json)", other),
        }
    }

    fn gateway(&self) -> anyhow::Result<Arc<dyn ModelProviderClient>> {
        Ok(ProviderFactory::create_client(&self.config.provider)?)
    }

    fn compiler(&self) -> Arc<dyn CompilerInvoker> {
        Arc::new(LatexCompiler::new(self.config.compiler.clone()))
    }

    fn registry(&self) -> Arc<FsTemplateRegistry> {
        Arc::new(FsTemplateRegistry::from_settings(
            &self.config.templates,
            &self.workspace_root,
        ))
    }
}

/// Read each file as one source document; ids follow argument order.
pub fn read_documents(files: &[PathBuf]) -> anyhow::Result<Vec<SourceDocument>> {
    files
        .iter()
        .enumerate()
        .map(|(i, path)| {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            Ok(SourceDocument::new(format!("doc-{}", i + 1), name, text))
        })
        .collect()
}

fn artifact_dir_for(anchor: Option<&Path>, workspace_root: &Path) -> PathBuf {
    anchor
        .and_then(Path::parent)
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| workspace_root.to_path_buf())
}

fn repaired_path(file: &Path) -> PathBuf {
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    file.with_file_name(format!("{}.fixed.tex", stem))
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            trigger.cancel();
        }
    });
    cancel
}
