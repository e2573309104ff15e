//! CLI output: event lines, template tables and error mapping.

use crate::pipeline::{FixLoopReport, PipelineEvent, PipelineRun};
use crate::template::Template;
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use owo_colors::OwoColorize;

/// Map an error chain to a single CLI line.
pub fn map_error(e: &anyhow::Error) -> String {
    format!("{} {:#}", "error:".red().bold(), e)
}

/// One human-readable line per pipeline event.
pub fn format_event(event: &PipelineEvent) -> String {
    match event {
        PipelineEvent::Stage {
            name,
            message,
            progress,
        } => format!("[{:>3}%] {} {}", progress, name.cyan(), message),
        PipelineEvent::Outline { structure } => format!(
            "{} \"{}\" with {} chapter(s)",
            "outline".cyan(),
            structure.title,
            structure.chapters.len()
        ),
        PipelineEvent::Chunk {
            chapter_index,
            text,
        } => format!(
            "{} chapter {} ({} chars)",
            "chunk".dimmed(),
            chapter_index + 1,
            text.chars().count()
        ),
        PipelineEvent::Fix {
            attempt_number,
            message,
            ..
        } => format!("{} attempt {}: {}", "fix".yellow(), attempt_number, message),
        PipelineEvent::Done {
            attempts, warnings, ..
        } => format!(
            "{} after {} compile attempt(s), {} warning(s)",
            "done".green().bold(),
            attempts,
            warnings.len()
        ),
        PipelineEvent::Error { stage, message } => {
            format!("{} during {}: {}", "failed".red().bold(), stage, message)
        }
    }
}

pub fn format_run_summary(run: &PipelineRun) -> String {
    let mut lines = vec![format!("run {}", run.run_id.bold())];
    if let Some(artifact) = &run.artifact_ref {
        lines.push(format!("artifact: {}", artifact.display()));
    }
    for warning in &run.warnings {
        lines.push(format!("{} {}", "warning:".yellow(), warning));
    }
    lines.join("\n")
}

pub fn format_fix_report(report: &FixLoopReport) -> String {
    let status = if report.succeeded() {
        "compiled".green().bold().to_string()
    } else {
        "failed".red().bold().to_string()
    };
    let mut lines = vec![format!("{} after {} attempt(s)", status, report.attempts.len())];
    if let Some(artifact) = &report.artifact_ref {
        lines.push(format!("artifact: {}", artifact.display()));
    }
    if let Some(error) = &report.error {
        lines.push(error.to_string());
    }
    lines.join("\n")
}

pub fn format_templates_text(templates: &[Template]) -> String {
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Id", "Name", "Class", "Source", "Description"]);
    for template in templates {
        table.add_row(vec![
            template.id.as_str(),
            template.name.as_str(),
            template.doc_class_type.as_str(),
            if template.is_builtin { "builtin" } else { "custom" },
            template.description.as_str(),
        ]);
    }
    table.to_string()
}

pub fn format_templates_json(templates: &[Template]) -> Result<String, serde_json::Error> {
    let rows: Vec<serde_json::Value> = templates
        .iter()
        .map(|t| {
            serde_json::json!({
                "id": t.id,
                "name": t.name,
                "doc_class_type": t.doc_class_type,
                "builtin": t.is_builtin,
                "description": t.description,
            })
        })
        .collect();
    serde_json::to_string_pretty(&rows)
}
