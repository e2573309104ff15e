//! Outline planning stage.

use super::types::{AnalysisResult, AppendixSpec, ChapterSpec, Outline, Stage};
use super::{guarded, prompts};
use crate::config::PipelineSettings;
use crate::error::PipelineError;
use crate::extract::extract_json_payload;
use crate::provider::{ChatMessage, CompletionOptions, ModelProviderClient};
use crate::template::Template;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Deserialize)]
struct OutlinePayload {
    #[serde(default)]
    title: String,
    #[serde(default)]
    author: String,
    #[serde(default, rename = "abstract", alias = "abstract_text")]
    abstract_text: String,
    chapters: Vec<ChapterPayload>,
    #[serde(default)]
    appendices: Vec<AppendixPayload>,
}

#[derive(Debug, Deserialize)]
struct ChapterPayload {
    #[serde(default)]
    title: String,
    #[serde(default)]
    level: Option<u8>,
    #[serde(default, alias = "source_refs")]
    source_docs: Vec<SourceRef>,
    #[serde(default, alias = "generation_instructions", alias = "instructions")]
    description: String,
    #[serde(default)]
    subsections: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SourceRef {
    Position(u64),
    Id(String),
}

#[derive(Debug, Deserialize)]
struct AppendixPayload {
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
}

/// Documents the planner sees.
///
/// Only successful analyses are shown when at least one exists; otherwise the degraded
/// ones (carrying source excerpts) stand in so the run can still proceed.
pub fn planner_inputs(analyses: &[AnalysisResult]) -> Vec<&AnalysisResult> {
    let healthy: Vec<&AnalysisResult> = analyses.iter().filter(|a| !a.degraded).collect();
    if healthy.is_empty() {
        analyses.iter().collect()
    } else {
        healthy
    }
}

pub struct OutlinePlanner {
    gateway: Arc<dyn ModelProviderClient>,
    timeout: Duration,
}

impl OutlinePlanner {
    pub fn new(gateway: Arc<dyn ModelProviderClient>, settings: &PipelineSettings) -> Self {
        Self {
            gateway,
            timeout: settings.outline_timeout(),
        }
    }

    /// One planning call, plus one repair call when the reply cannot be parsed.
    pub async fn plan(
        &self,
        analyses: &[AnalysisResult],
        template: &Template,
        cancel: &CancellationToken,
    ) -> Result<Outline, PipelineError> {
        let visible = planner_inputs(analyses);
        let reply = self.call(prompts::outline(&visible, template), cancel).await?;

        let parse_error = match parse_outline(&reply, &visible) {
            Ok(outline) => return Ok(outline),
            Err(e) => e,
        };
        warn!(error = %parse_error, "Outline reply unparseable, requesting repair");

        let repaired = self
            .call(prompts::outline_repair(&reply, &parse_error), cancel)
            .await?;
        let outline = parse_outline(&repaired, &visible).map_err(PipelineError::OutlineParse)?;
        info!(chapters = outline.chapters.len(), "Outline repaired");
        Ok(outline)
    }

    async fn call(
        &self,
        messages: Vec<ChatMessage>,
        cancel: &CancellationToken,
    ) -> Result<String, PipelineError> {
        let options = CompletionOptions::default().with_temperature(0.3);
        let work = async {
            let response = self.gateway.complete(messages, options).await?;
            Ok::<_, PipelineError>(response.content)
        };
        guarded(cancel, self.timeout, Stage::Outline, work).await
    }
}

/// Parse a planner reply. `visible` numbers the documents for 1-based references.
pub fn parse_outline(reply: &str, visible: &[&AnalysisResult]) -> Result<Outline, String> {
    let payload: OutlinePayload = extract_json_payload(reply).map_err(|e| e.to_string())?;
    if payload.chapters.is_empty() {
        return Err("outline has no chapters".to_string());
    }

    let chapters = payload
        .chapters
        .into_iter()
        .enumerate()
        .map(|(index, chapter)| {
            let title = if chapter.title.trim().is_empty() {
                format!("Chapter {}", index + 1)
            } else {
                chapter.title.trim().to_string()
            };
            ChapterSpec {
                index,
                title,
                level: chapter.level.unwrap_or(1).clamp(1, 4),
                source_refs: resolve_refs(&chapter.source_docs, visible),
                generation_instructions: instructions(&chapter.description, &chapter.subsections),
            }
        })
        .collect();

    let appendices = payload
        .appendices
        .into_iter()
        .filter(|a| !a.title.trim().is_empty())
        .map(|a| AppendixSpec {
            title: a.title.trim().to_string(),
            description: a.description,
        })
        .collect();

    Ok(Outline {
        title: payload.title,
        author: payload.author,
        abstract_text: payload.abstract_text,
        chapters,
        appendices,
    })
}

fn resolve_refs(refs: &[SourceRef], visible: &[&AnalysisResult]) -> Vec<String> {
    let by_position = |position: u64| {
        usize::try_from(position)
            .ok()
            .and_then(|p| p.checked_sub(1))
            .and_then(|p| visible.get(p))
            .map(|a| a.document_id.clone())
    };

    let mut resolved: Vec<String> = Vec::new();
    for source in refs {
        let id = match source {
            SourceRef::Position(position) => by_position(*position),
            SourceRef::Id(id) => visible
                .iter()
                .find(|a| a.document_id == *id)
                .map(|a| a.document_id.clone())
                .or_else(|| id.trim().parse().ok().and_then(by_position)),
        };
        match id {
            Some(id) if !resolved.contains(&id) => resolved.push(id),
            Some(_) => {}
            None => warn!(reference = ?source, "Dropping unknown source reference"),
        }
    }
    resolved
}

fn instructions(description: &str, subsections: &[Value]) -> String {
    let titles: Vec<&str> = subsections
        .iter()
        .filter_map(|s| match s {
            Value::String(title) => Some(title.as_str()),
            Value::Object(map) => map.get("title").and_then(Value::as_str),
            _ => None,
        })
        .collect();
    let mut text = description.trim().to_string();
    if !titles.is_empty() {
        if !text.is_empty() {
            text.push(' ');
        }
        text.push_str(&format!("Cover these subsections: {}.", titles.join("; ")));
    }
    text
}
