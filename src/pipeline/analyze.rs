//! Document analysis stage.
//!
//! One task per document under the analysis width. Long documents are split at
//! paragraph boundaries and analyzed part by part inside their task; the parts are
//! merged. A failed analysis degrades only its own document.

use super::fanout::{BoundedFanOut, FanOutError};
use super::types::{AnalysisResult, SourceDocument, Stage};
use super::{guarded, prompts};
use crate::config::PipelineSettings;
use crate::error::PipelineError;
use crate::extract::extract_json_payload;
use crate::provider::{CompletionOptions, ModelProviderClient};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Characters per analysis call
pub const ANALYSIS_CHUNK_CHARS: usize = 12_000;

#[derive(Debug, Deserialize)]
struct AnalysisPayload {
    #[serde(default)]
    title: String,
    summary: String,
    #[serde(default)]
    key_topics: Vec<String>,
    #[serde(default)]
    key_points: Vec<String>,
}

pub struct DocumentAnalyzer {
    gateway: Arc<dyn ModelProviderClient>,
    width: usize,
    timeout: Duration,
}

impl DocumentAnalyzer {
    pub fn new(gateway: Arc<dyn ModelProviderClient>, settings: &PipelineSettings) -> Self {
        Self {
            gateway,
            width: settings.batch_size_analysis,
            timeout: settings.analysis_timeout(),
        }
    }

    /// Analyze every document; results come back in input order.
    pub async fn analyze<C>(
        &self,
        documents: &[SourceDocument],
        cancel: &CancellationToken,
        on_result: C,
    ) -> Result<Vec<AnalysisResult>, PipelineError>
    where
        C: FnMut(usize, &AnalysisResult),
    {
        let fanout = BoundedFanOut::new(self.width, cancel.clone());
        let gateway = Arc::clone(&self.gateway);
        let timeout = self.timeout;

        fanout
            .run(
                documents.to_vec(),
                move |_, document, child| {
                    let gateway = Arc::clone(&gateway);
                    async move { analyze_document(gateway, document, timeout, child).await }
                },
                on_result,
            )
            .await
            .map_err(|e| match e {
                FanOutError::Cancelled => PipelineError::Cancelled {
                    stage: Stage::Analyze.to_string(),
                },
                FanOutError::TaskLost { index } => PipelineError::DocumentAnalysis {
                    document_id: documents
                        .get(index)
                        .map(|d| d.id.clone())
                        .unwrap_or_default(),
                    message: e.to_string(),
                },
            })
    }
}

async fn analyze_document(
    gateway: Arc<dyn ModelProviderClient>,
    document: SourceDocument,
    timeout: Duration,
    cancel: CancellationToken,
) -> AnalysisResult {
    match analyze_parts(gateway.as_ref(), &document, timeout, &cancel).await {
        Ok(result) => result,
        Err(e) => {
            warn!(document_id = %document.id, error = %e, "Document analysis degraded");
            AnalysisResult::degraded(&document, e.to_string())
        }
    }
}

/// Each part is its own gateway call with its own `timeout` budget.
async fn analyze_parts(
    gateway: &dyn ModelProviderClient,
    document: &SourceDocument,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<AnalysisResult, PipelineError> {
    let chunks = split_into_chunks(&document.text, ANALYSIS_CHUNK_CHARS);
    let mut parts = Vec::with_capacity(chunks.len());
    let mut last_error = None;

    for (i, chunk) in chunks.iter().enumerate() {
        let messages = prompts::analysis(document, chunk, i + 1, chunks.len());
        let options = CompletionOptions::default().with_temperature(0.2);
        let call = async {
            let response = gateway.complete(messages, options).await?;
            Ok::<_, PipelineError>(response.content)
        };
        let outcome = match guarded(cancel, timeout, Stage::Analyze, call).await {
            Ok(content) => extract_json_payload::<AnalysisPayload>(&content)
                .map_err(|e| format!("malformed analysis: {}", e)),
            Err(e) if e.is_cancellation() => return Err(e),
            Err(e) => Err(e.to_string()),
        };
        match outcome {
            Ok(payload) => parts.push(payload),
            Err(message) => {
                debug!(document_id = %document.id, part = i + 1, %message, "Analysis part failed");
                last_error = Some(message);
            }
        }
    }

    if parts.is_empty() {
        return Err(PipelineError::DocumentAnalysis {
            document_id: document.id.clone(),
            message: last_error.unwrap_or_else(|| "document is empty".to_string()),
        });
    }

    let failed = chunks.len() - parts.len();
    let mut result = merge_parts(document, parts);
    if failed > 0 {
        result.warning = Some(format!(
            "{} of {} parts could not be analyzed",
            failed,
            chunks.len()
        ));
    }
    Ok(result)
}

fn merge_parts(document: &SourceDocument, parts: Vec<AnalysisPayload>) -> AnalysisResult {
    let title = parts
        .iter()
        .map(|p| p.title.trim())
        .find(|t| !t.is_empty())
        .unwrap_or(&document.name)
        .to_string();
    let summary = parts
        .iter()
        .map(|p| p.summary.trim())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    let mut key_topics: Vec<String> = Vec::new();
    let mut key_points = Vec::new();
    for part in parts {
        for topic in part.key_topics {
            if !key_topics.contains(&topic) {
                key_topics.push(topic);
            }
        }
        key_points.extend(part.key_points);
    }

    AnalysisResult {
        document_id: document.id.clone(),
        title,
        summary,
        key_topics,
        key_points,
        degraded: false,
        warning: None,
    }
}

/// Split text into chunks of at most `max_chars` characters, preferring paragraph
/// breaks, then line breaks.
pub fn split_into_chunks(text: &str, max_chars: usize) -> Vec<&str> {
    let mut chunks = Vec::new();
    let mut remaining = text;
    loop {
        let Some((limit, _)) = remaining.char_indices().nth(max_chars) else {
            if !remaining.is_empty() || chunks.is_empty() {
                chunks.push(remaining);
            }
            return chunks;
        };
        let window = &remaining[..limit];
        let split = window
            .rfind("\n\n")
            .or_else(|| window.rfind('\n'))
            .filter(|pos| *pos > 0)
            .unwrap_or(limit);
        chunks.push(&remaining[..split]);
        remaining = remaining[split..].trim_start_matches('\n');
    }
}
