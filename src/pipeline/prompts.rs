//! Prompt construction for each gateway call.

use super::types::{AnalysisResult, ChapterSpec, Outline, SourceDocument};
use crate::provider::ChatMessage;
use crate::template::{SectionCommands, Template};

/// Characters of a source document included in a single prompt
pub const PROMPT_SOURCE_CHARS: usize = 12_000;

/// Reply prefix a repair call uses to decline
pub const UNFIXABLE_MARKER: &str = "UNFIXABLE:";

const LATEX_SYSTEM: &str = "You are an expert LaTeX author. Output only LaTeX that compiles with \
xelatex. Never wrap the answer in explanations.";

const JSON_SYSTEM: &str = "You are a meticulous analyst. Reply with a single JSON object and \
nothing else.";

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte, _)) => &text[..byte],
        None => text,
    }
}

pub fn analysis(document: &SourceDocument, chunk: &str, part: usize, parts: usize) -> Vec<ChatMessage> {
    let mut prompt = format!("Analyze the document \"{}\"", document.name);
    if parts > 1 {
        prompt.push_str(&format!(" (part {} of {})", part, parts));
    }
    prompt.push_str(
        ".\nReturn JSON with keys: \"title\" (string), \"summary\" (string, at most 300 words), \
         \"key_topics\" (array of strings), \"key_points\" (array of strings).\n\n",
    );
    if !document.sections.is_empty() {
        prompt.push_str("Sections:\n");
        for section in &document.sections {
            prompt.push_str(&format!("- {}\n", section.heading));
        }
        prompt.push('\n');
    }
    prompt.push_str("Content:\n");
    prompt.push_str(chunk);
    vec![ChatMessage::system(JSON_SYSTEM), ChatMessage::user(prompt)]
}

pub fn outline(analyses: &[&AnalysisResult], template: &Template) -> Vec<ChatMessage> {
    let commands = template.section_commands();
    let mut prompt = format!(
        "Plan one coherent document that integrates the {} source documents below.\n\
         The template is \"{}\" (document class `{}`); top-level units use `{}`.\n\n",
        analyses.len(),
        template.name,
        template.doc_class_type,
        commands.top
    );
    for (position, analysis) in analyses.iter().enumerate() {
        prompt.push_str(&format!(
            "[{}] id={} title={}\nsummary: {}\n",
            position + 1,
            analysis.document_id,
            analysis.title,
            analysis.summary
        ));
        if !analysis.key_topics.is_empty() {
            prompt.push_str(&format!("topics: {}\n", analysis.key_topics.join(", ")));
        }
        prompt.push('\n');
    }
    prompt.push_str(
        "Return JSON: {\"title\": string, \"author\": string, \"abstract\": string, \
         \"chapters\": [{\"title\": string, \"level\": 1, \"source_docs\": [document numbers or ids], \
         \"description\": string}], \"appendices\": [{\"title\": string, \"description\": string}]}. \
         Every chapter must list at least one source document.",
    );
    vec![ChatMessage::system(JSON_SYSTEM), ChatMessage::user(prompt)]
}

pub fn outline_repair(previous_reply: &str, parse_error: &str) -> Vec<ChatMessage> {
    let prompt = format!(
        "Your previous outline could not be parsed: {}\n\n\
         Previous reply:\n{}\n\n\
         Reply again with only the corrected JSON object, including a non-empty \"chapters\" array.",
        parse_error,
        truncate(previous_reply, PROMPT_SOURCE_CHARS)
    );
    vec![ChatMessage::system(JSON_SYSTEM), ChatMessage::user(prompt)]
}

pub fn chapter(
    outline: &Outline,
    spec: &ChapterSpec,
    sources: &[&SourceDocument],
    commands: SectionCommands,
    feedback: Option<&str>,
) -> Vec<ChatMessage> {
    let mut prompt = format!(
        "Write chapter {} of {} of the document \"{}\": \"{}\".\n\
         Start with `{}{{{}}}` and use `{}`, `{}` and `{}` for deeper levels.\n\
         Output only the chapter body: no \\documentclass, no preamble, no \\begin{{document}}.\n",
        spec.index + 1,
        outline.chapters.len(),
        outline.title,
        spec.title,
        commands.for_level(spec.level),
        spec.title,
        commands.second,
        commands.third,
        commands.fourth
    );
    if !spec.generation_instructions.is_empty() {
        prompt.push_str(&format!("Guidance: {}\n", spec.generation_instructions));
    }
    prompt.push_str("\nSource material:\n");
    for source in sources {
        prompt.push_str(&format!(
            "=== {} ===\n{}\n\n",
            source.name,
            truncate(&source.text, PROMPT_SOURCE_CHARS)
        ));
    }
    if let Some(feedback) = feedback {
        prompt.push_str(&format!(
            "\nThe previous attempt failed:\n{}\nAvoid repeating these problems.\n",
            feedback
        ));
    }
    vec![ChatMessage::system(LATEX_SYSTEM), ChatMessage::user(prompt)]
}

pub fn fix(document: &str, diagnostics: &str, attempt_number: usize) -> Vec<ChatMessage> {
    let prompt = format!(
        "Compile attempt {} of this LaTeX document failed.\n\nErrors:\n{}\n\n\
         Return the complete corrected document. If the errors come from the environment \
         (missing fonts or packages) rather than the document, reply with `{} <reason>` instead.\n\n\
         Document:\n{}",
        attempt_number, diagnostics, UNFIXABLE_MARKER, document
    );
    vec![ChatMessage::system(LATEX_SYSTEM), ChatMessage::user(prompt)]
}
