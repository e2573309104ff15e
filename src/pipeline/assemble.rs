//! Document assembly.
//!
//! Fragments are placed in outline order regardless of the order chapters finished in.

use super::chapters::placeholder;
use super::types::{AssembledDocument, GeneratedChapter, Outline};
use crate::template::{escape_latex, FrontMatter, Template};
use tracing::warn;

/// Build the document frame around the chapters.
///
/// Every outline chapter gets exactly one fragment; a chapter missing from
/// `chapters` is filled with a placeholder.
pub fn assemble(
    template: &Template,
    outline: &Outline,
    chapters: &[GeneratedChapter],
) -> AssembledDocument {
    let commands = template.section_commands();
    let front = FrontMatter {
        title: outline.title.clone(),
        author: outline.author.clone(),
        abstract_text: outline.abstract_text.clone(),
    };

    let fragments = outline
        .chapters
        .iter()
        .map(|spec| {
            match chapters.iter().find(|c| c.chapter_index == spec.index) {
                Some(chapter) => chapter.fragment_text.clone(),
                None => {
                    warn!(chapter_index = spec.index, "No generated text for chapter");
                    placeholder(commands.for_level(spec.level), &spec.title, "missing")
                }
            }
        })
        .collect();

    let appendix = if outline.appendices.is_empty() {
        String::new()
    } else {
        let mut text = String::from("\\appendix\n");
        for appendix in &outline.appendices {
            text.push_str(&format!(
                "\n{}{{{}}}\n{}\n",
                commands.top,
                escape_latex(&appendix.title),
                escape_latex(appendix.description.trim())
            ));
        }
        text
    };

    AssembledDocument {
        preamble: template.render_preamble(&front),
        fragments,
        appendix,
        postamble: template.postamble.clone(),
    }
}
