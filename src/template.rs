//! Template registry
//!
//! Templates live one per directory under each configured root:
//! `meta.toml` (or `meta.json`), an optional `template.tex` and any support
//! directories the meta file lists. The registry scans once and serves from an
//! explicit cache that `save_custom` / `delete_custom` invalidate.

use crate::config::TemplateSettings;
use crate::error::TemplateError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Id of the always-available built-in article template
pub const DEFAULT_TEMPLATE_ID: &str = "default";

const TEMPLATE_SOURCE: &str = "template.tex";
const END_DOCUMENT: &str = "\\end{document}";
const BEGIN_DOCUMENT: &str = "\\begin{document}";

/// Template asset retrieval
pub trait TemplateProvider: Send + Sync {
    fn get_template(&self, id: &str) -> Result<Template, TemplateError>;

    fn list_templates(&self) -> Result<Vec<Template>, TemplateError>;
}

/// A resolved template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Raw front matter up to `\end{document}`; `None` means the built-in article preamble
    pub preamble: Option<String>,
    pub postamble: String,
    pub doc_class_type: String,
    /// Directories copied into every compile working directory
    pub support_dirs: Vec<PathBuf>,
    pub is_builtin: bool,
}

/// Document-level values substituted into a template's front matter
#[derive(Debug, Clone, Default)]
pub struct FrontMatter {
    pub title: String,
    pub author: String,
    pub abstract_text: String,
}

impl FrontMatter {
    /// Copy safe to place inside `\title{}` and friends.
    pub fn escaped(&self) -> Self {
        Self {
            title: escape_latex(&self.title),
            author: escape_latex(&self.author),
            abstract_text: escape_latex(&self.abstract_text),
        }
    }
}

/// Sectioning commands for a document class, outermost first
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionCommands {
    pub top: &'static str,
    pub second: &'static str,
    pub third: &'static str,
    pub fourth: &'static str,
}

impl SectionCommands {
    pub fn for_class(doc_class: &str) -> Self {
        match doc_class {
            "report" | "book" | "ctexrep" | "ctexbook" | "ucasthesis" => Self {
                top: "\\chapter",
                second: "\\section",
                third: "\\subsection",
                fourth: "\\subsubsection",
            },
            _ => Self {
                top: "\\section",
                second: "\\subsection",
                third: "\\subsubsection",
                fourth: "\\paragraph",
            },
        }
    }

    /// Command for an outline level (1 = top); deeper levels clamp to `fourth`.
    pub fn for_level(&self, level: u8) -> &'static str {
        match level {
            0 | 1 => self.top,
            2 => self.second,
            3 => self.third,
            _ => self.fourth,
        }
    }
}

impl Template {
    /// The built-in article template.
    pub fn default_article() -> Self {
        Self {
            id: DEFAULT_TEMPLATE_ID.to_string(),
            name: "Article".to_string(),
            description: "Built-in article layout with ctex, geometry and a table of contents"
                .to_string(),
            preamble: None,
            postamble: format!("{}\n", END_DOCUMENT),
            doc_class_type: "article".to_string(),
            support_dirs: Vec::new(),
            is_builtin: true,
        }
    }

    pub fn section_commands(&self) -> SectionCommands {
        SectionCommands::for_class(&self.doc_class_type)
    }

    /// Front matter with placeholders filled in, ending just before the first chapter.
    pub fn render_preamble(&self, front: &FrontMatter) -> String {
        let front = &front.escaped();
        match &self.preamble {
            Some(raw) => {
                let rendered = substitute_placeholders(raw, front);
                if rendered.contains(BEGIN_DOCUMENT) {
                    format!("{}\n", rendered.trim_end())
                } else {
                    warn!(template = %self.id, "Template front matter lacks \\begin{{document}}, using default preamble");
                    default_preamble(front)
                }
            }
            None => default_preamble(front),
        }
    }

    fn from_dir(dir: &Path, is_builtin: bool) -> Result<Option<Self>, TemplateError> {
        let Some(meta) = TemplateMeta::read(dir)? else {
            return Ok(None);
        };
        let source_path = dir.join(TEMPLATE_SOURCE);
        let source = if source_path.is_file() {
            Some(std::fs::read_to_string(&source_path)?)
        } else {
            None
        };

        let doc_class_type = meta
            .doc_class_type
            .clone()
            .or_else(|| source.as_deref().and_then(detect_doc_class))
            .unwrap_or_else(|| "article".to_string());

        let preamble = source.as_deref().and_then(|text| {
            if !text.contains(BEGIN_DOCUMENT) {
                return None;
            }
            let end = text.find(END_DOCUMENT).unwrap_or(text.len());
            Some(text[..end].trim_end().to_string())
        });

        let support_dirs = meta
            .support_dirs
            .iter()
            .map(|name| dir.join(name))
            .filter(|path| path.is_dir())
            .collect();

        Ok(Some(Self {
            id: meta.id,
            name: meta.name,
            description: meta.description,
            preamble,
            postamble: format!("{}\n", END_DOCUMENT),
            doc_class_type,
            support_dirs,
            is_builtin,
        }))
    }
}

/// On-disk template metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateMeta {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_class_type: Option<String>,
    #[serde(default)]
    pub support_dirs: Vec<String>,
}

impl TemplateMeta {
    fn read(dir: &Path) -> Result<Option<Self>, TemplateError> {
        let toml_path = dir.join("meta.toml");
        if toml_path.is_file() {
            let text = std::fs::read_to_string(&toml_path)?;
            return toml::from_str(&text)
                .map(Some)
                .map_err(|e| invalid_meta(&toml_path, e.to_string()));
        }
        let json_path = dir.join("meta.json");
        if json_path.is_file() {
            let text = std::fs::read_to_string(&json_path)?;
            return serde_json::from_str(&text)
                .map(Some)
                .map_err(|e| invalid_meta(&json_path, e.to_string()));
        }
        Ok(None)
    }
}

fn invalid_meta(path: &Path, message: String) -> TemplateError {
    TemplateError::InvalidMeta {
        path: path.display().to_string(),
        message,
    }
}

/// Document class named by `\documentclass[...]{...}`, with any path prefix removed.
pub fn detect_doc_class(source: &str) -> Option<String> {
    let start = source.find("\\documentclass")? + "\\documentclass".len();
    let mut rest = source[start..].trim_start();
    if rest.starts_with('[') {
        let close = rest.find(']')?;
        rest = rest[close + 1..].trim_start();
    }
    let rest = rest.strip_prefix('{')?;
    let close = rest.find('}')?;
    let name = rest[..close].trim();
    let name = name.rsplit('/').next().unwrap_or(name);
    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }
    Some(name.to_string())
}

/// Built-in article preamble through `\tableofcontents`.
pub fn default_preamble(front: &FrontMatter) -> String {
    let mut preamble = String::from(
        "\\documentclass[12pt, a4paper]{article}\n\
         \\usepackage[UTF8]{ctex}\n\
         \\usepackage{geometry}\n\
         \\usepackage{amsmath, amssymb}\n\
         \\usepackage{graphicx}\n\
         \\usepackage{hyperref}\n\
         \\usepackage{booktabs}\n\
         \\usepackage{setspace}\n\
         \\usepackage{enumitem}\n\
         \\usepackage{longtable}\n\
         \n\
         \\geometry{left=2.5cm, right=2.5cm, top=2.5cm, bottom=2.5cm}\n\
         \\onehalfspacing\n\n",
    );
    preamble.push_str(&format!("\\title{{{}}}\n", front.title));
    preamble.push_str(&format!("\\author{{{}}}\n", front.author));
    preamble.push_str("\\date{\\today}\n\n\\begin{document}\n\n\\maketitle\n\n");
    if !front.abstract_text.trim().is_empty() {
        preamble.push_str(&format!(
            "\\begin{{abstract}}\n{}\n\\end{{abstract}}\n\n",
            front.abstract_text.trim()
        ));
    }
    preamble.push_str("\\tableofcontents\n\\newpage\n");
    preamble
}

const SPECIAL_CHARS: [char; 5] = ['&', '%', '#', '_', '$'];

/// Escape characters that would break plain text inside LaTeX; already escaped ones stay.
pub fn escape_latex(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    let mut previous = None;
    for c in text.chars() {
        if SPECIAL_CHARS.contains(&c) && previous != Some('\\') {
            escaped.push('\\');
        }
        escaped.push(c);
        previous = Some(c);
    }
    escaped
}

/// Fill `<< name >>` placeholders (with optional `| default("...")`) and drop
/// `<% ... %>` blocks and `<# ... #>` comments.
fn substitute_placeholders(raw: &str, front: &FrontMatter) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    loop {
        let next = ["<<", "<%", "<#"]
            .iter()
            .filter_map(|open| rest.find(open).map(|pos| (pos, *open)))
            .min_by_key(|(pos, _)| *pos);
        let Some((pos, open)) = next else {
            out.push_str(rest);
            return out;
        };
        out.push_str(&rest[..pos]);
        let close = match open {
            "<<" => ">>",
            "<%" => "%>",
            _ => "#>",
        };
        let body_start = pos + open.len();
        let Some(body_len) = rest[body_start..].find(close) else {
            out.push_str(&rest[pos..]);
            return out;
        };
        if open == "<<" {
            out.push_str(&resolve_placeholder(&rest[body_start..body_start + body_len], front));
        }
        rest = &rest[body_start + body_len + close.len()..];
    }
}

fn resolve_placeholder(expr: &str, front: &FrontMatter) -> String {
    let mut parts = expr.splitn(2, '|');
    let name = parts.next().unwrap_or_default().trim();
    let value = match name {
        "title" => front.title.as_str(),
        "author" => front.author.as_str(),
        "abstract" => front.abstract_text.as_str(),
        _ => "",
    };
    if !value.is_empty() {
        return value.to_string();
    }
    if name == "report_date" {
        return chrono::Local::now().format("%Y-%m-%d").to_string();
    }
    parts
        .next()
        .and_then(|filter| {
            let filter = filter.trim();
            let inner = filter.strip_prefix("default(")?.strip_suffix(')')?.trim();
            Some(inner.trim_matches(|c| c == '"' || c == '\'').to_string())
        })
        .unwrap_or_default()
}

fn is_valid_template_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Filesystem-backed template registry with an explicit cache
pub struct FsTemplateRegistry {
    builtin_roots: Vec<PathBuf>,
    custom_dir: PathBuf,
    cache: RwLock<Option<Arc<Vec<Template>>>>,
}

impl FsTemplateRegistry {
    pub fn new(builtin_roots: Vec<PathBuf>, custom_dir: PathBuf) -> Self {
        Self {
            builtin_roots,
            custom_dir,
            cache: RwLock::new(None),
        }
    }

    /// Registry rooted at `base`; relative settings paths resolve against it.
    pub fn from_settings(settings: &TemplateSettings, base: &Path) -> Self {
        let resolve = |path: &PathBuf| {
            if path.is_absolute() {
                path.clone()
            } else {
                base.join(path)
            }
        };
        Self::new(
            settings.dirs.iter().map(resolve).collect(),
            resolve(&settings.custom_dir),
        )
    }

    /// Drop the cache; the next lookup rescans.
    pub fn invalidate(&self) {
        *self.cache.write() = None;
    }

    fn templates(&self) -> Result<Arc<Vec<Template>>, TemplateError> {
        if let Some(cached) = self.cache.read().as_ref() {
            return Ok(Arc::clone(cached));
        }
        let scanned = Arc::new(self.scan()?);
        *self.cache.write() = Some(Arc::clone(&scanned));
        Ok(scanned)
    }

    fn scan(&self) -> Result<Vec<Template>, TemplateError> {
        let mut templates = vec![Template::default_article()];
        let roots = self
            .builtin_roots
            .iter()
            .map(|root| (root, true))
            .chain(std::iter::once((&self.custom_dir, false)));

        for (root, is_builtin) in roots {
            if !root.is_dir() {
                continue;
            }
            let mut dirs: Vec<PathBuf> = std::fs::read_dir(root)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| path.is_dir())
                .collect();
            dirs.sort();

            for dir in dirs {
                match Template::from_dir(&dir, is_builtin) {
                    Ok(Some(template)) => {
                        // later roots shadow earlier ones
                        templates.retain(|t| t.id != template.id);
                        templates.push(template);
                    }
                    Ok(None) => {}
                    Err(e) => warn!(dir = %dir.display(), error = %e, "Skipping unreadable template"),
                }
            }
        }
        debug!(count = templates.len(), "Scanned template registry");
        Ok(templates)
    }

    /// Write a user template and invalidate the cache.
    pub fn save_custom(
        &self,
        meta: &TemplateMeta,
        source: &str,
    ) -> Result<PathBuf, TemplateError> {
        if !is_valid_template_id(&meta.id) {
            return Err(TemplateError::InvalidId(meta.id.clone()));
        }
        let dir = self.custom_dir.join(&meta.id);
        std::fs::create_dir_all(&dir)?;
        let meta_text = toml::to_string_pretty(meta)
            .map_err(|e| invalid_meta(&dir.join("meta.toml"), e.to_string()))?;
        std::fs::write(dir.join("meta.toml"), meta_text)?;
        std::fs::write(dir.join(TEMPLATE_SOURCE), source)?;
        self.invalidate();
        Ok(dir)
    }

    /// Remove a user template. Returns false when it did not exist.
    pub fn delete_custom(&self, id: &str) -> Result<bool, TemplateError> {
        if !is_valid_template_id(id) {
            return Err(TemplateError::InvalidId(id.to_string()));
        }
        let dir = self.custom_dir.join(id);
        if !dir.exists() {
            return Ok(false);
        }
        std::fs::remove_dir_all(&dir)?;
        self.invalidate();
        Ok(true)
    }
}

impl TemplateProvider for FsTemplateRegistry {
    fn get_template(&self, id: &str) -> Result<Template, TemplateError> {
        if !is_valid_template_id(id) {
            return Err(TemplateError::InvalidId(id.to_string()));
        }
        self.templates()?
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| TemplateError::NotFound(id.to_string()))
    }

    fn list_templates(&self) -> Result<Vec<Template>, TemplateError> {
        Ok(self.templates()?.as_ref().clone())
    }
}
