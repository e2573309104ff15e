//! Template registry caching and template-driven generation

use crate::integration::test_utils::{
    analysis_reply, chapter_title, documents, orchestrator, outline_reply, prompt_kind,
    FakeCompiler, FakeGateway, PromptKind,
};
use docforge::config::PipelineSettings;
use docforge::error::TemplateError;
use docforge::pipeline::{EventSink, RunOutcome};
use docforge::template::{FsTemplateRegistry, TemplateMeta, TemplateProvider, DEFAULT_TEMPLATE_ID};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const REPORT_SOURCE: &str = "\\documentclass[12pt]{report}\n\
\\title{<< title | default(\"Untitled\") >>}\n\
\\author{<< author >>}\n\
<# layout notes #>\n\
\\begin{document}\n\
\\maketitle\n\
\\end{document}\n";

fn report_meta() -> TemplateMeta {
    TemplateMeta {
        id: "lab-report".to_string(),
        name: "Lab Report".to_string(),
        description: "Report class with chapters".to_string(),
        doc_class_type: None,
        support_dirs: vec![],
    }
}

#[test]
fn saving_and_deleting_invalidates_the_cache() {
    let temp = TempDir::new().unwrap();
    let registry = FsTemplateRegistry::new(vec![], temp.path().join("custom"));

    assert_eq!(registry.list_templates().unwrap().len(), 1);
    registry.save_custom(&report_meta(), REPORT_SOURCE).unwrap();

    let template = registry.get_template("lab-report").unwrap();
    assert_eq!(template.doc_class_type, "report");
    assert!(!template.is_builtin);
    assert_eq!(registry.list_templates().unwrap().len(), 2);

    assert!(registry.delete_custom("lab-report").unwrap());
    assert!(matches!(
        registry.get_template("lab-report"),
        Err(TemplateError::NotFound(_))
    ));
    assert!(!registry.delete_custom("lab-report").unwrap());
}

#[test]
fn builtin_roots_are_read_and_ids_validated() {
    let temp = TempDir::new().unwrap();
    let builtin = temp.path().join("builtin");
    let dir = builtin.join("memo");
    std::fs::create_dir_all(dir.join("figures")).unwrap();
    std::fs::write(
        dir.join("meta.json"),
        r#"{"id": "memo", "name": "Memo", "support_dirs": ["figures", "absent"]}"#,
    )
    .unwrap();

    let registry = FsTemplateRegistry::new(vec![builtin], temp.path().join("custom"));
    let memo = registry.get_template("memo").unwrap();
    assert!(memo.is_builtin);
    assert_eq!(memo.support_dirs, vec![dir.join("figures")]);
    assert!(registry.get_template(DEFAULT_TEMPLATE_ID).is_ok());
    assert!(matches!(
        registry.get_template("../etc"),
        Err(TemplateError::InvalidId(_))
    ));
}

#[tokio::test]
async fn report_template_drives_chapter_commands_and_front_matter() {
    let temp = TempDir::new().unwrap();
    FsTemplateRegistry::new(vec![], temp.path().to_path_buf())
        .save_custom(&report_meta(), REPORT_SOURCE)
        .unwrap();

    let gateway = Arc::new(FakeGateway::instant(|prompt| match prompt_kind(prompt) {
        PromptKind::Analysis => Ok(analysis_reply("Doc")),
        PromptKind::Outline => Ok(outline_reply(&["Method"])),
        _ => {
            assert!(prompt.contains("\\chapter{Method}"));
            Ok(format!("\\chapter{{{}}}\nSteps.", chapter_title(prompt)))
        }
    }));
    let run = orchestrator(
        gateway,
        Arc::new(FakeCompiler::passing()),
        PipelineSettings::default(),
        temp.path(),
    )
    .execute(&documents(1), "lab-report", &EventSink::discard(), &CancellationToken::new())
    .await;

    assert_eq!(run.outcome, Some(RunOutcome::Completed));
    let document = run.final_document.unwrap();
    assert!(document.starts_with("\\documentclass[12pt]{report}"));
    assert!(document.contains("\\title{Combined Report}"));
    assert!(document.contains("\\author{QA}"));
    assert!(!document.contains("layout notes"));
    assert!(document.contains("\\chapter{Method}"));
    assert!(document.trim_end().ends_with("\\end{document}"));
}
