//! Compile-validate-fix loop: retry bound, convergence and fresh working directories

use crate::integration::test_utils::{
    analysis_reply, chapter_title, documents, fix_document, orchestrator, outline_reply,
    prompt_kind, FakeCompiler, FakeGateway, PromptKind,
};
use docforge::compiler::CompileMode;
use docforge::config::PipelineSettings;
use docforge::pipeline::{EventSink, FixLoop, FixState, PipelineEvent, RunOutcome};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const DOCUMENT: &str = "\\documentclass{article}\n\\usepackage{missingpkg}\n\\begin{document}\nHi\n\\end{document}\n";

#[tokio::test]
async fn always_failing_compile_is_bounded_by_max_retries() {
    for max_retries in 0..=4 {
        let compiler = Arc::new(FakeCompiler::new(|_, _| false));
        let revision = Arc::new(AtomicUsize::new(0));
        let gateway = Arc::new(FakeGateway::instant(move |prompt| {
            let n = revision.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{}% revision {}\n", fix_document(prompt), n))
        }));
        let settings = PipelineSettings {
            max_retries,
            ..PipelineSettings::default()
        };
        let report = FixLoop::new(compiler.clone(), Some(gateway), &settings)
            .run(DOCUMENT, &EventSink::discard(), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.state, FixState::Failed);
        assert_eq!(report.attempts.len(), max_retries + 1);
        assert_eq!(compiler.count(CompileMode::Full), max_retries + 1);
    }
}

#[tokio::test]
async fn every_compile_starts_in_an_empty_workdir() {
    let compiler = Arc::new(FakeCompiler::new(|_, _| false));
    let gateway = Arc::new(FakeGateway::instant(|prompt| {
        Ok(format!("{}% again\n", fix_document(prompt)))
    }));
    FixLoop::new(compiler.clone(), Some(gateway), &PipelineSettings::default())
        .run(DOCUMENT, &EventSink::discard(), &CancellationToken::new())
        .await
        .unwrap();

    let calls = compiler.calls.lock();
    assert_eq!(calls.len(), 3);
    assert!(calls.iter().all(|c| c.preexisting == 0));
    assert!(calls.iter().all(|c| !c.workdir.exists()));
    assert_ne!(calls[0].workdir, calls[1].workdir);
}

#[tokio::test]
async fn identical_content_compiles_identically_in_fresh_workdirs() {
    let compiler = Arc::new(FakeCompiler::new(|text, _| !text.contains("missingpkg")));
    let fix_loop = FixLoop::new(compiler.clone(), None, &PipelineSettings::default());
    let cancel = CancellationToken::new();

    for document in [DOCUMENT, "\\begin{document}\nok\n\\end{document}\n"] {
        let first = fix_loop.run(document, &EventSink::discard(), &cancel).await.unwrap();
        let second = fix_loop.run(document, &EventSink::discard(), &cancel).await.unwrap();
        assert_eq!(first.state, second.state);
        assert_eq!(first.attempts.len(), second.attempts.len());
        assert_eq!(first.attempts[0].outcome, second.attempts[0].outcome);
        assert_eq!(first.attempts[0].diagnostics, second.attempts[0].diagnostics);
    }
}

#[tokio::test]
async fn second_revision_removes_dependency_and_run_reports_three_attempts() {
    let temp = TempDir::new().unwrap();
    let fixes = Arc::new(AtomicUsize::new(0));
    let gateway = Arc::new(FakeGateway::instant(move |prompt| match prompt_kind(prompt) {
        PromptKind::Analysis => Ok(analysis_reply("Doc")),
        PromptKind::Outline => Ok(outline_reply(&["Setup", "Results"])),
        PromptKind::Chapter if chapter_title(prompt) == "Setup" => {
            Ok("\\section{Setup}\n\\usepackage{missingpkg}\nSetup text.".to_string())
        }
        PromptKind::Chapter => Ok("\\section{Results}\nResults text.".to_string()),
        _ => {
            let document = fix_document(prompt);
            if fixes.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(format!("```latex\n{}\n% checked packages\n```", document.trim_end()))
            } else {
                Ok(document.replace("\\usepackage{missingpkg}\n", ""))
            }
        }
    }));
    let compiler = Arc::new(FakeCompiler::new(|text, mode| {
        mode == CompileMode::Draft || !text.contains("missingpkg")
    }));
    let events = Arc::new(Mutex::new(Vec::new()));
    let recorded = Arc::clone(&events);
    let sink = EventSink::from_callback(move |event| recorded.lock().push(event));

    let run = orchestrator(gateway, compiler.clone(), PipelineSettings::default(), temp.path())
        .execute(&documents(1), "default", &sink, &CancellationToken::new())
        .await;

    assert_eq!(run.outcome, Some(RunOutcome::Completed));
    assert_eq!(run.attempts.len(), 3);
    assert_eq!(compiler.count(CompileMode::Full), 3);
    let final_document = run.final_document.unwrap();
    assert!(!final_document.contains("missingpkg"));
    assert!(final_document.contains("% checked packages"));

    let events = events.lock();
    let fix_numbers: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::Fix { attempt_number, .. } => Some(*attempt_number),
            _ => None,
        })
        .collect();
    assert_eq!(fix_numbers, vec![1, 2]);
    match events.last() {
        Some(PipelineEvent::Done {
            attempts,
            final_document: Some(document),
            ..
        }) => {
            assert_eq!(*attempts, 3);
            assert_eq!(*document, final_document);
        }
        other => panic!("expected done, got {:?}", other),
    }
}

#[tokio::test]
async fn exhausted_fix_loop_fails_the_run_at_compile_stage() {
    let temp = TempDir::new().unwrap();
    let gateway = Arc::new(FakeGateway::instant(|prompt| match prompt_kind(prompt) {
        PromptKind::Analysis => Ok(analysis_reply("Doc")),
        PromptKind::Outline => Ok(outline_reply(&["Only"])),
        PromptKind::Chapter => Ok("\\section{Only}\nText.".to_string()),
        _ => Ok("UNFIXABLE: the font is not installed".to_string()),
    }));
    let compiler = Arc::new(FakeCompiler::new(|_, mode| mode == CompileMode::Draft));
    let (sink, mut receiver) = EventSink::channel();

    let run = orchestrator(gateway, compiler, PipelineSettings::default(), temp.path())
        .execute(&documents(1), "default", &sink, &CancellationToken::new())
        .await;
    drop(sink);

    match &run.outcome {
        Some(RunOutcome::Failed { reason, .. }) => assert!(reason.contains("unfixable")),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(run.attempts.len(), 1);
    let mut last = None;
    while let Some(event) = receiver.recv().await {
        last = Some(event);
    }
    assert!(matches!(
        last,
        Some(PipelineEvent::Error { stage: docforge::pipeline::Stage::Compile, .. })
    ));
}
