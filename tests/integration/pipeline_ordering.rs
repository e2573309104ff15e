//! Ordering, fan-out bounds and partial-failure isolation across a full run

use crate::integration::test_utils::{
    analysis_reply, chapter_title, documents, orchestrator, outline_reply, prompt_kind,
    FakeCompiler, FakeGateway, PromptKind,
};
use docforge::compiler::CompileMode;
use docforge::config::PipelineSettings;
use docforge::error::GatewayError;
use docforge::pipeline::{EventSink, PipelineEvent, RunOutcome, Stage};
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const TITLES: [&str; 5] = ["Alpha", "Bravo", "Charlie", "Delta", "Echo"];

fn chapter_delay(title: &str) -> Duration {
    let position = TITLES.iter().position(|t| *t == title).unwrap_or(0);
    Duration::from_millis(40 * (TITLES.len() - position) as u64)
}

#[tokio::test]
async fn chapters_keep_outline_order_when_completing_in_reverse() {
    let temp = TempDir::new().unwrap();
    let gateway = Arc::new(FakeGateway::new(|prompt| match prompt_kind(prompt) {
        PromptKind::Analysis => (Duration::ZERO, Ok(analysis_reply("Source"))),
        PromptKind::Outline => (Duration::ZERO, Ok(outline_reply(&TITLES))),
        PromptKind::Chapter => {
            let title = chapter_title(prompt);
            (
                chapter_delay(&title),
                Ok(format!("\\section{{{}}}\nText for {}.", title, title)),
            )
        }
        _ => (Duration::ZERO, Err(GatewayError::RequestFailed("unexpected".to_string()))),
    }));
    let handle = orchestrator(
        gateway,
        Arc::new(FakeCompiler::passing()),
        PipelineSettings::default(),
        temp.path(),
    )
    .run(documents(2), "default", CancellationToken::new());

    let events: Vec<PipelineEvent> = handle.events.collect().await;
    let run = handle.task.await.unwrap();
    assert_eq!(run.outcome, Some(RunOutcome::Completed));

    let chunk_order: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::Chunk { chapter_index, .. } => Some(*chapter_index),
            _ => None,
        })
        .collect();
    assert_eq!(chunk_order, vec![4, 3, 2, 1, 0], "chunks arrive in completion order");

    let document = run.final_document.unwrap();
    let positions: Vec<usize> = TITLES
        .iter()
        .map(|t| document.find(&format!("\\section{{{}}}", t)).unwrap())
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn analysis_in_flight_never_exceeds_batch_size() {
    let temp = TempDir::new().unwrap();
    let gateway = Arc::new(FakeGateway::new(|prompt| match prompt_kind(prompt) {
        PromptKind::Analysis => (Duration::from_millis(15), Ok(analysis_reply("Doc"))),
        PromptKind::Outline => (Duration::ZERO, Ok(outline_reply(&["Only"]))),
        _ => (Duration::ZERO, Ok("\\section{Only}\nText.".to_string())),
    }));
    let settings = PipelineSettings {
        batch_size_analysis: 3,
        ..PipelineSettings::default()
    };
    let run = orchestrator(
        gateway.clone(),
        Arc::new(FakeCompiler::passing()),
        settings,
        temp.path(),
    )
    .execute(&documents(20), "default", &EventSink::discard(), &CancellationToken::new())
    .await;

    assert_eq!(run.outcome, Some(RunOutcome::Completed));
    assert_eq!(gateway.count(PromptKind::Analysis), 20);
    let watermark = gateway.watermark(PromptKind::Analysis);
    assert!(watermark <= 3, "watermark was {}", watermark);
    assert!(watermark >= 2, "analysis did run concurrently");
}

#[tokio::test]
async fn chapter_in_flight_never_exceeds_batch_size() {
    let temp = TempDir::new().unwrap();
    let titles: Vec<String> = (1..=12).map(|i| format!("Part {}", i)).collect();
    let title_refs: Vec<&str> = titles.iter().map(String::as_str).collect();
    let outline = outline_reply(&title_refs);
    let gateway = Arc::new(FakeGateway::new(move |prompt| match prompt_kind(prompt) {
        PromptKind::Analysis => (Duration::ZERO, Ok(analysis_reply("Doc"))),
        PromptKind::Outline => (Duration::ZERO, Ok(outline.clone())),
        _ => (
            Duration::from_millis(15),
            Ok(format!("\\section{{{}}}\nText.", chapter_title(prompt))),
        ),
    }));
    let settings = PipelineSettings {
        batch_size_chapters: 4,
        ..PipelineSettings::default()
    };
    let compiler = Arc::new(FakeCompiler::passing());
    let run = orchestrator(gateway.clone(), compiler.clone(), settings, temp.path())
        .execute(&documents(1), "default", &EventSink::discard(), &CancellationToken::new())
        .await;

    assert_eq!(run.outcome, Some(RunOutcome::Completed));
    assert!(gateway.watermark(PromptKind::Chapter) <= 4);
    assert_eq!(compiler.count(CompileMode::Draft), 12);
}

#[tokio::test]
async fn chapter_failing_twice_is_degraded_not_omitted() {
    let temp = TempDir::new().unwrap();
    let gateway = Arc::new(FakeGateway::instant(|prompt| match prompt_kind(prompt) {
        PromptKind::Analysis => Ok(analysis_reply("Doc")),
        PromptKind::Outline => Ok(outline_reply(&["Intro", "Broken", "Outro"])),
        PromptKind::Chapter if chapter_title(prompt) == "Broken" => {
            Ok("\\section{Broken}\n\\badmacro".to_string())
        }
        _ => Ok(format!("\\section{{{}}}\nFine.", chapter_title(prompt))),
    }));
    let compiler = Arc::new(FakeCompiler::new(|text, mode| {
        mode == CompileMode::Full || !text.contains("\\badmacro")
    }));
    let warnings = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&warnings);
    let sink = EventSink::from_callback(move |event| {
        if let PipelineEvent::Done { warnings, .. } = event {
            seen.lock().extend(warnings);
        }
    });

    let run = orchestrator(gateway.clone(), compiler.clone(), PipelineSettings::default(), temp.path())
        .execute(&documents(1), "default", &sink, &CancellationToken::new())
        .await;

    assert_eq!(run.outcome, Some(RunOutcome::Completed));
    assert_eq!(gateway.count(PromptKind::Chapter), 4, "one retry for the broken chapter");
    let document = run.final_document.unwrap();
    assert!(document.contains("\\section{Broken}"));
    assert!(document.find("\\section{Intro}") < document.find("\\section{Broken}"));
    assert!(document.find("\\section{Broken}") < document.find("\\section{Outro}"));
    let warnings = warnings.lock();
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("Broken"));
}

#[tokio::test]
async fn slow_analysis_degrades_one_document_and_outline_uses_the_rest() {
    let temp = TempDir::new().unwrap();
    let gateway = Arc::new(FakeGateway::new(|prompt| match prompt_kind(prompt) {
        PromptKind::Analysis if prompt.contains("source-2.md") => {
            (Duration::from_secs(3), Ok(analysis_reply("Late")))
        }
        PromptKind::Analysis => (Duration::ZERO, Ok(analysis_reply("Prompt"))),
        PromptKind::Outline => (Duration::ZERO, Ok(outline_reply(&["Summary"]))),
        _ => (Duration::ZERO, Ok("\\section{Summary}\nText.".to_string())),
    }));
    let settings = PipelineSettings {
        batch_size_analysis: 2,
        analysis_timeout_secs: 1,
        ..PipelineSettings::default()
    };

    let run = orchestrator(gateway.clone(), Arc::new(FakeCompiler::passing()), settings, temp.path())
        .execute(&documents(3), "default", &EventSink::discard(), &CancellationToken::new())
        .await;

    assert_eq!(run.outcome, Some(RunOutcome::Completed));
    assert_eq!(run.warnings.len(), 1);
    assert!(run.warnings[0].contains("doc-2"));
    let prompts = gateway.prompts.lock();
    let outline_prompt = prompts
        .iter()
        .find(|p| prompt_kind(p) == PromptKind::Outline)
        .unwrap();
    assert!(outline_prompt.contains("integrates the 2 source documents"));
    assert!(!outline_prompt.contains("id=doc-2"));
    assert!(run.progress == 100 && run.current_stage == Stage::Compile);
}
