//! Pipeline event stream.
//!
//! Events are serialized as `{"event": "<kind>", ...}`. `EventSink` is the single
//! emission point: it clamps stage progress so it never decreases and latches after
//! the first terminal event, dropping anything emitted later.

use super::types::{Outline, Stage};
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum PipelineEvent {
    Stage {
        name: Stage,
        message: String,
        progress: u8,
    },
    Outline {
        structure: Outline,
    },
    Chunk {
        chapter_index: usize,
        text: String,
    },
    Fix {
        attempt_number: usize,
        message: String,
        revised_snapshot: String,
    },
    Done {
        final_document: Option<String>,
        artifact_ref: Option<PathBuf>,
        attempts: usize,
        warnings: Vec<String>,
    },
    Error {
        stage: Stage,
        message: String,
    },
}

impl PipelineEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineEvent::Done { .. } | PipelineEvent::Error { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PipelineEvent::Stage { .. } => "stage",
            PipelineEvent::Outline { .. } => "outline",
            PipelineEvent::Chunk { .. } => "chunk",
            PipelineEvent::Fix { .. } => "fix",
            PipelineEvent::Done { .. } => "done",
            PipelineEvent::Error { .. } => "error",
        }
    }
}

pub type EventReceiver = mpsc::UnboundedReceiver<PipelineEvent>;

type Callback = Arc<dyn Fn(PipelineEvent) + Send + Sync>;

enum Target {
    Channel(mpsc::UnboundedSender<PipelineEvent>),
    Callback(Callback),
    Discard,
}

struct SinkState {
    progress: u8,
    closed: bool,
}

struct SinkInner {
    target: Target,
    state: Mutex<SinkState>,
}

/// Ordered, terminal-latching event emitter shared by every stage of a run
#[derive(Clone)]
pub struct EventSink {
    inner: Arc<SinkInner>,
}

impl EventSink {
    fn with_target(target: Target) -> Self {
        Self {
            inner: Arc::new(SinkInner {
                target,
                state: Mutex::new(SinkState {
                    progress: 0,
                    closed: false,
                }),
            }),
        }
    }

    pub fn channel() -> (Self, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::with_target(Target::Channel(tx)), rx)
    }

    pub fn from_callback<F>(callback: F) -> Self
    where
        F: Fn(PipelineEvent) + Send + Sync + 'static,
    {
        Self::with_target(Target::Callback(Arc::new(callback)))
    }

    /// Sink that keeps the ordering rules but delivers nowhere.
    pub fn discard() -> Self {
        Self::with_target(Target::Discard)
    }

    /// Deliver an event. Returns false when the sink already emitted its terminal event.
    pub fn emit(&self, mut event: PipelineEvent) -> bool {
        let mut state = self.inner.state.lock();
        if state.closed {
            debug!(kind = event.kind(), "Dropping event emitted after terminal event");
            return false;
        }
        if let PipelineEvent::Stage { progress, .. } = &mut event {
            *progress = (*progress).clamp(state.progress, 100);
            state.progress = *progress;
        }
        if event.is_terminal() {
            state.closed = true;
        }
        // delivery happens under the lock so concurrent emitters stay ordered
        match &self.inner.target {
            Target::Channel(tx) => {
                if tx.send(event).is_err() {
                    debug!("Event receiver dropped");
                }
            }
            Target::Callback(callback) => callback(event),
            Target::Discard => {}
        }
        true
    }

    pub fn stage(&self, stage: Stage, progress: u8, message: impl Into<String>) -> bool {
        self.emit(PipelineEvent::Stage {
            name: stage,
            message: message.into(),
            progress,
        })
    }

    pub fn progress(&self) -> u8 {
        self.inner.state.lock().progress
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }
}
