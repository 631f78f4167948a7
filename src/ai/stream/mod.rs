//! Incremental Output
//!
//! Events emitted by a streaming chat, in order:
//!
//! ```text
//! mode → chunk(0) → chunk(1) → … → done | error
//! ```
//!
//! Exactly one terminal event closes every stream.

mod buffer;
mod masking;

pub use buffer::{StreamBuffer, should_flush, split_paragraphs};
pub use masking::{PiiMasker, RegexPiiMasker, SharedPiiMasker};

use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::types::{Mode, ModeDecision};

/// How the `done` text was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingMode {
    /// Fragments from a streaming backend
    Real,
    /// Complete text split into paragraphs
    BufferedFallback,
    /// Replay of a cached response
    Cached,
}

impl std::fmt::Display for StreamingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamingMode::Real => write!(f, "real"),
            StreamingMode::BufferedFallback => write!(f, "buffered_fallback"),
            StreamingMode::Cached => write!(f, "cached"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// First event: the resolved mode
    Mode {
        mode: Mode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        decision: Option<ModeDecision>,
    },
    /// Masked slice of the response
    Chunk { text: String, index: usize },
    /// Terminal success; `text` is the full unmasked response
    Done {
        text: String,
        provider: String,
        model: String,
        suggestions: Vec<String>,
        streaming_mode: StreamingMode,
    },
    /// Terminal failure after output had started
    Error { message: String },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done { .. } | StreamEvent::Error { .. })
    }

    /// SSE event name
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Mode { .. } => "mode",
            StreamEvent::Chunk { .. } => "chunk",
            StreamEvent::Done { .. } => "done",
            StreamEvent::Error { .. } => "error",
        }
    }
}

/// Receiving end of a streaming chat.
///
/// Dropping it stops the producing task at its next send.
pub struct ChatStream {
    rx: mpsc::Receiver<StreamEvent>,
}

impl ChatStream {
    pub(crate) fn new(rx: mpsc::Receiver<StreamEvent>) -> Self {
        Self { rx }
    }

    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Drain every remaining event
    pub async fn collect_events(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.rx.recv().await {
            events.push(event);
        }
        events
    }
}

impl Stream for ChatStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
