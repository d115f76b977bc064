//! Structured diagnostic events emitted while a run progresses.
//!
//! The pipeline never prints; it hands [`PipelineEvent`]s to an
//! [`EventSink`] supplied by the caller (a progress bar, a channel, a
//! notifier). [`SilentSink`] discards everything.

use std::path::PathBuf;

use serde::Serialize;

use crate::types::RunId;

/// A single observable step of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// A run has started processing `total` targets.
    RunStarted { run_id: RunId, total: usize },
    /// One download attempt failed; more attempts may follow.
    AttemptFailed {
        index: usize,
        label: String,
        attempt: u32,
        max_attempts: u32,
        cause: String,
    },
    /// A target was downloaded into its staging slot.
    TargetFetched {
        index: usize,
        label: String,
        attempts: u32,
        bytes: u64,
    },
    /// A downloaded target was appended to the combined document.
    TargetMerged { index: usize, label: String },
    /// A target could not be fetched or merged and was skipped.
    TargetFailed {
        index: usize,
        label: String,
        reason: String,
    },
    /// The combined document was written.
    OutputWritten { path: PathBuf },
    /// The run finished (cleanup included).
    RunFinished { succeeded: usize, failed: usize },
}

/// Receiver for [`PipelineEvent`]s.
pub trait EventSink: Send + Sync {
    /// Called for every event, in the order they happen.
    fn emit(&self, event: PipelineEvent);
}

/// No-op sink for headless/test usage.
pub struct SilentSink;

impl EventSink for SilentSink {
    fn emit(&self, _event: PipelineEvent) {}
}

/// Forwards events into a channel; a closed receiver drops them.
impl EventSink for tokio::sync::mpsc::UnboundedSender<PipelineEvent> {
    fn emit(&self, event: PipelineEvent) {
        let _ = self.send(event);
    }
}
