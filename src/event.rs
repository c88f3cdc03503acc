//! Application events for the tao event loop.

use murmur_core::AssistantState;

/// Events republished by the session coordinator for the UI layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiEvent {
    /// The assistant status has changed
    StateChanged(AssistantState),
    /// Stage 1 finished: a transcript is ready
    TranscriptReady(String),
    /// Stage 2 finished: a generated response is ready
    ResponseReady(String),
    /// The recording session failed before producing an artifact
    SessionFailed(String),
    /// The processing job failed
    JobFailed(String),
}
