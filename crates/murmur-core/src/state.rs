//! Externally visible assistant status.

/// The status the UI layer renders. Progresses Recording → Transcribing →
/// Generating → Complete | Failed for one capture-and-pipeline cycle, then
/// reverts to Idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssistantState {
    /// No session or job in flight
    Idle,
    /// A recording session is capturing audio
    Recording,
    /// Stage 1: audio is being transcribed
    Transcribing,
    /// Stage 2: a response is being generated from the transcript
    Generating,
    /// The job finished with a transcript and response
    Complete,
    /// The session or job ended in an error
    Failed,
}
