// Re-export from sub-crates
pub use murmur_audio::{
    CaptureDevice, CaptureError, CaptureStream, CpalDevice, LevelMonitor, RecordingSession,
    SessionState,
};
pub use murmur_core::{
    APP_NAME, APP_NAME_PRETTY, AssistantState, Config, ConfigManager, DEFAULT_LOG_LEVEL,
};
pub use murmur_services::{
    CompletionService, OpenAiCompletion, OpenAiCompletionConfig, OpenAiTranscription,
    OpenAiTranscriptionConfig, ServiceError, TranscriptionService,
};

// App-specific modules
pub mod coordinator;
pub mod event;
pub mod hotkey;
pub mod notify;
pub mod pipeline;

// Version from this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
