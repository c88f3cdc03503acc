//! Transcription and completion backends for murmur.
//!
//! This crate provides trait-based abstractions for the two pipeline
//! collaborators — speech-to-text and response generation — with
//! implementations backed by the OpenAI APIs.

mod completion;
mod openai;

use async_trait::async_trait;
pub use bytes::Bytes;
pub use completion::{OpenAiCompletion, OpenAiCompletionConfig};
pub use openai::{OpenAiTranscription, OpenAiTranscriptionConfig};
use thiserror::Error;

/// Errors a pipeline collaborator can fail with.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("quota exceeded: {0}")]
    Quota(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Result type for collaborator operations.
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Trait for speech-to-text backends.
///
/// Implement this trait to add new transcription backends (other cloud
/// providers, a local model, etc.)
#[async_trait]
pub trait TranscriptionService: Send + Sync {
    /// Transcribe audio to text.
    ///
    /// # Arguments
    /// * `audio` - Encoded audio data as reference-counted bytes. Use
    ///   `Bytes::from(vec)` to convert from Vec<u8> (zero-copy).
    /// * `language` - Optional language hint (ISO 639-1 code, e.g., "en")
    async fn transcribe(&self, audio: Bytes, language: Option<&str>) -> Result<String>;

    /// Returns the name of this backend for logging/debugging.
    fn name(&self) -> &str;
}

/// Trait for response-generation backends.
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Generate a response for the given transcript.
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Returns the name of this backend for logging/debugging.
    fn name(&self) -> &str;
}

/// Map a non-success HTTP status to the collaborator error taxonomy.
pub(crate) fn classify_status(status: u16, detail: String) -> ServiceError {
    match status {
        401 | 403 => ServiceError::Auth(detail),
        429 => ServiceError::Quota(detail),
        _ => ServiceError::InvalidResponse(detail),
    }
}

/// Consume a response, turning non-success statuses into typed errors.
pub(crate) async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(
        status.as_u16(),
        format!("API returned {}: {}", status, body),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_covers_the_taxonomy() {
        assert!(matches!(
            classify_status(401, String::new()),
            ServiceError::Auth(_)
        ));
        assert!(matches!(
            classify_status(403, String::new()),
            ServiceError::Auth(_)
        ));
        assert!(matches!(
            classify_status(429, String::new()),
            ServiceError::Quota(_)
        ));
        assert!(matches!(
            classify_status(500, String::new()),
            ServiceError::InvalidResponse(_)
        ));
    }
}
