//! Recording session state machine.
//!
//! A session owns the capture-stream lifecycle from open to artifact. Level
//! samples are consumed immediately; only the rolling last-activity
//! timestamp persists. Timestamps are passed in by the caller so the silence
//! rules can be exercised deterministically in tests.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::capture::{CaptureDevice, CaptureError, CaptureFormat, CaptureStream};
use crate::level::{AudioLevelSample, LevelMonitor};

/// File name for a session artifact, stamped with the capture start time.
pub fn artifact_file_name(unix_seconds: u64) -> String {
    format!("recording-{unix_seconds}.wav")
}

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact missing at {0}")]
    Missing(PathBuf),
    #[error("artifact empty at {0}")]
    Empty(PathBuf),
    #[error("failed to inspect artifact at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

/// Lifecycle states of a recording session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    /// Capture stream is being opened
    Armed,
    /// Capturing audio
    Active,
    /// Stream is being halted and the artifact verified
    Stopping,
    /// Artifact exists and is non-empty
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Failed)
    }
}

/// One armed-through-completed (or failed) recording lifecycle.
pub struct RecordingSession {
    id: Uuid,
    state: SessionState,
    artifact_path: PathBuf,
    monitor: LevelMonitor,
    max_silence: Duration,
    started_at: Option<Instant>,
    last_activity_at: Option<Instant>,
    stream: Option<Box<dyn CaptureStream>>,
}

impl RecordingSession {
    pub fn new(artifact_path: PathBuf, monitor: LevelMonitor, max_silence: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Idle,
            artifact_path,
            monitor,
            max_silence,
            started_at: None,
            last_activity_at: None,
            stream: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }

    pub fn started_at(&self) -> Option<Instant> {
        self.started_at
    }

    /// Open the capture stream and begin metering. Valid only from Idle; a
    /// failure releases the stream and returns the session to Idle.
    pub fn start(&mut self, device: &dyn CaptureDevice, now: Instant) -> Result<(), CaptureError> {
        if self.state != SessionState::Idle {
            warn!(session = %self.id, state = ?self.state, "start() ignored outside Idle");
            return Ok(());
        }
        self.state = SessionState::Armed;
        match device.open(CaptureFormat::default(), &self.artifact_path) {
            Ok(stream) => {
                self.stream = Some(stream);
                self.state = SessionState::Active;
                self.started_at = Some(now);
                self.last_activity_at = Some(now);
                info!(session = %self.id, path = %self.artifact_path.display(), "Recording");
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Idle;
                Err(e)
            }
        }
    }

    /// Read the meter and refresh the last-activity timestamp when the
    /// sample is above the silence threshold. Returns the transient sample,
    /// or None when the session is not capturing.
    pub fn sample_level(&mut self, now: Instant) -> Option<AudioLevelSample> {
        if self.state != SessionState::Active {
            return None;
        }
        let stream = self.stream.as_ref()?;
        let sample = self.monitor.sample(stream.power_db(), now);
        if self.monitor.is_active(&sample) {
            self.last_activity_at = Some(now);
        }
        Some(sample)
    }

    /// Time elapsed since the last non-silent sample, while Active.
    pub fn silent_for(&self, now: Instant) -> Option<Duration> {
        if self.state != SessionState::Active {
            return None;
        }
        self.last_activity_at
            .map(|at| now.saturating_duration_since(at))
    }

    /// The auto-stop rule: continuous silence has reached the max-silence
    /// duration. Only ever true while Active, so it can fire at most once —
    /// the stop it triggers leaves the Active state.
    pub fn should_auto_stop(&self, now: Instant) -> bool {
        self.silent_for(now).is_some_and(|d| d >= self.max_silence)
    }

    /// Halt the capture stream and verify the artifact. Valid only from
    /// Active; from any other state this is a no-op returning None.
    pub fn stop(&mut self) -> Option<Result<PathBuf, SessionError>> {
        if self.state != SessionState::Active {
            return None;
        }
        self.state = SessionState::Stopping;
        let result = self.finalize();
        match &result {
            Ok(path) => {
                self.state = SessionState::Completed;
                info!(session = %self.id, path = %path.display(), "Recording completed");
            }
            Err(e) => {
                self.state = SessionState::Failed;
                warn!(session = %self.id, error = %e, "Recording failed");
            }
        }
        Some(result)
    }

    fn finalize(&mut self) -> Result<PathBuf, SessionError> {
        if let Some(stream) = self.stream.take() {
            stream.finish()?;
        }
        let metadata = std::fs::metadata(&self.artifact_path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ArtifactError::Missing(self.artifact_path.clone())
            } else {
                ArtifactError::Io {
                    path: self.artifact_path.clone(),
                    source: e,
                }
            }
        })?;
        if metadata.len() == 0 {
            return Err(ArtifactError::Empty(self.artifact_path.clone()).into());
        }
        Ok(self.artifact_path.clone())
    }
}
