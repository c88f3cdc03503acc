//! Processing pipeline for finished recordings. Each job reads the session
//! artifact and carries it through transcription and response generation,
//! publishing every stage transition before the stage begins so subscribers
//! never observe a status skip.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use murmur_services::{CompletionService, ServiceError, TranscriptionService};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("failed to read artifact: {0}")]
    Artifact(#[from] std::io::Error),

    #[error("transcription failed: {0}")]
    Transcription(ServiceError),

    #[error("response generation failed: {0}")]
    Completion(ServiceError),

    #[error("{stage} timed out after {timeout:?}")]
    StageTimeout { stage: JobStage, timeout: Duration },

    #[error("job superseded by a new recording")]
    Cancelled,
}

/// The two sequential external calls of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStage {
    Transcribing,
    Generating,
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStage::Transcribing => write!(f, "transcription"),
            JobStage::Generating => write!(f, "response generation"),
        }
    }
}

/// Progress events published by a running job. Every event carries the job
/// id so results from a superseded job can be discarded by the receiver.
#[derive(Debug)]
pub enum JobEvent {
    Stage {
        job: Uuid,
        stage: JobStage,
    },
    Finished {
        job: Uuid,
        transcript: String,
        response: String,
    },
    Failed {
        job: Uuid,
        error: PipelineError,
    },
}

impl JobEvent {
    pub fn job(&self) -> Uuid {
        match self {
            JobEvent::Stage { job, .. }
            | JobEvent::Finished { job, .. }
            | JobEvent::Failed { job, .. } => *job,
        }
    }
}

/// Status of a processing job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Transcribing,
    Generating,
    Complete,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Error)
    }
}

/// Record of one artifact's trip through the pipeline. Exactly one job
/// exists per completed recording session.
#[derive(Debug)]
pub struct ProcessingJob {
    pub id: Uuid,
    pub source_session: Uuid,
    pub status: JobStatus,
    pub transcript: Option<String>,
    pub response: Option<String>,
    pub error: Option<String>,
}

impl ProcessingJob {
    pub fn new(id: Uuid, source_session: Uuid) -> Self {
        Self {
            id,
            source_session,
            status: JobStatus::Transcribing,
            transcript: None,
            response: None,
            error: None,
        }
    }
}

/// Shared collaborators handed to each job. Cloning is cheap; the services
/// are injected at construction.
#[derive(Clone)]
pub struct ProcessingPipeline {
    transcription: Arc<dyn TranscriptionService>,
    completion: Arc<dyn CompletionService>,
    language: Option<String>,
    stage_timeout: Duration,
}

impl ProcessingPipeline {
    pub fn new(
        transcription: Arc<dyn TranscriptionService>,
        completion: Arc<dyn CompletionService>,
        language: Option<String>,
        stage_timeout: Duration,
    ) -> Self {
        Self {
            transcription,
            completion,
            language,
            stage_timeout,
        }
    }

    /// Spawn a job for an artifact. Aborting the returned handle cancels the
    /// in-flight stage and releases its connection.
    pub fn spawn(
        &self,
        job: Uuid,
        artifact: PathBuf,
        events: mpsc::UnboundedSender<JobEvent>,
    ) -> JoinHandle<()> {
        let pipeline = self.clone();
        tokio::spawn(async move { pipeline.run(job, artifact, events).await })
    }

    async fn run(self, job: Uuid, artifact: PathBuf, events: mpsc::UnboundedSender<JobEvent>) {
        let fail = |error: PipelineError| {
            warn!(job = %job, error = %error, "Job failed");
            events.send(JobEvent::Failed { job, error }).ok();
        };

        events
            .send(JobEvent::Stage {
                job,
                stage: JobStage::Transcribing,
            })
            .ok();

        let audio = match std::fs::read(&artifact) {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) => return fail(PipelineError::Artifact(e)),
        };

        let transcript = match self
            .stage(
                JobStage::Transcribing,
                self.transcription
                    .transcribe(audio, self.language.as_deref()),
            )
            .await
        {
            Ok(text) => text,
            Err(error) => return fail(error),
        };
        info!(job = %job, chars = transcript.len(), "Transcription completed");

        events
            .send(JobEvent::Stage {
                job,
                stage: JobStage::Generating,
            })
            .ok();

        let response = match self
            .stage(JobStage::Generating, self.completion.complete(&transcript))
            .await
        {
            Ok(text) => text,
            Err(error) => return fail(error),
        };
        info!(job = %job, chars = response.len(), "Response generated");

        events
            .send(JobEvent::Finished {
                job,
                transcript,
                response,
            })
            .ok();
    }

    async fn stage<T>(
        &self,
        stage: JobStage,
        call: impl Future<Output = Result<T, ServiceError>>,
    ) -> Result<T, PipelineError> {
        match tokio::time::timeout(self.stage_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(match stage {
                JobStage::Transcribing => PipelineError::Transcription(e),
                JobStage::Generating => PipelineError::Completion(e),
            }),
            Err(_) => Err(PipelineError::StageTimeout {
                stage,
                timeout: self.stage_timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;

    #[derive(Clone, Copy)]
    enum Behavior {
        Reply(&'static str),
        FailNetwork,
        Hang,
    }

    struct StubTranscription {
        behavior: Behavior,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TranscriptionService for StubTranscription {
        async fn transcribe(
            &self,
            _audio: Bytes,
            _language: Option<&str>,
        ) -> murmur_services::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Reply(text) => Ok(text.to_string()),
                Behavior::FailNetwork => Err(ServiceError::Network("connection reset".into())),
                Behavior::Hang => std::future::pending().await,
            }
        }

        fn name(&self) -> &str {
            "stub-transcription"
        }
    }

    struct StubCompletion {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CompletionService for StubCompletion {
        async fn complete(&self, prompt: &str) -> murmur_services::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("{} ACK", prompt.to_uppercase()))
        }

        fn name(&self) -> &str {
            "stub-completion"
        }
    }

    struct TestPipeline {
        pipeline: ProcessingPipeline,
        transcribe_calls: Arc<AtomicUsize>,
        complete_calls: Arc<AtomicUsize>,
    }

    fn pipeline_with(behavior: Behavior) -> TestPipeline {
        let transcribe_calls = Arc::new(AtomicUsize::new(0));
        let complete_calls = Arc::new(AtomicUsize::new(0));
        let pipeline = ProcessingPipeline::new(
            Arc::new(StubTranscription {
                behavior,
                calls: transcribe_calls.clone(),
            }),
            Arc::new(StubCompletion {
                calls: complete_calls.clone(),
            }),
            None,
            Duration::from_secs(30),
        );
        TestPipeline {
            pipeline,
            transcribe_calls,
            complete_calls,
        }
    }

    fn artifact() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recording-1700000000.wav");
        std::fs::write(&path, b"riff").unwrap();
        (dir, path)
    }

    async fn drain(mut events: mpsc::UnboundedReceiver<JobEvent>) -> Vec<JobEvent> {
        let mut collected = Vec::new();
        while let Some(event) = events.recv().await {
            collected.push(event);
        }
        collected
    }

    #[tokio::test(start_paused = true)]
    async fn successful_job_publishes_stages_in_order() {
        let test = pipeline_with(Behavior::Reply("hello world"));
        let (_dir, path) = artifact();
        let (tx, rx) = mpsc::unbounded_channel();

        let job = Uuid::new_v4();
        test.pipeline.spawn(job, path, tx).await.unwrap();

        let events = drain(rx).await;
        assert!(matches!(
            events[0],
            JobEvent::Stage {
                stage: JobStage::Transcribing,
                ..
            }
        ));
        assert!(matches!(
            events[1],
            JobEvent::Stage {
                stage: JobStage::Generating,
                ..
            }
        ));
        match &events[2] {
            JobEvent::Finished {
                transcript,
                response,
                ..
            } => {
                assert_eq!(transcript, "hello world");
                assert_eq!(response, "HELLO WORLD ACK");
            }
            other => panic!("expected Finished, got {other:?}"),
        }
        assert_eq!(events.len(), 3);
        assert!(events.iter().all(|e| e.job() == job));
    }

    #[tokio::test(start_paused = true)]
    async fn stage_one_failure_never_enters_stage_two() {
        let test = pipeline_with(Behavior::FailNetwork);
        let (_dir, path) = artifact();
        let (tx, rx) = mpsc::unbounded_channel();

        test.pipeline.spawn(Uuid::new_v4(), path, tx).await.unwrap();

        let events = drain(rx).await;
        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0],
            JobEvent::Stage {
                stage: JobStage::Transcribing,
                ..
            }
        ));
        match &events[1] {
            JobEvent::Failed { error, .. } => {
                assert!(matches!(
                    error,
                    PipelineError::Transcription(ServiceError::Network(_))
                ));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
        assert_eq!(test.transcribe_calls.load(Ordering::SeqCst), 1);
        assert_eq!(test.complete_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_artifact_fails_before_stage_one_call() {
        let test = pipeline_with(Behavior::Reply("unused"));
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();

        test.pipeline
            .spawn(Uuid::new_v4(), dir.path().join("missing.wav"), tx)
            .await
            .unwrap();

        let events = drain(rx).await;
        assert!(matches!(
            events.last(),
            Some(JobEvent::Failed {
                error: PipelineError::Artifact(_),
                ..
            })
        ));
        assert_eq!(test.transcribe_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_stage_times_out_as_a_stage_failure() {
        let test = pipeline_with(Behavior::Hang);
        let (_dir, path) = artifact();
        let (tx, rx) = mpsc::unbounded_channel();

        test.pipeline.spawn(Uuid::new_v4(), path, tx).await.unwrap();

        let events = drain(rx).await;
        match events.last() {
            Some(JobEvent::Failed {
                error:
                    PipelineError::StageTimeout {
                        stage: JobStage::Transcribing,
                        timeout,
                    },
                ..
            }) => assert_eq!(*timeout, Duration::from_secs(30)),
            other => panic!("expected StageTimeout, got {other:?}"),
        }
        assert_eq!(test.complete_calls.load(Ordering::SeqCst), 0);
    }
}
