//! Session coordinator: the single task that owns every externally visible
//! state transition. Hotkey activations, pipeline results, and the sampling
//! timers are all funneled into one select loop, so level sampling and
//! silence checks can never interleave with a stop, and activations that
//! arrive mid-transition queue in the channel until the transition is done.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use murmur_audio::{
    CaptureDevice, LevelMonitor, RecordingSession, SessionState, artifact_file_name,
};
use murmur_core::{AssistantState, Config};
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::event::UiEvent;
use crate::hotkey::Activation;
use crate::pipeline::{
    JobEvent, JobStage, JobStatus, PipelineError, ProcessingJob, ProcessingPipeline,
};

/// Cadence of level sampling while a session is active.
pub const LEVEL_SAMPLE_INTERVAL: Duration = Duration::from_millis(100);
/// Cadence of the silence check while a session is active.
pub const SILENCE_CHECK_INTERVAL: Duration = Duration::from_millis(500);
/// How long a terminal job status stays visible before reverting to idle.
pub const STATUS_REVERT_DELAY: Duration = Duration::from_secs(3);

struct RunningJob {
    record: ProcessingJob,
    handle: tokio::task::JoinHandle<()>,
}

/// Top-level orchestrator wiring hotkey activations, recording sessions,
/// and processing jobs together. All collaborators are injected.
pub struct SessionCoordinator {
    device: Arc<dyn CaptureDevice>,
    pipeline: ProcessingPipeline,
    config: Arc<RwLock<Config>>,
    activations: mpsc::Receiver<Activation>,
    ui: mpsc::UnboundedSender<UiEvent>,
    job_events_tx: mpsc::UnboundedSender<JobEvent>,
    job_events: mpsc::UnboundedReceiver<JobEvent>,
    session: Option<RecordingSession>,
    job: Option<RunningJob>,
    revert_at: Option<(Uuid, Instant)>,
}

impl SessionCoordinator {
    pub fn new(
        device: Arc<dyn CaptureDevice>,
        pipeline: ProcessingPipeline,
        config: Arc<RwLock<Config>>,
        activations: mpsc::Receiver<Activation>,
        ui: mpsc::UnboundedSender<UiEvent>,
    ) -> Self {
        let (job_events_tx, job_events) = mpsc::unbounded_channel();
        Self {
            device,
            pipeline,
            config,
            activations,
            ui,
            job_events_tx,
            job_events,
            session: None,
            job: None,
            revert_at: None,
        }
    }

    /// Run the coordinator loop until a shutdown signal is received.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut level_tick = tokio::time::interval(LEVEL_SAMPLE_INTERVAL);
        let mut silence_tick = tokio::time::interval(SILENCE_CHECK_INTERVAL);
        level_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        silence_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let recording = self
                .session
                .as_ref()
                .is_some_and(|s| s.state() == SessionState::Active);
            let revert_deadline = self.revert_at.map(|(_, at)| at);

            tokio::select! {
                _ = shutdown.changed() => {
                    info!("Session coordinator shutting down");
                    break;
                }

                Some(_activation) = self.activations.recv() => {
                    self.handle_activation();
                }

                Some(event) = self.job_events.recv() => {
                    self.handle_job_event(event);
                }

                _ = level_tick.tick(), if recording => {
                    self.sample_level();
                }

                _ = silence_tick.tick(), if recording => {
                    self.check_silence();
                }

                _ = tokio::time::sleep_until(revert_deadline.unwrap_or_else(Instant::now)),
                    if revert_deadline.is_some() =>
                {
                    self.revert_status();
                }
            }
        }

        // Shutdown: cancel the in-flight job and release any open capture
        // stream before the task ends.
        if let Some(job) = self.job.take() {
            job.handle.abort();
        }
        self.session = None;
    }

    /// Toggle: stop the capturing session, otherwise start a new one.
    fn handle_activation(&mut self) {
        if self
            .session
            .as_ref()
            .is_some_and(|s| !s.state().is_terminal())
        {
            self.finish_session();
        } else {
            self.start_session();
        }
    }

    fn start_session(&mut self) {
        // Starting a new capture supersedes any job still in flight.
        self.cancel_stale_job();
        self.revert_at = None;

        let (threshold, max_silence, dir) = {
            let config = self.config.read();
            (
                config.silence_threshold(),
                config.max_silence(),
                config.recordings_dir(),
            )
        };
        let dir = match dir {
            Ok(dir) => dir,
            Err(e) => return self.fail_session(format!("no recordings directory: {e}")),
        };
        if let Err(e) = std::fs::create_dir_all(&dir) {
            return self.fail_session(format!(
                "failed to create recordings directory {}: {e}",
                dir.display()
            ));
        }

        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let path = dir.join(artifact_file_name(stamp));

        let mut session =
            RecordingSession::new(path, LevelMonitor::new(threshold), max_silence);
        match session.start(self.device.as_ref(), Instant::now().into_std()) {
            Ok(()) => {
                info!(session = %session.id(), "Recording session started");
                self.session = Some(session);
                self.set_state(AssistantState::Recording);
            }
            Err(e) => self.fail_session(e.to_string()),
        }
    }

    /// Stop the current session; on a completed artifact hand it to the
    /// pipeline, on failure surface the error without starting one.
    fn finish_session(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let session_id = session.id();
        match session.stop() {
            Some(Ok(artifact)) => self.start_job(session_id, artifact),
            Some(Err(e)) => self.fail_session(e.to_string()),
            None => {
                warn!(session = %session_id, "Stop ignored: session was not capturing");
                self.set_state(AssistantState::Idle);
            }
        }
    }

    fn fail_session(&mut self, message: String) {
        error!("Recording failed: {}", message);
        self.ui.send(UiEvent::SessionFailed(message)).ok();
        self.set_state(AssistantState::Idle);
    }

    fn start_job(&mut self, session: Uuid, artifact: PathBuf) {
        let job = Uuid::new_v4();
        let handle = self
            .pipeline
            .spawn(job, artifact, self.job_events_tx.clone());
        self.job = Some(RunningJob {
            record: ProcessingJob::new(job, session),
            handle,
        });
        info!(job = %job, session = %session, "Processing job started");
    }

    /// Chosen overlap policy: a new recording cancels the stale job. The
    /// abort drops the in-flight stage future, releasing its connection;
    /// forgetting the job id makes any already-queued events stale.
    fn cancel_stale_job(&mut self) {
        let Some(mut job) = self.job.take() else {
            return;
        };
        if job.record.status.is_terminal() {
            return;
        }
        job.handle.abort();
        job.record.status = JobStatus::Error;
        job.record.error = Some(PipelineError::Cancelled.to_string());
        info!(job = %job.record.id, "Cancelled in-flight job superseded by new recording");
    }

    fn handle_job_event(&mut self, event: JobEvent) {
        let current = self.job.as_ref().map(|j| j.record.id);
        if current != Some(event.job()) {
            info!(job = %event.job(), "Dropping stale result from superseded job");
            return;
        }

        match event {
            JobEvent::Stage { stage, .. } => {
                if let Some(job) = self.job.as_mut() {
                    job.record.status = match stage {
                        JobStage::Transcribing => JobStatus::Transcribing,
                        JobStage::Generating => JobStatus::Generating,
                    };
                }
                self.set_state(match stage {
                    JobStage::Transcribing => AssistantState::Transcribing,
                    JobStage::Generating => AssistantState::Generating,
                });
            }
            JobEvent::Finished {
                job,
                transcript,
                response,
            } => {
                if let Some(running) = self.job.as_mut() {
                    running.record.status = JobStatus::Complete;
                    running.record.transcript = Some(transcript.clone());
                    running.record.response = Some(response.clone());
                }
                self.ui.send(UiEvent::TranscriptReady(transcript)).ok();
                self.ui.send(UiEvent::ResponseReady(response)).ok();
                self.set_state(AssistantState::Complete);
                self.revert_at = Some((job, Instant::now() + STATUS_REVERT_DELAY));
            }
            JobEvent::Failed { job, error } => {
                if let Some(running) = self.job.as_mut() {
                    running.record.status = JobStatus::Error;
                    running.record.error = Some(error.to_string());
                }
                self.ui.send(UiEvent::JobFailed(error.to_string())).ok();
                self.set_state(AssistantState::Failed);
                self.revert_at = Some((job, Instant::now() + STATUS_REVERT_DELAY));
            }
        }
    }

    fn sample_level(&mut self) {
        let now = Instant::now().into_std();
        if let Some(session) = self.session.as_mut() {
            session.sample_level(now);
        }
    }

    fn check_silence(&mut self) {
        let now = Instant::now().into_std();
        if self
            .session
            .as_ref()
            .is_some_and(|s| s.should_auto_stop(now))
        {
            info!("Max silence reached, stopping recording");
            self.finish_session();
        }
    }

    /// The terminal-status debounce: ~3 s after Complete/Error the visible
    /// status returns to Idle, once, unless a new cycle already started.
    fn revert_status(&mut self) {
        let Some((job, _)) = self.revert_at.take() else {
            return;
        };
        if self.job.as_ref().is_some_and(|j| j.record.id == job) {
            self.job = None;
            self.set_state(AssistantState::Idle);
        }
    }

    fn set_state(&self, state: AssistantState) {
        self.ui.send(UiEvent::StateChanged(state)).ok();
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;
    use murmur_audio::{CaptureError, CaptureFormat, CaptureStream, MIN_DB};
    use murmur_services::{CompletionService, ServiceError, TranscriptionService};
    use parking_lot::Mutex;

    use super::*;

    struct ScriptedDevice {
        db: Arc<Mutex<f32>>,
    }

    impl ScriptedDevice {
        fn new() -> Self {
            Self {
                db: Arc::new(Mutex::new(-6.0)),
            }
        }
    }

    struct ScriptedStream {
        db: Arc<Mutex<f32>>,
        path: PathBuf,
    }

    impl CaptureStream for ScriptedStream {
        fn power_db(&self) -> f32 {
            *self.db.lock()
        }

        fn path(&self) -> &Path {
            &self.path
        }

        fn finish(self: Box<Self>) -> Result<(), CaptureError> {
            Ok(())
        }
    }

    impl CaptureDevice for ScriptedDevice {
        fn open(
            &self,
            _format: CaptureFormat,
            path: &Path,
        ) -> Result<Box<dyn CaptureStream>, CaptureError> {
            std::fs::write(path, b"riff").unwrap();
            Ok(Box::new(ScriptedStream {
                db: self.db.clone(),
                path: path.to_path_buf(),
            }))
        }
    }

    #[derive(Clone, Copy)]
    enum Behavior {
        Reply(&'static str),
        FailNetwork,
        HangThenReply(&'static str),
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
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Reply(text) => Ok(text.to_string()),
                Behavior::FailNetwork => Err(ServiceError::Network("connection reset".into())),
                Behavior::HangThenReply(text) => {
                    if call == 0 {
                        std::future::pending().await
                    } else {
                        Ok(text.to_string())
                    }
                }
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

    struct Harness {
        activations: mpsc::Sender<Activation>,
        ui: mpsc::UnboundedReceiver<UiEvent>,
        _shutdown: watch::Sender<bool>,
        level: Arc<Mutex<f32>>,
        transcribe_calls: Arc<AtomicUsize>,
        complete_calls: Arc<AtomicUsize>,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        async fn activate(&self) {
            self.activations
                .send(Activation { binding_id: 1 })
                .await
                .unwrap();
        }

        /// Next UI event; paused time advances while waiting.
        async fn next_event(&mut self) -> UiEvent {
            tokio::time::timeout(Duration::from_secs(60), self.ui.recv())
                .await
                .expect("no UI event within virtual minute")
                .expect("coordinator closed the UI channel")
        }

        async fn expect_state(&mut self, state: AssistantState) {
            let event = self.next_event().await;
            assert_eq!(event, UiEvent::StateChanged(state));
        }
    }

    fn spawn_coordinator(behavior: Behavior) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            recordings_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };

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

        let device = ScriptedDevice::new();
        let level = device.db.clone();

        let (activation_tx, activation_rx) = mpsc::channel(16);
        let (ui_tx, ui_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let coordinator = SessionCoordinator::new(
            Arc::new(device),
            pipeline,
            Arc::new(RwLock::new(config)),
            activation_rx,
            ui_tx,
        );
        tokio::spawn(coordinator.run(shutdown_rx));

        Harness {
            activations: activation_tx,
            ui: ui_rx,
            _shutdown: shutdown_tx,
            level,
            transcribe_calls,
            complete_calls,
            _dir: dir,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_starts_then_stops_and_pipelines() {
        let mut harness = spawn_coordinator(Behavior::Reply("hello world"));

        harness.activate().await;
        harness.expect_state(AssistantState::Recording).await;

        harness.activate().await;
        harness.expect_state(AssistantState::Transcribing).await;
        harness.expect_state(AssistantState::Generating).await;
        assert_eq!(
            harness.next_event().await,
            UiEvent::TranscriptReady("hello world".to_string())
        );
        assert_eq!(
            harness.next_event().await,
            UiEvent::ResponseReady("HELLO WORLD ACK".to_string())
        );
        harness.expect_state(AssistantState::Complete).await;
    }

    #[tokio::test(start_paused = true)]
    async fn silence_auto_stops_and_runs_the_full_scenario() {
        let mut harness = spawn_coordinator(Behavior::Reply("hello world"));

        // Speaking at half scale.
        *harness.level.lock() = -6.0;
        harness.activate().await;
        harness.expect_state(AssistantState::Recording).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        // Then silence: auto-stop after five more seconds, no second press.
        *harness.level.lock() = MIN_DB;
        harness.expect_state(AssistantState::Transcribing).await;
        harness.expect_state(AssistantState::Generating).await;
        assert_eq!(
            harness.next_event().await,
            UiEvent::TranscriptReady("hello world".to_string())
        );
        assert_eq!(
            harness.next_event().await,
            UiEvent::ResponseReady("HELLO WORLD ACK".to_string())
        );
        harness.expect_state(AssistantState::Complete).await;
        assert_eq!(harness.transcribe_calls.load(Ordering::SeqCst), 1);
        assert_eq!(harness.complete_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn status_reverts_to_idle_once_after_terminal() {
        let mut harness = spawn_coordinator(Behavior::Reply("hello world"));

        harness.activate().await;
        harness.expect_state(AssistantState::Recording).await;
        harness.activate().await;
        harness.expect_state(AssistantState::Transcribing).await;
        harness.expect_state(AssistantState::Generating).await;
        harness.next_event().await; // transcript
        harness.next_event().await; // response
        harness.expect_state(AssistantState::Complete).await;

        let before = Instant::now();
        harness.expect_state(AssistantState::Idle).await;
        let elapsed = before.elapsed();
        assert!(
            elapsed >= STATUS_REVERT_DELAY && elapsed < STATUS_REVERT_DELAY + Duration::from_secs(1),
            "revert after {elapsed:?}"
        );

        // Exactly once: nothing further arrives.
        let quiet =
            tokio::time::timeout(Duration::from_secs(10), harness.ui.recv()).await;
        assert!(quiet.is_err(), "unexpected event after revert: {quiet:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn stage_one_failure_reports_error_and_skips_completion() {
        let mut harness = spawn_coordinator(Behavior::FailNetwork);

        harness.activate().await;
        harness.expect_state(AssistantState::Recording).await;
        harness.activate().await;
        harness.expect_state(AssistantState::Transcribing).await;

        match harness.next_event().await {
            UiEvent::JobFailed(message) => {
                assert!(message.contains("network error"), "got {message}");
            }
            other => panic!("expected JobFailed, got {other:?}"),
        }
        harness.expect_state(AssistantState::Failed).await;
        harness.expect_state(AssistantState::Idle).await;
        assert_eq!(harness.complete_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn new_recording_cancels_the_stale_job() {
        let mut harness = spawn_coordinator(Behavior::HangThenReply("second take"));

        // First cycle: the transcription hangs.
        harness.activate().await;
        harness.expect_state(AssistantState::Recording).await;
        harness.activate().await;
        harness.expect_state(AssistantState::Transcribing).await;

        // Third press: starts a new session and cancels the hung job.
        harness.activate().await;
        harness.expect_state(AssistantState::Recording).await;
        harness.activate().await;

        harness.expect_state(AssistantState::Transcribing).await;
        harness.expect_state(AssistantState::Generating).await;
        assert_eq!(
            harness.next_event().await,
            UiEvent::TranscriptReady("second take".to_string())
        );
        assert_eq!(
            harness.next_event().await,
            UiEvent::ResponseReady("SECOND TAKE ACK".to_string())
        );
        harness.expect_state(AssistantState::Complete).await;

        // Both sessions transcribed, only the surviving job completed, and
        // no failure from the cancelled job ever surfaced.
        assert_eq!(harness.transcribe_calls.load(Ordering::SeqCst), 2);
        assert_eq!(harness.complete_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn odd_activations_leave_recording_even_leave_idle() {
        let mut harness = spawn_coordinator(Behavior::Reply("parity"));

        for _round in 0..3 {
            harness.activate().await;
            harness.expect_state(AssistantState::Recording).await;

            harness.activate().await;
            harness.expect_state(AssistantState::Transcribing).await;
            harness.expect_state(AssistantState::Generating).await;
            harness.next_event().await; // transcript
            harness.next_event().await; // response
            harness.expect_state(AssistantState::Complete).await;
            harness.expect_state(AssistantState::Idle).await;
        }
    }
}
