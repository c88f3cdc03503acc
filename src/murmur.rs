use std::sync::Arc;

use anyhow::{Context, Result};
use global_hotkey::GlobalHotKeyEvent;
use murmur::coordinator::SessionCoordinator;
use murmur::event::UiEvent;
use murmur::hotkey::{ActivationFilter, HotkeyBinding, HotkeyRegistry};
use murmur::notify::NotificationLayer;
use murmur::pipeline::ProcessingPipeline;
use murmur::{
    ConfigManager, CpalDevice, DEFAULT_LOG_LEVEL, OpenAiCompletion, OpenAiCompletionConfig,
    OpenAiTranscription, OpenAiTranscriptionConfig, VERSION,
};
use parking_lot::RwLock;
use tao::event::{Event, StartCause};
use tao::event_loop::{ControlFlow, EventLoop, EventLoopBuilder};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn main() -> Result<()> {
    // Initialize the logger
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("MURMUR_LOG")
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL)),
        )
        .finish()
        .with(NotificationLayer::new())
        .init();

    // Load config
    let config_manager = ConfigManager::new()?;
    let config = Arc::new(RwLock::new(config_manager.load()?));
    // save back the config to create the file if it doesn't exist
    config_manager.save(&config.read())?;

    // Set up the hotkey
    let binding = match config.read().hotkey.as_deref() {
        Some(spec) => HotkeyBinding::parse(spec)?,
        None => HotkeyBinding::default_binding(),
    };
    info!(binding = %binding.description, "Using hotkey");
    let mut registry = HotkeyRegistry::new()?;
    let handle = registry
        .register(binding)
        .context("Failed to register hotkey")?;
    let mut filter = ActivationFilter::new(handle.id());

    // Collaborators for the pipeline, injected at construction
    let (transcription, completion, language, stage_timeout) = {
        let config = config.read();
        let api_key = config.key_openai().unwrap_or_default().to_string();
        let mut transcription_config = OpenAiTranscriptionConfig::new(api_key.clone());
        if let Some(model) = config.transcription_model() {
            transcription_config = transcription_config.with_model(model);
        }
        let mut completion_config = OpenAiCompletionConfig::new(api_key);
        if let Some(model) = config.completion_model() {
            completion_config = completion_config.with_model(model);
        }
        (
            OpenAiTranscription::new(transcription_config),
            OpenAiCompletion::new(completion_config),
            config.language().map(str::to_owned),
            config.stage_timeout(),
        )
    };
    let pipeline = ProcessingPipeline::new(
        Arc::new(transcription),
        Arc::new(completion),
        language,
        stage_timeout,
    );

    // Channels between the OS event loop and the coordinator
    let (activation_tx, activation_rx) = mpsc::channel(16);
    let (ui_tx, mut ui_rx) = mpsc::unbounded_channel();
    // The sender side never fires: the process runs until it is killed, and
    // the event loop below never returns, so this frame keeps it alive.
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    // Run the coordinator on its own runtime
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()?;
    let coordinator = SessionCoordinator::new(
        Arc::new(CpalDevice::new()),
        pipeline,
        config.clone(),
        activation_rx,
        ui_tx,
    );
    runtime.spawn(coordinator.run(shutdown_rx));

    // Set up the event loop
    let hotkey_channel = GlobalHotKeyEvent::receiver();
    let event_loop: EventLoop<UiEvent> = EventLoopBuilder::with_user_event().build();
    let event_sender = event_loop.create_proxy();

    // Forward coordinator output to the event loop
    runtime.spawn(async move {
        while let Some(event) = ui_rx.recv().await {
            if event_sender.send_event(event).is_err() {
                break;
            }
        }
    });

    event_loop.run(move |event, _, control_flow| {
        *control_flow = ControlFlow::Wait;

        if let Event::NewEvents(StartCause::Init) = event {
            info!(version = VERSION, "Murmur ready, press the hotkey to talk");
        }

        // Surface coordinator output. This is the whole UI: structured logs,
        // with warnings and errors mirrored as desktop notifications.
        if let Event::UserEvent(event) = event {
            match event {
                UiEvent::StateChanged(state) => info!(state = ?state, "State changed"),
                UiEvent::TranscriptReady(text) => info!(transcript = %text, "Transcript ready"),
                UiEvent::ResponseReady(text) => info!(response = %text, "Response ready"),
                UiEvent::SessionFailed(message) => warn!("Recording failed: {}", message),
                UiEvent::JobFailed(message) => warn!("Processing failed: {}", message),
            }
        }

        // Forward hotkey presses as logical activations
        if let Ok(event) = hotkey_channel.try_recv() {
            if let Some(activation) = filter.filter(event.id(), event.state()) {
                if activation_tx.try_send(activation).is_err() {
                    warn!("Activation dropped: coordinator queue is full");
                }
            }
        }
    });
}
