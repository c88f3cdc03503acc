//! Capture device seam and the cpal/hound implementation.
//!
//! The device is a trait so recording sessions can be driven by scripted
//! streams in tests. The cpal stream is not `Send`, so the production
//! implementation keeps it alive on a dedicated holder thread and hands the
//! caller a `Send` handle; the input callback writes samples through a
//! shared WAV writer and publishes instantaneous power into an atomic meter.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Sample, SampleRate, StreamConfig};
use hound::WavWriter;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{error, info};

/// dBFS floor reported for silence.
pub const MIN_DB: f32 = -96.0;

#[derive(Debug, Error)]
pub enum CaptureError {
    /// No recording device available
    #[error("no input device available")]
    NoInputDevice,
    /// Sample format not supported
    #[error("sample format not supported: {0}")]
    SampleFormatNotSupported(String),
    /// Stream could not be opened
    #[error("failed to open capture stream: {0}")]
    OpenStream(String),
    /// Stream opened but could not start
    #[error("failed to start capture stream: {0}")]
    StartStream(String),
    /// Encoder could not be initialized
    #[error("failed to initialize encoder: {0}")]
    Encoder(String),
    /// Artifact could not be finalized
    #[error("failed to finalize artifact: {0}")]
    Finalize(String),
}

type Result<T> = std::result::Result<T, CaptureError>;
type WavWriterHandle = Arc<Mutex<Option<WavWriter<std::io::BufWriter<std::fs::File>>>>>;

/// Fixed capture format for recording sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    pub channels: u16,
    pub sample_rate: u32,
}

impl Default for CaptureFormat {
    fn default() -> Self {
        Self {
            channels: 1,
            sample_rate: 44_100,
        }
    }
}

/// Handle to an open capture stream. The stream meters instantaneous input
/// power and writes encoded output to the path it was opened with. Dropping
/// the handle releases the underlying stream; call `finish` to also verify
/// the encoder flushed cleanly.
pub trait CaptureStream: Send {
    /// Instantaneous input power in dBFS, floored at [`MIN_DB`].
    fn power_db(&self) -> f32;

    /// Path of the artifact being written.
    fn path(&self) -> &Path;

    /// Stop the stream and finalize the artifact. Blocks until the
    /// underlying stream is released.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Audio capture collaborator. Opens a metering stream that encodes to the
/// given path.
pub trait CaptureDevice: Send + Sync {
    fn open(&self, format: CaptureFormat, path: &Path) -> Result<Box<dyn CaptureStream>>;
}

/// Lock-free holder for the most recent input power reading. The audio
/// callback writes it, the session's level sampling reads it.
#[derive(Clone, Debug)]
pub struct PowerMeter {
    level_bits: Arc<AtomicU32>,
}

impl PowerMeter {
    pub fn new() -> Self {
        Self {
            level_bits: Arc::new(AtomicU32::new(MIN_DB.to_bits())),
        }
    }

    pub fn set_db(&self, db: f32) {
        self.level_bits.store(db.to_bits(), Ordering::Relaxed);
    }

    pub fn db(&self) -> f32 {
        f32::from_bits(self.level_bits.load(Ordering::Relaxed))
    }
}

impl Default for PowerMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert a slice of f32 samples to peak dBFS.
pub fn db_fs(data: &[f32]) -> f32 {
    let max_sample = data
        .iter()
        .fold(f32::EQUILIBRIUM, |max, &sample| sample.abs().max(max));

    (20.0 * max_sample.log10()).clamp(MIN_DB, 0.0)
}

/// Production capture device backed by the default cpal host.
pub struct CpalDevice;

impl CpalDevice {
    pub fn new() -> Self {
        Self
    }
}

impl Default for CpalDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureDevice for CpalDevice {
    fn open(&self, format: CaptureFormat, path: &Path) -> Result<Box<dyn CaptureStream>> {
        let spec = hound::WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let writer = WavWriter::create(path, spec)
            .map_err(|e| CaptureError::Encoder(e.to_string()))?;
        let writer: WavWriterHandle = Arc::new(Mutex::new(Some(writer)));

        let meter = PowerMeter::new();
        let shutdown = Arc::new(AtomicBool::new(false));

        // The stream must be built, kept alive, and dropped on one thread
        // because cpal streams are not Send. The handshake channel reports
        // open/start failures back to the caller synchronously.
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();
        let thread_writer = writer.clone();
        let thread_meter = meter.clone();
        let thread_shutdown = shutdown.clone();
        let thread = thread::spawn(move || {
            let stream = match build_input_stream(
                format,
                thread_writer,
                thread_meter,
                thread_shutdown.clone(),
            ) {
                Ok(stream) => stream,
                Err(e) => {
                    ready_tx.send(Err(e)).ok();
                    return;
                }
            };
            if let Err(e) = stream.play() {
                ready_tx.send(Err(CaptureError::StartStream(e.to_string()))).ok();
                return;
            }
            ready_tx.send(Ok(())).ok();

            while !thread_shutdown.load(Ordering::Acquire) {
                thread::park_timeout(Duration::from_millis(50));
            }
            drop(stream);
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                thread.join().ok();
                return Err(e);
            }
            Err(_) => {
                thread.join().ok();
                return Err(CaptureError::OpenStream(
                    "capture thread exited before the stream was ready".to_string(),
                ));
            }
        }

        info!(path = %path.display(), ?format, "Capture stream started");

        Ok(Box::new(CpalStream {
            path: path.to_path_buf(),
            meter,
            writer,
            shutdown,
            thread: Some(thread),
        }))
    }
}

fn build_input_stream(
    format: CaptureFormat,
    writer: WavWriterHandle,
    meter: PowerMeter,
    shutdown: Arc<AtomicBool>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(CaptureError::NoInputDevice)?;
    let default_config = device
        .default_input_config()
        .map_err(|_| CaptureError::NoInputDevice)?;

    if default_config.sample_format() != cpal::SampleFormat::F32 {
        return Err(CaptureError::SampleFormatNotSupported(format!(
            "{:?}",
            default_config.sample_format()
        )));
    }

    let config = StreamConfig {
        channels: format.channels,
        sample_rate: SampleRate(format.sample_rate),
        buffer_size: BufferSize::Default,
    };

    let err_fn = move |err| {
        error!("an error occurred on stream: {}", err);
    };

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                // Once finish() sets the shutdown flag no further samples are
                // written, even if cpal fires one more callback before the
                // stream is dropped.
                if shutdown.load(Ordering::Acquire) {
                    return;
                }
                meter.set_db(db_fs(data));
                if let Some(mut guard) = writer.try_lock() {
                    if let Some(writer) = guard.as_mut() {
                        for &sample in data.iter() {
                            writer.write_sample(sample).ok();
                        }
                    }
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| CaptureError::OpenStream(e.to_string()))?;

    Ok(stream)
}

/// Send handle to a running cpal capture stream.
struct CpalStream {
    path: PathBuf,
    meter: PowerMeter,
    writer: WavWriterHandle,
    shutdown: Arc<AtomicBool>,
    // Present until the stream has been torn down.
    thread: Option<JoinHandle<()>>,
}

impl CpalStream {
    fn teardown(&mut self) -> Result<()> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        self.shutdown.store(true, Ordering::Release);
        thread.thread().unpark();
        if thread.join().is_err() {
            return Err(CaptureError::Finalize(
                "capture thread panicked".to_string(),
            ));
        }
        match self.writer.lock().take() {
            Some(writer) => writer
                .finalize()
                .map_err(|e| CaptureError::Finalize(e.to_string())),
            None => Ok(()),
        }
    }
}

impl CaptureStream for CpalStream {
    fn power_db(&self) -> f32 {
        self.meter.db()
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        info!(path = %self.path.display(), "Ending capture");
        self.teardown()
    }
}

impl Drop for CpalStream {
    fn drop(&mut self) {
        if self.thread.is_some() {
            if let Err(e) = self.teardown() {
                error!("failed to finalize capture stream: {}", e);
            }
        }
    }
}
