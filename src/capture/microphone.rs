//! Microphone capture on a dedicated audio thread.
//!
//! The platform audio stream is not `Send`, so it lives entirely on one
//! thread; captured samples cross into the async world over a bounded
//! channel. When the channel is full the newest buffer is dropped rather
//! than blocking the audio callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, StreamConfig};
use tokio::sync::mpsc;

use super::CaptureError;

/// Microphone input from the default audio device.
pub struct MicrophoneSource;

/// Handle to an active microphone session.
///
/// Dropping the handle signals the audio thread to stop; call `stop()` to
/// also wait for it to exit.
pub struct MicrophoneHandle {
    running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
    sample_rate: u32,
}

impl MicrophoneSource {
    /// Start capturing from the default input device.
    ///
    /// Mono i16 sample buffers are sent into `samples` as they arrive from
    /// the device. Fails with `CaptureError::Unavailable` when no usable
    /// input device exists.
    pub fn start(samples: mpsc::Sender<Vec<i16>>) -> Result<MicrophoneHandle, CaptureError> {
        let running = Arc::new(AtomicBool::new(true));
        let running_for_thread = running.clone();
        let (init_tx, init_rx) = std::sync::mpsc::sync_channel::<Result<u32, CaptureError>>(1);

        let thread = thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || run_capture_thread(samples, running_for_thread, init_tx))
            .map_err(|e| {
                CaptureError::Unavailable(format!("Audio thread spawn failed: {}", e))
            })?;

        match init_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(sample_rate)) => {
                log::info!("Microphone capture started ({} Hz)", sample_rate);
                Ok(MicrophoneHandle {
                    running,
                    thread: Some(thread),
                    sample_rate,
                })
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                running.store(false, Ordering::SeqCst);
                Err(CaptureError::Unavailable(
                    "Audio device initialization timed out".to_string(),
                ))
            }
        }
    }
}

impl MicrophoneHandle {
    /// Sample rate the device is delivering, in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Stop capturing and wait for the audio thread to exit.
    pub fn stop(mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        log::info!("Microphone capture stopped");
    }
}

impl Drop for MicrophoneHandle {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Body of the audio thread: opens the device, reports the outcome through
/// `init_tx`, then keeps the stream alive until `running` clears.
fn run_capture_thread(
    samples: mpsc::Sender<Vec<i16>>,
    running: Arc<AtomicBool>,
    init_tx: std::sync::mpsc::SyncSender<Result<u32, CaptureError>>,
) {
    let host = cpal::default_host();

    let device = match host.default_input_device() {
        Some(d) => d,
        None => {
            let _ = init_tx.send(Err(CaptureError::Unavailable(
                "No audio input device found".to_string(),
            )));
            return;
        }
    };

    log::info!("Using audio input device: {:?}", device.name());

    let supported_config = match device.default_input_config() {
        Ok(c) => c,
        Err(e) => {
            let _ = init_tx.send(Err(CaptureError::Unavailable(format!(
                "No supported audio configuration: {}",
                e
            ))));
            return;
        }
    };

    log::info!(
        "Audio config: {} Hz, {} channels, {:?}",
        supported_config.sample_rate().0,
        supported_config.channels(),
        supported_config.sample_format()
    );

    let sample_format = supported_config.sample_format();
    let config: StreamConfig = supported_config.into();
    let sample_rate = config.sample_rate.0;
    let channels = config.channels as usize;

    let stream = match build_stream(&device, &config, sample_format, channels, samples) {
        Ok(s) => s,
        Err(e) => {
            let _ = init_tx.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = init_tx.send(Err(CaptureError::Unavailable(format!(
            "Failed to start audio stream: {}",
            e
        ))));
        return;
    }

    let _ = init_tx.send(Ok(sample_rate));

    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(50));
    }

    drop(stream);
    log::debug!("Microphone capture thread exiting");
}

fn build_stream(
    device: &Device,
    config: &StreamConfig,
    sample_format: SampleFormat,
    channels: usize,
    samples: mpsc::Sender<Vec<i16>>,
) -> Result<cpal::Stream, CaptureError> {
    let err_fn = |err| log::error!("Audio stream error: {}", err);

    match sample_format {
        SampleFormat::I16 => build_stream_typed::<i16>(device, config, channels, samples, err_fn),
        SampleFormat::U16 => build_stream_typed::<u16>(device, config, channels, samples, err_fn),
        SampleFormat::F32 => build_stream_typed::<f32>(device, config, channels, samples, err_fn),
        other => Err(CaptureError::Unavailable(format!(
            "Unsupported sample format: {:?}",
            other
        ))),
    }
}

fn build_stream_typed<T>(
    device: &Device,
    config: &StreamConfig,
    channels: usize,
    samples: mpsc::Sender<Vec<i16>>,
    err_fn: impl FnMut(cpal::StreamError) + Send + 'static,
) -> Result<cpal::Stream, CaptureError>
where
    T: cpal::Sample<Float = f32> + cpal::SizedSample + Send + 'static,
{
    let stream = device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                let mono = downmix_to_mono(data, channels);
                match samples.try_send(mono) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        log::debug!("Microphone channel full, dropping buffer");
                    }
                    // Receiver gone: capture is being torn down.
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| CaptureError::Unavailable(e.to_string()))?;

    Ok(stream)
}

/// Average interleaved frames down to mono i16.
fn downmix_to_mono<T: cpal::Sample<Float = f32>>(data: &[T], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return data.iter().map(|&s| sample_to_i16(s)).collect();
    }

    data.chunks(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| sample_to_i16(s) as i32).sum();
            (sum / frame.len() as i32) as i16
        })
        .collect()
}

/// Convert any sample type to i16.
fn sample_to_i16<T: cpal::Sample<Float = f32>>(sample: T) -> i16 {
    let f32_sample: f32 = sample.to_float_sample();
    let clamped = f32_sample.clamp(-1.0, 1.0);
    (clamped * i16::MAX as f32) as i16
}
