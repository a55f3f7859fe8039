//! Speech synthesis and audio playback.
//!
//! Synthesis turns reply text into audio bytes (WAV/MP3) via an HTTP
//! endpoint; playback decodes and plays them on a dedicated audio thread.
//! Both sit behind traits so the turn controller can be tested with fakes,
//! and both fail soft: a broken synthesizer or missing output device
//! degrades the session to text-only instead of ending it.

use reqwest::Client;
use serde::Serialize;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;

/// Global HTTP client for reuse across requests (avoids TLS handshake overhead)
static HTTP_CLIENT: OnceLock<Client> = OnceLock::new();

fn get_http_client() -> &'static Client {
    HTTP_CLIENT.get_or_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .expect("Failed to build HTTP client")
    })
}

/// Default speech synthesis endpoint.
pub const DEFAULT_SYNTHESIS_URL: &str = "https://api.openai.com/v1/audio/speech";

/// Errors that can occur during speech synthesis.
#[derive(Debug)]
pub enum SynthesisError {
    /// API key not configured
    MissingApiKey,
    /// Network/HTTP error
    NetworkError(String),
    /// The service returned an error
    ApiError { status: u16, message: String },
}

impl std::fmt::Display for SynthesisError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SynthesisError::MissingApiKey => {
                write!(
                    f,
                    "API key not configured. Set OPENAI_API_KEY environment variable."
                )
            }
            SynthesisError::NetworkError(e) => write!(f, "Network error: {}", e),
            SynthesisError::ApiError { status, message } => {
                write!(f, "Synthesis service error ({}): {}", status, message)
            }
        }
    }
}

impl std::error::Error for SynthesisError {}

/// Errors that can occur during audio playback.
#[derive(Debug, Clone)]
pub enum PlaybackError {
    /// No usable audio output on this host
    Unavailable(String),
    /// The audio bytes could not be decoded
    DecodeFailed(String),
    /// The playback thread is gone
    Closed,
}

impl std::fmt::Display for PlaybackError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PlaybackError::Unavailable(e) => write!(f, "Audio output unavailable: {}", e),
            PlaybackError::DecodeFailed(e) => write!(f, "Failed to decode audio: {}", e),
            PlaybackError::Closed => write!(f, "Playback thread closed"),
        }
    }
}

impl std::error::Error for PlaybackError {}

/// Turns text into playable audio bytes.
#[async_trait::async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize text to audio bytes. An empty result skips playback.
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, SynthesisError>;
}

/// Plays audio bytes; one utterance at a time.
pub trait PlaybackSink: Send + Sync {
    /// Begin playing. The returned receiver resolves when playback finishes
    /// naturally, is stopped, or fails.
    fn play(&self, audio: Vec<u8>) -> oneshot::Receiver<Result<(), PlaybackError>>;

    /// Stop current playback immediately. Safe when nothing is playing.
    fn stop(&self);

    /// Whether audio is currently playing.
    fn is_active(&self) -> bool;
}

/// Configuration for the HTTP synthesizer.
#[derive(Debug, Clone)]
pub struct SynthesizerConfig {
    pub url: String,
    pub api_key: String,
    pub model: String,
    pub voice: String,
}

impl SynthesizerConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            url: DEFAULT_SYNTHESIS_URL.to_string(),
            api_key: api_key.into(),
            model: "tts-1".to_string(),
            voice: "alloy".to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct SynthesisRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
}

/// HTTP synthesizer against an OpenAI-style `audio/speech` endpoint.
pub struct HttpSynthesizer {
    config: SynthesizerConfig,
}

impl HttpSynthesizer {
    pub fn new(config: SynthesizerConfig) -> Self {
        Self { config }
    }
}

#[async_trait::async_trait]
impl SpeechSynthesizer for HttpSynthesizer {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>, SynthesisError> {
        if self.config.api_key.is_empty() {
            return Err(SynthesisError::MissingApiKey);
        }

        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }

        let body = SynthesisRequest {
            model: &self.config.model,
            input: text,
            voice: &self.config.voice,
        };

        let response = get_http_client()
            .post(&self.config.url)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| SynthesisError::NetworkError(e.to_string()))?;

        let status = response.status();

        if status.is_success() {
            let bytes = response
                .bytes()
                .await
                .map_err(|e| SynthesisError::NetworkError(e.to_string()))?;
            log::info!("Synthesized {} chars into {} bytes", text.len(), bytes.len());
            Ok(bytes.to_vec())
        } else {
            let message = response.text().await.unwrap_or_default();
            log::error!("Synthesis service error ({}): {}", status.as_u16(), message);
            Err(SynthesisError::ApiError {
                status: status.as_u16(),
                message,
            })
        }
    }
}

/// Command sent to the playback thread.
enum PlaybackCommand {
    Play(Vec<u8>, oneshot::Sender<Result<(), PlaybackError>>),
    Stop,
}

/// Playback through the default output device.
///
/// The audio objects are not `Send`, so they live on a dedicated thread fed
/// over a channel; `stop()` interrupts an in-progress utterance.
pub struct RodioPlayback {
    commands: std::sync::mpsc::Sender<PlaybackCommand>,
    active: Arc<AtomicBool>,
}

impl RodioPlayback {
    pub fn new() -> Self {
        let (tx, rx) = std::sync::mpsc::channel::<PlaybackCommand>();
        let active = Arc::new(AtomicBool::new(false));
        let active_for_thread = active.clone();

        // The thread exits when the command sender is dropped.
        if let Err(e) = thread::Builder::new()
            .name("audio-playback".to_string())
            .spawn(move || run_playback_thread(rx, active_for_thread))
        {
            log::error!("Failed to spawn playback thread: {}", e);
        }

        Self {
            commands: tx,
            active,
        }
    }
}

impl Default for RodioPlayback {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackSink for RodioPlayback {
    fn play(&self, audio: Vec<u8>) -> oneshot::Receiver<Result<(), PlaybackError>> {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .commands
            .send(PlaybackCommand::Play(audio, done_tx))
            .is_err()
        {
            // Thread gone: resolve immediately through a fresh channel.
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(Err(PlaybackError::Closed));
            return rx;
        }
        done_rx
    }

    fn stop(&self) {
        let _ = self.commands.send(PlaybackCommand::Stop);
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

/// Body of the playback thread. The output stream is created lazily on the
/// first utterance so a host without audio output fails per-play rather
/// than at construction.
fn run_playback_thread(
    commands: std::sync::mpsc::Receiver<PlaybackCommand>,
    active: Arc<AtomicBool>,
) {
    let mut output: Option<(rodio::OutputStream, rodio::Sink)> = None;

    while let Ok(command) = commands.recv() {
        match command {
            PlaybackCommand::Play(audio, done) => {
                if audio.is_empty() {
                    let _ = done.send(Ok(()));
                    continue;
                }

                if output.is_none() {
                    match build_output() {
                        Ok(built) => output = Some(built),
                        Err(e) => {
                            log::warn!("Audio output unavailable: {}", e);
                            let _ = done.send(Err(PlaybackError::Unavailable(e)));
                            continue;
                        }
                    }
                }
                let Some((_stream, sink)) = output.as_ref() else {
                    continue;
                };

                let source = match rodio::Decoder::new(Cursor::new(audio)) {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = done.send(Err(PlaybackError::DecodeFailed(e.to_string())));
                        continue;
                    }
                };

                sink.append(source);
                sink.play();
                active.store(true, Ordering::Release);
                log::debug!("Playback started");

                // Wait for the sink to drain, keeping the command channel
                // responsive so Stop can interrupt.
                let mut stopped = false;
                while !sink.empty() {
                    match commands.recv_timeout(Duration::from_millis(25)) {
                        Ok(PlaybackCommand::Stop) => {
                            sink.stop();
                            stopped = true;
                            break;
                        }
                        Ok(PlaybackCommand::Play(_, late_done)) => {
                            // One utterance at a time; the controller never
                            // overlaps playback, so refuse rather than queue.
                            let _ = late_done.send(Err(PlaybackError::Closed));
                        }
                        Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                        Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                            sink.stop();
                            stopped = true;
                            break;
                        }
                    }
                }

                active.store(false, Ordering::Release);
                log::debug!(
                    "Playback finished ({})",
                    if stopped { "stopped" } else { "natural end" }
                );
                let _ = done.send(Ok(()));
            }
            PlaybackCommand::Stop => {
                // Nothing playing; stop is idempotent.
            }
        }
    }

    log::debug!("Playback thread exiting");
}

fn build_output() -> Result<(rodio::OutputStream, rodio::Sink), String> {
    let (stream, handle) = rodio::OutputStream::try_default().map_err(|e| e.to_string())?;
    let sink = rodio::Sink::try_new(&handle).map_err(|e| e.to_string())?;
    Ok((stream, sink))
}
