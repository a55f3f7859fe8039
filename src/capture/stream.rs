//! Streaming speech recognizer over WebSocket.
//!
//! Production [`SpeechCapture`] implementation: microphone samples are
//! downsampled, base64-encoded and streamed to a realtime speech-to-text
//! service; transcript deltas come back as interim events and each
//! server-segmented speech span arrives as one final event.
//!
//! # Connection Flow
//!
//! 1. Connect (with retries), receive `session.created`
//! 2. Send session config enabling server-side VAD segmentation,
//!    receive `session.updated`
//! 3. Stream audio chunks; consume transcript events until stopped
//!
//! # Retry Strategy
//!
//! Initial connection retries 3 times with exponential backoff (1s, 2s, 4s).
//! A mid-session disconnect is reported as `CaptureEvent::Ended`; the turn
//! controller decides whether to restart.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;

use super::microphone::{MicrophoneHandle, MicrophoneSource};
use super::protocol::{ClientMessage, ServerMessage};
use super::{CaptureError, CaptureEvent, SpeechCapture};

/// Default realtime endpoint (model selected via query parameter).
pub const DEFAULT_REALTIME_URL: &str =
    "wss://api.openai.com/v1/realtime?model=gpt-4o-realtime-preview-2024-12-17";

/// Connection timeout for the initial WebSocket handshake.
const CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Timeout for session setup messages.
const SESSION_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum retry attempts for the initial connection.
const MAX_RETRIES: u32 = 3;

/// Base delay for exponential backoff (doubles each retry).
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Configuration for the streaming recognizer.
#[derive(Debug, Clone)]
pub struct RecognizerConfig {
    /// WebSocket endpoint of the realtime service.
    pub url: String,
    /// Bearer API key.
    pub api_key: String,
    /// Transcription model requested in the session config.
    pub model: String,
    /// Sample rate the service expects (PCM16 mono).
    pub target_sample_rate: u32,
    /// Duration of each audio chunk sent over the socket.
    pub chunk_duration_ms: u32,
}

impl RecognizerConfig {
    /// Default configuration against the standard endpoint.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            url: DEFAULT_REALTIME_URL.to_string(),
            api_key: api_key.into(),
            model: "whisper-1".to_string(),
            target_sample_rate: 24_000,
            chunk_duration_ms: 100,
        }
    }

    /// Samples per chunk at the target sample rate.
    pub fn samples_per_chunk(&self) -> usize {
        (self.target_sample_rate * self.chunk_duration_ms / 1000) as usize
    }
}

/// Tasks and handles belonging to one active capture session.
struct ActiveCapture {
    cancel: CancellationToken,
    mic: Option<MicrophoneHandle>,
    send_task: tokio::task::JoinHandle<()>,
    recv_task: tokio::task::JoinHandle<()>,
}

/// Streaming speech recognizer: microphone in, transcript events out.
pub struct RealtimeRecognizer {
    config: RecognizerConfig,
    active: tokio::sync::Mutex<Option<ActiveCapture>>,
}

impl RealtimeRecognizer {
    pub fn new(config: RecognizerConfig) -> Self {
        Self {
            config,
            active: tokio::sync::Mutex::new(None),
        }
    }

    async fn teardown(&self, active: ActiveCapture) {
        active.cancel.cancel();

        if let Some(mic) = active.mic {
            // stop() joins the audio thread; keep that off the async runtime.
            let _ = tokio::task::spawn_blocking(move || mic.stop()).await;
        }

        let _ = timeout(Duration::from_secs(2), async {
            let _ = active.send_task.await;
            let _ = active.recv_task.await;
        })
        .await;
    }
}

#[async_trait::async_trait]
impl SpeechCapture for RealtimeRecognizer {
    async fn start(&self, events: mpsc::Sender<CaptureEvent>) -> Result<(), CaptureError> {
        if self.config.api_key.is_empty() {
            return Err(CaptureError::Unavailable(
                "API key not configured. Set OPENAI_API_KEY.".to_string(),
            ));
        }

        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            log::debug!("Recognizer already running, replacing session");
            self.teardown(previous).await;
        }

        // Microphone first: a host without audio input should fail before we
        // open a network connection.
        let (samples_tx, samples_rx) = mpsc::channel::<Vec<i16>>(100);
        let mic = MicrophoneSource::start(samples_tx)?;
        let source_sample_rate = mic.sample_rate();

        let ws = match connect_with_retry(&self.config).await {
            Ok(ws) => ws,
            Err(e) => {
                let _ = tokio::task::spawn_blocking(move || mic.stop()).await;
                return Err(e);
            }
        };

        let (write, read) = ws.split();
        let cancel = CancellationToken::new();

        let send_task = tokio::spawn(run_audio_stream(
            samples_rx,
            write,
            source_sample_rate,
            self.config.target_sample_rate,
            self.config.samples_per_chunk(),
            cancel.clone(),
        ));
        let recv_task = tokio::spawn(run_transcript_stream(read, events, cancel.clone()));

        *active = Some(ActiveCapture {
            cancel,
            mic: Some(mic),
            send_task,
            recv_task,
        });

        log::info!("Recognizer session started ({} Hz source)", source_sample_rate);
        Ok(())
    }

    async fn stop(&self) {
        let taken = self.active.lock().await.take();
        match taken {
            Some(active) => {
                self.teardown(active).await;
                log::info!("Recognizer session stopped");
            }
            None => {
                log::debug!("Recognizer stop with no active session");
            }
        }
    }
}

/// Establish and configure a session, retrying the initial connection.
async fn connect_with_retry(config: &RecognizerConfig) -> Result<WsStream, CaptureError> {
    let mut last_error = None;

    for attempt in 0..MAX_RETRIES {
        if attempt > 0 {
            let delay = RETRY_BASE_DELAY * 2u32.pow(attempt - 1);
            log::info!(
                "Retrying recognizer connection in {:?} (attempt {}/{})",
                delay,
                attempt + 1,
                MAX_RETRIES
            );
            tokio::time::sleep(delay).await;
        }

        match try_connect(config).await {
            Ok(ws) => return Ok(ws),
            Err(e) => {
                log::warn!("Connection attempt {} failed: {}", attempt + 1, e);
                last_error = Some(e);
            }
        }
    }

    Err(last_error
        .unwrap_or_else(|| CaptureError::ConnectionFailed("Max retries exceeded".to_string())))
}

/// Single connection + session setup attempt (no retries).
async fn try_connect(config: &RecognizerConfig) -> Result<WsStream, CaptureError> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| CaptureError::ConnectionFailed(e.to_string()))?;

    request.headers_mut().insert(
        "Authorization",
        HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .map_err(|e| CaptureError::AuthenticationFailed(e.to_string()))?,
    );
    request
        .headers_mut()
        .insert("OpenAI-Beta", HeaderValue::from_static("realtime=v1"));

    log::info!("Connecting to recognizer service...");

    let (mut ws, _response) = timeout(
        CONNECTION_TIMEOUT,
        connect_async_with_config(
            request, None, false, // disable_nagle (we want low latency)
        ),
    )
    .await
    .map_err(|_| CaptureError::ConnectionFailed("Connection timeout".to_string()))?
    .map_err(|e| CaptureError::ConnectionFailed(e.to_string()))?;

    // Wait for session.created
    let session_id = timeout(SESSION_TIMEOUT, async {
        while let Some(msg_result) = ws.next().await {
            match msg_result {
                Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(ServerMessage::SessionCreated { session }) => {
                        return Ok(session.id);
                    }
                    Ok(ServerMessage::Error { error }) => {
                        return Err(CaptureError::AuthenticationFailed(error.message));
                    }
                    Ok(_) => {
                        log::debug!("Ignoring message while waiting for session.created");
                    }
                    Err(e) => {
                        log::warn!("Failed to parse message: {}", e);
                    }
                },
                Ok(Message::Close(_)) => {
                    return Err(CaptureError::ConnectionFailed(
                        "Connection closed before session created".to_string(),
                    ));
                }
                Err(e) => {
                    return Err(CaptureError::ProtocolError(e.to_string()));
                }
                _ => {} // Ignore ping/pong/binary
            }
        }
        Err(CaptureError::ConnectionFailed("Stream ended".to_string()))
    })
    .await
    .map_err(|_| CaptureError::ConnectionFailed("Session creation timeout".to_string()))??;

    log::info!("Recognizer session created: {}", session_id);

    // Configure for continuous transcription with server-side segmentation
    let config_msg = serde_json::to_string(&ClientMessage::configure(&config.model))
        .map_err(|e| CaptureError::ProtocolError(e.to_string()))?;
    ws.send(Message::Text(config_msg))
        .await
        .map_err(|e| CaptureError::SendFailed(e.to_string()))?;

    // Wait for session.updated
    timeout(SESSION_TIMEOUT, async {
        while let Some(msg_result) = ws.next().await {
            match msg_result {
                Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(ServerMessage::SessionUpdated { session }) => {
                        log::info!("Recognizer session configured: {:?}", session.modalities);
                        return Ok(());
                    }
                    Ok(ServerMessage::Error { error }) => {
                        return Err(CaptureError::ProtocolError(error.message));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!("Failed to parse message: {}", e);
                    }
                },
                Ok(Message::Close(_)) => {
                    return Err(CaptureError::ConnectionFailed(
                        "Connection closed during configuration".to_string(),
                    ));
                }
                Err(e) => {
                    return Err(CaptureError::ProtocolError(e.to_string()));
                }
                _ => {}
            }
        }
        Err(CaptureError::ConnectionFailed("Stream ended".to_string()))
    })
    .await
    .map_err(|_| CaptureError::ConnectionFailed("Session configuration timeout".to_string()))??;

    Ok(ws)
}

/// Pump microphone samples to the socket: downsample, chunk, send.
async fn run_audio_stream(
    mut samples: mpsc::Receiver<Vec<i16>>,
    mut write: WsSink,
    source_rate: u32,
    target_rate: u32,
    samples_per_chunk: usize,
    cancel: CancellationToken,
) {
    let mut buffer: Vec<i16> = Vec::with_capacity(samples_per_chunk * 2);
    let mut chunks_sent: u64 = 0;

    'outer: loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = samples.recv() => {
                let batch = match maybe {
                    Some(b) => b,
                    None => break, // microphone gone
                };
                buffer.extend(downsample(&batch, source_rate, target_rate));

                while buffer.len() >= samples_per_chunk {
                    let chunk: Vec<i16> = buffer.drain(..samples_per_chunk).collect();
                    let msg = match serde_json::to_string(&ClientMessage::audio_append(&chunk)) {
                        Ok(json) => json,
                        Err(e) => {
                            log::error!("Failed to encode audio chunk: {}", e);
                            break 'outer;
                        }
                    };
                    if let Err(e) = write.send(Message::Text(msg)).await {
                        log::warn!("Failed to send audio chunk: {}", e);
                        break 'outer;
                    }
                    chunks_sent += 1;
                    if chunks_sent % 50 == 0 {
                        log::debug!("Audio stream: sent {} chunks", chunks_sent);
                    }
                }
            }
        }
    }

    let _ = write.close().await;
    log::debug!("Audio stream task exiting after {} chunks", chunks_sent);
}

/// Consume transcript messages and forward them as capture events.
async fn run_transcript_stream(
    mut read: WsSource,
    events: mpsc::Sender<CaptureEvent>,
    cancel: CancellationToken,
) {
    // Deltas accumulate per speech segment; a completed transcript
    // supersedes them and resets the preview.
    let mut partial = String::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            maybe = read.next() => match maybe {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(ServerMessage::TranscriptDelta { delta }) => {
                            partial.push_str(&delta);
                            if events.send(CaptureEvent::Interim(partial.clone())).await.is_err() {
                                break;
                            }
                        }
                        Ok(ServerMessage::TranscriptCompleted { transcript }) => {
                            partial.clear();
                            if events.send(CaptureEvent::Final(transcript)).await.is_err() {
                                break;
                            }
                        }
                        Ok(ServerMessage::Error { error }) => {
                            // Transient recognizer errors (e.g. no speech in
                            // the window) are not fatal to the session.
                            log::warn!(
                                "Recognizer error: {} ({})",
                                error.message,
                                error.error_type
                            );
                        }
                        Ok(_) => {}
                        Err(e) => {
                            log::warn!("Failed to parse message: {}", e);
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    log::info!("Recognizer connection closed");
                    if !cancel.is_cancelled() {
                        let _ = events.send(CaptureEvent::Ended).await;
                    }
                    break;
                }
                Some(Err(e)) => {
                    log::warn!("Recognizer WebSocket error: {}", e);
                    if !cancel.is_cancelled() {
                        let _ = events.send(CaptureEvent::Ended).await;
                    }
                    break;
                }
                Some(Ok(_)) => {} // Ignore ping/pong/binary
            }
        }
    }

    log::debug!("Transcript stream task exiting");
}

/// Downsample audio from source rate to target rate using simple averaging.
///
/// Supports integer ratios only (e.g. 48kHz -> 24kHz); other ratios pass
/// the input through unchanged with a warning.
fn downsample(samples: &[i16], source_rate: u32, target_rate: u32) -> Vec<i16> {
    if target_rate == 0 || source_rate == 0 {
        log::warn!(
            "Invalid sample rate (source: {}, target: {}), returning original",
            source_rate,
            target_rate
        );
        return samples.to_vec();
    }

    if source_rate == target_rate {
        return samples.to_vec();
    }

    if source_rate % target_rate != 0 {
        log::warn!(
            "Unsupported resample ratio {}:{}, returning original",
            source_rate,
            target_rate
        );
        return samples.to_vec();
    }

    let ratio = (source_rate / target_rate) as usize;

    samples
        .chunks(ratio)
        .map(|chunk| {
            // i64 accumulator: a chunk of i16 sums can overflow i16/i32
            let sum: i64 = chunk.iter().map(|&s| s as i64).sum();
            (sum / chunk.len() as i64) as i16
        })
        .collect()
}
