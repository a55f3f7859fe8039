//! Speech capture: continuous recognition behind an injectable trait.
//!
//! The platform recognizer is a singleton-ish external capability (one
//! microphone, one streaming session), so it is abstracted behind
//! [`SpeechCapture`] with an event channel. Tests substitute a fake source;
//! production uses [`RealtimeRecognizer`], which streams microphone audio to
//! a realtime speech-to-text service over WebSocket.

mod microphone;
mod protocol;
mod stream;

pub use microphone::{MicrophoneHandle, MicrophoneSource};
pub use protocol::{ClientMessage, ServerMessage};
pub use stream::{RealtimeRecognizer, RecognizerConfig};

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Incremental output of a capture session.
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    /// Provisional text the recognizer may still revise. Display only.
    Interim(String),
    /// Text the recognizer will not revise further. Safe to accumulate.
    Final(String),
    /// The underlying session ended while capture was still wanted.
    Ended,
}

/// Errors that can occur while starting or running speech capture.
#[derive(Debug, Clone)]
pub enum CaptureError {
    /// Speech recognition is not available on this host (no input device,
    /// no credentials, ...). Terminal for the voice-input feature.
    Unavailable(String),
    /// Failed to establish the recognizer connection.
    ConnectionFailed(String),
    /// Authentication with the recognizer service failed.
    AuthenticationFailed(String),
    /// Recognizer protocol error.
    ProtocolError(String),
    /// Failed to send audio data.
    SendFailed(String),
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureError::Unavailable(e) => write!(f, "Speech capture unavailable: {}", e),
            CaptureError::ConnectionFailed(e) => {
                write!(f, "Failed to connect to recognizer: {}", e)
            }
            CaptureError::AuthenticationFailed(e) => write!(f, "Authentication failed: {}", e),
            CaptureError::ProtocolError(e) => write!(f, "Recognizer protocol error: {}", e),
            CaptureError::SendFailed(e) => write!(f, "Failed to send audio: {}", e),
        }
    }
}

impl std::error::Error for CaptureError {}

/// A continuous speech-recognition source.
///
/// One session at a time: `start` begins a session whose transcript events
/// flow into the supplied channel until `stop` is called or the session ends
/// on its own (signalled by [`CaptureEvent::Ended`]).
#[async_trait]
pub trait SpeechCapture: Send + Sync {
    /// Begin a capture session.
    ///
    /// Returns an error when the capability is unavailable on this host;
    /// the caller decides whether that disables the feature.
    async fn start(&self, events: mpsc::Sender<CaptureEvent>) -> Result<(), CaptureError>;

    /// End the current session. Safe to call when no session is active.
    async fn stop(&self);
}
