//! Wire types for the realtime speech-to-text WebSocket protocol.
//!
//! The recognizer speaks a JSON message protocol: the client configures a
//! session, then streams base64 PCM16 audio; the server answers with
//! transcription deltas while the user is speaking and a completed
//! transcript for each speech segment it detects.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

/// Session configuration sent after connecting.
///
/// Server-side voice activity detection is enabled so the service segments
/// continuous audio into utterance-sized completed transcripts on its own;
/// the client never commits the buffer manually.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Output modalities - text only, we never want generated audio back.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modalities: Option<Vec<String>>,

    /// Input audio format - "pcm16" for raw little-endian PCM.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_format: Option<String>,

    /// Transcription model selection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_audio_transcription: Option<TranscriptionConfig>,

    /// Server-side segmentation of continuous audio.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_detection: Option<SegmentationConfig>,
}

impl SessionConfig {
    /// Configuration for continuous transcription with server-side VAD.
    pub fn continuous(model: &str) -> Self {
        Self {
            modalities: Some(vec!["text".to_string()]),
            input_audio_format: Some("pcm16".to_string()),
            input_audio_transcription: Some(TranscriptionConfig {
                model: model.to_string(),
            }),
            turn_detection: Some(SegmentationConfig {
                detection_type: "server_vad".to_string(),
            }),
        }
    }
}

/// Transcription model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptionConfig {
    pub model: String,
}

/// Server-side speech segmentation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentationConfig {
    #[serde(rename = "type")]
    pub detection_type: String,
}

/// Session information returned by the service.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfo {
    pub id: String,

    #[serde(default)]
    pub model: String,

    #[serde(default)]
    pub modalities: Vec<String>,
}

/// Error information from the service.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorInfo {
    #[serde(rename = "type", default)]
    pub error_type: String,

    #[serde(default)]
    pub code: Option<String>,

    #[serde(default)]
    pub message: String,
}

// ============================================================================
// Client Messages (sent TO the service)
// ============================================================================

/// Messages sent from client to the recognizer service.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Update session configuration.
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    /// Append audio data to the input buffer.
    #[serde(rename = "input_audio_buffer.append")]
    AudioAppend {
        /// Base64-encoded PCM16 audio data.
        audio: String,
    },

    /// Clear any buffered, not-yet-segmented audio.
    #[serde(rename = "input_audio_buffer.clear")]
    AudioClear,
}

impl ClientMessage {
    /// Session update enabling continuous transcription.
    pub fn configure(model: &str) -> Self {
        Self::SessionUpdate {
            session: SessionConfig::continuous(model),
        }
    }

    /// Audio append message from raw PCM16 samples (little-endian).
    pub fn audio_append(samples: &[i16]) -> Self {
        let bytes: Vec<u8> = samples.iter().flat_map(|&s| s.to_le_bytes()).collect();

        Self::AudioAppend {
            audio: STANDARD.encode(&bytes),
        }
    }
}

// ============================================================================
// Server Messages (received FROM the service)
// ============================================================================

/// Messages received from the recognizer service.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Session was created successfully.
    #[serde(rename = "session.created")]
    SessionCreated { session: SessionInfo },

    /// Session was updated successfully.
    #[serde(rename = "session.updated")]
    SessionUpdated { session: SessionInfo },

    /// An error occurred.
    #[serde(rename = "error")]
    Error { error: ErrorInfo },

    /// Partial transcription delta for the current speech segment.
    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    TranscriptDelta { delta: String },

    /// Transcription completed for a speech segment. The server will not
    /// revise this text.
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    TranscriptCompleted { transcript: String },

    /// Catch-all for message types we don't handle (VAD notifications,
    /// buffer acks, future additions). Prevents deserialization failures.
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// Extract error info if this is an error message.
    pub fn error_info(&self) -> Option<&ErrorInfo> {
        match self {
            ServerMessage::Error { error } => Some(error),
            _ => None,
        }
    }

    /// Extract session ID if this is a session created/updated message.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ServerMessage::SessionCreated { session } => Some(&session.id),
            ServerMessage::SessionUpdated { session } => Some(&session.id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configure_serializes_with_server_vad() {
        let msg = ClientMessage::configure("whisper-1");
        let json = serde_json::to_string(&msg).unwrap();

        assert!(json.contains("\"type\":\"session.update\""));
        assert!(json.contains("\"modalities\":[\"text\"]"));
        assert!(json.contains("\"input_audio_format\":\"pcm16\""));
        assert!(json.contains("\"server_vad\""));
    }

    #[test]
    fn audio_append_serializes_base64() {
        let samples = vec![100i16, 200, 300];
        let msg = ClientMessage::audio_append(&samples);
        let json = serde_json::to_string(&msg).unwrap();

        assert!(json.contains("\"type\":\"input_audio_buffer.append\""));
        assert!(json.contains("\"audio\":"));
    }

    #[test]
    fn audio_encoding_is_little_endian() {
        let samples = vec![0x1234i16, 0x5678];
        let msg = ClientMessage::audio_append(&samples);

        if let ClientMessage::AudioAppend { audio } = msg {
            let decoded = STANDARD.decode(&audio).unwrap();
            assert_eq!(decoded, vec![0x34, 0x12, 0x78, 0x56]);
        } else {
            panic!("Expected AudioAppend");
        }
    }

    #[test]
    fn session_created_deserializes() {
        let json = r#"{
            "type": "session.created",
            "session": {
                "id": "sess_123",
                "model": "whisper-1",
                "modalities": ["text"]
            }
        }"#;

        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        assert_eq!(msg.session_id(), Some("sess_123"));
    }

    #[test]
    fn transcript_delta_deserializes() {
        let json = r#"{
            "type": "conversation.item.input_audio_transcription.delta",
            "delta": "Book a ta"
        }"#;

        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        match msg {
            ServerMessage::TranscriptDelta { delta } => assert_eq!(delta, "Book a ta"),
            _ => panic!("Expected TranscriptDelta"),
        }
    }

    #[test]
    fn transcript_completed_deserializes() {
        let json = r#"{
            "type": "conversation.item.input_audio_transcription.completed",
            "transcript": "Book a table for two tonight"
        }"#;

        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        match msg {
            ServerMessage::TranscriptCompleted { transcript } => {
                assert_eq!(transcript, "Book a table for two tonight");
            }
            _ => panic!("Expected TranscriptCompleted"),
        }
    }

    #[test]
    fn error_deserializes() {
        let json = r#"{
            "type": "error",
            "error": {
                "type": "invalid_request_error",
                "code": "invalid_api_key",
                "message": "Invalid API key"
            }
        }"#;

        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        let info = msg.error_info().expect("should be an error");
        assert_eq!(info.message, "Invalid API key");
        assert_eq!(info.code, Some("invalid_api_key".to_string()));
    }

    #[test]
    fn unknown_message_types_are_tolerated() {
        let json = r#"{
            "type": "input_audio_buffer.speech_started",
            "audio_start_ms": 120
        }"#;

        let msg: ServerMessage = serde_json::from_str(json).unwrap();
        assert!(matches!(msg, ServerMessage::Unknown));
    }
}
