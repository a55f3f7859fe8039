//! Persisted application settings.
//!
//! Stored as JSON under the platform config directory. Unknown or missing
//! fields fall back to defaults, and writes are atomic (temp file + rename)
//! so a crash mid-write cannot corrupt the file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::effects::RunnerConfig;
use crate::state_machine::TurnTuning;

const SETTINGS_FILE_NAME: &str = "settings.json";
const CONFIG_DIR_NAME: &str = "voiceloop";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Continuous silence (ms) after the last transcript event before the
    /// accumulated utterance is dispatched.
    pub silence_threshold_ms: u64,

    /// How often (ms) the silence detector polls while listening.
    pub silence_poll_interval_ms: u64,

    /// Delay (ms) before capture is re-armed after a reply cycle, so the
    /// tail of synthesized audio is not captured as user input.
    pub resume_delay_ms: u64,

    /// Start listening as soon as the session is created.
    pub auto_open: bool,

    /// Start with reply playback muted.
    pub start_muted: bool,

    /// Chat model used by the reply service.
    pub reply_model: String,

    /// Persona sent as the system message with every reply request.
    pub reply_system_prompt: String,

    /// Speech synthesis model.
    pub synthesis_model: String,

    /// Speech synthesis voice.
    pub synthesis_voice: String,

    /// Cap on retained conversation history (messages; 0 = unlimited).
    pub max_history_messages: usize,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            silence_threshold_ms: 2000,
            silence_poll_interval_ms: 250,
            resume_delay_ms: 500,
            auto_open: false,
            start_muted: false,
            reply_model: "gpt-4o-mini".to_string(),
            reply_system_prompt: "You are a helpful voice concierge. Answer briefly; \
                                  your replies are spoken aloud."
                .to_string(),
            synthesis_model: "tts-1".to_string(),
            synthesis_voice: "alloy".to_string(),
            max_history_messages: 24,
        }
    }
}

impl AppSettings {
    /// Timing knobs for the turn state machine.
    pub fn tuning(&self) -> TurnTuning {
        TurnTuning {
            silence_threshold: Duration::from_millis(self.silence_threshold_ms),
            resume_delay: Duration::from_millis(self.resume_delay_ms),
        }
    }

    /// Tuning for the effect runner.
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            poll_interval: Duration::from_millis(self.silence_poll_interval_ms),
            max_history_messages: self.max_history_messages,
        }
    }
}

fn settings_path() -> Result<PathBuf, String> {
    let dir = dirs::config_dir().ok_or_else(|| "Could not determine config directory".to_string())?;
    Ok(dir.join(CONFIG_DIR_NAME).join(SETTINGS_FILE_NAME))
}

/// Load settings from the default location, falling back to defaults on any
/// problem (missing file, unreadable, unparseable).
pub fn load_settings() -> AppSettings {
    let path = match settings_path() {
        Ok(p) => p,
        Err(e) => {
            log::warn!("Settings: {}", e);
            return AppSettings::default();
        }
    };
    load_settings_from(&path)
}

/// Save settings to the default location.
pub fn save_settings(settings: &AppSettings) -> Result<(), String> {
    let path = settings_path()?;
    save_settings_to(&path, settings)
}

fn load_settings_from(path: &Path) -> AppSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<AppSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                AppSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            AppSettings::default()
        }
    }
}

fn save_settings_to(path: &Path, settings: &AppSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write atomically: write to a temp file in the same directory, then
    // rename over the destination.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // On Unix, rename atomically replaces the destination. On Windows,
    // rename fails if the destination exists, so remove it first.
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_behavior() {
        let settings = AppSettings::default();
        assert_eq!(settings.silence_threshold_ms, 2000);
        assert_eq!(settings.resume_delay_ms, 500);
        assert!(settings.silence_poll_interval_ms < 1000);
    }

    #[test]
    fn tuning_converts_to_durations() {
        let settings = AppSettings {
            silence_threshold_ms: 80,
            resume_delay_ms: 20,
            ..AppSettings::default()
        };
        let tuning = settings.tuning();
        assert_eq!(tuning.silence_threshold, Duration::from_millis(80));
        assert_eq!(tuning.resume_delay, Duration::from_millis(20));
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        let settings = AppSettings {
            silence_threshold_ms: 1500,
            start_muted: true,
            synthesis_voice: "nova".to_string(),
            ..AppSettings::default()
        };
        save_settings_to(&path, &settings).unwrap();

        let loaded = load_settings_from(&path);
        assert_eq!(loaded.silence_threshold_ms, 1500);
        assert!(loaded.start_muted);
        assert_eq!(loaded.synthesis_voice, "nova");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = load_settings_from(&dir.path().join("nope.json"));
        assert_eq!(loaded.silence_threshold_ms, 2000);
    }

    #[test]
    fn unparseable_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not json at all").unwrap();

        let loaded = load_settings_from(&path);
        assert_eq!(loaded.resume_delay_ms, 500);
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{ "silence_threshold_ms": 1200 }"#).unwrap();

        let loaded = load_settings_from(&path);
        assert_eq!(loaded.silence_threshold_ms, 1200);
        assert_eq!(loaded.resume_delay_ms, 500);
    }
}
