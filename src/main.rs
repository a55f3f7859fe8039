//! Terminal front-end for the voice conversation loop.
//!
//! Wires the real collaborators (microphone + streaming recognizer, chat
//! reply service, speech synthesis, audio playback) into a session and
//! prints live state until Ctrl-C.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::sync::broadcast;

use voiceloop::capture::{RealtimeRecognizer, RecognizerConfig};
use voiceloop::playback::{HttpSynthesizer, RodioPlayback, SynthesizerConfig};
use voiceloop::reply::{HttpReplyService, ReplyConfig};
use voiceloop::{LoopEffectRunner, SessionPhase, SessionSnapshot, SessionUpdate, VoiceSession};

#[tokio::main]
async fn main() {
    // Load .env file if present (for development convenience)
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let settings = voiceloop::load_settings();

    let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
    if api_key.is_empty() {
        eprintln!("OPENAI_API_KEY is not set; voice capture, replies and synthesis will fail.");
    }

    let recognizer = Arc::new(RealtimeRecognizer::new(RecognizerConfig::new(
        api_key.clone(),
    )));

    let mut reply_config = ReplyConfig::new(api_key.clone());
    reply_config.model = settings.reply_model.clone();
    reply_config.system_prompt = settings.reply_system_prompt.clone();
    let reply = Arc::new(HttpReplyService::new(reply_config));

    let mut synth_config = SynthesizerConfig::new(api_key);
    synth_config.model = settings.synthesis_model.clone();
    synth_config.voice = settings.synthesis_voice.clone();
    let synthesizer = Arc::new(HttpSynthesizer::new(synth_config));

    let playback = Arc::new(RodioPlayback::new());

    let muted = Arc::new(AtomicBool::new(settings.start_muted));
    let runner = LoopEffectRunner::new(
        recognizer,
        reply,
        synthesizer,
        playback,
        muted.clone(),
        settings.runner_config(),
    );
    let metrics = runner.metrics();

    let session = VoiceSession::spawn(runner, settings.tuning(), muted, settings.auto_open);
    let mut updates = session.updates();

    println!("voiceloop: speak, pause, and listen. Ctrl-C to quit.");

    // Running the demo is the "open voice mode" gesture. A second Open
    // (when auto_open already fired) is ignored by the controller.
    session.open().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = updates.recv() => match update {
                Ok(SessionUpdate::Snapshot(snapshot)) => print_snapshot(&snapshot),
                Ok(SessionUpdate::Notice(notice)) => println!("[notice] {}", notice),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    println!("\nClosing session...");
    session.shutdown().await;

    let summary = metrics.lock().await.get_summary();
    if summary.total_turns > 0 {
        println!(
            "{} turns ({} ok), avg reply {} ms, avg turn {} ms",
            summary.total_turns,
            summary.successful_turns,
            summary.avg_reply_ms,
            summary.avg_total_turn_ms
        );
    }
}

fn print_snapshot(snapshot: &SessionSnapshot) {
    match snapshot.phase {
        SessionPhase::Idle => println!("[idle]"),
        SessionPhase::Listening => {
            if !snapshot.preview.is_empty() {
                println!("  ... {}", snapshot.preview);
            } else if !snapshot.utterance.is_empty() {
                println!("  you: {}", snapshot.utterance.trim());
            } else {
                println!("[listening]");
            }
        }
        SessionPhase::AwaitingReply => {
            if let Some(sent) = &snapshot.sent_text {
                println!("  sent: {}", sent.trim());
            }
        }
        SessionPhase::Speaking => {
            if let Some(reply) = &snapshot.reply_text {
                println!("  concierge: {}", reply.trim());
            }
        }
    }
}
