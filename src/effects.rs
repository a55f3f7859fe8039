//! Effect runner for the conversation loop.
//!
//! Executes the effects produced by the state machine: capture start/stop,
//! silence polling, reply dispatch, synthesis and playback. Every effect
//! runs as a spawned task and reports back into the loop as events, so the
//! state machine stays the single writer.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::capture::{CaptureEvent, SpeechCapture};
use crate::metrics::MetricsCollector;
use crate::playback::{PlaybackSink, SpeechSynthesizer};
use crate::reply::{ChatMessage, ReplyService};
use crate::state_machine::{Effect, Event};

/// Trait for running effects asynchronously.
/// Completion events are sent back via the provided channel.
pub trait EffectRunner: Send + Sync + 'static {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>);
}

/// Runner tuning that is not part of the turn state machine.
#[derive(Debug, Clone, Copy)]
pub struct RunnerConfig {
    /// Silence poll cadence while listening.
    pub poll_interval: Duration,
    /// Cap on retained conversation history (oldest messages dropped).
    pub max_history_messages: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            max_history_messages: 24,
        }
    }
}

/// Real effect runner wired to injected collaborators.
pub struct LoopEffectRunner {
    capture: Arc<dyn SpeechCapture>,
    reply: Arc<dyn ReplyService>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    playback: Arc<dyn PlaybackSink>,
    /// Rolling conversation history sent with each reply request.
    history: Arc<Mutex<Vec<ChatMessage>>>,
    metrics: Arc<Mutex<MetricsCollector>>,
    /// Turn ids that are currently supposed to be listening. Gates the
    /// silence poll and delayed capture resume, so neither outlives its
    /// turn. Entries are added/removed synchronously in `spawn()`, in
    /// effect order.
    active_listens: Arc<StdMutex<HashSet<Uuid>>>,
    muted: Arc<AtomicBool>,
    config: RunnerConfig,
}

impl LoopEffectRunner {
    pub fn new(
        capture: Arc<dyn SpeechCapture>,
        reply: Arc<dyn ReplyService>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        playback: Arc<dyn PlaybackSink>,
        muted: Arc<AtomicBool>,
        config: RunnerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            capture,
            reply,
            synthesizer,
            playback,
            history: Arc::new(Mutex::new(Vec::new())),
            metrics: Arc::new(Mutex::new(MetricsCollector::new())),
            active_listens: Arc::new(StdMutex::new(HashSet::new())),
            muted,
            config,
        })
    }

    /// Shared metrics collector for diagnostics surfaces.
    pub fn metrics(&self) -> Arc<Mutex<MetricsCollector>> {
        self.metrics.clone()
    }

    /// Snapshot of the rolling conversation history.
    pub async fn history(&self) -> Vec<ChatMessage> {
        self.history.lock().await.clone()
    }

    fn mark_listening(&self, id: Uuid) {
        self.active_listens.lock().unwrap().insert(id);
    }

    fn unmark_listening(&self, id: Uuid) {
        self.active_listens.lock().unwrap().remove(&id);
    }
}

impl EffectRunner for LoopEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            Effect::StartCapture { id } => {
                self.mark_listening(id);
                let capture = self.capture.clone();
                let metrics = self.metrics.clone();

                tokio::spawn(async move {
                    {
                        metrics.lock().await.start_turn(id);
                    }
                    run_capture_session(capture, id, tx).await;
                });
            }

            Effect::ResumeCapture { id, delay } => {
                self.mark_listening(id);
                let capture = self.capture.clone();
                let metrics = self.metrics.clone();
                let active = self.active_listens.clone();
                let poll_interval = self.config.poll_interval;

                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;

                    // The session may have closed during the delay.
                    let still_wanted = { active.lock().unwrap().contains(&id) };
                    if !still_wanted {
                        log::debug!("Resume cancelled - turn {} no longer listening", id);
                        return;
                    }

                    {
                        metrics.lock().await.start_turn(id);
                    }
                    spawn_silence_poll(active, poll_interval, id, tx.clone());
                    run_capture_session(capture, id, tx).await;
                });
            }

            Effect::StopCapture { id } => {
                self.unmark_listening(id);
                let capture = self.capture.clone();

                tokio::spawn(async move {
                    capture.stop().await;
                });
            }

            Effect::StartSilencePoll { id } => {
                spawn_silence_poll(
                    self.active_listens.clone(),
                    self.config.poll_interval,
                    id,
                    tx,
                );
            }

            Effect::DispatchReply { id, text } => {
                let reply = self.reply.clone();
                let history = self.history.clone();
                let metrics = self.metrics.clone();
                let muted = self.muted.clone();
                let max_history = self.config.max_history_messages;

                tokio::spawn(async move {
                    {
                        metrics.lock().await.utterance_dispatched(text.trim().len());
                    }

                    let messages = {
                        let mut h = history.lock().await;
                        h.push(ChatMessage::user(text));
                        trim_history(&mut *h, max_history);
                        h.clone()
                    };

                    match reply.reply(&messages).await {
                        Ok(answer) => {
                            {
                                history.lock().await.push(ChatMessage::assistant(answer.clone()));
                            }
                            {
                                let mut m = metrics.lock().await;
                                m.reply_completed(answer.len());
                                // Muted turns skip playback; the reply is
                                // the end of the cycle.
                                if muted.load(Ordering::Acquire) {
                                    m.turn_completed();
                                }
                            }
                            let _ = tx.send(Event::ReplyOk { id, text: answer }).await;
                        }
                        Err(e) => {
                            log::error!("Reply request failed: {}", e);
                            {
                                metrics.lock().await.turn_failed(e.to_string());
                            }
                            let _ = tx
                                .send(Event::ReplyFailed {
                                    id,
                                    err: e.to_string(),
                                })
                                .await;
                        }
                    }
                });
            }

            Effect::StartPlayback { id, text } => {
                let synthesizer = self.synthesizer.clone();
                let playback = self.playback.clone();
                let metrics = self.metrics.clone();

                tokio::spawn(async move {
                    {
                        metrics.lock().await.playback_started();
                    }

                    let audio = match synthesizer.synthesize(&text).await {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            log::warn!("Synthesis failed: {}", e);
                            {
                                let mut m = metrics.lock().await;
                                m.record_error(
                                    "playback".to_string(),
                                    e.to_string(),
                                    Some(id.to_string()),
                                );
                                m.turn_completed();
                            }
                            let _ = tx
                                .send(Event::PlaybackFailed {
                                    id,
                                    err: e.to_string(),
                                })
                                .await;
                            return;
                        }
                    };

                    if audio.is_empty() {
                        log::debug!("Synthesizer returned no audio, skipping playback");
                        {
                            metrics.lock().await.turn_completed();
                        }
                        let _ = tx.send(Event::PlaybackDone { id }).await;
                        return;
                    }

                    let outcome = match playback.play(audio).await {
                        Ok(result) => result,
                        // Playback thread dropped the responder.
                        Err(_) => Err(crate::playback::PlaybackError::Closed),
                    };

                    {
                        let mut m = metrics.lock().await;
                        m.playback_finished();
                        if let Err(ref e) = outcome {
                            m.record_error(
                                "playback".to_string(),
                                e.to_string(),
                                Some(id.to_string()),
                            );
                        }
                        m.turn_completed();
                    }

                    match outcome {
                        Ok(()) => {
                            let _ = tx.send(Event::PlaybackDone { id }).await;
                        }
                        Err(e) => {
                            log::warn!("Playback failed: {}", e);
                            let _ = tx
                                .send(Event::PlaybackFailed {
                                    id,
                                    err: e.to_string(),
                                })
                                .await;
                        }
                    }
                });
            }

            Effect::StopPlayback => {
                self.playback.stop();
            }

            Effect::Cleanup { id } => {
                let metrics = self.metrics.clone();
                tokio::spawn(async move {
                    let mut m = metrics.lock().await;
                    if m.is_active_turn(id) {
                        m.turn_cancelled();
                    }
                });
            }

            Effect::EmitUpdate | Effect::Notify { .. } => {
                // Handled in the session loop, not here
                unreachable!("EmitUpdate/Notify should be handled in the session loop");
            }
        }
    }
}

/// Start the capture session and forward its transcript events into the
/// state machine, tagged with the owning turn id.
async fn run_capture_session(
    capture: Arc<dyn SpeechCapture>,
    id: Uuid,
    tx: mpsc::Sender<Event>,
) {
    let (events_tx, mut events_rx) = mpsc::channel::<CaptureEvent>(32);

    match capture.start(events_tx).await {
        Ok(()) => {
            let _ = tx.send(Event::CaptureStarted { id }).await;

            while let Some(event) = events_rx.recv().await {
                let mapped = match event {
                    CaptureEvent::Interim(text) => Event::InterimTranscript { id, text },
                    CaptureEvent::Final(text) => Event::FinalTranscript { id, text },
                    CaptureEvent::Ended => Event::CaptureEnded { id },
                };
                if tx.send(mapped).await.is_err() {
                    break;
                }
            }
            log::debug!("Capture forwarder for turn {} exiting", id);
        }
        Err(e) => {
            log::error!("Failed to start capture: {}", e);
            let _ = tx
                .send(Event::CaptureUnavailable {
                    id,
                    err: e.to_string(),
                })
                .await;
        }
    }
}

/// Send silence ticks while the turn is still listed as listening.
fn spawn_silence_poll(
    active: Arc<StdMutex<HashSet<Uuid>>>,
    poll_interval: Duration,
    id: Uuid,
    tx: mpsc::Sender<Event>,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(poll_interval);
        // The first tick completes immediately; skip it.
        interval.tick().await;
        loop {
            interval.tick().await;
            let is_active = { active.lock().unwrap().contains(&id) };
            if !is_active {
                log::debug!("Silence poll stopping - turn {} no longer listening", id);
                break;
            }
            if tx.send(Event::SilenceTick { id }).await.is_err() {
                log::debug!("Silence poll stopping - channel closed");
                break;
            }
        }
    });
}

/// Drop the oldest messages once the history exceeds the cap.
fn trim_history(history: &mut Vec<ChatMessage>, max_messages: usize) {
    if max_messages > 0 && history.len() > max_messages {
        let excess = history.len() - max_messages;
        history.drain(..excess);
    }
}

/// Stub effect runner that simulates a full cycle without any hardware or
/// network. Useful for exercising the session loop.
pub struct StubEffectRunner;

impl StubEffectRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl EffectRunner for StubEffectRunner {
    fn spawn(&self, effect: Effect, tx: mpsc::Sender<Event>) {
        match effect {
            Effect::StartCapture { id } => {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    log::info!("Stub: capture started");
                    let _ = tx.send(Event::CaptureStarted { id }).await;
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    let _ = tx
                        .send(Event::FinalTranscript {
                            id,
                            text: "Simulated utterance".to_string(),
                        })
                        .await;
                });
            }

            Effect::ResumeCapture { id, delay } => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    log::info!("Stub: capture resumed");
                    let _ = tx.send(Event::CaptureStarted { id }).await;
                });
            }

            Effect::StopCapture { .. } => {
                log::info!("Stub: capture stopped");
            }

            Effect::StartSilencePoll { id } => {
                tokio::spawn(async move {
                    // Stale ticks are ignored by the reducer, so an
                    // uncancelled-but-bounded loop is fine here.
                    for _ in 0..60 {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        if tx.send(Event::SilenceTick { id }).await.is_err() {
                            break;
                        }
                    }
                });
            }

            Effect::DispatchReply { id, text } => {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    log::info!("Stub: reply ready");
                    let _ = tx
                        .send(Event::ReplyOk {
                            id,
                            text: format!("[Simulated reply to \"{}\"]", text.trim()),
                        })
                        .await;
                });
            }

            Effect::StartPlayback { id, .. } => {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    log::info!("Stub: playback complete");
                    let _ = tx.send(Event::PlaybackDone { id }).await;
                });
            }

            Effect::StopPlayback => {
                log::info!("Stub: playback stopped");
            }

            Effect::Cleanup { .. } => {}

            Effect::EmitUpdate | Effect::Notify { .. } => {
                unreachable!("EmitUpdate/Notify should be handled in the session loop");
            }
        }
    }
}
