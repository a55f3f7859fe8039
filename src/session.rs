//! Voice session: the event loop that owns the state machine, plus the
//! handle an embedding UI drives it through.
//!
//! All user-facing controls (open, close, send now, clear, mute) map to
//! events; all state changes are broadcast as [`SessionUpdate`]s so a
//! front-end can render live phase and transcript preview.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use crate::effects::EffectRunner;
use crate::state_machine::{reduce, Effect, Event, State, TurnTuning};

/// Capacity of the state machine's event channel.
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Capacity of the update broadcast channel. Slow subscribers lose the
/// oldest updates, never the loop.
const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Which phase of the turn cycle the session is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionPhase {
    Idle,
    Listening,
    AwaitingReply,
    Speaking,
}

/// Snapshot of session state for an embedding UI.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub phase: SessionPhase,
    /// Finalized text accumulated so far (Listening only).
    pub utterance: String,
    /// Live interim preview (Listening only).
    pub preview: String,
    /// Text dispatched to the reply service (AwaitingReply only).
    pub sent_text: Option<String>,
    /// Reply being spoken (Speaking only).
    pub reply_text: Option<String>,
    pub muted: bool,
}

/// Updates broadcast to session subscribers.
#[derive(Debug, Clone)]
pub enum SessionUpdate {
    /// The session state changed.
    Snapshot(SessionSnapshot),
    /// A non-fatal, user-visible notice (capture unavailable, reply
    /// failed, ...). The session keeps running.
    Notice(String),
}

fn snapshot_of(state: &State, muted: bool) -> SessionSnapshot {
    match state {
        State::Idle => SessionSnapshot {
            phase: SessionPhase::Idle,
            utterance: String::new(),
            preview: String::new(),
            sent_text: None,
            reply_text: None,
            muted,
        },
        State::Listening { utterance, .. } => SessionSnapshot {
            phase: SessionPhase::Listening,
            utterance: utterance.text().to_string(),
            preview: utterance.interim().to_string(),
            sent_text: None,
            reply_text: None,
            muted,
        },
        State::AwaitingReply { sent_text, .. } => SessionSnapshot {
            phase: SessionPhase::AwaitingReply,
            utterance: String::new(),
            preview: String::new(),
            sent_text: Some(sent_text.clone()),
            reply_text: None,
            muted,
        },
        State::Speaking { reply_text, .. } => SessionSnapshot {
            phase: SessionPhase::Speaking,
            utterance: String::new(),
            preview: String::new(),
            sent_text: None,
            reply_text: Some(reply_text.clone()),
            muted,
        },
    }
}

/// Handle to a running voice session.
pub struct VoiceSession {
    tx: mpsc::Sender<Event>,
    updates: broadcast::Sender<SessionUpdate>,
    muted: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl VoiceSession {
    /// Spawn the session loop.
    ///
    /// `muted` is shared with the effect runner so both sides see the same
    /// flag. With `auto_open` the session starts listening immediately.
    pub fn spawn(
        runner: Arc<dyn EffectRunner>,
        tuning: TurnTuning,
        muted: Arc<AtomicBool>,
        auto_open: bool,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Event>(EVENT_CHANNEL_CAPACITY);
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);

        let task = tokio::spawn(run_session_loop(
            rx,
            tx.clone(),
            runner,
            updates.clone(),
            muted.clone(),
            tuning,
        ));

        let session = Self {
            tx,
            updates,
            muted,
            task,
        };

        if auto_open {
            // Queue the open; the loop picks it up as its first event.
            let _ = session.tx.try_send(Event::Open);
        }

        session
    }

    /// Start listening (user opened voice mode).
    pub async fn open(&self) {
        let _ = self.tx.send(Event::Open).await;
    }

    /// Close voice mode: stop capture, stop playback, cancel timers.
    pub async fn close(&self) {
        let _ = self.tx.send(Event::Close).await;
    }

    /// Dispatch the accumulated utterance without waiting for silence.
    pub async fn send_now(&self) {
        let _ = self.tx.send(Event::SendNow).await;
    }

    /// Discard the accumulated utterance.
    pub async fn clear_utterance(&self) {
        let _ = self.tx.send(Event::ClearUtterance).await;
    }

    /// Toggle reply playback. Orthogonal to the turn cycle: a muted session
    /// still dispatches utterances and receives replies.
    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
        log::info!("Session muted: {}", muted);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    /// Subscribe to session updates.
    pub fn updates(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }

    /// Close the session and stop the loop.
    pub async fn shutdown(self) {
        let _ = self.tx.send(Event::Close).await;
        let _ = self.tx.send(Event::Shutdown).await;
        let _ = self.task.await;
    }
}

/// Run the session loop: receive events, reduce, execute effects.
async fn run_session_loop(
    mut rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    runner: Arc<dyn EffectRunner>,
    updates: broadcast::Sender<SessionUpdate>,
    muted: Arc<AtomicBool>,
    tuning: TurnTuning,
) {
    let mut state = State::default();

    let _ = updates.send(SessionUpdate::Snapshot(snapshot_of(
        &state,
        muted.load(Ordering::Acquire),
    )));
    log::info!("Session loop started");

    while let Some(event) = rx.recv().await {
        // Handle Shutdown at the edge
        if matches!(event, Event::Shutdown) {
            log::info!("Shutdown requested, stopping session loop");
            break;
        }

        let is_muted = muted.load(Ordering::Acquire);

        let old_discriminant = std::mem::discriminant(&state);
        let (next, effects) = reduce(&state, event, is_muted, &tuning);
        let new_discriminant = std::mem::discriminant(&next);

        if old_discriminant != new_discriminant {
            log::info!("State transition: {:?} -> {:?}", state, next);
        }

        state = next;

        for eff in effects {
            match eff {
                Effect::EmitUpdate => {
                    let _ = updates.send(SessionUpdate::Snapshot(snapshot_of(&state, is_muted)));
                }
                Effect::Notify { message } => {
                    log::warn!("Session notice: {}", message);
                    let _ = updates.send(SessionUpdate::Notice(message));
                }
                other => runner.spawn(other, tx.clone()),
            }
        }
    }

    log::info!("Session loop ended");
}
