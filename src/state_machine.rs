//! Turn-taking state machine for the voice conversation loop.
//!
//! This module implements the core state machine using a single-writer
//! pattern. All state transitions go through the `reduce()` function, which
//! returns a new state and a list of effects to execute.
//!
//! The loop cycles `Idle -> Listening -> AwaitingReply -> Speaking ->
//! Listening -> ...`. Capture is stopped before an utterance is dispatched
//! and re-armed only after the reply cycle ends, so capture and playback are
//! never active at the same time (the system must not hear itself).

use std::time::Duration;
use uuid::Uuid;

use crate::transcript::Utterance;

/// Timing knobs consulted by the reducer.
///
/// Injected rather than hard-coded so tests can run with short thresholds.
#[derive(Debug, Clone, Copy)]
pub struct TurnTuning {
    /// Continuous silence after the last transcript event before an
    /// accumulated utterance is considered complete.
    pub silence_threshold: Duration,
    /// Delay before capture is re-armed after a reply cycle ends, so the
    /// tail of our own audio output is not captured as user input.
    pub resume_delay: Duration,
}

impl Default for TurnTuning {
    fn default() -> Self {
        Self {
            silence_threshold: Duration::from_millis(2000),
            resume_delay: Duration::from_millis(500),
        }
    }
}

/// Conversation turn state. This is the authoritative state - all
/// transitions go through the reducer.
#[derive(Debug, Clone)]
pub enum State {
    Idle,
    Listening {
        turn_id: Uuid,
        utterance: Utterance,
    },
    AwaitingReply {
        turn_id: Uuid,
        sent_text: String,
    },
    Speaking {
        turn_id: Uuid,
        reply_text: String,
    },
}

impl Default for State {
    fn default() -> Self {
        State::Idle
    }
}

/// Events that can trigger state transitions.
/// These are sent from various sources: the session handle (user controls),
/// the capture forwarder, the silence poll, and effect tasks.
#[derive(Debug, Clone)]
pub enum Event {
    /// User opened voice mode (or the auto-open policy fired).
    Open,
    /// User closed voice mode; tears everything down.
    Close,
    /// Explicit "send what I have now" action.
    SendNow,
    /// Discard the accumulated utterance without dispatching it.
    ClearUtterance,
    /// Session loop shutdown requested (handled at the loop edge).
    Shutdown,

    // Capture events
    CaptureStarted {
        id: Uuid,
    },
    /// Capture could not start; the voice feature is unavailable.
    CaptureUnavailable {
        id: Uuid,
        err: String,
    },
    /// The capture session ended while we still expected to be listening.
    CaptureEnded {
        id: Uuid,
    },
    InterimTranscript {
        id: Uuid,
        text: String,
    },
    FinalTranscript {
        id: Uuid,
        text: String,
    },

    /// Periodic tick from the silence poll (includes id to prevent stale
    /// ticks from firing after a transition).
    SilenceTick {
        id: Uuid,
    },

    // Reply service events
    ReplyOk {
        id: Uuid,
        text: String,
    },
    ReplyFailed {
        id: Uuid,
        err: String,
    },

    // Playback events
    PlaybackDone {
        id: Uuid,
    },
    PlaybackFailed {
        id: Uuid,
        err: String,
    },
}

/// Effects to be executed after a state transition.
/// The effect runner handles these asynchronously.
#[derive(Debug, Clone)]
pub enum Effect {
    /// Begin a capture session for this turn.
    StartCapture {
        id: Uuid,
    },
    /// Begin a capture session after the resume delay (a reply cycle just
    /// ended; let the tail of system audio die down first).
    ResumeCapture {
        id: Uuid,
        delay: Duration,
    },
    /// Stop the capture session and the silence poll for this turn.
    StopCapture {
        id: Uuid,
    },
    /// Start the periodic silence poll for this turn.
    StartSilencePoll {
        id: Uuid,
    },
    /// Send the completed utterance to the reply service.
    DispatchReply {
        id: Uuid,
        text: String,
    },
    /// Synthesize and play the reply.
    StartPlayback {
        id: Uuid,
        text: String,
    },
    /// Stop any in-progress playback immediately.
    StopPlayback,
    /// Release per-turn bookkeeping after an explicit close.
    Cleanup {
        id: Uuid,
    },
    /// Signal to broadcast a session snapshot to subscribers.
    EmitUpdate,
    /// Surface a non-fatal, user-visible notice.
    Notify {
        message: String,
    },
}

/// Reducer function: (state, event, muted, tuning) -> (next_state, effects)
///
/// Key rules:
/// - Never mutate state in place; build the next state and return it
/// - Ignore events with stale turn IDs
/// - Always emit EmitUpdate after a user-visible change
/// - Failures transition back into the loop; nothing is terminal except Close
pub fn reduce(state: &State, event: Event, muted: bool, tuning: &TurnTuning) -> (State, Vec<Effect>) {
    use Effect::*;
    use Event::*;
    use State::*;

    // Helper: extract the current turn id (if any)
    let current_id: Option<Uuid> = match state {
        Idle => None,
        Listening { turn_id, .. } => Some(*turn_id),
        AwaitingReply { turn_id, .. } => Some(*turn_id),
        Speaking { turn_id, .. } => Some(*turn_id),
    };

    // Helper: check if an event's ID is stale (doesn't match the current turn)
    let is_stale = |eid: Uuid| Some(eid) != current_id;

    // Helper: the shared "reply cycle over, go listen again" transition.
    // A fresh turn id means anything still in flight for the old turn is
    // stale from here on.
    let resume_listening = |extra: Vec<Effect>| {
        let id = Uuid::new_v4();
        let mut effects = extra;
        effects.push(ResumeCapture {
            id,
            delay: tuning.resume_delay,
        });
        effects.push(EmitUpdate);
        (
            Listening {
                turn_id: id,
                utterance: Utterance::new(),
            },
            effects,
        )
    };

    match (state, event) {
        // -----------------
        // Idle
        // -----------------
        (Idle, Open) => {
            let id = Uuid::new_v4();
            (
                Listening {
                    turn_id: id,
                    utterance: Utterance::new(),
                },
                vec![
                    StartCapture { id },
                    StartSilencePoll { id },
                    EmitUpdate,
                ],
            )
        }
        (Idle, Close) => (Idle, vec![]),

        // -----------------
        // Listening
        // -----------------
        (Listening { turn_id, .. }, Close) => (
            Idle,
            vec![
                StopCapture { id: *turn_id },
                Cleanup { id: *turn_id },
                EmitUpdate,
            ],
        ),
        (Listening { turn_id, .. }, CaptureStarted { id }) if *turn_id == id => {
            (state.clone(), vec![])
        }
        // Capture could not start: the feature is unavailable on this host.
        // The session survives, just without voice input.
        (Listening { turn_id, .. }, CaptureUnavailable { id, err }) if *turn_id == id => (
            Idle,
            vec![
                StopCapture { id },
                Cleanup { id },
                Notify {
                    message: format!("Voice input unavailable: {}", err),
                },
                EmitUpdate,
            ],
        ),
        // The recognizer session died under us while we still want to
        // listen. Restart it; this is recovery, not an error.
        (Listening { turn_id, .. }, CaptureEnded { id }) if *turn_id == id => {
            (state.clone(), vec![StartCapture { id }])
        }
        (
            Listening {
                turn_id,
                utterance,
            },
            InterimTranscript { id, text },
        ) if *turn_id == id => {
            let mut utterance = utterance.clone();
            utterance.set_interim(&text);
            (
                Listening {
                    turn_id: *turn_id,
                    utterance,
                },
                vec![EmitUpdate],
            )
        }
        (
            Listening {
                turn_id,
                utterance,
            },
            FinalTranscript { id, text },
        ) if *turn_id == id => {
            let mut utterance = utterance.clone();
            utterance.commit(&text);
            (
                Listening {
                    turn_id: *turn_id,
                    utterance,
                },
                vec![EmitUpdate],
            )
        }
        // Silence poll: dispatch once the accumulated utterance has settled.
        // With an empty accumulator the tick never dispatches, so idle
        // listening cannot fire utterance-complete.
        (
            Listening {
                turn_id,
                utterance,
            },
            SilenceTick { id },
        ) if *turn_id == id => {
            let settled = utterance
                .silence_elapsed()
                .map(|gap| gap >= tuning.silence_threshold)
                .unwrap_or(false);
            if utterance.has_speech() && settled {
                dispatch_utterance(*turn_id, utterance)
            } else {
                (state.clone(), vec![])
            }
        }
        (
            Listening {
                turn_id,
                utterance,
            },
            SendNow,
        ) => {
            if utterance.has_speech() {
                dispatch_utterance(*turn_id, utterance)
            } else {
                (state.clone(), vec![])
            }
        }
        (Listening { turn_id, .. }, ClearUtterance) => (
            Listening {
                turn_id: *turn_id,
                utterance: Utterance::new(),
            },
            vec![EmitUpdate],
        ),

        // -----------------
        // AwaitingReply
        // -----------------
        (AwaitingReply { turn_id, .. }, ReplyOk { id, text }) if *turn_id == id => {
            if muted {
                // Muted: skip playback but keep the loop advancing.
                resume_listening(vec![])
            } else {
                (
                    Speaking {
                        turn_id: *turn_id,
                        reply_text: text.clone(),
                    },
                    vec![StartPlayback { id, text }, EmitUpdate],
                )
            }
        }
        // Reply-service failure: degrade gracefully. Never leave the user
        // stuck in AwaitingReply.
        (AwaitingReply { turn_id, .. }, ReplyFailed { id, err }) if *turn_id == id => {
            resume_listening(vec![Notify {
                message: format!("Reply failed: {}", err),
            }])
        }
        (AwaitingReply { turn_id, .. }, Close) => (
            Idle,
            vec![Cleanup { id: *turn_id }, EmitUpdate],
        ),

        // -----------------
        // Speaking
        // -----------------
        (Speaking { turn_id, .. }, PlaybackDone { id }) if *turn_id == id => {
            resume_listening(vec![])
        }
        // Playback failure is non-fatal: the conversation continues without
        // audio output.
        (Speaking { turn_id, .. }, PlaybackFailed { id, err }) if *turn_id == id => {
            resume_listening(vec![Notify {
                message: format!("Playback failed: {}", err),
            }])
        }
        (Speaking { turn_id, .. }, Close) => (
            Idle,
            vec![
                StopPlayback,
                Cleanup { id: *turn_id },
                EmitUpdate,
            ],
        ),

        // -----------------
        // Stale events (drop silently)
        // -----------------
        (_, CaptureStarted { id }) if is_stale(id) => (state.clone(), vec![]),
        (_, CaptureUnavailable { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, CaptureEnded { id }) if is_stale(id) => (state.clone(), vec![]),
        (_, InterimTranscript { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, FinalTranscript { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, SilenceTick { id }) if is_stale(id) => (state.clone(), vec![]),
        (_, ReplyOk { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, ReplyFailed { id, .. }) if is_stale(id) => (state.clone(), vec![]),
        (_, PlaybackDone { id }) if is_stale(id) => (state.clone(), vec![]),
        (_, PlaybackFailed { id, .. }) if is_stale(id) => (state.clone(), vec![]),

        // -----------------
        // Unhandled: no transition
        // -----------------
        _ => (state.clone(), vec![]),
    }
}

/// Shared Listening -> AwaitingReply transition: capture the accumulated
/// text as the outgoing message, stop capture first, then dispatch.
fn dispatch_utterance(turn_id: Uuid, utterance: &Utterance) -> (State, Vec<Effect>) {
    let text = utterance.text().to_string();
    (
        State::AwaitingReply {
            turn_id,
            sent_text: text.clone(),
        },
        vec![
            Effect::StopCapture { id: turn_id },
            Effect::DispatchReply { id: turn_id, text },
            Effect::EmitUpdate,
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const TUNING: TurnTuning = TurnTuning {
        silence_threshold: Duration::from_millis(2000),
        resume_delay: Duration::from_millis(500),
    };

    fn listening_with(text: &str, silence: Duration) -> (State, Uuid) {
        let id = Uuid::new_v4();
        let mut utterance = Utterance::new();
        if !text.is_empty() {
            utterance.commit(text);
        }
        utterance.backdate(silence);
        (
            State::Listening {
                turn_id: id,
                utterance,
            },
            id,
        )
    }

    fn has_effect(effects: &[Effect], pred: impl Fn(&Effect) -> bool) -> bool {
        effects.iter().any(pred)
    }

    #[test]
    fn idle_open_transitions_to_listening() {
        let (next, effects) = reduce(&State::Idle, Event::Open, false, &TUNING);
        assert!(matches!(next, State::Listening { .. }));
        assert!(has_effect(&effects, |e| matches!(e, Effect::StartCapture { .. })));
        assert!(has_effect(&effects, |e| matches!(
            e,
            Effect::StartSilencePoll { .. }
        )));
        assert!(has_effect(&effects, |e| matches!(e, Effect::EmitUpdate)));
    }

    #[test]
    fn final_transcript_accumulates() {
        let (state, id) = listening_with("", Duration::ZERO);
        let (next, _) = reduce(
            &state,
            Event::FinalTranscript {
                id,
                text: "Book a table".to_string(),
            },
            false,
            &TUNING,
        );
        let (next, _) = reduce(
            &next,
            Event::FinalTranscript {
                id,
                text: "for two tonight".to_string(),
            },
            false,
            &TUNING,
        );
        match next {
            State::Listening { utterance, .. } => {
                assert_eq!(utterance.text(), "Book a table for two tonight ");
            }
            other => panic!("Expected Listening, got {:?}", other),
        }
    }

    #[test]
    fn interim_transcript_never_accumulates() {
        let (state, id) = listening_with("", Duration::ZERO);
        let (next, effects) = reduce(
            &state,
            Event::InterimTranscript {
                id,
                text: "Book a ta".to_string(),
            },
            false,
            &TUNING,
        );
        match next {
            State::Listening { utterance, .. } => {
                assert_eq!(utterance.text(), "");
                assert_eq!(utterance.interim(), "Book a ta");
            }
            other => panic!("Expected Listening, got {:?}", other),
        }
        // Interim text is surfaced as a live preview.
        assert!(has_effect(&effects, |e| matches!(e, Effect::EmitUpdate)));
    }

    #[test]
    fn silence_tick_dispatches_settled_utterance() {
        let (state, id) = listening_with("Book a table for two tonight", Duration::from_millis(2100));
        let (next, effects) = reduce(&state, Event::SilenceTick { id }, false, &TUNING);

        match next {
            State::AwaitingReply { sent_text, .. } => {
                assert_eq!(sent_text, "Book a table for two tonight ");
            }
            other => panic!("Expected AwaitingReply, got {:?}", other),
        }
        // Capture must be stopped before dispatch.
        assert!(has_effect(&effects, |e| matches!(e, Effect::StopCapture { .. })));
        assert!(has_effect(&effects, |e| matches!(
            e,
            Effect::DispatchReply { text, .. } if text == "Book a table for two tonight "
        )));
    }

    #[test]
    fn silence_tick_before_threshold_does_nothing() {
        let (state, id) = listening_with("hello", Duration::from_millis(900));
        let (next, effects) = reduce(&state, Event::SilenceTick { id }, false, &TUNING);
        assert!(matches!(next, State::Listening { .. }));
        assert!(effects.is_empty());
    }

    #[test]
    fn silence_tick_with_empty_accumulator_never_dispatches() {
        let (state, id) = listening_with("", Duration::from_secs(60));
        let (next, effects) = reduce(&state, Event::SilenceTick { id }, false, &TUNING);
        assert!(matches!(next, State::Listening { .. }));
        assert!(effects.is_empty());
    }

    #[test]
    fn dispatch_happens_once_per_utterance() {
        // After the first tick dispatches, the state has left Listening, so
        // further ticks carry a stale id and are ignored.
        let (state, id) = listening_with("hello", Duration::from_secs(3));
        let (next, _) = reduce(&state, Event::SilenceTick { id }, false, &TUNING);
        assert!(matches!(next, State::AwaitingReply { .. }));

        let (next2, effects) = reduce(&next, Event::SilenceTick { id }, false, &TUNING);
        assert!(matches!(next2, State::AwaitingReply { .. }));
        assert!(effects.is_empty());
    }

    #[test]
    fn send_now_dispatches_before_threshold() {
        let (state, _id) = listening_with("hello", Duration::from_millis(100));
        let (next, effects) = reduce(&state, Event::SendNow, false, &TUNING);
        assert!(matches!(next, State::AwaitingReply { .. }));
        assert!(has_effect(&effects, |e| matches!(e, Effect::DispatchReply { .. })));
    }

    #[test]
    fn send_now_with_no_speech_is_ignored() {
        let (state, _id) = listening_with("", Duration::ZERO);
        let (next, effects) = reduce(&state, Event::SendNow, false, &TUNING);
        assert!(matches!(next, State::Listening { .. }));
        assert!(effects.is_empty());
    }

    #[test]
    fn clear_utterance_empties_accumulator() {
        let (state, id) = listening_with("hello", Duration::from_secs(3));
        let (next, _) = reduce(&state, Event::ClearUtterance, false, &TUNING);

        // After the clear, even a long-overdue tick must not dispatch.
        let (next, effects) = reduce(&next, Event::SilenceTick { id }, false, &TUNING);
        assert!(matches!(next, State::Listening { .. }));
        assert!(effects.is_empty());
    }

    #[test]
    fn reply_ok_unmuted_starts_playback() {
        let id = Uuid::new_v4();
        let state = State::AwaitingReply {
            turn_id: id,
            sent_text: "hi ".to_string(),
        };
        let (next, effects) = reduce(
            &state,
            Event::ReplyOk {
                id,
                text: "Done, table booked for 8pm".to_string(),
            },
            false,
            &TUNING,
        );
        assert!(matches!(next, State::Speaking { .. }));
        assert!(has_effect(&effects, |e| matches!(e, Effect::StartPlayback { .. })));
    }

    #[test]
    fn reply_ok_muted_skips_playback_but_advances() {
        let id = Uuid::new_v4();
        let state = State::AwaitingReply {
            turn_id: id,
            sent_text: "hi ".to_string(),
        };
        let (next, effects) = reduce(
            &state,
            Event::ReplyOk {
                id,
                text: "Done".to_string(),
            },
            true,
            &TUNING,
        );
        assert!(matches!(next, State::Listening { .. }));
        assert!(!has_effect(&effects, |e| matches!(e, Effect::StartPlayback { .. })));
        assert!(has_effect(&effects, |e| matches!(
            e,
            Effect::ResumeCapture { delay, .. } if *delay == TUNING.resume_delay
        )));
    }

    #[test]
    fn reply_failure_returns_to_listening() {
        let id = Uuid::new_v4();
        let state = State::AwaitingReply {
            turn_id: id,
            sent_text: "hi ".to_string(),
        };
        let (next, effects) = reduce(
            &state,
            Event::ReplyFailed {
                id,
                err: "503".to_string(),
            },
            false,
            &TUNING,
        );
        assert!(matches!(next, State::Listening { .. }));
        assert!(has_effect(&effects, |e| matches!(e, Effect::ResumeCapture { .. })));
        assert!(has_effect(&effects, |e| matches!(e, Effect::Notify { .. })));
    }

    #[test]
    fn resume_uses_a_fresh_turn_id() {
        let id = Uuid::new_v4();
        let state = State::AwaitingReply {
            turn_id: id,
            sent_text: "hi ".to_string(),
        };
        let (next, _) = reduce(
            &state,
            Event::ReplyFailed {
                id,
                err: "boom".to_string(),
            },
            false,
            &TUNING,
        );
        match next {
            State::Listening { turn_id, .. } => assert_ne!(turn_id, id),
            other => panic!("Expected Listening, got {:?}", other),
        }
    }

    #[test]
    fn playback_done_resumes_listening() {
        let id = Uuid::new_v4();
        let state = State::Speaking {
            turn_id: id,
            reply_text: "Done".to_string(),
        };
        let (next, effects) = reduce(&state, Event::PlaybackDone { id }, false, &TUNING);
        assert!(matches!(next, State::Listening { .. }));
        assert!(has_effect(&effects, |e| matches!(e, Effect::ResumeCapture { .. })));
    }

    #[test]
    fn playback_failure_is_nonfatal() {
        let id = Uuid::new_v4();
        let state = State::Speaking {
            turn_id: id,
            reply_text: "Done".to_string(),
        };
        let (next, effects) = reduce(
            &state,
            Event::PlaybackFailed {
                id,
                err: "no output device".to_string(),
            },
            false,
            &TUNING,
        );
        assert!(matches!(next, State::Listening { .. }));
        assert!(has_effect(&effects, |e| matches!(e, Effect::Notify { .. })));
    }

    #[test]
    fn close_from_listening_stops_capture() {
        let (state, _id) = listening_with("partial", Duration::ZERO);
        let (next, effects) = reduce(&state, Event::Close, false, &TUNING);
        assert!(matches!(next, State::Idle));
        assert!(has_effect(&effects, |e| matches!(e, Effect::StopCapture { .. })));
        assert!(has_effect(&effects, |e| matches!(e, Effect::Cleanup { .. })));
    }

    #[test]
    fn close_from_speaking_stops_playback() {
        let id = Uuid::new_v4();
        let state = State::Speaking {
            turn_id: id,
            reply_text: "Done".to_string(),
        };
        let (next, effects) = reduce(&state, Event::Close, false, &TUNING);
        assert!(matches!(next, State::Idle));
        assert!(has_effect(&effects, |e| matches!(e, Effect::StopPlayback)));
    }

    #[test]
    fn capture_unavailable_disables_voice_mode() {
        let (state, id) = listening_with("", Duration::ZERO);
        let (next, effects) = reduce(
            &state,
            Event::CaptureUnavailable {
                id,
                err: "no input device".to_string(),
            },
            false,
            &TUNING,
        );
        assert!(matches!(next, State::Idle));
        assert!(has_effect(&effects, |e| matches!(e, Effect::Notify { .. })));
    }

    #[test]
    fn capture_ended_triggers_restart() {
        let (state, id) = listening_with("some speech", Duration::ZERO);
        let (next, effects) = reduce(&state, Event::CaptureEnded { id }, false, &TUNING);
        // Still listening; capture is simply restarted.
        match next {
            State::Listening { utterance, .. } => {
                assert_eq!(utterance.text(), "some speech ");
            }
            other => panic!("Expected Listening, got {:?}", other),
        }
        assert!(has_effect(&effects, |e| matches!(e, Effect::StartCapture { .. })));
    }

    #[test]
    fn stale_events_are_ignored() {
        let (state, _id) = listening_with("hello", Duration::from_secs(10));
        let stale = Uuid::new_v4();

        let cases = vec![
            Event::SilenceTick { id: stale },
            Event::FinalTranscript {
                id: stale,
                text: "x".to_string(),
            },
            Event::ReplyOk {
                id: stale,
                text: "x".to_string(),
            },
            Event::PlaybackDone { id: stale },
            Event::CaptureEnded { id: stale },
        ];
        for event in cases {
            let (next, effects) = reduce(&state, event, false, &TUNING);
            assert!(matches!(next, State::Listening { .. }));
            assert!(effects.is_empty());
        }
    }

    #[test]
    fn late_reply_after_close_is_discarded() {
        let id = Uuid::new_v4();
        let state = State::AwaitingReply {
            turn_id: id,
            sent_text: "hi ".to_string(),
        };
        let (next, _) = reduce(&state, Event::Close, false, &TUNING);
        assert!(matches!(next, State::Idle));

        // The in-flight reply completes after the close. It is stale now.
        let (next, effects) = reduce(
            &next,
            Event::ReplyOk {
                id,
                text: "too late".to_string(),
            },
            false,
            &TUNING,
        );
        assert!(matches!(next, State::Idle));
        assert!(effects.is_empty());
    }

    #[test]
    fn open_while_active_is_ignored() {
        let (state, _id) = listening_with("hello", Duration::ZERO);
        let (next, effects) = reduce(&state, Event::Open, false, &TUNING);
        assert!(matches!(next, State::Listening { .. }));
        assert!(effects.is_empty());
    }

    #[test]
    fn capture_and_playback_are_never_both_commanded() {
        // Walk a full turn and track which side is armed after each
        // transition's effects. StartCapture/ResumeCapture must never be
        // emitted together with StartPlayback, and each side must be stopped
        // before the other starts.
        let (mut state, id) = listening_with("book it", Duration::from_secs(3));
        let mut capture_armed = true;
        let mut playback_armed = false;

        let script = vec![
            Event::SilenceTick { id },
            Event::ReplyOk {
                id,
                text: "done".to_string(),
            },
            Event::PlaybackDone { id },
        ];
        for event in script {
            // PlaybackDone for the original id only applies while Speaking
            // under that id; fetch the live id when needed.
            let event = match (&state, event) {
                (State::Speaking { turn_id, .. }, Event::PlaybackDone { .. }) => {
                    Event::PlaybackDone { id: *turn_id }
                }
                (State::AwaitingReply { turn_id, .. }, Event::ReplyOk { text, .. }) => {
                    Event::ReplyOk {
                        id: *turn_id,
                        text,
                    }
                }
                (_, ev) => ev,
            };
            // Playback ends with its completion event, before any effects run.
            if matches!(&event, Event::PlaybackDone { .. } | Event::PlaybackFailed { .. }) {
                playback_armed = false;
            }
            let (next, effects) = reduce(&state, event, false, &TUNING);
            for eff in &effects {
                match eff {
                    Effect::StartCapture { .. } | Effect::ResumeCapture { .. } => {
                        assert!(!playback_armed, "capture armed while playback active");
                        capture_armed = true;
                    }
                    Effect::StopCapture { .. } => capture_armed = false,
                    Effect::StartPlayback { .. } => {
                        assert!(!capture_armed, "playback armed while capture active");
                        playback_armed = true;
                    }
                    Effect::StopPlayback => playback_armed = false,
                    _ => {}
                }
            }
            state = next;
        }
        assert!(matches!(state, State::Listening { .. }));
    }
}
