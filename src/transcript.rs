//! Utterance accumulation from incremental transcript events.
//!
//! The recognizer emits two kinds of text: **interim** results it may still
//! revise, and **finalized** results it will not touch again. Only finalized
//! fragments are accumulated into the outgoing utterance; interim text is
//! kept separately for live preview and discarded on the next event.
//!
//! Every transcript event (interim or final) refreshes the last-activity
//! timestamp, which is the sole input to silence detection.

use std::time::{Duration, Instant};

/// Text accumulated from one user utterance, plus the activity timestamp
/// silence detection is computed from.
#[derive(Debug, Clone)]
pub struct Utterance {
    /// Finalized fragments, concatenated. This is what gets dispatched.
    committed: String,
    /// Most recent interim result. Display only, never dispatched.
    interim: String,
    /// When the last transcript event (of either kind) arrived.
    last_activity: Option<Instant>,
}

impl Utterance {
    /// Create an empty utterance.
    pub fn new() -> Self {
        Self {
            committed: String::new(),
            interim: String::new(),
            last_activity: None,
        }
    }

    /// Append a finalized fragment and refresh the activity timestamp.
    ///
    /// A trailing space is added after each fragment so that consecutive
    /// fragments read as one sentence. Empty fragments only refresh the
    /// timestamp.
    pub fn commit(&mut self, fragment: &str) {
        if !fragment.is_empty() {
            self.committed.push_str(fragment);
            self.committed.push(' ');
            // A committed fragment supersedes whatever interim text led to it.
            self.interim.clear();
        }
        self.touch();
    }

    /// Record an interim result and refresh the activity timestamp.
    pub fn set_interim(&mut self, text: &str) {
        self.interim.clear();
        self.interim.push_str(text);
        self.touch();
    }

    /// Refresh the last-activity timestamp without changing any text.
    pub fn touch(&mut self) {
        self.last_activity = Some(Instant::now());
    }

    /// The accumulated, dispatchable text.
    pub fn text(&self) -> &str {
        &self.committed
    }

    /// The current interim preview text.
    pub fn interim(&self) -> &str {
        &self.interim
    }

    /// Whether any finalized speech has been accumulated.
    pub fn has_speech(&self) -> bool {
        !self.committed.is_empty()
    }

    /// Time since the last transcript event, or `None` before the first one.
    pub fn silence_elapsed(&self) -> Option<Duration> {
        self.last_activity.map(|at| at.elapsed())
    }

    /// Discard all accumulated and interim text.
    ///
    /// The activity timestamp is cleared too, so a freshly cleared utterance
    /// cannot trip the silence threshold.
    pub fn clear(&mut self) {
        self.committed.clear();
        self.interim.clear();
        self.last_activity = None;
    }

    /// Shift the activity timestamp into the past, for exercising silence
    /// thresholds without real sleeps.
    #[cfg(test)]
    pub(crate) fn backdate(&mut self, by: Duration) {
        if let Some(at) = self.last_activity {
            self.last_activity = Some(at - by);
        } else {
            self.last_activity = Some(Instant::now() - by);
        }
    }
}

impl Default for Utterance {
    fn default() -> Self {
        Self::new()
    }
}
