//! Metrics collection for the conversation loop.
//!
//! Tracks per-turn timing (listening, reply latency, playback), text sizes,
//! and error history. Used for diagnostics and latency monitoring.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Maximum number of completed turns to retain in history
const MAX_TURN_HISTORY: usize = 50;

/// Maximum number of errors to retain in history
const MAX_ERROR_HISTORY: usize = 20;

/// Metrics for a completed conversation turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnMetrics {
    /// Unique identifier for this turn
    pub turn_id: String,
    /// Unix timestamp when the turn started (seconds)
    pub started_at: u64,
    /// Time spent listening before dispatch, in milliseconds
    pub listening_ms: u64,
    /// Length of the dispatched utterance in characters
    pub utterance_chars: u64,
    /// Reply service round-trip in milliseconds
    pub reply_ms: u64,
    /// Length of the reply text in characters
    pub reply_chars: u64,
    /// Synthesis + playback duration in milliseconds (0 when muted/skipped)
    pub playback_ms: u64,
    /// Total turn time (listening start to cycle end) in milliseconds
    pub total_turn_ms: u64,
    /// Whether the turn completed successfully
    pub success: bool,
    /// Error message if the turn failed
    pub error_message: Option<String>,
}

/// Summary statistics across all recorded turns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    /// Total number of turns attempted
    pub total_turns: u64,
    /// Number of successful turns
    pub successful_turns: u64,
    /// Number of failed turns
    pub failed_turns: u64,
    /// Average listening duration (ms) across successful turns
    pub avg_listening_ms: u64,
    /// Average reply latency (ms) across successful turns
    pub avg_reply_ms: u64,
    /// Average total turn time (ms) across successful turns
    pub avg_total_turn_ms: u64,
    /// Most recent error, if any
    pub last_error: Option<ErrorRecord>,
}

/// Record of an error that occurred during operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Unix timestamp when the error occurred (seconds)
    pub timestamp: u64,
    /// Category of error (e.g. "capture", "reply", "playback")
    pub error_type: String,
    /// Human-readable error message
    pub message: String,
    /// Associated turn ID, if applicable
    pub turn_id: Option<String>,
}

/// Internal state for tracking an in-progress turn
struct TurnInProgress {
    turn_id: Uuid,
    started_at: Instant,
    started_at_unix: u64,
    dispatched_at: Option<Instant>,
    listening_duration: Option<Duration>,
    utterance_chars: Option<usize>,
    reply_duration: Option<Duration>,
    reply_chars: Option<usize>,
    playback_started: Option<Instant>,
    playback_duration: Option<Duration>,
}

impl TurnInProgress {
    fn new(turn_id: Uuid) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        Self {
            turn_id,
            started_at: Instant::now(),
            started_at_unix: now,
            dispatched_at: None,
            listening_duration: None,
            utterance_chars: None,
            reply_duration: None,
            reply_chars: None,
            playback_started: None,
            playback_duration: None,
        }
    }

    fn to_metrics(&self, success: bool, error_message: Option<String>) -> TurnMetrics {
        TurnMetrics {
            turn_id: self.turn_id.to_string(),
            started_at: self.started_at_unix,
            listening_ms: self
                .listening_duration
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            utterance_chars: self.utterance_chars.unwrap_or(0) as u64,
            reply_ms: self
                .reply_duration
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            reply_chars: self.reply_chars.unwrap_or(0) as u64,
            playback_ms: self
                .playback_duration
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
            total_turn_ms: self.started_at.elapsed().as_millis() as u64,
            success,
            error_message,
        }
    }
}

/// Collects and stores metrics for conversation turns
pub struct MetricsCollector {
    /// History of completed turns (newest first)
    history: VecDeque<TurnMetrics>,
    /// History of errors (newest first)
    errors: VecDeque<ErrorRecord>,
    /// Currently in-progress turn, if any
    current_turn: Option<TurnInProgress>,
    /// Total turns ever attempted
    total_turns: u64,
    /// Total successful turns
    successful_turns: u64,
}

impl MetricsCollector {
    /// Create a new empty metrics collector
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(MAX_TURN_HISTORY),
            errors: VecDeque::with_capacity(MAX_ERROR_HISTORY),
            current_turn: None,
            total_turns: 0,
            successful_turns: 0,
        }
    }

    /// Start tracking a new turn when listening begins.
    ///
    /// Re-arming capture for the same turn (recovery restart) is not a new
    /// turn. If a different turn is still open it is discarded as failed
    /// (this indicates a state machine bug).
    pub fn start_turn(&mut self, turn_id: Uuid) {
        if let Some(ref current) = self.current_turn {
            if current.turn_id == turn_id {
                log::debug!("Metrics: turn {} re-armed, not restarting", turn_id);
                return;
            }
        }

        if let Some(old_turn) = self.current_turn.take() {
            log::warn!(
                "Metrics: discarding in-progress turn {} to start new turn {}",
                old_turn.turn_id,
                turn_id
            );
            let metrics = old_turn.to_metrics(false, Some("Discarded: new turn started".to_string()));
            self.add_to_history(metrics);
        }

        log::debug!("Metrics: starting turn {}", turn_id);
        self.current_turn = Some(TurnInProgress::new(turn_id));
        self.total_turns += 1;
    }

    /// Mark that the utterance was dispatched to the reply service.
    pub fn utterance_dispatched(&mut self, utterance_chars: usize) {
        if let Some(ref mut turn) = self.current_turn {
            turn.listening_duration = Some(turn.started_at.elapsed());
            turn.utterance_chars = Some(utterance_chars);
            turn.dispatched_at = Some(Instant::now());
            log::debug!(
                "Metrics: turn {} dispatched after {:?} ({} chars)",
                turn.turn_id,
                turn.listening_duration,
                utterance_chars
            );
        }
    }

    /// Mark that the reply arrived.
    pub fn reply_completed(&mut self, reply_chars: usize) {
        if let Some(ref mut turn) = self.current_turn {
            if let Some(dispatched) = turn.dispatched_at {
                turn.reply_duration = Some(dispatched.elapsed());
            }
            turn.reply_chars = Some(reply_chars);
            log::info!(
                "Metrics: turn {} reply in {:?} ({} chars)",
                turn.turn_id,
                turn.reply_duration,
                reply_chars
            );
        }
    }

    /// Mark that synthesis/playback started.
    pub fn playback_started(&mut self) {
        if let Some(ref mut turn) = self.current_turn {
            turn.playback_started = Some(Instant::now());
        }
    }

    /// Mark that playback finished.
    pub fn playback_finished(&mut self) {
        if let Some(ref mut turn) = self.current_turn {
            if let Some(started) = turn.playback_started {
                turn.playback_duration = Some(started.elapsed());
            }
        }
    }

    /// Mark the current turn as successfully completed
    pub fn turn_completed(&mut self) {
        if let Some(turn) = self.current_turn.take() {
            let metrics = turn.to_metrics(true, None);
            log::info!(
                "Metrics: turn {} completed - total {}ms (listen {}ms + reply {}ms + playback {}ms)",
                metrics.turn_id,
                metrics.total_turn_ms,
                metrics.listening_ms,
                metrics.reply_ms,
                metrics.playback_ms
            );
            self.add_to_history(metrics);
            self.successful_turns += 1;
        }
    }

    /// Mark the current turn as failed with an error message
    pub fn turn_failed(&mut self, error: String) {
        let turn_id = self.current_turn.as_ref().map(|t| t.turn_id.to_string());

        if let Some(turn) = self.current_turn.take() {
            let metrics = turn.to_metrics(false, Some(error.clone()));
            log::warn!(
                "Metrics: turn {} failed after {}ms - {}",
                metrics.turn_id,
                metrics.total_turn_ms,
                error
            );
            self.add_to_history(metrics);
        }

        self.record_error("turn".to_string(), error, turn_id);
    }

    /// Cancel the current turn without recording metrics
    pub fn turn_cancelled(&mut self) {
        if let Some(turn) = self.current_turn.take() {
            log::debug!("Metrics: turn {} cancelled", turn.turn_id);
            // Don't add to history - cancelled turns aren't counted
            self.total_turns = self.total_turns.saturating_sub(1);
        }
    }

    /// Record an error (not necessarily tied to a turn)
    pub fn record_error(&mut self, error_type: String, message: String, turn_id: Option<String>) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let error = ErrorRecord {
            timestamp: now,
            error_type,
            message,
            turn_id,
        };

        log::debug!("Metrics: recording error - {:?}", error);

        self.errors.push_front(error);

        while self.errors.len() > MAX_ERROR_HISTORY {
            self.errors.pop_back();
        }
    }

    /// Get summary statistics
    pub fn get_summary(&self) -> MetricsSummary {
        let successful: Vec<_> = self.history.iter().filter(|t| t.success).collect();
        let count = successful.len() as u64;

        let (avg_listening, avg_reply, avg_total) = if count > 0 {
            let sum_listening: u64 = successful.iter().map(|t| t.listening_ms).sum();
            let sum_reply: u64 = successful.iter().map(|t| t.reply_ms).sum();
            let sum_total: u64 = successful.iter().map(|t| t.total_turn_ms).sum();
            (sum_listening / count, sum_reply / count, sum_total / count)
        } else {
            (0, 0, 0)
        };

        MetricsSummary {
            total_turns: self.total_turns,
            successful_turns: self.successful_turns,
            failed_turns: self.total_turns.saturating_sub(self.successful_turns),
            avg_listening_ms: avg_listening,
            avg_reply_ms: avg_reply,
            avg_total_turn_ms: avg_total,
            last_error: self.errors.front().cloned(),
        }
    }

    /// Get the turn history (newest first)
    pub fn get_history(&self) -> Vec<TurnMetrics> {
        self.history.iter().cloned().collect()
    }

    /// Get the error history (newest first)
    pub fn get_errors(&self) -> Vec<ErrorRecord> {
        self.errors.iter().cloned().collect()
    }

    /// Check if there's an active turn for the given ID
    pub fn is_active_turn(&self, turn_id: Uuid) -> bool {
        self.current_turn
            .as_ref()
            .map(|t| t.turn_id == turn_id)
            .unwrap_or(false)
    }

    fn add_to_history(&mut self, metrics: TurnMetrics) {
        self.history.push_front(metrics);

        while self.history.len() > MAX_TURN_HISTORY {
            self.history.pop_back();
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_collector_is_empty() {
        let collector = MetricsCollector::new();
        let summary = collector.get_summary();

        assert_eq!(summary.total_turns, 0);
        assert_eq!(summary.successful_turns, 0);
        assert_eq!(summary.failed_turns, 0);
        assert!(collector.get_history().is_empty());
        assert!(collector.get_errors().is_empty());
    }

    #[test]
    fn test_successful_turn_tracking() {
        let mut collector = MetricsCollector::new();
        let turn_id = Uuid::new_v4();

        collector.start_turn(turn_id);
        std::thread::sleep(std::time::Duration::from_millis(10));
        collector.utterance_dispatched(28);
        std::thread::sleep(std::time::Duration::from_millis(10));
        collector.reply_completed(26);
        collector.playback_started();
        std::thread::sleep(std::time::Duration::from_millis(10));
        collector.playback_finished();
        collector.turn_completed();

        let summary = collector.get_summary();
        assert_eq!(summary.total_turns, 1);
        assert_eq!(summary.successful_turns, 1);
        assert_eq!(summary.failed_turns, 0);

        let history = collector.get_history();
        assert_eq!(history.len(), 1);
        assert!(history[0].success);
        assert_eq!(history[0].utterance_chars, 28);
        assert_eq!(history[0].reply_chars, 26);
        assert!(history[0].listening_ms >= 10);
        assert!(history[0].reply_ms >= 10);
        assert!(history[0].playback_ms >= 10);
    }

    #[test]
    fn test_failed_turn_tracking() {
        let mut collector = MetricsCollector::new();
        let turn_id = Uuid::new_v4();

        collector.start_turn(turn_id);
        collector.utterance_dispatched(12);
        collector.turn_failed("Network error".to_string());

        let summary = collector.get_summary();
        assert_eq!(summary.total_turns, 1);
        assert_eq!(summary.successful_turns, 0);
        assert_eq!(summary.failed_turns, 1);
        assert!(summary.last_error.is_some());
        assert_eq!(summary.last_error.unwrap().message, "Network error");

        let history = collector.get_history();
        assert!(!history[0].success);
        assert_eq!(history[0].error_message, Some("Network error".to_string()));
    }

    #[test]
    fn test_cancelled_turn_not_counted() {
        let mut collector = MetricsCollector::new();
        let turn_id = Uuid::new_v4();

        collector.start_turn(turn_id);
        collector.turn_cancelled();

        let summary = collector.get_summary();
        assert_eq!(summary.total_turns, 0);
        assert!(collector.get_history().is_empty());
    }

    #[test]
    fn test_rearming_same_turn_is_not_a_restart() {
        let mut collector = MetricsCollector::new();
        let turn_id = Uuid::new_v4();

        collector.start_turn(turn_id);
        // Capture recovery restarts listening under the same turn id.
        collector.start_turn(turn_id);

        assert_eq!(collector.get_summary().total_turns, 1);
        assert!(collector.is_active_turn(turn_id));
    }

    #[test]
    fn test_new_turn_discards_stale_open_turn() {
        let mut collector = MetricsCollector::new();

        collector.start_turn(Uuid::new_v4());
        collector.start_turn(Uuid::new_v4());

        // The stale turn lands in history as failed.
        let history = collector.get_history();
        assert_eq!(history.len(), 1);
        assert!(!history[0].success);
    }

    #[test]
    fn test_history_limit() {
        let mut collector = MetricsCollector::new();

        for i in 0..(MAX_TURN_HISTORY + 10) {
            collector.start_turn(Uuid::new_v4());
            collector.utterance_dispatched(i);
            collector.reply_completed(i);
            collector.turn_completed();
        }

        let history = collector.get_history();
        assert_eq!(history.len(), MAX_TURN_HISTORY);

        // Newest should be first (highest char count)
        assert!(history[0].utterance_chars > history[MAX_TURN_HISTORY - 1].utterance_chars);
    }

    #[test]
    fn test_error_history_limit() {
        let mut collector = MetricsCollector::new();

        for i in 0..(MAX_ERROR_HISTORY + 5) {
            collector.record_error("reply".to_string(), format!("error {}", i), None);
        }

        let errors = collector.get_errors();
        assert_eq!(errors.len(), MAX_ERROR_HISTORY);
        // Newest first
        assert!(errors[0].message.contains(&format!("{}", MAX_ERROR_HISTORY + 4)));
    }
}
