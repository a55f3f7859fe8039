pub mod capture;
pub mod effects;
pub mod metrics;
pub mod playback;
pub mod reply;
pub mod session;
pub mod settings;
pub mod state_machine;
pub mod transcript;

// Re-export commonly used items for convenience
pub use effects::{EffectRunner, LoopEffectRunner, RunnerConfig, StubEffectRunner};
pub use metrics::{MetricsCollector, MetricsSummary, TurnMetrics};
pub use session::{SessionPhase, SessionSnapshot, SessionUpdate, VoiceSession};
pub use settings::{load_settings, save_settings, AppSettings};
pub use state_machine::{reduce, Effect, Event, State, TurnTuning};
pub use transcript::Utterance;
