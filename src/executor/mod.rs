//! Phase execution engine: outcome classification, bounded runners, and the
//! sequencing loop that walks the pending queue.

pub mod outcome;
pub mod runner;
pub mod sequencer;

use std::time::Duration;

use thiserror::Error;

pub use self::outcome::{
    IntoPhaseResult, OutcomeKind, OutcomeSummary, PhaseFailure, PhaseOutcome, PhaseResult,
    QueueAction,
};
pub use self::runner::{BoundedRunner, RunnerHandle};
pub use self::sequencer::{ExecutorState, PhaseExecutor, PhaseOutcomes, StopHandle};

/// Compiled-in fallback used when neither the phase nor the configuration
/// provides a usable timeout.
pub const DEFAULT_PHASE_TIMEOUT: Duration = Duration::from_millis(3 * 60 * 1000);

#[derive(Debug, Error)]
pub enum ExecutorError {
    /// A raw value could not be classified as a phase outcome.
    #[error("invalid phase result: {0}")]
    InvalidOutcome(String),

    #[error("phase {phase} raised an error: {message}")]
    WorkError { phase: String, message: String },

    #[error("phase {phase} did not finish within {}ms", timeout.as_millis())]
    TimeoutExceeded { phase: String, timeout: Duration },

    #[error("phase {phase} was forcibly terminated")]
    ForcedTermination { phase: String },

    #[error("runner for phase {0} was already started")]
    AlreadyStarted(String),

    #[error("runner for phase {0} is not running")]
    NotRunning(String),

    #[error("failed to spawn thread for phase {phase}: {source}")]
    Spawn {
        phase: String,
        #[source]
        source: std::io::Error,
    },
}

/// Pick the deadline for one attempt.
///
/// Zero never means "do not wait": it falls through to the next source.
pub fn resolve_timeout(phase_timeout: Option<Duration>, default_timeout: Duration) -> Duration {
    phase_timeout
        .filter(|t| !t.is_zero())
        .or_else(|| Some(default_timeout).filter(|t| !t.is_zero()))
        .unwrap_or(DEFAULT_PHASE_TIMEOUT)
}

/// Whole milliseconds in `d`, saturating at `u64::MAX`.
pub fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
