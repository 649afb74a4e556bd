//! Classification of a single phase attempt.
//!
//! A phase may only ask for one of three things: carry on, run again, or fail
//! the test. Everything else an attempt can end in (running out of time,
//! raising, being killed) is decided by the executor and lives in
//! [`PhaseOutcome`], never in [`PhaseResult`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::ExecutorError;

// ---------------------------------------------------------------------------
// PhaseResult
// ---------------------------------------------------------------------------

/// Directive a phase returns to the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseResult {
    /// Move on to the next phase.
    Continue,
    /// Run the same phase again.
    Repeat,
    /// Stop the test here.
    Fail,
}

impl fmt::Display for PhaseResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseResult::Continue => write!(f, "CONTINUE"),
            PhaseResult::Repeat => write!(f, "REPEAT"),
            PhaseResult::Fail => write!(f, "FAIL"),
        }
    }
}

impl FromStr for PhaseResult {
    type Err = ExecutorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CONTINUE" => Ok(PhaseResult::Continue),
            "REPEAT" => Ok(PhaseResult::Repeat),
            "FAIL" => Ok(PhaseResult::Fail),
            reserved @ ("TIMEOUT" | "ABORT") => Err(ExecutorError::InvalidOutcome(format!(
                "{reserved} is reserved for the executor and cannot be returned by a phase"
            ))),
            _ => Err(ExecutorError::InvalidOutcome(format!("{:?}", s))),
        }
    }
}

/// Conversion for whatever a phase's work returns on success.
///
/// `()` and `None` both mean the phase had nothing to say, which is CONTINUE.
pub trait IntoPhaseResult {
    fn into_phase_result(self) -> Option<PhaseResult>;
}

impl IntoPhaseResult for () {
    fn into_phase_result(self) -> Option<PhaseResult> {
        None
    }
}

impl IntoPhaseResult for PhaseResult {
    fn into_phase_result(self) -> Option<PhaseResult> {
        Some(self)
    }
}

impl IntoPhaseResult for Option<PhaseResult> {
    fn into_phase_result(self) -> Option<PhaseResult> {
        self
    }
}

// ---------------------------------------------------------------------------
// PhaseFailure
// ---------------------------------------------------------------------------

/// Error captured from an attempt, shareable between clones of an outcome.
#[derive(Clone)]
pub struct PhaseFailure(Arc<anyhow::Error>);

impl PhaseFailure {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        PhaseFailure(Arc::new(err.into()))
    }

    pub fn error(&self) -> &anyhow::Error {
        &self.0
    }

    /// Downcast to a concrete error type, e.g. [`ExecutorError`].
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }
}

impl fmt::Debug for PhaseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for PhaseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.0)
    }
}

// ---------------------------------------------------------------------------
// PhaseOutcome
// ---------------------------------------------------------------------------

/// How one phase attempt ended.
#[derive(Debug, Clone)]
pub enum PhaseOutcome {
    /// The work returned a directive (absent directives become CONTINUE).
    Result(PhaseResult),
    /// The deadline passed before the work produced anything.
    Timeout,
    /// The work returned an error or panicked.
    Error(PhaseFailure),
    /// The work was killed before it produced a result.
    Terminated(PhaseFailure),
}

/// What the executor does with the head of the pending queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueAction {
    /// Remove the head; the next phase runs.
    Pop,
    /// Leave the head in place; it runs again.
    Retain,
    /// Stop sequencing; the queue is left as is.
    Abandon,
}

/// Tag of a [`PhaseOutcome`] without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Result,
    Timeout,
    Error,
    Terminated,
}

impl PhaseOutcome {
    /// Normalize what a phase returned. `None` means CONTINUE.
    pub fn from_return(value: Option<PhaseResult>) -> Self {
        PhaseOutcome::Result(value.unwrap_or(PhaseResult::Continue))
    }

    /// Classify a textual directive, rejecting anything outside
    /// CONTINUE/REPEAT/FAIL.
    pub fn parse(raw: &str) -> Result<Self, ExecutorError> {
        raw.parse::<PhaseResult>().map(PhaseOutcome::Result)
    }

    /// The timeout marker.
    pub fn timeout() -> Self {
        PhaseOutcome::Timeout
    }

    pub fn error(err: impl Into<anyhow::Error>) -> Self {
        PhaseOutcome::Error(PhaseFailure::new(err))
    }

    pub fn terminated(phase: &str) -> Self {
        PhaseOutcome::Terminated(PhaseFailure::new(ExecutorError::ForcedTermination {
            phase: phase.to_string(),
        }))
    }

    pub fn kind(&self) -> OutcomeKind {
        match self {
            PhaseOutcome::Result(_) => OutcomeKind::Result,
            PhaseOutcome::Timeout => OutcomeKind::Timeout,
            PhaseOutcome::Error(_) => OutcomeKind::Error,
            PhaseOutcome::Terminated(_) => OutcomeKind::Terminated,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, PhaseOutcome::Timeout)
    }

    /// True when the attempt ended with a captured error, including a
    /// forced termination.
    pub fn carries_error(&self) -> bool {
        matches!(self, PhaseOutcome::Error(_) | PhaseOutcome::Terminated(_))
    }

    pub fn result(&self) -> Option<PhaseResult> {
        match self {
            PhaseOutcome::Result(r) => Some(*r),
            _ => None,
        }
    }

    pub fn failure(&self) -> Option<&PhaseFailure> {
        match self {
            PhaseOutcome::Error(f) | PhaseOutcome::Terminated(f) => Some(f),
            _ => None,
        }
    }

    /// Queue mutation for this outcome.
    pub fn queue_action(&self) -> QueueAction {
        match self {
            PhaseOutcome::Result(PhaseResult::Continue) => QueueAction::Pop,
            PhaseOutcome::Result(PhaseResult::Repeat) => QueueAction::Retain,
            PhaseOutcome::Result(PhaseResult::Fail)
            | PhaseOutcome::Timeout
            | PhaseOutcome::Error(_)
            | PhaseOutcome::Terminated(_) => QueueAction::Abandon,
        }
    }

    /// True when no further phase may run after this outcome.
    pub fn is_terminal(&self) -> bool {
        self.queue_action() == QueueAction::Abandon
    }

    pub fn summary(&self) -> OutcomeSummary {
        OutcomeSummary {
            kind: self.kind(),
            result: self.result(),
            error: self.failure().map(|f| f.to_string()),
        }
    }
}

impl fmt::Display for PhaseOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseOutcome::Result(r) => write!(f, "{r}"),
            PhaseOutcome::Timeout => write!(f, "TIMEOUT"),
            PhaseOutcome::Error(e) => write!(f, "ERROR ({e})"),
            PhaseOutcome::Terminated(e) => write!(f, "TERMINATED ({e})"),
        }
    }
}

impl From<PhaseResult> for PhaseOutcome {
    fn from(r: PhaseResult) -> Self {
        PhaseOutcome::Result(r)
    }
}

impl TryFrom<&str> for PhaseOutcome {
    type Error = ExecutorError;

    fn try_from(raw: &str) -> Result<Self, ExecutorError> {
        PhaseOutcome::parse(raw)
    }
}

/// Serializable view of an outcome, stored in phase records and reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeSummary {
    pub kind: OutcomeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<PhaseResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
