//! Summary of a finished test run.

use std::fmt::{self, Write as _};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::executor::{OutcomeKind, PhaseOutcome, PhaseResult};
use crate::record::{PhaseRecord, SkippedPhase, TestState};

/// Overall verdict of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pass,
    Fail,
    Timeout,
    Error,
    Aborted,
}

impl RunStatus {
    /// Derive the verdict from the last outcome of a finished sequence.
    pub fn from_last(last: Option<&PhaseOutcome>) -> Self {
        match last {
            None | Some(PhaseOutcome::Result(PhaseResult::Continue | PhaseResult::Repeat)) => {
                RunStatus::Pass
            }
            Some(PhaseOutcome::Result(PhaseResult::Fail)) => RunStatus::Fail,
            Some(PhaseOutcome::Timeout) => RunStatus::Timeout,
            Some(PhaseOutcome::Error(_)) => RunStatus::Error,
            Some(PhaseOutcome::Terminated(_)) => RunStatus::Aborted,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Pass => write!(f, "PASS"),
            RunStatus::Fail => write!(f, "FAIL"),
            RunStatus::Timeout => write!(f, "TIMEOUT"),
            RunStatus::Error => write!(f, "ERROR"),
            RunStatus::Aborted => write!(f, "ABORTED"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub plan: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub phases: Vec<PhaseRecord>,
    pub skipped: Vec<SkippedPhase>,
    /// Phases still queued when the run stopped.
    pub not_run: Vec<String>,
}

impl RunReport {
    pub fn new(
        plan: &str,
        started_at: DateTime<Utc>,
        last: Option<&PhaseOutcome>,
        state: &TestState,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            plan: plan.to_string(),
            status: RunStatus::from_last(last),
            started_at,
            finished_at: Utc::now(),
            phases: state.records().to_vec(),
            skipped: state.skipped().to_vec(),
            not_run: state.pending().map(|p| p.name().to_string()).collect(),
        }
    }

    pub fn is_pass(&self) -> bool {
        self.status == RunStatus::Pass
    }

    /// Human-readable table, one row per attempt.
    pub fn render_table(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "\nTest run: {} ({})", self.plan, self.run_id);
        let _ = writeln!(
            out,
            "{:<25} | {:<7} | {:<10} | {:>9} | Details",
            "Phase", "Attempt", "Outcome", "Time (ms)"
        );
        let _ = writeln!(
            out,
            "{:-<25}-|-{:-<7}-|-{:-<10}-|-{:->9}-|-{:-<40}",
            "", "", "", "", ""
        );
        for record in &self.phases {
            let (outcome, details) = match &record.outcome {
                Some(summary) => {
                    let label = match (summary.kind, summary.result) {
                        (OutcomeKind::Result, Some(r)) => r.to_string(),
                        (OutcomeKind::Timeout, _) => "TIMEOUT".to_string(),
                        (OutcomeKind::Error, _) => "ERROR".to_string(),
                        (OutcomeKind::Terminated, _) => "ABORTED".to_string(),
                        (OutcomeKind::Result, None) => "?".to_string(),
                    };
                    let details = match summary.kind {
                        OutcomeKind::Timeout => {
                            format!("no result within {}ms", record.timeout_ms)
                        }
                        _ => summary.error.clone().unwrap_or_default(),
                    };
                    (label, details)
                }
                None => ("RUNNING".to_string(), String::new()),
            };
            let elapsed = record
                .duration()
                .map(|d| d.num_milliseconds().to_string())
                .unwrap_or_default();
            let _ = writeln!(
                out,
                "{:<25} | {:<7} | {:<10} | {:>9} | {}",
                record.name, record.attempt, outcome, elapsed, details
            );
        }
        for skipped in &self.skipped {
            let _ = writeln!(
                out,
                "{:<25} | {:<7} | {:<10} | {:>9} | run_if returned false",
                skipped.name, "-", "SKIP", ""
            );
        }
        if !self.not_run.is_empty() {
            let _ = writeln!(out, "\nNot run: {}", self.not_run.join(", "));
        }
        let _ = writeln!(out, "\nResult: {}", self.status);
        out
    }
}
