//! Test state: the pending queue plus what has been recorded about each
//! attempt so far.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::executor::{millis, OutcomeSummary, PhaseOutcome};
use crate::phase::{CodeInfo, Phase};

/// Timing and outcome of one phase attempt.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseRecord {
    pub id: Uuid,
    pub name: String,
    pub code_info: CodeInfo,
    pub attempt: u32,
    pub timeout_ms: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub outcome: Option<OutcomeSummary>,
}

impl PhaseRecord {
    pub fn start(phase: &Phase, attempt: u32, timeout: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: phase.name().to_string(),
            code_info: phase.code_info().clone(),
            attempt,
            timeout_ms: millis(timeout),
            start_time: Utc::now(),
            end_time: None,
            outcome: None,
        }
    }

    pub fn finish(&mut self, outcome: &PhaseOutcome) {
        self.end_time = Some(Utc::now());
        self.outcome = Some(outcome.summary());
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.end_time.map(|end| end - self.start_time)
    }
}

/// A phase whose guard said no.
#[derive(Debug, Clone, Serialize)]
pub struct SkippedPhase {
    pub name: String,
    pub code_info: CodeInfo,
    pub skipped_at: DateTime<Utc>,
}

/// Pending queue and history for one test run.
///
/// Only the executor's sequencing side mutates this.
#[derive(Debug, Default)]
pub struct TestState {
    pending: VecDeque<Phase>,
    running_phase: Option<PhaseRecord>,
    records: Vec<PhaseRecord>,
    skipped: Vec<SkippedPhase>,
    head_attempts: u32,
}

impl TestState {
    pub fn new(phases: impl IntoIterator<Item = Phase>) -> Self {
        Self {
            pending: phases.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn pending(&self) -> impl Iterator<Item = &Phase> {
        self.pending.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// The attempt in flight, if any.
    pub fn running_phase(&self) -> Option<&PhaseRecord> {
        self.running_phase.as_ref()
    }

    /// Finished attempts, oldest first.
    pub fn records(&self) -> &[PhaseRecord] {
        &self.records
    }

    pub fn skipped(&self) -> &[SkippedPhase] {
        &self.skipped
    }

    pub(crate) fn head(&self) -> Option<&Phase> {
        self.pending.front()
    }

    /// Attempt number the head would get if it ran now.
    pub(crate) fn next_attempt(&self) -> u32 {
        self.head_attempts + 1
    }

    pub(crate) fn pop_head(&mut self) -> Option<Phase> {
        self.head_attempts = 0;
        self.pending.pop_front()
    }

    pub(crate) fn skip_head(&mut self) {
        if let Some(phase) = self.pop_head() {
            self.skipped.push(SkippedPhase {
                name: phase.name().to_string(),
                code_info: phase.code_info().clone(),
                skipped_at: Utc::now(),
            });
        }
    }

    /// Mark the head as running. Called before the work starts.
    pub(crate) fn begin_attempt(&mut self, phase: &Phase, timeout: Duration) -> u32 {
        self.head_attempts += 1;
        self.running_phase = Some(PhaseRecord::start(phase, self.head_attempts, timeout));
        self.head_attempts
    }

    pub(crate) fn finish_attempt(&mut self, outcome: &PhaseOutcome) {
        if let Some(mut record) = self.running_phase.take() {
            record.finish(outcome);
            self.records.push(record);
        }
    }
}
