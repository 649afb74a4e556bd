//! The sequencing loop.
//!
//! [`PhaseExecutor`] walks the pending queue one attempt at a time. Nothing
//! happens unless the caller pulls the next outcome, and the only things
//! shared with other threads are the slot holding the current runner's kill
//! switch and the abort flag.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::runner::{BoundedRunner, RunnerHandle};
use super::{millis, resolve_timeout, PhaseOutcome, QueueAction};
use crate::config::ExecutorConfig;
use crate::phase::{Phase, PhaseContext};
use crate::record::TestState;

/// Where the executor is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorState {
    /// Phases pending, none running.
    Idle,
    /// An attempt is in flight.
    Running,
    /// A terminal outcome was produced; no further phase will start.
    Draining,
    /// The queue ran out.
    Empty,
}

type CurrentRunner = Arc<Mutex<Option<RunnerHandle>>>;

fn lock(slot: &CurrentRunner) -> MutexGuard<'_, Option<RunnerHandle>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Thread-safe abort switch for a [`PhaseExecutor`].
#[derive(Debug, Clone)]
pub struct StopHandle {
    current: CurrentRunner,
    halt: CancellationToken,
}

impl StopHandle {
    /// Kill the running phase, if there is one. Never touches the queue.
    ///
    /// Returns `true` only for the call that initiated the kill.
    pub fn stop(&self) -> bool {
        // Hold the slot while signalling so the runner cannot be swapped out
        // underneath us.
        let current = lock(&self.current);
        match current.as_ref() {
            Some(handle) => {
                let initiated = handle.kill();
                if initiated {
                    info!(phase = %handle.phase_name(), "stop requested");
                }
                initiated
            }
            None => {
                debug!("stop requested while no phase is running");
                false
            }
        }
    }

    /// Kill the running phase and keep any further phase from starting.
    pub fn abort(&self) -> bool {
        self.halt.cancel();
        self.stop()
    }

    pub fn is_aborted(&self) -> bool {
        self.halt.is_cancelled()
    }
}

/// Holds the current-runner slot for one attempt.
///
/// Dropped without [`InFlight::finish`] means the pulling future went away
/// mid-attempt: the attempt is killed so it cannot overlap the next one.
struct InFlight {
    current: CurrentRunner,
    handle: RunnerHandle,
    finished: bool,
}

impl InFlight {
    fn install(current: &CurrentRunner, handle: RunnerHandle) -> Self {
        *lock(current) = Some(handle.clone());
        Self {
            current: Arc::clone(current),
            handle,
            finished: false,
        }
    }

    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let mut current = lock(&self.current);
        if !self.finished && self.handle.kill() {
            warn!(phase = %self.handle.phase_name(), "attempt dropped before it finished, killed");
        }
        *current = None;
    }
}

pub struct PhaseExecutor {
    test_state: TestState,
    default_timeout: Duration,
    current: CurrentRunner,
    halt: CancellationToken,
    state: ExecutorState,
}

impl PhaseExecutor {
    pub fn new(test_state: TestState, config: &ExecutorConfig) -> Self {
        Self::with_default_timeout(test_state, config.default_timeout())
    }

    pub fn with_default_timeout(test_state: TestState, default_timeout: Duration) -> Self {
        let state = if test_state.is_empty() {
            ExecutorState::Empty
        } else {
            ExecutorState::Idle
        };
        Self {
            test_state,
            default_timeout,
            current: Arc::new(Mutex::new(None)),
            halt: CancellationToken::new(),
            state,
        }
    }

    pub fn state(&self) -> ExecutorState {
        self.state
    }

    pub fn test_state(&self) -> &TestState {
        &self.test_state
    }

    pub fn into_test_state(self) -> TestState {
        self.test_state
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            current: Arc::clone(&self.current),
            halt: self.halt.clone(),
        }
    }

    /// Kill the running phase, if any.
    pub fn stop(&self) -> bool {
        self.stop_handle().stop()
    }

    /// True once [`StopHandle::abort`] has been called.
    pub fn is_aborted(&self) -> bool {
        self.halt.is_cancelled()
    }

    /// Lazily run phases, yielding one outcome per attempt.
    ///
    /// Skipped phases yield nothing. The sequence ends once the queue is empty
    /// or a terminal outcome has been yielded, and it cannot be restarted.
    pub fn execute_phases(&mut self) -> PhaseOutcomes<'_> {
        PhaseOutcomes { executor: self }
    }

    async fn next_outcome(&mut self) -> Option<PhaseOutcome> {
        loop {
            match self.state {
                ExecutorState::Draining | ExecutorState::Empty => return None,
                ExecutorState::Running => return Some(self.abandon_in_flight()),
                ExecutorState::Idle => {}
            }

            if self.halt.is_cancelled() {
                info!(pending = self.test_state.pending_len(), "run aborted before next phase");
                self.state = ExecutorState::Draining;
                return None;
            }

            let Some(phase) = self.test_state.head().cloned() else {
                self.state = ExecutorState::Empty;
                return None;
            };

            let Some(outcome) = self.run_attempt(phase).await else {
                self.test_state.skip_head();
                self.settle_after_pop();
                continue;
            };

            match outcome.queue_action() {
                QueueAction::Pop => {
                    self.test_state.pop_head();
                    self.settle_after_pop();
                }
                QueueAction::Retain => self.state = ExecutorState::Idle,
                QueueAction::Abandon => {
                    info!(
                        pending = self.test_state.pending_len(),
                        outcome = %outcome,
                        "halting test run"
                    );
                    self.state = ExecutorState::Draining;
                }
            }
            return Some(outcome);
        }
    }

    /// Evaluate the guard and, if it allows, run one attempt of `phase`.
    /// `None` means the phase was skipped.
    async fn run_attempt(&mut self, phase: Phase) -> Option<PhaseOutcome> {
        let timeout = resolve_timeout(phase.options().timeout, self.default_timeout);
        let attempt = self.test_state.next_attempt();

        let mut runner = BoundedRunner::new(phase.clone());
        let in_flight = InFlight::install(&self.current, runner.handle());
        self.state = ExecutorState::Running;
        // An abort that raced the slot swap saw no runner to kill.
        if self.halt.is_cancelled() {
            runner.kill();
        }

        let guard_ctx = PhaseContext::new(phase.name(), attempt);
        match runner.check_guard(guard_ctx, timeout).await {
            Ok(true) => {}
            Ok(false) => {
                in_flight.finish();
                info!(phase = %phase.name(), "phase skipped, run_if returned false");
                self.state = ExecutorState::Idle;
                return None;
            }
            Err(outcome) => {
                // Nothing ran, but the halt still gets a record.
                self.test_state.begin_attempt(&phase, timeout);
                self.test_state.finish_attempt(&outcome);
                in_flight.finish();
                return Some(outcome);
            }
        }

        let attempt = self.test_state.begin_attempt(&phase, timeout);
        info!(
            phase = %phase.name(),
            attempt,
            timeout_ms = millis(timeout),
            "executing phase"
        );

        let outcome = match runner.start(PhaseContext::new(phase.name(), attempt)) {
            Ok(()) => runner
                .await_result(timeout)
                .await
                .unwrap_or_else(|e| PhaseOutcome::error(e)),
            Err(e) => PhaseOutcome::error(e),
        };

        in_flight.finish();
        self.test_state.finish_attempt(&outcome);
        debug!(phase = %phase.name(), outcome = %outcome, "phase finished");
        Some(outcome)
    }

    /// A previous pull was dropped while its attempt was in flight. That
    /// attempt was killed on drop; report it as terminated and halt.
    fn abandon_in_flight(&mut self) -> PhaseOutcome {
        let name = self
            .test_state
            .running_phase()
            .map(|record| record.name.clone())
            .or_else(|| self.test_state.head().map(|p| p.name().to_string()))
            .unwrap_or_default();
        warn!(phase = %name, "previous attempt was abandoned mid-flight, halting test run");
        let outcome = PhaseOutcome::terminated(&name);
        self.test_state.finish_attempt(&outcome);
        self.state = ExecutorState::Draining;
        outcome
    }

    fn settle_after_pop(&mut self) {
        self.state = if self.test_state.is_empty() {
            info!("all phases complete");
            ExecutorState::Empty
        } else {
            ExecutorState::Idle
        };
    }
}

/// Single-pass sequence of outcomes produced by
/// [`PhaseExecutor::execute_phases`].
///
/// Dropping a pending [`next`](PhaseOutcomes::next) kills the attempt it was
/// waiting on; the following pull reports that attempt as terminated.
pub struct PhaseOutcomes<'a> {
    executor: &'a mut PhaseExecutor,
}

impl PhaseOutcomes<'_> {
    /// Run until the next attempt finishes and return its outcome, or `None`
    /// once the run is over.
    #[allow(clippy::should_implement_trait)]
    pub async fn next(&mut self) -> Option<PhaseOutcome> {
        self.executor.next_outcome().await
    }

    /// Drive the sequence to its end.
    pub async fn collect_all(mut self) -> Vec<PhaseOutcome> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.next().await {
            outcomes.push(outcome);
        }
        outcomes
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.executor.stop_handle()
    }
}
