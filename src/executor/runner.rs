//! Bounded execution of a single phase attempt.
//!
//! The work runs on its own OS thread so a phase that never returns cannot
//! hold up the sequencing task or runtime shutdown. The waiting side races
//! three things: the result arriving, the deadline, and a kill request.
//! Killing is best effort. The token is tripped and the waiter is released,
//! but code that never looks at the token keeps running in the background
//! until it returns on its own.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{millis, ExecutorError, PhaseOutcome};
use crate::phase::{Phase, PhaseContext};

/// Cloneable kill switch for one runner, safe to use from any thread.
#[derive(Debug, Clone)]
pub struct RunnerHandle {
    phase: Arc<str>,
    cancel: CancellationToken,
    kill_requested: Arc<AtomicBool>,
}

impl RunnerHandle {
    fn new(phase: &str) -> Self {
        Self {
            phase: Arc::from(phase),
            cancel: CancellationToken::new(),
            kill_requested: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request termination of the running work.
    ///
    /// Idempotent: only the first call has any effect and returns `true`.
    pub fn kill(&self) -> bool {
        if self.kill_requested.swap(true, Ordering::AcqRel) {
            return false;
        }
        warn!(phase = %self.phase, "kill requested for running phase");
        self.cancel.cancel();
        true
    }

    pub fn is_killed(&self) -> bool {
        self.kill_requested.load(Ordering::Acquire)
    }

    pub fn phase_name(&self) -> &str {
        &self.phase
    }
}

enum RunnerState {
    Idle,
    Running(oneshot::Receiver<PhaseOutcome>),
    Finished,
}

/// Runs one attempt of one phase under a deadline.
pub struct BoundedRunner {
    phase: Phase,
    handle: RunnerHandle,
    state: RunnerState,
}

impl BoundedRunner {
    pub fn new(phase: Phase) -> Self {
        let handle = RunnerHandle::new(phase.name());
        Self {
            phase,
            handle,
            state: RunnerState::Idle,
        }
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn handle(&self) -> RunnerHandle {
        self.handle.clone()
    }

    /// Request termination. See [`RunnerHandle::kill`].
    pub fn kill(&self) -> bool {
        self.handle.kill()
    }

    /// Evaluate the phase's `run_if` guard on a separate thread.
    ///
    /// The guard runs under the attempt's deadline and kill switch, so a hung
    /// guard cannot stall the caller. `Ok` carries the verdict. `Err` carries
    /// the outcome that ends the run when the guard times out, panics or is
    /// killed.
    pub async fn check_guard(
        &self,
        mut ctx: PhaseContext,
        deadline: Duration,
    ) -> Result<bool, PhaseOutcome> {
        if self.phase.options().run_if.is_none() {
            return Ok(true);
        }
        let name = self.phase.name();
        if self.handle.is_killed() {
            return Err(PhaseOutcome::terminated(name));
        }

        ctx.bind_cancellation(self.handle.cancel.clone());
        let (tx, mut rx) = oneshot::channel();
        let phase = self.phase.clone();
        thread::Builder::new()
            .name(format!("guard:{name}"))
            .spawn(move || {
                let _entered = ctx.span().enter();
                let verdict = panic::catch_unwind(AssertUnwindSafe(|| phase.should_run(&ctx)))
                    .map_err(|payload| panic_message(payload.as_ref()));
                if tx.send(verdict).is_err() {
                    debug!(phase = %phase.name(), "late run_if verdict discarded");
                }
            })
            .map_err(|source| {
                PhaseOutcome::error(ExecutorError::Spawn {
                    phase: name.to_string(),
                    source,
                })
            })?;

        let cancel = self.handle.cancel.clone();
        tokio::select! {
            biased;
            verdict = &mut rx => match verdict {
                Ok(Ok(run)) => Ok(run),
                Ok(Err(message)) => {
                    error!(phase = %name, panic = %message, "run_if guard panicked");
                    Err(PhaseOutcome::error(ExecutorError::WorkError {
                        phase: name.to_string(),
                        message: format!("run_if guard panicked: {message}"),
                    }))
                }
                Err(_) => Err(PhaseOutcome::terminated(name)),
            },
            _ = cancel.cancelled() => Err(PhaseOutcome::terminated(name)),
            _ = tokio::time::sleep(deadline) => {
                warn!(
                    phase = %name,
                    timeout_ms = millis(deadline),
                    "run_if guard did not finish in time"
                );
                self.handle.kill();
                Err(PhaseOutcome::timeout())
            }
        }
    }

    /// Launch the work on a dedicated thread. A runner can only be started
    /// once.
    pub fn start(&mut self, mut ctx: PhaseContext) -> Result<(), ExecutorError> {
        if !matches!(self.state, RunnerState::Idle) {
            return Err(ExecutorError::AlreadyStarted(self.phase.name().to_string()));
        }

        ctx.bind_cancellation(self.handle.cancel.clone());
        let (tx, rx) = oneshot::channel();
        let phase = self.phase.clone();

        thread::Builder::new()
            .name(format!("phase:{}", phase.name()))
            .spawn(move || {
                let outcome = run_attempt(&phase, &ctx);
                // The waiter may already have given up on us.
                if tx.send(outcome).is_err() {
                    debug!(phase = %phase.name(), "late phase result discarded");
                }
            })
            .map_err(|source| ExecutorError::Spawn {
                phase: self.phase.name().to_string(),
                source,
            })?;

        self.state = RunnerState::Running(rx);
        Ok(())
    }

    /// Wait at most `deadline` for the attempt to end.
    ///
    /// On deadline expiry the work is killed and [`PhaseOutcome::Timeout`] is
    /// returned straight away, without waiting for the kill to land.
    pub async fn await_result(
        &mut self,
        deadline: Duration,
    ) -> Result<PhaseOutcome, ExecutorError> {
        let mut rx = match std::mem::replace(&mut self.state, RunnerState::Finished) {
            RunnerState::Running(rx) => rx,
            other => {
                self.state = other;
                return Err(ExecutorError::NotRunning(self.phase.name().to_string()));
            }
        };

        enum Wake {
            Delivered(Result<PhaseOutcome, oneshot::error::RecvError>),
            Killed,
            Deadline,
        }

        let cancel = self.handle.cancel.clone();
        let wake = tokio::select! {
            biased;
            delivered = &mut rx => Wake::Delivered(delivered),
            _ = cancel.cancelled() => Wake::Killed,
            _ = tokio::time::sleep(deadline) => Wake::Deadline,
        };

        let name = self.phase.name();
        let outcome = match wake {
            Wake::Delivered(Ok(outcome)) => outcome,
            Wake::Delivered(Err(_)) => {
                warn!(phase = %name, "phase thread exited without reporting a result");
                PhaseOutcome::terminated(name)
            }
            // A result that was already delivered still counts.
            Wake::Killed => match rx.try_recv() {
                Ok(outcome) => outcome,
                Err(_) => PhaseOutcome::terminated(name),
            },
            Wake::Deadline => match rx.try_recv() {
                Ok(outcome) => outcome,
                Err(_) => {
                    let err = ExecutorError::TimeoutExceeded {
                        phase: name.to_string(),
                        timeout: deadline,
                    };
                    warn!(phase = %name, timeout_ms = millis(deadline), "{err}");
                    self.handle.kill();
                    PhaseOutcome::timeout()
                }
            },
        };
        Ok(outcome)
    }
}

/// Body of the phase thread: run the work, release the attempt's resources,
/// then classify.
fn run_attempt(phase: &Phase, ctx: &PhaseContext) -> PhaseOutcome {
    let _entered = ctx.span().enter();

    if ctx.is_cancelled() {
        return PhaseOutcome::terminated(phase.name());
    }

    let returned = panic::catch_unwind(AssertUnwindSafe(|| phase.run(ctx)));

    let released = ctx.resources().close_all();
    if released > 0 {
        debug!(released, "phase resources released");
    }

    // Once a kill has been requested the natural result no longer counts.
    if ctx.is_cancelled() {
        return PhaseOutcome::terminated(phase.name());
    }

    match returned {
        Ok(Ok(value)) => PhaseOutcome::from_return(value),
        Ok(Err(err)) => {
            error!(error = %format!("{err:#}"), "phase raised an error");
            PhaseOutcome::error(err)
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(panic = %message, "phase panicked");
            PhaseOutcome::error(ExecutorError::WorkError {
                phase: phase.name().to_string(),
                message,
            })
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
