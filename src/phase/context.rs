//! Per-attempt execution context handed to a phase's work.
//!
//! The context carries the attempt's logging span, a scope of resources that
//! get released when the attempt ends, and the cancellation token the runner
//! trips when the attempt is killed.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Span};

use crate::executor::ExecutorError;

/// Granularity of [`PhaseContext::sleep`].
const SLEEP_SLICE: Duration = Duration::from_millis(10);

type Closer = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

// ---------------------------------------------------------------------------
// ResourceScope
// ---------------------------------------------------------------------------

/// Resources acquired during one attempt, released last-in first-out.
///
/// The runner closes the scope after the work returns, whether it returned a
/// result, an error, or panicked. Anything still registered when the scope is
/// dropped is closed then.
#[derive(Default)]
pub struct ResourceScope {
    closers: Mutex<Vec<(String, Closer)>>,
}

impl ResourceScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a release action for something the phase just acquired.
    pub fn defer<F>(&self, label: impl Into<String>, close: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let label = label.into();
        debug!(resource = %label, "resource registered");
        self.lock().push((label, Box::new(close)));
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release everything registered so far, newest first. A failing or
    /// panicking release is logged and does not stop the others.
    ///
    /// Returns the number of resources released.
    pub fn close_all(&self) -> usize {
        let closers = std::mem::take(&mut *self.lock());
        let count = closers.len();
        for (label, close) in closers.into_iter().rev() {
            match panic::catch_unwind(AssertUnwindSafe(close)) {
                Ok(Ok(())) => debug!(resource = %label, "resource released"),
                Ok(Err(e)) => warn!(resource = %label, error = %e, "failed to release resource"),
                Err(_) => warn!(resource = %label, "resource release panicked"),
            }
        }
        count
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(String, Closer)>> {
        self.closers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for ResourceScope {
    fn drop(&mut self) {
        self.close_all();
    }
}

impl std::fmt::Debug for ResourceScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let labels: Vec<String> = self.lock().iter().map(|(l, _)| l.clone()).collect();
        f.debug_struct("ResourceScope").field("open", &labels).finish()
    }
}

// ---------------------------------------------------------------------------
// PhaseContext
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct PhaseContext {
    phase: String,
    attempt: u32,
    span: Span,
    resources: ResourceScope,
    cancel: CancellationToken,
}

impl PhaseContext {
    pub fn new(phase: &str, attempt: u32) -> Self {
        Self {
            phase: phase.to_string(),
            attempt,
            span: info_span!("phase", phase = %phase, attempt),
            resources: ResourceScope::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn phase_name(&self) -> &str {
        &self.phase
    }

    /// 1-based attempt number of the phase currently at the head of the queue.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Logger for the attempt. Events emitted inside it carry the phase name
    /// and attempt number.
    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn resources(&self) -> &ResourceScope {
        &self.resources
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Bail out of long-running work once the attempt has been killed.
    pub fn check_cancelled(&self) -> Result<(), ExecutorError> {
        if self.is_cancelled() {
            Err(ExecutorError::ForcedTermination {
                phase: self.phase.clone(),
            })
        } else {
            Ok(())
        }
    }

    /// Sleep that wakes early when the attempt is killed.
    pub fn sleep(&self, duration: Duration) -> Result<(), ExecutorError> {
        let until = Instant::now() + duration;
        loop {
            self.check_cancelled()?;
            let now = Instant::now();
            if now >= until {
                return Ok(());
            }
            thread::sleep(SLEEP_SLICE.min(until - now));
        }
    }

    pub(crate) fn bind_cancellation(&mut self, cancel: CancellationToken) {
        self.cancel = cancel;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_close_all_is_lifo() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let scope = ResourceScope::new();
        for name in ["psu", "uart", "jtag"] {
            let order = Arc::clone(&order);
            scope.defer(name, move || {
                order.lock().unwrap().push(name);
                Ok(())
            });
        }
        assert_eq!(scope.len(), 3);
        assert_eq!(scope.close_all(), 3);
        assert_eq!(*order.lock().unwrap(), vec!["jtag", "uart", "psu"]);
        assert!(scope.is_empty());
    }

    #[test]
    fn test_failing_release_does_not_stop_others() {
        let released = Arc::new(Mutex::new(Vec::new()));
        let scope = ResourceScope::new();
        {
            let released = Arc::clone(&released);
            scope.defer("first", move || {
                released.lock().unwrap().push("first");
                Ok(())
            });
        }
        scope.defer("broken", || anyhow::bail!("bus error"));
        scope.defer("panicky", || panic!("release blew up"));
        assert_eq!(scope.close_all(), 3);
        assert_eq!(*released.lock().unwrap(), vec!["first"]);
    }

    #[test]
    fn test_close_all_twice_releases_once() {
        let count = Arc::new(Mutex::new(0));
        let scope = ResourceScope::new();
        {
            let count = Arc::clone(&count);
            scope.defer("fixture", move || {
                *count.lock().unwrap() += 1;
                Ok(())
            });
        }
        assert_eq!(scope.close_all(), 1);
        assert_eq!(scope.close_all(), 0);
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn test_drop_releases_leftovers() {
        let released = Arc::new(Mutex::new(false));
        {
            let scope = ResourceScope::new();
            let released = Arc::clone(&released);
            scope.defer("socket", move || {
                *released.lock().unwrap() = true;
                Ok(())
            });
        }
        assert!(*released.lock().unwrap());
    }

    #[test]
    fn test_check_cancelled() {
        let ctx = PhaseContext::new("sensor", 1);
        assert!(ctx.check_cancelled().is_ok());
        ctx.cancellation().cancel();
        assert!(matches!(
            ctx.check_cancelled(),
            Err(ExecutorError::ForcedTermination { ref phase }) if phase == "sensor"
        ));
    }

    #[test]
    fn test_sleep_wakes_on_cancel() {
        let ctx = PhaseContext::new("settle", 1);
        let token = ctx.cancellation().clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            token.cancel();
        });
        let started = Instant::now();
        assert!(ctx.sleep(Duration::from_secs(10)).is_err());
        assert!(started.elapsed() < Duration::from_secs(5));
        canceller.join().unwrap();
    }

    #[test]
    fn test_sleep_completes() {
        let ctx = PhaseContext::new("settle", 2);
        assert!(ctx.sleep(Duration::from_millis(15)).is_ok());
        assert_eq!(ctx.attempt(), 2);
        assert_eq!(ctx.phase_name(), "settle");
    }
}
