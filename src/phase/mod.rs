//! Test phases: named units of work plus the options that govern how the
//! executor runs them.

pub mod command;
pub mod context;

use std::fmt;
use std::panic::Location;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::executor::outcome::IntoPhaseResult;
use crate::executor::PhaseResult;

pub use self::context::{PhaseContext, ResourceScope};

/// Type-erased phase body.
pub type PhaseFn = Arc<dyn Fn(&PhaseContext) -> anyhow::Result<Option<PhaseResult>> + Send + Sync>;

/// Guard evaluated before each attempt; `false` skips the phase.
pub type GuardFn = Arc<dyn Fn(&PhaseContext) -> bool + Send + Sync>;

/// Where a phase was defined. Only used for records and logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeInfo {
    pub name: String,
    pub file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
}

impl CodeInfo {
    #[track_caller]
    pub fn here(name: &str) -> Self {
        let loc = Location::caller();
        CodeInfo {
            name: name.to_string(),
            file: loc.file().to_string(),
            line: Some(loc.line()),
        }
    }
}

impl fmt::Display for CodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{} ({}:{})", self.name, self.file, line),
            None => write!(f, "{} ({})", self.name, self.file),
        }
    }
}

/// Execution options attached to a phase.
#[derive(Clone, Default)]
pub struct PhaseOptions {
    pub run_if: Option<GuardFn>,
    /// Per-phase deadline. `None` or zero falls back to the executor default.
    pub timeout: Option<Duration>,
}

impl fmt::Debug for PhaseOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseOptions")
            .field("run_if", &self.run_if.as_ref().map(|_| "<guard>"))
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// A single named unit of test work.
///
/// Cloning is cheap: the work and guard closures are shared.
#[derive(Clone)]
pub struct Phase {
    name: String,
    work: PhaseFn,
    options: PhaseOptions,
    code_info: CodeInfo,
}

impl Phase {
    /// Build a phase from a closure. The work may return `()`, a
    /// [`PhaseResult`], or `Option<PhaseResult>`; nothing means CONTINUE.
    #[track_caller]
    pub fn new<F, R>(name: impl Into<String>, work: F) -> Self
    where
        F: Fn(&PhaseContext) -> anyhow::Result<R> + Send + Sync + 'static,
        R: IntoPhaseResult,
    {
        let name = name.into();
        let code_info = CodeInfo::here(&name);
        Phase {
            name,
            work: Arc::new(move |ctx: &PhaseContext| {
                work(ctx).map(IntoPhaseResult::into_phase_result)
            }),
            options: PhaseOptions::default(),
            code_info,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = Some(timeout);
        self
    }

    pub fn with_run_if<G>(mut self, guard: G) -> Self
    where
        G: Fn(&PhaseContext) -> bool + Send + Sync + 'static,
    {
        self.options.run_if = Some(Arc::new(guard));
        self
    }

    pub fn with_code_info(mut self, code_info: CodeInfo) -> Self {
        self.code_info = code_info;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &PhaseOptions {
        &self.options
    }

    pub fn code_info(&self) -> &CodeInfo {
        &self.code_info
    }

    /// Evaluate the guard. Phases without one always run.
    pub fn should_run(&self, ctx: &PhaseContext) -> bool {
        self.options.run_if.as_ref().map_or(true, |guard| guard(ctx))
    }

    /// Call the work on the current thread.
    pub fn run(&self, ctx: &PhaseContext) -> anyhow::Result<Option<PhaseResult>> {
        (self.work)(ctx)
    }
}

impl fmt::Debug for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Phase")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("code_info", &self.code_info)
            .finish_non_exhaustive()
    }
}
