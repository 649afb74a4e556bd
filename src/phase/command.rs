//! Phases backed by external commands.
//!
//! Test stations usually drive hardware through vendor CLIs (power supplies,
//! flashers, fixture controllers). A command phase spawns the tool, waits for
//! it while watching the attempt's cancellation token, and kills it if the
//! attempt is killed. The child is registered in the attempt's resource scope
//! so it is reaped however the attempt ends.
//!
//! A command reports its directive by printing a line `result: <value>` to
//! stdout; the last such line wins. No line means CONTINUE. A non-zero exit
//! status is an error.

use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use crate::executor::{ExecutorError, PhaseResult};
use crate::phase::PhaseContext;
use crate::plan::PhaseSpec;

/// How often a running command is checked for exit and cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Prefix of the stdout line carrying the phase directive.
pub const RESULT_PREFIX: &str = "result:";

#[derive(Debug, Clone)]
pub struct CommandPhase {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    workdir: Option<PathBuf>,
}

impl CommandPhase {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: BTreeMap::new(),
            workdir: None,
        }
    }

    pub fn from_spec(spec: &PhaseSpec) -> Self {
        Self {
            program: spec.command.clone(),
            args: spec.args.clone(),
            env: spec.env.clone(),
            workdir: spec.workdir.clone(),
        }
    }

    /// Run the command to completion (or until the attempt is killed).
    pub fn run(&self, ctx: &PhaseContext) -> Result<Option<PhaseResult>> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.program))?;
        info!(program = %self.program, pid = child.id(), "command started");

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let child = Arc::new(Mutex::new(child));
        {
            let child = Arc::clone(&child);
            let label = format!("process {}", self.program);
            ctx.resources().defer(label, move || reap(&child));
        }

        let Some(status) = wait_cancellable(&child, ctx)? else {
            return Err(ExecutorError::ForcedTermination {
                phase: ctx.phase_name().to_string(),
            }
            .into());
        };

        let stdout = collect(stdout)?;
        let stderr = collect(stderr)?;
        for line in stderr.lines().filter(|l| !l.trim().is_empty()) {
            debug!(program = %self.program, "stderr: {line}");
        }

        check_status(&self.program, status, &stderr)?;
        Ok(parse_directive(&stdout)?)
    }
}

/// Guard that runs a command and reports whether it exited successfully.
#[derive(Debug, Clone)]
pub struct CommandGuard {
    argv: Vec<String>,
}

impl CommandGuard {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }

    /// Run the guard command. Anything but a clean exit, including being
    /// cancelled, counts as `false`.
    pub fn check(&self, ctx: &PhaseContext) -> bool {
        let Some((program, args)) = self.argv.split_first() else {
            return false;
        };
        let phase = ctx.phase_name();
        let spawned = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();
        let child = match spawned {
            Ok(child) => Mutex::new(child),
            Err(e) => {
                warn!(%phase, guard = %program, error = %e, "run_if command failed to start");
                return false;
            }
        };

        match wait_cancellable(&child, ctx) {
            Ok(Some(status)) => {
                debug!(%phase, guard = %program, %status, "run_if evaluated");
                status.success()
            }
            Ok(None) => {
                debug!(%phase, guard = %program, "run_if cancelled");
                false
            }
            Err(e) => {
                warn!(%phase, guard = %program, error = %e, "run_if command failed");
                if let Err(e) = kill(&child) {
                    warn!(%phase, guard = %program, error = %e, "failed to kill run_if command");
                }
                false
            }
        }
    }
}

/// Find the directive in a command's stdout.
pub fn parse_directive(stdout: &str) -> Result<Option<PhaseResult>, ExecutorError> {
    stdout
        .lines()
        .rev()
        .find_map(|line| line.trim().strip_prefix(RESULT_PREFIX))
        .map(|value| value.parse::<PhaseResult>())
        .transpose()
}

fn check_status(program: &str, status: ExitStatus, stderr: &str) -> Result<()> {
    if status.success() {
        return Ok(());
    }
    let tail = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
    if tail.is_empty() {
        bail!("{program} exited with {status}");
    }
    bail!("{program} exited with {status}: {}", tail.trim());
}

/// Wait for `child` to exit, killing it if the attempt is cancelled first.
/// `None` means it was killed.
fn wait_cancellable(child: &Mutex<Child>, ctx: &PhaseContext) -> Result<Option<ExitStatus>> {
    loop {
        if ctx.is_cancelled() {
            kill(child)?;
            return Ok(None);
        }
        if let Some(status) = lock(child).try_wait()? {
            return Ok(Some(status));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn lock(child: &Mutex<Child>) -> MutexGuard<'_, Child> {
    child.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn kill(child: &Mutex<Child>) -> Result<()> {
    let mut child = lock(child);
    if child.try_wait()?.is_none() {
        warn!(pid = child.id(), "killing command");
        child.kill()?;
        child.wait()?;
    }
    Ok(())
}

fn reap(child: &Mutex<Child>) -> Result<()> {
    kill(child).context("failed to reap child process")
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn collect(reader: Option<JoinHandle<String>>) -> Result<String> {
    match reader {
        Some(handle) => handle
            .join()
            .map_err(|_| anyhow::anyhow!("output reader thread panicked")),
        None => Ok(String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_directive_absent() {
        assert_eq!(parse_directive("").unwrap(), None);
        assert_eq!(parse_directive("flashing...\ndone\n").unwrap(), None);
    }

    #[test]
    fn test_parse_directive_last_wins() {
        let out = "result: repeat\nretrying\nresult: FAIL\ntrailing noise\n";
        assert_eq!(parse_directive(out).unwrap(), Some(PhaseResult::Fail));
    }

    #[test]
    fn test_parse_directive_invalid() {
        let err = parse_directive("result: 42\n").unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidOutcome(_)));
        let err = parse_directive("result: timeout\n").unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidOutcome(_)));
    }

    #[test]
    fn test_guard_without_argv_is_false() {
        let ctx = PhaseContext::new("g", 1);
        assert!(!CommandGuard::new(vec![]).check(&ctx));
    }

    #[test]
    fn test_guard_missing_program_is_false() {
        let ctx = PhaseContext::new("g", 1);
        let guard = CommandGuard::new(vec!["/nonexistent/benchtop-guard".into()]);
        assert!(!guard.check(&ctx));
    }

    #[test]
    fn test_missing_program_is_error() {
        let ctx = PhaseContext::new("p", 1);
        let err = CommandPhase::new("/nonexistent/benchtop-tool", vec![])
            .run(&ctx)
            .unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use std::time::Instant;

        fn sh(script: &str) -> CommandPhase {
            CommandPhase::new("sh", vec!["-c".into(), script.into()])
        }

        #[test]
        fn test_success_without_directive() {
            let ctx = PhaseContext::new("p", 1);
            assert_eq!(sh("echo hello").run(&ctx).unwrap(), None);
            assert_eq!(ctx.resources().close_all(), 1);
        }

        #[test]
        fn test_success_with_directive() {
            let ctx = PhaseContext::new("p", 1);
            let result = sh("echo working; echo 'result: repeat'").run(&ctx).unwrap();
            assert_eq!(result, Some(PhaseResult::Repeat));
        }

        #[test]
        fn test_nonzero_exit_is_error() {
            let ctx = PhaseContext::new("p", 1);
            let err = sh("echo 'rail undervoltage' >&2; exit 3").run(&ctx).unwrap_err();
            let msg = err.to_string();
            assert!(msg.contains("rail undervoltage"), "{msg}");
        }

        #[test]
        fn test_env_and_guard() {
            let ctx = PhaseContext::new("p", 1);
            let mut phase = sh("test \"$BOARD\" = rev-b");
            phase.env.insert("BOARD".into(), "rev-b".into());
            assert_eq!(phase.run(&ctx).unwrap(), None);

            assert!(CommandGuard::new(vec!["true".into()]).check(&ctx));
            assert!(!CommandGuard::new(vec!["false".into()]).check(&ctx));
        }

        #[test]
        fn test_cancelled_guard_is_false() {
            let ctx = PhaseContext::new("gated", 1);
            let token = ctx.cancellation().clone();
            let canceller = thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                token.cancel();
            });
            let started = Instant::now();
            let guard = CommandGuard::new(vec!["sleep".into(), "30".into()]);
            assert!(!guard.check(&ctx));
            assert!(started.elapsed() < Duration::from_secs(10));
            canceller.join().unwrap();
        }

        #[test]
        fn test_cancellation_kills_child() {
            let ctx = PhaseContext::new("soak", 1);
            let token = ctx.cancellation().clone();
            let canceller = thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                token.cancel();
            });
            let started = Instant::now();
            let err = sh("sleep 30").run(&ctx).unwrap_err();
            assert!(started.elapsed() < Duration::from_secs(10));
            assert!(matches!(
                err.downcast_ref::<ExecutorError>(),
                Some(ExecutorError::ForcedTermination { .. })
            ));
            canceller.join().unwrap();
        }
    }
}
