//! benchtop -- phase sequencer for hardware test stations.
//!
//! A test is an ordered queue of phases. Each attempt runs on its own thread
//! under a deadline, and its outcome decides whether the queue advances,
//! repeats the phase, or halts.

pub mod config;
pub mod executor;
pub mod phase;
pub mod plan;
pub mod record;
pub mod report;

use anyhow::Result;
use chrono::Utc;
use tracing::{info, warn};

use crate::config::BenchtopConfig;
use crate::executor::PhaseExecutor;
use crate::plan::TestPlan;
use crate::record::TestState;
use crate::report::{RunReport, RunStatus};

/// Run every phase of `plan` and summarise the run.
///
/// Ctrl-C kills the running phase and keeps any later phase from starting;
/// the run then ends with an aborted status.
pub async fn run_plan(plan: &TestPlan, config: &BenchtopConfig) -> Result<RunReport> {
    let started_at = Utc::now();
    let state = TestState::new(plan.to_phases());
    let mut executor = PhaseExecutor::new(state, &config.executor);

    let stop = executor.stop_handle();
    let signal_task = tokio::spawn(async move {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for interrupt");
                break;
            }
            warn!("interrupt received, aborting test run");
            stop.abort();
        }
    });

    info!(plan = %plan.name, phases = plan.phases.len(), "starting test run");
    let mut outcomes = executor.execute_phases();
    let mut last = None;
    while let Some(outcome) = outcomes.next().await {
        last = Some(outcome);
    }
    signal_task.abort();

    let mut report =
        RunReport::new(&plan.name, started_at, last.as_ref(), executor.test_state());
    if executor.is_aborted() {
        report.status = RunStatus::Aborted;
    }
    info!(plan = %plan.name, status = %report.status, "test run finished");
    Ok(report)
}
