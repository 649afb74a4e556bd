//! End-to-end sequencing behaviour through the public executor API.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use benchtop::executor::{
    ExecutorError, ExecutorState, OutcomeKind, PhaseExecutor, PhaseOutcome, PhaseResult,
};
use benchtop::phase::Phase;
use benchtop::record::TestState;

fn executor(phases: Vec<Phase>) -> PhaseExecutor {
    PhaseExecutor::with_default_timeout(TestState::new(phases), Duration::from_secs(5))
}

fn kinds(outcomes: &[PhaseOutcome]) -> Vec<OutcomeKind> {
    outcomes.iter().map(PhaseOutcome::kind).collect()
}

/// Block until `flag` is set, ignoring cancellation.
fn wait_for(flag: &AtomicBool) {
    while !flag.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(5));
    }
}

#[tokio::test]
async fn test_repeat_reruns_head_then_continues() {
    let b_calls = Arc::new(AtomicU32::new(0));
    let calls = Arc::clone(&b_calls);
    let mut ex = executor(vec![
        Phase::new("a", |_ctx| Ok(PhaseResult::Continue)),
        Phase::new("b", move |_ctx| {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(PhaseResult::Repeat)
            } else {
                Ok(PhaseResult::Continue)
            }
        }),
        Phase::new("c", |_ctx| Ok(())),
    ]);

    let outcomes = ex.execute_phases().collect_all().await;
    let results: Vec<_> = outcomes.iter().map(PhaseOutcome::result).collect();
    assert_eq!(
        results,
        vec![
            Some(PhaseResult::Continue),
            Some(PhaseResult::Repeat),
            Some(PhaseResult::Continue),
            Some(PhaseResult::Continue),
        ]
    );
    assert_eq!(b_calls.load(Ordering::SeqCst), 2);
    assert_eq!(ex.state(), ExecutorState::Empty);
    assert_eq!(ex.test_state().pending_len(), 0);

    let names: Vec<&str> = ex.test_state().records().iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b", "b", "c"]);
}

#[tokio::test]
async fn test_guard_false_skips_without_outcome() {
    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let mut ex = executor(vec![
        Phase::new("optional", move |_ctx| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })
        .with_run_if(|_ctx| false),
        Phase::new("required", |_ctx| Ok(())),
    ]);

    let outcomes = ex.execute_phases().collect_all().await;
    assert_eq!(outcomes.len(), 1);
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(ex.state(), ExecutorState::Empty);

    let state = ex.test_state();
    assert_eq!(state.skipped().len(), 1);
    assert_eq!(state.skipped()[0].name, "optional");
    assert_eq!(state.records().len(), 1);
    assert_eq!(state.records()[0].name, "required");
}

#[tokio::test]
async fn test_stuck_phase_times_out() {
    let release = Arc::new(AtomicBool::new(false));
    let gate = Arc::clone(&release);
    let mut ex = executor(vec![
        Phase::new("hang", move |_ctx| {
            wait_for(&gate);
            Ok(())
        })
        .with_timeout(Duration::from_millis(200)),
        Phase::new("after", |_ctx| Ok(())),
    ]);

    let started = Instant::now();
    let outcomes = ex.execute_phases().collect_all().await;
    let elapsed = started.elapsed();
    release.store(true, Ordering::SeqCst);

    assert_eq!(kinds(&outcomes), vec![OutcomeKind::Timeout]);
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");
    assert_eq!(ex.state(), ExecutorState::Draining);
    assert_eq!(ex.test_state().pending_len(), 2);
    assert_eq!(ex.test_state().records()[0].timeout_ms, 200);
}

#[tokio::test]
async fn test_error_halts_run() {
    let mut ex = executor(vec![
        Phase::new("boom", |_ctx| -> anyhow::Result<()> {
            anyhow::bail!("fixture not found")
        }),
        Phase::new("never", |_ctx| Ok(())),
    ]);

    let outcomes = ex.execute_phases().collect_all().await;
    assert_eq!(kinds(&outcomes), vec![OutcomeKind::Error]);
    let failure = outcomes[0].failure().unwrap();
    assert!(failure.to_string().contains("fixture not found"));
    assert_eq!(ex.state(), ExecutorState::Draining);
    assert!(ex.test_state().records().iter().all(|r| r.name == "boom"));
}

#[tokio::test]
async fn test_panic_becomes_error_outcome() {
    let mut ex = executor(vec![Phase::new("panics", |_ctx| -> anyhow::Result<()> {
        panic!("sense wire snapped")
    })]);
    let outcomes = ex.execute_phases().collect_all().await;
    assert_eq!(kinds(&outcomes), vec![OutcomeKind::Error]);
    assert!(outcomes[0].to_string().contains("sense wire snapped"));
}

#[tokio::test]
async fn test_concurrent_stop_terminates_once() {
    let started = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&started);
    let mut ex = executor(vec![
        Phase::new("soak", move |ctx| -> anyhow::Result<()> {
            flag.store(true, Ordering::SeqCst);
            loop {
                ctx.sleep(Duration::from_millis(50))?;
            }
        }),
        Phase::new("never", |_ctx| Ok(())),
    ]);

    let stop = ex.stop_handle();
    let kills = Arc::new(AtomicUsize::new(0));
    let stoppers: Vec<_> = (0..8)
        .map(|_| {
            let stop = stop.clone();
            let started = Arc::clone(&started);
            let kills = Arc::clone(&kills);
            thread::spawn(move || {
                wait_for(&started);
                if stop.stop() {
                    kills.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    let outcomes = ex.execute_phases().collect_all().await;
    for stopper in stoppers {
        stopper.join().unwrap();
    }

    assert_eq!(kills.load(Ordering::SeqCst), 1);
    assert_eq!(kinds(&outcomes), vec![OutcomeKind::Terminated]);
    let failure = outcomes[0].failure().unwrap();
    assert!(matches!(
        failure.downcast_ref::<ExecutorError>(),
        Some(ExecutorError::ForcedTermination { .. })
    ));
    assert_eq!(ex.state(), ExecutorState::Draining);
    assert_eq!(ex.test_state().records().len(), 1);
}

#[tokio::test]
async fn test_stop_without_running_phase_is_noop() {
    let mut ex = executor(vec![
        Phase::new("a", |_ctx| Ok(())),
        Phase::new("b", |_ctx| Ok(())),
    ]);
    assert!(!ex.stop());
    assert_eq!(ex.state(), ExecutorState::Idle);

    let outcomes = ex.execute_phases().collect_all().await;
    assert_eq!(kinds(&outcomes), vec![OutcomeKind::Result, OutcomeKind::Result]);

    assert!(!ex.stop());
    assert_eq!(ex.state(), ExecutorState::Empty);
    assert_eq!(ex.test_state().records().len(), 2);
}

#[tokio::test]
async fn test_outcomes_are_lazy() {
    let ran = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&ran);
    let mut ex = executor(vec![
        Phase::new("first", move |_ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }),
        Phase::new("second", |_ctx| Ok(())),
    ]);

    let mut outcomes = ex.execute_phases();
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert!(outcomes.next().await.is_some());
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    drop(outcomes);
    assert_eq!(ex.state(), ExecutorState::Idle);
    assert_eq!(ex.test_state().pending_len(), 1);
}

#[tokio::test]
async fn test_hung_guard_times_out_without_running_phase() {
    let release = Arc::new(AtomicBool::new(false));
    let ran = Arc::new(AtomicBool::new(false));
    let (gate, flag) = (Arc::clone(&release), Arc::clone(&ran));
    let mut ex = PhaseExecutor::with_default_timeout(
        TestState::new(vec![
            Phase::new("flash", move |_ctx| {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .with_run_if(move |_ctx| {
                wait_for(&gate);
                true
            }),
            Phase::new("after", |_ctx| Ok(())),
        ]),
        Duration::from_millis(200),
    );

    let started = Instant::now();
    let outcomes = ex.execute_phases().collect_all().await;
    let elapsed = started.elapsed();
    release.store(true, Ordering::SeqCst);

    assert_eq!(kinds(&outcomes), vec![OutcomeKind::Timeout]);
    assert!(elapsed < Duration::from_secs(3), "took {elapsed:?}");
    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(ex.state(), ExecutorState::Draining);
    assert_eq!(ex.test_state().records().len(), 1);
    assert!(ex.test_state().skipped().is_empty());
}

#[tokio::test]
async fn test_stop_during_guard_terminates() {
    let guarding = Arc::new(AtomicBool::new(false));
    let ran = Arc::new(AtomicBool::new(false));
    let (flag, ran_flag) = (Arc::clone(&guarding), Arc::clone(&ran));
    let mut ex = executor(vec![Phase::new("flash", move |_ctx| {
        ran_flag.store(true, Ordering::SeqCst);
        Ok(())
    })
    .with_run_if(move |ctx| {
        flag.store(true, Ordering::SeqCst);
        ctx.sleep(Duration::from_secs(30)).is_ok()
    })]);

    let stop = ex.stop_handle();
    let waiting = Arc::clone(&guarding);
    let stopper = thread::spawn(move || {
        wait_for(&waiting);
        stop.stop()
    });

    let started = Instant::now();
    let outcomes = ex.execute_phases().collect_all().await;
    assert!(stopper.join().unwrap());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(kinds(&outcomes), vec![OutcomeKind::Terminated]);
    assert!(!ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_abort_between_phases_stops_run() {
    let second_ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&second_ran);
    let mut ex = executor(vec![
        Phase::new("first", |_ctx| Ok(())),
        Phase::new("second", move |_ctx| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        }),
    ]);
    let abort = ex.stop_handle();

    let mut outcomes = ex.execute_phases();
    assert!(outcomes.next().await.is_some());
    // Nothing is running now, so there is nothing to kill.
    assert!(!abort.abort());
    assert!(outcomes.next().await.is_none());
    drop(outcomes);

    assert!(!second_ran.load(Ordering::SeqCst));
    assert!(ex.is_aborted());
    assert_eq!(ex.state(), ExecutorState::Draining);
    assert_eq!(ex.test_state().pending_len(), 1);
}
