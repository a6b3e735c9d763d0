#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

// Fibers, races, timeouts and interruption
//
// Timing-sensitive tests run on the system clock with tokio's paused time,
// so sleeps complete in virtual time in deadline order.

use std::time::Duration;

use assert_matches::assert_matches;
use weft_effects::testing::{EventLog, TestRuntime};
use weft_effects::{DefectKind, Effect, Interruptor, Outcome, RunOptions, Runtime};

#[derive(Debug, Clone, PartialEq)]
enum JobError {
    TimedOut,
    Failed(&'static str),
}

fn after(delay: Duration, value: u32) -> Effect<u32, JobError> {
    Effect::sleep(delay).map(move |()| value)
}

// ============================================================================
// Fork and join
// ============================================================================

#[tokio::test]
async fn test_fork_then_join_returns_child_outcome() {
    let harness = TestRuntime::new();
    let child: Effect<u32, JobError> = Effect::succeed(41).map(|n| n + 1);
    let effect = child.fork().flat_map(|fiber| fiber.join());
    assert_eq!(harness.runtime.run(effect).await, Outcome::Success(42));

    let failing: Effect<u32, JobError> = Effect::fail(JobError::Failed("child"));
    let effect = failing.fork().flat_map(|fiber| fiber.join());
    assert_eq!(
        harness.runtime.run(effect).await,
        Outcome::Failure(JobError::Failed("child"))
    );
}

#[tokio::test]
async fn test_second_join_is_an_invariant_defect() {
    let harness = TestRuntime::new();
    let effect = Effect::<u32, JobError>::succeed(1)
        .fork()
        .flat_map(|fiber| fiber.join().then(fiber.join()));
    assert_matches!(
        harness.runtime.run(effect).await,
        Outcome::Defect(defect) if defect.kind() == &DefectKind::Invariant
    );
}

#[tokio::test(start_paused = true)]
async fn test_forked_fibers_run_concurrently() {
    let runtime = Runtime::builder().build();
    let started = tokio::time::Instant::now();
    let effect = after(Duration::from_secs(1), 1)
        .fork()
        .zip(after(Duration::from_secs(1), 2).fork())
        .flat_map(|(a, b)| a.join().zip(b.join()))
        .map(|(a, b)| a + b);
    assert_eq!(runtime.run(effect).await, Outcome::Success(3));
    assert!(started.elapsed() < Duration::from_millis(1500));
}

#[tokio::test(start_paused = true)]
async fn test_unjoined_children_are_interrupted_at_run_end() {
    let runtime = Runtime::builder().build();
    let log = EventLog::new();
    let child: Effect<(), JobError> = Effect::sleep(Duration::from_secs(3600))
        .then(log.effect("child finished"))
        .ensuring(log.effect("child cleaned up"));
    let effect = child
        .fork()
        .flat_map(|_| Effect::sleep(Duration::from_millis(10)))
        .map(|()| 7);

    assert_eq!(runtime.run(effect).await, Outcome::Success(7));
    assert_eq!(log.events(), vec!["child cleaned up"]);
}

#[tokio::test(start_paused = true)]
async fn test_fiber_interrupt_waits_for_unwinding() {
    let runtime = Runtime::builder().build();
    let log = EventLog::new();
    let child: Effect<(), JobError> = Effect::sleep(Duration::from_secs(3600))
        .ensuring(log.effect("child cleaned up"));
    let probe = log.clone();
    let effect = child.fork().flat_map(move |fiber| {
        let probe = probe.clone();
        Effect::sleep(Duration::from_millis(10))
            .then(fiber.interrupt())
            .map(move |()| probe.count("child cleaned up"))
    });
    assert_eq!(runtime.run(effect).await, Outcome::Success(1));
}

// ============================================================================
// Race and timeout
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_race_keeps_first_and_interrupts_loser() {
    let runtime = Runtime::builder().build();
    let log = EventLog::new();
    let fast = after(Duration::from_millis(10), 1);
    let slow = after(Duration::from_secs(5), 2).ensuring(log.effect("slow finalized"));

    let report = runtime.run_with(fast.race(slow), RunOptions::new()).await;
    assert_eq!(report.outcome, Outcome::Success(1));
    assert_eq!(log.events(), vec!["slow finalized"]);
}

#[tokio::test(start_paused = true)]
async fn test_race_commits_to_first_failure() {
    let runtime = Runtime::builder().build();
    let failing =
        Effect::sleep(Duration::from_millis(5)).then(Effect::fail(JobError::Failed("left")));
    let effect = failing.race(after(Duration::from_secs(1), 2));
    assert_eq!(
        runtime.run(effect).await,
        Outcome::Failure(JobError::Failed("left"))
    );
}

#[tokio::test(start_paused = true)]
async fn test_timeout_fails_with_the_given_error() {
    let runtime = Runtime::builder().build();
    let effect = after(Duration::from_secs(30), 1)
        .timeout(Duration::from_millis(100), || JobError::TimedOut);
    assert_eq!(runtime.run(effect).await, Outcome::Failure(JobError::TimedOut));

    let quick = after(Duration::from_millis(10), 1)
        .timeout(Duration::from_millis(100), || JobError::TimedOut);
    assert_eq!(runtime.run(quick).await, Outcome::Success(1));
}

#[tokio::test(start_paused = true)]
async fn test_repeat_delays_are_interruptible() {
    let runtime = Runtime::builder().build();
    let effect = Effect::<u32, JobError>::fail(JobError::Failed("flaky"))
        .repeat(weft_effects::Schedule::fixed(Duration::from_secs(60)));
    let report = runtime
        .run_with(effect, RunOptions::new().with_deadline(Duration::from_secs(1)))
        .await;
    assert_matches!(report.outcome, Outcome::Interrupted);
}

// Immediate retries must still yield, or the watchdog never gets polled on a
// current-thread runtime.
#[tokio::test]
async fn test_unbounded_immediate_repeat_yields_to_deadline() {
    let runtime = Runtime::builder().build();
    let deadline = RunOptions::new().with_deadline(Duration::from_millis(50));

    let failing = Effect::<u32, JobError>::fail(JobError::Failed("down"))
        .repeat(weft_effects::Schedule::immediate());
    let report = runtime.run_with(failing, deadline.clone()).await;
    assert_matches!(report.outcome, Outcome::Interrupted);

    let napping = Effect::<(), JobError>::sleep(Duration::ZERO)
        .then(Effect::<u32, JobError>::fail(JobError::Failed("down")))
        .repeat(weft_effects::Schedule::immediate());
    let report = runtime.run_with(napping, deadline).await;
    assert_matches!(report.outcome, Outcome::Interrupted);
}

// ============================================================================
// Interruption
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_external_interruption() {
    let runtime = Runtime::builder().build();
    let interruptor = Interruptor::new();
    let trigger = interruptor.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.interrupt();
    });
    let report = runtime
        .run_with(
            after(Duration::from_secs(10), 1),
            RunOptions::new().with_interruptor(interruptor),
        )
        .await;
    assert_matches!(report.outcome, Outcome::Interrupted);
}

#[tokio::test]
async fn test_self_interrupt_runs_finalizers() {
    let harness = TestRuntime::new();
    let log = EventLog::new();
    let effect = Effect::<u32, JobError>::interrupt()
        .map(|n| n + 1)
        .ensuring(log.effect("finalized"));
    assert_matches!(harness.runtime.run(effect).await, Outcome::Interrupted);
    assert_eq!(log.events(), vec!["finalized"]);
}

#[tokio::test]
async fn test_interruption_is_not_catchable() {
    let harness = TestRuntime::new();
    let effect = Effect::<u32, JobError>::interrupt()
        .catch_all(|_| Effect::<u32, JobError>::succeed(0));
    assert_matches!(harness.runtime.run(effect).await, Outcome::Interrupted);
}
