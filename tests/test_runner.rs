//! Runner and completion-context integration tests
//!
//! Drives `Runner::invoke` directly against hand-built contexts to check
//! conservation, barrier accounting and failure classification.

use converge::{
    from_future, operation_fn, try_operation_fn, BoxedOperation, CancellationSignal,
    CompletionContext, ContinuationPolicy, CoordinatorConfig, ConvergeError, FailureKind,
    OperationError, Runner, RunnerHooks,
};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn jitter() -> Duration {
    Duration::from_millis(fastrand::u64(0..15))
}

fn value_op(value: i64) -> BoxedOperation<i64> {
    operation_fn(move |_cancel| async move {
        tokio::time::sleep(jitter()).await;
        anyhow::Ok(value)
    })
}

fn failing_op(message: &'static str) -> BoxedOperation<i64> {
    operation_fn(move |_cancel| async move {
        tokio::time::sleep(jitter()).await;
        Err::<i64, _>(anyhow::anyhow!(message))
    })
}

fn fresh_context() -> Arc<CompletionContext<i64>> {
    Arc::new(CompletionContext::new(CancellationSignal::new()))
}

/// Mixed success/failure/launch-error operations for the given seed
fn mixed_operations(seed: u64, count: usize) -> (Vec<BoxedOperation<i64>>, usize) {
    fastrand::seed(seed);
    let mut successes = 0;
    let operations = (0..count)
        .map(|i| match fastrand::u8(0..3) {
            0 => {
                successes += 1;
                value_op(i as i64)
            }
            1 => failing_op("boom"),
            _ => try_operation_fn(|_cancel| {
                if true {
                    anyhow::bail!("refused to start");
                }
                Ok(async { anyhow::Ok(0i64) })
            }),
        })
        .collect();
    (operations, successes)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_conservation_blocking() {
    init_tracing();
    for seed in 0..8 {
        let (operations, successes) = mixed_operations(seed, 12);
        let context = fresh_context();
        let outcome = Runner::new(CoordinatorConfig::default())
            .invoke(context.clone(), true, operations)
            .await
            .unwrap();

        assert!(outcome.settled);
        assert_eq!(outcome.results.len(), successes);
        assert_eq!(outcome.results.len() + outcome.failure_count(), 12);
        assert_eq!(context.barrier_signals(), 12);
        assert_eq!(context.remaining(), 0);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_conservation_non_blocking() {
    init_tracing();
    let (operations, successes) = mixed_operations(42, 20);
    let context = fresh_context();
    let outcome = Runner::new(CoordinatorConfig::default())
        .invoke(context.clone(), false, operations)
        .await
        .unwrap();
    assert!(context.barrier().is_none());

    let settled = context.wait_settled().await;
    assert_eq!(settled.results.len(), successes);
    assert_eq!(settled.len(), 20);
    assert_eq!(settled.failure_count(), 20 - successes);
    if outcome.settled {
        assert_eq!(outcome.results.len() + outcome.failure_count(), 20);
    }
}

#[tokio::test]
async fn test_barrier_counts_launch_failures() {
    init_tracing();
    let operations: Vec<BoxedOperation<i64>> = vec![
        value_op(1),
        try_operation_fn(|_cancel| -> anyhow::Result<std::future::Ready<anyhow::Result<i64>>> {
            anyhow::bail!("no connection")
        }),
        Box::new(PanickingLaunch),
    ];
    let context = fresh_context();
    let outcome = Runner::new(CoordinatorConfig::default())
        .invoke(context.clone(), true, operations)
        .await
        .unwrap();

    assert_eq!(context.barrier_signals(), 3);
    assert_eq!(outcome.results.as_ref(), &[1]);
    let launch = outcome.failures_of(FailureKind::Launch);
    assert_eq!(launch.len(), 2);
    assert!(launch
        .iter()
        .any(|f| matches!(f.cause().downcast_ref(), Some(OperationError::Panicked { .. }))));
    assert_eq!(outcome.metrics.launch_failures, 2);
    assert_eq!(outcome.metrics.launched, 1);
}

struct PanickingLaunch;

impl converge::Operation<i64> for PanickingLaunch {
    fn launch(
        self: Box<Self>,
        _cancel: CancellationSignal,
    ) -> anyhow::Result<converge::OperationFuture<i64>> {
        panic!("launch exploded")
    }
}

#[tokio::test]
async fn test_operation_panic_is_recorded() {
    init_tracing();
    let operations: Vec<BoxedOperation<i64>> = vec![
        value_op(2),
        operation_fn(|_cancel| async {
            if true {
                panic!("handler bug");
            }
            anyhow::Ok(0i64)
        }),
    ];
    let outcome = Runner::new(CoordinatorConfig::default())
        .invoke(fresh_context(), true, operations)
        .await
        .unwrap();

    assert_eq!(outcome.results.as_ref(), &[2]);
    let failures = outcome.failures.as_deref().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].kind(), FailureKind::Operation);
    assert_eq!(failures[0].operation(), Some(1));
    assert_eq!(
        failures[0].cause().to_string(),
        "operation panicked: handler bug"
    );
}

#[tokio::test]
async fn test_cancellation_mid_run() {
    init_tracing();
    let cancel = CancellationSignal::new();
    let context = Arc::new(CompletionContext::new(cancel.clone()));
    let operations: Vec<BoxedOperation<i64>> = vec![
        value_op(1),
        from_future(async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            anyhow::Ok(2i64)
        }),
        operation_fn(|cancel: CancellationSignal| async move {
            cancel.cancelled().await;
            Err::<i64, _>(OperationError::Cancelled.into())
        }),
    ];

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel_with_reason("shutdown");
    });

    let outcome = Runner::new(CoordinatorConfig::default())
        .invoke(context.clone(), false, operations)
        .await
        .unwrap();
    assert!(!outcome.settled);

    let snapshot = context.wait_settled().await;
    assert_eq!(snapshot.results.as_ref(), &[1]);
    let failures = snapshot.failures.as_deref().unwrap();
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().all(|f| f.is_cancellation()));
    assert_eq!(cancel.reason(), Some("shutdown"));
}

#[tokio::test]
async fn test_transform_hook_results() {
    init_tracing();
    let hooks = RunnerHooks::new().with_transform(|v: i64| match v {
        0 => Ok(None),
        v if v < 0 => anyhow::bail!("negative: {}", v),
        v => Ok(Some(v * 100)),
    });
    let operations = vec![value_op(0), value_op(-3), value_op(2)];
    let outcome = Runner::new(CoordinatorConfig::default())
        .with_hooks(hooks)
        .invoke(fresh_context(), true, operations)
        .await
        .unwrap();

    assert_eq!(outcome.results.as_ref(), &[200]);
    let failures = outcome.failures.as_deref().unwrap();
    assert_eq!(failures.len(), 2);
    assert!(failures
        .iter()
        .any(|f| matches!(f.cause().downcast_ref(), Some(OperationError::MissingResult))));
    assert!(failures
        .iter()
        .any(|f| f.cause().to_string() == "negative: -3"));
}

#[tokio::test]
async fn test_on_all_settled_runs_once() {
    init_tracing();
    let calls = Arc::new(AtomicUsize::new(0));
    let hooks = {
        let calls = calls.clone();
        RunnerHooks::new().with_on_all_settled(move |snapshot| {
            assert_eq!(snapshot.len(), 4);
            assert_eq!(snapshot.failure_count(), 1);
            calls.fetch_add(1, Ordering::SeqCst);
        })
    };
    let operations = vec![value_op(1), value_op(2), failing_op("x"), value_op(3)];
    let context = fresh_context();
    Runner::new(CoordinatorConfig::default())
        .with_hooks(hooks)
        .invoke(context.clone(), true, operations)
        .await
        .unwrap();

    context.wait_settled().await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_inline_continuations() {
    init_tracing();
    let config = CoordinatorConfig::builder()
        .continuation(ContinuationPolicy::Inline)
        .build()
        .unwrap();
    let operations = (1..=10).map(value_op).collect();
    let outcome = Runner::new(config)
        .invoke(fresh_context(), true, operations)
        .await
        .unwrap();

    let mut results = outcome.results.to_vec();
    results.sort_unstable();
    assert_eq!(results, (1..=10).collect::<Vec<_>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_max_concurrency_is_respected() {
    init_tracing();
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let operations: Vec<BoxedOperation<i64>> = (0..12)
        .map(|i| {
            let active = active.clone();
            let peak = peak.clone();
            operation_fn(move |_cancel| async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                anyhow::Ok(i)
            })
        })
        .collect();

    let config = CoordinatorConfig::builder()
        .max_concurrency(3)
        .build()
        .unwrap();
    let outcome = Runner::new(config)
        .invoke(fresh_context(), true, operations)
        .await
        .unwrap();

    assert_eq!(outcome.results.len(), 12);
    assert!(peak.load(Ordering::SeqCst) <= 3);
}

#[tokio::test]
async fn test_context_is_single_use() {
    init_tracing();
    let context = fresh_context();
    let runner = Runner::new(CoordinatorConfig::default());
    runner
        .invoke(context.clone(), true, vec![value_op(1)])
        .await
        .unwrap();

    let err = runner
        .invoke(context.clone(), true, vec![value_op(2)])
        .await
        .unwrap_err();
    assert!(matches!(err, ConvergeError::AlreadyInitialized { .. }));
    assert_eq!(context.snapshot().results.as_ref(), &[1]);
}
