//! Integration tests for the foreman and its worker pool.
//!
//! Runs entirely against the in-memory queue, no services needed:
//!
//! ```bash
//! cargo test -p postroom-engine --test integration
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::task::TaskTracker;

use postroom_common::types::OrgId;
use postroom_engine::{Foreman, ForemanConfig, TaskError, TaskRegistry, handler_fn};
use postroom_queue::memory::MemoryQueue;
use postroom_queue::{QueueError, Task, TaskQueue};

// ============================================================
// Shared helpers
// ============================================================

const LANE: &str = "handler";

/// Wraps a [`MemoryQueue`], counting completions and optionally injecting
/// pop failures or suppressing wake notifications.
#[derive(Default)]
struct RecordingQueue {
    inner: MemoryQueue,
    pops: AtomicUsize,
    completions: AtomicUsize,
    failing_pops: AtomicUsize,
    wake_disabled: AtomicBool,
}

impl RecordingQueue {
    fn completions(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    fn pops(&self) -> usize {
        self.pops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskQueue for RecordingQueue {
    async fn push_task(&self, lane: &str, task: &Task) -> Result<(), QueueError> {
        self.inner.push_task(lane, task).await
    }

    async fn pop_next_task(&self, lane: &str) -> Result<Option<Task>, QueueError> {
        self.pops.fetch_add(1, Ordering::SeqCst);
        let should_fail = self
            .failing_pops
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(QueueError::Closed("injected pop failure".into()));
        }
        self.inner.pop_next_task(lane).await
    }

    async fn mark_task_complete(&self, lane: &str, org_id: OrgId) -> Result<(), QueueError> {
        self.completions.fetch_add(1, Ordering::SeqCst);
        self.inner.mark_task_complete(lane, org_id).await
    }

    async fn wait_for_push(&self, lane: &str) -> Result<(), QueueError> {
        if self.wake_disabled.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.inner.wait_for_push(lane).await
    }
}

fn task(task_type: &str, org: i64) -> Task {
    Task::new(task_type, OrgId(org), &serde_json::json!({"org": org})).unwrap()
}

/// Poll `check` until it holds or `timeout` elapses.
async fn wait_until(timeout: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

fn counting_registry(runs: Arc<AtomicUsize>) -> TaskRegistry {
    TaskRegistry::builder()
        .register(
            "count",
            handler_fn(move |_: Task| {
                let runs = runs.clone();
                async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), TaskError>(())
                }
            }),
        )
        .build()
}

// ============================================================
// Tests
// ============================================================

#[tokio::test]
async fn test_every_popped_task_marked_complete_once() {
    let queue = Arc::new(RecordingQueue::default());
    let registry = TaskRegistry::builder()
        .register("ok", handler_fn(|_: Task| async { Ok::<(), TaskError>(()) }))
        .register(
            "err",
            handler_fn(|_: Task| async { Err::<(), _>(TaskError::Failed("nope".into())) }),
        )
        .register(
            "panic",
            handler_fn(|_: Task| async {
                if true {
                    panic!("boom");
                }
                Ok::<(), TaskError>(())
            }),
        )
        .build();

    for (i, task_type) in ["ok", "err", "panic", "unregistered", "ok"]
        .iter()
        .enumerate()
    {
        queue
            .push_task(LANE, &task(task_type, i as i64))
            .await
            .unwrap();
    }

    let tracker = TaskTracker::new();
    let handle = Foreman::new(
        ForemanConfig::new(LANE, 2).with_idle_timeout(Duration::from_millis(50)),
        queue.clone(),
        Arc::new(registry),
    )
    .start(&tracker);

    assert!(wait_until(Duration::from_secs(5), || queue.completions() == 5).await);

    handle.stop();
    tracker.close();
    tokio::time::timeout(Duration::from_secs(5), tracker.wait())
        .await
        .expect("foreman should shut down");

    // nothing left queued or in flight, no double completions
    assert_eq!(queue.completions(), 5);
    assert_eq!(queue.inner.size(LANE), 0);
    for org in 0..5 {
        assert_eq!(queue.inner.in_flight(LANE, OrgId(org)), 0);
    }
}

#[tokio::test]
async fn test_parked_foreman_wakes_on_push() {
    let queue = Arc::new(RecordingQueue::default());
    let runs = Arc::new(AtomicUsize::new(0));

    let tracker = TaskTracker::new();
    // idle timeout far longer than the test, so only the wake can pick the task up
    let handle = Foreman::new(
        ForemanConfig::new(LANE, 1).with_idle_timeout(Duration::from_secs(300)),
        queue.clone(),
        Arc::new(counting_registry(runs.clone())),
    )
    .start(&tracker);

    assert!(wait_until(Duration::from_secs(1), || queue.pops() >= 1).await);
    tokio::time::sleep(Duration::from_millis(20)).await;

    queue.push_task(LANE, &task("count", 1)).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || runs.load(Ordering::SeqCst) == 1).await);

    handle.stop();
    tracker.close();
    tracker.wait().await;
}

#[tokio::test]
async fn test_idle_timeout_recovers_lost_wake() {
    let queue = Arc::new(RecordingQueue::default());
    queue.wake_disabled.store(true, Ordering::SeqCst);
    let runs = Arc::new(AtomicUsize::new(0));

    let tracker = TaskTracker::new();
    let handle = Foreman::new(
        ForemanConfig::new(LANE, 1).with_idle_timeout(Duration::from_millis(50)),
        queue.clone(),
        Arc::new(counting_registry(runs.clone())),
    )
    .start(&tracker);

    assert!(wait_until(Duration::from_secs(1), || queue.pops() >= 1).await);
    queue.push_task(LANE, &task("count", 1)).await.unwrap();

    assert!(wait_until(Duration::from_secs(2), || runs.load(Ordering::SeqCst) == 1).await);

    handle.stop();
    tracker.close();
    tracker.wait().await;
}

#[tokio::test]
async fn test_pop_failure_backs_off_then_retries() {
    let queue = Arc::new(RecordingQueue::default());
    queue.failing_pops.store(2, Ordering::SeqCst);
    queue.push_task(LANE, &task("count", 1)).await.unwrap();
    let runs = Arc::new(AtomicUsize::new(0));

    let tracker = TaskTracker::new();
    let started = Instant::now();
    let handle = Foreman::new(
        ForemanConfig::new(LANE, 1)
            .with_retry_backoff(Duration::from_millis(100))
            .with_idle_timeout(Duration::from_millis(50)),
        queue.clone(),
        Arc::new(counting_registry(runs.clone())),
    )
    .start(&tracker);

    assert!(wait_until(Duration::from_secs(3), || runs.load(Ordering::SeqCst) == 1).await);
    // two failed pops, each followed by a backoff
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert_eq!(queue.completions(), 1);

    handle.stop();
    tracker.close();
    tracker.wait().await;
}

#[tokio::test]
async fn test_concurrency_bounded_by_max_workers() {
    let queue = Arc::new(RecordingQueue::default());
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    let registry = {
        let (current, peak, done) = (current.clone(), peak.clone(), done.clone());
        TaskRegistry::builder()
            .register(
                "slow",
                handler_fn(move |_: Task| {
                    let (current, peak, done) = (current.clone(), peak.clone(), done.clone());
                    async move {
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        current.fetch_sub(1, Ordering::SeqCst);
                        done.fetch_add(1, Ordering::SeqCst);
                        Ok::<(), TaskError>(())
                    }
                }),
            )
            .build()
    };

    for n in 0..12 {
        queue.push_task(LANE, &task("slow", n % 4)).await.unwrap();
    }

    let tracker = TaskTracker::new();
    let handle = Foreman::new(
        ForemanConfig::new(LANE, 3).with_idle_timeout(Duration::from_millis(50)),
        queue.clone(),
        Arc::new(registry),
    )
    .start(&tracker);

    assert!(wait_until(Duration::from_secs(5), || done.load(Ordering::SeqCst) == 12).await);
    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert!(peak.load(Ordering::SeqCst) >= 2, "workers should overlap");

    handle.stop();
    tracker.close();
    tracker.wait().await;
}

#[tokio::test]
async fn test_stop_lets_in_flight_task_finish() {
    let queue = Arc::new(RecordingQueue::default());
    let started = Arc::new(AtomicBool::new(false));
    let finished = Arc::new(AtomicBool::new(false));

    let registry = {
        let (started, finished) = (started.clone(), finished.clone());
        TaskRegistry::builder()
            .register(
                "long",
                handler_fn(move |_: Task| {
                    let (started, finished) = (started.clone(), finished.clone());
                    async move {
                        started.store(true, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        finished.store(true, Ordering::SeqCst);
                        Ok::<(), TaskError>(())
                    }
                }),
            )
            .build()
    };

    queue.push_task(LANE, &task("long", 1)).await.unwrap();

    let tracker = TaskTracker::new();
    let handle = Foreman::new(
        ForemanConfig::new(LANE, 2),
        queue.clone(),
        Arc::new(registry),
    )
    .start(&tracker);

    assert!(wait_until(Duration::from_secs(2), || started.load(Ordering::SeqCst)).await);
    handle.stop();
    assert!(handle.is_stopped());

    tracker.close();
    tokio::time::timeout(Duration::from_secs(5), tracker.wait())
        .await
        .expect("workers should exit after their task");

    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(queue.completions(), 1);
}

#[tokio::test]
async fn test_stop_while_parked_returns_promptly() {
    let queue = Arc::new(RecordingQueue::default());
    let tracker = TaskTracker::new();
    let handle = Foreman::new(
        ForemanConfig::new(LANE, 4).with_idle_timeout(Duration::from_secs(300)),
        queue.clone(),
        Arc::new(TaskRegistry::builder().build()),
    )
    .start(&tracker);

    assert!(wait_until(Duration::from_secs(1), || queue.pops() >= 1).await);
    handle.stop();
    tracker.close();

    tokio::time::timeout(Duration::from_secs(2), tracker.wait())
        .await
        .expect("parked foreman should observe stop");
}

#[test]
fn test_config_clamps_workers() {
    let config = ForemanConfig::new(LANE, 0);
    assert_eq!(config.max_workers, 1);
    assert_eq!(config.idle_timeout, Duration::from_secs(60));
    assert_eq!(config.retry_backoff, Duration::from_secs(1));
}

#[tokio::test]
async fn test_zero_workers_set_directly_still_runs_one() {
    let queue = Arc::new(RecordingQueue::default());
    let runs = Arc::new(AtomicUsize::new(0));

    let mut config = ForemanConfig::new(LANE, 4);
    config.max_workers = 0;

    let tracker = TaskTracker::new();
    let handle = Foreman::new(
        config,
        queue.clone(),
        Arc::new(counting_registry(runs.clone())),
    )
    .start(&tracker);

    queue.push_task(LANE, &task("count", 1)).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || runs.load(Ordering::SeqCst) == 1).await);

    handle.stop();
    tracker.close();
    tracker.wait().await;
}
