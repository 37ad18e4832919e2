//! Foreman: owns a worker pool bound to one queue lane.
//!
//! The foreman loop waits for a worker to announce itself, then pops the next
//! task from its lane:
//! 1. Pop error → return the worker to the pool, back off, retry
//! 2. Lane empty → return the worker, park until a push wakes the lane, the
//!    idle timeout elapses, or the foreman is stopped
//! 3. Task → hand it straight to the waiting worker's job slot
//!
//! The idle timeout bounds how stale a parked foreman can get when a wake
//! notification is lost; the queue has no blocking pop to rely on instead.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use postroom_queue::{Task, TaskQueue};

use crate::registry::TaskRegistry;
use crate::worker::Worker;

/// Default pause after a failed pop.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Default longest park on an empty lane.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Foreman settings.
#[derive(Debug, Clone)]
pub struct ForemanConfig {
    /// Queue lane this foreman consumes.
    pub lane: String,
    /// Size of the worker pool (at least 1).
    pub max_workers: usize,
    pub retry_backoff: Duration,
    pub idle_timeout: Duration,
}

impl ForemanConfig {
    pub fn new(lane: impl Into<String>, max_workers: usize) -> Self {
        Self {
            lane: lane.into(),
            max_workers: max_workers.max(1),
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    pub fn with_retry_backoff(mut self, retry_backoff: Duration) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }
}

/// A worker pool bound to one lane, not yet started.
pub struct Foreman {
    config: ForemanConfig,
    queue: Arc<dyn TaskQueue>,
    registry: Arc<TaskRegistry>,
}

impl Foreman {
    pub fn new(
        config: ForemanConfig,
        queue: Arc<dyn TaskQueue>,
        registry: Arc<TaskRegistry>,
    ) -> Self {
        Self {
            config,
            queue,
            registry,
        }
    }

    /// Start the workers and the assignment loop.
    ///
    /// Every spawned task is registered with `tracker`; once the returned
    /// handle is stopped, `tracker.close()` + `tracker.wait()` resolves when
    /// the loop and all workers have exited.
    pub fn start(self, tracker: &TaskTracker) -> ForemanHandle {
        let lane: Arc<str> = Arc::from(self.config.lane.as_str());
        let cancel = CancellationToken::new();
        let max_workers = self.config.max_workers.max(1);
        let (available_tx, available_rx) = mpsc::channel(max_workers);

        let mut job_slots = Vec::with_capacity(max_workers);
        for id in 0..max_workers {
            let (job_tx, job_rx) = mpsc::channel(1);
            job_slots.push(job_tx);
            Worker::new(
                id,
                lane.clone(),
                self.queue.clone(),
                self.registry.clone(),
                available_tx.clone(),
                job_rx,
            )
            .start(tracker);
        }

        let assigner = Assigner {
            lane: lane.clone(),
            config: self.config,
            queue: self.queue,
            available_tx,
            available_rx,
            job_slots,
            cancel: cancel.clone(),
        };
        tracker.spawn(assigner.run());

        ForemanHandle { lane, cancel }
    }
}

/// Handle to a running foreman.
#[derive(Debug, Clone)]
pub struct ForemanHandle {
    lane: Arc<str>,
    cancel: CancellationToken,
}

impl ForemanHandle {
    /// Stop the foreman and its workers.
    ///
    /// In-flight tasks run to completion; their workers exit afterwards.
    pub fn stop(&self) {
        tracing::info!(comp = "foreman", lane = %self.lane, state = "stopping", "Foreman stopping");
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// The foreman's main loop and the state only it touches.
struct Assigner {
    lane: Arc<str>,
    config: ForemanConfig,
    queue: Arc<dyn TaskQueue>,
    available_tx: mpsc::Sender<usize>,
    available_rx: mpsc::Receiver<usize>,
    job_slots: Vec<mpsc::Sender<Task>>,
    cancel: CancellationToken,
}

impl Assigner {
    async fn run(mut self) {
        tracing::info!(
            comp = "foreman",
            state = "started",
            workers = self.job_slots.len(),
            lane = %self.lane,
            "Workers started and waiting"
        );

        loop {
            let worker_id = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                worker = self.available_rx.recv() => match worker {
                    Some(id) => id,
                    None => break,
                },
            };

            match self.queue.pop_next_task(&self.lane).await {
                Err(e) => {
                    tracing::error!(comp = "foreman", lane = %self.lane, error = %e, "Error popping task");
                    self.release(worker_id);
                    if !self.pause(self.config.retry_backoff).await {
                        break;
                    }
                }
                Ok(None) => {
                    // nothing to do, put the worker back and park until there might be more
                    self.release(worker_id);
                    if !self.park().await {
                        break;
                    }
                }
                Ok(Some(task)) => self.assign(worker_id, task).await,
            }
        }

        // closing the job slots tells idle workers to exit
        self.job_slots.clear();
        tracing::info!(comp = "foreman", lane = %self.lane, state = "stopped", "Foreman stopped");
    }

    /// Return an idle worker to the pool. Never blocks: the channel has room
    /// for every worker and this one was just taken out.
    fn release(&self, worker_id: usize) {
        if let Err(e) = self.available_tx.try_send(worker_id) {
            tracing::error!(
                comp = "foreman",
                lane = %self.lane,
                worker_id,
                error = %e,
                "Unable to return worker to pool"
            );
        }
    }

    async fn assign(&self, worker_id: usize, task: Task) {
        let Some(slot) = self.job_slots.get(worker_id) else {
            tracing::error!(comp = "foreman", lane = %self.lane, worker_id, "Unknown worker id");
            self.abandon(task).await;
            return;
        };

        match slot.try_send(task) {
            Ok(()) => {}
            Err(TrySendError::Full(task)) | Err(TrySendError::Closed(task)) => {
                tracing::error!(
                    comp = "foreman",
                    lane = %self.lane,
                    worker_id,
                    task_type = %task.task_type,
                    "Worker unable to accept task"
                );
                self.abandon(task).await;
            }
        }
    }

    /// Complete a popped task that no worker will run, so the owner isn't
    /// left with a phantom task in flight.
    async fn abandon(&self, task: Task) {
        if let Err(e) = self.queue.mark_task_complete(&self.lane, task.org_id).await {
            tracing::error!(
                comp = "foreman",
                lane = %self.lane,
                org_id = %task.org_id,
                error = %e,
                "Error marking task complete"
            );
        }
    }

    /// Wait for a wake notification, the idle timeout or a stop.
    /// Returns `false` if the foreman was stopped.
    async fn park(&self) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            woke = self.queue.wait_for_push(&self.lane) => match woke {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(comp = "foreman", lane = %self.lane, error = %e, "Error waiting for lane wake");
                    self.pause(self.config.retry_backoff).await
                }
            },
            _ = tokio::time::sleep(self.config.idle_timeout) => true,
        }
    }

    /// Sleep for `duration` unless stopped first. Returns `false` if stopped.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}
