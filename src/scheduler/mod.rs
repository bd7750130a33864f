//! Adaptive parallel task scheduler
//!
//! A growable pool of workers consumes admitted tasks from one shared FIFO
//! queue. The pool starts at the number of available processing units and a
//! throughput monitor adds a batch of workers every tick while the observed
//! byte delta keeps improving; after a few stalls the monitor retires for
//! the rest of the run. Worker count never decreases and never exceeds
//! [`MAX_PARALLEL_WORKERS`].

mod gate;

pub use gate::{AdmissionGate, AdmissionHold};

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{MirrorError, Result};
use crate::types::{ByteCounter, Task, TaskResult};

/// Hard ceiling on pool size
pub const MAX_PARALLEL_WORKERS: u32 = 128;

/// Tick of the throughput monitor
const MONITOR_PERIOD: Duration = Duration::from_secs(4);

/// Consecutive non-improving ticks before the monitor retires
const MONITOR_STALL_LIMIT: u32 = 2;

/// Workers added per improving monitor tick
static WORKER_BATCH: Lazy<u32> = Lazy::new(|| {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
});

/// A task travelling with its gate hold; the hold is released by the worker
/// when the task completes.
struct Admitted {
    task: Task,
    hold: AdmissionHold,
}

/// State shared between workers and the monitor for one run
struct PoolShared {
    sent_bytes: ByteCounter,
    workers: AtomicU32,
    queue_rx: async_channel::Receiver<Admitted>,
    results: async_channel::Sender<TaskResult>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

/// Concurrent task executor for one sync run
///
/// Created at run start, destroyed once the intake is closed and all
/// workers have drained (`stop_and_wait`).
pub struct ParallelManager {
    shared: Arc<PoolShared>,
    queue_tx: async_channel::Sender<Admitted>,
    gate: AdmissionGate,
    stop_monitor: watch::Sender<bool>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ParallelManager {
    /// Start workers and the throughput monitor, reporting results on
    /// `results`.
    pub fn new(results: async_channel::Sender<TaskResult>) -> Arc<Self> {
        Self::with_gate(results, AdmissionGate::new())
    }

    /// Same as [`ParallelManager::new`] with an explicit gate (used by tests
    /// to pin the memory budget).
    pub fn with_gate(
        results: async_channel::Sender<TaskResult>,
        gate: AdmissionGate,
    ) -> Arc<Self> {
        // Unbuffered in spirit: the producer hands a task straight to a
        // worker, so it can never run ahead of execution.
        let (queue_tx, queue_rx) = async_channel::bounded(1);

        let shared = Arc::new(PoolShared {
            sent_bytes: ByteCounter::new(),
            workers: AtomicU32::new(0),
            queue_rx,
            results,
            handles: Mutex::new(Vec::new()),
        });

        for _ in 0..*WORKER_BATCH {
            add_worker(&shared);
        }

        let (stop_monitor, stop_rx) = watch::channel(false);
        let monitor = spawn_monitor(Arc::clone(&shared), stop_rx);

        Arc::new(Self {
            shared,
            queue_tx,
            gate,
            stop_monitor,
            monitor: Mutex::new(Some(monitor)),
        })
    }

    /// Submit a task for shared (concurrent) execution
    pub async fn submit(&self, task: Task) -> Result<()> {
        self.enqueue(task, false).await
    }

    /// Submit a task that must run in isolation from all other tasks
    pub async fn submit_exclusive(&self, task: Task) -> Result<()> {
        self.enqueue(task, true).await
    }

    async fn enqueue(&self, mut task: Task, exclusive: bool) -> Result<()> {
        let mut barrier = exclusive || task.spec.barrier;
        if !barrier && !self.gate.within_budget(task.spec.size_hint) {
            // Not enough headroom to run this next to anything else;
            // serialize it instead of failing the run.
            tracing::debug!(
                key = %task.spec.key,
                size = task.spec.size_hint,
                "transfer exceeds memory budget, promoting to barrier"
            );
            barrier = true;
        }
        task.spec.barrier = barrier;

        let hold = if barrier {
            self.gate.exclusive().await
        } else {
            self.gate.shared().await
        };

        self.queue_tx
            .send(Admitted { task, hold })
            .await
            .map_err(|_| MirrorError::Fatal("task intake is closed".to_string()))
    }

    /// Bytes moved by all tasks so far
    pub fn sent_bytes(&self) -> u64 {
        self.shared.sent_bytes.get()
    }

    /// Current pool size; monotonically non-decreasing within a run
    pub fn worker_count(&self) -> u32 {
        self.shared.workers.load(Ordering::Relaxed)
    }

    /// Close the intake, wait for every worker to finish its current task
    /// and exit, then stop the monitor.
    pub async fn stop_and_wait(&self) {
        self.queue_tx.close();

        // The monitor may still add workers while we drain, so keep sweeping
        // the registry until it stays empty.
        loop {
            let drained = std::mem::take(&mut *self.shared.handles.lock());
            if drained.is_empty() {
                break;
            }
            for handle in drained {
                let _ = handle.await;
            }
        }

        self.stop_monitor.send_replace(true);
        let monitor = self.monitor.lock().take();
        if let Some(monitor) = monitor {
            let _ = monitor.await;
        }

        // Anything spawned between the last sweep and the monitor stopping
        // exits immediately against the closed intake.
        let remaining = std::mem::take(&mut *self.shared.handles.lock());
        for handle in remaining {
            let _ = handle.await;
        }
        tracing::debug!(workers = self.worker_count(), "worker pool drained");
    }
}

/// Spawn one worker if the ceiling allows it
fn add_worker(shared: &Arc<PoolShared>) {
    if shared.workers.load(Ordering::Relaxed) >= MAX_PARALLEL_WORKERS {
        return;
    }
    shared.workers.fetch_add(1, Ordering::Relaxed);

    let s = Arc::clone(shared);
    let handle = tokio::spawn(async move {
        while let Ok(Admitted { task, hold }) = s.queue_rx.recv().await {
            let result = task.run(s.sent_bytes.clone()).await;
            let _ = s.results.send(result).await;
            // Only now may other admissions proceed past a barrier.
            drop(hold);
        }
    });
    shared.handles.lock().push(handle);
}

/// Throughput monitor: grows the pool while bandwidth keeps improving,
/// retires permanently after `MONITOR_STALL_LIMIT` consecutive stalls.
fn spawn_monitor(shared: Arc<PoolShared>, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MONITOR_PERIOD);
        // interval fires immediately; the first real sample is one period in
        ticker.tick().await;

        let mut prev_sent: u64 = 0;
        let mut best_delta: u64 = 0;
        let mut stalls: u32 = 0;

        loop {
            tokio::select! {
                _ = stop.changed() => return,
                _ = ticker.tick() => {
                    let sent = shared.sent_bytes.get();
                    let delta = sent.saturating_sub(prev_sent);
                    prev_sent = sent;

                    if delta >= best_delta {
                        best_delta = delta;
                        stalls = 0;
                        for _ in 0..*WORKER_BATCH {
                            add_worker(&shared);
                        }
                        tracing::debug!(
                            delta,
                            workers = shared.workers.load(Ordering::Relaxed),
                            "throughput improved, grew worker pool"
                        );
                    } else {
                        stalls += 1;
                        if stalls > MONITOR_STALL_LIMIT {
                            tracing::debug!("throughput plateaued, monitor retiring");
                            return;
                        }
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TaskAction, TaskSpec};

    fn noop_task(key: &str, size_hint: u64) -> Task {
        let spec = TaskSpec {
            action: TaskAction::Copy,
            key: key.to_string(),
            size_hint,
            barrier: false,
        };
        let result_spec = spec.clone();
        Task::new(
            spec,
            Box::new(move |counter| {
                Box::pin(async move {
                    counter.add(result_spec.size_hint);
                    TaskResult::ok(result_spec.action, result_spec.key, result_spec.size_hint)
                })
            }),
        )
    }

    #[tokio::test]
    async fn test_tasks_execute_and_report() {
        let (tx, rx) = async_channel::bounded(16);
        let manager = ParallelManager::with_gate(tx, AdmissionGate::with_budget(0));

        for i in 0..8 {
            manager.submit(noop_task(&format!("k{i}"), 10)).await.unwrap();
        }
        manager.stop_and_wait().await;
        assert_eq!(manager.sent_bytes(), 80);
        drop(manager);

        let mut seen = 0;
        while let Ok(result) = rx.recv().await {
            assert!(result.is_ok());
            seen += 1;
        }
        assert_eq!(seen, 8);
    }

    #[tokio::test]
    async fn test_intake_closed_after_stop() {
        let (tx, _rx) = async_channel::bounded(16);
        let manager = ParallelManager::with_gate(tx, AdmissionGate::with_budget(0));
        manager.stop_and_wait().await;

        let err = manager.submit(noop_task("late", 0)).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_stop_waits_for_inflight_tasks() {
        let (tx, rx) = async_channel::bounded(16);
        let manager = ParallelManager::with_gate(tx, AdmissionGate::with_budget(0));

        let spec = TaskSpec {
            action: TaskAction::Copy,
            key: "slow".to_string(),
            size_hint: 0,
            barrier: false,
        };
        let key = spec.key.clone();
        let task = Task::new(
            spec,
            Box::new(move |_counter| {
                Box::pin(async move {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    TaskResult::ok(TaskAction::Copy, key, 0)
                })
            }),
        );
        manager.submit(task).await.unwrap();
        manager.stop_and_wait().await;

        // The worker finished and reported before stop returned.
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_memory_pressure_promotes_to_barrier() {
        // Budget of one byte: any sized transfer gets serialized.
        let (tx, rx) = async_channel::bounded(16);
        let manager = ParallelManager::with_gate(tx, AdmissionGate::with_budget(1));

        manager.submit(noop_task("huge", 1 << 40)).await.unwrap();
        manager.stop_and_wait().await;

        let result = rx.recv().await.unwrap();
        assert!(result.is_ok());
        // The worker ran it alone; nothing else was in flight, so completion
        // is the observable effect. Promotion itself is asserted through the
        // gate in scenario tests.
    }
}
