//! Background worker for periodic and on-demand tasks.
//!
//! A `BackgroundWorker<R>` runs on a caller-supplied runtime, feeding tasks
//! from an mpsc channel to a `BackgroundRunnable` and calling its tick hook
//! at a fixed interval.

use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Task handler executed by `BackgroundWorker`.
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;

    /// Process a single task.
    async fn run(&mut self, task: Self::Task);

    /// Called on each tick. Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once when the worker is shutting down. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

const CHANNEL_CAPACITY: usize = 256;

/// Handle to a running background worker.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the worker loop on `runtime`.
    ///
    /// A zero or unrepresentably large `tick_interval` disables periodic
    /// ticks; tasks are still served.
    pub fn start(mut runnable: R, tick_interval: Duration, runtime: &Handle) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(CHANNEL_CAPACITY);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::Instant::now()
                .checked_add(tick_interval)
                .filter(|_| !tick_interval.is_zero())
                .map(|first| {
                    let mut interval = tokio::time::interval_at(first, tick_interval);
                    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                    interval
                });

            loop {
                tokio::select! {
                    task = rx.recv() => {
                        match task {
                            Some(t) => runnable.run(t).await,
                            None => break,
                        }
                    }
                    () = next_tick(&mut ticker) => {
                        runnable.on_tick().await;
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }

            runnable.shutdown().await;
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Queues a task without waiting.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped or the channel is full.
    pub fn try_submit(&self, task: R::Task) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .try_send(task)
                .map_err(|e| anyhow::anyhow!("worker rejected task: {e}")),
            None => Err(anyhow::anyhow!("worker not running")),
        }
    }

    /// Signals the worker loop to exit without waiting for it.
    pub fn signal_stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
    }

    /// Detaches the worker task's join handle, if not already taken.
    pub fn take_join_handle(&mut self) -> Option<JoinHandle<()>> {
        self.handle.take()
    }

    /// Stops the worker and waits for its shutdown hook to complete.
    pub async fn stop(&mut self) {
        self.signal_stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    struct CountingRunnable {
        run_count: Arc<AtomicU32>,
        tick_count: Arc<AtomicU32>,
        shutdown_called: Arc<AtomicU32>,
    }

    #[async_trait]
    impl BackgroundRunnable for CountingRunnable {
        type Task = String;

        async fn run(&mut self, _task: String) {
            self.run_count.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_tick(&mut self) {
            self.tick_count.fetch_add(1, Ordering::SeqCst);
        }

        async fn shutdown(&mut self) {
            self.shutdown_called.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting() -> (CountingRunnable, [Arc<AtomicU32>; 3]) {
        let counters = [
            Arc::new(AtomicU32::new(0)),
            Arc::new(AtomicU32::new(0)),
            Arc::new(AtomicU32::new(0)),
        ];
        let runnable = CountingRunnable {
            run_count: Arc::clone(&counters[0]),
            tick_count: Arc::clone(&counters[1]),
            shutdown_called: Arc::clone(&counters[2]),
        };
        (runnable, counters)
    }

    #[tokio::test]
    async fn start_submit_and_stop() {
        let (runnable, [runs, _, shutdowns]) = counting();
        let mut worker =
            BackgroundWorker::start(runnable, Duration::from_secs(60), &Handle::current());

        worker.try_submit("task-1".to_string()).unwrap();
        worker.try_submit("task-2".to_string()).unwrap();
        worker.try_submit("task-3".to_string()).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        worker.stop().await;
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn tick_fires_periodically() {
        let (runnable, [_, ticks, _]) = counting();
        let mut worker =
            BackgroundWorker::start(runnable, Duration::from_millis(20), &Handle::current());

        tokio::time::sleep(Duration::from_millis(100)).await;
        worker.stop().await;

        assert!(ticks.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn zero_interval_never_ticks() {
        let (runnable, [runs, ticks, _]) = counting();
        let mut worker = BackgroundWorker::start(runnable, Duration::ZERO, &Handle::current());

        worker.try_submit("task".to_string()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        worker.stop().await;

        assert_eq!(ticks.load(Ordering::SeqCst), 0);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn maximal_interval_serves_tasks_without_ticking() {
        let (runnable, [runs, ticks, _]) = counting();
        let mut worker = BackgroundWorker::start(runnable, Duration::MAX, &Handle::current());

        worker.try_submit("task".to_string()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        worker.stop().await;

        assert_eq!(ticks.load(Ordering::SeqCst), 0);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn submit_after_stop_returns_error() {
        let (runnable, _) = counting();
        let mut worker =
            BackgroundWorker::start(runnable, Duration::from_secs(60), &Handle::current());
        worker.stop().await;

        assert!(worker.try_submit("late-task".to_string()).is_err());
    }
}
