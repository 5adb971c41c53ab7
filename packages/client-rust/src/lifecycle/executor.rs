//! Worker pools backing transport channels.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use parking_lot::Mutex;
use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{terminate_runtime, Termination};
use crate::config::ExecutorConfig;
use crate::error::RpcError;

/// One multi-threaded pool, created for one transport channel.
pub struct WorkerPool {
    id: usize,
    threads: usize,
    handle: Handle,
    accepting: AtomicBool,
    runtime: Mutex<Option<Runtime>>,
}

impl WorkerPool {
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    #[must_use]
    pub fn threads(&self) -> usize {
        self.threads
    }

    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Spawns `future` on the pool.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Closed`] once the pool has been told to shut down.
    pub fn spawn<F>(&self, future: F) -> Result<JoinHandle<F::Output>, RpcError>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        if !self.is_accepting() {
            return Err(RpcError::Closed);
        }
        Ok(self.handle.spawn(future))
    }

    /// Runs blocking `work` on the pool's blocking threads.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Closed`] once the pool has been told to shut down.
    pub fn spawn_blocking<F, T>(&self, work: F) -> Result<JoinHandle<T>, RpcError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if !self.is_accepting() {
            return Err(RpcError::Closed);
        }
        Ok(self.handle.spawn_blocking(work))
    }

    fn signal_shutdown(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    fn await_termination(&self, timeout: Duration, interrupt: &CancellationToken) -> Termination {
        match self.runtime.lock().take() {
            Some(runtime) => terminate_runtime(runtime, None, timeout, interrupt),
            None => Termination::Terminated,
        }
    }

    fn abandon(&self) {
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("id", &self.id)
            .field("threads", &self.threads)
            .field("accepting", &self.is_accepting())
            .finish_non_exhaustive()
    }
}

struct ProviderState {
    accepting: bool,
    next_id: usize,
    pools: Vec<Arc<WorkerPool>>,
}

/// Lazily creates a pool per transport channel and tracks every pool it
/// hands out until shutdown. Pools are never closed on their own.
pub struct ManagedExecutorProvider {
    config: ExecutorConfig,
    thread_seq: Arc<AtomicUsize>,
    state: Mutex<ProviderState>,
}

impl ManagedExecutorProvider {
    #[must_use]
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            config: config.clone(),
            thread_seq: Arc::new(AtomicUsize::new(0)),
            state: Mutex::new(ProviderState {
                accepting: true,
                next_id: 0,
                pools: Vec::new(),
            }),
        }
    }

    /// Threads per pool: the configured minimum or the host's parallelism,
    /// whichever is larger.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        let parallelism = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        self.config.min_worker_threads.max(parallelism).max(1)
    }

    /// Creates and tracks a new pool.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Closed`] after shutdown has begun, or an internal
    /// error if the runtime cannot be built.
    pub fn executor(&self) -> Result<Arc<WorkerPool>, RpcError> {
        let threads = self.thread_count();
        // Held across construction so shutdown never misses a pool.
        let mut state = self.state.lock();
        if !state.accepting {
            return Err(RpcError::Closed);
        }

        let seq = Arc::clone(&self.thread_seq);
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name_fn(move || {
                let n = seq.fetch_add(1, Ordering::Relaxed);
                format!("spanrpc-transport-{n}")
            })
            .enable_all()
            .build()
            .context("building transport worker pool")?;

        let id = state.next_id;
        state.next_id += 1;
        let pool = Arc::new(WorkerPool {
            id,
            threads,
            handle: runtime.handle().clone(),
            accepting: AtomicBool::new(true),
            runtime: Mutex::new(Some(runtime)),
        });
        state.pools.push(Arc::clone(&pool));
        #[allow(clippy::cast_precision_loss)]
        let tracked = state.pools.len() as f64;
        metrics::gauge!("spanrpc_worker_pools").set(tracked);
        tracing::debug!(pool = id, threads, "created transport worker pool");
        Ok(pool)
    }

    /// Number of pools currently tracked.
    #[must_use]
    pub fn pool_count(&self) -> usize {
        self.state.lock().pools.len()
    }

    /// Stops accepting work everywhere and hands back the tracked pools.
    pub(crate) fn signal_shutdown(&self) -> Vec<Arc<WorkerPool>> {
        let mut state = self.state.lock();
        state.accepting = false;
        for pool in &state.pools {
            pool.signal_shutdown();
        }
        std::mem::take(&mut state.pools)
    }

    /// Waits for each pool in turn, at most `timeout` apiece.
    ///
    /// Every pool is released even when an earlier one times out or the wait
    /// is interrupted; pools after an interrupt are dropped without waiting.
    /// Returns whether the wait was interrupted.
    pub(crate) fn await_termination(
        pools: &[Arc<WorkerPool>],
        timeout: Duration,
        interrupt: &CancellationToken,
    ) -> bool {
        let mut interrupted = false;
        for pool in pools {
            if interrupted || interrupt.is_cancelled() {
                interrupted = true;
                pool.abandon();
                continue;
            }
            match pool.await_termination(timeout, interrupt) {
                Termination::Terminated => {
                    tracing::debug!(pool = pool.id, "worker pool terminated");
                }
                Termination::TimedOut => {
                    metrics::counter!("spanrpc_worker_pools_abandoned_total").increment(1);
                    tracing::warn!(pool = pool.id, "worker pool did not terminate in time; abandoning");
                }
                Termination::Interrupted => {
                    interrupted = true;
                }
            }
        }
        metrics::gauge!("spanrpc_worker_pools").set(0.0);
        interrupted
    }
}

impl std::fmt::Debug for ManagedExecutorProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedExecutorProvider")
            .field("config", &self.config)
            .field("pools", &self.pool_count())
            .finish_non_exhaustive()
    }
}
