//! Ownership and orderly teardown of worker pools and the stream watchdog.
//!
//! Uses `ArcSwap` for lock-free lifecycle state. Shutdown runs in two
//! phases: signal every pool and the watchdog to stop accepting work, then
//! wait for each to terminate with a bounded wait.

pub mod executor;
pub mod watchdog;
pub mod worker;

use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use executor::{ManagedExecutorProvider, WorkerPool};
pub use watchdog::{StreamTimeout, StreamWatchdog, WatchedStream};

use crate::config::RpcConfig;
use crate::error::RpcError;

/// How often a blocked shutdown re-checks its interrupt token.
const INTERRUPT_POLL: Duration = Duration::from_millis(20);

/// Lifecycle state of the RPC-facing component.
///
/// State machine: Open -> Closing -> Closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Open,
    /// Shutdown has begun; new calls fail fast.
    Closing,
    Closed,
}

/// Outcome of waiting for one runtime to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Termination {
    Terminated,
    TimedOut,
    Interrupted,
}

/// Shuts `runtime` down on a helper thread, waiting at most `timeout`.
///
/// When `worker` is given, it is first allowed to finish within the same
/// budget. An interrupt stops the wait; the helper thread still completes the
/// teardown in the background.
pub(crate) fn terminate_runtime(
    runtime: Runtime,
    worker: Option<JoinHandle<()>>,
    timeout: Duration,
    interrupt: &CancellationToken,
) -> Termination {
    let started = Instant::now();
    let (done_tx, done_rx) = mpsc::channel::<()>();

    let spawned = std::thread::Builder::new()
        .name("spanrpc-shutdown".to_string())
        .spawn(move || {
            if let Some(worker) = worker {
                let _ = runtime.block_on(tokio::time::timeout(timeout, worker));
            }
            runtime.shutdown_timeout(timeout.saturating_sub(started.elapsed()));
            let _ = done_tx.send(());
        });
    if let Err(e) = spawned {
        tracing::error!(error = %e, "failed to spawn shutdown thread");
        return Termination::TimedOut;
    }

    loop {
        match done_rx.recv_timeout(INTERRUPT_POLL) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                return if started.elapsed() < timeout {
                    Termination::Terminated
                } else {
                    Termination::TimedOut
                };
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                if interrupt.is_cancelled() {
                    return Termination::Interrupted;
                }
            }
        }
    }
}

/// Marks the component closed when dropped, whatever path shutdown takes.
struct CloseOnExit<'a>(&'a ArcSwap<LifecycleState>);

impl Drop for CloseOnExit<'_> {
    fn drop(&mut self) {
        self.0.store(Arc::new(LifecycleState::Closed));
    }
}

/// Owns the transport worker pools and the stream watchdog.
#[derive(Debug)]
pub struct ResourceLifecycleManager {
    state: ArcSwap<LifecycleState>,
    executors: ManagedExecutorProvider,
    watchdog: StreamWatchdog,
    termination_timeout: Duration,
}

impl ResourceLifecycleManager {
    /// Creates the manager and starts the watchdog. Pools are created lazily.
    ///
    /// # Errors
    ///
    /// Fails if the watchdog runtime cannot be built.
    pub fn new(config: &RpcConfig) -> Result<Self, RpcError> {
        Ok(Self {
            state: ArcSwap::from_pointee(LifecycleState::Open),
            executors: ManagedExecutorProvider::new(&config.executor),
            watchdog: StreamWatchdog::start(&config.stream)?,
            termination_timeout: config.executor.termination_timeout,
        })
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        **self.state.load()
    }

    /// True from the moment shutdown begins.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() != LifecycleState::Open
    }

    /// Fails fast with [`RpcError::Closed`] once shutdown has begun.
    ///
    /// # Errors
    ///
    /// See above.
    pub fn ensure_open(&self) -> Result<(), RpcError> {
        if self.is_closed() {
            Err(RpcError::Closed)
        } else {
            Ok(())
        }
    }

    /// A fresh pool for one transport channel.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Closed`] once shutdown has begun.
    pub fn executor(&self) -> Result<Arc<WorkerPool>, RpcError> {
        self.ensure_open()?;
        self.executors.executor()
    }

    #[must_use]
    pub fn executors(&self) -> &ManagedExecutorProvider {
        &self.executors
    }

    #[must_use]
    pub fn watchdog(&self) -> &StreamWatchdog {
        &self.watchdog
    }

    /// Shuts everything down, blocking until done. Idempotent: calls after
    /// the first return immediately.
    ///
    /// Blocks the calling thread; from async code use
    /// [`shutdown_async`](Self::shutdown_async).
    ///
    /// # Errors
    ///
    /// Never fails without an interrupt; see [`shutdown_with`](Self::shutdown_with).
    pub fn shutdown(&self) -> Result<(), RpcError> {
        self.shutdown_with(&CancellationToken::new())
    }

    /// Like [`shutdown`](Self::shutdown), but stops waiting when `interrupt`
    /// fires. Pools not yet awaited are still released.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Cancelled`] if interrupted.
    pub fn shutdown_with(&self, interrupt: &CancellationToken) -> Result<(), RpcError> {
        let previous = self.state.rcu(|current| {
            if **current == LifecycleState::Open {
                Arc::new(LifecycleState::Closing)
            } else {
                Arc::clone(current)
            }
        });
        if *previous != LifecycleState::Open {
            tracing::debug!("shutdown already in progress or complete");
            return Ok(());
        }
        let _closed = CloseOnExit(&self.state);

        // Phase 1: stop accepting work.
        let pools = self.executors.signal_shutdown();
        self.watchdog.signal_shutdown();
        tracing::info!(pools = pools.len(), "shutting down rpc resources");

        // Phase 2: bounded waits, one pool at a time.
        let mut interrupted =
            ManagedExecutorProvider::await_termination(&pools, self.termination_timeout, interrupt);
        let watchdog_wait = if interrupted {
            CancellationToken::new()
        } else {
            interrupt.clone()
        };
        match self
            .watchdog
            .await_termination(self.termination_timeout, &watchdog_wait)
        {
            Termination::Terminated => {}
            Termination::TimedOut => {
                tracing::warn!("stream watchdog did not terminate in time; abandoning");
            }
            Termination::Interrupted => interrupted = true,
        }

        if interrupted {
            tracing::warn!("shutdown interrupted while awaiting termination");
            return Err(RpcError::cancelled("interrupted while awaiting termination"));
        }
        tracing::info!("rpc resources shut down");
        Ok(())
    }

    /// Runs [`shutdown`](Self::shutdown) on the blocking pool.
    ///
    /// # Errors
    ///
    /// As [`shutdown`](Self::shutdown).
    pub async fn shutdown_async(self: &Arc<Self>) -> Result<(), RpcError> {
        let this = Arc::clone(self);
        tokio::task::spawn_blocking(move || this.shutdown())
            .await
            .map_err(|e| RpcError::Internal(anyhow::Error::new(e).context("shutdown task failed")))?
    }
}
