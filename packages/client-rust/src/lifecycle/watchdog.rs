//! Stream-level wait and idle timeouts.
//!
//! Streams register with the [`StreamWatchdog`] and receive a
//! [`WatchedStream`] guard. A background worker on the watchdog's own
//! runtime inspects every registered stream at a fixed interval and cancels
//! those that have waited too long for a requested message, or sat idle with
//! no demand for too long.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context as _;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::Runtime;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use super::worker::{BackgroundRunnable, BackgroundWorker};
use super::{terminate_runtime, Termination};
use crate::config::StreamConfig;
use crate::context::InvocationContext;
use crate::error::RpcError;

const WATCHDOG_THREAD_NAME: &str = "spanrpc-watchdog";

type StreamTable = DashMap<u64, Arc<StreamState>>;

// ---------------------------------------------------------------------------
// Per-stream state
// ---------------------------------------------------------------------------

/// Why the watchdog cancelled a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTimeout {
    /// Requested messages did not arrive in time.
    Wait,
    /// No demand and no activity for too long.
    Idle,
}

#[derive(Debug)]
struct StreamState {
    wait_timeout: Duration,
    idle_timeout: Duration,
    outstanding: AtomicU64,
    last_activity: Mutex<Instant>,
    cancel: CancellationToken,
    timed_out: Mutex<Option<StreamTimeout>>,
}

impl StreamState {
    fn new(wait_timeout: Duration, idle_timeout: Duration, now: Instant) -> Self {
        Self {
            wait_timeout,
            idle_timeout,
            outstanding: AtomicU64::new(0),
            last_activity: Mutex::new(now),
            cancel: CancellationToken::new(),
            timed_out: Mutex::new(None),
        }
    }

    fn expired(&self, now: Instant) -> Option<StreamTimeout> {
        if self.cancel.is_cancelled() {
            return None;
        }
        let quiet = now.saturating_duration_since(*self.last_activity.lock());
        if self.outstanding.load(Ordering::Acquire) > 0 {
            (!self.wait_timeout.is_zero() && quiet >= self.wait_timeout)
                .then_some(StreamTimeout::Wait)
        } else {
            (!self.idle_timeout.is_zero() && quiet >= self.idle_timeout)
                .then_some(StreamTimeout::Idle)
        }
    }
}

fn sweep(streams: &StreamTable, now: Instant) -> usize {
    let mut cancelled = 0;
    for entry in streams {
        if let Some(reason) = entry.value().expired(now) {
            *entry.value().timed_out.lock() = Some(reason);
            entry.value().cancel.cancel();
            cancelled += 1;
            let kind = match reason {
                StreamTimeout::Wait => "wait",
                StreamTimeout::Idle => "idle",
            };
            metrics::counter!("spanrpc_stream_timeouts_total", "kind" => kind).increment(1);
            tracing::warn!(stream = *entry.key(), ?reason, "cancelling stalled stream");
        }
    }
    cancelled
}

// ---------------------------------------------------------------------------
// WatchedStream
// ---------------------------------------------------------------------------

/// Registration of one stream with the watchdog. Dropping it unregisters.
#[derive(Debug)]
pub struct WatchedStream {
    id: u64,
    state: Arc<StreamState>,
    streams: Arc<StreamTable>,
}

impl WatchedStream {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Records that the consumer asked for `n` more messages.
    pub fn request(&self, n: usize) {
        if n == 0 {
            return;
        }
        let n = u64::try_from(n).unwrap_or(u64::MAX);
        let before = self.state.outstanding.fetch_add(n, Ordering::AcqRel);
        if before == 0 {
            // The wait clock starts when demand appears.
            *self.state.last_activity.lock() = Instant::now();
        }
    }

    /// Records the arrival of one message.
    pub fn on_message(&self) {
        let _ = self
            .state
            .outstanding
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        *self.state.last_activity.lock() = Instant::now();
    }

    /// Messages requested but not yet received.
    #[must_use]
    pub fn outstanding(&self) -> u64 {
        self.state.outstanding.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.cancel.is_cancelled()
    }

    /// Which timeout fired, if the watchdog cancelled this stream.
    #[must_use]
    pub fn timed_out(&self) -> Option<StreamTimeout> {
        *self.state.timed_out.lock()
    }

    /// Completes once the stream is cancelled, by the watchdog or locally.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.state.cancel.cancelled()
    }

    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.state.cancel.clone()
    }

    pub fn cancel(&self) {
        self.state.cancel.cancel();
    }
}

impl Drop for WatchedStream {
    fn drop(&mut self) {
        self.streams.remove(&self.id);
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

/// Commands accepted by the watchdog worker.
#[derive(Debug)]
pub enum WatchdogTask {
    /// Inspect all streams now instead of waiting for the next tick.
    Sweep,
}

struct WatchdogRunnable {
    streams: Arc<StreamTable>,
}

#[async_trait]
impl BackgroundRunnable for WatchdogRunnable {
    type Task = WatchdogTask;

    async fn run(&mut self, task: WatchdogTask) {
        match task {
            WatchdogTask::Sweep => {
                sweep(&self.streams, Instant::now());
            }
        }
    }

    async fn on_tick(&mut self) {
        sweep(&self.streams, Instant::now());
    }

    async fn shutdown(&mut self) {
        tracing::debug!(streams = self.streams.len(), "stream watchdog stopped");
    }
}

// ---------------------------------------------------------------------------
// StreamWatchdog
// ---------------------------------------------------------------------------

/// Enforces stream wait and idle timeouts from a dedicated thread.
pub struct StreamWatchdog {
    streams: Arc<StreamTable>,
    next_id: AtomicU64,
    accepting: AtomicBool,
    defaults: StreamConfig,
    worker: Mutex<Option<BackgroundWorker<WatchdogRunnable>>>,
    runtime: Mutex<Option<Runtime>>,
}

impl StreamWatchdog {
    /// Starts the watchdog thread.
    ///
    /// # Errors
    ///
    /// Fails if the watchdog runtime cannot be built.
    pub fn start(config: &StreamConfig) -> Result<Self, RpcError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(WATCHDOG_THREAD_NAME)
            .enable_time()
            .build()
            .context("building stream watchdog runtime")?;

        let streams = Arc::new(StreamTable::new());
        let worker = BackgroundWorker::start(
            WatchdogRunnable {
                streams: Arc::clone(&streams),
            },
            config.check_interval,
            runtime.handle(),
        );
        tracing::debug!(
            check_interval_ms = u64::try_from(config.check_interval.as_millis()).unwrap_or(u64::MAX),
            "stream watchdog started"
        );

        Ok(Self {
            streams,
            next_id: AtomicU64::new(1),
            accepting: AtomicBool::new(true),
            defaults: config.clone(),
            worker: Mutex::new(Some(worker)),
            runtime: Mutex::new(Some(runtime)),
        })
    }

    /// Registers a stream with the configured default timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Closed`] once the watchdog is shutting down.
    pub fn watch(&self) -> Result<WatchedStream, RpcError> {
        self.watch_with(self.defaults.wait_timeout, self.defaults.idle_timeout)
    }

    /// Registers a stream with the timeouts carried by `ctx`.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Closed`] once the watchdog is shutting down.
    pub fn watch_context(&self, ctx: &InvocationContext) -> Result<WatchedStream, RpcError> {
        self.watch_with(ctx.stream_wait_timeout, ctx.stream_idle_timeout)
    }

    /// Registers a stream. A zero timeout disables that check.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Closed`] once the watchdog is shutting down.
    pub fn watch_with(
        &self,
        wait_timeout: Duration,
        idle_timeout: Duration,
    ) -> Result<WatchedStream, RpcError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(RpcError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(StreamState::new(wait_timeout, idle_timeout, Instant::now()));
        self.streams.insert(id, Arc::clone(&state));
        Ok(WatchedStream {
            id,
            state,
            streams: Arc::clone(&self.streams),
        })
    }

    /// Asks the worker for an immediate sweep.
    ///
    /// # Errors
    ///
    /// Fails once the worker has stopped.
    pub fn request_sweep(&self) -> Result<(), RpcError> {
        match self.worker.lock().as_ref() {
            Some(worker) => Ok(worker.try_submit(WatchdogTask::Sweep)?),
            None => Err(RpcError::Closed),
        }
    }

    /// Runs one inspection pass as of `now` on the calling thread and returns
    /// how many streams were cancelled.
    pub fn sweep_at(&self, now: Instant) -> usize {
        sweep(&self.streams, now)
    }

    #[must_use]
    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    pub(crate) fn signal_shutdown(&self) {
        self.accepting.store(false, Ordering::Release);
        if let Some(worker) = self.worker.lock().as_mut() {
            worker.signal_stop();
        }
    }

    pub(crate) fn await_termination(
        &self,
        timeout: Duration,
        interrupt: &CancellationToken,
    ) -> Termination {
        let join = self
            .worker
            .lock()
            .take()
            .and_then(|mut worker| worker.take_join_handle());
        match self.runtime.lock().take() {
            Some(runtime) => terminate_runtime(runtime, join, timeout, interrupt),
            None => Termination::Terminated,
        }
    }
}

impl Drop for StreamWatchdog {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for StreamWatchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamWatchdog")
            .field("streams", &self.streams.len())
            .field("accepting", &self.accepting.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
