//! Caller-facing handle to a started or resumed long-running operation.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use spanrpc_core::{Code, Operation, OperationResult, Payload, Status, TypedMessage};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::context::CallContextBuilder;
use crate::error::RpcError;
use crate::ratelimit::AdministrativeRateLimiter;
use crate::retry::scale;
use crate::transport::OperationsClient;

/// Timeout applied to each `get_operation` poll.
const POLL_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Backoff between polls of a running operation.
#[derive(Debug, Clone, PartialEq)]
pub struct PollSettings {
    pub initial_delay: Duration,
    pub delay_multiplier: f64,
    pub max_delay: Duration,
    /// Give up waiting after this long; `None` waits indefinitely.
    pub total_timeout: Option<Duration>,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            delay_multiplier: 1.5,
            max_delay: Duration::from_secs(45),
            total_timeout: None,
        }
    }
}

/// Route polls take through the administrative throttle.
#[derive(Clone)]
pub(crate) struct PollRoute {
    pub(crate) client: Arc<dyn OperationsClient>,
    pub(crate) limiter: AdministrativeRateLimiter,
    pub(crate) contexts: Arc<CallContextBuilder>,
    pub(crate) destination: String,
}

/// Handle to an operation that is valid whether it was freshly started or
/// resumed from an earlier attempt.
pub struct OperationHandle {
    snapshot: Operation,
    resumed: bool,
    route: PollRoute,
}

impl OperationHandle {
    pub(crate) fn new(snapshot: Operation, resumed: bool, route: PollRoute) -> Self {
        Self {
            snapshot,
            resumed,
            route,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.snapshot.name
    }

    /// The most recently observed state of the operation.
    #[must_use]
    pub fn snapshot(&self) -> &Operation {
        &self.snapshot
    }

    /// True when the operation was found by listing rather than started by
    /// the attempt that succeeded.
    #[must_use]
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.snapshot.done
    }

    /// Decoded progress metadata from the latest snapshot.
    #[must_use]
    pub fn metadata<M: TypedMessage>(&self) -> Option<M> {
        self.snapshot.metadata_as::<M>()
    }

    /// Fetches a fresh snapshot by name.
    ///
    /// # Errors
    ///
    /// Returns the transport error of the poll.
    pub async fn refresh(&mut self) -> Result<&Operation, RpcError> {
        let route = &self.route;
        route.limiter.acquire(&route.destination).await;
        let ctx = route
            .contexts
            .build_with_timeout(None, &self.snapshot.name, POLL_RPC_TIMEOUT);
        let mut latest = route.client.get_operation(&self.snapshot.name, ctx).await?;
        if latest.name.is_empty() {
            latest.name.clone_from(&self.snapshot.name);
        }
        self.snapshot = latest;
        Ok(&self.snapshot)
    }

    /// Polls until the operation is done and returns its response payload.
    ///
    /// # Errors
    ///
    /// Returns the status the operation finished with, a poll failure,
    /// `DEADLINE_EXCEEDED` if `poll.total_timeout` elapses, or
    /// [`RpcError::Cancelled`] if `cancel` fires.
    pub async fn wait(
        mut self,
        poll: &PollSettings,
        cancel: &CancellationToken,
    ) -> Result<Payload, RpcError> {
        let started = Instant::now();
        let mut delay = poll.initial_delay;

        while !self.snapshot.done {
            if let Some(total) = poll.total_timeout {
                if started.elapsed().saturating_add(delay) > total {
                    return Err(Status::deadline_exceeded(format!(
                        "operation {} did not finish in time",
                        self.snapshot.name
                    ))
                    .into());
                }
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Err(RpcError::cancelled("cancelled while waiting for operation"));
                }
                () = tokio::time::sleep(delay) => {}
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    return Err(RpcError::cancelled("cancelled while polling operation"));
                }
                polled = self.refresh() => {
                    polled?;
                }
            }

            delay = scale(delay, poll.delay_multiplier, poll.max_delay);
        }

        tracing::debug!(operation = %self.snapshot.name, resumed = self.resumed, "operation finished");
        match self.snapshot.result {
            Some(OperationResult::Response(payload)) => Ok(payload),
            Some(OperationResult::Error(status)) => Err(status.into()),
            None => Err(Status::new(
                Code::Internal,
                format!("operation {} finished without a result", self.snapshot.name),
            )
            .into()),
        }
    }

    /// Like [`wait`](Self::wait), decoding the response as `M`.
    ///
    /// # Errors
    ///
    /// As [`wait`](Self::wait); a response that does not decode as `M` is an
    /// internal error.
    pub async fn wait_for<M: TypedMessage>(
        self,
        poll: &PollSettings,
        cancel: &CancellationToken,
    ) -> Result<M, RpcError> {
        let name = self.snapshot.name.clone();
        let payload = self.wait(poll, cancel).await?;
        let message = payload
            .unpack::<M>()
            .with_context(|| format!("decoding response of {name}"))?;
        Ok(message)
    }
}

impl fmt::Debug for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationHandle")
            .field("name", &self.snapshot.name)
            .field("done", &self.snapshot.done)
            .field("resumed", &self.resumed)
            .finish_non_exhaustive()
    }
}
