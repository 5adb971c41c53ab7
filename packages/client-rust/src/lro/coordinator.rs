//! Start-or-resume driver for long-running operations.
//!
//! A mutating call that fails with a transient error may still have created
//! its operation on the server. Before re-issuing it, every retry lists
//! recent operations and resumes the one the earlier attempt most plausibly
//! created, so a retry never starts a duplicate.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use spanrpc_core::{CallOptions, ClockSource, Operation, Status, SystemClock, Timestamp};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::handle::{OperationHandle, PollRoute};
use super::selector::most_recent_operation;
use crate::context::CallContextBuilder;
use crate::error::RpcError;
use crate::ratelimit::AdministrativeRateLimiter;
use crate::retry::{
    AttemptSettings, OperationRetryPolicy, RetryHelper, RetryPredicate, RetrySettings,
    RetryableCallable,
};
use crate::transport::{OperationLister, OperationStarter, OperationsClient};

// ---------------------------------------------------------------------------
// Attempt state machine
// ---------------------------------------------------------------------------

/// Where a resumable call stands between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    NotStarted,
    /// At least one attempt was issued; retries must look for its operation.
    Attempted { initial_call_time: Timestamp },
    Succeeded { resumed: bool },
    TerminalFailure,
}

/// What the next attempt will do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptPlan {
    StartFresh,
    Resume { name: String },
}

/// The request-specific half of a resumable call.
pub struct ResumableCall<'a, Req, L: ?Sized, F> {
    pub request: &'a Req,
    /// Rate-limiter key, e.g. `projects/p`.
    pub destination: &'a str,
    /// Resource the call addresses; drives routing headers.
    pub resource: &'a str,
    pub options: Option<&'a CallOptions>,
    /// Lists operations this call could have created.
    pub lister: &'a L,
    /// Best-known start time of a listed operation.
    pub start_time: F,
}

/// One logical start-or-resume call, invoked once per attempt by the retry driver.
pub struct ResumableAttempt<'a, Req, S: ?Sized, L: ?Sized, F> {
    call: ResumableCall<'a, Req, L, F>,
    starter: &'a S,
    operations: &'a dyn OperationsClient,
    limiter: &'a AdministrativeRateLimiter,
    contexts: &'a CallContextBuilder,
    clock: &'a dyn ClockSource,
    predicate: &'a dyn RetryPredicate,
    cancel: &'a CancellationToken,
    state: AttemptState,
    resumed: bool,
}

impl<Req, S, L, F> ResumableAttempt<'_, Req, S, L, F>
where
    Req: Sync,
    S: OperationStarter<Req> + ?Sized,
    L: OperationLister + ?Sized,
    F: Fn(&Operation) -> Option<Timestamp> + Send + Sync,
{
    #[must_use]
    pub fn state(&self) -> AttemptState {
        self.state
    }

    /// Decides the next attempt's mode, advancing the state machine.
    ///
    /// # Errors
    ///
    /// Propagates listing failures, and refuses to plan once the call has
    /// reached a final state.
    pub async fn plan(&mut self) -> Result<AttemptPlan, RpcError> {
        match self.state {
            AttemptState::NotStarted => {
                let initial_call_time = self.clock.now().truncate_to_seconds();
                self.state = AttemptState::Attempted { initial_call_time };
                Ok(AttemptPlan::StartFresh)
            }
            AttemptState::Attempted { initial_call_time } => {
                let found =
                    most_recent_operation(self.call.lister, &self.call.start_time, initial_call_time)
                        .await?;
                match found {
                    Some(op) if !op.name.is_empty() => {
                        tracing::info!(
                            operation = %op.name,
                            destination = self.call.destination,
                            "resuming operation started by an earlier attempt"
                        );
                        Ok(AttemptPlan::Resume { name: op.name })
                    }
                    _ => Ok(AttemptPlan::StartFresh),
                }
            }
            AttemptState::Succeeded { .. } | AttemptState::TerminalFailure => Err(
                anyhow::anyhow!("resumable call already reached {:?}", self.state).into(),
            ),
        }
    }

    fn settle(&mut self, outcome: &Result<Operation, RpcError>, resumed: bool) {
        self.state = match outcome {
            Ok(_) => {
                self.resumed = resumed;
                AttemptState::Succeeded { resumed }
            }
            Err(e) if e.is_cancelled() || !self.predicate.should_retry(e) => {
                AttemptState::TerminalFailure
            }
            Err(_) => self.state,
        };
    }
}

async fn with_deadline<Fut>(deadline: Option<Instant>, fut: Fut) -> Result<Operation, Status>
where
    Fut: Future<Output = Result<Operation, Status>>,
{
    match deadline {
        Some(at) => tokio::time::timeout_at(at, fut)
            .await
            .unwrap_or_else(|_| Err(Status::deadline_exceeded("operation start timed out"))),
        None => fut.await,
    }
}

#[async_trait]
impl<Req, S, L, F> RetryableCallable for ResumableAttempt<'_, Req, S, L, F>
where
    Req: Sync,
    S: OperationStarter<Req> + ?Sized,
    L: OperationLister + ?Sized,
    F: Fn(&Operation) -> Option<Timestamp> + Send + Sync,
{
    type Output = Operation;

    async fn call(&mut self, attempt: &AttemptSettings) -> Result<Operation, RpcError> {
        self.limiter.acquire(self.call.destination).await;

        let plan = match self.plan().await {
            Ok(plan) => plan,
            Err(e) => {
                let outcome = Err(e);
                self.settle(&outcome, false);
                return outcome;
            }
        };

        let ctx = self.contexts.build_with_timeout(
            self.call.options,
            self.call.resource,
            attempt.rpc_timeout,
        );
        let deadline = ctx.deadline;
        let starter = self.starter;
        let operations = self.operations;
        let request = self.call.request;
        let cancel = self.cancel;

        let resumed = matches!(plan, AttemptPlan::Resume { .. });
        let mode = if resumed { "resume" } else { "fresh" };
        metrics::counter!("spanrpc_lro_attempts_total", "mode" => mode).increment(1);
        tracing::debug!(
            destination = self.call.destination,
            attempt = attempt.attempt,
            mode,
            "issuing operation attempt"
        );

        let issued = match &plan {
            AttemptPlan::StartFresh => starter.start(request, ctx),
            AttemptPlan::Resume { name } => operations.get_operation(name, ctx),
        };

        let waited = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            result = with_deadline(deadline, issued) => Some(result),
        };

        let outcome = match waited {
            None => Err(RpcError::cancelled(
                "interrupted while waiting for the operation to start",
            )),
            Some(result) => result.map_err(RpcError::from),
        };
        self.settle(&outcome, resumed);
        outcome
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Drives resumable calls through the retry helper.
#[derive(Clone)]
pub struct OperationCoordinator {
    limiter: AdministrativeRateLimiter,
    contexts: Arc<CallContextBuilder>,
    clock: Arc<dyn ClockSource>,
    predicate: Arc<dyn RetryPredicate>,
}

impl OperationCoordinator {
    #[must_use]
    pub fn new(limiter: AdministrativeRateLimiter, contexts: Arc<CallContextBuilder>) -> Self {
        Self {
            limiter,
            contexts,
            clock: Arc::new(SystemClock),
            predicate: Arc::new(OperationRetryPolicy),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn ClockSource>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn with_retry_predicate(mut self, predicate: Arc<dyn RetryPredicate>) -> Self {
        self.predicate = predicate;
        self
    }

    #[must_use]
    pub fn limiter(&self) -> &AdministrativeRateLimiter {
        &self.limiter
    }

    /// Prepares the per-attempt callable without running it.
    pub fn attempt<'a, Req, S, L, F>(
        &'a self,
        call: ResumableCall<'a, Req, L, F>,
        starter: &'a S,
        operations: &'a dyn OperationsClient,
        cancel: &'a CancellationToken,
    ) -> ResumableAttempt<'a, Req, S, L, F>
    where
        S: ?Sized,
        L: ?Sized,
    {
        ResumableAttempt {
            call,
            starter,
            operations,
            limiter: &self.limiter,
            contexts: &self.contexts,
            clock: self.clock.as_ref(),
            predicate: self.predicate.as_ref(),
            cancel,
            state: AttemptState::NotStarted,
            resumed: false,
        }
    }

    /// Starts the operation, or on retry resumes the one an earlier attempt
    /// created.
    ///
    /// # Errors
    ///
    /// Returns the first non-retryable error, the last transient error once
    /// `settings` is exhausted, or [`RpcError::Cancelled`].
    pub async fn start_or_resume<Req, S, L, F>(
        &self,
        call: ResumableCall<'_, Req, L, F>,
        starter: &S,
        operations: Arc<dyn OperationsClient>,
        settings: &RetrySettings,
        cancel: &CancellationToken,
    ) -> Result<OperationHandle, RpcError>
    where
        Req: Sync,
        S: OperationStarter<Req> + ?Sized,
        L: OperationLister + ?Sized,
        F: Fn(&Operation) -> Option<Timestamp> + Send + Sync,
    {
        let destination = call.destination.to_string();
        let mut attempt = self.attempt(call, starter, operations.as_ref(), cancel);
        let result = RetryHelper::run_with_retries(
            &mut attempt,
            settings,
            self.predicate.as_ref(),
            self.clock.as_ref(),
            cancel,
        )
        .await;
        let resumed = attempt.resumed;
        drop(attempt);

        match result {
            Ok(operation) => {
                if resumed {
                    metrics::counter!("spanrpc_lro_resumed_total").increment(1);
                }
                Ok(self.track(operation, resumed, &destination, operations))
            }
            Err(e) => {
                tracing::warn!(destination = %destination, error = %e, "operation call failed");
                Err(e)
            }
        }
    }

    /// Wraps an operation known by name in a handle, issuing only reads.
    ///
    /// # Errors
    ///
    /// Returns the transport error of the lookup.
    pub async fn resume(
        &self,
        name: &str,
        destination: &str,
        operations: Arc<dyn OperationsClient>,
        settings: &RetrySettings,
    ) -> Result<OperationHandle, RpcError> {
        self.limiter.acquire(destination).await;
        let ctx = self
            .contexts
            .build_with_timeout(None, name, settings.initial_rpc_timeout);
        let operation = operations.get_operation(name, ctx).await?;
        Ok(self.track(operation, true, destination, operations))
    }

    /// Wraps an already obtained operation snapshot in a handle whose polls
    /// are throttled against `destination`.
    #[must_use]
    pub fn track(
        &self,
        operation: Operation,
        resumed: bool,
        destination: &str,
        operations: Arc<dyn OperationsClient>,
    ) -> OperationHandle {
        let route = PollRoute {
            client: operations,
            limiter: self.limiter.clone(),
            contexts: Arc::clone(&self.contexts),
            destination: destination.to_string(),
        };
        OperationHandle::new(operation, resumed, route)
    }
}

impl fmt::Debug for OperationCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationCoordinator")
            .field("limiter", &self.limiter)
            .field("contexts", &self.contexts)
            .finish_non_exhaustive()
    }
}
