//! Deadline middleware for administrative calls.
//!
//! Fails calls that outlive their context's deadline with `DEADLINE_EXCEEDED`.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use spanrpc_core::Status;
use tokio::time::Instant;
use tower::{Layer, Service};

use super::AdminCall;
use crate::error::RpcError;

// ---------------------------------------------------------------------------
// DeadlineLayer
// ---------------------------------------------------------------------------

/// Tower layer enforcing each call's deadline.
///
/// A call's `timeout` starts counting here, after throttling. Calls with
/// neither a timeout nor a context deadline run unbounded, as do calls whose
/// timeout is too large to represent as an instant.
#[derive(Debug, Clone)]
pub struct DeadlineLayer;

impl<S> Layer<S> for DeadlineLayer {
    type Service = DeadlineService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        DeadlineService { inner }
    }
}

// ---------------------------------------------------------------------------
// DeadlineService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DeadlineService<S> {
    inner: S,
}

impl<S, R> Service<AdminCall<R>> for DeadlineService<S>
where
    S: Service<AdminCall<R>, Error = RpcError> + Send,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = RpcError;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, RpcError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut call: AdminCall<R>) -> Self::Future {
        if let Some(timeout) = call.timeout {
            call.context.deadline = Instant::now().checked_add(timeout);
        }
        let deadline = call.context.deadline;
        let method = call.method;
        let fut = self.inner.call(call);
        Box::pin(async move {
            let Some(at) = deadline else {
                return fut.await;
            };
            match tokio::time::timeout_at(at, fut).await {
                Ok(result) => result,
                Err(_elapsed) => Err(Status::deadline_exceeded(format!(
                    "{method} exceeded its deadline"
                ))
                .into()),
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use spanrpc_core::Code;
    use tower::ServiceExt;

    use super::*;
    use crate::config::RpcConfig;
    use crate::context::CallContextBuilder;

    /// Service that takes a configurable delay before responding.
    struct SlowService {
        delay: Duration,
    }

    impl Service<AdminCall<()>> for SlowService {
        type Response = ();
        type Error = RpcError;
        type Future = Pin<Box<dyn Future<Output = Result<(), RpcError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _call: AdminCall<()>) -> Self::Future {
            let delay = self.delay;
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                Ok(())
            })
        }
    }

    fn make_call(timeout: Option<Duration>) -> AdminCall<()> {
        AdminCall {
            method: "get_operation",
            destination: "projects/p".to_string(),
            context: CallContextBuilder::new(&RpcConfig::default()).build(None, "projects/p"),
            timeout,
            request: (),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn completes_within_deadline() {
        let svc = DeadlineLayer.layer(SlowService {
            delay: Duration::from_millis(10),
        });
        svc.oneshot(make_call(Some(Duration::from_secs(1))))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn exceeding_deadline_is_deadline_exceeded() {
        let svc = DeadlineLayer.layer(SlowService {
            delay: Duration::from_secs(5),
        });
        let err = svc
            .oneshot(make_call(Some(Duration::from_millis(50))))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(Code::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn context_deadline_applies_without_timeout() {
        let svc = DeadlineLayer.layer(SlowService {
            delay: Duration::from_secs(5),
        });
        let mut call = make_call(None);
        call.context = CallContextBuilder::new(&RpcConfig::default()).build_with_timeout(
            None,
            "projects/p",
            Duration::from_millis(50),
        );
        let err = svc.oneshot(call).await.unwrap_err();
        assert_eq!(err.code(), Some(Code::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn maximal_timeout_runs_unbounded() {
        let svc = DeadlineLayer.layer(SlowService {
            delay: Duration::from_secs(60),
        });
        svc.oneshot(make_call(Some(Duration::MAX))).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn no_deadline_waits_for_completion() {
        let svc = DeadlineLayer.layer(SlowService {
            delay: Duration::from_secs(60),
        });
        svc.oneshot(make_call(None)).await.unwrap();
    }
}
