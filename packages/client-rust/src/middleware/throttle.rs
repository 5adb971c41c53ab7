//! Throttle middleware for administrative calls.
//!
//! Waits for the destination's rate-limiter token before passing the call on.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tower::{Layer, Service};

use super::AdminCall;
use crate::error::RpcError;
use crate::ratelimit::AdministrativeRateLimiter;

// ---------------------------------------------------------------------------
// ThrottleLayer
// ---------------------------------------------------------------------------

/// Tower layer that admits calls through an [`AdministrativeRateLimiter`].
#[derive(Debug, Clone)]
pub struct ThrottleLayer {
    limiter: AdministrativeRateLimiter,
}

impl ThrottleLayer {
    #[must_use]
    pub fn new(limiter: AdministrativeRateLimiter) -> Self {
        Self { limiter }
    }
}

impl<S> Layer<S> for ThrottleLayer {
    type Service = ThrottleService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ThrottleService {
            inner,
            limiter: self.limiter.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// ThrottleService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ThrottleService<S> {
    inner: S,
    limiter: AdministrativeRateLimiter,
}

impl<S, R> Service<AdminCall<R>> for ThrottleService<S>
where
    S: Service<AdminCall<R>, Error = RpcError> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    R: Send + 'static,
{
    type Response = S::Response;
    type Error = RpcError;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, RpcError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, call: AdminCall<R>) -> Self::Future {
        // The readied service goes into the future; a fresh clone stays behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let limiter = self.limiter.clone();
        Box::pin(async move {
            limiter.acquire(&call.destination).await;
            inner.call(call).await
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
