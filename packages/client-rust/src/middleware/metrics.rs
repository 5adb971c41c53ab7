//! Metrics middleware for administrative calls.
//!
//! Records call duration and outcome in a `tracing` span and in `metrics`
//! histograms and counters.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use super::AdminCall;
use crate::error::RpcError;

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S, R> Service<AdminCall<R>> for MetricsService<S>
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

    fn call(&mut self, call: AdminCall<R>) -> Self::Future {
        let method = call.method;
        let span = info_span!(
            "admin_call",
            method,
            destination = %call.destination,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(call);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let elapsed = start.elapsed();

                let outcome = match &result {
                    Ok(_) => "ok",
                    Err(RpcError::Rpc(status)) => status.code.as_str(),
                    Err(RpcError::Cancelled { .. }) => "cancelled",
                    Err(RpcError::Closed) => "closed",
                    Err(RpcError::Internal(_)) => "internal",
                };

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);

                metrics::histogram!("spanrpc_admin_call_duration_seconds", "method" => method)
                    .record(elapsed.as_secs_f64());
                metrics::counter!("spanrpc_admin_calls_total", "method" => method, "outcome" => outcome)
                    .increment(1);
                tracing::debug!(method, duration_ms, outcome, "admin call complete");

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
