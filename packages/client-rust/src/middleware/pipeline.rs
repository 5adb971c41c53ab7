//! Pipeline composition: wraps a transport call in the admin middleware stack.

use tower::ServiceBuilder;

use super::deadline::{DeadlineLayer, DeadlineService};
use super::metrics::{MetricsLayer, MetricsService};
use super::throttle::{ThrottleLayer, ThrottleService};
use super::AdminCall;
use crate::error::RpcError;
use crate::ratelimit::AdministrativeRateLimiter;

/// Wraps `inner` with the admin middleware.
///
/// Layer order (outermost to innermost):
/// 1. `ThrottleLayer` -- wait for the destination's token before anything else
/// 2. `DeadlineLayer` -- bound the call by its context deadline
/// 3. `MetricsLayer` -- record timing and outcome closest to the transport
///
/// Returns the concrete stack; its future is boxed and `Send`.
pub fn build_admin_pipeline<S, R>(
    inner: S,
    limiter: AdministrativeRateLimiter,
) -> ThrottleService<DeadlineService<MetricsService<S>>>
where
    S: tower::Service<AdminCall<R>, Error = RpcError> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    R: Send + 'static,
{
    ServiceBuilder::new()
        .layer(ThrottleLayer::new(limiter))
        .layer(DeadlineLayer)
        .layer(MetricsLayer)
        .service(inner)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
