//! Tower middleware for unary administrative calls.
//!
//! Every admin call travels as an [`AdminCall`] through
//! throttle -> deadline -> metrics before reaching the transport.

pub mod deadline;
pub mod metrics;
pub mod pipeline;
pub mod throttle;

use std::time::Duration;

use crate::context::InvocationContext;

pub use deadline::{DeadlineLayer, DeadlineService};
pub use metrics::{MetricsLayer, MetricsService};
pub use pipeline::build_admin_pipeline;
pub use throttle::{ThrottleLayer, ThrottleService};

/// One unary administrative request plus everything needed to route it.
#[derive(Debug, Clone)]
pub struct AdminCall<R> {
    /// Method name, for logs and metrics.
    pub method: &'static str,
    /// Rate-limiter key.
    pub destination: String,
    pub context: InvocationContext,
    /// Deadline measured from when the call clears the throttle; overrides
    /// any deadline already on the context.
    pub timeout: Option<Duration>,
    pub request: R,
}
