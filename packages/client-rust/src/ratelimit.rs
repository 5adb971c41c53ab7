//! Per-destination throttling of administrative calls.
//!
//! The [`RateLimiterRegistry`] is a process-scoped service object: every
//! client addressing the same destination must be handed the same registry so
//! the throttle holds process-wide. Entries are created lazily with an atomic
//! insert-if-absent and are never removed.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};

use crate::config::ThrottleConfig;

/// Registry of token-bucket limiters keyed by destination (e.g. `projects/p`).
pub struct RateLimiterRegistry {
    quota: Quota,
    limiters: DashMap<String, Arc<DefaultDirectRateLimiter>>,
}

impl RateLimiterRegistry {
    /// Creates an empty registry whose limiters admit `config.requests_per_second`
    /// with a burst of one.
    #[must_use]
    pub fn new(config: &ThrottleConfig) -> Self {
        Self {
            quota: Quota::per_second(config.requests_per_second).allow_burst(NonZeroU32::MIN),
            limiters: DashMap::new(),
        }
    }

    /// Returns the limiter for `destination`, installing it on first use.
    ///
    /// Concurrent first lookups race to a single winner; every caller gets
    /// the same `Arc`.
    pub fn limiter(&self, destination: &str) -> Arc<DefaultDirectRateLimiter> {
        if let Some(existing) = self.limiters.get(destination) {
            return Arc::clone(existing.value());
        }
        let entry = self
            .limiters
            .entry(destination.to_string())
            .or_insert_with(|| {
                tracing::debug!(destination, "installing administrative rate limiter");
                Arc::new(RateLimiter::direct(self.quota))
            });
        Arc::clone(entry.value())
    }

    /// Number of destinations with an installed limiter.
    #[must_use]
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}

impl std::fmt::Debug for RateLimiterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiterRegistry")
            .field("quota", &self.quota)
            .field("destinations", &self.limiters.len())
            .finish()
    }
}

/// A client's view of the shared registry.
///
/// Throttling is opt-in per client: a disabled limiter admits everything
/// without touching the registry.
#[derive(Debug, Clone)]
pub struct AdministrativeRateLimiter {
    registry: Arc<RateLimiterRegistry>,
    enabled: bool,
}

impl AdministrativeRateLimiter {
    #[must_use]
    pub fn new(registry: Arc<RateLimiterRegistry>, enabled: bool) -> Self {
        Self { registry, enabled }
    }

    /// A limiter that never waits.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(
            Arc::new(RateLimiterRegistry::new(&ThrottleConfig::default())),
            false,
        )
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<RateLimiterRegistry> {
        &self.registry
    }

    /// Waits until a token for `destination` is available. Never fails.
    pub async fn acquire(&self, destination: &str) {
        if !self.enabled {
            return;
        }
        let limiter = self.registry.limiter(destination);
        if limiter.check().is_ok() {
            return;
        }
        let started = Instant::now();
        limiter.until_ready().await;
        let waited = started.elapsed();
        metrics::counter!("spanrpc_admin_requests_throttled_total").increment(1);
        metrics::histogram!("spanrpc_admin_throttle_wait_seconds").record(waited.as_secs_f64());
        tracing::debug!(
            destination,
            waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
            "administrative request throttled"
        );
    }
}
