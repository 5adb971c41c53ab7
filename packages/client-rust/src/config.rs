//! Process-wide configuration for the RPC resilience layer.

use std::num::NonZeroU32;
use std::time::Duration;

/// Environment variable overriding the stream wait and idle timeouts, in seconds.
pub const ENV_WATCHDOG_TIMEOUT_SECONDS: &str = "SPANRPC_WATCHDOG_TIMEOUT_SECONDS";
/// Environment variable overriding the watchdog check interval, in seconds.
pub const ENV_WATCHDOG_PERIOD_SECONDS: &str = "SPANRPC_WATCHDOG_PERIOD_SECONDS";

const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const DEFAULT_WATCHDOG_PERIOD: Duration = Duration::from_secs(10);

/// Top-level configuration.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Project the client is bound to; administrative throttling is keyed on
    /// the derived `projects/{id}` name.
    pub project_id: String,
    /// Administrative request throttling.
    pub throttle: ThrottleConfig,
    /// Stream-level timeouts enforced by the watchdog.
    pub stream: StreamConfig,
    /// Worker pool sizing and shutdown bounds.
    pub executor: ExecutorConfig,
    /// Process-wide identification headers attached to every call.
    pub client_headers: Vec<(String, String)>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            throttle: ThrottleConfig::default(),
            stream: StreamConfig::default(),
            executor: ExecutorConfig::default(),
            client_headers: vec![(
                "x-goog-api-client".to_string(),
                concat!("spanrpc/", env!("CARGO_PKG_VERSION")).to_string(),
            )],
        }
    }
}

impl RpcConfig {
    /// Default configuration for `project_id`, with environment overrides applied.
    #[must_use]
    pub fn for_project(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            ..Self::default()
        }
        .with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Applies the watchdog overrides looked up through `lookup`.
    ///
    /// Values that are not whole seconds are logged and ignored.
    #[must_use]
    pub fn with_env_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(timeout) = seconds_override(&lookup, ENV_WATCHDOG_TIMEOUT_SECONDS) {
            self.stream.wait_timeout = timeout;
            self.stream.idle_timeout = timeout;
        }
        if let Some(period) = seconds_override(&lookup, ENV_WATCHDOG_PERIOD_SECONDS) {
            self.stream.check_interval = period;
        }
        self
    }
}

fn seconds_override(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<Duration> {
    let raw = lookup(key)?;
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match raw.parse::<u64>() {
        Ok(secs) => Some(Duration::from_secs(secs)),
        Err(e) => {
            tracing::warn!(key, value = raw, error = %e, "ignoring invalid override");
            None
        }
    }
}

/// Administrative throttling settings.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    /// Whether administrative calls are throttled at all.
    pub enabled: bool,
    /// Steady admission rate per destination.
    pub requests_per_second: NonZeroU32,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_second: NonZeroU32::MIN,
        }
    }
}

/// Stream-level timeouts. A zero duration disables the corresponding check.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Longest wait for a requested message.
    pub wait_timeout: Duration,
    /// Longest stretch without outstanding demand or activity.
    pub idle_timeout: Duration,
    /// How often the watchdog inspects registered streams.
    pub check_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            wait_timeout: DEFAULT_WATCHDOG_TIMEOUT,
            idle_timeout: DEFAULT_WATCHDOG_TIMEOUT,
            check_interval: DEFAULT_WATCHDOG_PERIOD,
        }
    }
}

/// Worker pool settings.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Lower bound on worker threads per pool; the host's parallelism wins if larger.
    pub min_worker_threads: usize,
    /// Ceiling on the wait for each pool to terminate during shutdown.
    pub termination_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            min_worker_threads: 16,
            termination_timeout: Duration::from_secs(10),
        }
    }
}
