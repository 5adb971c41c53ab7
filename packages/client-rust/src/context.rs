//! Per-attempt invocation context assembly.
//!
//! An [`InvocationContext`] is built fresh for every RPC attempt, including
//! each retry of the same logical call: deadlines are relative to "now" and
//! credentials may rotate between attempts.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use spanrpc_core::{resource, CallOptions};
use tokio::time::Instant;

use crate::config::RpcConfig;

/// Header carrying the routing prefix of the addressed resource.
pub const RESOURCE_PREFIX_HEADER: &str = "google-cloud-resource-prefix";

/// Per-call credentials overriding the channel's default credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct CallCredentials {
    authorization: String,
}

impl CallCredentials {
    #[must_use]
    pub fn bearer(token: impl AsRef<str>) -> Self {
        Self {
            authorization: format!("Bearer {}", token.as_ref()),
        }
    }

    /// The value to send in the `authorization` header.
    #[must_use]
    pub fn authorization(&self) -> &str {
        &self.authorization
    }
}

impl fmt::Debug for CallCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallCredentials")
            .field("authorization", &"<redacted>")
            .finish()
    }
}

/// Source of per-call credentials. Returning `None` keeps the channel default.
pub trait CallCredentialsProvider: Send + Sync {
    fn call_credentials(&self) -> Option<CallCredentials>;
}

/// Fully assembled parameters for exactly one RPC attempt.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    pub deadline: Option<Instant>,
    pub channel_affinity: Option<i32>,
    pub headers: HeaderMap,
    pub credentials: Option<CallCredentials>,
    pub stream_wait_timeout: Duration,
    pub stream_idle_timeout: Duration,
}

impl InvocationContext {
    /// Time left before the deadline, saturating at zero.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Overrides the stream wait timeout for this call only.
    #[must_use]
    pub fn with_stream_wait_timeout(mut self, timeout: Duration) -> Self {
        self.stream_wait_timeout = timeout;
        self
    }
}

/// Builds [`InvocationContext`]s from per-call options and process defaults.
#[derive(Clone)]
pub struct CallContextBuilder {
    project_name: String,
    base_headers: HeaderMap,
    credentials: Option<Arc<dyn CallCredentialsProvider>>,
    stream_wait_timeout: Duration,
    stream_idle_timeout: Duration,
}

impl CallContextBuilder {
    #[must_use]
    pub fn new(config: &RpcConfig) -> Self {
        let mut base_headers = HeaderMap::new();
        for (name, value) in &config.client_headers {
            match (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                (Ok(name), Ok(value)) => {
                    base_headers.append(name, value);
                }
                _ => tracing::warn!(header = %name, "skipping invalid client header"),
            }
        }
        Self {
            project_name: resource::project_name(&config.project_id),
            base_headers,
            credentials: None,
            stream_wait_timeout: config.stream.wait_timeout,
            stream_idle_timeout: config.stream.idle_timeout,
        }
    }

    #[must_use]
    pub fn with_credentials_provider(mut self, provider: Arc<dyn CallCredentialsProvider>) -> Self {
        self.credentials = Some(provider);
        self
    }

    #[must_use]
    pub fn project_name(&self) -> &str {
        &self.project_name
    }

    /// Builds a context with no deadline.
    #[must_use]
    pub fn build(&self, options: Option<&CallOptions>, resource: &str) -> InvocationContext {
        let channel_affinity = options.and_then(CallOptions::channel_hint).map(|hint| {
            // Channel hints are pool indices; only the low 32 bits matter.
            #[allow(clippy::cast_possible_truncation)]
            let narrowed = hint as i32;
            narrowed
        });

        let mut headers = self.base_headers.clone();
        let prefix = resource::routing_prefix(resource).unwrap_or(&self.project_name);
        match HeaderValue::try_from(prefix) {
            Ok(value) => {
                headers.insert(RESOURCE_PREFIX_HEADER, value);
            }
            Err(_) => tracing::debug!(resource, "resource prefix is not a valid header value"),
        }

        let credentials = self
            .credentials
            .as_ref()
            .and_then(|provider| provider.call_credentials());

        InvocationContext {
            deadline: None,
            channel_affinity,
            headers,
            credentials,
            stream_wait_timeout: self.stream_wait_timeout,
            stream_idle_timeout: self.stream_idle_timeout,
        }
    }

    /// Builds a context whose deadline is `timeout` from now. A timeout too
    /// large to represent leaves the context without a deadline.
    #[must_use]
    pub fn build_with_timeout(
        &self,
        options: Option<&CallOptions>,
        resource: &str,
        timeout: Duration,
    ) -> InvocationContext {
        let mut ctx = self.build(options, resource);
        ctx.deadline = Instant::now().checked_add(timeout);
        ctx
    }
}

impl fmt::Debug for CallContextBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContextBuilder")
            .field("project_name", &self.project_name)
            .field("base_headers", &self.base_headers.len())
            .field("has_credentials_provider", &self.credentials.is_some())
            .finish_non_exhaustive()
    }
}
