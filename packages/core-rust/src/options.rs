use std::collections::BTreeMap;

use crate::types::Value;

/// Caller-supplied tuning for a single invocation.
///
/// Built once and then only read; the call-context builder consumes it when
/// assembling the invocation context.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallOptions {
    channel_hint: Option<i64>,
    extra: BTreeMap<String, Value>,
}

impl CallOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pins the call to a pooled channel for locality.
    #[must_use]
    pub fn with_channel_hint(mut self, hint: i64) -> Self {
        self.channel_hint = Some(hint);
        self
    }

    /// Sets an arbitrary named option.
    #[must_use]
    pub fn with_option(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    #[must_use]
    pub fn channel_hint(&self) -> Option<i64> {
        self.channel_hint
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    pub fn options(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.extra.iter().map(|(k, v)| (k.as_str(), v))
    }
}
