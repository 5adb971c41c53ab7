//! Flow-controlled server streams under watchdog supervision.

use crate::lifecycle::{StreamTimeout, WatchedStream};
use crate::transport::StreamingCall;

/// A transport stream paired with its watchdog registration.
///
/// The consumer requests every batch explicitly; nothing is delivered
/// eagerly. Demand and arrivals are mirrored into the watchdog so stalled
/// or abandoned streams get cancelled.
#[derive(Debug)]
pub struct FlowControlledCall<C> {
    call: C,
    watch: WatchedStream,
}

impl<C: StreamingCall> FlowControlledCall<C> {
    #[must_use]
    pub fn new(call: C, watch: WatchedStream) -> Self {
        Self { call, watch }
    }

    /// Asks for `n` more messages.
    pub fn request(&self, n: usize) {
        self.watch.request(n);
        self.call.request(n);
    }

    /// Must be called for each message the consumer receives.
    pub fn on_message(&self) {
        self.watch.on_message();
    }

    pub fn cancel(&self, message: &str) {
        self.watch.cancel();
        self.call.cancel(message);
    }

    #[must_use]
    pub fn watch(&self) -> &WatchedStream {
        &self.watch
    }

    /// Resolves when the stream is cancelled and forwards a watchdog timeout
    /// to the transport call. Run it alongside the consumer.
    pub async fn supervise(&self) {
        self.watch.cancelled().await;
        match self.watch.timed_out() {
            Some(StreamTimeout::Wait) => self.call.cancel("timed out waiting for next message"),
            Some(StreamTimeout::Idle) => self.call.cancel("stream idle for too long"),
            None => {}
        }
    }
}
