use spanrpc_core::{Code, Status};

/// Errors surfaced by the client.
///
/// `Rpc` keeps the transport's classification intact; `Cancelled` is reserved
/// for local interrupts so callers can tell "we gave up" from "the server
/// rejected us".
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("rpc failed: {0}")]
    Rpc(#[from] Status),
    #[error("cancelled: {reason}")]
    Cancelled { reason: String },
    #[error("rpc client is closed")]
    Closed,
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RpcError {
    #[must_use]
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::Cancelled {
            reason: reason.into(),
        }
    }

    /// The transport status code, if this error came from the transport.
    #[must_use]
    pub fn code(&self) -> Option<Code> {
        match self {
            Self::Rpc(status) => Some(status.code),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}
