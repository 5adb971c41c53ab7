//! `spanrpc` Client: administrative throttling, long-running operation
//! resumption, per-call invocation contexts, and executor lifecycle.

pub mod admin;
pub mod config;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod lro;
pub mod middleware;
pub mod ratelimit;
pub mod retry;
pub mod stream;
pub mod transport;

pub use admin::AdminClient;
pub use config::{ExecutorConfig, RpcConfig, StreamConfig, ThrottleConfig};
pub use context::{CallContextBuilder, CallCredentials, CallCredentialsProvider, InvocationContext};
pub use error::RpcError;
pub use lifecycle::{LifecycleState, ResourceLifecycleManager};
pub use lro::{OperationCoordinator, OperationHandle, PollSettings, ResumableCall};
pub use ratelimit::{AdministrativeRateLimiter, RateLimiterRegistry};
pub use retry::{RetryHelper, RetrySettings};
pub use stream::FlowControlledCall;
pub use transport::{DatabaseAdminTransport, OperationLister, OperationStarter, OperationsClient};
