//! `spanrpc` Core: operations, timestamps, status codes, and call options
//! shared by every client component.

pub mod clock;
pub mod metadata;
pub mod options;
pub mod resource;
pub mod status;
pub mod types;

pub use clock::{ClockSource, ManualClock, SystemClock, Timestamp};
pub use options::CallOptions;
pub use status::{Code, Status};
pub use types::{
    DecodeError, EncodeError, Operation, OperationPage, OperationResult, Payload, TypedMessage,
    Value,
};
