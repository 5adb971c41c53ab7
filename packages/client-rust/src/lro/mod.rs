//! Long-running operation support: start-or-resume coordination, selection of
//! the operation to resume, and the handle callers wait on.

pub mod coordinator;
pub mod handle;
pub mod selector;

pub use coordinator::{
    AttemptPlan, AttemptState, OperationCoordinator, ResumableAttempt, ResumableCall,
};
pub use handle::{OperationHandle, PollSettings};
pub use selector::{most_recent_operation, MostRecentSelector};
