pub mod batch;
pub mod classify;
pub mod context;
pub mod dispatch;
pub mod extended;
pub mod reconcile;
pub mod retry;
pub mod version;

pub use context::{RequestContext, RetryState, TimeBudget};
pub use dispatch::{AttemptError, Dispatcher, RetryReason};
pub use retry::run_with_retry;
