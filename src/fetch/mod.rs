//! Deduplicated, throttled, cancellable reads.
//!
//! `FetchCoordinator::run` is the only path through which resource data
//! reaches the cache. Each attempt carries a `CancelToken`; an attempt whose
//! token was cancelled or superseded never writes its result.

mod coordinator;
mod token;

pub use coordinator::{
  AlwaysReachable, FetchCoordinator, Reachability, RunOptions, RunOutcome, SkipReason,
};
pub use token::CancelToken;
