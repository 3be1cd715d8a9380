#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Asynchronous, per-key task deduplication and memoization.
//!
//! [`Cache`] guarantees that at most one execution of a given key's producer
//! is in flight at a time, that every concurrent and subsequent subscriber
//! to that key observes the same outcome, and that a successful outcome is
//! memoized until a forced re-run or an explicit shutdown. It is a generic
//! in-process coordination primitive: the cache has no knowledge of what a
//! key identifies or what a producer does. A typical key is a content
//! digest and a typical producer is a network fetch or upload against a
//! remote cache — this crate knows about neither.
//!
//! Out of scope, by design: persisting results across process restarts,
//! bounded capacity or eviction (the cache grows until cleared or replaced),
//! fairness between waiters, and cross-process coordination.

mod cache;
mod error;
mod termination;

pub use cache::{Cache, SignalCache, TaskHandle};
pub use error::CacheError;
pub use termination::TerminationWaiter;
