//! Cache-backed asynchronous resolution source.
//!
//! Resolvers ask a [`CachedSource`] for a resource by [`FetchRequest`]. The
//! first request for a key starts one background fetch; until it settles every
//! caller sees [`CacheStatus::Pending`]. Settlement is announced on a broadcast
//! channel so a driver can re-run the pipeline that was waiting on it.
//!
//! [`FetchRequest`]: stepwise_types::FetchRequest

mod cache;
mod fetch;

pub use cache::{CacheStatus, CachedSource};
pub use fetch::{HttpFetcher, JsonFetcher};
