//! Concurrent blockchain synchronization engine.
//!
//! Fetches blocks from a remote chain in parallel, delivers them to a
//! consumer-supplied [`Handler`] strictly in canonical order, unwinds
//! reorganizations through a bounded window of accepted identifiers, and
//! adapts fetch concurrency to a configurable memory budget.
//!
//! The engine owns no storage and no transport: the chain is read through a
//! [`Helper`] and every accepted or orphaned block is reported through a
//! [`Handler`]. Retries and backoff of individual remote calls belong to the
//! helper; only fatal failures reach the engine.

pub mod chain;
pub mod concurrency;
mod errors;
pub mod sync;
pub mod types;

#[cfg(test)]
mod test_utils;

pub use errors::{FetchError, SyncError};
pub use sync::{Handler, Helper, Syncer, SyncerConfig};
pub use types::{Block, BlockIdentifier, BlockResult, NetworkIdentifier, NetworkStatus};
