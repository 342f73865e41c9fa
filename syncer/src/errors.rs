//! Error taxonomy of the sync engine.
//!
//! Transient remote failures are the helper's business: they are retried
//! there and never reach the engine. Everything carried by [`SyncError`] is
//! fatal to the sync: a protocol violation, a collaborator failure, or
//! cancellation.

use thiserror::Error;

/// Classification of a [`Helper::block`](crate::sync::Helper::block) failure.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The requested index is no longer on the canonical chain. Handled by
    /// unwinding, not by failing the sync.
    #[error("orphan head")]
    OrphanHead,

    /// Anything else kills the pipeline.
    #[error(transparent)]
    Fatal(#[from] eyre::Report),
}

/// Fatal sync failure, returned by [`Syncer::sync`](crate::Syncer::sync).
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("unable to set sync start index")]
    SetStartIndex(#[source] eyre::Report),

    #[error("unable to get network status")]
    GetNetworkStatus(#[source] eyre::Report),

    #[error("unable to get current head block identifier")]
    GetCurrentHeadBlock,

    #[error("unable to get next syncable range")]
    NextSyncableRange(#[source] Box<SyncError>),

    #[error("unable to fetch block {index}")]
    FetchBlock {
        index: i64,
        #[source]
        source: eyre::Report,
    },

    #[error("unable to fetch block {index} during re-org")]
    FetchBlockReorg {
        index: i64,
        #[source]
        source: eyre::Report,
    },

    #[error("unable to process block")]
    BlockProcess(#[source] Box<SyncError>),

    #[error("out of order: got block {got} instead of {expected}")]
    OutOfOrder { got: i64, expected: i64 },

    #[error("cannot remove genesis block")]
    CannotRemoveGenesis,

    #[error("block result is nil")]
    BlockResultNil,

    #[error("handler failed")]
    Handler(#[source] eyre::Report),

    #[error("sync worker task failed")]
    Worker(#[source] tokio::task::JoinError),

    #[error("sync canceled")]
    Canceled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_order_names_both_indices() {
        let err = SyncError::OutOfOrder { got: 5, expected: 3 };
        assert_eq!(err.to_string(), "out of order: got block 5 instead of 3");
    }

    #[test]
    fn process_failure_keeps_the_cause_chained() {
        let err = SyncError::BlockProcess(Box::new(SyncError::CannotRemoveGenesis));
        assert_eq!(err.to_string(), "unable to process block");

        let source = std::error::Error::source(&err).expect("source");
        assert_eq!(source.to_string(), "cannot remove genesis block");
    }

    #[test]
    fn orphan_head_is_not_fatal_shaped() {
        assert_eq!(FetchError::OrphanHead.to_string(), "orphan head");

        let fatal = FetchError::from(eyre::eyre!("connection reset"));
        assert_eq!(fatal.to_string(), "connection reset");
    }
}
