//! Sync engine: range driver, reorg state machine, and the fetch pipeline.

mod pipeline;

use crate::chain::{PastBlocks, DEFAULT_PAST_BLOCKS};
use crate::concurrency::{
    ConcurrencyTuner, DEFAULT_CACHE_SIZE, DEFAULT_CONCURRENCY, DEFAULT_MAX_CONCURRENCY,
    DEFAULT_SIZE_MULTIPLIER,
};
use crate::errors::{FetchError, SyncError};
use crate::types::{Block, BlockIdentifier, BlockResult, NetworkIdentifier, NetworkStatus};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Sleep between tip polls once the syncer has caught up.
const SYNC_SLEEP: Duration = Duration::from_secs(2);

/// Receives sync lifecycle callbacks, strictly serialized and in canonical
/// order. Storage, reconciliation and logging live behind this seam.
#[async_trait]
pub trait Handler: Send + Sync {
    /// A block was confirmed at the head of the canonical chain.
    async fn block_added(&self, block: &Block) -> eyre::Result<()>;

    /// A previously added block was orphaned. Called tail first during
    /// unwinds, interleaving freely with `block_added` but never
    /// concurrently with it.
    async fn block_removed(&self, block: &BlockIdentifier) -> eyre::Result<()>;
}

/// Answers questions about the remote chain. Implementations own transport,
/// retries and backoff; only failures that should kill the sync escape.
#[async_trait]
pub trait Helper: Send + Sync {
    async fn network_status(&self, network: &NetworkIdentifier) -> eyre::Result<NetworkStatus>;

    /// Fetch one block by index. `Ok(None)` means the node omitted the
    /// index; [`FetchError::OrphanHead`] means the index is no longer on the
    /// canonical chain.
    async fn block(
        &self,
        network: &NetworkIdentifier,
        index: i64,
    ) -> Result<Option<Block>, FetchError>;
}

/// Tuning knobs for [`Syncer`]. Defaults suit a well-provisioned host; the
/// cache presets in [`crate::concurrency`] cover smaller ones.
#[derive(Debug, Clone)]
pub struct SyncerConfig {
    /// Byte budget for in-flight fetched blocks.
    pub cache_size: usize,
    /// Pads the observed max block size to account for processing overhead.
    pub size_multiplier: f64,
    /// Fetchers at range start.
    pub initial_concurrency: i64,
    /// Hard ceiling for the fetcher pool.
    pub max_concurrency: i64,
    /// Identifier window preloaded for reorg-aware resume.
    pub past_blocks: Vec<BlockIdentifier>,
    /// Capacity of the identifier window.
    pub past_block_limit: usize,
}

impl Default for SyncerConfig {
    fn default() -> Self {
        Self {
            cache_size: DEFAULT_CACHE_SIZE,
            size_multiplier: DEFAULT_SIZE_MULTIPLIER,
            initial_concurrency: DEFAULT_CONCURRENCY,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            past_blocks: Vec::new(),
            past_block_limit: DEFAULT_PAST_BLOCKS,
        }
    }
}

/// Coordinates blockchain syncing without owning storage: every accepted or
/// orphaned block is reported through the [`Handler`], and all chain access
/// goes through the [`Helper`].
pub struct Syncer<H, T> {
    network: NetworkIdentifier,
    helper: Arc<H>,
    handler: Arc<T>,
    cancel: CancellationToken,

    genesis: Option<BlockIdentifier>,
    next_index: i64,
    // The window persists across ranges within one sync call so a reorg
    // spanning a range boundary is still detectable.
    past_blocks: PastBlocks,

    tuner: Arc<ConcurrencyTuner>,
    initial_concurrency: i64,
    max_concurrency: i64,
}

impl<H, T> Syncer<H, T>
where
    H: Helper + 'static,
    T: Handler + 'static,
{
    /// The token doubles as input and output: cancel it to stop the sync,
    /// and the sync cancels it when it returns so collaborators wound around
    /// the same token shut down together.
    pub fn new(
        network: NetworkIdentifier,
        helper: Arc<H>,
        handler: Arc<T>,
        cancel: CancellationToken,
        config: SyncerConfig,
    ) -> Self {
        let tuner = Arc::new(ConcurrencyTuner::new(
            config.cache_size,
            config.size_multiplier,
            config.max_concurrency,
        ));
        Self {
            network,
            helper,
            handler,
            cancel,
            genesis: None,
            next_index: 0,
            past_blocks: PastBlocks::preloaded(config.past_blocks, config.past_block_limit),
            tuner,
            initial_concurrency: config.initial_concurrency.max(1),
            max_concurrency: config.max_concurrency.max(1),
        }
    }

    /// Sync every index in `[start_index, end_index]`. A `start_index` of
    /// `-1` resumes from genesis; an `end_index` of `-1` follows the tip
    /// forever.
    pub async fn sync(&mut self, start_index: i64, end_index: i64) -> Result<(), SyncError> {
        let result = self.sync_inner(start_index, end_index).await;
        self.cancel.cancel();
        result
    }

    async fn sync_inner(&mut self, start_index: i64, end_index: i64) -> Result<(), SyncError> {
        self.set_start(start_index)
            .await
            .map_err(SyncError::SetStartIndex)?;

        loop {
            let range_end = match self
                .next_syncable_range(end_index)
                .await
                .map_err(|err| SyncError::NextSyncableRange(Box::new(err)))?
            {
                Some(range_end) => range_end,
                None => {
                    if end_index != -1 && self.next_index > end_index {
                        break;
                    }
                    // At tip with no bound: wait for the chain to grow.
                    tokio::select! {
                        () = sleep(SYNC_SLEEP) => continue,
                        () = self.cancel.cancelled() => return Err(SyncError::Canceled),
                    }
                }
            };

            if self.next_index != range_end {
                info!(start = self.next_index, end = range_end, "syncing range");
            } else {
                info!(index = self.next_index, "syncing block");
            }

            self.sync_range(range_end).await?;

            if self.cancel.is_cancelled() {
                return Err(SyncError::Canceled);
            }
        }

        let start = match (start_index, self.genesis.as_ref()) {
            (-1, Some(genesis)) => genesis.index,
            _ => start_index,
        };
        info!(start, end = end_index, "finished syncing");
        Ok(())
    }

    async fn set_start(&mut self, index: i64) -> eyre::Result<()> {
        let status = self.helper.network_status(&self.network).await?;
        self.next_index = if index != -1 {
            index
        } else {
            status.genesis_block_identifier.index
        };
        self.genesis = Some(status.genesis_block_identifier);
        Ok(())
    }

    /// Next inclusive range end to sync, or `None` when there is nothing to
    /// do right now.
    async fn next_syncable_range(&mut self, end_index: i64) -> Result<Option<i64>, SyncError> {
        if self.next_index == -1 {
            return Err(SyncError::GetCurrentHeadBlock);
        }

        // Re-read the status every cycle so the range never runs past tip.
        let status = self
            .helper
            .network_status(&self.network)
            .await
            .map_err(SyncError::GetNetworkStatus)?;

        let tip = status.current_block_identifier.index;
        let range_end = if end_index == -1 || end_index > tip {
            tip
        } else {
            end_index
        };

        if self.next_index > range_end {
            return Ok(None);
        }
        Ok(Some(range_end))
    }

    /// Apply one fetched result to the chain state. This is the only place
    /// `next_index` and the window change.
    async fn process_block(&mut self, result: BlockResult) -> Result<(), SyncError> {
        let BlockResult {
            block, orphan_head, ..
        } = result;

        if orphan_head {
            // The node no longer has this index on its canonical chain:
            // unwind one block and retry from its slot.
            return self.orphan_head_block().await;
        }

        let Some(block) = block else {
            // Omitted index: advance without a handler call.
            self.next_index += 1;
            return Ok(());
        };

        if let Some(last) = self.past_blocks.tail() {
            if block.block_identifier.index != self.next_index {
                return Err(SyncError::OutOfOrder {
                    got: block.block_identifier.index,
                    expected: self.next_index,
                });
            }
            if block.parent_block_identifier != *last {
                // Does not chain onto the accepted head: reorg.
                return self.orphan_head_block().await;
            }
        }

        self.handler
            .block_added(&block)
            .await
            .map_err(SyncError::Handler)?;
        self.next_index = block.block_identifier.index + 1;
        self.past_blocks.push(block.block_identifier);
        Ok(())
    }

    /// Remove the most recently accepted block and rewind `next_index` to
    /// its slot so it is refetched from the new chain.
    async fn orphan_head_block(&mut self) -> Result<(), SyncError> {
        let last = match self.past_blocks.tail() {
            Some(last) if Some(last) == self.genesis.as_ref() => {
                return Err(SyncError::CannotRemoveGenesis);
            }
            Some(last) => last.clone(),
            // Nothing left to unwind into.
            None => return Err(SyncError::CannotRemoveGenesis),
        };

        self.handler
            .block_removed(&last)
            .await
            .map_err(SyncError::Handler)?;
        self.past_blocks.pop();
        self.next_index = last.index;
        Ok(())
    }
}
