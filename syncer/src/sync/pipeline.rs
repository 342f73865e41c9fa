//! Fetch pipeline: an index emitter, a dynamically sized fetcher pool, and a
//! single ordered processor.
//!
//! Indices travel `emitter -> fetchers -> processor`. Fetching is parallel
//! and out of order; the processor buffers results and hands blocks to the
//! handler strictly by ascending index. The pool grows and shrinks under the
//! direction of the [`ConcurrencyTuner`].

use super::{Handler, Helper, Syncer};
use crate::concurrency::ConcurrencyTuner;
use crate::errors::{FetchError, SyncError};
use crate::types::{BlockResult, NetworkIdentifier};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Sleep while the emitted-index backlog exceeds the live concurrency.
const FETCH_SLEEP: Duration = Duration::from_millis(500);

type WorkerSet = JoinSet<Result<(), SyncError>>;
type SharedIndices = Arc<Mutex<mpsc::Receiver<i64>>>;

/// Everything a fetcher needs, cloneable so the processor can add workers
/// mid-range.
struct FetcherContext<H> {
    helper: Arc<H>,
    network: NetworkIdentifier,
    indices: SharedIndices,
    results: mpsc::Sender<BlockResult>,
    tuner: Arc<ConcurrencyTuner>,
    cancel: CancellationToken,
}

impl<H> Clone for FetcherContext<H> {
    fn clone(&self) -> Self {
        Self {
            helper: Arc::clone(&self.helper),
            network: self.network.clone(),
            indices: Arc::clone(&self.indices),
            results: self.results.clone(),
            tuner: Arc::clone(&self.tuner),
            cancel: self.cancel.clone(),
        }
    }
}

impl<H, T> Syncer<H, T>
where
    H: Helper + 'static,
    T: Handler + 'static,
{
    /// Fetch and process `[next_index, end_index]` with a dynamically sized
    /// fetcher pool. Returns once every index in the range has been handed
    /// to the handler or skipped as omitted.
    pub(super) async fn sync_range(&mut self, end_index: i64) -> Result<(), SyncError> {
        let blocks_to_sync = end_index - self.next_index + 1;
        let starting = self
            .initial_concurrency
            .min(self.max_concurrency)
            .min(blocks_to_sync)
            .max(1);
        self.tuner.reset(starting);

        // Any early return cancels the whole pipeline; dropping the worker
        // set then aborts whatever is still running.
        let pipeline = self.cancel.child_token();
        let _stop = pipeline.clone().drop_guard();

        let channel_capacity = self.max_concurrency.max(1) as usize;
        let (index_tx, index_rx) = mpsc::channel::<i64>(channel_capacity);
        let (result_tx, mut result_rx) = mpsc::channel::<BlockResult>(channel_capacity);

        let mut workers: WorkerSet = JoinSet::new();
        workers.spawn(emit_indices(
            Arc::clone(&self.tuner),
            index_tx,
            self.next_index,
            end_index,
            pipeline.clone(),
        ));

        let context = FetcherContext {
            helper: Arc::clone(&self.helper),
            network: self.network.clone(),
            indices: Arc::new(Mutex::new(index_rx)),
            results: result_tx,
            tuner: Arc::clone(&self.tuner),
            cancel: pipeline.clone(),
        };
        for _ in 0..starting {
            workers.spawn(fetch_indices(context.clone()));
        }

        let mut cache: HashMap<i64, BlockResult> = HashMap::new();
        while self.next_index <= end_index {
            tokio::select! {
                received = result_rx.recv() => {
                    // The processor keeps a sender alive for late spawns, so
                    // the stream can only end here if every worker died
                    // without finishing the range.
                    let Some(result) = received else {
                        return Err(SyncError::BlockResultNil);
                    };
                    let size = result_size(&result);
                    cache.insert(result.index, result);
                    self.process_cached(&mut cache, end_index).await?;

                    if self.tuner.record(size) && !self.tuner.done_loading() {
                        workers.spawn(fetch_indices(context.clone()));
                    }
                }
                Some(joined) = workers.join_next() => {
                    joined.map_err(SyncError::Worker)??;
                }
                () = pipeline.cancelled() => return Err(SyncError::Canceled),
            }
        }

        // Range complete: retire the pool so no fetcher outlives the range.
        drop(context);
        while let Some(joined) = workers.join_next().await {
            joined.map_err(SyncError::Worker)??;
        }
        Ok(())
    }

    /// Drain the out-of-order cache from `next_index` upward. During an
    /// unwind, indices at or below the reorg start are refetched on the spot
    /// because any cached copies predate the reorg.
    async fn process_cached(
        &mut self,
        cache: &mut HashMap<i64, BlockResult>,
        end_index: i64,
    ) -> Result<(), SyncError> {
        let mut reorg_start = -1i64;

        while self.next_index <= end_index {
            let result = match cache.remove(&self.next_index) {
                // A cached entry may be stale once an unwind has started;
                // consuming it either extends the chain or drives another
                // unwind step, and the slot is refetched on its next visit
                // either way.
                Some(result) => result,
                None => {
                    if reorg_start < self.next_index {
                        // Not unwinding: wait for the fetchers.
                        break;
                    }
                    let index = self.next_index;
                    fetch_block_result(self.helper.as_ref(), &self.network, index)
                        .await
                        .map_err(|source| SyncError::FetchBlockReorg { index, source })?
                }
            };

            let last_processed = self.next_index;
            self.process_block(result)
                .await
                .map_err(|err| SyncError::BlockProcess(Box::new(err)))?;

            if self.next_index < last_processed && reorg_start == -1 {
                reorg_start = last_processed;
            }
        }

        Ok(())
    }
}

/// Emit every index in `[start, end]` in ascending order, then park the
/// done-loading latch. Holds off while the backlog exceeds the live
/// concurrency so a shrinking pool drains quickly.
async fn emit_indices(
    tuner: Arc<ConcurrencyTuner>,
    indices: mpsc::Sender<i64>,
    start: i64,
    end: i64,
    cancel: CancellationToken,
) -> Result<(), SyncError> {
    let mut index = start;
    while index <= end {
        let backlog = (indices.max_capacity() - indices.capacity()) as i64;
        if backlog > tuner.concurrency() {
            tokio::select! {
                () = sleep(FETCH_SLEEP) => continue,
                () = cancel.cancelled() => return Err(SyncError::Canceled),
            }
        }

        tokio::select! {
            sent = indices.send(index) => {
                if sent.is_err() {
                    // Every fetcher is gone; the pipeline is coming down.
                    break;
                }
                index += 1;
            }
            () = cancel.cancelled() => return Err(SyncError::Canceled),
        }
    }

    tuner.set_done_loading();
    Ok(())
}

/// One fetcher: drain indices, translate helper responses into results,
/// retire when the pool is above goal.
async fn fetch_indices<H: Helper>(context: FetcherContext<H>) -> Result<(), SyncError> {
    loop {
        let index = {
            let mut indices = context.indices.lock().await;
            tokio::select! {
                received = indices.recv() => match received {
                    Some(index) => index,
                    None => break,
                },
                () = context.cancel.cancelled() => return Err(SyncError::Canceled),
            }
        };

        let result = fetch_block_result(context.helper.as_ref(), &context.network, index)
            .await
            .map_err(|source| SyncError::FetchBlock { index, source })?;

        tokio::select! {
            sent = context.results.send(result) => {
                if sent.is_err() {
                    break;
                }
            }
            () = context.cancel.cancelled() => return Err(SyncError::Canceled),
        }

        if context.tuner.should_retire() {
            break;
        }
    }
    Ok(())
}

/// Translate one helper response into a [`BlockResult`]. Only the orphan
/// signal is folded into the result; everything else is fatal.
async fn fetch_block_result<H: Helper>(
    helper: &H,
    network: &NetworkIdentifier,
    index: i64,
) -> Result<BlockResult, eyre::Report> {
    match helper.block(network, index).await {
        Ok(Some(block)) => Ok(BlockResult::fetched(index, block)),
        Ok(None) => Ok(BlockResult::omitted(index)),
        Err(FetchError::OrphanHead) => Ok(BlockResult::orphaned(index)),
        Err(FetchError::Fatal(report)) => Err(report),
    }
}

/// Cheap upper bound on a result's in-memory footprint: its serialized
/// length. The tuner's size multiplier covers the rest.
fn result_size(result: &BlockResult) -> usize {
    serde_json::to_vec(result).map(|encoded| encoded.len()).unwrap_or(0)
}
