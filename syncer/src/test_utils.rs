//! Shared fixtures for sync tests: a script-driven helper and a recording
//! handler.

use crate::errors::FetchError;
use crate::sync::{Handler, Helper};
use crate::types::{Block, BlockIdentifier, NetworkIdentifier, NetworkStatus};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

pub fn test_network() -> NetworkIdentifier {
    NetworkIdentifier::new("blah", "testnet")
}

/// Status snapshot pointing at `tip`, with `genesis` as the chain origin.
pub fn status_at(tip: &Block, genesis: &Block) -> NetworkStatus {
    NetworkStatus {
        current_block_identifier: tip.block_identifier.clone(),
        genesis_block_identifier: genesis.block_identifier.clone(),
    }
}

/// Deterministic chain segment: hashes are `block {tag}{index}` and parents
/// chain downward; index 0 parents itself.
pub fn linear_blocks(start: i64, end: i64, tag: &str) -> Vec<Block> {
    (start..=end)
        .map(|index| {
            let parent_index = (index - 1).max(0);
            Block {
                block_identifier: BlockIdentifier::new(index, format!("block {tag}{index}")),
                parent_block_identifier: BlockIdentifier::new(
                    parent_index,
                    format!("block {tag}{parent_index}"),
                ),
                timestamp: 1_000 + index,
                transactions: Vec::new(),
            }
        })
        .collect()
}

/// One scripted answer for a fetch of an index.
#[derive(Debug, Clone)]
pub enum FetchScript {
    Block(Block),
    Omitted,
    OrphanHead,
}

/// Helper driven by per-index response scripts. Responses are consumed in
/// order and the last one repeats; an unscripted index fails fatally.
pub struct ScriptedHelper {
    statuses: Mutex<Vec<NetworkStatus>>,
    status_calls: Mutex<u64>,
    scripts: Mutex<HashMap<i64, Vec<FetchScript>>>,
    fetch_counts: Mutex<HashMap<i64, u64>>,
    fetch_delay: Mutex<Duration>,
}

impl ScriptedHelper {
    pub fn new(statuses: Vec<NetworkStatus>) -> Self {
        Self {
            statuses: Mutex::new(statuses),
            status_calls: Mutex::new(0),
            scripts: Mutex::new(HashMap::new()),
            fetch_counts: Mutex::new(HashMap::new()),
            fetch_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Script the responses for one index.
    pub fn script(&self, index: i64, responses: Vec<FetchScript>) {
        assert!(!responses.is_empty(), "a script needs at least one response");
        self.scripts.lock().insert(index, responses);
    }

    /// Script each block as the sole response for its own index.
    pub fn script_blocks(&self, blocks: &[Block]) {
        for block in blocks {
            self.script(
                block.block_identifier.index,
                vec![FetchScript::Block(block.clone())],
            );
        }
    }

    /// Simulate per-fetch latency.
    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock() = delay;
    }

    pub fn fetch_count(&self, index: i64) -> u64 {
        self.fetch_counts.lock().get(&index).copied().unwrap_or(0)
    }

    pub fn status_calls(&self) -> u64 {
        *self.status_calls.lock()
    }
}

#[async_trait]
impl Helper for ScriptedHelper {
    async fn network_status(&self, _network: &NetworkIdentifier) -> eyre::Result<NetworkStatus> {
        *self.status_calls.lock() += 1;
        let mut statuses = self.statuses.lock();
        if statuses.len() > 1 {
            Ok(statuses.remove(0))
        } else {
            statuses
                .first()
                .cloned()
                .ok_or_else(|| eyre::eyre!("no network status scripted"))
        }
    }

    async fn block(
        &self,
        _network: &NetworkIdentifier,
        index: i64,
    ) -> Result<Option<Block>, FetchError> {
        let delay = *self.fetch_delay.lock();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }

        *self.fetch_counts.lock().entry(index).or_insert(0) += 1;

        let response = {
            let mut scripts = self.scripts.lock();
            let Some(queue) = scripts.get_mut(&index) else {
                return Err(FetchError::Fatal(eyre::eyre!(
                    "no script for block {index}"
                )));
            };
            if queue.len() > 1 {
                queue.remove(0)
            } else {
                queue[0].clone()
            }
        };

        match response {
            FetchScript::Block(block) => Ok(Some(block)),
            FetchScript::Omitted => Ok(None),
            FetchScript::OrphanHead => Err(FetchError::OrphanHead),
        }
    }
}

/// One handler callback, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerEvent {
    Added(BlockIdentifier),
    Removed(BlockIdentifier),
}

/// Handler that records every callback and can be told to reject one index.
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<HandlerEvent>>,
    fail_at: Mutex<Option<i64>>,
}

impl RecordingHandler {
    pub fn events(&self) -> Vec<HandlerEvent> {
        self.events.lock().clone()
    }

    pub fn added(&self) -> Vec<BlockIdentifier> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                HandlerEvent::Added(id) => Some(id.clone()),
                HandlerEvent::Removed(_) => None,
            })
            .collect()
    }

    pub fn removed(&self) -> Vec<BlockIdentifier> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                HandlerEvent::Removed(id) => Some(id.clone()),
                HandlerEvent::Added(_) => None,
            })
            .collect()
    }

    /// Reject the add of `index` with an error.
    pub fn fail_at(&self, index: i64) {
        *self.fail_at.lock() = Some(index);
    }
}

#[async_trait]
impl Handler for RecordingHandler {
    async fn block_added(&self, block: &Block) -> eyre::Result<()> {
        if *self.fail_at.lock() == Some(block.block_identifier.index) {
            eyre::bail!("handler rejected block {}", block.block_identifier.index);
        }
        self.events
            .lock()
            .push(HandlerEvent::Added(block.block_identifier.clone()));
        Ok(())
    }

    async fn block_removed(&self, block: &BlockIdentifier) -> eyre::Result<()> {
        self.events.lock().push(HandlerEvent::Removed(block.clone()));
        Ok(())
    }
}
