//! Bounded memory of recently accepted blocks, used for reorg detection.

use crate::types::BlockIdentifier;
use std::collections::VecDeque;

/// Default number of accepted identifiers remembered for reorg handling. A
/// reorganization deeper than the window cannot be unwound.
pub const DEFAULT_PAST_BLOCKS: usize = 20;

/// FIFO window of the most recently accepted block identifiers, newest at the
/// tail.
///
/// Omitted indices leave gaps, so consecutive entries are strictly ascending
/// but not necessarily contiguous. A reorg landing next to a gap is resolved
/// by the ordinary one-at-a-time unwind, which degrades to refetching each
/// slot linearly.
#[derive(Debug, Clone)]
pub struct PastBlocks {
    blocks: VecDeque<BlockIdentifier>,
    capacity: usize,
}

impl PastBlocks {
    pub fn new(capacity: usize) -> Self {
        Self {
            blocks: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Preload the window, e.g. when resuming a sync that may still need to
    /// unwind into blocks accepted by a previous run.
    pub fn preloaded(blocks: Vec<BlockIdentifier>, capacity: usize) -> Self {
        let mut window = Self::new(capacity);
        for block in blocks {
            window.push(block);
        }
        window
    }

    /// Most recently accepted identifier.
    pub fn tail(&self) -> Option<&BlockIdentifier> {
        self.blocks.back()
    }

    /// Record a newly accepted identifier, evicting the oldest entry once the
    /// window is full.
    pub fn push(&mut self, block: BlockIdentifier) {
        self.blocks.push_back(block);
        if self.blocks.len() > self.capacity {
            self.blocks.pop_front();
        }
    }

    /// Drop the most recently accepted identifier (reorg unwind).
    pub fn pop(&mut self) -> Option<BlockIdentifier> {
        self.blocks.pop_back()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Identifiers oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &BlockIdentifier> {
        self.blocks.iter()
    }
}
