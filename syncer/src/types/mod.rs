//! Chain-agnostic data model shared across the engine.

use serde::{Deserialize, Serialize};

/// Identifies the chain a syncer instance is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkIdentifier {
    pub blockchain: String,
    pub network: String,
}

impl NetworkIdentifier {
    pub fn new(blockchain: impl Into<String>, network: impl Into<String>) -> Self {
        Self {
            blockchain: blockchain.into(),
            network: network.into(),
        }
    }
}

/// Position of a block on a chain. Two identifiers are equal iff both index
/// and hash match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockIdentifier {
    pub index: i64,
    pub hash: String,
}

impl BlockIdentifier {
    pub fn new(index: i64, hash: impl Into<String>) -> Self {
        Self {
            index,
            hash: hash.into(),
        }
    }
}

/// A block as surfaced to the handler. The engine reads only the two
/// identifiers; everything else is opaque payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub block_identifier: BlockIdentifier,
    pub parent_block_identifier: BlockIdentifier,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default)]
    pub transactions: Vec<serde_json::Value>,
}

impl Block {
    /// A block is genesis when its parent identifier equals its own.
    pub fn is_genesis(&self) -> bool {
        self.block_identifier == self.parent_block_identifier
    }
}

/// Snapshot of the remote node's view of the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub current_block_identifier: BlockIdentifier,
    pub genesis_block_identifier: BlockIdentifier,
}

/// Outcome of fetching one index. The index is carried separately because an
/// omitted block has no identifier to read it from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockResult {
    pub index: i64,
    pub block: Option<Block>,
    pub orphan_head: bool,
}

impl BlockResult {
    /// The node returned the block at this index.
    pub fn fetched(index: i64, block: Block) -> Self {
        Self {
            index,
            block: Some(block),
            orphan_head: false,
        }
    }

    /// The node has no block at this index.
    pub fn omitted(index: i64) -> Self {
        Self {
            index,
            block: None,
            orphan_head: false,
        }
    }

    /// The node reported this index is no longer on the canonical chain.
    pub fn orphaned(index: i64) -> Self {
        Self {
            index,
            block: None,
            orphan_head: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(index: i64, hash: &str, parent_index: i64, parent_hash: &str) -> Block {
        Block {
            block_identifier: BlockIdentifier::new(index, hash),
            parent_block_identifier: BlockIdentifier::new(parent_index, parent_hash),
            timestamp: 0,
            transactions: Vec::new(),
        }
    }

    #[test]
    fn identifier_equality_is_field_wise() {
        assert_eq!(BlockIdentifier::new(1, "a"), BlockIdentifier::new(1, "a"));
        assert_ne!(BlockIdentifier::new(1, "a"), BlockIdentifier::new(1, "b"));
        assert_ne!(BlockIdentifier::new(1, "a"), BlockIdentifier::new(2, "a"));
    }

    #[test]
    fn genesis_parents_itself() {
        assert!(block(0, "0", 0, "0").is_genesis());
        assert!(!block(1, "1", 0, "0").is_genesis());
    }

    #[test]
    fn result_constructors_are_disjoint() {
        let fetched = BlockResult::fetched(3, block(3, "3", 2, "2"));
        assert!(fetched.block.is_some() && !fetched.orphan_head);

        let omitted = BlockResult::omitted(3);
        assert!(omitted.block.is_none() && !omitted.orphan_head);

        let orphaned = BlockResult::orphaned(3);
        assert!(orphaned.block.is_none() && orphaned.orphan_head);
    }
}
