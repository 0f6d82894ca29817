use crate::chain::types::TreeNode;
use bitcoin::hashes::Hash;
use bitcoin::{block, BlockHash};
use std::collections::HashMap;

/// The block-tree DAG rooted at genesis. Tracks every known header
/// (whether or not its body has arrived) and the current tip, selected by
/// maximum cumulative work with ties broken by first-seen.
pub struct BlockTree {
    nodes: HashMap<BlockHash, TreeNode>,
    tip: BlockHash,
}

impl BlockTree {
    pub fn new_with_genesis(genesis_header: block::Header) -> Self {
        let hash = genesis_header.block_hash();
        let work = genesis_header.target().to_work();
        let mut nodes = HashMap::new();
        nodes.insert(
            hash,
            TreeNode {
                hash,
                parent_hash: BlockHash::all_zeros(),
                height: 0,
                cumulative_work: work,
                header: genesis_header,
                block_present: true,
            },
        );
        BlockTree { nodes, tip: hash }
    }

    pub fn contains(&self, hash: &BlockHash) -> bool {
        self.nodes.contains_key(hash)
    }

    pub fn get(&self, hash: &BlockHash) -> Option<&TreeNode> {
        self.nodes.get(hash)
    }

    pub fn tip(&self) -> &TreeNode {
        self.nodes.get(&self.tip).expect("tip always present")
    }

    /// Inserts a new header whose parent is already known, returning the new
    /// node's hash and whether it became the new tip. The caller (the
    /// acceptor) is responsible for having already validated PoW and parent
    /// linkage via `check_block`.
    pub fn insert(&mut self, header: block::Header, block_present: bool) -> (BlockHash, bool) {
        let hash = header.block_hash();
        let parent = self
            .nodes
            .get(&header.prev_blockhash)
            .expect("caller validated parent is known");
        let cumulative_work = parent.cumulative_work + header.target().to_work();
        let height = parent.height + 1;

        let became_tip = cumulative_work > self.tip().cumulative_work;

        self.nodes.insert(
            hash,
            TreeNode {
                hash,
                parent_hash: header.prev_blockhash,
                height,
                cumulative_work,
                header,
                block_present,
            },
        );
        if became_tip {
            self.tip = hash;
        }
        (hash, became_tip)
    }

    /// Marks `hash`'s node as having its full block body, not just a header.
    pub fn mark_present(&mut self, hash: &BlockHash) {
        if let Some(node) = self.nodes.get_mut(hash) {
            node.block_present = true;
        }
    }

    /// Sets the tip explicitly. Used by the acceptor after a reorg finishes
    /// re-applying a side branch.
    pub fn set_tip(&mut self, hash: BlockHash) {
        debug_assert!(self.nodes.contains_key(&hash));
        self.tip = hash;
    }

    /// Walks from `from` back to (and including) their common ancestor,
    /// returning `(fork_point, path_from_fork_to_from_exclusive_of_fork)`.
    pub fn path_to_ancestor(&self, from: BlockHash, to_height: u32) -> Vec<BlockHash> {
        let mut path = Vec::new();
        let mut cur = from;
        while let Some(node) = self.nodes.get(&cur) {
            if node.height <= to_height {
                break;
            }
            path.push(cur);
            cur = node.parent_hash;
        }
        path.reverse();
        path
    }

    /// Finds the fork point between two branches by walking both back to
    /// equal height, then together until hashes match.
    pub fn fork_point(&self, mut a: BlockHash, mut b: BlockHash) -> BlockHash {
        let mut height_a = self.nodes[&a].height;
        let mut height_b = self.nodes[&b].height;
        while height_a > height_b {
            a = self.nodes[&a].parent_hash;
            height_a -= 1;
        }
        while height_b > height_a {
            b = self.nodes[&b].parent_hash;
            height_b -= 1;
        }
        while a != b {
            a = self.nodes[&a].parent_hash;
            b = self.nodes[&b].parent_hash;
        }
        a
    }
}
