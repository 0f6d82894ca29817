use bitcoin::Block;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Bounded in-memory map `height -> block`. The cache does not
/// enforce its own bound: it reports [`BlockCache::size_bytes`] so the
/// scheduler can compute how many heights ahead it may still request. Blocks
/// are removed only when the control loop drains them into the acceptor.
pub struct BlockCache {
    blocks: Mutex<HashMap<u32, Block>>,
    size_bytes: AtomicU64,
}

impl Default for BlockCache {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockCache {
    pub fn new() -> Self {
        BlockCache {
            blocks: Mutex::new(HashMap::new()),
            size_bytes: AtomicU64::new(0),
        }
    }

    /// Inserts `block` at `height` if not already present. Returns `false`
    /// for a duplicate delivery, which the caller counts as "unexpected" and
    /// drops without penalizing the delivering peer.
    pub fn insert(&self, height: u32, block: Block) -> bool {
        let mut blocks = self.blocks.lock().expect("cache lock poisoned");
        if blocks.contains_key(&height) {
            return false;
        }
        let size = bitcoin::consensus::encode::serialize(&block).len() as u64;
        blocks.insert(height, block);
        self.size_bytes.fetch_add(size, Ordering::Relaxed);
        true
    }

    pub fn contains(&self, height: u32) -> bool {
        self.blocks.lock().expect("cache lock poisoned").contains_key(&height)
    }

    /// Removes and returns the block at `height`, if cached, decrementing the
    /// size accumulator. Used by the control loop once a height is drained
    /// into the acceptor, and by the scheduler to discard a delivery that
    /// failed validation so the slot can be re-requested.
    pub fn take(&self, height: u32) -> Option<Block> {
        let mut blocks = self.blocks.lock().expect("cache lock poisoned");
        let block = blocks.remove(&height)?;
        let size = bitcoin::consensus::encode::serialize(&block).len() as u64;
        self.size_bytes.fetch_sub(size, Ordering::Relaxed);
        Some(block)
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.blocks.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
