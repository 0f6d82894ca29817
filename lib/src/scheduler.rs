use crate::cache::BlockCache;
use crate::net::message::Inventory;
use crate::net::pool::PeerId;
use bitcoin::BlockHash;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

/// Lower and upper clamp on how many heights past `blocks_complete` the
/// scheduler may request, in units of `avg_block_size`.
const MIN_AHEAD: u32 = 5;
const MAX_AHEAD: u32 = 10_000;

/// A `getdata` batch is capped at this many entries...
const BATCH_MAX_ENTRIES: usize = 10_000;
/// ...or this many implied bytes, whichever comes first.
const BATCH_MAX_BYTES: u64 = 250_000;

/// Rolling window over which the average delivered block size is tracked.
const AVG_WINDOW: usize = 4096;
const INITIAL_AVG_BLOCK_SIZE: u64 = 220;

/// Bookkeeping for one block hash that has been requested from at least one
/// peer and not yet fully received.
struct InProgress {
    expected_height: u32,
    request_count: u32,
    assigned_peer_ids: HashSet<PeerId>,
}

impl InProgress {
    fn new(expected_height: u32) -> Self {
        InProgress {
            expected_height,
            request_count: 0,
            assigned_peer_ids: HashSet::new(),
        }
    }
}

struct RollingAverage {
    samples: VecDeque<u64>,
    sum: u64,
}

impl RollingAverage {
    fn new() -> Self {
        RollingAverage {
            samples: VecDeque::with_capacity(AVG_WINDOW),
            sum: 0,
        }
    }

    fn record(&mut self, size: u64) {
        self.samples.push_back(size);
        self.sum += size;
        if self.samples.len() > AVG_WINDOW {
            if let Some(oldest) = self.samples.pop_front() {
                self.sum -= oldest;
            }
        }
    }

    fn average(&self) -> u64 {
        if self.samples.is_empty() {
            INITIAL_AVG_BLOCK_SIZE
        } else {
            (self.sum / self.samples.len() as u64).max(1)
        }
    }
}

struct State {
    /// Heights announced by headers but not yet received, mapped to the
    /// hash we expect there.
    to_get: HashMap<u32, BlockHash>,
    in_progress: HashMap<BlockHash, InProgress>,
    /// Rolling cursor: the highest height this scheduler has ever considered.
    blocks_index: u32,
    /// Monotone height of the last block successfully applied to the chain.
    blocks_complete: u32,
    /// Highest height known from received headers.
    last_block_height: u32,
    do_blocks: bool,
}

/// The outcome of a delivered `block` message landing in the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// First valid-shaped delivery for this height; the block is now cached.
    First(u32),
    /// A later delivery for a height already cached or already applied;
    /// counted as "unexpected" and silently dropped, no peer penalty.
    Duplicate,
    /// Nobody currently has this hash in `in_progress` — stale or unsolicited.
    Unknown,
}

/// Assigns "next block to request" to each idle peer, deduplicating
/// in-flight requests and deriving backpressure from the block cache's fill
/// level. All mutable scheduling state lives behind one mutex, the same
/// single-lock discipline the connection pool uses for its own state.
pub struct Scheduler {
    cache: std::sync::Arc<BlockCache>,
    cache_budget_bytes: u64,
    state: Mutex<State>,
    avg_block_size: Mutex<RollingAverage>,
}

impl Scheduler {
    pub fn new(cache: std::sync::Arc<BlockCache>, cache_budget_bytes: u64, start_height: u32) -> Self {
        Scheduler {
            cache,
            cache_budget_bytes,
            state: Mutex::new(State {
                to_get: HashMap::new(),
                in_progress: HashMap::new(),
                blocks_index: start_height,
                blocks_complete: start_height,
                last_block_height: start_height,
                do_blocks: true,
            }),
            avg_block_size: Mutex::new(RollingAverage::new()),
        }
    }

    /// Registers a header announced at `height` with hash `hash`, making it
    /// eligible for scheduling once it falls inside the fetch window.
    pub fn register_header(&self, height: u32, hash: BlockHash) {
        let mut state = self.state.lock().expect("scheduler lock poisoned");
        if height > state.blocks_complete && !self.cache.contains(height) {
            state.to_get.insert(height, hash);
        }
        if height > state.last_block_height {
            state.last_block_height = height;
        }
        state.do_blocks = true;
    }

    fn window_ahead(&self) -> u32 {
        let avg = self.avg_block_size.lock().expect("avg lock poisoned").average();
        let remaining_budget = self.cache_budget_bytes.saturating_sub(self.cache.size_bytes());
        let window = remaining_budget / avg.max(1);
        window.clamp(MIN_AHEAD as u64, MAX_AHEAD as u64) as u32
    }

    /// Produces the next `getdata` batch for `peer_id`.
    /// Scans the open window `[blocks_complete+1, blocks_complete+window]`
    /// for heights that are neither cached nor already assigned to this
    /// peer, stopping at the entry/byte caps. If nothing new is available
    /// and the whole remaining chain is already known, fetching is disabled
    /// until the next `register_header` call re-enables it.
    pub fn next_batch(&self, peer_id: PeerId) -> Vec<Inventory> {
        let mut state = self.state.lock().expect("scheduler lock poisoned");
        if !state.do_blocks {
            return Vec::new();
        }

        let window = self.window_ahead();
        let upper = (state.blocks_complete + window).min(state.last_block_height.max(state.blocks_complete));
        let avg = self.avg_block_size.lock().expect("avg lock poisoned").average();

        let mut batch = Vec::new();
        let mut implied_bytes = 0u64;
        let mut height = state.blocks_complete + 1;

        while height <= upper {
            if !self.cache.contains(height) {
                if let Some(&hash) = state.to_get.get(&height) {
                    let entry = state
                        .in_progress
                        .entry(hash)
                        .or_insert_with(|| InProgress::new(height));
                    if !entry.assigned_peer_ids.contains(&peer_id) {
                        entry.assigned_peer_ids.insert(peer_id);
                        entry.request_count += 1;
                        batch.push(Inventory::block(hash));
                        implied_bytes += avg;
                        if batch.len() >= BATCH_MAX_ENTRIES || implied_bytes >= BATCH_MAX_BYTES {
                            break;
                        }
                    }
                }
            }
            height += 1;
        }

        state.blocks_index = state.blocks_index.max(height.saturating_sub(1));

        if batch.is_empty() && upper >= state.last_block_height {
            state.do_blocks = false;
        }
        batch
    }

    /// Records a delivered block at the hash the scheduler was expecting.
    /// The caller still must validate the block and call
    /// [`Scheduler::discard_invalid`] or advance completion accordingly.
    pub fn on_block_received(&self, hash: BlockHash, size_bytes: u64) -> Delivery {
        let mut state = self.state.lock().expect("scheduler lock poisoned");
        let Some(in_progress) = state.in_progress.get(&hash) else {
            return Delivery::Unknown;
        };
        let height = in_progress.expected_height;
        if height <= state.blocks_complete || self.cache.contains(height) {
            return Delivery::Duplicate;
        }
        drop(state);
        self.avg_block_size.lock().expect("avg lock poisoned").record(size_bytes);
        Delivery::First(height)
    }

    /// Releases a peer's assignments without deleting the in-progress
    /// records themselves, so other assignees (or a fresh scheduling pass)
    /// can still satisfy them. Used on timeout and on peer disconnect.
    pub fn release_peer(&self, peer_id: PeerId) {
        let mut state = self.state.lock().expect("scheduler lock poisoned");
        for entry in state.in_progress.values_mut() {
            entry.assigned_peer_ids.remove(&peer_id);
        }
    }

    /// Drops a delivery that failed validation: frees the cache slot (if the
    /// caller populated it) so a re-request can land cleanly; the
    /// in-progress record is left intact.
    pub fn discard_invalid(&self, height: u32) {
        self.cache.take(height);
    }

    /// Called once a height has been successfully applied by the acceptor:
    /// advances `blocks_complete` and clears the height's bookkeeping.
    pub fn advance_complete(&self, height: u32, hash: BlockHash) {
        let mut state = self.state.lock().expect("scheduler lock poisoned");
        state.to_get.remove(&height);
        state.in_progress.remove(&hash);
        if height == state.blocks_complete + 1 {
            state.blocks_complete = height;
        } else if height > state.blocks_complete {
            state.blocks_complete = height;
        }
        state.do_blocks = true;
    }

    pub fn blocks_complete(&self) -> u32 {
        self.state.lock().expect("scheduler lock poisoned").blocks_complete
    }

    pub fn in_progress_count(&self) -> usize {
        self.state.lock().expect("scheduler lock poisoned").in_progress.len()
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().expect("scheduler lock poisoned").to_get.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;

    fn hash(byte: u8) -> BlockHash {
        BlockHash::from_byte_array([byte; 32])
    }

    #[test]
    fn duplicate_assignment_is_intentional_when_no_new_work() {
        let cache = std::sync::Arc::new(BlockCache::new());
        let scheduler = Scheduler::new(cache, 64 * 1024 * 1024, 0);
        scheduler.register_header(1, hash(1));

        let batch_a = scheduler.next_batch(1);
        assert_eq!(batch_a.len(), 1);
        // Same height requested again by peer 2: no new heights exist, so
        // the only available work is assigned a second time.
        let batch_b = scheduler.next_batch(2);
        assert_eq!(batch_b.len(), 1);
        assert_eq!(batch_a[0].hash, batch_b[0].hash);
    }

    #[test]
    fn same_peer_is_not_assigned_the_same_height_twice() {
        let cache = std::sync::Arc::new(BlockCache::new());
        let scheduler = Scheduler::new(cache, 64 * 1024 * 1024, 0);
        scheduler.register_header(1, hash(1));
        let first = scheduler.next_batch(1);
        assert_eq!(first.len(), 1);
        let second = scheduler.next_batch(1);
        assert!(second.is_empty());
    }

    #[test]
    fn release_peer_allows_reassignment() {
        let cache = std::sync::Arc::new(BlockCache::new());
        let scheduler = Scheduler::new(cache, 64 * 1024 * 1024, 0);
        scheduler.register_header(1, hash(1));
        scheduler.next_batch(1);
        scheduler.release_peer(1);
        let reassigned = scheduler.next_batch(1);
        assert_eq!(reassigned.len(), 1);
    }

    #[test]
    fn advance_complete_shrinks_window_base() {
        let cache = std::sync::Arc::new(BlockCache::new());
        let scheduler = Scheduler::new(cache, 64 * 1024 * 1024, 0);
        scheduler.register_header(1, hash(1));
        scheduler.advance_complete(1, hash(1));
        assert_eq!(scheduler.blocks_complete(), 1);
    }
}
