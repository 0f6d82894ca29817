//! Exercises the scheduler's backpressure coupling to the block cache: how
//! far ahead of the completed tip it is willing to request shrinks as the
//! cache fills toward its byte budget, and never collapses to zero even when
//! the budget is already exhausted.

use bitcoin::blockdata::constants::genesis_block;
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, Network};
use block_ingest::cache::BlockCache;
use block_ingest::scheduler::Scheduler;
use std::sync::Arc;

fn hash(height: u32) -> BlockHash {
    let mut bytes = [0u8; 32];
    bytes[..4].copy_from_slice(&height.to_le_bytes());
    BlockHash::from_byte_array(bytes)
}

#[test]
fn fetch_window_shrinks_as_the_cache_fills_toward_its_budget() {
    let cache = Arc::new(BlockCache::new());
    let scheduler = Scheduler::new(cache.clone(), 100_000, 0);
    for height in 1..=2000u32 {
        scheduler.register_header(height, hash(height));
    }
    let roomy_batch = scheduler.next_batch(1);

    // Heights far outside the scheduling window, purely to consume cache
    // budget without shadowing any height the scheduler would request.
    let filler = genesis_block(Network::Bitcoin);
    for height in 100_000..100_200u32 {
        cache.insert(height, filler.clone());
    }
    assert!(
        cache.size_bytes() < 100_000,
        "test setup should leave some budget, not exhaust it entirely"
    );

    scheduler.register_header(2001, hash(2001));
    let cramped_batch = scheduler.next_batch(2);

    assert!(
        cramped_batch.len() < roomy_batch.len(),
        "roomy={}, cramped={}",
        roomy_batch.len(),
        cramped_batch.len()
    );
}

#[test]
fn fetch_window_never_collapses_below_the_minimum_even_with_no_budget_left() {
    let cache = Arc::new(BlockCache::new());
    // A budget of 1 byte is exhausted by the very first tracked average, so
    // the window would compute to zero without the floor clamp.
    let scheduler = Scheduler::new(cache, 1, 0);
    for height in 1..=20u32 {
        scheduler.register_header(height, hash(height));
    }
    let batch = scheduler.next_batch(1);
    assert!(!batch.is_empty(), "the minimum-ahead floor must still allow requests");
}
