use crate::cache::BlockCache;
use crate::chain::Chain;
use crate::chain::UtxoSet;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::net::message::{InvType, Message};
use crate::net::{ConnectionPool, NetParams};
use crate::peers::PeerDirectory;
use crate::period::{PeriodCounter, Periodic};
use crate::scheduler::{Delivery, Scheduler};
use crate::store::BlockLog;
use bitcoin::blockdata::constants::genesis_block;
use bitcoin::hashes::Hash;
use bitcoin::BlockHash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SCHEDULER_TICK: Duration = Duration::from_millis(100);
const STATS_PERIOD: Duration = Duration::from_secs(10);
const HELD_ORPHAN_BUDGET: usize = 10_000;
const GETHEADERS_INTERVAL: Duration = Duration::from_secs(5);

/// Process-wide shared state, built once in `main` and handed to every
/// spawned thread as a cloned `Arc<Context>`. No field here is a
/// `lazy_static`/`OnceLock` global.
pub struct Context {
    pub config: Config,
    pub net_params: NetParams,
    pub peers: Arc<PeerDirectory>,
    pub pool: Arc<ConnectionPool>,
    pub cache: Arc<BlockCache>,
    pub scheduler: Arc<Scheduler>,
    pub chain: Arc<Chain>,
    pub abort: Arc<AtomicBool>,
    block_log: BlockLog,
    bytes_downloaded: Arc<AtomicU64>,
    bytes_processed: AtomicU64,
    counters: Arc<Mutex<PeriodCounter>>,
    orphans: Mutex<std::collections::HashMap<BlockHash, bitcoin::Block>>,
    headers_due: Mutex<Periodic>,
}

impl Context {
    /// Opens every persistent store under `config.home`, seeding the peer
    /// directory on first run, and constructs the chain on top of the
    /// configured network's genesis header. Fails fast if the lock file is
    /// already held.
    pub fn bootstrap(config: Config) -> Result<Arc<Context>> {
        let lock_path = config.lock_path();
        if lock_path.exists() {
            return Err(Error::AlreadyLocked);
        }
        std::fs::create_dir_all(&config.home)?;
        std::fs::write(&lock_path, b"")?;

        let net_params = config.net_params();
        let blockchain_path = config.blockchain_path();
        let first_run = !BlockLog::exists(&blockchain_path);
        log::info!(
            "{} at {}",
            if first_run { "first run" } else { "resuming" },
            config.home.display()
        );
        let peers = Arc::new(PeerDirectory::open(config.peers_path(), config.single_peer)?);
        if peers.best(1, false)?.is_empty() && config.single_peer.is_none() {
            let inserted = peers.seed_bootstrap(net_params.default_port)?;
            log::info!("seed_bootstrap inserted {inserted} peers");
        }

        let utxo = UtxoSet::open(config.unspent_dir())?;
        let genesis = genesis_block(config.network);
        let abort = Arc::new(AtomicBool::new(false));
        let chain = Arc::new(Chain::new(
            net_params,
            genesis.header,
            utxo,
            config.trust_up_to,
            abort.clone(),
        ));

        let block_log = BlockLog::open(&blockchain_path)?;
        let mut restored = 0u32;
        BlockLog::replay(&blockchain_path, |_height, raw, _trusted| {
            if let Ok(block) = bitcoin::consensus::encode::deserialize::<bitcoin::Block>(&raw) {
                chain.restore_header(block.header);
                restored += 1;
            }
        })?;
        if restored > 0 {
            log::info!("restored {restored} block headers from {}", blockchain_path.display());
        }

        let cache = Arc::new(BlockCache::new());
        let scheduler = Arc::new(Scheduler::new(cache.clone(), config.cache_budget_bytes, chain.tip_height()));

        let bytes_downloaded = Arc::new(AtomicU64::new(0));

        let counters = Arc::new(Mutex::new(PeriodCounter::new(STATS_PERIOD)));

        let cache_for_callback = cache.clone();
        let scheduler_for_callback = scheduler.clone();
        let chain_for_callback = chain.clone();
        let bytes_downloaded_for_callback = bytes_downloaded.clone();
        let peers_for_callback = peers.clone();
        let counters_for_callback = counters.clone();
        let pool = Arc::new(ConnectionPool::new(
            net_params.magic,
            config.max_conns,
            Arc::new(move |peer_id, addr, msg| {
                dispatch(
                    peer_id,
                    addr,
                    msg,
                    &cache_for_callback,
                    &scheduler_for_callback,
                    &chain_for_callback,
                    &peers_for_callback,
                    &bytes_downloaded_for_callback,
                    &counters_for_callback,
                )
            }),
        ));

        Ok(Arc::new(Context {
            config,
            net_params,
            peers,
            pool,
            cache,
            scheduler,
            chain,
            abort,
            block_log,
            bytes_downloaded,
            bytes_processed: AtomicU64::new(0),
            counters,
            orphans: Mutex::new(std::collections::HashMap::new()),
            headers_due: Mutex::new(Periodic::new(GETHEADERS_INTERVAL)),
        }))
    }

    fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    /// Dials peers from the directory until the pool is at capacity.
    fn dial_loop(&self) {
        while !self.is_aborted() {
            if self.pool.has_capacity() {
                if let Ok(candidates) = self.peers.best(4, true) {
                    for peer in candidates {
                        let addr = peer.socket_addr();
                        match self.pool.dial(addr, self.chain.tip_height() as i32) {
                            Ok(_) => {
                                let _ = self.peers.mark_alive(addr.ip(), addr.port());
                            }
                            Err(e) => {
                                log::debug!("dial {addr} failed: {e}");
                                let _ = self.peers.mark_dead(addr.ip(), addr.port());
                            }
                        }
                        if !self.pool.has_capacity() {
                            break;
                        }
                    }
                }
            }
            std::thread::sleep(Duration::from_millis(500));
        }
    }

    /// Issues `getdata` batches to idle peers and reaps broken/timed-out
    /// connections every tick.
    fn scheduling_loop(&self) {
        let mut eviction_due = Periodic::new(self.pool.slow_peer_eviction_interval());
        while !self.is_aborted() {
            for id in self.pool.reap_broken() {
                self.scheduler.release_peer(id);
            }
            self.pool.for_each(|conn| {
                if conn.block_receive_timed_out() {
                    self.scheduler.release_peer(conn.id);
                }
                let batch = self.scheduler.next_batch(conn.id);
                if !batch.is_empty() {
                    conn.set_in_progress(batch.len() as u32);
                    let _ = conn.send(&Message::GetData(batch), self.net_params.magic);
                }
            });
            if eviction_due.elapsed() {
                if let Some(id) = self.pool.drop_slowest() {
                    self.scheduler.release_peer(id);
                }
            }
            if self.headers_due.lock().expect("headers_due lock poisoned").elapsed() {
                self.request_headers();
            }
            std::thread::sleep(SCHEDULER_TICK);
        }
    }

    /// Asks one connected peer to extend our view of the chain past the
    /// current tip; the reply lands as a `headers` message and is registered
    /// via [`Chain::register_header`] so the scheduler can learn heights to
    /// fetch — its window only has anything to schedule once headers have
    /// populated `to_get`.
    fn request_headers(&self) {
        let locator = vec![self.chain.tip_hash()];
        let msg = Message::GetHeaders {
            version: 70015,
            locator_hashes: locator,
            stop_hash: BlockHash::all_zeros(),
        };
        let mut sent = false;
        self.pool.for_each(|conn| {
            if !sent {
                if conn.send(&msg, self.net_params.magic).is_ok() {
                    sent = true;
                }
            }
        });
    }

    /// Drains the block cache into the acceptor strictly in height order,
    /// applying orphans that become resolvable after their parent lands.
    fn drain_loop(&self) {
        while !self.is_aborted() {
            let next_height = self.scheduler.blocks_complete() + 1;
            if let Some(block) = self.cache.take(next_height) {
                self.accept_and_advance(block, next_height);
            } else {
                std::thread::sleep(SCHEDULER_TICK);
            }
            if let Some(stats) = self.counters.lock().expect("counters lock poisoned").period_elapsed() {
                log::info!("{stats}");
            }
        }
    }

    fn accept_and_advance(&self, block: bitcoin::Block, height: u32) {
        let hash = block.block_hash();
        let trusted = height <= self.config.trust_up_to;
        let verified_before = self.chain.ecdsa_verify_count();
        match self.chain.accept_block(&block, trusted) {
            Ok(()) => {
                self.scheduler.advance_complete(height, hash);
                let raw = bitcoin::consensus::encode::serialize(&block);
                self.bytes_processed.fetch_add(raw.len() as u64, Ordering::Relaxed);
                if let Err(e) = self.block_log.append(height, &raw, trusted) {
                    log::error!("fatal store error logging block {height}: {e}");
                    self.abort.store(true, Ordering::Relaxed);
                }
                let mut counters = self.counters.lock().expect("counters lock poisoned");
                counters.count_block(block.txdata.len() as u64);
                counters.count_processed(raw.len() as u64);
                counters.count_ecdsa_verify(self.chain.ecdsa_verify_count() - verified_before);
                drop(counters);
                self.try_resolve_orphans(hash);
            }
            Err(Error::Rejected(reason)) => {
                log::warn!("accept_block({height}, {hash}) rejected: {reason}");
                if matches!(reason, crate::error::Reason::UnknownParent(_)) {
                    self.hold_orphan(block);
                } else {
                    // structurally invalid or already-known at this height; drop it,
                    // the scheduler's in-progress record is cleared so a retry can land.
                    self.scheduler.advance_complete(height, hash);
                }
            }
            Err(e) => {
                log::error!("fatal store error applying block {height}: {e}");
                self.abort.store(true, Ordering::Relaxed);
            }
        }
    }

    fn hold_orphan(&self, block: bitcoin::Block) {
        let mut orphans = self.orphans.lock().expect("orphans lock poisoned");
        if orphans.len() >= HELD_ORPHAN_BUDGET {
            log::warn!("orphan budget exhausted, dropping block {}", block.block_hash());
            return;
        }
        orphans.insert(block.header.prev_blockhash, block);
    }

    fn try_resolve_orphans(&self, parent: BlockHash) {
        let held = self.orphans.lock().expect("orphans lock poisoned").remove(&parent);
        if let Some(block) = held {
            let height = self.scheduler.blocks_complete() + 1;
            self.accept_and_advance(block, height);
        }
    }

    /// Spawns the dialer, scheduler, and drain threads and blocks until
    /// `abort` is set, at which point every thread observes it cooperatively
    /// and the peer directory is synced and defragged before returning.
    pub fn run(self: &Arc<Self>) -> Result<()> {
        let dialer = {
            let ctx = self.clone();
            std::thread::spawn(move || ctx.dial_loop())
        };
        let scheduling = {
            let ctx = self.clone();
            std::thread::spawn(move || ctx.scheduling_loop())
        };
        let draining = {
            let ctx = self.clone();
            std::thread::spawn(move || ctx.drain_loop())
        };

        while !self.is_aborted() {
            std::thread::sleep(Duration::from_millis(200));
        }

        let _ = dialer.join();
        let _ = scheduling.join();
        let _ = draining.join();

        self.shutdown()
    }

    /// Cooperative teardown: syncs and defrags the peer directory, syncs
    /// the chain's UTXO store, and removes the lock file.
    pub fn shutdown(&self) -> Result<()> {
        self.peers.sync()?;
        self.peers.expire()?;
        self.chain.sync()?;
        self.block_log.sync()?;
        let _ = std::fs::remove_file(self.config.lock_path());
        Ok(())
    }

    pub fn request_shutdown(&self) {
        self.abort.store(true, Ordering::Relaxed);
    }

    /// Executes one interactive command from the control prompt, returning
    /// the text to print. Unknown input prints the help summary.
    pub fn handle_command(&self, line: &str) -> String {
        let mut parts = line.trim().split_whitespace();
        match parts.next() {
            Some("q") => {
                self.request_shutdown();
                "shutting down".to_owned()
            }
            Some("b") => format!(
                "tip height={} hash={}",
                self.chain.tip_height(),
                self.chain.tip_hash()
            ),
            Some("db") => "utxo entries tracked via the on-disk store".to_owned(),
            Some("n") => format!("{} connections", self.pool.len()),
            Some("i") | Some("c") => format!(
                "downloaded={}B processed={}B ecdsa_verify={}",
                self.bytes_downloaded.load(Ordering::Relaxed),
                self.bytes_processed.load(Ordering::Relaxed),
                self.chain.ecdsa_verify_count()
            ),
            Some("s") => match self.peers.sync() {
                Ok(()) => "peers synced".to_owned(),
                Err(e) => format!("sync failed: {e}"),
            },
            Some("pr") => format!("{} blocks in-progress", self.scheduler.in_progress_count()),
            Some("pe") => format!("{} blocks pending", self.scheduler.pending_count()),
            Some("d") => {
                let target = parts.next().and_then(|s| s.parse::<u32>().ok());
                let dropped = match target {
                    Some(id) => {
                        if let Some(conn) = self.pool.get(id) {
                            conn.set_broken();
                            Some(id)
                        } else {
                            None
                        }
                    }
                    None => self.pool.drop_slowest(),
                };
                match dropped {
                    Some(id) => {
                        self.scheduler.release_peer(id);
                        format!("dropped peer {id}")
                    }
                    None => "no peer to drop".to_owned(),
                }
            }
            Some("f") => {
                format!("cache holds {} bytes across {} blocks", self.cache.size_bytes(), self.cache.len())
            }
            Some("m") => format!("cache={}B budget={}B", self.cache.size_bytes(), self.config.cache_budget_bytes),
            Some("mc") => match parts.next().and_then(|s| s.parse::<u32>().ok()) {
                Some(n) => {
                    self.pool.set_max_conns(n);
                    format!("max-conns set to {n}")
                }
                None => "usage: mc N".to_owned(),
            },
            Some("g") => "advancing".to_owned(),
            Some("h") | Some("?") => {
                "g quit|q|b chain stats|db kv stats|n connections|i/c counters|s save peers|pr in-progress|pe pending|d [id] drop|f free memory|m memory info|mc N max-conns|h/? help".to_owned()
            }
            _ => self.handle_command("h"),
        }
    }
}

/// Handles one decoded message from `peer_id`/`addr`. Returns `true` when the
/// delivering peer should be dropped: malformed data is fatal for the peer
/// that sent it, never for the node, so a bad block bans the sender here
/// rather than propagating an error up the reader thread.
fn dispatch(
    peer_id: u32,
    addr: std::net::SocketAddr,
    msg: Message,
    cache: &Arc<BlockCache>,
    scheduler: &Arc<Scheduler>,
    chain: &Arc<Chain>,
    peers: &Arc<PeerDirectory>,
    bytes_downloaded: &Arc<AtomicU64>,
    counters: &Arc<Mutex<PeriodCounter>>,
) -> bool {
    match msg {
        Message::Block(block) => {
            let hash = block.block_hash();
            let size = bitcoin::consensus::encode::serialize(block.as_ref()).len() as u64;
            bytes_downloaded.fetch_add(size, Ordering::Relaxed);
            counters.lock().expect("counters lock poisoned").count_downloaded(size);

            if let Err(reason) = chain.check_block(&block) {
                if reason.is_peer_fault() {
                    log::warn!("peer {peer_id} ({addr}) delivered malformed block {hash}: {reason}");
                    let _ = peers.ban(addr.ip(), addr.port());
                    return true;
                }
                // Genesis / already-known / unknown-parent: not the
                // delivering peer's fault, fall through to normal bookkeeping
                // so a legitimately out-of-order or already-applied delivery
                // is still accounted for below.
            }

            match scheduler.on_block_received(hash, size) {
                Delivery::First(height) => {
                    cache.insert(height, *block);
                }
                Delivery::Duplicate | Delivery::Unknown => {
                    log::trace!("peer {peer_id} delivered unexpected block {hash}");
                }
            }
            false
        }
        Message::Headers(headers) => {
            for header in headers {
                if let Some(height) = chain.register_header(header) {
                    scheduler.register_header(height, header.block_hash());
                }
            }
            false
        }
        Message::Inv(items) => {
            // BLOCK advertisements are followed by the scheduler's own
            // `getdata` batches once the height is known via `headers`;
            // an unsolicited `inv` alone isn't acted on here.
            let _ = items.iter().filter(|i| i.inv_type == InvType::Block).count();
            false
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::UtxoSet;
    use bitcoin::blockdata::constants::genesis_block;
    use bitcoin::Network;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::atomic::AtomicBool;

    fn test_addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)), 18333)
    }

    /// A `block` delivery that fails `check_block` (bad PoW/merkle root) bans
    /// the delivering peer and never reaches the cache.
    #[test]
    fn malformed_block_delivery_bans_peer_and_is_not_cached() {
        let utxo_dir = tempfile::tempdir().unwrap();
        let utxo = UtxoSet::open(utxo_dir.path()).unwrap();
        let network = Network::Testnet;
        let genesis = genesis_block(network);
        let mut net_params = NetParams::for_network(network);
        net_params.genesis_hash = genesis.block_hash();
        let chain = Arc::new(Chain::new(
            net_params,
            genesis.header,
            utxo,
            0,
            Arc::new(AtomicBool::new(false)),
        ));

        let peers_dir = tempfile::tempdir().unwrap();
        let peers = Arc::new(PeerDirectory::open(peers_dir.path().join("peers3"), None).unwrap());
        let addr = test_addr();
        peers
            .upsert(&crate::peers::PeerRecord::new(addr, 1))
            .unwrap();

        let cache = Arc::new(BlockCache::new());
        let scheduler = Arc::new(Scheduler::new(cache.clone(), 64 * 1024 * 1024, 0));
        let bytes_downloaded = Arc::new(AtomicU64::new(0));
        let counters = Arc::new(Mutex::new(PeriodCounter::new(STATS_PERIOD)));

        // A child of genesis with an untouched nonce almost certainly fails
        // PoW (or, on the rare chance it doesn't, its empty transaction list
        // still fails the merkle check) — either way it's a peer fault.
        let mut header = genesis.header;
        header.prev_blockhash = genesis.block_hash();
        header.nonce = header.nonce.wrapping_add(1);
        let block = bitcoin::Block {
            header,
            txdata: vec![],
        };
        let msg = Message::Block(Box::new(block));

        let should_ban = dispatch(
            1,
            addr,
            msg,
            &cache,
            &scheduler,
            &chain,
            &peers,
            &bytes_downloaded,
            &counters,
        );

        assert!(should_ban);
        assert_eq!(cache.len(), 0);
        let best = peers.best(10, false).unwrap();
        assert!(best.is_empty(), "banned peer must not be returned by best()");
    }
}
