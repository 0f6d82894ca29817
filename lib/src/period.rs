use std::fmt;
use std::fmt::Formatter;
use std::time::Duration;
use std::time::Instant;

/// Contains counters and instants to provide per-period throughput stats.
///
/// Tracks bytes downloaded, bytes processed (applied to the UTXO set) and
/// ECDSA verifications, since the importer and control loop both report on
/// all four.
#[derive(Debug)]
pub struct PeriodCounter {
    start: Instant,
    last: Instant,
    stats: Stats,
    period: Duration,
}

#[derive(Debug, Default, Clone)]
pub struct Stats {
    current: Counts,
    total: Counts,
}

#[derive(Debug, Default, Clone)]
struct Counts {
    blocks: u64,
    txs: u64,
    bytes_downloaded: u64,
    bytes_processed: u64,
    ecdsa_verify: u64,
    period: Duration,
}

impl Counts {
    fn blocks(&self) -> u64 {
        self.blocks
    }
    fn per_sec(&self, n: u64) -> u64 {
        let millis = self.period.as_millis();
        if millis == 0 {
            0
        } else {
            ((n as u128 * 1000u128) / millis) as u64
        }
    }
}

impl PeriodCounter {
    /// Create a [`PeriodCounter`] with given `period`
    pub fn new(period: Duration) -> Self {
        PeriodCounter {
            start: Instant::now(),
            last: Instant::now(),
            stats: Default::default(),
            period,
        }
    }

    /// Record one accepted block with `txs` transactions
    pub fn count_block(&mut self, txs: u64) {
        self.stats.current.blocks += 1;
        self.stats.current.txs += txs;
        self.stats.total.blocks += 1;
        self.stats.total.txs += txs;
    }

    /// Record `n` bytes pulled off the wire, not yet applied
    pub fn count_downloaded(&mut self, n: u64) {
        self.stats.current.bytes_downloaded += n;
        self.stats.total.bytes_downloaded += n;
    }

    /// Record `n` bytes of a block that has been applied to the chain/UTXO
    pub fn count_processed(&mut self, n: u64) {
        self.stats.current.bytes_processed += n;
        self.stats.total.bytes_processed += n;
    }

    /// Record `n` signature checks performed
    pub fn count_ecdsa_verify(&mut self, n: u64) {
        self.stats.current.ecdsa_verify += n;
        self.stats.total.ecdsa_verify += n;
    }

    /// If `self.period` has passed since last invocation return stats
    pub fn period_elapsed(&mut self) -> Option<Stats> {
        if self.last.elapsed() >= self.period {
            self.stats.total.period = self.start.elapsed();
            self.stats.current.period = self.last.elapsed();
            let return_value = self.stats.clone();
            self.stats.current = Counts::default();
            self.last = Instant::now();
            Some(return_value)
        } else {
            None
        }
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Current {}: {:>5} blk/s; {:>6} txs/s; {:>6} KB/s dl; {:>6} KB/s proc; {:>6} ecdsa/s; Total: {:>5} blk/s",
            self.total.blocks(),
            self.current.per_sec(self.current.blocks),
            self.current.per_sec(self.current.txs),
            self.current.per_sec(self.current.bytes_downloaded) / 1000,
            self.current.per_sec(self.current.bytes_processed) / 1000,
            self.current.per_sec(self.current.ecdsa_verify),
            self.total.per_sec(self.total.blocks),
        )
    }
}

/// Utility used to return true after `period`
pub struct Periodic {
    last: Instant,
    period: Duration,
}
impl Periodic {
    /// Create [`Periodic`]
    pub fn new(period: Duration) -> Self {
        Periodic {
            last: Instant::now(),
            period,
        }
    }
    /// Returns `true` if `self.period` elapsed from last time
    pub fn elapsed(&mut self) -> bool {
        if self.last.elapsed() > self.period {
            self.last = Instant::now();
            true
        } else {
            false
        }
    }
}
