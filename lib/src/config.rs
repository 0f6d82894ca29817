#[cfg(feature = "clap")]
use clap::Parser;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Process-wide configuration, most important the home directory and network.
///
/// A flat, `clap`-derivable struct behind a `cli` feature, with
/// network-specific constants resolved from the chosen [`bitcoin::Network`]
/// rather than hardcoded at each call site.
#[cfg_attr(feature = "clap", derive(Parser))]
#[derive(Debug, Clone)]
pub struct Config {
    /// Home directory: holds `blockchain.dat`, `unspent/`, `peers3`, `LOCK`
    #[cfg_attr(feature = "clap", arg(short, long))]
    pub home: PathBuf,

    /// Network (bitcoin mainnet or testnet3; regtest/signet are not part of this core)
    #[cfg_attr(feature = "clap", arg(short, long))]
    pub network: bitcoin::Network,

    /// Maximum number of simultaneous outbound peer connections
    #[cfg_attr(feature = "clap", arg(long, default_value = "64"))]
    pub max_conns: u32,

    /// Block cache memory budget in bytes; the scheduler never requests blocks
    /// whose expected total would exceed this
    #[cfg_attr(feature = "clap", arg(long, default_value = "536870912"))]
    pub cache_budget_bytes: u64,

    /// Blocks at or below this height are accepted without script verification
    #[cfg_attr(feature = "clap", arg(long, default_value = "0"))]
    pub trust_up_to: u32,

    /// Bypass the peer directory and DNS seeds entirely, connecting only to this address
    #[cfg_attr(feature = "clap", arg(long))]
    pub single_peer: Option<SocketAddr>,

    /// Directory containing a legacy `blkNNNNN.dat` block database to bulk-import on first run
    #[cfg_attr(feature = "clap", arg(long))]
    pub legacy_blocks_dir: Option<PathBuf>,
}

impl Config {
    /// Creates a config with `home` and `network` and sensible defaults
    pub fn new<P: AsRef<Path>>(home: P, network: bitcoin::Network) -> Self {
        Self {
            home: home.as_ref().to_owned(),
            network,
            max_conns: 64,
            cache_budget_bytes: 512 * 1024 * 1024,
            trust_up_to: 0,
            single_peer: None,
            legacy_blocks_dir: None,
        }
    }

    pub fn blockchain_path(&self) -> PathBuf {
        self.home.join("blockchain.dat")
    }

    pub fn unspent_dir(&self) -> PathBuf {
        self.home.join("unspent")
    }

    pub fn peers_path(&self) -> PathBuf {
        self.home.join("peers3")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.home.join("LOCK")
    }

    /// Network-specific protocol constants for `self.network`
    pub fn net_params(&self) -> crate::net::NetParams {
        crate::net::NetParams::for_network(self.network)
    }
}
