use crate::chain::Chain;
use crate::config::Config;
use crate::error::{Error, Reason, Result};
use crate::period::PeriodCounter;
use crate::store::BlockLog;
use bitcoin::consensus::encode::Decodable;
use bitcoin::Block;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STATS_PERIOD: Duration = Duration::from_secs(10);

/// Bulk-ingests a legacy on-disk block database. Reads `blkNNNNN.dat` files
/// in ascending numeric order, each a concatenation of `{magic: 4 bytes,
/// length: u32 LE, raw_block: length bytes}` records. Stopping at the first
/// truncated or unparseable record in a file is end-of-data, not fatal.
/// Every block it accepts is also appended to `block_log`
/// (`blockchain.dat`), so an aborted run resumes past whatever it already
/// committed instead of re-validating from scratch.
pub struct Importer {
    chain: Arc<Chain>,
    block_log: BlockLog,
    magic: [u8; 4],
    trusted: bool,
    abort: Arc<AtomicBool>,
}

impl Importer {
    pub fn new(chain: Arc<Chain>, block_log: BlockLog, magic: [u8; 4], trusted: bool, abort: Arc<AtomicBool>) -> Self {
        Importer {
            chain,
            block_log,
            magic,
            trusted,
            abort,
        }
    }

    /// Runs the import against every `blkNNNNN.dat` file under `dir`, in
    /// ascending numeric order. Returns the number of blocks successfully
    /// accepted. On interrupt (the abort flag observed between blocks) the
    /// chain is synced and the function returns normally with whatever
    /// count was reached so far.
    pub fn run(&self, dir: &Path) -> Result<u64> {
        let mut files = legacy_block_files(dir)?;
        files.sort_by_key(|(n, _)| *n);

        let mut counter = PeriodCounter::new(STATS_PERIOD);
        let mut accepted = 0u64;

        'files: for (_, path) in files {
            let file = File::open(&path)?;
            let mut reader = BufReader::new(file);
            loop {
                if self.abort.load(Ordering::Relaxed) {
                    break 'files;
                }
                match read_one_block(&mut reader, self.magic) {
                    Ok(Some(block)) => {
                        let raw = bitcoin::consensus::encode::serialize(&block);
                        counter.count_downloaded(raw.len() as u64);
                        match self.accept(&block) {
                            Ok(()) => {
                                accepted += 1;
                                counter.count_block(block.txdata.len() as u64);
                                counter.count_processed(raw.len() as u64);
                                let height = self.chain.tip_height();
                                if let Err(e) = self.block_log.append(height, &raw, self.trusted) {
                                    log::error!("fatal store error logging imported block {height}: {e}");
                                    self.abort.store(true, Ordering::Relaxed);
                                    break 'files;
                                }
                            }
                            Err(Reason::AlreadyKnown) => {
                                log::debug!("import: block {} already known, skipping", block.block_hash());
                            }
                            Err(reason) => {
                                log::warn!("import: block {} rejected: {reason}", block.block_hash());
                            }
                        }
                    }
                    Ok(None) => continue 'files,
                    Err(_) => continue 'files,
                }
                if let Some(stats) = counter.period_elapsed() {
                    log::info!("{stats}");
                }
            }
        }

        self.chain.sync()?;
        self.block_log.sync()?;
        Ok(accepted)
    }

    fn accept(&self, block: &Block) -> std::result::Result<(), Reason> {
        match self.chain.check_block(block) {
            Ok(()) => {}
            Err(Reason::Genesis) => return Ok(()),
            Err(reason) => return Err(reason),
        }
        match self.chain.accept_block(block, self.trusted) {
            Ok(()) => Ok(()),
            Err(Error::Rejected(reason)) => Err(reason),
            Err(_store_failure) => Err(Reason::Aborted),
        }
    }
}

/// Lists `blkNNNNN.dat` files under `dir` paired with their numeric index.
fn legacy_block_files(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let pattern = dir.join("blk*.dat");
    let mut files = Vec::new();
    for entry in glob::glob(pattern.to_string_lossy().as_ref()).map_err(|e| Error::Protocol(e.to_string()))? {
        let path = entry.map_err(|e| Error::Protocol(e.to_string()))?;
        if let Some(index) = parse_block_file_index(&path) {
            files.push((index, path));
        }
    }
    Ok(files)
}

fn parse_block_file_index(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_str()?;
    stem.strip_prefix("blk")?.parse().ok()
}

/// Reads one `{magic, length, raw_block}` record. `Ok(None)` signals a
/// clean end-of-file; a truncated or malformed record (magic mismatch,
/// short read, or a block that fails to decode) is end-of-data for this
/// file too, since the legacy writer only ever appends whole records.
fn read_one_block(reader: &mut impl Read, magic: [u8; 4]) -> std::io::Result<Option<Block>> {
    let mut magic_buf = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut magic_buf) {
        return if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Ok(None)
        } else {
            Err(e)
        };
    }
    if magic_buf != magic {
        return Ok(None);
    }
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len == 0 || len > 32 * 1024 * 1024 {
        return Ok(None);
    }
    let mut raw = vec![0u8; len];
    reader.read_exact(&mut raw)?;
    match Block::consensus_decode(&mut raw.as_slice()) {
        Ok(block) => Ok(Some(block)),
        Err(_) => Ok(None),
    }
}

/// Convenience entry point used by the `importer` binary: builds a chain
/// over `config`'s network and imports `config.legacy_blocks_dir`.
pub fn import_from_config(config: &Config, chain: Arc<Chain>, abort: Arc<AtomicBool>) -> Result<u64> {
    let dir = config
        .legacy_blocks_dir
        .clone()
        .ok_or_else(|| Error::Protocol("no legacy_blocks_dir configured".into()))?;
    let trusted = true;
    let block_log = BlockLog::open(config.blockchain_path())?;
    let importer = Importer::new(chain, block_log, config.net_params().magic, trusted, abort);
    importer.run(&dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::UtxoSet;
    use crate::net::NetParams;
    use bitcoin::blockdata::constants::genesis_block;
    use bitcoin::Network;
    use std::io::Write;

    fn write_legacy_file(path: &Path, magic: [u8; 4], blocks: &[Block]) {
        let mut file = File::create(path).unwrap();
        for block in blocks {
            let raw = bitcoin::consensus::encode::serialize(block);
            file.write_all(&magic).unwrap();
            file.write_all(&(raw.len() as u32).to_le_bytes()).unwrap();
            file.write_all(&raw).unwrap();
        }
    }

    #[test]
    fn genesis_only_file_imports_zero_new_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let network = Network::Testnet;
        let genesis = genesis_block(network);
        write_legacy_file(&dir.path().join("blk00000.dat"), NetParams::for_network(network).magic, &[genesis.clone()]);

        let utxo_dir = tempfile::tempdir().unwrap();
        let utxo = UtxoSet::open(utxo_dir.path()).unwrap();
        let mut net_params = NetParams::for_network(network);
        net_params.genesis_hash = genesis.block_hash();
        let chain = Arc::new(Chain::new(net_params, genesis.header, utxo, 0, Arc::new(AtomicBool::new(false))));

        let block_log = BlockLog::open(dir.path().join("blockchain.dat")).unwrap();
        let importer = Importer::new(chain.clone(), block_log, net_params.magic, true, Arc::new(AtomicBool::new(false)));
        let accepted = importer.run(dir.path()).unwrap();
        assert_eq!(accepted, 0);
        assert_eq!(chain.tip_hash(), genesis.block_hash());
    }

    #[test]
    fn truncated_trailing_record_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let network = Network::Testnet;
        let genesis = genesis_block(network);
        let magic = NetParams::for_network(network).magic;
        let path = dir.path().join("blk00000.dat");
        write_legacy_file(&path, magic, &[genesis.clone()]);
        // append a truncated trailing record: magic + length but no body.
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&magic).unwrap();
        file.write_all(&1000u32.to_le_bytes()).unwrap();
        drop(file);

        let utxo_dir = tempfile::tempdir().unwrap();
        let utxo = UtxoSet::open(utxo_dir.path()).unwrap();
        let mut net_params = NetParams::for_network(network);
        net_params.genesis_hash = genesis.block_hash();
        let chain = Arc::new(Chain::new(net_params, genesis.header, utxo, 0, Arc::new(AtomicBool::new(false))));
        let block_log = BlockLog::open(dir.path().join("blockchain.dat")).unwrap();
        let importer = Importer::new(chain, block_log, net_params.magic, true, Arc::new(AtomicBool::new(false)));

        // must return cleanly rather than propagating an I/O error.
        assert!(importer.run(dir.path()).is_ok());
    }
}
