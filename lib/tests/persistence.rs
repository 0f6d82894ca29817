//! Exercises a restart: blocks accepted in one process are appended to the
//! sequential block log, and a freshly constructed chain replays that log to
//! reconstruct its header tree and tip while the UTXO set is read back
//! straight off disk, with nothing held only in memory surviving the gap.

use bitcoin::blockdata::constants::genesis_block;
use bitcoin::hashes::Hash;
use bitcoin::{
    absolute::LockTime, transaction::Version, Amount, Block, CompactTarget, OutPoint, ScriptBuf,
    Sequence, Transaction, TxIn, TxOut, Witness,
};
use block_ingest::chain::{Chain, UtxoSet};
use block_ingest::net::NetParams;
use block_ingest::store::BlockLog;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

const EASY_BITS: u32 = 0x207f_ffff;

fn coinbase_tx(extra_nonce: u8, value: u64) -> Transaction {
    Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::from(vec![extra_nonce]),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: ScriptBuf::from(vec![0x51]),
        }],
    }
}

fn mine_block(prev: &bitcoin::block::Header, txdata: Vec<Transaction>) -> Block {
    let mut header = bitcoin::block::Header {
        version: bitcoin::block::Version::TWO,
        prev_blockhash: prev.block_hash(),
        merkle_root: bitcoin::TxMerkleNode::all_zeros(),
        time: prev.time + 1,
        bits: CompactTarget::from_consensus(EASY_BITS),
        nonce: 0,
    };
    let block = Block { header, txdata };
    header.merkle_root = block.compute_merkle_root().expect("non-empty txdata");

    for nonce in 0..10_000u32 {
        header.nonce = nonce;
        if header.validate_pow(header.target()).is_ok() {
            return Block {
                header,
                txdata: block.txdata,
            };
        }
    }
    panic!("failed to find a proof-of-work-valid nonce against the easy target");
}

fn new_chain(unspent_dir: &std::path::Path) -> Chain {
    let network = bitcoin::Network::Testnet;
    let genesis = genesis_block(network);
    let mut net_params = NetParams::for_network(network);
    net_params.genesis_hash = genesis.block_hash();
    Chain::new(
        net_params,
        genesis.header,
        UtxoSet::open(unspent_dir).unwrap(),
        1_000_000,
        Arc::new(AtomicBool::new(false)),
    )
}

#[test]
fn restart_replays_block_log_and_preserves_utxo_state() {
    let home = tempfile::tempdir().unwrap();
    let unspent_dir = home.path().join("unspent");
    let blockchain_path = home.path().join("blockchain.dat");
    let genesis_header = genesis_block(bitcoin::Network::Testnet).header;

    let coinbase1 = coinbase_tx(1, 5_000_000_000);
    let block1 = mine_block(&genesis_header, vec![coinbase1]);
    let coinbase2 = coinbase_tx(2, 5_000_000_000);
    let block2 = mine_block(&block1.header, vec![coinbase2.clone()]);

    {
        let chain = new_chain(&unspent_dir);
        let block_log = BlockLog::open(&blockchain_path).unwrap();

        chain.accept_block(&block1, true).unwrap();
        block_log
            .append(1, &bitcoin::consensus::encode::serialize(&block1), true)
            .unwrap();

        chain.accept_block(&block2, true).unwrap();
        block_log
            .append(2, &bitcoin::consensus::encode::serialize(&block2), true)
            .unwrap();

        chain.sync().unwrap();
        block_log.sync().unwrap();
        assert_eq!(chain.tip_hash(), block2.block_hash());
        assert_eq!(chain.tip_height(), 2);
    } // chain, block_log and their in-memory tree all dropped here

    assert!(BlockLog::exists(&blockchain_path));

    // A fresh process: new chain, new UtxoSet handle, block log replayed.
    let chain = new_chain(&unspent_dir);
    assert_eq!(chain.tip_height(), 0, "a fresh chain starts back at genesis");

    let mut restored = 0u32;
    BlockLog::replay(&blockchain_path, |_height, raw, _trusted| {
        let block: Block = bitcoin::consensus::encode::deserialize(&raw).unwrap();
        chain.restore_header(block.header);
        restored += 1;
    })
    .unwrap();

    assert_eq!(restored, 2);
    assert_eq!(chain.tip_hash(), block2.block_hash());
    assert_eq!(chain.tip_height(), 2);
    assert!(chain.contains(&block1.block_hash()));

    // The UTXO set itself was never held only in memory; it is still there
    // under the same directory without any replay of its own.
    let utxo = UtxoSet::open(&unspent_dir).unwrap();
    let coinbase2_outpoint = OutPoint {
        txid: coinbase2.compute_txid(),
        vout: 0,
    };
    assert!(utxo.get(&coinbase2_outpoint).unwrap().is_some());
}

#[test]
fn truncated_trailing_block_log_record_does_not_block_restart() {
    let home = tempfile::tempdir().unwrap();
    let unspent_dir = home.path().join("unspent");
    let blockchain_path = home.path().join("blockchain.dat");
    let genesis_header = genesis_block(bitcoin::Network::Testnet).header;

    let coinbase1 = coinbase_tx(1, 5_000_000_000);
    let block1 = mine_block(&genesis_header, vec![coinbase1]);

    {
        let chain = new_chain(&unspent_dir);
        let block_log = BlockLog::open(&blockchain_path).unwrap();
        chain.accept_block(&block1, true).unwrap();
        block_log
            .append(1, &bitcoin::consensus::encode::serialize(&block1), true)
            .unwrap();
        block_log.sync().unwrap();
    }

    // Simulate a crash mid-append: a second record's length prefix with no
    // body behind it.
    {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&blockchain_path)
            .unwrap();
        file.write_all(&2u32.to_le_bytes()).unwrap();
        file.write_all(&500u32.to_le_bytes()).unwrap();
    }

    let chain = new_chain(&unspent_dir);
    let mut restored = 0u32;
    BlockLog::replay(&blockchain_path, |_height, raw, _trusted| {
        let block: Block = bitcoin::consensus::encode::deserialize(&raw).unwrap();
        chain.restore_header(block.header);
        restored += 1;
    })
    .unwrap();

    assert_eq!(restored, 1);
    assert_eq!(chain.tip_hash(), block1.block_hash());
    assert_eq!(chain.tip_height(), 1);
}
