//! Exercises the chain acceptor's reorg path end to end: a heavier side
//! branch overtakes the current tip, rolling back the UTXO changes the old
//! branch applied and re-applying the new branch's, using the stored undo
//! records through the real `UtxoSet` on disk.

use bitcoin::blockdata::constants::genesis_block;
use bitcoin::hashes::Hash;
use bitcoin::{
    absolute::LockTime, transaction::Version, Amount, Block, CompactTarget, OutPoint, ScriptBuf,
    Sequence, Transaction, TxIn, TxOut, Witness,
};
use block_ingest::chain::{Chain, UtxoSet};
use block_ingest::net::NetParams;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// `0x207fffff`: regtest-style maximum target, so `validate_pow` passes for
/// roughly half of all hashes, and a handful of nonce attempts is enough to
/// find one without real mining.
const EASY_BITS: u32 = 0x207f_ffff;

fn easy_target() -> CompactTarget {
    CompactTarget::from_consensus(EASY_BITS)
}

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
            script_pubkey: ScriptBuf::from(vec![0x51]), // OP_1, a script no test input tries to satisfy
        }],
    }
}

fn spend_tx(input: OutPoint, value: u64) -> Transaction {
    Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: input,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: ScriptBuf::from(vec![0x51]),
        }],
    }
}

/// Builds a block extending `prev`, mining a trivial nonce against
/// [`EASY_BITS`]. Panics if no nonce under the search bound satisfies proof
/// of work, which would only happen from a broken target constant.
fn mine_block(prev: &bitcoin::block::Header, txdata: Vec<Transaction>, time_offset: u32) -> Block {
    let mut header = bitcoin::block::Header {
        version: bitcoin::block::Version::TWO,
        prev_blockhash: prev.block_hash(),
        merkle_root: bitcoin::TxMerkleNode::all_zeros(),
        time: prev.time + 1 + time_offset,
        bits: easy_target(),
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

fn test_chain() -> (Chain, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let utxo = UtxoSet::open(dir.path().join("unspent")).unwrap();
    let network = bitcoin::Network::Testnet;
    let genesis = genesis_block(network);
    let mut net_params = NetParams::for_network(network);
    net_params.genesis_hash = genesis.block_hash();
    let chain = Chain::new(
        net_params,
        genesis.header,
        utxo,
        1_000_000, // trust_up_to: skip script verification for these hand-built blocks
        Arc::new(AtomicBool::new(false)),
    );
    (chain, dir)
}

#[test]
fn depth_two_reorg_restores_shared_ancestor_utxo_and_removes_losing_branch_outputs() {
    let (chain, dir) = test_chain();
    let genesis_header = genesis_block(bitcoin::Network::Testnet).header;

    // A block both branches share: its coinbase output pre-dates the fork,
    // so it should survive regardless of which branch ultimately wins.
    let base_coinbase = coinbase_tx(0, 5_000_000_000);
    let base = mine_block(&genesis_header, vec![base_coinbase.clone()], 0);
    chain.accept_block(&base, true).unwrap();
    let base_outpoint = OutPoint {
        txid: base_coinbase.compute_txid(),
        vout: 0,
    };

    // Branch A: one block that spends the shared output, plus a second
    // block on top. Two blocks total past the fork.
    let a1_coinbase = coinbase_tx(1, 5_000_000_000);
    let a1_spend = spend_tx(base_outpoint, 4_000_000_000);
    let a1 = mine_block(&base.header, vec![a1_coinbase, a1_spend.clone()], 0);
    chain.accept_block(&a1, true).unwrap();
    let a1_spend_outpoint = OutPoint {
        txid: a1_spend.compute_txid(),
        vout: 0,
    };

    let a2_coinbase = coinbase_tx(2, 5_000_000_000);
    let a2 = mine_block(&a1.header, vec![a2_coinbase], 0);
    chain.accept_block(&a2, true).unwrap();

    assert_eq!(chain.tip_hash(), a2.block_hash());
    assert_eq!(chain.tip_height(), 3);

    // The shared output is gone now (spent by A1); A's spend output exists.
    let utxo_check = UtxoSet::open(dir.path().join("unspent")).unwrap();
    assert_eq!(utxo_check.get(&base_outpoint).unwrap(), None);
    assert!(utxo_check.get(&a1_spend_outpoint).unwrap().is_some());

    // Branch B: three blocks on top of the same shared base, same easy
    // difficulty, so once B3 lands its cumulative work (3 blocks past the
    // fork) exceeds branch A's (2 blocks past the fork) and it takes over.
    let b1_coinbase = coinbase_tx(10, 5_000_000_000);
    let b1 = mine_block(&base.header, vec![b1_coinbase], 1);
    chain.accept_block(&b1, true).unwrap();
    // Branch A is still heavier after one B block; tip unchanged.
    assert_eq!(chain.tip_hash(), a2.block_hash());

    let b2_coinbase = coinbase_tx(11, 5_000_000_000);
    let b2 = mine_block(&b1.header, vec![b2_coinbase], 0);
    chain.accept_block(&b2, true).unwrap();
    // Tied cumulative work; ties favor the already-installed tip.
    assert_eq!(chain.tip_hash(), a2.block_hash());

    let b3_coinbase = coinbase_tx(12, 5_000_000_000);
    let b3 = mine_block(&b2.header, vec![b3_coinbase], 0);
    chain.accept_block(&b3, true).unwrap();

    assert_eq!(chain.tip_hash(), b3.block_hash());
    assert_eq!(chain.tip_height(), 4);

    // The shared output, spent only on the now-abandoned branch A, is
    // restored; A's own spend output, created only on that branch, is gone.
    let utxo_after_reorg = UtxoSet::open(dir.path().join("unspent")).unwrap();
    assert!(utxo_after_reorg.get(&base_outpoint).unwrap().is_some());
    assert_eq!(utxo_after_reorg.get(&a1_spend_outpoint).unwrap(), None);
}

#[test]
fn accept_block_on_already_accepted_block_is_idempotent_not_a_mutation() {
    let (chain, _dir) = test_chain();
    let genesis_header = genesis_block(bitcoin::Network::Testnet).header;
    let coinbase = coinbase_tx(1, 5_000_000_000);
    let block = mine_block(&genesis_header, vec![coinbase], 0);

    chain.accept_block(&block, true).unwrap();
    assert_eq!(chain.tip_height(), 1);

    // Re-delivering the same block is reported via `check_block`'s
    // `AlreadyKnown` path rather than being re-applied.
    let err = chain.check_block(&block).unwrap_err();
    assert_eq!(err, block_ingest::Reason::AlreadyKnown);
    assert_eq!(chain.tip_height(), 1);
}
