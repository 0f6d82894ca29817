use bitcoin::{OutPoint, ScriptBuf};

/// `outpoint -> (value, pk_script, height, coinbase?)`. Total ordering on
/// `OutPoint` itself is lexicographic on `(txid, vout)`, inherited from
/// `bitcoin::OutPoint`'s own derived `Ord`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoEntry {
    pub value: u64,
    pub pk_script: ScriptBuf,
    pub height: u32,
    pub coinbase: bool,
}

/// Per-accepted-block record of what would need to be restored to roll the
/// block back: the UTXO entries it spent (to be re-inserted) and the
/// outpoints it created (to be removed).
#[derive(Debug, Clone, Default)]
pub struct Undo {
    pub spent: Vec<(OutPoint, UtxoEntry)>,
    pub created: Vec<OutPoint>,
}

/// One node of the block-tree DAG rooted at genesis.
#[derive(Debug, Clone)]
pub struct TreeNode {
    pub hash: bitcoin::BlockHash,
    pub parent_hash: bitcoin::BlockHash,
    pub height: u32,
    pub cumulative_work: bitcoin::Work,
    pub header: bitcoin::block::Header,
    pub block_present: bool,
}
