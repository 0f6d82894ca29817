use crate::chain::types::{Undo, UtxoEntry};
use crate::error::Result;
use crate::store::Store;
use bitcoin::hashes::Hash;
use bitcoin::{OutPoint, ScriptBuf, Txid};
use std::hash::Hasher;
use std::path::Path;

/// The unspent-output index, backed by the same append-mostly [`Store`] as
/// the peer directory.
/// Outpoints are mapped to the store's 64-bit key space by an `fxhash`
/// fingerprint of `(txid, vout)`; a fingerprint collision would silently
/// conflate two different outpoints, so entries are self-describing (the
/// value carries the full txid) and every lookup checks it, the same defense
/// the peer directory doesn't need because its keys are cheap to make exact.
pub struct UtxoSet {
    store: Store,
}

impl UtxoSet {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(UtxoSet {
            store: Store::open(path)?,
        })
    }

    fn key(outpoint: &OutPoint) -> u64 {
        let mut hasher = fxhash::FxHasher::default();
        hasher.write(outpoint.txid.as_ref());
        hasher.write_u32(outpoint.vout);
        hasher.finish()
    }

    pub fn get(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>> {
        let Some(bytes) = self.store.get(Self::key(outpoint))? else {
            return Ok(None);
        };
        Ok(decode(outpoint.txid, &bytes).map(|(_, entry)| entry))
    }

    pub fn insert(&self, outpoint: OutPoint, entry: UtxoEntry) -> Result<()> {
        self.store.put(Self::key(&outpoint), encode(&outpoint, &entry))
    }

    pub fn remove(&self, outpoint: &OutPoint) -> Result<()> {
        self.store.del(Self::key(outpoint))
    }

    /// Applies one block's worth of spends/creates: removes each newly
    /// created output that the block itself spends within the same pass is
    /// the caller's job (it must not call this until it has already resolved
    /// every input), this just performs the raw insert/remove pair.
    pub fn apply(&self, created: &[(OutPoint, UtxoEntry)], spent: &[OutPoint]) -> Result<()> {
        for outpoint in spent {
            self.remove(outpoint)?;
        }
        for (outpoint, entry) in created {
            self.insert(*outpoint, entry.clone())?;
        }
        Ok(())
    }

    /// Reverses one block's effect using its stored undo record: re-inserts
    /// what it spent, removes what it created.
    pub fn rollback(&self, undo: &Undo) -> Result<()> {
        for outpoint in &undo.created {
            self.remove(outpoint)?;
        }
        for (outpoint, entry) in &undo.spent {
            self.insert(*outpoint, entry.clone())?;
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.store.sync()
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

/// On-disk layout: `txhash: [u8;32], vout: u32 LE, value: u64 LE,
/// height: u32 LE, flags: u8 (bit 0 = coinbase), pk_script: var-bytes`.
fn encode(outpoint: &OutPoint, entry: &UtxoEntry) -> Vec<u8> {
    let script_bytes = entry.pk_script.as_bytes();
    let mut buf = Vec::with_capacity(32 + 4 + 8 + 4 + 1 + 5 + script_bytes.len());
    buf.extend_from_slice(outpoint.txid.as_ref());
    buf.extend_from_slice(&outpoint.vout.to_le_bytes());
    buf.extend_from_slice(&entry.value.to_le_bytes());
    buf.extend_from_slice(&entry.height.to_le_bytes());
    buf.push(if entry.coinbase { 1 } else { 0 });
    write_var_len(&mut buf, script_bytes.len() as u64);
    buf.extend_from_slice(script_bytes);
    buf
}

fn decode(expected_txid: Txid, bytes: &[u8]) -> Option<(OutPoint, UtxoEntry)> {
    if bytes.len() < 32 + 4 + 8 + 4 + 1 {
        return None;
    }
    let txid = Txid::from_slice(&bytes[0..32]).ok()?;
    if txid != expected_txid {
        // fingerprint collision with a different outpoint's txid; treat as a miss
        return None;
    }
    let vout = u32::from_le_bytes(bytes[32..36].try_into().ok()?);
    let value = u64::from_le_bytes(bytes[36..44].try_into().ok()?);
    let height = u32::from_le_bytes(bytes[44..48].try_into().ok()?);
    let coinbase = bytes[48] & 1 == 1;
    let (len, offset) = read_var_len(&bytes[49..])?;
    let script_start = 49 + offset;
    let pk_script = ScriptBuf::from(bytes.get(script_start..script_start + len as usize)?.to_vec());
    Some((
        OutPoint { txid, vout },
        UtxoEntry {
            value,
            pk_script,
            height,
            coinbase,
        },
    ))
}

fn write_var_len(buf: &mut Vec<u8>, n: u64) {
    buf.extend_from_slice(&(n as u32).to_le_bytes());
}

fn read_var_len(bytes: &[u8]) -> Option<(u64, usize)> {
    let n = u32::from_le_bytes(bytes.get(0..4)?.try_into().ok()?);
    Some((n as u64, 4))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entry(value: u64) -> UtxoEntry {
        UtxoEntry {
            value,
            pk_script: ScriptBuf::from(vec![0x76, 0xa9]),
            height: 100,
            coinbase: false,
        }
    }

    #[test]
    fn insert_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let utxos = UtxoSet::open(dir.path().join("unspent")).unwrap();
        let outpoint = OutPoint {
            txid: Txid::from_byte_array([7u8; 32]),
            vout: 0,
        };
        utxos.insert(outpoint, sample_entry(5000)).unwrap();
        assert_eq!(utxos.get(&outpoint).unwrap(), Some(sample_entry(5000)));
        utxos.remove(&outpoint).unwrap();
        assert_eq!(utxos.get(&outpoint).unwrap(), None);
    }

    #[test]
    fn rollback_restores_spent_and_removes_created() {
        let dir = tempfile::tempdir().unwrap();
        let utxos = UtxoSet::open(dir.path().join("unspent")).unwrap();
        let spent_outpoint = OutPoint {
            txid: Txid::from_byte_array([1u8; 32]),
            vout: 0,
        };
        let created_outpoint = OutPoint {
            txid: Txid::from_byte_array([2u8; 32]),
            vout: 0,
        };
        utxos.insert(created_outpoint, sample_entry(1000)).unwrap();

        let undo = Undo {
            spent: vec![(spent_outpoint, sample_entry(2000))],
            created: vec![created_outpoint],
        };
        utxos.rollback(&undo).unwrap();

        assert_eq!(utxos.get(&spent_outpoint).unwrap(), Some(sample_entry(2000)));
        assert_eq!(utxos.get(&created_outpoint).unwrap(), None);
    }
}
