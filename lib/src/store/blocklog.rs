use crate::error::Result;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Mutex;

/// Sequential, append-only log of every accepted block body: `height: u32 LE,
/// raw_len: u32 LE, raw_block: [u8; raw_len], flags: u32 LE (bit 0 = trusted)`,
/// stored at `<home>/blockchain.dat`. Distinct from the `unspent/` and `peers3`
/// [`Store`](crate::store::Store) files: there is no key, no delete, no
/// defrag, only append and a one-shot sequential [`replay`]. Its presence on
/// disk is what a node treats as "not first run".
pub struct BlockLog {
    file: Mutex<File>,
}

impl BlockLog {
    pub fn exists(path: impl AsRef<Path>) -> bool {
        path.as_ref().exists()
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Ok(BlockLog {
            file: Mutex::new(file),
        })
    }

    /// Appends one record for a block accepted at `height`.
    pub fn append(&self, height: u32, raw_block: &[u8], trusted: bool) -> Result<()> {
        let mut file = self.file.lock().expect("block log lock poisoned");
        file.seek(SeekFrom::End(0))?;
        let mut writer = BufWriter::new(&mut *file);
        writer.write_all(&height.to_le_bytes())?;
        writer.write_all(&(raw_block.len() as u32).to_le_bytes())?;
        writer.write_all(raw_block)?;
        let flags: u32 = if trusted { 1 } else { 0 };
        writer.write_all(&flags.to_le_bytes())?;
        writer.flush()?;
        Ok(())
    }

    /// Replays every whole record in the file in write order, stopping
    /// cleanly at the first short or torn tail record instead of failing —
    /// the same durability contract as the KV store: a crash mid-append
    /// never corrupts a previously completed record.
    pub fn replay<F: FnMut(u32, Vec<u8>, bool)>(path: impl AsRef<Path>, mut f: F) -> Result<()> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(());
        }
        let mut reader = File::open(path)?;
        loop {
            let mut height_buf = [0u8; 4];
            if !read_exact_or_eof(&mut reader, &mut height_buf)? {
                break;
            }
            let mut len_buf = [0u8; 4];
            if reader.read_exact(&mut len_buf).is_err() {
                break;
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            if len > 32 * 1024 * 1024 {
                break;
            }
            let mut raw = vec![0u8; len];
            if reader.read_exact(&mut raw).is_err() {
                break;
            }
            let mut flags_buf = [0u8; 4];
            if reader.read_exact(&mut flags_buf).is_err() {
                break;
            }
            let trusted = u32::from_le_bytes(flags_buf) & 1 == 1;
            f(u32::from_le_bytes(height_buf), raw, trusted);
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.lock().expect("block log lock poisoned").sync_all()?;
        Ok(())
    }
}

fn read_exact_or_eof(r: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    let mut read = 0;
    while read < buf.len() {
        match r.read(&mut buf[read..]) {
            Ok(0) => return Ok(false),
            Ok(n) => read += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_replay_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blockchain.dat");
        let log = BlockLog::open(&path).unwrap();
        log.append(1, b"first-block-bytes", false).unwrap();
        log.append(2, b"second-block-bytes", true).unwrap();
        log.sync().unwrap();

        let mut seen = Vec::new();
        BlockLog::replay(&path, |height, raw, trusted| seen.push((height, raw, trusted))).unwrap();
        assert_eq!(
            seen,
            vec![
                (1, b"first-block-bytes".to_vec(), false),
                (2, b"second-block-bytes".to_vec(), true),
            ]
        );
    }

    #[test]
    fn absent_file_replays_as_empty_and_signals_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blockchain.dat");
        assert!(!BlockLog::exists(&path));
        let mut seen = Vec::new();
        BlockLog::replay(&path, |h, r, t| seen.push((h, r, t))).unwrap();
        assert!(seen.is_empty());
    }

    #[test]
    fn truncated_trailing_record_stops_replay_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blockchain.dat");
        let log = BlockLog::open(&path).unwrap();
        log.append(1, b"whole", false).unwrap();
        drop(log);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&2u32.to_le_bytes()).unwrap();
        file.write_all(&1000u32.to_le_bytes()).unwrap();
        drop(file);

        let mut seen = Vec::new();
        BlockLog::replay(&path, |h, r, t| seen.push((h, r, t))).unwrap();
        assert_eq!(seen, vec![(1, b"whole".to_vec(), false)]);
    }
}
