mod blocklog;
mod record;

pub use blocklog::BlockLog;

use crate::error::{Error, Result};
use record::Record;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Append-mostly file-backed key-value store (component 4.A).
///
/// A single file holds a sequence of self-checksummed [`Record`]s. An
/// in-memory index maps live keys to their most recent byte offset, rebuilt
/// by a full scan on open. Deletions append a tombstone rather than
/// rewriting the file in place; space is reclaimed only by [`Store::defrag`].
///
/// Concurrency: single-writer, many-reader, implemented with a `RwLock`
/// around the file handle and index — `get`/`browse` take a shared lock,
/// `put`/`del`/`defrag`/`sync` take an exclusive one. Every `File` is closed
/// by `Drop`; `close()` only makes the final `sync` explicit.
pub struct Store {
    path: PathBuf,
    inner: RwLock<Inner>,
}

struct Inner {
    file: File,
    /// key -> (offset of the record, live value length; `None` for a logical
    /// miss that was never observed, used only during index rebuild)
    index: HashMap<u64, u64>,
    len: u64,
}

impl Store {
    /// Opens (creating if absent) the store file at `path`, replaying its
    /// records to build the in-memory index. Records that fail their
    /// checksum are treated as a torn write: the scan stops there, and
    /// everything before the torn record is kept.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_owned();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut index = HashMap::new();
        let mut reader = BufReader::new(file.try_clone()?);
        let mut offset = 0u64;
        loop {
            let start = offset;
            match Record::read_from(&mut reader)? {
                None => break,
                Some((record, checksum_ok)) => {
                    let encoded_len = record.encoded_len() as u64;
                    offset += encoded_len;
                    if !checksum_ok {
                        break;
                    }
                    if record.is_tombstone() {
                        index.remove(&record.key);
                    } else {
                        index.insert(record.key, start);
                    }
                }
            }
        }

        let mut file = file;
        file.set_len(offset)?;
        file.seek(SeekFrom::End(0))?;

        Ok(Store {
            path,
            inner: RwLock::new(Inner {
                file,
                index,
                len: offset,
            }),
        })
    }

    /// Reads the live value for `key`, if any.
    pub fn get(&self, key: u64) -> Result<Option<Vec<u8>>> {
        let inner = self.inner.read().expect("store lock poisoned");
        let Some(&offset) = inner.index.get(&key) else {
            return Ok(None);
        };
        let mut reader = BufReader::new(inner.file.try_clone()?);
        reader.seek(SeekFrom::Start(offset))?;
        match Record::read_from(&mut reader)? {
            Some((record, true)) if record.key == key => Ok(record.value),
            _ => Err(Error::CorruptRecord),
        }
    }

    /// Appends a put record and updates the index.
    pub fn put(&self, key: u64, value: Vec<u8>) -> Result<()> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let record = Record::put(key, value);
        let offset = inner.len;
        append(&mut inner, &record)?;
        inner.index.insert(key, offset);
        Ok(())
    }

    /// Appends a tombstone record and drops `key` from the index.
    pub fn del(&self, key: u64) -> Result<()> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let record = Record::tombstone(key);
        append(&mut inner, &record)?;
        inner.index.remove(&key);
        Ok(())
    }

    /// Visits every live `(key, value)` pair. The visitor may not mutate the
    /// store; `browse` holds the shared lock for its whole duration, which is
    /// how the single-writer/many-reader contract is upheld for snapshots
    /// like `peer directory best()` or full UTXO scans.
    pub fn browse<F: FnMut(u64, &[u8])>(&self, mut f: F) -> Result<()> {
        let inner = self.inner.read().expect("store lock poisoned");
        let mut offsets: Vec<(u64, u64)> = inner.index.iter().map(|(&k, &v)| (k, v)).collect();
        offsets.sort_by_key(|&(_, offset)| offset);
        let mut reader = BufReader::new(inner.file.try_clone()?);
        for (key, offset) in offsets {
            reader.seek(SeekFrom::Start(offset))?;
            if let Some((record, true)) = Record::read_from(&mut reader)? {
                if record.key == key {
                    if let Some(value) = &record.value {
                        f(key, value);
                    }
                }
            }
        }
        Ok(())
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.read().expect("store lock poisoned").index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rewrites the file keeping only live entries, dropping all tombstone
    /// history. Writes to a `.tmp` sibling and renames over the live file
    /// only after a successful `sync`, so a crash mid-defrag leaves the
    /// original file untouched and the `.tmp` file is simply discarded on
    /// next open.
    pub fn defrag(&self) -> Result<()> {
        let mut inner = self.inner.write().expect("store lock poisoned");
        let tmp_path = tmp_path_for(&self.path);
        let mut live: Vec<(u64, u64)> = inner.index.iter().map(|(&k, &v)| (k, v)).collect();
        live.sort_by_key(|&(_, offset)| offset);

        let mut reader = BufReader::new(inner.file.try_clone()?);
        let mut new_index = HashMap::with_capacity(live.len());
        {
            let tmp_file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            let mut writer = BufWriter::new(tmp_file);
            let mut new_offset = 0u64;
            for (key, offset) in live {
                reader.seek(SeekFrom::Start(offset))?;
                if let Some((record, true)) = Record::read_from(&mut reader)? {
                    if record.key == key && !record.is_tombstone() {
                        let len = record.encoded_len() as u64;
                        record.write_to(&mut writer)?;
                        new_index.insert(key, new_offset);
                        new_offset += len;
                    }
                }
            }
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }

        fs::rename(&tmp_path, &self.path)?;
        let new_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)?;
        let len = new_file.metadata()?.len();
        inner.file = new_file;
        inner.file.seek(SeekFrom::End(0))?;
        inner.index = new_index;
        inner.len = len;
        Ok(())
    }

    /// Flushes OS buffers; a crash between `sync` calls may lose unsynced
    /// `put`s but never corrupts older entries.
    pub fn sync(&self) -> Result<()> {
        let inner = self.inner.read().expect("store lock poisoned");
        inner.file.sync_all()?;
        Ok(())
    }

    /// Syncs and drops the handle. Equivalent to letting the `Store` fall out
    /// of scope, spelled out for callers that want the ordering explicit.
    pub fn close(self) -> Result<()> {
        self.sync()
    }
}

fn append(inner: &mut Inner, record: &Record) -> Result<()> {
    // `get`/`browse` read through a `try_clone`d handle, which shares the
    // same underlying file offset as `inner.file`; seek back to the end
    // explicitly rather than trusting wherever the last read left the cursor.
    inner.file.seek(SeekFrom::End(0))?;
    let mut writer = BufWriter::new(&inner.file);
    record.write_to(&mut writer)?;
    writer.flush()?;
    inner.len += record.encoded_len() as u64;
    Ok(())
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
