use crc32fast::Hasher;
use std::io::{self, Read, Write};

/// Sentinel `value_len` marking a tombstone (deletion) record.
pub const TOMBSTONE: u32 = u32::MAX;

/// One self-checksummed record in the append-mostly store file.
///
/// On-disk layout: `key: u64 LE, value_len: u32 LE, value: [u8; value_len]
/// (absent for tombstones), crc32: u32 LE` where the checksum covers the key
/// and value bytes (not the length prefix or itself). A record whose checksum
/// does not match on reload is a torn write and is skipped, per the store's
/// durability contract.
#[derive(Debug, Clone)]
pub struct Record {
    pub key: u64,
    pub value: Option<Vec<u8>>,
}

impl Record {
    pub fn put(key: u64, value: Vec<u8>) -> Self {
        Record {
            key,
            value: Some(value),
        }
    }

    pub fn tombstone(key: u64) -> Self {
        Record { key, value: None }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }

    /// Encoded size in bytes, used by the defrag pass to track new file length.
    pub fn encoded_len(&self) -> usize {
        8 + 4 + self.value.as_ref().map_or(0, |v| v.len()) + 4
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        let mut hasher = Hasher::new();
        hasher.update(&self.key.to_le_bytes());
        w.write_all(&self.key.to_le_bytes())?;
        match &self.value {
            Some(v) => {
                w.write_all(&(v.len() as u32).to_le_bytes())?;
                hasher.update(&(v.len() as u32).to_le_bytes());
                w.write_all(v)?;
                hasher.update(v);
            }
            None => {
                w.write_all(&TOMBSTONE.to_le_bytes())?;
                hasher.update(&TOMBSTONE.to_le_bytes());
            }
        }
        w.write_all(&hasher.finalize().to_le_bytes())?;
        Ok(())
    }

    /// Reads one record. Returns `Ok(None)` both at a clean end-of-file and
    /// at a torn tail (a record cut short anywhere past its first byte) —
    /// the caller can't tell those apart from the stream alone, and the
    /// store's durability contract treats them the same way: stop replaying,
    /// keep everything read so far.
    pub fn read_from<R: Read>(r: &mut R) -> io::Result<Option<(Self, bool)>> {
        let mut key_buf = [0u8; 8];
        if !read_exact_or_torn(r, &mut key_buf)? {
            return Ok(None);
        }
        let mut len_buf = [0u8; 4];
        if !read_exact_or_torn(r, &mut len_buf)? {
            return Ok(None);
        }
        let len = u32::from_le_bytes(len_buf);

        let mut hasher = Hasher::new();
        hasher.update(&key_buf);
        hasher.update(&len_buf);

        let value = if len == TOMBSTONE {
            None
        } else {
            let mut buf = vec![0u8; len as usize];
            if !read_exact_or_torn(r, &mut buf)? {
                return Ok(None);
            }
            hasher.update(&buf);
            Some(buf)
        };

        let mut crc_buf = [0u8; 4];
        if !read_exact_or_torn(r, &mut crc_buf)? {
            return Ok(None);
        }
        let stored_crc = u32::from_le_bytes(crc_buf);
        let ok = stored_crc == hasher.finalize();

        Ok(Some((
            Record {
                key: u64::from_le_bytes(key_buf),
                value,
            },
            ok,
        )))
    }
}

/// Like `Read::read_exact` but reports any short read — a clean EOF before
/// anything was read, or a torn record cut off partway through — as
/// `Ok(false)` instead of an error, so callers can treat "no more whole
/// records" uniformly rather than propagating `UnexpectedEof` as a failure.
fn read_exact_or_torn<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut read = 0;
    while read < buf.len() {
        match r.read(&mut buf[read..]) {
            Ok(0) => return Ok(false),
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}
