mod seeds;

pub use seeds::DNS_SEEDS;

use crate::error::Result;
use crate::store::Store;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// How much `last_seen` is set back by `mark_dead`, demoting a peer without
/// deleting it (the exact constant is a heuristic — any monotone demotion
/// is acceptable).
const DEAD_PENALTY_SECS: i64 = 600;

/// Minimum interval between persisted `last_seen` bumps from `mark_alive`.
const ALIVE_WRITE_INTERVAL_SECS: i64 = 60;

/// Entries with `last_seen` older than this are dropped by `expire()`.
const EXPIRE_AFTER_SECS: i64 = 3 * 3600;

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

/// A known peer. Keyed by a stable fingerprint derived from its address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub ip: IpAddr,
    pub port: u16,
    pub services: u64,
    pub last_seen: i64,
    pub banned_at: i64,
}

impl PeerRecord {
    pub fn new(addr: SocketAddr, services: u64) -> Self {
        PeerRecord {
            ip: addr.ip(),
            port: addr.port(),
            services,
            last_seen: now(),
            banned_at: 0,
        }
    }

    pub fn is_banned(&self) -> bool {
        self.banned_at != 0
    }

    pub fn is_ipv4(&self) -> bool {
        matches!(self.ip, IpAddr::V4(_))
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Stable key derived from the address: for IPv4 peers, `ip << 16 | port`
    /// so it fits the store's 64-bit key space directly; for IPv6, an fxhash
    /// of the 16-byte address and port (collisions are acceptable, a
    /// fingerprint, not an identity).
    pub fn fingerprint(ip: IpAddr, port: u16) -> u64 {
        match ip {
            IpAddr::V4(v4) => (u32::from(v4) as u64) << 16 | port as u64,
            IpAddr::V6(v6) => {
                let mut hasher = fxhash::FxHasher::default();
                use std::hash::{Hash, Hasher};
                v6.octets().hash(&mut hasher);
                port.hash(&mut hasher);
                hasher.finish()
            }
        }
    }

    fn key(&self) -> u64 {
        Self::fingerprint(self.ip, self.port)
    }

    /// On-disk layout: `last_seen: u32 LE, services: u64 LE,
    /// ipv6: [u8; 16], port: u16 BE, banned_at: u32 LE`.
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + 8 + 16 + 2 + 4);
        buf.extend_from_slice(&(self.last_seen as u32).to_le_bytes());
        buf.extend_from_slice(&self.services.to_le_bytes());
        buf.extend_from_slice(&to_ipv6(self.ip).octets());
        buf.extend_from_slice(&self.port.to_be_bytes());
        buf.extend_from_slice(&(self.banned_at as u32).to_le_bytes());
        buf
    }

    fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 34 {
            return None;
        }
        let last_seen = u32::from_le_bytes(bytes[0..4].try_into().ok()?) as i64;
        let services = u64::from_le_bytes(bytes[4..12].try_into().ok()?);
        let ipv6 = Ipv6Addr::from(<[u8; 16]>::try_from(&bytes[12..28]).ok()?);
        let port = u16::from_be_bytes(bytes[28..30].try_into().ok()?);
        let banned_at = u32::from_le_bytes(bytes[30..34].try_into().ok()?) as i64;
        Some(PeerRecord {
            ip: from_ipv6(ipv6),
            port,
            services,
            last_seen,
            banned_at,
        })
    }
}

fn to_ipv6(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

fn from_ipv6(ipv6: Ipv6Addr) -> IpAddr {
    match ipv6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(ipv6),
    }
}

/// The persistent, banned-aware, expiring table of reachable peers, backed
/// by the append-mostly [`Store`]. All mutation goes through a single
/// per-directory guard; here that's `alive_writes`, the small bit of extra
/// state `mark_alive` needs to throttle its own writes.
pub struct PeerDirectory {
    store: Store,
    /// last persisted `last_seen` write time per peer, to throttle `mark_alive`
    alive_writes: Mutex<std::collections::HashMap<u64, i64>>,
    /// when set, `best()` ignores the store entirely and returns only this peer
    single_peer: Option<SocketAddr>,
}

impl PeerDirectory {
    pub fn open<P: AsRef<Path>>(path: P, single_peer: Option<SocketAddr>) -> Result<Self> {
        Ok(PeerDirectory {
            store: Store::open(path)?,
            alive_writes: Mutex::new(std::collections::HashMap::new()),
            single_peer,
        })
    }

    /// Writes the current `last_seen` for `peer`.
    pub fn upsert(&self, peer: &PeerRecord) -> Result<()> {
        self.store.put(peer.key(), peer.encode())
    }

    /// Resolves the configured DNS seed hostnames and inserts each resolved
    /// address with `services = 1`. Best-effort per hostname: a hostname
    /// that fails to resolve is skipped, not fatal.
    pub fn seed_bootstrap(&self, port: u16) -> Result<usize> {
        let mut inserted = 0;
        for host in DNS_SEEDS {
            let Ok(addrs) = seeds::resolve(host, port) else {
                continue;
            };
            for addr in addrs {
                self.upsert(&PeerRecord::new(addr, 1))?;
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    /// Advances `last_seen` to now, persisting at most once per
    /// [`ALIVE_WRITE_INTERVAL_SECS`] per peer to avoid write amplification.
    pub fn mark_alive(&self, ip: IpAddr, port: u16) -> Result<()> {
        let key = PeerRecord::fingerprint(ip, port);
        let t = now();
        let should_write = {
            let mut writes = self.alive_writes.lock().expect("peer db lock poisoned");
            match writes.get(&key) {
                Some(&last) if t - last < ALIVE_WRITE_INTERVAL_SECS => false,
                _ => {
                    writes.insert(key, t);
                    true
                }
            }
        };
        if !should_write {
            return Ok(());
        }
        if let Some(bytes) = self.store.get(key)? {
            if let Some(mut record) = PeerRecord::decode(&bytes) {
                record.last_seen = t;
                self.store.put(key, record.encode())?;
            }
        }
        Ok(())
    }

    /// Demotes a peer without deleting it, by subtracting
    /// [`DEAD_PENALTY_SECS`] from `last_seen`.
    pub fn mark_dead(&self, ip: IpAddr, port: u16) -> Result<()> {
        let key = PeerRecord::fingerprint(ip, port);
        if let Some(bytes) = self.store.get(key)? {
            if let Some(mut record) = PeerRecord::decode(&bytes) {
                record.last_seen -= DEAD_PENALTY_SECS;
                self.store.put(key, record.encode())?;
            }
        }
        Ok(())
    }

    /// Bans a peer immediately and persists the change.
    pub fn ban(&self, ip: IpAddr, port: u16) -> Result<()> {
        let key = PeerRecord::fingerprint(ip, port);
        if let Some(bytes) = self.store.get(key)? {
            if let Some(mut record) = PeerRecord::decode(&bytes) {
                record.banned_at = now();
                self.store.put(key, record.encode())?;
            }
        }
        Ok(())
    }

    /// Removes entries older than [`EXPIRE_AFTER_SECS`]; defrags if anything
    /// was actually removed.
    pub fn expire(&self) -> Result<usize> {
        let cutoff = now() - EXPIRE_AFTER_SECS;
        let mut stale = Vec::new();
        self.store.browse(|key, bytes| {
            if let Some(record) = PeerRecord::decode(bytes) {
                if record.last_seen < cutoff {
                    stale.push(key);
                }
            }
        })?;
        for key in &stale {
            self.store.del(*key)?;
        }
        if !stale.is_empty() {
            self.store.defrag()?;
        }
        Ok(stale.len())
    }

    /// Returns up to `limit` non-banned, valid-IPv4 peers sorted by
    /// `last_seen` descending. `only_unconnected` is left to the caller's
    /// connection pool to filter (this directory has no notion of "currently
    /// connected"); it's currently a no-op filter hook for callers that don't
    /// need it.
    pub fn best(&self, limit: usize, _only_unconnected: bool) -> Result<Vec<PeerRecord>> {
        if let Some(addr) = self.single_peer {
            return Ok(vec![PeerRecord::new(addr, 1)]);
        }
        let mut all = Vec::new();
        self.store.browse(|_, bytes| {
            if let Some(record) = PeerRecord::decode(bytes) {
                if !record.is_banned() && record.is_ipv4() {
                    all.push(record);
                }
            }
        })?;
        all.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        all.truncate(limit);
        Ok(all)
    }

    pub fn sync(&self) -> Result<()> {
        self.store.sync()
    }

    pub fn close(self) -> Result<()> {
        self.store.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(a: u8, b: u8, c: u8, d: u8, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(a, b, c, d)), port)
    }

    #[test]
    fn encode_decode_roundtrip() {
        let record = PeerRecord::new(addr(1, 2, 3, 4, 8333), 5);
        let decoded = PeerRecord::decode(&record.encode()).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn ban_excludes_from_best_until_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let peerdb = PeerDirectory::open(dir.path().join("peers3"), None).unwrap();
        let a = addr(10, 0, 0, 1, 8333);
        peerdb.upsert(&PeerRecord::new(a, 1)).unwrap();
        assert_eq!(peerdb.best(10, false).unwrap().len(), 1);
        peerdb.ban(a.ip(), a.port()).unwrap();
        assert_eq!(peerdb.best(10, false).unwrap().len(), 0);
    }

    #[test]
    fn expire_removes_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        let peerdb = PeerDirectory::open(dir.path().join("peers3"), None).unwrap();
        let mut old = PeerRecord::new(addr(10, 0, 0, 2, 8333), 1);
        old.last_seen = now() - EXPIRE_AFTER_SECS - 10;
        peerdb.upsert(&old).unwrap();
        let fresh = PeerRecord::new(addr(10, 0, 0, 3, 8333), 1);
        peerdb.upsert(&fresh).unwrap();

        let removed = peerdb.expire().unwrap();
        assert_eq!(removed, 1);
        let remaining = peerdb.best(10, false).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].ip, fresh.ip);
    }

    #[test]
    fn single_peer_override_ignores_store() {
        let dir = tempfile::tempdir().unwrap();
        let only = addr(192, 168, 1, 1, 8333);
        let peerdb = PeerDirectory::open(dir.path().join("peers3"), Some(only)).unwrap();
        peerdb
            .upsert(&PeerRecord::new(addr(1, 1, 1, 1, 8333), 1))
            .unwrap();
        let best = peerdb.best(10, false).unwrap();
        assert_eq!(best.len(), 1);
        assert_eq!(best[0].socket_addr(), only);
    }

    #[test]
    fn mark_dead_demotes_without_deleting() {
        let dir = tempfile::tempdir().unwrap();
        let peerdb = PeerDirectory::open(dir.path().join("peers3"), None).unwrap();
        let a = addr(10, 0, 0, 4, 8333);
        peerdb.upsert(&PeerRecord::new(a, 1)).unwrap();
        let before = peerdb.best(10, false).unwrap()[0].last_seen;
        peerdb.mark_dead(a.ip(), a.port()).unwrap();
        let after = peerdb.best(10, false).unwrap()[0].last_seen;
        assert_eq!(before - after, DEAD_PENALTY_SECS);
    }
}
