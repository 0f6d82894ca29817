use crate::error::{Error, Result};
use crate::net::message::{Message, VersionPayload};
use std::collections::HashMap;
use std::io::Write;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

pub type PeerId = u32;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
const IDLE_BROKEN_TIMEOUT: Duration = Duration::from_secs(3);
const BLOCK_RECEIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-peer mutable counters, guarded by the connection's own lock (a
/// per-connection lock one level below `conn_mutex`).
#[derive(Debug, Default)]
struct ConnState {
    last_block_received: Option<Instant>,
    ping_started: Option<Instant>,
    avg_ping_ms: Option<f64>,
    in_progress: u32,
}

/// One outbound peer connection.
pub struct Connection {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub connected_at: Instant,
    stream: Mutex<TcpStream>,
    bytes_received: AtomicU64,
    broken: AtomicBool,
    state: Mutex<ConnState>,
}

impl Connection {
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Relaxed)
    }

    pub fn set_broken(&self) {
        self.broken.store(true, Ordering::Relaxed);
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn bytes_per_sec(&self) -> f64 {
        let secs = self.connected_at.elapsed().as_secs_f64().max(0.001);
        self.bytes_received() as f64 / secs
    }

    pub fn in_progress(&self) -> u32 {
        self.state.lock().expect("conn lock poisoned").in_progress
    }

    pub fn set_in_progress(&self, n: u32) {
        self.state.lock().expect("conn lock poisoned").in_progress = n;
    }

    pub fn note_block_received(&self) {
        self.state
            .lock()
            .expect("conn lock poisoned")
            .last_block_received = Some(Instant::now());
    }

    /// True once this peer's current in-flight block request has exceeded
    /// [`BLOCK_RECEIVE_TIMEOUT`] (or it has never delivered one).
    pub fn block_receive_timed_out(&self) -> bool {
        match self.state.lock().expect("conn lock poisoned").last_block_received {
            Some(t) => t.elapsed() > BLOCK_RECEIVE_TIMEOUT,
            None => self.connected_at.elapsed() > BLOCK_RECEIVE_TIMEOUT,
        }
    }

    pub fn note_ping_sent(&self) {
        self.state.lock().expect("conn lock poisoned").ping_started = Some(Instant::now());
    }

    pub fn note_pong_received(&self) {
        let mut state = self.state.lock().expect("conn lock poisoned");
        if let Some(started) = state.ping_started.take() {
            let ms = started.elapsed().as_secs_f64() * 1000.0;
            state.avg_ping_ms = Some(match state.avg_ping_ms {
                Some(prev) => (prev * 7.0 + ms) / 8.0,
                None => ms,
            });
        }
    }

    pub fn avg_ping_ms(&self) -> Option<f64> {
        self.state.lock().expect("conn lock poisoned").avg_ping_ms
    }

    pub fn send(&self, msg: &Message, magic: [u8; 4]) -> Result<()> {
        let bytes = msg.encode(magic)?;
        let mut stream = self.stream.lock().expect("conn lock poisoned");
        stream.write_all(&bytes)?;
        Ok(())
    }
}

/// Maintains up to `max_conns` outbound connections. Holds `conn_mutex`
/// internally; callers never see raw connections outside this module, only
/// `PeerId`s and `Arc<Connection>` handles looked up through it, the same
/// "in-progress records store ids, not pointers" indexing strategy the
/// scheduler uses for in-flight block requests.
pub struct ConnectionPool {
    magic: [u8; 4],
    max_conns: AtomicU32,
    next_id: AtomicU32,
    conn_mutex: Mutex<HashMap<PeerId, Arc<Connection>>>,
    /// Dispatches one decoded message; returns `true` when the delivering
    /// peer should be marked broken (malformed data is fatal for the peer
    /// that sent it, never for the node).
    on_message: Arc<dyn Fn(PeerId, SocketAddr, Message) -> bool + Send + Sync>,
}

impl ConnectionPool {
    pub fn new(
        magic: [u8; 4],
        max_conns: u32,
        on_message: Arc<dyn Fn(PeerId, SocketAddr, Message) -> bool + Send + Sync>,
    ) -> Self {
        ConnectionPool {
            magic,
            max_conns: AtomicU32::new(max_conns),
            next_id: AtomicU32::new(1),
            conn_mutex: Mutex::new(HashMap::new()),
            on_message,
        }
    }

    pub fn len(&self) -> usize {
        self.conn_mutex.lock().expect("conn_mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_conns(&self) -> u32 {
        self.max_conns.load(Ordering::Relaxed)
    }

    /// Changes the connection cap at runtime (the control loop's `mc N` command).
    pub fn set_max_conns(&self, n: u32) {
        self.max_conns.store(n, Ordering::Relaxed);
    }

    pub fn has_capacity(&self) -> bool {
        (self.len() as u32) < self.max_conns()
    }

    pub fn get(&self, id: PeerId) -> Option<Arc<Connection>> {
        self.conn_mutex
            .lock()
            .expect("conn_mutex poisoned")
            .get(&id)
            .cloned()
    }

    pub fn for_each<F: FnMut(&Arc<Connection>)>(&self, mut f: F) {
        for conn in self.conn_mutex.lock().expect("conn_mutex poisoned").values() {
            f(conn);
        }
    }

    /// Dials `addr`, completes the version/verack handshake, and spawns
    /// a reader thread that dispatches every subsequent message to
    /// `on_message`. Returns the new peer's id once the handshake and thread
    /// spawn succeed; handshake failures are reported to the caller rather
    /// than silently retried, since dialing is driven by the scheduler's own
    /// retry loop.
    pub fn dial(self: &Arc<Self>, addr: SocketAddr, start_height: i32) -> Result<PeerId> {
        let stream = TcpStream::connect_timeout(&addr, HANDSHAKE_TIMEOUT)?;
        stream.set_nodelay(true).ok();
        stream.set_read_timeout(Some(IDLE_BROKEN_TIMEOUT))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut write_stream = stream.try_clone()?;
        let nonce = rand::random::<u64>();
        let version_msg = Message::Version(VersionPayload {
            version: 70015,
            services: 0,
            timestamp: unix_now(),
            nonce,
            user_agent: "/block_ingest:0.1.0/".to_owned(),
            start_height,
        });
        write_stream.write_all(&version_msg.encode(self.magic)?)?;

        let mut read_stream = stream.try_clone()?;
        let mut got_version = false;
        let mut got_verack = false;
        let deadline = Instant::now() + HANDSHAKE_TIMEOUT;
        while !(got_version && got_verack) {
            if Instant::now() > deadline {
                return Err(Error::Protocol("handshake timed out".into()));
            }
            match Message::read(&mut read_stream, self.magic) {
                Ok(Message::Version(_)) => got_version = true,
                Ok(Message::VerAck) => got_verack = true,
                Ok(_other) => {}
                Err(_) => continue,
            }
        }
        write_stream.write_all(&Message::VerAck.encode(self.magic)?)?;
        stream.set_read_timeout(None)?;

        let connection = Arc::new(Connection {
            id,
            addr,
            connected_at: Instant::now(),
            stream: Mutex::new(write_stream),
            bytes_received: AtomicU64::new(0),
            broken: AtomicBool::new(false),
            state: Mutex::new(ConnState::default()),
        });
        self.conn_mutex
            .lock()
            .expect("conn_mutex poisoned")
            .insert(id, connection.clone());

        let pool = self.clone();
        std::thread::spawn(move || reader_loop(pool, connection, read_stream));

        Ok(id)
    }

    /// Removes connections marked broken, returning their ids so the
    /// scheduler can release their in-progress assignments.
    pub fn reap_broken(&self) -> Vec<PeerId> {
        let mut conns = self.conn_mutex.lock().expect("conn_mutex poisoned");
        let dead: Vec<PeerId> = conns
            .iter()
            .filter(|(_, c)| c.is_broken())
            .map(|(&id, _)| id)
            .collect();
        for id in &dead {
            conns.remove(id);
        }
        dead
    }

    /// Marks the slowest connected peer broken, provided the pool is at
    /// capacity and the peer has been connected at least 3 seconds.
    pub fn drop_slowest(&self) -> Option<PeerId> {
        if self.has_capacity() {
            return None;
        }
        let conns = self.conn_mutex.lock().expect("conn_mutex poisoned");
        let slowest = conns
            .values()
            .filter(|c| c.connected_at.elapsed() > Duration::from_secs(3) && !c.is_broken())
            .min_by(|a, b| a.bytes_per_sec().partial_cmp(&b.bytes_per_sec()).unwrap());
        if let Some(conn) = slowest {
            conn.set_broken();
            Some(conn.id)
        } else {
            None
        }
    }

    /// Cadence between slow-peer eviction passes: `max(1200 / max_conns, 3)` seconds.
    pub fn slow_peer_eviction_interval(&self) -> Duration {
        let secs = (1200 / self.max_conns().max(1)).max(3);
        Duration::from_secs(secs as u64)
    }
}

fn reader_loop(pool: Arc<ConnectionPool>, connection: Arc<Connection>, mut stream: TcpStream) {
    loop {
        if connection.is_broken() {
            return;
        }
        match Message::read(&mut stream, pool.magic) {
            Ok(msg) => {
                connection
                    .bytes_received
                    .fetch_add(estimate_size(&msg), Ordering::Relaxed);
                if matches!(msg, Message::Block(_)) {
                    connection.note_block_received();
                }
                if matches!(msg, Message::Pong(_)) {
                    connection.note_pong_received();
                }
                if (pool.on_message)(connection.id, connection.addr, msg) {
                    connection.set_broken();
                    return;
                }
            }
            Err(_) => {
                connection.set_broken();
                return;
            }
        }
    }
}

/// Approximate wire size for throughput accounting; exact framing overhead
/// is a constant the bytes/sec ranking doesn't need to the byte.
fn estimate_size(msg: &Message) -> u64 {
    match msg {
        Message::Block(block) => bitcoin::consensus::encode::serialize(block.as_ref()).len() as u64,
        Message::Headers(h) => 80 * h.len() as u64,
        _ => 64,
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}
