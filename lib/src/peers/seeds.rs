use std::net::{SocketAddr, ToSocketAddrs};

/// Bootstrap DNS seed hostnames, queried on first run to populate the peer
/// directory. Resolution is best-effort per hostname.
pub const DNS_SEEDS: &[&str] = &[
    "seed.bitcoin.sipa.be",
    "dnsseed.bluematt.me",
    "dnsseed.bitcoin.dashjr.org",
    "seed.bitcoinstats.com",
    "seed.btc.petertodd.org",
];

/// Resolves `host:port` to its set of addresses. Used instead of a raw
/// `lookup_host` call so tests can substitute a local stand-in resolver by
/// calling this with an address literal (`"127.0.0.1"`) directly.
pub fn resolve(host: &str, port: u16) -> std::io::Result<Vec<SocketAddr>> {
    (host, port).to_socket_addrs().map(|it| it.collect())
}
