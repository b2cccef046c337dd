//! # Protocol Constants and Tunables
//!
//! Constants define the protocol defaults. [`NodeConfig`] and [`DhtConfig`]
//! carry them at runtime so tests and the binary can shrink or widen timing
//! without touching the engine.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

pub use crate::bits::NODE_ID_LENGTH;
pub use crate::messages::MESSAGE_ID_LENGTH;

/// Contacts per routing bucket, and the size of lookup replies (k).
pub const BUCKET_SIZE: usize = 8;

/// Concurrent queries per lookup round.
pub const ALPHA: usize = 5;

/// Send attempts per transaction.
pub const UDP_RETRY: usize = 3;

/// Wait for a reply per attempt.
pub const UDP_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest datagram read off the socket.
pub const UDP_MAX_MESSAGE_LENGTH: usize = 4096;

/// Upper bound on a single socket write.
pub const WRITE_DEADLINE: Duration = Duration::from_secs(2);

/// Upper bound on a single socket read before the read loop re-checks the stop signal.
pub const READ_DEADLINE: Duration = Duration::from_secs(1);

/// Consecutive failed transactions that evict a routing contact.
pub const MAX_PEER_FAILS: u32 = 3;

/// Buckets untouched for this long are refreshed with a random lookup.
/// The refresher wakes at a fifth of this period.
pub const BUCKET_REFRESH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// A good contact without a reply for this long becomes questionable.
pub const NODE_QUESTIONABLE_AFTER: Duration = Duration::from_secs(15 * 60);

/// Token secret rotation period.
pub const TOKEN_ROTATION_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Lifetime of an announced contact in the contact store.
pub const CONTACT_EXPIRY: Duration = Duration::from_secs(60 * 60);

/// Blob hashes tracked by the contact store (LRU bounded).
pub const MAX_STORED_HASHES: usize = 100_000;

/// Contacts kept per blob hash; the oldest is dropped first.
pub const MAX_CONTACTS_PER_HASH: usize = 64;

/// Period between re-announcements of locally held blobs.
pub const REANNOUNCE_INTERVAL: Duration = Duration::from_secs(50 * 60);

pub const DEFAULT_PORT: u16 = 4444;

/// Shortest period handed to a ticker; `tokio::time::interval` rejects zero.
pub const MIN_TIMER_PERIOD: Duration = Duration::from_millis(1);

/// Timing and sizing for a single [`crate::Node`].
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub bucket_size: usize,
    pub alpha: usize,
    pub udp_retry: usize,
    pub udp_timeout: Duration,
    pub write_deadline: Duration,
    pub read_deadline: Duration,
    pub max_peer_fails: u32,
    pub refresh_interval: Duration,
    pub questionable_after: Duration,
    pub token_rotation: Duration,
    pub contact_expiry: Duration,
    pub max_stored_hashes: usize,
    pub max_contacts_per_hash: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bucket_size: BUCKET_SIZE,
            alpha: ALPHA,
            udp_retry: UDP_RETRY,
            udp_timeout: UDP_TIMEOUT,
            write_deadline: WRITE_DEADLINE,
            read_deadline: READ_DEADLINE,
            max_peer_fails: MAX_PEER_FAILS,
            refresh_interval: BUCKET_REFRESH_INTERVAL,
            questionable_after: NODE_QUESTIONABLE_AFTER,
            token_rotation: TOKEN_ROTATION_INTERVAL,
            contact_expiry: CONTACT_EXPIRY,
            max_stored_hashes: MAX_STORED_HASHES,
            max_contacts_per_hash: MAX_CONTACTS_PER_HASH,
        }
    }
}

impl NodeConfig {
    pub fn bucket_size(mut self, k: usize) -> Self {
        self.bucket_size = k.max(1);
        self
    }

    pub fn alpha(mut self, alpha: usize) -> Self {
        self.alpha = alpha.max(1);
        self
    }

    pub fn udp_retry(mut self, attempts: usize) -> Self {
        self.udp_retry = attempts.max(1);
        self
    }

    pub fn udp_timeout(mut self, timeout: Duration) -> Self {
        self.udp_timeout = timeout;
        self
    }

    pub fn refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval.max(MIN_TIMER_PERIOD);
        self
    }

    pub fn token_rotation(mut self, interval: Duration) -> Self {
        self.token_rotation = interval.max(MIN_TIMER_PERIOD);
        self
    }

    pub fn contact_expiry(mut self, expiry: Duration) -> Self {
        self.contact_expiry = expiry;
        self
    }
}

/// Settings for a [`crate::Dht`]: where to listen, whom to join through,
/// and the engine tunables.
#[derive(Debug, Clone)]
pub struct DhtConfig {
    pub bind: SocketAddr,
    pub seeds: Vec<SocketAddr>,
    /// Port announced for blob transfer, stored alongside our id.
    pub peer_port: u16,
    /// Address other peers should reach us on. Needed when `bind` is a
    /// wildcard; without it the self-announcement is skipped.
    pub advertise: Option<IpAddr>,
    pub reannounce_interval: Duration,
    pub node: NodeConfig,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            seeds: Vec::new(),
            peer_port: DEFAULT_PORT + 1,
            advertise: None,
            reannounce_interval: REANNOUNCE_INTERVAL,
            node: NodeConfig::default(),
        }
    }
}

impl DhtConfig {
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind = addr;
        self
    }

    pub fn seeds(mut self, seeds: impl IntoIterator<Item = SocketAddr>) -> Self {
        self.seeds = seeds.into_iter().collect();
        self
    }

    pub fn peer_port(mut self, port: u16) -> Self {
        self.peer_port = port;
        self
    }

    pub fn advertise(mut self, ip: IpAddr) -> Self {
        self.advertise = Some(ip);
        self
    }

    pub fn reannounce_interval(mut self, interval: Duration) -> Self {
        self.reannounce_interval = interval.max(MIN_TIMER_PERIOD);
        self
    }

    pub fn node(mut self, node: NodeConfig) -> Self {
        self.node = node;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let cfg = NodeConfig::default();
        assert_eq!(cfg.bucket_size, BUCKET_SIZE);
        assert_eq!(cfg.udp_retry, UDP_RETRY);
        assert_eq!(cfg.udp_timeout, UDP_TIMEOUT);
        assert_eq!(cfg.refresh_interval, BUCKET_REFRESH_INTERVAL);

        let dht = DhtConfig::default();
        assert_eq!(dht.bind.port(), DEFAULT_PORT);
        assert!(dht.seeds.is_empty());
    }

    #[test]
    fn builders_clamp_zero_counts() {
        let cfg = NodeConfig::default().bucket_size(0).alpha(0).udp_retry(0);
        assert_eq!(cfg.bucket_size, 1);
        assert_eq!(cfg.alpha, 1);
        assert_eq!(cfg.udp_retry, 1);
    }

    #[test]
    fn builders_clamp_zero_periods() {
        let cfg = NodeConfig::default()
            .token_rotation(Duration::ZERO)
            .refresh_interval(Duration::ZERO);
        assert_eq!(cfg.token_rotation, MIN_TIMER_PERIOD);
        assert_eq!(cfg.refresh_interval, MIN_TIMER_PERIOD);

        let dht = DhtConfig::default().reannounce_interval(Duration::ZERO);
        assert_eq!(dht.reannounce_interval, MIN_TIMER_PERIOD);
        assert!(dht.advertise.is_none());
    }
}
