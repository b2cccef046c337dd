//! # Store Tokens
//!
//! A node only accepts a `store` from a peer that recently asked it a
//! `findValue`, proven by echoing the token handed out in that reply.
//! Tokens are a BLAKE3 keyed hash of the requester's id and address under a
//! secret that rotates on a fixed interval. The previous secret stays valid
//! for one extra window so a token issued just before a rotation can still be
//! redeemed.

use std::net::{IpAddr, SocketAddr};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use rand::RngCore;
use tokio::sync::watch;
use tracing::trace;

use crate::bits::Bitmap;
use crate::config::MIN_TIMER_PERIOD;
use crate::node::stopped;

const SECRET_LENGTH: usize = 32;

struct Secrets {
    current: [u8; SECRET_LENGTH],
    previous: [u8; SECRET_LENGTH],
}

pub struct TokenManager {
    secrets: RwLock<Secrets>,
}

impl Default for TokenManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenManager {
    pub fn new() -> Self {
        let current = random_secret();
        Self {
            secrets: RwLock::new(Secrets {
                current,
                previous: current,
            }),
        }
    }

    /// Token for `node_id` reaching us from `addr`, under the current secret.
    pub fn get(&self, node_id: &Bitmap, addr: &SocketAddr) -> Vec<u8> {
        let secrets = self.secrets.read().unwrap_or_else(PoisonError::into_inner);
        derive(&secrets.current, node_id, addr).as_bytes().to_vec()
    }

    /// Accept tokens derived from either the current or the previous secret.
    pub fn verify(&self, token: &[u8], node_id: &Bitmap, addr: &SocketAddr) -> bool {
        let Ok(token) = <[u8; blake3::OUT_LEN]>::try_from(token) else {
            return false;
        };
        let token = blake3::Hash::from(token);
        let secrets = self.secrets.read().unwrap_or_else(PoisonError::into_inner);
        // blake3::Hash equality is constant time
        derive(&secrets.current, node_id, addr) == token
            || derive(&secrets.previous, node_id, addr) == token
    }

    pub fn rotate(&self) {
        let mut secrets = self.secrets.write().unwrap_or_else(PoisonError::into_inner);
        secrets.previous = secrets.current;
        secrets.current = random_secret();
        trace!("rotated token secret");
    }

    /// Rotate every `interval` until `stop` flips to true.
    pub async fn run_rotation(&self, interval: Duration, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval.max(MIN_TIMER_PERIOD));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => self.rotate(),
                _ = stopped(&mut stop) => break,
            }
        }
    }
}

fn random_secret() -> [u8; SECRET_LENGTH] {
    let mut secret = [0u8; SECRET_LENGTH];
    rand::thread_rng().fill_bytes(&mut secret);
    secret
}

fn derive(secret: &[u8; SECRET_LENGTH], node_id: &Bitmap, addr: &SocketAddr) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new_keyed(secret);
    hasher.update(node_id.as_bytes());
    match addr.ip() {
        IpAddr::V4(v4) => hasher.update(&v4.octets()),
        IpAddr::V6(v6) => hasher.update(&v6.octets()),
    };
    hasher.update(&addr.port().to_be_bytes());
    hasher.finalize()
}
