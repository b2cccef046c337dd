//! # Routing Table
//!
//! Known peers bucketed by the length of the prefix their id shares with
//! ours. Bucket `i` holds contacts whose XOR distance from the local id has
//! exactly `i` leading zero bits, so there are [`NODE_ID_BITS`] buckets and
//! the last ones cover ever-smaller neighbourhoods.
//!
//! ## Trust
//!
//! | Call | Who triggers it | Effect |
//! |------|-----------------|--------|
//! | [`RoutingTable::update`] | a peer answered one of our requests | insert or promote, clears failures |
//! | [`RoutingTable::fresh`] | a peer sent us a request | touch, or add as questionable if there is room |
//! | [`RoutingTable::fail`] | a transaction timed out or got an error | count a failure, evict at the limit |
//!
//! An entry is [`ContactStatus::Good`] while it has no outstanding failures
//! and answered within `questionable_after`; otherwise it is questionable.
//! A full bucket admits a newcomer only by replacing the entry with the most
//! failures; a bucket of healthy peers keeps its members.
//!
//! The local id is never stored.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, trace};

use crate::bits::{Bitmap, NODE_ID_BITS};
use crate::contact::Contact;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactStatus {
    Good,
    Questionable,
}

#[derive(Debug, Clone)]
struct Peer {
    contact: Contact,
    last_response: Option<Instant>,
    failures: u32,
}

impl Peer {
    fn new(contact: Contact) -> Self {
        Self {
            contact,
            last_response: None,
            failures: 0,
        }
    }

    fn status(&self, questionable_after: Duration) -> ContactStatus {
        match self.last_response {
            Some(at) if self.failures == 0 && at.elapsed() <= questionable_after => {
                ContactStatus::Good
            }
            _ => ContactStatus::Questionable,
        }
    }
}

#[derive(Debug)]
struct RoutingBucket {
    peers: Vec<Peer>,
    last_refresh: Instant,
}

impl RoutingBucket {
    fn new() -> Self {
        Self {
            peers: Vec::new(),
            last_refresh: Instant::now(),
        }
    }

    fn mark_refreshed(&mut self) {
        self.last_refresh = Instant::now();
    }

    fn is_stale(&self, threshold: Duration) -> bool {
        self.last_refresh.elapsed() > threshold
    }

    fn position(&self, id: &Bitmap) -> Option<usize> {
        self.peers.iter().position(|p| &p.contact.id == id)
    }
}

/// Bucket for `other` relative to `self_id`. Only meaningful for `other != self_id`.
fn bucket_index(self_id: &Bitmap, other: &Bitmap) -> usize {
    self_id.distance(other).prefix_len().min(NODE_ID_BITS - 1)
}

pub struct RoutingTable {
    id: Bitmap,
    k: usize,
    max_fails: u32,
    questionable_after: Duration,
    buckets: RwLock<Vec<RoutingBucket>>,
}

impl RoutingTable {
    pub fn new(id: Bitmap, k: usize, max_fails: u32, questionable_after: Duration) -> Self {
        let buckets = (0..NODE_ID_BITS).map(|_| RoutingBucket::new()).collect();
        Self {
            id,
            k: k.max(1),
            max_fails: max_fails.max(1),
            questionable_after,
            buckets: RwLock::new(buckets),
        }
    }

    pub fn id(&self) -> Bitmap {
        self.id
    }

    /// Record that `contact` answered us: insert it, or promote and reset its
    /// failure count. Returns false if the contact was not admitted.
    pub fn update(&self, contact: Contact) -> bool {
        if contact.id == self.id {
            return false;
        }
        let now = Instant::now();
        let idx = bucket_index(&self.id, &contact.id);
        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        let bucket = &mut buckets[idx];

        if let Some(pos) = bucket.position(&contact.id) {
            let mut peer = bucket.peers.remove(pos);
            peer.contact = contact;
            peer.last_response = Some(now);
            peer.failures = 0;
            bucket.peers.push(peer);
            bucket.mark_refreshed();
            return true;
        }

        let mut peer = Peer::new(contact);
        peer.last_response = Some(now);

        if bucket.peers.len() < self.k {
            bucket.peers.push(peer);
            bucket.mark_refreshed();
            trace!(peer = %contact, bucket = idx, "routing insert");
            return true;
        }

        let worst = bucket
            .peers
            .iter()
            .enumerate()
            .filter(|(_, p)| p.failures > 0)
            .max_by_key(|(_, p)| p.failures)
            .map(|(pos, _)| pos);
        match worst {
            Some(pos) => {
                let evicted = bucket.peers.remove(pos);
                bucket.peers.push(peer);
                bucket.mark_refreshed();
                debug!(
                    evicted = %evicted.contact,
                    failures = evicted.failures,
                    peer = %contact,
                    bucket = idx,
                    "replaced failing routing contact"
                );
                true
            }
            None => {
                trace!(peer = %contact, bucket = idx, "bucket full, dropping newcomer");
                false
            }
        }
    }

    /// A peer contacted us: move a known entry to the most-recent end of its
    /// bucket, or add an unknown one as questionable if the bucket has room.
    /// Never evicts, never promotes trust and never changes a stored address.
    pub fn fresh(&self, contact: Contact) -> bool {
        if contact.id == self.id {
            return false;
        }
        let idx = bucket_index(&self.id, &contact.id);
        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        let bucket = &mut buckets[idx];
        match bucket.position(&contact.id) {
            Some(pos) => {
                let peer = bucket.peers.remove(pos);
                bucket.peers.push(peer);
            }
            None if bucket.peers.len() < self.k => {
                bucket.peers.push(Peer::new(contact));
                trace!(peer = %contact, bucket = idx, "routing insert (unverified)");
            }
            None => return false,
        }
        bucket.mark_refreshed();
        true
    }

    /// Count a failed transaction against `contact`. Returns true if the
    /// contact was evicted.
    pub fn fail(&self, contact: &Contact) -> bool {
        let idx = bucket_index(&self.id, &contact.id);
        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        let bucket = &mut buckets[idx];
        let Some(pos) = bucket.position(&contact.id) else {
            return false;
        };
        let peer = &mut bucket.peers[pos];
        peer.failures += 1;
        if peer.failures >= self.max_fails {
            let evicted = bucket.peers.remove(pos);
            debug!(
                peer = %evicted.contact,
                failures = evicted.failures,
                "evicting unresponsive routing contact"
            );
            return true;
        }
        false
    }

    pub fn remove(&self, id: &Bitmap) -> bool {
        let idx = bucket_index(&self.id, id);
        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        let bucket = &mut buckets[idx];
        match bucket.position(id) {
            Some(pos) => {
                bucket.peers.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Up to `k` contacts ordered by ascending XOR distance to `target`.
    pub fn get_closest(&self, target: &Bitmap, k: usize) -> Vec<Contact> {
        if k == 0 {
            return Vec::new();
        }

        struct ByDistance {
            dist: Bitmap,
            contact: Contact,
        }

        impl PartialEq for ByDistance {
            fn eq(&self, other: &Self) -> bool {
                self.dist == other.dist
            }
        }

        impl Eq for ByDistance {}

        impl Ord for ByDistance {
            fn cmp(&self, other: &Self) -> Ordering {
                self.dist.cmp(&other.dist)
            }
        }

        impl PartialOrd for ByDistance {
            fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                Some(self.cmp(other))
            }
        }

        let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
        let mut heap: BinaryHeap<ByDistance> = BinaryHeap::with_capacity(k + 1);
        for peer in buckets.iter().flat_map(|b| b.peers.iter()) {
            let dist = peer.contact.id.distance(target);
            if heap.len() < k {
                heap.push(ByDistance {
                    dist,
                    contact: peer.contact,
                });
            } else if let Some(farthest) = heap.peek()
                && dist < farthest.dist
            {
                heap.pop();
                heap.push(ByDistance {
                    dist,
                    contact: peer.contact,
                });
            }
        }

        heap.into_sorted_vec().into_iter().map(|e| e.contact).collect()
    }

    pub fn get(&self, id: &Bitmap) -> Option<Contact> {
        if *id == self.id {
            return None;
        }
        let idx = bucket_index(&self.id, id);
        let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
        buckets[idx]
            .peers
            .iter()
            .find(|p| &p.contact.id == id)
            .map(|p| p.contact)
    }

    pub fn status(&self, id: &Bitmap) -> Option<ContactStatus> {
        if *id == self.id {
            return None;
        }
        let idx = bucket_index(&self.id, id);
        let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
        buckets[idx]
            .peers
            .iter()
            .find(|p| &p.contact.id == id)
            .map(|p| p.status(self.questionable_after))
    }

    /// Failure count of a stored contact.
    pub fn failures(&self, id: &Bitmap) -> Option<u32> {
        let idx = bucket_index(&self.id, id);
        let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
        buckets[idx]
            .peers
            .iter()
            .find(|p| &p.contact.id == id)
            .map(|p| p.failures)
    }

    pub fn len(&self) -> usize {
        let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
        buckets.iter().map(|b| b.peers.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contacts(&self) -> Vec<Contact> {
        let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
        buckets
            .iter()
            .flat_map(|b| b.peers.iter().map(|p| p.contact))
            .collect()
    }

    /// Non-empty buckets not refreshed within `threshold`.
    pub fn stale_buckets(&self, threshold: Duration) -> Vec<usize> {
        let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
        buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.peers.is_empty() && b.is_stale(threshold))
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn mark_bucket_refreshed(&self, idx: usize) {
        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(bucket) = buckets.get_mut(idx) {
            bucket.mark_refreshed();
        }
    }

    /// A random id that falls into bucket `idx`.
    ///
    /// Distances in bucket `idx` have bit `idx` set and every bit above it
    /// clear, so the bucket spans `[2^(B-1-idx), 2^(B-idx) - 1]` where `B` is
    /// the identifier width in bits.
    pub fn random_id_in_bucket(&self, idx: usize) -> Bitmap {
        let idx = idx.min(NODE_ID_BITS - 1);
        let mut low = Bitmap::zero();
        low.set_bit(idx, true);
        let high = Bitmap::zero().suffix(NODE_ID_BITS - idx, true);
        self.id ^ Bitmap::random_in_range(&low, &high)
    }
}
