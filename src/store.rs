//! # Contact Store
//!
//! Answers "who holds blob H": a map from blob hash to the contacts that
//! announced it. Entries come from verified `store` requests and from local
//! announcements.
//!
//! | Bound | Default | On overflow |
//! |-------|---------|-------------|
//! | hashes tracked | [`MAX_STORED_HASHES`] | least recently used hash dropped |
//! | contacts per hash | [`MAX_CONTACTS_PER_HASH`] | oldest announcement dropped |
//! | entry lifetime | [`CONTACT_EXPIRY`] | filtered on read, swept periodically |
//!
//! [`MAX_STORED_HASHES`]: crate::config::MAX_STORED_HASHES
//! [`MAX_CONTACTS_PER_HASH`]: crate::config::MAX_CONTACTS_PER_HASH
//! [`CONTACT_EXPIRY`]: crate::config::CONTACT_EXPIRY

use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;

use crate::bits::Bitmap;
use crate::contact::Contact;

struct StoredContact {
    contact: Contact,
    expires: Instant,
}

pub struct ContactStore {
    entries: Mutex<LruCache<Bitmap, Vec<StoredContact>>>,
    expiry: Duration,
    per_hash: usize,
}

impl ContactStore {
    pub fn new(max_hashes: usize, per_hash: usize, expiry: Duration) -> Self {
        let cap = NonZeroUsize::new(max_hashes).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            expiry,
            per_hash: per_hash.max(1),
        }
    }

    /// Add `contact` under `hash`, or push its expiry out if already present.
    ///
    /// Contacts are matched by id; a re-announce from a new address replaces
    /// the old address.
    pub fn upsert(&self, hash: Bitmap, contact: Contact) {
        let expires = Instant::now() + self.expiry;
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let list = entries.get_or_insert_mut(hash, Vec::new);
        list.retain(|e| e.contact.id != contact.id);
        list.push(StoredContact { contact, expires });
        if list.len() > self.per_hash {
            let excess = list.len() - self.per_hash;
            list.drain(..excess);
        }
    }

    /// Live contacts announced for `hash`, oldest announcement first.
    pub fn get(&self, hash: &Bitmap) -> Vec<Contact> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(hash)
            .map(|list| {
                list.iter()
                    .filter(|e| e.expires > now)
                    .map(|e| e.contact)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn remove(&self, hash: &Bitmap, id: &Bitmap) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = entries.peek_mut(hash) else {
            return false;
        };
        let before = list.len();
        list.retain(|e| &e.contact.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            entries.pop(hash);
        }
        removed
    }

    /// Drop expired contacts and empty hashes; returns how many contacts went.
    pub fn remove_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;
        let mut empty = Vec::new();
        for (hash, list) in entries.iter_mut() {
            let before = list.len();
            list.retain(|e| e.expires > now);
            removed += before - list.len();
            if list.is_empty() {
                empty.push(*hash);
            }
        }
        for hash in empty {
            entries.pop(&hash);
        }
        removed
    }

    /// Number of blob hashes with at least one stored entry.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn contact(port: u16) -> Contact {
        Contact::new(Bitmap::random(), SocketAddr::from(([127, 0, 0, 1], port)))
    }

    #[test]
    fn upsert_then_get() {
        let store = ContactStore::new(16, 8, Duration::from_secs(60));
        let hash = Bitmap::random();
        assert!(store.get(&hash).is_empty());

        let a = contact(1);
        let b = contact(2);
        store.upsert(hash, a);
        store.upsert(hash, b);
        store.upsert(hash, a);

        let got = store.get(&hash);
        assert_eq!(got, vec![b, a]);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn same_id_new_address_replaces() {
        let store = ContactStore::new(16, 8, Duration::from_secs(60));
        let hash = Bitmap::random();
        let a = contact(1);
        let moved = Contact { port: 9, ..a };
        store.upsert(hash, a);
        store.upsert(hash, moved);
        assert_eq!(store.get(&hash), vec![moved]);
    }

    #[test]
    fn per_hash_bound_drops_oldest() {
        let store = ContactStore::new(16, 3, Duration::from_secs(60));
        let hash = Bitmap::random();
        let contacts: Vec<_> = (1..=5).map(contact).collect();
        for c in &contacts {
            store.upsert(hash, *c);
        }
        assert_eq!(store.get(&hash), contacts[2..].to_vec());
    }

    #[test]
    fn hash_bound_evicts_least_recently_used() {
        let store = ContactStore::new(2, 8, Duration::from_secs(60));
        let h1 = Bitmap::random();
        let h2 = Bitmap::random();
        let h3 = Bitmap::random();
        store.upsert(h1, contact(1));
        store.upsert(h2, contact(2));
        let _ = store.get(&h1);
        store.upsert(h3, contact(3));

        assert_eq!(store.get(&h1).len(), 1);
        assert!(store.get(&h2).is_empty());
        assert_eq!(store.get(&h3).len(), 1);
    }

    #[test]
    fn remove_single_contact() {
        let store = ContactStore::new(16, 8, Duration::from_secs(60));
        let hash = Bitmap::random();
        let a = contact(1);
        store.upsert(hash, a);
        assert!(store.remove(&hash, &a.id));
        assert!(!store.remove(&hash, &a.id));
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire() {
        let store = ContactStore::new(16, 8, Duration::from_secs(10));
        let hash = Bitmap::random();
        let old = contact(1);
        store.upsert(hash, old);

        tokio::time::advance(Duration::from_secs(6)).await;
        let fresh = contact(2);
        store.upsert(hash, fresh);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.get(&hash), vec![fresh]);
        assert_eq!(store.remove_expired(), 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.remove_expired(), 1);
        assert!(store.is_empty());
    }
}
