//! # DHT Facade
//!
//! [`Dht`] wraps a [`Node`] with the operations an application needs to
//! find and advertise blob holders.
//!
//! | Operation | Description |
//! |-----------|-------------|
//! | `start()` | bind the UDP socket, start the engine, join through the seeds |
//! | `join()` | ping the seeds, then look up our own id to fill nearby buckets |
//! | `get(hash)` | iterative `findValue`; the contacts announcing `hash` |
//! | `announce(hash)` | store our contact on the nodes closest to `hash` |
//! | `shutdown()` | stop re-announcing and shut the engine down |
//!
//! Announced hashes are remembered and re-announced every
//! `reannounce_interval` so the announcements outlive contact-store expiry on
//! the remote side.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::bits::Bitmap;
use crate::config::{DhtConfig, MIN_TIMER_PERIOD};
use crate::contact::Contact;
use crate::lookup::find_contacts;
use crate::messages::{Request, STORE_SUCCESS_RESPONSE, StoreArgs, StoreArgsValue};
use crate::node::{Node, stopped};
use crate::transport::UdpTransport;

#[derive(Clone)]
pub struct Dht {
    node: Node,
    config: Arc<DhtConfig>,
    announced: Arc<Mutex<HashSet<Bitmap>>>,
    stop: Arc<watch::Sender<bool>>,
    reannouncer: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Dht {
    /// A DHT with a freshly generated node id.
    pub fn new(config: DhtConfig) -> Self {
        Self::with_id(Bitmap::random(), config)
    }

    pub fn with_id(id: Bitmap, config: DhtConfig) -> Self {
        let node = Node::new(id, config.node.clone());
        Self::with_node(node, config)
    }

    /// Use an already constructed node, e.g. one with a custom request handler.
    pub fn with_node(node: Node, config: DhtConfig) -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            node,
            config: Arc::new(config),
            announced: Arc::new(Mutex::new(HashSet::new())),
            stop: Arc::new(stop),
            reannouncer: Arc::new(Mutex::new(None)),
        }
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn id(&self) -> Bitmap {
        self.node.id()
    }

    /// Bind, connect and join. Returns once the join lookup has finished.
    pub async fn start(&self) -> Result<()> {
        let transport = UdpTransport::bind(self.config.bind)
            .await
            .with_context(|| format!("failed to bind {}", self.config.bind))?;
        self.node
            .connect(Arc::new(transport))
            .await
            .context("failed to start dht node")?;

        let dht = self.clone();
        let handle = tokio::spawn(async move { dht.reannounce_loop().await });
        *self.reannouncer.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        let known = self.join().await;
        info!(
            id = %self.id().hex_short(),
            routing_contacts = known,
            "dht started"
        );
        Ok(())
    }

    /// Ping every seed, then look up our own id. Returns the routing table size.
    pub async fn join(&self) -> usize {
        let mut pings = JoinSet::new();
        for seed in self.config.seeds.iter().copied() {
            let node = self.node.clone();
            pings.spawn(async move { (seed, node.ping_addr(seed).await) });
        }
        while let Some(joined) = pings.join_next().await {
            match joined {
                Ok((seed, Some(contact))) => debug!(seed = %seed, peer = %contact, "seed answered"),
                Ok((seed, None)) => warn!(seed = %seed, "seed did not answer"),
                Err(e) => warn!(error = %e, "seed ping task failed"),
            }
        }

        if !self.node.routing_table().is_empty() {
            find_contacts(&self.node, self.id(), false).await;
        }
        self.node.routing_table().len()
    }

    /// Contacts announcing `hash`, including any held locally.
    pub async fn get(&self, hash: Bitmap) -> Vec<Contact> {
        let mut holders = self.node.contact_store().get(&hash);
        let result = find_contacts(&self.node, hash, true).await;
        for contact in result.found {
            if !holders.iter().any(|h| h.id == contact.id) {
                holders.push(contact);
            }
        }
        debug!(hash = %hash.hex_short(), holders = holders.len(), "get finished");
        holders
    }

    /// Advertise that this node holds `hash`. Returns how many remote nodes
    /// accepted the announcement.
    pub async fn announce(&self, hash: Bitmap) -> usize {
        self.announced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(hash);

        let k = self.node.config().bucket_size;
        let self_id = self.id();
        let closest = find_contacts(&self.node, hash, false).await.closest;

        let self_is_close = closest.len() < k
            || closest
                .last()
                .is_none_or(|farthest| hash.closer(&self_id, &farthest.id));
        let self_stored = self_is_close && self.store_self(hash);

        let mut stores = JoinSet::new();
        for contact in closest {
            let node = self.node.clone();
            let peer_port = self.config.peer_port;
            stores.spawn(async move { store_on(&node, contact, hash, peer_port).await });
        }
        let mut accepted = 0;
        while let Some(joined) = stores.join_next().await {
            if matches!(joined, Ok(true)) {
                accepted += 1;
            }
        }
        info!(
            hash = %hash.hex_short(),
            accepted,
            self_store = self_stored,
            "announced"
        );
        accepted
    }

    /// Record ourselves as a holder of `hash` in the local contact store.
    /// Skipped when we have no routable address to hand out.
    fn store_self(&self, hash: Bitmap) -> bool {
        let Some(ip) = self.advertised_ip() else {
            warn!(
                hash = %hash.hex_short(),
                bind = %self.config.bind,
                "no routable address to advertise, skipping self-store"
            );
            return false;
        };
        self.node.store(
            hash,
            Contact {
                id: self.id(),
                ip,
                port: self.config.peer_port,
            },
        );
        true
    }

    /// The configured advertise address, else the bound one unless it is a wildcard.
    fn advertised_ip(&self) -> Option<IpAddr> {
        if let Some(ip) = self.config.advertise {
            return Some(ip);
        }
        let ip = self
            .node
            .local_addr()
            .map(|a| a.ip())
            .unwrap_or_else(|| self.config.bind.ip());
        (!ip.is_unspecified()).then_some(ip)
    }

    /// Stop re-announcing `hash`. Existing remote announcements expire on their own.
    pub fn forget(&self, hash: &Bitmap) -> bool {
        self.announced
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(hash)
    }

    pub async fn shutdown(&self) {
        self.stop.send_replace(true);
        let handle = self
            .reannouncer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "reannounce task failed");
        }
        self.node.shutdown().await;
    }

    async fn reannounce_loop(&self) {
        let mut stop = self.stop.subscribe();
        let mut ticker =
            tokio::time::interval(self.config.reannounce_interval.max(MIN_TIMER_PERIOD));
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stopped(&mut stop) => break,
                _ = ticker.tick() => {}
            }
            let hashes: Vec<Bitmap> = self
                .announced
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .copied()
                .collect();
            if hashes.is_empty() {
                continue;
            }
            debug!(count = hashes.len(), "re-announcing");
            for hash in hashes {
                tokio::select! {
                    _ = stopped(&mut stop) => return,
                    _ = self.announce(hash) => {}
                }
            }
        }
    }
}

/// Fetch a token from `contact` with `findValue`, then store our announcement there.
async fn store_on(node: &Node, contact: Contact, hash: Bitmap, peer_port: u16) -> bool {
    let Some(response) = node.send(contact, Request::find_value(hash)).await else {
        return false;
    };
    let Some(token) = response.token else {
        debug!(peer = %contact, "findValue reply carried no token");
        return false;
    };
    let args = StoreArgs {
        blob_hash: hash,
        value: StoreArgsValue {
            token,
            publisher: node.id(),
            port: peer_port,
        },
        node_id: node.id(),
        self_store: false,
    };
    match node.send(contact, Request::store(args)).await {
        Some(response) if response.data.as_deref() == Some(STORE_SUCCESS_RESPONSE) => true,
        Some(response) => {
            debug!(peer = %contact, data = ?response.data, "unexpected store reply");
            false
        }
        None => false,
    }
}
