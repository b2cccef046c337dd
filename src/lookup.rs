//! # Iterative Lookup
//!
//! The Kademlia contact finder. Starting from the routing table's closest
//! contacts to a target, each round queries up to `alpha` not-yet-queried
//! contacts in parallel, merges what they return into a shortlist sorted by
//! XOR distance and truncated to `bucket_size`. Once a round fails to get
//! any closer, one last round queries every remaining unqueried contact in
//! the shortlist and the lookup ends.
//!
//! A contact that fails to answer is dropped from the shortlist, and the
//! result only ever holds contacts that replied during this lookup.
//!
//! With `find_value` set the queries are `findValue`; the first reply that
//! carries the value ends the lookup.

use std::collections::HashSet;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::bits::Bitmap;
use crate::contact::Contact;
use crate::messages::Request;
use crate::node::Node;

const MAX_LOOKUP_ITERATIONS: usize = 20;

/// Rounds stop being started after this long; the shortlist so far is returned.
const LOOKUP_TOTAL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default)]
pub struct LookupResult {
    /// Closest contacts seen, nearest first.
    pub closest: Vec<Contact>,
    /// Holders returned by a `findValue` hit; empty otherwise.
    pub found: Vec<Contact>,
}

pub async fn find_contacts(node: &Node, target: Bitmap, find_value: bool) -> LookupResult {
    let k = node.config().bucket_size;
    let alpha = node.config().alpha;
    let self_id = node.id();
    let started = Instant::now();

    let mut shortlist = node.routing_table().get_closest(&target, k);
    let mut seen: HashSet<Bitmap> = shortlist.iter().map(|c| c.id).collect();
    let mut queried: HashSet<Bitmap> = HashSet::new();
    let mut responded: HashSet<Bitmap> = HashSet::new();
    let mut best_distance = shortlist
        .first()
        .map(|c| c.id.distance(&target))
        .unwrap_or_else(Bitmap::max);
    let mut iteration = 0;
    let mut final_round = false;

    loop {
        iteration += 1;
        if iteration > MAX_LOOKUP_ITERATIONS {
            warn!(
                target = %target.hex_short(),
                iterations = iteration,
                "iterative lookup exceeded max iterations"
            );
            break;
        }
        if started.elapsed() > LOOKUP_TOTAL_TIMEOUT {
            debug!(
                target = %target.hex_short(),
                elapsed_ms = started.elapsed().as_millis(),
                found = shortlist.len(),
                "iterative lookup timeout, returning current results"
            );
            break;
        }

        let candidates: Vec<Contact> = shortlist
            .iter()
            .filter(|c| !queried.contains(&c.id) && c.id != self_id)
            .take(if final_round { k } else { alpha })
            .copied()
            .collect();
        if candidates.is_empty() {
            break;
        }

        let mut join_set = JoinSet::new();
        for contact in candidates {
            queried.insert(contact.id);
            let node = node.clone();
            join_set.spawn(async move {
                let request = if find_value {
                    Request::find_value(target)
                } else {
                    Request::find_node(target)
                };
                (contact, node.send(contact, request).await)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            let Ok((contact, response)) = joined else {
                continue;
            };
            let Some(response) = response else {
                trace!(peer = %contact, "lookup query unanswered, dropping");
                shortlist.retain(|c| c.id != contact.id);
                continue;
            };
            responded.insert(contact.id);
            if find_value && response.find_value_key == Some(target) {
                debug!(
                    target = %target.hex_short(),
                    holder_count = response.contacts.len(),
                    from = %contact,
                    "value found"
                );
                join_set.abort_all();
                return LookupResult {
                    closest: answered(shortlist, &responded, &target),
                    found: response.contacts,
                };
            }
            for returned in response.contacts {
                if returned.id == self_id {
                    continue;
                }
                if seen.insert(returned.id) {
                    shortlist.push(returned);
                }
            }
        }

        sort_by_distance(&mut shortlist, &target);
        shortlist.truncate(k);
        if final_round {
            break;
        }

        let any_closer = match shortlist.first() {
            Some(first) if first.id.distance(&target) < best_distance => {
                best_distance = first.id.distance(&target);
                true
            }
            _ => false,
        };
        if !any_closer {
            final_round = true;
        }
    }

    let closest = answered(shortlist, &responded, &target);
    debug!(
        target = %target.hex_short(),
        found = closest.len(),
        queried = queried.len(),
        responded = responded.len(),
        "iterative lookup completed"
    );
    LookupResult {
        closest,
        found: Vec::new(),
    }
}

/// The shortlist entries that replied, nearest first.
fn answered(
    mut shortlist: Vec<Contact>,
    responded: &HashSet<Bitmap>,
    target: &Bitmap,
) -> Vec<Contact> {
    shortlist.retain(|c| responded.contains(&c.id));
    sort_by_distance(&mut shortlist, target);
    shortlist
}

fn sort_by_distance(contacts: &mut [Contact], target: &Bitmap) {
    contacts.sort_by_key(|c| c.id.distance(target));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use tokio::net::UdpSocket;

    use crate::config::NodeConfig;

    fn config(alpha: usize, timeout: Duration) -> NodeConfig {
        NodeConfig::default()
            .alpha(alpha)
            .udp_retry(1)
            .udp_timeout(timeout)
    }

    async fn live_node(id: Bitmap, config: NodeConfig) -> (Node, Contact) {
        let node = Node::new(id, config);
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        node.connect(Arc::new(socket)).await.unwrap();
        (node, Contact::new(id, addr))
    }

    /// An id `target ^ 2^n`, so smaller `n` means closer to `target`.
    fn id_near(target: &Bitmap, bit_from_end: usize) -> Bitmap {
        let mut offset = Bitmap::zero();
        offset.set_bit(crate::bits::NODE_ID_BITS - 1 - bit_from_end, true);
        *target ^ offset
    }

    #[tokio::test]
    async fn silent_contacts_are_left_out() {
        let target = Bitmap::random();
        let (a, _) = live_node(id_near(&target, 200), config(5, Duration::from_millis(150))).await;
        let (b, b_contact) = live_node(id_near(&target, 100), config(5, Duration::from_millis(150))).await;

        a.routing_table().update(b_contact);
        let mut silent = Vec::new();
        for n in 1..=3 {
            let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
            let contact = Contact::new(id_near(&target, n), socket.local_addr().unwrap());
            a.routing_table().update(contact);
            silent.push((socket, contact));
        }

        let result = find_contacts(&a, target, false).await;
        assert_eq!(result.closest, vec![b_contact]);
        for (_, contact) in &silent {
            assert!(!result.closest.iter().any(|c| c.id == contact.id));
        }

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn last_round_queries_every_remaining_contact() {
        let target = Bitmap::random();
        let (a, _) = live_node(id_near(&target, 300), config(1, Duration::from_millis(500))).await;
        let mut peers = Vec::new();
        for n in [10, 20, 30] {
            let (node, contact) = live_node(id_near(&target, n), config(1, Duration::from_millis(500))).await;
            a.routing_table().update(contact);
            peers.push((node, contact));
        }

        // alpha is 1 and no peer knows anyone new, so only the last round
        // reaches the two farther peers
        let result = find_contacts(&a, target, false).await;
        let expected: Vec<Contact> = peers.iter().map(|(_, c)| *c).collect();
        assert_eq!(result.closest, expected);
        assert!(result.found.is_empty());

        for (node, _) in &peers {
            node.shutdown().await;
        }
        a.shutdown().await;
    }

    #[tokio::test]
    async fn value_hit_ends_the_lookup() {
        let hash = Bitmap::random();
        let slow = Duration::from_secs(3);
        let (a, _) = live_node(id_near(&hash, 300), config(5, slow)).await;
        let (holder, holder_contact) = live_node(id_near(&hash, 50), config(5, slow)).await;
        let announcer = Contact::new(Bitmap::random(), "10.0.0.9:7000".parse().unwrap());
        holder.store(hash, announcer);

        a.routing_table().update(holder_contact);
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.routing_table()
            .update(Contact::new(id_near(&hash, 60), silent.local_addr().unwrap()));

        let started = Instant::now();
        let result = find_contacts(&a, hash, true).await;
        assert!(started.elapsed() < slow, "did not wait on the silent peer");
        assert_eq!(result.found, vec![announcer]);
        assert_eq!(result.closest, vec![holder_contact]);

        a.shutdown().await;
        holder.shutdown().await;
    }
}
