//! # blobdht - Peer Discovery for a Blob CDN
//!
//! A Kademlia DHT that answers "which peers hold blob H". Blobs are
//! content-addressed, node ids and blob hashes share one 384-bit keyspace,
//! and nodes announce the blobs they hold on the nodes whose ids are closest
//! to each hash. Blob bytes move over a separate protocol; this crate only
//! finds the holders.
//!
//! ## Architecture
//!
//! - A [`Node`] owns a UDP socket, a routing table, a contact store, a token
//!   manager and the table of in-flight transactions. It is a cheap-to-clone
//!   handle over shared state; its tasks coordinate through channels.
//! - A [`Dht`] wraps a node with join, get, announce and re-announce.
//! - Everything on the wire is one bencoded dictionary per datagram.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `bits` | 384-bit identifiers, XOR distance and arithmetic |
//! | `bencode` | binary-safe value codec under the wire format |
//! | `contact` | node id plus address, list and compact encodings |
//! | `messages` | request, response and error messages |
//! | `token` | rotating store-authorization tokens |
//! | `store` | blob hash to announcing contacts |
//! | `routing` | prefix-bucketed routing table |
//! | `transport` | datagram socket abstraction |
//! | `node` | the engine: I/O loops, transactions, request handling |
//! | `lookup` | iterative Kademlia lookup |
//! | `dht` | application-facing facade |
//! | `config` | protocol constants and tunables |

pub mod bencode;
pub mod bits;
pub mod config;
pub mod contact;
mod dht;
pub mod lookup;
pub mod messages;
mod node;
pub mod routing;
pub mod store;
pub mod token;
pub mod transport;

pub use bits::{Bitmap, BitmapError};
pub use config::{DhtConfig, NodeConfig};
pub use contact::Contact;
pub use dht::Dht;
pub use node::{CancelHandle, DefaultRequestHandler, Node, RequestHandler};
pub use transport::{DatagramSocket, UdpTransport};
