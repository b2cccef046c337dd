//! Integration tests for the node engine over real UDP sockets.
//!
//! Peers are either full nodes or raw sockets scripted by the test, so the
//! wire behaviour (retries, transaction matching, token checks) is observed
//! from the outside.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use blobdht::config::UDP_MAX_MESSAGE_LENGTH;
use blobdht::messages::{
    ERROR_INVALID_TOKEN, Message, PING_SUCCESS_RESPONSE, Request, Response,
    STORE_SUCCESS_RESPONSE, StoreArgs, StoreArgsValue,
};
use blobdht::routing::ContactStatus;
use blobdht::{Bitmap, Contact, Node, NodeConfig, RequestHandler};
use tokio::net::UdpSocket;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn fast_config() -> NodeConfig {
    NodeConfig::default()
        .udp_timeout(Duration::from_millis(150))
        .udp_retry(3)
}

async fn spawn_node(config: NodeConfig) -> (Node, SocketAddr) {
    let node = Node::new(Bitmap::random(), config);
    let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = socket.local_addr().expect("local_addr failed");
    node.connect(Arc::new(socket)).await.expect("connect failed");
    (node, addr)
}

async fn recv_message(socket: &UdpSocket) -> (Message, SocketAddr) {
    let mut buf = [0u8; UDP_MAX_MESSAGE_LENGTH];
    let (n, from) = timeout(TEST_TIMEOUT, socket.recv_from(&mut buf))
        .await
        .expect("recv timed out")
        .expect("recv failed");
    (Message::decode(&buf[..n]).expect("undecodable datagram"), from)
}

#[tokio::test]
async fn unanswered_request_is_retried_then_fails_peer() {
    let (node, _) = spawn_node(fast_config()).await;
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer = Contact::new(Bitmap::random(), silent.local_addr().unwrap());
    node.routing_table().update(peer);

    let result = timeout(TEST_TIMEOUT, node.send(peer, Request::ping()))
        .await
        .expect("send never finished");
    assert!(result.is_none());

    let mut ids = Vec::new();
    let mut buf = [0u8; UDP_MAX_MESSAGE_LENGTH];
    while let Ok(Ok((n, _))) =
        timeout(Duration::from_millis(100), silent.recv_from(&mut buf)).await
    {
        ids.push(Message::decode(&buf[..n]).unwrap().id());
    }
    assert_eq!(ids.len(), 3, "one datagram per attempt");
    assert!(ids.windows(2).all(|w| w[0] == w[1]), "retries reuse the transaction id");

    assert_eq!(node.routing_table().failures(&peer.id), Some(1));
    assert_eq!(node.count_active_transactions(), 0);
    node.shutdown().await;
}

#[tokio::test]
async fn replies_are_matched_by_transaction_id() {
    let (node, _) = spawn_node(fast_config()).await;
    let fake = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let fake_id = Bitmap::random();
    let peer = Contact::new(fake_id, fake.local_addr().unwrap());

    let (t1, t2) = (Bitmap::random(), Bitmap::random());
    let first = node.send_async(peer, Request::find_node(t1));
    let second = node.send_async(peer, Request::find_node(t2));
    assert_eq!(node.count_active_transactions(), 2);

    let mut pending: Vec<(Request, SocketAddr)> = Vec::new();
    while pending.len() < 2 {
        let (message, from) = recv_message(&fake).await;
        let Message::Request(request) = message else {
            panic!("expected a request");
        };
        if !pending.iter().any(|(r, _)| r.id == request.id) {
            pending.push((request, from));
        }
    }

    // answer in reverse order, tagging each reply with its request's target
    for (request, from) in pending.iter().rev() {
        let reply = Response {
            data: request.arg.map(|a| a.to_hex()),
            ..Response::to(request, fake_id)
        };
        let bytes = Message::from(reply).encode().unwrap();
        fake.send_to(&bytes, from).await.unwrap();
    }

    let first = timeout(TEST_TIMEOUT, first).await.unwrap().expect("first reply");
    let second = timeout(TEST_TIMEOUT, second).await.unwrap().expect("second reply");
    assert_eq!(first.data, Some(t1.to_hex()));
    assert_eq!(second.data, Some(t2.to_hex()));
    assert!(node.routing_table().get(&fake_id).is_some());

    node.shutdown().await;
}

#[tokio::test]
async fn reply_from_wrong_address_is_ignored() {
    let (node, _) = spawn_node(fast_config().udp_retry(1)).await;
    let target = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let imposter = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer = Contact::new(Bitmap::random(), target.local_addr().unwrap());

    let rx = node.send_async(peer, Request::ping());
    let (Message::Request(request), from) = recv_message(&target).await else {
        panic!("expected a request");
    };
    let forged = Message::from(Response::to(&request, peer.id)).encode().unwrap();
    imposter.send_to(&forged, from).await.unwrap();

    assert!(timeout(TEST_TIMEOUT, rx).await.unwrap().is_err());
    node.shutdown().await;
}

#[tokio::test]
async fn ping_between_nodes_fills_routing_tables() {
    let (a, _) = spawn_node(fast_config()).await;
    let (b, b_addr) = spawn_node(fast_config()).await;

    let found = timeout(TEST_TIMEOUT, a.ping_addr(b_addr))
        .await
        .unwrap()
        .expect("b should answer");
    assert_eq!(found.id, b.id());
    assert!(a.routing_table().get(&b.id()).is_some());

    let pong = a.send(found, Request::ping()).await.expect("pong");
    assert_eq!(pong.data.as_deref(), Some(PING_SUCCESS_RESPONSE));
    assert_eq!(pong.node_id, b.id());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn store_with_token_is_visible_to_find_value() {
    let (publisher, _) = spawn_node(fast_config()).await;
    let (holder, holder_addr) = spawn_node(fast_config()).await;
    let (reader, _) = spawn_node(fast_config()).await;
    let holder_contact = Contact::new(holder.id(), holder_addr);
    let hash = Bitmap::from_content(b"blob contents");

    let empty = publisher
        .send(holder_contact, Request::find_value(hash))
        .await
        .expect("findValue reply");
    assert!(empty.find_value_key.is_none());
    let token = empty.token.expect("findValue carries a token");

    let args = StoreArgs {
        blob_hash: hash,
        value: StoreArgsValue {
            token,
            publisher: publisher.id(),
            port: 7001,
        },
        node_id: publisher.id(),
        self_store: false,
    };
    let stored = publisher
        .send(holder_contact, Request::store(args))
        .await
        .expect("store reply");
    assert_eq!(stored.data.as_deref(), Some(STORE_SUCCESS_RESPONSE));

    let hit = reader
        .send(holder_contact, Request::find_value(hash))
        .await
        .expect("findValue reply");
    assert_eq!(hit.find_value_key, Some(hash));
    assert_eq!(hit.contacts.len(), 1);
    assert_eq!(hit.contacts[0].id, publisher.id());
    assert_eq!(hit.contacts[0].port, 7001);

    for node in [publisher, holder, reader] {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn token_for_another_node_is_rejected() {
    let (holder, holder_addr) = spawn_node(fast_config()).await;
    let (asker, _) = spawn_node(fast_config()).await;
    let raw = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let hash = Bitmap::random();

    let reply = asker
        .send(Contact::new(holder.id(), holder_addr), Request::find_value(hash))
        .await
        .expect("findValue reply");
    let stolen = reply.token.expect("token");

    let mut request = Request::store(StoreArgs {
        blob_hash: hash,
        value: StoreArgsValue {
            token: stolen,
            publisher: asker.id(),
            port: 9000,
        },
        node_id: asker.id(),
        self_store: false,
    });
    request.node_id = asker.id();
    raw.send_to(&Message::from(request).encode().unwrap(), holder_addr)
        .await
        .unwrap();

    let (Message::Error(err), _) = recv_message(&raw).await else {
        panic!("expected an error reply");
    };
    assert_eq!(err.exception_type, ERROR_INVALID_TOKEN);
    assert!(holder.contact_store().get(&hash).is_empty());

    holder.shutdown().await;
    asker.shutdown().await;
}

#[tokio::test]
async fn error_reply_counts_as_failure() {
    let (node, _) = spawn_node(fast_config()).await;
    let (other, other_addr) = spawn_node(fast_config()).await;
    let peer = Contact::new(other.id(), other_addr);
    node.routing_table().update(peer);

    let store = Request::store(StoreArgs {
        blob_hash: Bitmap::random(),
        value: StoreArgsValue {
            token: vec![1; 32],
            publisher: node.id(),
            port: 1,
        },
        node_id: node.id(),
        self_store: false,
    });
    assert!(node.send(peer, store).await.is_none());
    assert_eq!(node.routing_table().failures(&peer.id), Some(1));

    node.shutdown().await;
    other.shutdown().await;
}

struct CountingHandler {
    seen: AtomicUsize,
}

#[async_trait]
impl RequestHandler for CountingHandler {
    async fn handle(&self, node: &Node, from: SocketAddr, request: Request) {
        self.seen.fetch_add(1, Ordering::SeqCst);
        node.handle_request(from, request).await;
    }
}

#[tokio::test]
async fn custom_handler_sees_every_request() {
    let handler = Arc::new(CountingHandler {
        seen: AtomicUsize::new(0),
    });
    let node = Node::with_handler(Bitmap::random(), fast_config(), handler.clone());
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    node.connect(Arc::new(socket)).await.unwrap();

    let (client, _) = spawn_node(fast_config()).await;
    let contact = client.ping_addr(addr).await.expect("ping answered");
    client
        .send(contact, Request::find_node(Bitmap::random()))
        .await
        .expect("findNode answered");

    assert_eq!(handler.seen.load(Ordering::SeqCst), 2);
    assert_eq!(
        node.routing_table().status(&client.id()),
        Some(ContactStatus::Questionable),
        "requests alone never earn trust"
    );

    client.shutdown().await;
    node.shutdown().await;
}

#[tokio::test]
async fn shutdown_is_idempotent_and_refuses_reconnect() {
    let (node, _) = spawn_node(fast_config()).await;
    node.shutdown().await;
    node.shutdown().await;

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    assert!(node.connect(Arc::new(socket)).await.is_err());
    let peer = Contact::new(Bitmap::random(), "127.0.0.1:9".parse().unwrap());
    assert!(node.send(peer, Request::ping()).await.is_none());
}
