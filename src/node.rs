//! # Node Engine
//!
//! A [`Node`] owns one datagram socket and everything needed to speak the DHT
//! protocol over it: the routing table, the contact store, the token manager
//! and the table of outstanding transactions.
//!
//! ## Tasks
//!
//! | Task | Count | Waits on |
//! |------|-------|----------|
//! | read loop | 1 | socket read (bounded by the read deadline) |
//! | packet processor | 1 | inbound packet queue; packets are handled one at a time |
//! | token rotation | 1 | rotation ticker |
//! | refresher | 1 | refresh ticker; runs bucket lookups and store expiry |
//! | transaction | one per send | reply, per-attempt timeout, cancellation |
//!
//! Every task watches the same stop signal. [`Node::shutdown`] raises it,
//! closes the socket and returns only after every task has exited.
//!
//! ## Transactions
//!
//! Each outbound request gets a fresh 20-byte id and a table entry holding
//! the target and a one-shot slot for the outcome. A reply completes the
//! transaction only if both its id and its source address match. The
//! transaction is retried up to `udp_retry` times; when all attempts go
//! unanswered, or the peer answers with an error, the target is reported to
//! the routing table as failed and the caller's receiver closes empty.
//! Cancellation abandons the transaction without blaming the peer.
//!
//! ## Locking
//!
//! The transaction table, routing table and contact store each have their
//! own lock. None of them is held across an await point and no two are ever
//! held together.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

use crate::bits::Bitmap;
use crate::config::{MIN_TIMER_PERIOD, NodeConfig, UDP_MAX_MESSAGE_LENGTH};
use crate::contact::Contact;
use crate::lookup;
use crate::messages::{
    ERROR_INVALID_METHOD, ERROR_INVALID_TOKEN, ERROR_MISSING_ARG, ErrorMessage, Message,
    MessageId, Method, PING_SUCCESS_RESPONSE, Request, Response, STORE_SUCCESS_RESPONSE,
};
use crate::routing::RoutingTable;
use crate::store::ContactStore;
use crate::token::TokenManager;
use crate::transport::{DatagramSocket, is_closed_error};

/// Datagrams buffered between the read loop and the processor.
const PACKET_QUEUE_CAPACITY: usize = 1024;

/// Compact contacts in a found-value reply. Fifty IPv6 entries still fit
/// in one datagram.
const MAX_FOUND_VALUE_CONTACTS: usize = 50;

/// Hook for answering inbound requests.
///
/// Installed at construction with [`Node::with_handler`]. Implementations
/// reply through [`Node::reply`], or fall back to the standard behaviour with
/// [`Node::handle_request`].
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, node: &Node, from: SocketAddr, request: Request);
}

/// Answers `ping`, `store`, `findNode` and `findValue` from local state.
pub struct DefaultRequestHandler;

#[async_trait]
impl RequestHandler for DefaultRequestHandler {
    async fn handle(&self, node: &Node, from: SocketAddr, request: Request) {
        node.handle_request(from, request).await;
    }
}

/// Cancels the transaction started by [`Node::send_cancelable`].
///
/// Dropping the handle without calling [`CancelHandle::cancel`] lets the
/// transaction run to completion.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

enum TxOutcome {
    Response(Response),
    Error(ErrorMessage),
}

struct Transaction {
    /// `None` when pinging an address whose id we don't know yet.
    target_id: Option<Bitmap>,
    addr: SocketAddr,
    request: Request,
    outcome: oneshot::Sender<TxOutcome>,
}

struct Inner {
    id: Bitmap,
    config: NodeConfig,
    routing: RoutingTable,
    store: ContactStore,
    tokens: TokenManager,
    handler: Arc<dyn RequestHandler>,
    socket: RwLock<Option<Arc<dyn DatagramSocket>>>,
    transactions: RwLock<HashMap<MessageId, Transaction>>,
    stop: watch::Sender<bool>,
    closing: AtomicBool,
    /// Cloned into every spawned task; shutdown drops the original and waits
    /// for the receiver to report that every clone is gone.
    task_guard: Mutex<Option<mpsc::Sender<()>>>,
    tasks_done: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

/// Handle to a DHT node. Cloning is cheap; clones share the same engine.
#[derive(Clone)]
pub struct Node {
    inner: Arc<Inner>,
}

impl Node {
    pub fn new(id: Bitmap, config: NodeConfig) -> Self {
        Self::with_handler(id, config, Arc::new(DefaultRequestHandler))
    }

    pub fn with_handler(id: Bitmap, config: NodeConfig, handler: Arc<dyn RequestHandler>) -> Self {
        let routing = RoutingTable::new(
            id,
            config.bucket_size,
            config.max_peer_fails,
            config.questionable_after,
        );
        let store = ContactStore::new(
            config.max_stored_hashes,
            config.max_contacts_per_hash,
            config.contact_expiry,
        );
        let (stop, _) = watch::channel(false);
        let (guard_tx, guard_rx) = mpsc::channel(1);
        Self {
            inner: Arc::new(Inner {
                id,
                config,
                routing,
                store,
                tokens: TokenManager::new(),
                handler,
                socket: RwLock::new(None),
                transactions: RwLock::new(HashMap::new()),
                stop,
                closing: AtomicBool::new(false),
                task_guard: Mutex::new(Some(guard_tx)),
                tasks_done: tokio::sync::Mutex::new(Some(guard_rx)),
            }),
        }
    }

    pub fn id(&self) -> Bitmap {
        self.inner.id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.inner.routing
    }

    pub fn contact_store(&self) -> &ContactStore {
        &self.inner.store
    }

    pub fn token_manager(&self) -> &TokenManager {
        &self.inner.tokens
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket().and_then(|s| s.local_addr().ok())
    }

    /// Record locally that `contact` holds blob `hash`.
    pub fn store(&self, hash: Bitmap, contact: Contact) {
        self.inner.store.upsert(hash, contact);
    }

    pub fn count_active_transactions(&self) -> usize {
        self.inner
            .transactions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Start serving on `socket`: spawns the read loop, the packet processor,
    /// token rotation and the routing refresher.
    pub async fn connect(&self, socket: Arc<dyn DatagramSocket>) -> Result<()> {
        if self.inner.closing.load(Ordering::Acquire) {
            bail!("node has been shut down");
        }
        let local_addr = socket
            .local_addr()
            .context("datagram socket has no local address")?;
        {
            let mut slot = self.inner.socket.write().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                bail!("node is already connected");
            }
            *slot = Some(socket.clone());
        }

        let (packet_tx, packet_rx) = mpsc::channel(PACKET_QUEUE_CAPACITY);
        let guard = || self.task_guard().context("node is shutting down");

        let reader = self.clone();
        let done = guard()?;
        tokio::spawn(async move {
            reader.read_loop(socket, packet_tx).await;
            drop(done);
        });

        let processor = self.clone();
        let done = guard()?;
        tokio::spawn(async move {
            processor.process_loop(packet_rx).await;
            drop(done);
        });

        let rotator = self.clone();
        let done = guard()?;
        let stop = self.inner.stop.subscribe();
        tokio::spawn(async move {
            rotator
                .inner
                .tokens
                .run_rotation(rotator.inner.config.token_rotation, stop)
                .await;
            drop(done);
        });

        let refresher = self.clone();
        let done = guard()?;
        tokio::spawn(async move {
            refresher.refresh_loop().await;
            drop(done);
        });

        info!(
            id = %self.inner.id.hex_short(),
            addr = %local_addr,
            "dht node listening"
        );
        Ok(())
    }

    /// Stop every task, close the socket and wait for the tasks to exit.
    /// Concurrent and repeated calls all return only once the tasks are gone.
    pub async fn shutdown(&self) {
        if !self.inner.closing.swap(true, Ordering::AcqRel) {
            self.inner.stop.send_replace(true);
            if let Some(socket) = self.socket() {
                socket.close();
            }
            self.inner
                .task_guard
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
        }

        // held while draining so later callers wait for the first
        let mut done = self.inner.tasks_done.lock().await;
        if let Some(rx) = done.as_mut() {
            while rx.recv().await.is_some() {}
            *done = None;
            debug!(id = %self.inner.id.hex_short(), "dht node stopped");
        }
    }

    /// Send `request` and wait for the reply. `None` means no usable reply:
    /// timeout, error reply, cancellation or shutdown.
    pub async fn send(&self, contact: Contact, request: Request) -> Option<Response> {
        self.send_async(contact, request).await.ok()
    }

    /// Start a transaction and return the receiver for its reply.
    ///
    /// The receiver closes empty when the transaction yields no response.
    /// A contact carrying our own id is refused without creating a
    /// transaction or sending anything.
    pub fn send_async(&self, contact: Contact, request: Request) -> oneshot::Receiver<Response> {
        self.start_transaction(Some(contact.id), contact.addr(), request, None)
    }

    /// [`Node::send_async`] with a handle that abandons the transaction.
    pub fn send_cancelable(
        &self,
        contact: Contact,
        request: Request,
    ) -> (oneshot::Receiver<Response>, CancelHandle) {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let rx = self.start_transaction(Some(contact.id), contact.addr(), request, Some(cancel_rx));
        (rx, CancelHandle(cancel_tx))
    }

    pub async fn ping(&self, contact: Contact) -> bool {
        self.send(contact, Request::ping()).await.is_some()
    }

    /// Ping an address whose node id is unknown, e.g. a bootstrap seed.
    /// On success the responder is added to the routing table.
    pub async fn ping_addr(&self, addr: SocketAddr) -> Option<Contact> {
        self.start_transaction(None, addr, Request::ping(), None)
            .await
            .ok()
            .map(|response| Contact::new(response.node_id, addr))
    }

    /// Encode and write `message` to `to`.
    pub async fn reply(&self, to: SocketAddr, message: impl Into<Message>) {
        let message = message.into();
        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(peer = %to, error = %e, "failed to encode reply");
                return;
            }
        };
        if let Err(e) = self.write(&bytes, to).await {
            self.log_write_error(&e, to);
        }
    }

    /// Standard answers to the four protocol methods.
    pub async fn handle_request(&self, from: SocketAddr, request: Request) {
        let id = self.inner.id;
        let reply: Message = match &request.method {
            Method::Ping => Response {
                data: Some(PING_SUCCESS_RESPONSE.to_string()),
                ..Response::to(&request, id)
            }
            .into(),
            Method::Store => match &request.store_args {
                None => ErrorMessage::to(&request, id, ERROR_MISSING_ARG).into(),
                Some(args)
                    if self
                        .inner
                        .tokens
                        .verify(&args.value.token, &request.node_id, &from) =>
                {
                    let holder = Contact {
                        id: args.value.publisher,
                        ip: from.ip(),
                        port: args.value.port,
                    };
                    self.inner.store.upsert(args.blob_hash, holder);
                    debug!(
                        hash = %args.blob_hash.hex_short(),
                        holder = %holder,
                        "stored announcement"
                    );
                    Response {
                        data: Some(STORE_SUCCESS_RESPONSE.to_string()),
                        ..Response::to(&request, id)
                    }
                    .into()
                }
                Some(args) => {
                    debug!(
                        peer = %from,
                        hash = %args.blob_hash.hex_short(),
                        "rejecting store with invalid token"
                    );
                    ErrorMessage::to(&request, id, ERROR_INVALID_TOKEN).into()
                }
            },
            Method::FindNode => match request.arg {
                None => ErrorMessage::to(&request, id, ERROR_MISSING_ARG).into(),
                Some(target) => Response {
                    contacts: self
                        .inner
                        .routing
                        .get_closest(&target, self.inner.config.bucket_size),
                    ..Response::to(&request, id)
                }
                .into(),
            },
            Method::FindValue => match request.arg {
                None => ErrorMessage::to(&request, id, ERROR_MISSING_ARG).into(),
                Some(target) => {
                    let token = Some(self.inner.tokens.get(&request.node_id, &from));
                    let mut found = self.inner.store.get(&target);
                    if found.is_empty() {
                        Response {
                            contacts: self
                                .inner
                                .routing
                                .get_closest(&target, self.inner.config.bucket_size),
                            token,
                            ..Response::to(&request, id)
                        }
                        .into()
                    } else {
                        if found.len() > MAX_FOUND_VALUE_CONTACTS {
                            found.drain(..found.len() - MAX_FOUND_VALUE_CONTACTS);
                        }
                        Response {
                            contacts: found,
                            find_value_key: Some(target),
                            token,
                            ..Response::to(&request, id)
                        }
                        .into()
                    }
                }
            },
            Method::Unknown(name) => {
                debug!(peer = %from, method = %name, "unknown request method");
                ErrorMessage::to(&request, id, ERROR_INVALID_METHOD).into()
            }
        };
        self.reply(from, reply).await;
    }

    fn socket(&self) -> Option<Arc<dyn DatagramSocket>> {
        self.inner
            .socket
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn task_guard(&self) -> Option<mpsc::Sender<()>> {
        self.inner
            .task_guard
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::Acquire)
    }

    async fn write(&self, bytes: &[u8], to: SocketAddr) -> io::Result<()> {
        let socket = self
            .socket()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "node not connected"))?;
        match tokio::time::timeout(self.inner.config.write_deadline, socket.send_to(bytes, to)).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write deadline exceeded")),
        }
    }

    fn log_write_error(&self, err: &io::Error, to: SocketAddr) {
        if self.is_closing() || is_closed_error(err) {
            trace!(peer = %to, error = %err, "write on closed socket");
        } else {
            warn!(peer = %to, error = %err, "udp write failed");
        }
    }

    fn start_transaction(
        &self,
        target_id: Option<Bitmap>,
        addr: SocketAddr,
        mut request: Request,
        cancel: Option<watch::Receiver<bool>>,
    ) -> oneshot::Receiver<Response> {
        let (result_tx, result_rx) = oneshot::channel();

        if target_id == Some(self.inner.id) {
            warn!(peer = %addr, method = %request.method, "refusing to send a request to ourselves");
            return result_rx;
        }
        if self.is_closing() {
            return result_rx;
        }
        let Some(done) = self.task_guard() else {
            return result_rx;
        };

        request.node_id = self.inner.id;
        let (outcome_tx, outcome_rx) = oneshot::channel();
        {
            let mut transactions = self
                .inner
                .transactions
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let mut id = MessageId::random();
            while transactions.contains_key(&id) {
                id = MessageId::random();
            }
            request.id = id;
            transactions.insert(
                id,
                Transaction {
                    target_id,
                    addr,
                    request: request.clone(),
                    outcome: outcome_tx,
                },
            );
        }

        let node = self.clone();
        tokio::spawn(async move {
            node.run_transaction(target_id, addr, request, outcome_rx, result_tx, cancel)
                .await;
            drop(done);
        });
        result_rx
    }

    async fn run_transaction(
        &self,
        target_id: Option<Bitmap>,
        addr: SocketAddr,
        request: Request,
        mut outcome_rx: oneshot::Receiver<TxOutcome>,
        result_tx: oneshot::Sender<Response>,
        mut cancel: Option<watch::Receiver<bool>>,
    ) {
        let tx_id = request.id;
        let mut stop = self.inner.stop.subscribe();
        let mut outcome = None;
        let mut abandoned = false;

        match Message::Request(request.clone()).encode() {
            Ok(bytes) => {
                for attempt in 1..=self.inner.config.udp_retry {
                    if let Err(e) = self.write(&bytes, addr).await {
                        self.log_write_error(&e, addr);
                        break;
                    }
                    trace!(
                        peer = %addr,
                        method = %request.method,
                        tx = ?tx_id,
                        attempt,
                        "request sent"
                    );
                    tokio::select! {
                        res = &mut outcome_rx => {
                            outcome = res.ok();
                            break;
                        }
                        _ = tokio::time::sleep(self.inner.config.udp_timeout) => {}
                        _ = stopped(&mut stop) => {
                            abandoned = true;
                            break;
                        }
                        _ = cancelled(&mut cancel) => {
                            abandoned = true;
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!(peer = %addr, error = %e, "failed to encode request"),
        }

        self.inner
            .transactions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&tx_id);
        if outcome.is_none() && !abandoned {
            // a reply may have been delivered just as the last attempt timed out
            outcome = outcome_rx.try_recv().ok();
        }

        match outcome {
            Some(TxOutcome::Response(response)) => {
                let _ = result_tx.send(response);
            }
            Some(TxOutcome::Error(error)) => {
                debug!(
                    peer = %addr,
                    method = %request.method,
                    exception = %error.exception_type,
                    "request answered with error"
                );
                self.report_failure(target_id, addr);
            }
            None if abandoned || self.is_closing() => {
                trace!(peer = %addr, tx = ?tx_id, "transaction abandoned");
            }
            None => {
                debug!(
                    peer = %addr,
                    method = %request.method,
                    attempts = self.inner.config.udp_retry,
                    "request unanswered"
                );
                self.report_failure(target_id, addr);
            }
        }
    }

    fn report_failure(&self, target_id: Option<Bitmap>, addr: SocketAddr) {
        if let Some(id) = target_id {
            self.inner.routing.fail(&Contact::new(id, addr));
        }
    }

    /// Take the transaction `id` if it was sent to `from`.
    fn take_transaction(&self, id: &MessageId, from: &SocketAddr) -> Option<Transaction> {
        let mut transactions = self
            .inner
            .transactions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match transactions.get(id) {
            Some(tx) if tx.addr == *from => transactions.remove(id),
            Some(_) => {
                debug!(peer = %from, tx = ?id, "reply from unexpected address, dropping");
                None
            }
            None => {
                trace!(peer = %from, tx = ?id, "reply for unknown transaction, dropping");
                None
            }
        }
    }

    async fn read_loop(&self, socket: Arc<dyn DatagramSocket>, packets: mpsc::Sender<(Vec<u8>, SocketAddr)>) {
        let mut stop = self.inner.stop.subscribe();
        let mut buf = vec![0u8; UDP_MAX_MESSAGE_LENGTH];
        let deadline = self.inner.config.read_deadline;
        loop {
            tokio::select! {
                _ = stopped(&mut stop) => break,
                res = tokio::time::timeout(deadline, socket.recv_from(&mut buf)) => match res {
                    Err(_) => continue,
                    Ok(Ok((len, from))) => {
                        if packets.send((buf[..len].to_vec(), from)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Err(e)) => {
                        if self.is_closing() {
                            break;
                        }
                        if is_closed_error(&e) {
                            debug!(error = %e, "socket closed, read loop exiting");
                            break;
                        }
                        warn!(error = %e, "udp read failed");
                    }
                },
            }
        }
        trace!("read loop stopped");
    }

    async fn process_loop(&self, mut packets: mpsc::Receiver<(Vec<u8>, SocketAddr)>) {
        let mut stop = self.inner.stop.subscribe();
        loop {
            tokio::select! {
                _ = stopped(&mut stop) => break,
                packet = packets.recv() => match packet {
                    Some((data, from)) => self.process_packet(&data, from).await,
                    None => break,
                },
            }
        }
        trace!("packet processor stopped");
    }

    async fn process_packet(&self, data: &[u8], from: SocketAddr) {
        let message = match Message::decode(data) {
            Ok(message) => message,
            Err(e) => {
                debug!(peer = %from, len = data.len(), error = %e, "dropping malformed packet");
                return;
            }
        };

        match message {
            Message::Request(request) => {
                if request.node_id == self.inner.id {
                    warn!(peer = %from, method = %request.method, "ignoring request carrying our own id");
                    return;
                }
                let sender = Contact::new(request.node_id, from);
                trace!(peer = %sender, method = %request.method, "request received");
                let handler = self.inner.handler.clone();
                handler.handle(self, from, request).await;
                self.inner.routing.fresh(sender);
            }
            Message::Response(response) => {
                let Some(tx) = self.take_transaction(&response.id, &from) else {
                    return;
                };
                trace!(
                    peer = %from,
                    method = %tx.request.method,
                    expected = ?tx.target_id.map(|id| id.hex_short()),
                    "response matched"
                );
                self.inner.routing.update(Contact::new(response.node_id, from));
                let _ = tx.outcome.send(TxOutcome::Response(response));
            }
            Message::Error(error) => {
                let Some(tx) = self.take_transaction(&error.id, &from) else {
                    return;
                };
                let _ = tx.outcome.send(TxOutcome::Error(error));
            }
        }
    }

    async fn refresh_loop(&self) {
        let mut stop = self.inner.stop.subscribe();
        let period = self.inner.config.refresh_interval;
        let mut ticker = tokio::time::interval((period / 5).max(MIN_TIMER_PERIOD));
        ticker.tick().await;

        'outer: loop {
            tokio::select! {
                _ = stopped(&mut stop) => break,
                _ = ticker.tick() => {}
            }

            let expired = self.inner.store.remove_expired();
            if expired > 0 {
                debug!(expired, "swept expired announcements");
            }

            let stale = self.inner.routing.stale_buckets(period);
            if stale.is_empty() {
                continue;
            }
            debug!(count = stale.len(), "refreshing stale routing buckets");
            for idx in stale {
                let target = self.inner.routing.random_id_in_bucket(idx);
                tokio::select! {
                    _ = stopped(&mut stop) => break 'outer,
                    result = lookup::find_contacts(self, target, false) => {
                        trace!(bucket = idx, found = result.closest.len(), "bucket refreshed");
                    }
                }
                self.inner.routing.mark_bucket_refreshed(idx);
            }
        }
        trace!("refresher stopped");
    }
}

/// Resolves once `flag` reads true, including when it already did before
/// the receiver was created. Never resolves if the sender is gone.
pub(crate) async fn stopped(flag: &mut watch::Receiver<bool>) {
    loop {
        let set = *flag.borrow_and_update();
        if set {
            return;
        }
        if flag.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Resolves when the caller cancels; never resolves without a handle or
/// once the handle is dropped.
async fn cancelled(cancel: &mut Option<watch::Receiver<bool>>) {
    match cancel {
        Some(rx) => stopped(rx).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use crate::messages::StoreArgs;
    use crate::messages::StoreArgsValue;
    use tokio::net::UdpSocket;

    fn test_config() -> NodeConfig {
        NodeConfig::default()
            .udp_timeout(Duration::from_millis(100))
            .udp_retry(2)
    }

    async fn connected_node() -> (Node, SocketAddr) {
        let node = Node::new(Bitmap::random(), test_config());
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        node.connect(Arc::new(socket)).await.unwrap();
        (node, addr)
    }

    fn request_from(node_id: Bitmap, mut request: Request) -> Request {
        request.id = MessageId::random();
        request.node_id = node_id;
        request
    }

    #[tokio::test]
    async fn store_requires_valid_token() {
        let (node, _) = connected_node().await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let peer_id = Bitmap::random();
        let hash = Bitmap::random();

        let args = StoreArgs {
            blob_hash: hash,
            value: StoreArgsValue {
                token: vec![7; 32],
                publisher: peer_id,
                port: 5567,
            },
            node_id: peer_id,
            self_store: false,
        };
        node.handle_request(peer_addr, request_from(peer_id, Request::store(args.clone())))
            .await;
        assert!(node.contact_store().get(&hash).is_empty());

        let mut buf = [0u8; UDP_MAX_MESSAGE_LENGTH];
        let (n, _) = peer.recv_from(&mut buf).await.unwrap();
        let Message::Error(err) = Message::decode(&buf[..n]).unwrap() else {
            panic!("expected an error reply");
        };
        assert_eq!(err.exception_type, ERROR_INVALID_TOKEN);

        let valid = StoreArgs {
            value: StoreArgsValue {
                token: node.token_manager().get(&peer_id, &peer_addr),
                ..args.value.clone()
            },
            ..args
        };
        node.handle_request(peer_addr, request_from(peer_id, Request::store(valid)))
            .await;
        let (n, _) = peer.recv_from(&mut buf).await.unwrap();
        let Message::Response(ok) = Message::decode(&buf[..n]).unwrap() else {
            panic!("expected a response");
        };
        assert_eq!(ok.data.as_deref(), Some(STORE_SUCCESS_RESPONSE));
        let stored = node.contact_store().get(&hash);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, peer_id);
        assert_eq!(stored[0].port, 5567);
        assert_eq!(stored[0].ip, peer_addr.ip());

        node.shutdown().await;
    }

    #[tokio::test]
    async fn missing_args_and_unknown_methods_get_errors() {
        let (node, _) = connected_node().await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let peer_id = Bitmap::random();
        let mut buf = [0u8; UDP_MAX_MESSAGE_LENGTH];

        let mut bare = request_from(peer_id, Request::find_node(Bitmap::random()));
        bare.arg = None;
        node.handle_request(peer_addr, bare).await;
        let (n, _) = peer.recv_from(&mut buf).await.unwrap();
        let Message::Error(err) = Message::decode(&buf[..n]).unwrap() else {
            panic!("expected an error reply");
        };
        assert_eq!(err.exception_type, ERROR_MISSING_ARG);

        let mut odd = request_from(peer_id, Request::ping());
        odd.method = Method::Unknown("teleport".into());
        node.handle_request(peer_addr, odd).await;
        let (n, _) = peer.recv_from(&mut buf).await.unwrap();
        let Message::Error(err) = Message::decode(&buf[..n]).unwrap() else {
            panic!("expected an error reply");
        };
        assert_eq!(err.exception_type, ERROR_INVALID_METHOD);

        node.shutdown().await;
    }

    #[tokio::test]
    async fn self_send_is_refused() {
        let (node, addr) = connected_node().await;
        let me = Contact::new(node.id(), addr);
        let rx = node.send_async(me, Request::ping());
        assert_eq!(node.count_active_transactions(), 0);
        assert!(rx.await.is_err());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn cancel_abandons_without_failing_peer() {
        let (node, _) = connected_node().await;
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = Contact::new(Bitmap::random(), silent.local_addr().unwrap());
        node.routing_table().update(peer);

        let (rx, cancel) = node.send_cancelable(peer, Request::ping());
        assert_eq!(node.count_active_transactions(), 1);
        cancel.cancel();
        assert!(rx.await.is_err());
        assert_eq!(node.count_active_transactions(), 0);
        assert_eq!(node.routing_table().failures(&peer.id), Some(0));

        node.shutdown().await;
    }

    struct SlowHandler {
        started: tokio::sync::Notify,
        finished: AtomicBool,
    }

    #[async_trait]
    impl RequestHandler for SlowHandler {
        async fn handle(&self, _node: &Node, _from: SocketAddr, _request: Request) {
            self.started.notify_one();
            tokio::time::sleep(Duration::from_millis(300)).await;
            self.finished.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn concurrent_shutdown_callers_all_wait() {
        let handler = Arc::new(SlowHandler {
            started: tokio::sync::Notify::new(),
            finished: AtomicBool::new(false),
        });
        let node = Node::with_handler(Bitmap::random(), test_config(), handler.clone());
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        node.connect(Arc::new(socket)).await.unwrap();

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let ping = request_from(Bitmap::random(), Request::ping());
        peer.send_to(&Message::from(ping).encode().unwrap(), addr)
            .await
            .unwrap();
        handler.started.notified().await;

        let first = {
            let node = node.clone();
            tokio::spawn(async move { node.shutdown().await })
        };
        while !node.is_closing() {
            tokio::task::yield_now().await;
        }
        node.shutdown().await;
        assert!(
            handler.finished.load(Ordering::SeqCst),
            "second caller returned while the processor was still busy"
        );
        first.await.unwrap();
    }

    #[tokio::test]
    async fn refresher_sweeps_store_and_queries_stale_buckets() {
        let config = test_config()
            .refresh_interval(Duration::from_millis(200))
            .contact_expiry(Duration::from_millis(50));
        let a = Node::new(Bitmap::random(), config);
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        a.connect(Arc::new(socket)).await.unwrap();
        let (b, b_addr) = connected_node().await;
        let b_contact = Contact::new(b.id(), b_addr);

        a.routing_table().update(b_contact);
        a.store(Bitmap::random(), b_contact);
        assert_eq!(a.contact_store().len(), 1);

        // b only hears from a once a refresh lookup goes out
        tokio::time::timeout(Duration::from_secs(5), async {
            while b.routing_table().get(&a.id()).is_none() || !a.contact_store().is_empty() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("refresher never ran");
        assert_eq!(a.routing_table().failures(&b.id()), Some(0));

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_waits_for_transactions() {
        let (node, _) = connected_node().await;
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = Contact::new(Bitmap::random(), silent.local_addr().unwrap());

        let rx = node.send_async(peer, Request::ping());
        node.shutdown().await;
        assert_eq!(node.count_active_transactions(), 0);
        assert!(rx.await.is_err());

        let late = node.send_async(peer, Request::ping());
        assert!(late.await.is_err());
        assert!(node.connect(Arc::new(silent)).await.is_err());
    }
}
