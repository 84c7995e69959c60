// Direct publish/subscribe over TCP. Every node binds one listener per message
// class; every peer it knows gets three outgoing subscriber connections. A
// publisher writes newline separated JSON to whoever is connected, the same
// fire and forget semantics as a PUB socket.

use crate::error::{LedgerError, Result};
use crate::network::transport::{DuplicatePolicy, Topic, Topology, Transport};
use crate::network::Node;
use log::{debug, info, warn};
use serde_json::{Deserializer, Value};
use std::collections::HashMap;
use std::io::{BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

const TCP_CONNECT_TIMEOUT: u64 = 3000;
const TCP_WRITE_TIMEOUT: u64 = 5000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Publish port per message class, shared by every node of the network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshPorts {
    pub nodes: u16,
    pub chain: u16,
    pub transaction: u16,
}

impl MeshPorts {
    pub fn get(&self, topic: Topic) -> u16 {
        match topic {
            Topic::Node => self.nodes,
            Topic::Chain => self.chain,
            Topic::Transaction => self.transaction,
        }
    }
}

/// One bound publish endpoint and the subscribers connected to it. Clones
/// share the endpoint.
#[derive(Clone)]
pub struct MeshPublisher {
    topic: Topic,
    local_addr: SocketAddr,
    listeners: Arc<Mutex<Vec<TcpStream>>>,
    closed: Arc<AtomicBool>,
}

impl MeshPublisher {
    fn bind(host: &str, port: u16, topic: Topic) -> Result<MeshPublisher> {
        let listener = TcpListener::bind((host, port)).map_err(|e| {
            LedgerError::Transport(format!("Failed to bind {topic} publisher on {host}:{port}: {e}"))
        })?;
        let local_addr = listener.local_addr()?;
        let listeners = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let accepted = Arc::clone(&listeners);
        let stopped = Arc::clone(&closed);
        thread::Builder::new()
            .name(format!("mesh-pub-{topic}"))
            .spawn(move || {
                for stream in listener.incoming() {
                    if stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    match stream {
                        Ok(stream) => {
                            if let Err(e) = stream
                                .set_write_timeout(Some(Duration::from_millis(TCP_WRITE_TIMEOUT)))
                            {
                                warn!("Dropping {topic} subscriber: {e}");
                                continue;
                            }
                            let _ = stream.set_nodelay(true);
                            debug!("{topic} subscriber connected: {:?}", stream.peer_addr());
                            lock(&accepted).push(stream);
                        }
                        Err(e) => warn!("Error accepting {topic} subscriber: {e}"),
                    }
                }
                debug!("{topic} publisher closed");
            })?;

        info!("Publisher broadcasting at: tcp://{local_addr} ({topic})");
        Ok(MeshPublisher {
            topic,
            local_addr,
            listeners,
            closed,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).len()
    }

    /// Disconnect every subscriber and release the port
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for stream in lock(&self.listeners).drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
        // Wake the accept loop so it sees the flag
        let _ = TcpStream::connect_timeout(&self.local_addr, Duration::from_millis(500));
    }

    /// Write one message to every connected subscriber, dropping dead ones
    pub fn send(&self, payload: &Value) -> Result<usize> {
        let mut line = serde_json::to_vec(payload)?;
        line.push(b'\n');

        let mut listeners = lock(&self.listeners);
        listeners.retain_mut(|stream| match stream.write_all(&line) {
            Ok(()) => true,
            Err(e) => {
                debug!("Dropping {} subscriber {:?}: {e}", self.topic, stream.peer_addr());
                false
            }
        });
        Ok(listeners.len())
    }
}

/// An outgoing subscription to one peer for one message class. The reader
/// thread forwards every message to the transport's inbox for that class.
pub struct MeshSubscriber {
    peer: String,
    topic: Topic,
    stream: TcpStream,
}

impl MeshSubscriber {
    pub fn peer(&self) -> &str {
        self.peer.as_str()
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

struct Inbox {
    sender: Mutex<Sender<Value>>,
    receiver: Mutex<Receiver<Value>>,
}

impl Inbox {
    fn new() -> Inbox {
        let (sender, receiver) = mpsc::channel();
        Inbox {
            sender: Mutex::new(sender),
            receiver: Mutex::new(receiver),
        }
    }
}

// The three subscribers to one peer. Readers carry the link number of the
// entry they were opened for and only ever remove that one.
struct PeerLink {
    link: u64,
    subscribers: Vec<MeshSubscriber>,
}

type Subscriptions = Arc<Mutex<HashMap<String, PeerLink>>>;

// Called by a reader whose connection ended: the peer is gone, so the whole
// entry goes and a later subscribe_to_node connects afresh
fn forget_peer(subscriptions: &Mutex<HashMap<String, PeerLink>>, peer: &str, link: u64) {
    let mut subscriptions = lock(subscriptions);
    if !subscriptions.get(peer).is_some_and(|entry| entry.link == link) {
        return;
    }
    if let Some(entry) = subscriptions.remove(peer) {
        entry.subscribers.iter().for_each(MeshSubscriber::close);
        info!("Lost subscription to {peer}");
    }
}

pub struct MeshTransport {
    this_node: String,
    ports: MeshPorts,
    publishers: HashMap<Topic, MeshPublisher>,
    inboxes: HashMap<Topic, Inbox>,
    // Keyed by peer address
    subscriptions: Subscriptions,
    next_link: AtomicU64,
}

impl MeshTransport {
    /// Bind the three publishers on `bind_host`. A zero port picks a free one;
    /// the bound ports are then the ones used to reach peers.
    pub fn bind(this_node: &str, bind_host: &str, ports: MeshPorts) -> Result<MeshTransport> {
        let mut publishers = HashMap::new();
        for topic in Topic::ALL {
            publishers.insert(topic, MeshPublisher::bind(bind_host, ports.get(topic), topic)?);
        }
        let bound = MeshPorts {
            nodes: publishers[&Topic::Node].local_addr().port(),
            chain: publishers[&Topic::Chain].local_addr().port(),
            transaction: publishers[&Topic::Transaction].local_addr().port(),
        };
        let inboxes = Topic::ALL.into_iter().map(|t| (t, Inbox::new())).collect();

        Ok(MeshTransport {
            this_node: this_node.to_string(),
            ports: bound,
            publishers,
            inboxes,
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            next_link: AtomicU64::new(1),
        })
    }

    pub fn ports(&self) -> MeshPorts {
        self.ports
    }

    pub fn publisher_count(&self) -> usize {
        self.publishers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscriptions)
            .values()
            .map(|entry| entry.subscribers.len())
            .sum()
    }

    pub fn is_subscribed_to(&self, address: &str) -> bool {
        lock(&self.subscriptions).contains_key(address)
    }

    /// Number of peers currently connected to our publisher for `topic`
    pub fn listener_count(&self, topic: Topic) -> usize {
        self.publishers
            .get(&topic)
            .map(MeshPublisher::listener_count)
            .unwrap_or(0)
    }

    fn inbox(&self, topic: Topic) -> Result<&Inbox> {
        self.inboxes
            .get(&topic)
            .ok_or_else(|| LedgerError::Transport(format!("No inbox for {topic}")))
    }

    fn open_subscriber(&self, peer: &str, topic: Topic, link: u64) -> Result<MeshSubscriber> {
        let port = self.ports.get(topic);
        let stream = Self::connect(peer, port)?;
        let reader_stream = stream.try_clone()?;
        let sender = lock(&self.inbox(topic)?.sender).clone();

        let origin = format!("{peer}:{port}");
        let subscriptions = Arc::clone(&self.subscriptions);
        let owner = peer.to_string();
        thread::Builder::new()
            .name(format!("mesh-sub-{topic}-{peer}"))
            .spawn(move || {
                let reader = BufReader::new(reader_stream);
                for message in Deserializer::from_reader(reader).into_iter::<Value>() {
                    match message {
                        Ok(value) => {
                            if sender.send(value).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            if !e.is_eof() {
                                warn!("Bad {topic} message from {origin}: {e}");
                            }
                            break;
                        }
                    }
                }
                debug!("{topic} subscription to {origin} closed");
                forget_peer(&subscriptions, &owner, link);
            })?;

        info!(
            "Node {} subscribed to {peer} ready on port: {port}",
            self.this_node
        );
        Ok(MeshSubscriber {
            peer: peer.to_string(),
            topic,
            stream,
        })
    }

    fn connect(address: &str, port: u16) -> Result<TcpStream> {
        let candidates = (address, port).to_socket_addrs().map_err(|e| {
            LedgerError::Transport(format!("Cannot resolve {address}:{port}: {e}"))
        })?;
        let mut last_error = None;
        for candidate in candidates {
            match TcpStream::connect_timeout(&candidate, Duration::from_millis(TCP_CONNECT_TIMEOUT)) {
                Ok(stream) => return Ok(stream),
                Err(e) => last_error = Some(e),
            }
        }
        Err(LedgerError::Transport(match last_error {
            Some(e) => format!("Failed to connect to {address}:{port}: {e}"),
            None => format!("No address found for {address}"),
        }))
    }
}

impl Transport for MeshTransport {
    type Publisher = MeshPublisher;
    type Subscriber = MeshSubscriber;

    fn name(&self) -> &'static str {
        "mesh"
    }

    /// The publisher bound for `topic`; its port is only ever bound once
    fn set_publisher(&self, topic: Topic) -> Result<MeshPublisher> {
        self.publishers
            .get(&topic)
            .cloned()
            .ok_or_else(|| LedgerError::Transport(format!("No publisher for {topic}")))
    }

    fn set_subscriber(&self, peer: &str, topic: Topic) -> Result<MeshSubscriber> {
        let link = self.next_link.fetch_add(1, Ordering::SeqCst);
        self.open_subscriber(peer, topic, link)
    }

    fn broadcast(&self, topic: Topic, payload: &Value) -> Result<()> {
        let publisher = self
            .publishers
            .get(&topic)
            .ok_or_else(|| LedgerError::Transport(format!("No publisher for {topic}")))?;
        let reached = publisher.send(payload)?;
        debug!("Just broadcast {topic} to {reached} subscribers");
        Ok(())
    }

    fn subscribe_to_node(&self, node: &Node) -> bool {
        let address = node.get_address();
        if address == self.this_node {
            debug!("Not subscribing {} to itself", self.this_node);
            return false;
        }

        let mut subscriptions = lock(&self.subscriptions);
        if subscriptions.contains_key(address) {
            return true;
        }

        let link = self.next_link.fetch_add(1, Ordering::SeqCst);
        let mut opened = Vec::with_capacity(Topic::ALL.len());
        for topic in Topic::ALL {
            match self.open_subscriber(address, topic, link) {
                Ok(subscriber) => opened.push(subscriber),
                Err(e) => {
                    warn!(
                        "Node: {} could not be subscribed to {address}: {e}",
                        self.this_node
                    );
                    opened.iter().for_each(MeshSubscriber::close);
                    return false;
                }
            }
        }
        subscriptions.insert(
            address.to_string(),
            PeerLink {
                link,
                subscribers: opened,
            },
        );
        true
    }

    fn unsubscribe_from_node(&self, node: &Node) -> bool {
        match lock(&self.subscriptions).remove(node.get_address()) {
            Some(entry) => {
                entry.subscribers.iter().for_each(MeshSubscriber::close);
                info!("Unsubscribed from {}", node.get_address());
                true
            }
            None => false,
        }
    }

    fn receive(&self, topic: Topic, wait: Duration) -> Result<Option<Value>> {
        let receiver = lock(&self.inbox(topic)?.receiver);
        match receiver.recv_timeout(wait) {
            Ok(value) => Ok(Some(value)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(LedgerError::Transport(format!(
                "{topic} inbox disconnected"
            ))),
        }
    }

    fn topology(&self) -> Topology {
        Topology {
            on_duplicate_node: DuplicatePolicy::Replace,
            require_node_id: false,
            reciprocal_subscribe: true,
            echoes_own_broadcasts: false,
        }
    }
}

impl Drop for MeshTransport {
    fn drop(&mut self) {
        for (_, entry) in lock(&self.subscriptions).drain() {
            entry.subscribers.iter().for_each(MeshSubscriber::close);
        }
        self.publishers.values().for_each(MeshPublisher::close);
    }
}
