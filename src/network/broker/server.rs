// A small shared-topic log. Topics are append-only, consumer groups own one
// offset per topic. Clients keep a connection open and exchange one JSON line
// per request and per response. A group lives as long as one of its members
// stays connected, plus a retention period.

use crate::error::{LedgerError, Result};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Deserializer, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

/// Longest a single fetch may hold its connection
pub const MAX_FETCH_WAIT: Duration = Duration::from_secs(60);
const MAX_BACKLOG: usize = 10_000;
const GROUP_RETENTION: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BrokerRequest {
    Produce {
        topic: String,
        key: String,
        value: Value,
    },
    /// Join `group` on `topic`; a new group starts at the end of the log,
    /// a known one keeps its offset
    Subscribe { group: String, topic: String },
    Fetch {
        group: String,
        topic: String,
        max_wait_ms: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BrokerResponse {
    Ack { topic: String, offset: u64 },
    Assigned { topic: String, offset: u64 },
    Record(Record),
    Empty,
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub topic: String,
    pub offset: u64,
    pub key: String,
    pub value: Value,
}

// (group, topic)
type Slot = (String, String);

/// The retained tail of one topic; `base` is the offset of its first record
#[derive(Default)]
struct TopicLog {
    base: u64,
    records: VecDeque<Record>,
}

impl TopicLog {
    fn end(&self) -> u64 {
        self.base + self.records.len() as u64
    }

    fn get(&self, offset: u64) -> Option<&Record> {
        let index = offset.checked_sub(self.base)?;
        self.records.get(usize::try_from(index).ok()?)
    }

    fn trim_below(&mut self, offset: u64) -> usize {
        let mut dropped = 0;
        while self.base < offset && self.records.pop_front().is_some() {
            self.base += 1;
            dropped += 1;
        }
        dropped
    }
}

struct Group {
    // next offset to deliver
    offset: u64,
    members: usize,
    idle_since: Option<Instant>,
}

#[derive(Default)]
struct Topics {
    logs: HashMap<String, TopicLog>,
    groups: HashMap<Slot, Group>,
}

impl Topics {
    fn log_end(&self, topic: &str) -> u64 {
        self.logs.get(topic).map_or(0, TopicLog::end)
    }

    // New groups start at the log end, so nothing below the slowest group is
    // ever delivered again
    fn trim(&mut self, topic: &str) {
        let floor = self
            .groups
            .iter()
            .filter(|(slot, _)| slot.1 == topic)
            .map(|(_, group)| group.offset)
            .min();
        if let Some(log) = self.logs.get_mut(topic) {
            let floor = floor.unwrap_or_else(|| log.end());
            let dropped = log.trim_below(floor);
            if dropped > 0 {
                debug!("Trimmed {dropped} records from {topic}");
            }
        }
    }

    fn expire_groups(&mut self, retention: Duration, now: Instant) {
        let expired: Vec<Slot> = self
            .groups
            .iter()
            .filter(|(_, group)| {
                group
                    .idle_since
                    .is_some_and(|since| now.duration_since(since) >= retention)
            })
            .map(|(slot, _)| slot.clone())
            .collect();
        for slot in expired {
            self.groups.remove(&slot);
            info!("Group {} left {}", slot.0, slot.1);
            self.trim(&slot.1);
        }
    }
}

struct Shared {
    topics: Mutex<Topics>,
    appended: Condvar,
    max_backlog: usize,
    group_retention: Duration,
    stopped: AtomicBool,
    listening: Mutex<Vec<SocketAddr>>,
    connections: Mutex<HashMap<SocketAddr, TcpStream>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn new(max_backlog: usize, group_retention: Duration) -> Shared {
        Shared {
            topics: Mutex::new(Topics::default()),
            appended: Condvar::new(),
            max_backlog,
            group_retention,
            stopped: AtomicBool::new(false),
            listening: Mutex::new(vec![]),
            connections: Mutex::new(HashMap::new()),
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn handle(&self, request: BrokerRequest) -> BrokerResponse {
        match request {
            BrokerRequest::Produce { topic, key, value } => self.produce(topic, key, value),
            BrokerRequest::Subscribe { group, topic } => self.subscribe((group, topic), false),
            BrokerRequest::Fetch {
                group,
                topic,
                max_wait_ms,
            } => self.fetch((group, topic), Duration::from_millis(max_wait_ms)),
        }
    }

    fn produce(&self, topic: String, key: String, value: Value) -> BrokerResponse {
        let mut topics = lock(&self.topics);
        topics.expire_groups(self.group_retention, Instant::now());
        let log = topics.logs.entry(topic.clone()).or_default();
        let offset = log.end();
        log.records.push_back(Record {
            topic: topic.clone(),
            offset,
            key,
            value,
        });
        if log.records.len() > self.max_backlog {
            let floor = log.end() - self.max_backlog as u64;
            let dropped = log.trim_below(floor);
            warn!("Backlog of {topic} is full, dropped {dropped} undelivered records");
        }
        topics.trim(&topic);
        drop(topics);
        self.appended.notify_all();
        debug!("Appended record {offset} to {topic}");
        BrokerResponse::Ack { topic, offset }
    }

    fn subscribe(&self, slot: Slot, joining: bool) -> BrokerResponse {
        let mut topics = lock(&self.topics);
        topics.expire_groups(self.group_retention, Instant::now());
        let end = topics.log_end(&slot.1);
        let group = topics.groups.entry(slot.clone()).or_insert(Group {
            offset: end,
            members: 0,
            idle_since: None,
        });
        if joining {
            group.members += 1;
            group.idle_since = None;
        }
        let offset = group.offset;
        topics.trim(&slot.1);
        let (group, topic) = slot;
        info!("Group {group} assigned to {topic} at offset {offset}");
        BrokerResponse::Assigned { topic, offset }
    }

    fn leave(&self, slots: &HashSet<Slot>) {
        let mut topics = lock(&self.topics);
        let now = Instant::now();
        for slot in slots {
            if let Some(group) = topics.groups.get_mut(slot) {
                group.members = group.members.saturating_sub(1);
                if group.members == 0 {
                    group.idle_since = Some(now);
                }
            }
        }
        topics.expire_groups(self.group_retention, now);
    }

    fn fetch(&self, slot: Slot, max_wait: Duration) -> BrokerResponse {
        let deadline = Instant::now() + max_wait.min(MAX_FETCH_WAIT);
        let mut topics = lock(&self.topics);
        loop {
            let offset = match topics.groups.get(&slot) {
                Some(group) => group.offset,
                None => {
                    return BrokerResponse::Error {
                        message: format!("Group {} is not subscribed to {}", slot.0, slot.1),
                    }
                }
            };
            let log = topics.logs.get(&slot.1);
            let next = log.map_or(offset, |log| offset.max(log.base));
            let record = log.and_then(|log| log.get(next)).cloned();
            if let Some(record) = record {
                if next > offset {
                    warn!("Group {} skipped {} trimmed records on {}", slot.0, next - offset, slot.1);
                }
                if let Some(group) = topics.groups.get_mut(&slot) {
                    group.offset = next + 1;
                }
                topics.trim(&slot.1);
                return BrokerResponse::Record(record);
            }

            let now = Instant::now();
            if now >= deadline || self.is_stopped() {
                return BrokerResponse::Empty;
            }
            topics = self
                .appended
                .wait_timeout(topics, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

/// One client of the broker. The groups it subscribed are left when it is
/// dropped.
pub struct BrokerSession {
    shared: Arc<Shared>,
    joined: HashSet<Slot>,
}

impl BrokerSession {
    pub fn handle(&mut self, request: BrokerRequest) -> BrokerResponse {
        match request {
            BrokerRequest::Subscribe { group, topic } => {
                let slot = (group, topic);
                let joining = !self.joined.contains(&slot);
                let response = self.shared.subscribe(slot.clone(), joining);
                self.joined.insert(slot);
                response
            }
            other => self.shared.handle(other),
        }
    }
}

impl Drop for BrokerSession {
    fn drop(&mut self) {
        self.shared.leave(&self.joined);
    }
}

/// The broker process. Cloning shares the same topics.
#[derive(Clone)]
pub struct LogBroker {
    shared: Arc<Shared>,
}

impl Default for LogBroker {
    fn default() -> Self {
        LogBroker::with_limits(MAX_BACKLOG, GROUP_RETENTION)
    }
}

impl LogBroker {
    pub fn new() -> LogBroker {
        LogBroker::default()
    }

    /// `max_backlog` caps the records kept per topic; a group nobody is
    /// connected to is forgotten after `group_retention`
    pub fn with_limits(max_backlog: usize, group_retention: Duration) -> LogBroker {
        LogBroker {
            shared: Arc::new(Shared::new(max_backlog.max(1), group_retention)),
        }
    }

    /// Handle one request in-process, outside any session
    pub fn handle(&self, request: BrokerRequest) -> BrokerResponse {
        self.shared.handle(request)
    }

    pub fn session(&self) -> BrokerSession {
        BrokerSession {
            shared: Arc::clone(&self.shared),
            joined: HashSet::new(),
        }
    }

    /// Records of `topic` still held in memory
    pub fn backlog(&self, topic: &str) -> usize {
        lock(&self.shared.topics)
            .logs
            .get(topic)
            .map_or(0, |log| log.records.len())
    }

    pub fn bind(addr: &str) -> Result<TcpListener> {
        TcpListener::bind(addr)
            .map_err(|e| LedgerError::Transport(format!("Failed to bind broker on {addr}: {e}")))
    }

    /// Accept clients until shut down, one thread per connection
    pub fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        lock(&self.shared.listening).push(local_addr);
        info!("Broker listening on {local_addr}");
        for stream in listener.incoming() {
            if self.shared.is_stopped() {
                break;
            }
            match stream {
                Ok(stream) => {
                    let peer_addr = match stream.peer_addr() {
                        Ok(addr) => addr,
                        Err(e) => {
                            error!("Failed to get peer address: {e}");
                            continue;
                        }
                    };
                    let broker = self.clone();
                    let spawned = thread::Builder::new()
                        .name(format!("broker-{peer_addr}"))
                        .spawn(move || {
                            if let Err(e) = broker.handle_connection(stream, peer_addr) {
                                warn!("Broker connection {peer_addr} ended: {e}");
                            }
                        });
                    if let Err(e) = spawned {
                        error!("Failed to spawn handler for {peer_addr}: {e}");
                    }
                }
                Err(e) => error!("Error accepting broker connection: {e}"),
            }
        }
        info!("Broker on {local_addr} stopped");
        Ok(())
    }

    /// Bind and serve on a background thread; returns the bound address
    pub fn spawn(&self, addr: &str) -> Result<SocketAddr> {
        let listener = Self::bind(addr)?;
        let local_addr = listener.local_addr()?;
        let broker = self.clone();
        thread::Builder::new()
            .name("broker".to_string())
            .spawn(move || {
                if let Err(e) = broker.serve(listener) {
                    error!("Broker stopped: {e}");
                }
            })?;
        Ok(local_addr)
    }

    /// Stop accepting clients and close every open connection. A stopped
    /// broker cannot be served again.
    pub fn shutdown(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        for (_, stream) in lock(&self.shared.connections).drain() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.shared.appended.notify_all();
        // Wake the accept loops so they see the flag
        for addr in lock(&self.shared.listening).drain(..) {
            let _ = TcpStream::connect_timeout(&addr, Duration::from_millis(500));
        }
    }

    fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        lock(&self.shared.connections).insert(peer_addr, stream.try_clone()?);
        let result = self.converse(stream, peer_addr);
        lock(&self.shared.connections).remove(&peer_addr);
        result
    }

    fn converse(&self, stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        if self.shared.is_stopped() {
            return Ok(());
        }
        let mut session = self.session();
        let mut writer = stream.try_clone()?;
        let reader = BufReader::new(stream);
        for request in Deserializer::from_reader(reader).into_iter::<BrokerRequest>() {
            let response = match request {
                Ok(request) => session.handle(request),
                Err(e) if e.is_eof() => break,
                Err(e) => BrokerResponse::Error {
                    message: format!("Malformed request: {e}"),
                },
            };
            let mut line = serde_json::to_vec(&response)?;
            line.push(b'\n');
            writer.write_all(&line)?;
            if matches!(response, BrokerResponse::Error { .. }) {
                warn!("Broker error for {peer_addr}: {response:?}");
            }
        }
        debug!("Broker client {peer_addr} disconnected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn produce(broker: &LogBroker, topic: &str, value: Value) -> BrokerResponse {
        broker.handle(BrokerRequest::Produce {
            topic: topic.to_string(),
            key: "key1".to_string(),
            value,
        })
    }

    fn subscribe(broker: &LogBroker, group: &str, topic: &str) -> BrokerResponse {
        broker.handle(BrokerRequest::Subscribe {
            group: group.to_string(),
            topic: topic.to_string(),
        })
    }

    fn fetch(broker: &LogBroker, group: &str, topic: &str) -> BrokerResponse {
        broker.handle(BrokerRequest::Fetch {
            group: group.to_string(),
            topic: topic.to_string(),
            max_wait_ms: 10,
        })
    }

    fn value_of(response: BrokerResponse) -> Value {
        match response {
            BrokerResponse::Record(record) => record.value,
            other => panic!("expected a record, got {other:?}"),
        }
    }

    #[test]
    fn test_new_group_starts_at_log_end() {
        let broker = LogBroker::new();
        produce(&broker, "node", json!("before"));
        assert_eq!(
            subscribe(&broker, "g1", "node"),
            BrokerResponse::Assigned {
                topic: "node".to_string(),
                offset: 1
            }
        );
        assert_eq!(fetch(&broker, "g1", "node"), BrokerResponse::Empty);

        produce(&broker, "node", json!("after"));
        assert_eq!(value_of(fetch(&broker, "g1", "node")), json!("after"));
        assert_eq!(fetch(&broker, "g1", "node"), BrokerResponse::Empty);
    }

    #[test]
    fn test_groups_fan_out_and_members_share() {
        let broker = LogBroker::new();
        subscribe(&broker, "a", "chain");
        subscribe(&broker, "b", "chain");
        produce(&broker, "chain", json!(1));
        produce(&broker, "chain", json!(2));

        // Distinct groups each see everything
        assert_eq!(value_of(fetch(&broker, "a", "chain")), json!(1));
        assert_eq!(value_of(fetch(&broker, "b", "chain")), json!(1));
        // A second member of group a continues where the first left off
        assert_eq!(value_of(fetch(&broker, "a", "chain")), json!(2));
        assert_eq!(fetch(&broker, "a", "chain"), BrokerResponse::Empty);
    }

    #[test]
    fn test_fetch_requires_subscription() {
        let broker = LogBroker::new();
        assert!(matches!(
            fetch(&broker, "ghost", "node"),
            BrokerResponse::Error { .. }
        ));
    }

    #[test]
    fn test_log_is_trimmed_below_slowest_group() {
        let broker = LogBroker::new();
        produce(&broker, "chain", json!(0));
        subscribe(&broker, "fast", "chain");
        subscribe(&broker, "slow", "chain");
        // Nothing before the first subscription can be delivered
        assert_eq!(broker.backlog("chain"), 0);

        for value in 1..=3 {
            produce(&broker, "chain", json!(value));
        }
        for value in 1..=3 {
            assert_eq!(value_of(fetch(&broker, "fast", "chain")), json!(value));
        }
        assert_eq!(broker.backlog("chain"), 3);

        assert_eq!(value_of(fetch(&broker, "slow", "chain")), json!(1));
        assert_eq!(broker.backlog("chain"), 2);
        assert_eq!(value_of(fetch(&broker, "slow", "chain")), json!(2));
        assert_eq!(value_of(fetch(&broker, "slow", "chain")), json!(3));
        assert_eq!(broker.backlog("chain"), 0);

        // Offsets keep counting across trims
        assert_eq!(
            produce(&broker, "chain", json!(4)),
            BrokerResponse::Ack {
                topic: "chain".to_string(),
                offset: 4
            }
        );
        assert_eq!(value_of(fetch(&broker, "slow", "chain")), json!(4));
    }

    #[test]
    fn test_backlog_is_capped_for_a_stalled_group() {
        let broker = LogBroker::with_limits(3, GROUP_RETENTION);
        subscribe(&broker, "stalled", "node");
        for value in 0..5 {
            produce(&broker, "node", json!(value));
        }
        assert_eq!(broker.backlog("node"), 3);
        assert_eq!(value_of(fetch(&broker, "stalled", "node")), json!(2));
        assert_eq!(value_of(fetch(&broker, "stalled", "node")), json!(3));
    }

    #[test]
    fn test_groups_are_dropped_after_their_members_leave() {
        let broker = LogBroker::with_limits(MAX_BACKLOG, Duration::ZERO);
        let mut session = broker.session();
        session.handle(BrokerRequest::Subscribe {
            group: "g".to_string(),
            topic: "node".to_string(),
        });
        produce(&broker, "node", json!(1));
        produce(&broker, "node", json!(2));
        assert_eq!(broker.backlog("node"), 2);

        drop(session);
        assert_eq!(broker.backlog("node"), 0);
        assert!(matches!(
            fetch(&broker, "g", "node"),
            BrokerResponse::Error { .. }
        ));
    }

    #[test]
    fn test_rejoining_group_keeps_its_offset() {
        let broker = LogBroker::new();
        let mut first = broker.session();
        first.handle(BrokerRequest::Subscribe {
            group: "g".to_string(),
            topic: "node".to_string(),
        });
        produce(&broker, "node", json!("missed"));
        drop(first);

        let mut second = broker.session();
        assert_eq!(
            second.handle(BrokerRequest::Subscribe {
                group: "g".to_string(),
                topic: "node".to_string(),
            }),
            BrokerResponse::Assigned {
                topic: "node".to_string(),
                offset: 0
            }
        );
        assert_eq!(value_of(fetch(&broker, "g", "node")), json!("missed"));
    }

    #[test]
    fn test_unbounded_wait_is_clamped() {
        let broker = LogBroker::new();
        subscribe(&broker, "g", "node");
        produce(&broker, "node", json!("ready"));
        let response = broker.handle(BrokerRequest::Fetch {
            group: "g".to_string(),
            topic: "node".to_string(),
            max_wait_ms: u64::MAX,
        });
        assert_eq!(value_of(response), json!("ready"));
    }

    #[test]
    fn test_fetch_waits_for_a_record() {
        let broker = LogBroker::new();
        subscribe(&broker, "g", "transaction");
        let producer = broker.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            produce(&producer, "transaction", json!({"id": "None"}));
        });
        let response = broker.handle(BrokerRequest::Fetch {
            group: "g".to_string(),
            topic: "transaction".to_string(),
            max_wait_ms: 5000,
        });
        handle.join().unwrap();
        assert_eq!(value_of(response), json!({"id": "None"}));
    }
}
