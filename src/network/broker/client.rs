use crate::error::{LedgerError, Result};
use crate::network::broker::server::{BrokerRequest, BrokerResponse, MAX_FETCH_WAIT};
use crate::network::transport::{DuplicatePolicy, Topic, Topology, Transport};
use crate::network::Node;
use log::{debug, error, info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::mpsc::{self, Sender};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;
use uuid::Uuid;

const TCP_CONNECT_TIMEOUT: u64 = 3000;
// Added on top of a fetch's own wait before a read is considered stuck
const READ_GRACE: u64 = 5000;
const RECORD_KEY: &str = "key1";

/// One request/response connection to the broker
pub struct BrokerConnection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl BrokerConnection {
    pub fn connect(address: &str) -> Result<BrokerConnection> {
        let mut last_error = None;
        let candidates = address.to_socket_addrs().map_err(|e| {
            LedgerError::Transport(format!("Cannot resolve broker {address}: {e}"))
        })?;
        for candidate in candidates {
            match TcpStream::connect_timeout(&candidate, Duration::from_millis(TCP_CONNECT_TIMEOUT)) {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    let writer = stream.try_clone()?;
                    return Ok(BrokerConnection {
                        reader: BufReader::new(stream),
                        writer,
                    });
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(LedgerError::Transport(match last_error {
            Some(e) => format!("Broker {address} unavailable: {e}"),
            None => format!("No address found for broker {address}"),
        }))
    }

    pub fn call(&mut self, request: &BrokerRequest, wait: Duration) -> Result<BrokerResponse> {
        let mut line = serde_json::to_vec(request)?;
        line.push(b'\n');
        self.writer.write_all(&line)?;

        let timeout = wait.min(MAX_FETCH_WAIT) + Duration::from_millis(READ_GRACE);
        self.reader.get_ref().set_read_timeout(Some(timeout))?;
        let mut response = String::new();
        if self.reader.read_line(&mut response)? == 0 {
            return Err(LedgerError::Transport("Broker closed the connection".to_string()));
        }
        Ok(serde_json::from_str(&response)?)
    }
}

enum ProducerCommand {
    Produce { topic: Topic, value: Value },
    Flush(Sender<()>),
}

/// Handle on the background producer. Sends return at once; the broker's
/// acknowledgement is logged when it arrives.
#[derive(Clone)]
pub struct BrokerProducer {
    commands: Sender<ProducerCommand>,
}

// A failed call leaves the connection out of step with the broker, so it is
// replaced and the request tried once more on the fresh one
fn produce(
    connection: &mut Option<BrokerConnection>,
    address: &str,
    request: &BrokerRequest,
) -> Result<BrokerResponse> {
    if let Some(live) = connection.as_mut() {
        match live.call(request, Duration::ZERO) {
            Ok(response) => return Ok(response),
            Err(e) => {
                warn!("Producer connection to {address} failed: {e}");
                *connection = None;
            }
        }
    }
    let mut fresh = BrokerConnection::connect(address)?;
    let response = fresh.call(request, Duration::ZERO)?;
    *connection = Some(fresh);
    Ok(response)
}

impl BrokerProducer {
    fn start(broker_address: &str) -> Result<BrokerProducer> {
        let mut connection = Some(BrokerConnection::connect(broker_address)?);
        let (commands, inbox) = mpsc::channel::<ProducerCommand>();
        let address = broker_address.to_string();

        thread::Builder::new()
            .name("broker-producer".to_string())
            .spawn(move || {
                for command in inbox {
                    match command {
                        ProducerCommand::Produce { topic, value } => {
                            let request = BrokerRequest::Produce {
                                topic: topic.name().to_string(),
                                key: RECORD_KEY.to_string(),
                                value,
                            };
                            match produce(&mut connection, &address, &request) {
                                Ok(BrokerResponse::Ack { topic, offset }) => {
                                    debug!("Message produced: {topic}@{offset}")
                                }
                                Ok(other) => error!("Failed to deliver message to {topic}: {other:?}"),
                                Err(e) => error!("Failed to deliver message to {topic}: {e}"),
                            }
                        }
                        ProducerCommand::Flush(done) => {
                            let _ = done.send(());
                        }
                    }
                }
            })?;

        Ok(BrokerProducer { commands })
    }

    pub fn send(&self, topic: Topic, value: Value) -> Result<()> {
        self.commands
            .send(ProducerCommand::Produce { topic, value })
            .map_err(|_| LedgerError::Transport("Producer thread has stopped".to_string()))
    }

    /// Block until everything sent so far has been delivered or failed
    pub fn flush(&self) -> Result<()> {
        let (done, wait) = mpsc::channel();
        self.commands
            .send(ProducerCommand::Flush(done))
            .map_err(|_| LedgerError::Transport("Producer thread has stopped".to_string()))?;
        wait.recv()
            .map_err(|_| LedgerError::Transport("Producer thread has stopped".to_string()))
    }
}

/// A group member consuming one topic. A broken connection is replaced by a
/// new one in the same group, which resumes at the group's offset if the
/// broker still knows it.
pub struct BrokerConsumer {
    broker_address: String,
    group: String,
    topic: Topic,
    connection: Mutex<Option<BrokerConnection>>,
}

fn join_group(broker_address: &str, group: &str, topic: Topic) -> Result<BrokerConnection> {
    let mut connection = BrokerConnection::connect(broker_address)?;
    let request = BrokerRequest::Subscribe {
        group: group.to_string(),
        topic: topic.name().to_string(),
    };
    match connection.call(&request, Duration::ZERO)? {
        BrokerResponse::Assigned { topic, offset } => {
            info!("Assigned to {topic} at offset {offset}");
            Ok(connection)
        }
        other => Err(LedgerError::Transport(format!(
            "Unexpected subscribe response: {other:?}"
        ))),
    }
}

impl BrokerConsumer {
    fn subscribe(broker_address: &str, group: &str, topic: Topic) -> Result<BrokerConsumer> {
        let connection = join_group(broker_address, group, topic)?;
        Ok(BrokerConsumer {
            broker_address: broker_address.to_string(),
            group: group.to_string(),
            topic,
            connection: Mutex::new(Some(connection)),
        })
    }

    pub fn poll(&self, wait: Duration) -> Result<Option<Value>> {
        let request = BrokerRequest::Fetch {
            group: self.group.clone(),
            topic: self.topic.name().to_string(),
            max_wait_ms: u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
        };
        let mut connection = self
            .connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let response = match connection.as_mut().map(|live| live.call(&request, wait)) {
            Some(Ok(response)) => response,
            failed => {
                if let Some(Err(e)) = failed {
                    warn!("Lost broker connection for {}: {e}", self.topic);
                }
                *connection = None;
                let mut fresh = join_group(&self.broker_address, &self.group, self.topic)?;
                let response = fresh.call(&request, wait)?;
                *connection = Some(fresh);
                response
            }
        };
        match response {
            BrokerResponse::Record(record) => {
                debug!("Received {} record {}", record.topic, record.offset);
                Ok(Some(record.value))
            }
            BrokerResponse::Empty => Ok(None),
            BrokerResponse::Error { message } => Err(LedgerError::Transport(message)),
            other => Err(LedgerError::Transport(format!(
                "Unexpected fetch response: {other:?}"
            ))),
        }
    }
}

/// Shared topics through a [`LogBroker`](super::LogBroker). One producer for
/// all topics and one consumer per topic in a random group of our own, so
/// every instance sees every message, including its own.
pub struct BrokerTransport {
    broker_address: String,
    group: String,
    producer: BrokerProducer,
    consumers: HashMap<Topic, BrokerConsumer>,
}

impl BrokerTransport {
    pub fn connect(broker_address: &str) -> Result<BrokerTransport> {
        let group = Uuid::new_v4().simple().to_string();
        let producer = BrokerProducer::start(broker_address)?;
        let mut consumers = HashMap::new();
        for topic in Topic::ALL {
            consumers.insert(topic, BrokerConsumer::subscribe(broker_address, &group, topic)?);
        }
        info!("Joined broker {broker_address} as group {group}");
        Ok(BrokerTransport {
            broker_address: broker_address.to_string(),
            group,
            producer,
            consumers,
        })
    }

    pub fn group(&self) -> &str {
        self.group.as_str()
    }

    pub fn flush(&self) -> Result<()> {
        self.producer.flush()
    }
}

impl Transport for BrokerTransport {
    type Publisher = BrokerProducer;
    type Subscriber = BrokerConsumer;

    fn name(&self) -> &'static str {
        "broker"
    }

    fn set_publisher(&self, _topic: Topic) -> Result<BrokerProducer> {
        Ok(self.producer.clone())
    }

    fn set_subscriber(&self, group: &str, topic: Topic) -> Result<BrokerConsumer> {
        BrokerConsumer::subscribe(&self.broker_address, group, topic)
    }

    fn broadcast(&self, topic: Topic, payload: &Value) -> Result<()> {
        debug!("Broadcasting to {topic}");
        self.producer.send(topic, payload.clone())
    }

    /// Everyone already shares the topics
    fn subscribe_to_node(&self, _node: &Node) -> bool {
        true
    }

    fn receive(&self, topic: Topic, wait: Duration) -> Result<Option<Value>> {
        let consumer = self
            .consumers
            .get(&topic)
            .ok_or_else(|| LedgerError::Transport(format!("No consumer for {topic}")))?;
        consumer.poll(wait)
    }

    fn topology(&self) -> Topology {
        Topology {
            on_duplicate_node: DuplicatePolicy::Discard,
            require_node_id: true,
            reciprocal_subscribe: false,
            echoes_own_broadcasts: true,
        }
    }
}
