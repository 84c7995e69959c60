// Reception protocols for the three message classes, shared by both backends.
// Listener threads call the receive_* methods in a loop; a bad message is
// reported in the outcome and never stops the loop.

use crate::core::{Block, Blockchain, ChainDecision, Ingested, Transaction};
use crate::error::Result;
use crate::network::node::{Node, NodeRegistry, Registration};
use crate::network::transport::{DuplicatePolicy, Topic, Transport};
use crate::utils::KeyPair;
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Bounded wait of one receive cycle
pub const RECEIVE_WAIT: Duration = Duration::from_millis(1000);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeReception {
    Idle,
    Added(Node),
    Replaced(Node),
    Discarded(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransactionReception {
    Idle,
    Buffered { id: Option<u64>, pending: usize },
    Mined(Block),
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainReception {
    Idle,
    Replaced { length: usize, removed: usize },
    Kept,
    Rejected(String),
}

pub struct Gossip<T: Transport> {
    blockchain: Blockchain,
    registry: NodeRegistry,
    transport: Arc<T>,
}

impl<T: Transport> Clone for Gossip<T> {
    fn clone(&self) -> Self {
        Gossip {
            blockchain: self.blockchain.clone(),
            registry: self.registry.clone(),
            transport: Arc::clone(&self.transport),
        }
    }
}

// Some producers send the payload itself as a JSON encoded string
fn decode<M: DeserializeOwned>(value: Value) -> std::result::Result<M, String> {
    let value = match value {
        Value::String(text) => serde_json::from_str(&text).map_err(|e| e.to_string())?,
        other => other,
    };
    serde_json::from_value(value).map_err(|e| e.to_string())
}

impl<T: Transport> Gossip<T> {
    pub fn new(blockchain: Blockchain, registry: NodeRegistry, transport: Arc<T>) -> Gossip<T> {
        Gossip {
            blockchain,
            registry,
            transport,
        }
    }

    pub fn blockchain(&self) -> &Blockchain {
        &self.blockchain
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn receive_node(&self) -> Result<NodeReception> {
        self.receive_node_within(RECEIVE_WAIT)
    }

    pub fn receive_node_within(&self, wait: Duration) -> Result<NodeReception> {
        match self.transport.receive(Topic::Node, wait)? {
            Some(message) => self.handle_node(message),
            None => Ok(NodeReception::Idle),
        }
    }

    /// Apply one node announcement to the registry
    pub fn handle_node(&self, message: Value) -> Result<NodeReception> {
        let node: Node = match decode(message) {
            Ok(node) => node,
            Err(e) => return Ok(self.discard_node(format!("malformed announcement: {e}"))),
        };
        info!(
            "{:?}, {} arrived to {}",
            node.get_id(),
            node.get_address(),
            self.registry.this_node()
        );
        let topology = self.transport.topology();

        if node.get_address().is_empty() {
            return Ok(self.discard_node("announcement without an address".to_string()));
        }
        if topology.require_node_id && node.get_id().is_none() {
            return Ok(self.discard_node(format!(
                "{} did not receive an ID from {}",
                self.registry.this_node(),
                node.get_address()
            )));
        }

        if self.registry.is_known(node.get_address())? {
            return match topology.on_duplicate_node {
                DuplicatePolicy::Replace => {
                    let stored = self.registry.replace_node(&node)?;
                    Ok(NodeReception::Replaced(stored))
                }
                DuplicatePolicy::Discard => Ok(self.discard_node(format!(
                    "there is at least one node with the same address: {}",
                    node.get_address()
                ))),
            };
        }

        let stored = match self.registry.add_node(&node)? {
            Registration::Added(stored) => stored,
            Registration::AlreadyKnown => {
                return Ok(self.discard_node(format!("{} registered meanwhile", node.get_address())))
            }
        };
        if topology.reciprocal_subscribe
            && !self.registry.is_this_node(stored.get_address())
            && self.transport.subscribe_to_node(&stored)
        {
            info!(
                "{} subscribed to {}",
                self.registry.this_node(),
                stored.get_address()
            );
        }
        Ok(NodeReception::Added(stored))
    }

    fn discard_node(&self, reason: String) -> NodeReception {
        warn!("Node announcement discarded: {reason}");
        NodeReception::Discarded(reason)
    }

    pub fn receive_transaction(&self) -> Result<TransactionReception> {
        self.receive_transaction_within(RECEIVE_WAIT)
    }

    pub fn receive_transaction_within(&self, wait: Duration) -> Result<TransactionReception> {
        match self.transport.receive(Topic::Transaction, wait)? {
            Some(message) => self.handle_transaction(message),
            None => Ok(TransactionReception::Idle),
        }
    }

    /// Verify a transaction announcement and buffer it, mining if the
    /// threshold is reached. The sender's `valid` claim is ignored.
    pub fn handle_transaction(&self, message: Value) -> Result<TransactionReception> {
        let mut transaction: Transaction = match decode(message) {
            Ok(transaction) => transaction,
            Err(e) => {
                return Ok(self.reject_transaction(format!("malformed transaction: {e}")));
            }
        };
        if !transaction.revalidate() {
            return Ok(self.reject_transaction(format!(
                "Transaction: {:?} is not valid",
                transaction.get_id()
            )));
        }
        self.ingest(&transaction)
    }

    fn ingest(&self, transaction: &Transaction) -> Result<TransactionReception> {
        match self.blockchain.ingest_transaction(transaction)? {
            Ingested::Buffered {
                transaction,
                pending,
            } => Ok(TransactionReception::Buffered {
                id: transaction.get_id(),
                pending,
            }),
            Ingested::Mined(block) => {
                self.broadcast_chain()?;
                Ok(TransactionReception::Mined(block))
            }
        }
    }

    fn reject_transaction(&self, reason: String) -> TransactionReception {
        warn!("{reason}");
        TransactionReception::Rejected(reason)
    }

    pub fn receive_chain(&self) -> Result<ChainReception> {
        self.receive_chain_within(RECEIVE_WAIT)
    }

    pub fn receive_chain_within(&self, wait: Duration) -> Result<ChainReception> {
        match self.transport.receive(Topic::Chain, wait)? {
            Some(message) => self.handle_chain(message),
            None => Ok(ChainReception::Idle),
        }
    }

    /// Run the replacement rule on a received chain; an adopted chain is
    /// relayed exactly once
    pub fn handle_chain(&self, message: Value) -> Result<ChainReception> {
        let blocks: Vec<Block> = match decode(message) {
            Ok(blocks) => blocks,
            Err(e) => {
                warn!("Received chain could not be decoded: {e}");
                return Ok(ChainReception::Rejected(format!("malformed chain: {e}")));
            }
        };

        match self.blockchain.replace_chain(&blocks)? {
            ChainDecision::Replaced { removed, .. } => {
                self.transport
                    .broadcast(Topic::Chain, &serde_json::to_value(&blocks)?)?;
                info!("Chain updated and broadcast");
                Ok(ChainReception::Replaced {
                    length: blocks.len(),
                    removed,
                })
            }
            ChainDecision::Kept { local, candidate } => {
                debug!("Kept local chain of {local} blocks over received {candidate}");
                Ok(ChainReception::Kept)
            }
            ChainDecision::Rejected(reason) => {
                warn!("Received chain rejected: {reason}");
                Ok(ChainReception::Rejected(reason))
            }
        }
    }

    pub fn broadcast_chain(&self) -> Result<()> {
        let chain = self.blockchain.export_chain()?;
        self.transport
            .broadcast(Topic::Chain, &serde_json::to_value(&chain)?)
    }

    pub fn announce_node(&self, node: &Node) -> Result<()> {
        self.transport
            .broadcast(Topic::Node, &serde_json::to_value(node)?)
    }

    /// Sign `data` with the node key and gossip it. A backend that does not
    /// hand us our own broadcasts gets the transaction ingested locally.
    pub fn submit_transaction(&self, key_pair: &KeyPair, data: Value) -> Result<Transaction> {
        let transaction = Transaction::new_signed(key_pair, data)?;
        self.transport
            .broadcast(Topic::Transaction, &serde_json::to_value(&transaction)?)?;

        if !self.transport.topology().echoes_own_broadcasts {
            match self.ingest(&transaction)? {
                TransactionReception::Mined(block) => {
                    info!("Local submission mined block {}", block.get_id())
                }
                outcome => debug!("Local submission: {outcome:?}"),
            }
        }
        Ok(transaction)
    }

    /// Start one listener thread per message class
    pub fn spawn_listeners(&self) -> Result<Listeners> {
        let stop = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::with_capacity(Topic::ALL.len());
        for topic in Topic::ALL {
            let gossip = self.clone();
            let stop = Arc::clone(&stop);
            let handle = thread::Builder::new()
                .name(format!("{topic}-listener"))
                .spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        if let Err(e) = gossip.receive_once(topic) {
                            error!("Problem receiving {topic}: {e}");
                            // Back off so a dead transport does not spin
                            thread::sleep(RECEIVE_WAIT);
                        }
                    }
                })?;
            threads.push(handle);
        }
        Ok(Listeners { stop, threads })
    }

    fn receive_once(&self, topic: Topic) -> Result<()> {
        match topic {
            Topic::Node => self.receive_node().map(drop),
            Topic::Chain => self.receive_chain().map(drop),
            Topic::Transaction => self.receive_transaction().map(drop),
        }
    }
}

/// Running listener threads
pub struct Listeners {
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl Listeners {
    /// Block for as long as the listeners run
    pub fn join(self) {
        for handle in self.threads {
            let _ = handle.join();
        }
    }

    /// Ask every listener to finish its current cycle and wait for it
    pub fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        self.join();
    }
}
