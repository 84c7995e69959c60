//! The publish/subscribe contract both backends implement
//!
//! A backend owns one publisher per message class and whatever subscriptions
//! its topology needs. The gossip protocol only ever sees this trait, plus the
//! [`Topology`] flags where the two backends behave differently.

use crate::error::Result;
use crate::network::Node;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;

/// Message class; also the topic name on the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    Node,
    Chain,
    Transaction,
}

impl Topic {
    pub const ALL: [Topic; 3] = [Topic::Node, Topic::Chain, Topic::Transaction];

    pub fn name(&self) -> &'static str {
        match self {
            Topic::Node => "node",
            Topic::Chain => "chain",
            Topic::Transaction => "transaction",
        }
    }

    pub fn from_name(name: &str) -> Option<Topic> {
        Topic::ALL.into_iter().find(|topic| topic.name() == name)
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// What to do with a node announcement for an address already stored
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicatePolicy {
    Replace,
    Discard,
}

/// Where the backends diverge in the gossip protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    pub on_duplicate_node: DuplicatePolicy,
    /// Announcements without an id are dropped
    pub require_node_id: bool,
    /// A newly learned node is subscribed to right away
    pub reciprocal_subscribe: bool,
    /// The node receives its own broadcasts
    pub echoes_own_broadcasts: bool,
}

pub trait Transport: Send + Sync + 'static {
    type Publisher;
    type Subscriber;

    /// Human readable backend name for logs
    fn name(&self) -> &'static str;

    fn set_publisher(&self, topic: Topic) -> Result<Self::Publisher>;

    /// `peer_or_group` is a peer address on the mesh, a consumer group on the broker
    fn set_subscriber(&self, peer_or_group: &str, topic: Topic) -> Result<Self::Subscriber>;

    /// Publish one message on the topic's publisher
    fn broadcast(&self, topic: Topic, payload: &Value) -> Result<()>;

    /// Establish whatever subscriptions the topology needs to hear `node`.
    /// Returns `false` when the node cannot be reached.
    fn subscribe_to_node(&self, node: &Node) -> bool;

    /// Tear down what [`Transport::subscribe_to_node`] set up for `node`.
    /// Returns `false` when there was nothing to tear down.
    fn unsubscribe_from_node(&self, _node: &Node) -> bool {
        false
    }

    /// Take at most one inbound message, waiting up to `wait`
    fn receive(&self, topic: Topic, wait: Duration) -> Result<Option<Value>>;

    fn topology(&self) -> Topology;
}
