use crate::error::Result;
use crate::storage::Store;
use crate::utils::serialization::lenient_id;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};

/// A peer known to this node. Identity is the address; the id is local and
/// advisory only.
///
/// This is also the node announcement put on the wire: `{"id", "address"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Node {
    #[serde(default, with = "lenient_id")]
    id: Option<u64>,
    address: String,
}

impl Node {
    pub fn new(address: impl Into<String>) -> Node {
        Node {
            id: None,
            address: address.into(),
        }
    }

    pub fn with_id(&self, id: u64) -> Node {
        Node {
            id: Some(id),
            address: self.address.clone(),
        }
    }

    pub fn get_id(&self) -> Option<u64> {
        self.id
    }

    pub fn get_address(&self) -> &str {
        self.address.as_str()
    }
}

/// Outcome of [`NodeRegistry::add_node`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Added(Node),
    /// The address is already stored; nothing changed
    AlreadyKnown,
}

impl Registration {
    pub fn is_added(&self) -> bool {
        matches!(self, Registration::Added(_))
    }
}

/// The local peer table. All writes go through one lock so concurrent
/// registrations cannot both pass the duplicate-address check.
#[derive(Clone)]
pub struct NodeRegistry {
    store: Store,
    this_node: String,
    write_lock: Arc<Mutex<()>>,
}

impl NodeRegistry {
    pub fn new(store: Store, this_node: impl Into<String>) -> NodeRegistry {
        NodeRegistry {
            store,
            this_node: this_node.into(),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn this_node(&self) -> &str {
        self.this_node.as_str()
    }

    pub fn is_this_node(&self, address: &str) -> bool {
        self.this_node == address
    }

    /// Register a node unless its address is already stored.
    ///
    /// This node's own address is accepted too: a first run needs a local
    /// identity record. A proposed id that collides is replaced.
    pub fn add_node(&self, node: &Node) -> Result<Registration> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);

        if self.store.node_by_address(node.get_address())?.is_some() {
            info!(
                "Node: {:?}, {} already exists in {}",
                node.get_id(),
                node.get_address(),
                self.this_node
            );
            return Ok(Registration::AlreadyKnown);
        }

        let stored = self.store.insert_node(node)?;
        if self.is_this_node(stored.get_address()) {
            info!("THIS node {:?}, {} added to its own registry", stored.get_id(), stored.get_address());
        } else {
            info!(
                "Node {:?}, {} has been added in {}",
                stored.get_id(),
                stored.get_address(),
                self.this_node
            );
        }
        Ok(Registration::Added(stored))
    }

    /// Drop any stored record for the address and store `node` in its place
    pub fn replace_node(&self, node: &Node) -> Result<Node> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.store.remove_nodes_by_address(node.get_address())? {
            info!("Replacing stored record for {}", node.get_address());
        }
        self.store.insert_node(node)
    }

    /// Delete the node with this address; only the bootstrap unwind needs it
    pub fn remove_node(&self, node: &Node) -> Result<bool> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let removed = self.store.remove_nodes_by_address(node.get_address())?;
        if removed {
            info!("Node {} has been removed from {}", node.get_address(), self.this_node);
        } else {
            warn!("Node {} was not registered in {}", node.get_address(), self.this_node);
        }
        Ok(removed)
    }

    pub fn nodes(&self) -> Result<Vec<Node>> {
        self.store.nodes()
    }

    pub fn is_known(&self, address: &str) -> Result<bool> {
        Ok(self.store.node_by_address(address)?.is_some())
    }
}
