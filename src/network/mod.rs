//! Node-to-node communication
//!
//! Gossip runs over a [`Transport`] with two backends: a mesh of direct
//! publisher/subscriber links and a shared-topic broker. Point-to-point calls
//! (joining, listing nodes, fetching the genesis block) go through the
//! control API in `server`.

pub mod bootstrap;
pub mod broker;
pub mod gossip;
pub mod mesh;
pub mod node;
pub mod server;
pub mod transport;

pub use bootstrap::{bootstrap, BootstrapOutcome, PeerClient};
pub use broker::{BrokerTransport, LogBroker};
pub use gossip::{ChainReception, Gossip, Listeners, NodeReception, TransactionReception};
pub use mesh::{MeshPorts, MeshTransport};
pub use node::{Node, NodeRegistry, Registration};
pub use server::{ControlClient, ControlRequest, ControlResponse, ControlServer};
pub use transport::{DuplicatePolicy, Topic, Topology, Transport};
