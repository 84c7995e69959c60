// Join sequence run once at startup, before the listeners start

use crate::core::Block;
use crate::error::{LedgerError, Result};
use crate::network::gossip::Gossip;
use crate::network::node::{Node, Registration};
use crate::network::transport::Transport;
use log::{info, warn};

/// The point-to-point calls a joining node makes to its peers
pub trait PeerClient {
    /// Tell `peer` that `new_node` exists
    fn join(&self, peer: &Node, new_node: &Node) -> Result<()>;
    fn nodes(&self, peer: &Node) -> Result<Vec<Node>>;
    fn block(&self, peer: &Node, id: u64) -> Result<Option<Block>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// This is the designated first node
    Seeded { genesis_created: bool },
    Joined {
        peers_added: usize,
        genesis_adopted: bool,
    },
}

pub fn bootstrap<T: Transport, P: PeerClient>(
    gossip: &Gossip<T>,
    peers: &P,
) -> Result<BootstrapOutcome> {
    let registry = gossip.registry();
    let blockchain = gossip.blockchain();
    let transport = gossip.transport();
    let settings = blockchain.get_settings();

    let this_node = Node::new(settings.this_node.as_str());
    let self_registered = registry.add_node(&this_node)?.is_added();
    transport.subscribe_to_node(&this_node);

    if settings.is_first_node() {
        let genesis_created = blockchain.create_genesis_block()?;
        if genesis_created {
            info!("Genesis block created");
        } else {
            info!("Genesis block already exists");
        }
        return Ok(BootstrapOutcome::Seeded { genesis_created });
    }

    let first_node = Node::new(settings.first_node.as_str());
    let first_registered = registry.add_node(&first_node)?.is_added();
    let mut registered = Vec::with_capacity(2);
    if first_registered {
        registered.push(&first_node);
    }
    if self_registered {
        registered.push(&this_node);
    }

    if !transport.subscribe_to_node(&first_node) {
        forget(gossip, &registered)?;
        return Err(LedgerError::Bootstrap(format!(
            "Could not subscribe to first node {}, find another alternative as first node",
            first_node.get_address()
        )));
    }

    if let Err(e) = peers.join(&first_node, &this_node) {
        forget(gossip, &registered)?;
        return Err(LedgerError::Bootstrap(format!(
            "Could not post to first node {}: {e}",
            first_node.get_address()
        )));
    }

    let available = match peers.nodes(&first_node) {
        Ok(nodes) => nodes,
        Err(e) => {
            warn!(
                "Could not get nodes from {}: {e}",
                first_node.get_address()
            );
            vec![]
        }
    };

    let mut peers_added = 0;
    for node in &available {
        if registry.is_this_node(node.get_address()) || registry.is_known(node.get_address())? {
            continue;
        }
        if !transport.subscribe_to_node(node) {
            warn!("Skipping unreachable peer {}", node.get_address());
            continue;
        }
        if let Registration::Added(_) = registry.add_node(node)? {
            peers_added += 1;
        }
    }

    let mut genesis_adopted = false;
    if blockchain.block_count() == 0 {
        let mut sources: Vec<&Node> = available
            .iter()
            .filter(|node| !registry.is_this_node(node.get_address()))
            .collect();
        if !sources.iter().any(|n| n.get_address() == first_node.get_address()) {
            sources.push(&first_node);
        }
        for source in sources {
            match peers.block(source, 1) {
                Ok(Some(block)) => match blockchain.adopt_genesis(block) {
                    Ok(adopted) => {
                        genesis_adopted = adopted;
                        break;
                    }
                    Err(e) => warn!("Genesis block from {} rejected: {e}", source.get_address()),
                },
                Ok(None) => info!("{} has no genesis block yet", source.get_address()),
                Err(e) => warn!("Could not get genesis block from {}: {e}", source.get_address()),
            }
        }
        if !genesis_adopted {
            warn!("No peer provided a genesis block; waiting for a chain broadcast");
        }
    }

    info!(
        "Joined through {} with {peers_added} new peers",
        first_node.get_address()
    );
    Ok(BootstrapOutcome::Joined {
        peers_added,
        genesis_adopted,
    })
}

// Undo the registrations and subscriptions of a join that failed
fn forget<T: Transport>(gossip: &Gossip<T>, registered: &[&Node]) -> Result<()> {
    for node in registered {
        gossip.transport().unsubscribe_from_node(node);
        gossip.registry().remove_node(node)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Blockchain, ChainSettings};
    use crate::network::mesh::{MeshPorts, MeshTransport};
    use crate::network::NodeRegistry;
    use crate::storage::Store;
    use crate::testnet::test_utils::{test_settings, THIS_NODE};
    use std::cell::RefCell;
    use std::sync::Arc;

    const ANY_PORTS: MeshPorts = MeshPorts {
        nodes: 0,
        chain: 0,
        transaction: 0,
    };

    /// Scripted peer answers; records every join
    struct ScriptedPeers {
        join_ok: bool,
        nodes: Vec<Node>,
        genesis: Option<Block>,
        joins: RefCell<Vec<String>>,
    }

    impl PeerClient for ScriptedPeers {
        fn join(&self, peer: &Node, new_node: &Node) -> Result<()> {
            self.joins
                .borrow_mut()
                .push(format!("{}<-{}", peer.get_address(), new_node.get_address()));
            if self.join_ok {
                Ok(())
            } else {
                Err(LedgerError::Network("connection refused".to_string()))
            }
        }

        fn nodes(&self, _peer: &Node) -> Result<Vec<Node>> {
            Ok(self.nodes.clone())
        }

        fn block(&self, _peer: &Node, id: u64) -> Result<Option<Block>> {
            Ok(self.genesis.clone().filter(|block| block.get_id() == id))
        }
    }

    fn gossip_for(settings: ChainSettings) -> Gossip<MeshTransport> {
        let store = Store::temporary().unwrap();
        let registry = NodeRegistry::new(store.clone(), settings.this_node.as_str());
        let transport =
            MeshTransport::bind(&settings.this_node, "127.0.0.1", ANY_PORTS).unwrap();
        Gossip::new(Blockchain::new(store, settings), registry, Arc::new(transport))
    }

    fn joiner_settings(first_node: &str) -> ChainSettings {
        let mut settings = test_settings(4);
        settings.first_node = first_node.to_string();
        settings
    }

    fn scripted(join_ok: bool, nodes: Vec<Node>, genesis: Option<Block>) -> ScriptedPeers {
        ScriptedPeers {
            join_ok,
            nodes,
            genesis,
            joins: RefCell::new(vec![]),
        }
    }

    #[test]
    fn test_first_node_seeds_the_chain() {
        let gossip = gossip_for(test_settings(4));
        let peers = scripted(true, vec![], None);

        let outcome = bootstrap(&gossip, &peers).unwrap();
        assert_eq!(outcome, BootstrapOutcome::Seeded { genesis_created: true });
        assert_eq!(gossip.blockchain().block_count(), 1);
        assert!(gossip.registry().is_known(THIS_NODE).unwrap());
        assert!(peers.joins.borrow().is_empty());

        let again = bootstrap(&gossip, &peers).unwrap();
        assert_eq!(again, BootstrapOutcome::Seeded { genesis_created: false });
    }

    #[test]
    fn test_unreachable_first_node_unwinds() {
        // Nothing listens for the mesh on 127.0.0.2
        let gossip = gossip_for(joiner_settings("127.0.0.2"));
        let peers = scripted(true, vec![], None);

        let result = bootstrap(&gossip, &peers);
        assert!(matches!(result, Err(LedgerError::Bootstrap(_))));
        assert!(gossip.registry().nodes().unwrap().is_empty());
        assert!(peers.joins.borrow().is_empty());
    }

    #[test]
    fn test_failed_join_is_fatal() {
        // "localhost" reaches this process's own publishers
        let gossip = gossip_for(joiner_settings("localhost"));
        let peers = scripted(false, vec![], None);

        let result = bootstrap(&gossip, &peers);
        assert!(matches!(result, Err(LedgerError::Bootstrap(_))));
        assert_eq!(
            *peers.joins.borrow(),
            vec!["localhost<-172.17.0.2".to_string()]
        );
        assert!(gossip.registry().nodes().unwrap().is_empty());
        assert!(!gossip.transport().is_subscribed_to("localhost"));
        assert_eq!(gossip.transport().subscriber_count(), 0);

        // Nothing is left behind to make a retry look already joined
        let retry = scripted(true, vec![], None);
        assert!(bootstrap(&gossip, &retry).is_ok());
        assert!(gossip.registry().is_known("localhost").unwrap());
    }

    #[test]
    fn test_join_registers_peers_and_adopts_genesis() {
        let seed = Blockchain::new(Store::temporary().unwrap(), test_settings(4));
        seed.create_genesis_block().unwrap();
        let genesis = seed.get_block(1).unwrap().unwrap();

        let gossip = gossip_for(joiner_settings("localhost"));
        let listed = vec![
            Node::new("localhost").with_id(1),
            Node::new(THIS_NODE).with_id(2),
            Node::new("127.0.0.2").with_id(3),
        ];
        let peers = scripted(true, listed, Some(genesis.clone()));

        let outcome = bootstrap(&gossip, &peers).unwrap();
        // localhost was registered as first node, 127.0.0.2 is unreachable
        assert_eq!(
            outcome,
            BootstrapOutcome::Joined {
                peers_added: 0,
                genesis_adopted: true
            }
        );
        assert_eq!(gossip.blockchain().export_chain().unwrap(), vec![genesis]);
        let addresses: Vec<String> = gossip
            .registry()
            .nodes()
            .unwrap()
            .iter()
            .map(|n| n.get_address().to_string())
            .collect();
        assert_eq!(addresses, vec![THIS_NODE.to_string(), "localhost".to_string()]);
    }
}
