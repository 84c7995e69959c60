use crate::core::{Block, Transaction};
use crate::error::{LedgerError, Result};
use crate::network::bootstrap::PeerClient;
use crate::network::gossip::Gossip;
use crate::network::node::{Node, Registration};
use crate::network::transport::Transport;
use crate::utils::KeyPair;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Deserializer};
use std::io::{BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const TCP_WRITE_TIMEOUT: u64 = 5000;
const TCP_READ_TIMEOUT: u64 = 60000;

/// Control API requests, one per connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlRequest {
    AddNode {
        node_address: String,
    },
    SubmitTransaction {
        full_names: String,
        practice_number: String,
        notes: String,
    },
    GetNodes,
    GetBlocks,
    GetBlock {
        id: u64,
    },
    GetTransactions,
    GetTransaction {
        id: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlResponse {
    Message(String),
    Nodes(Vec<Node>),
    Blocks(Vec<Block>),
    Block(Block),
    Transactions(Vec<Transaction>),
    Transaction(Transaction),
    /// The request itself was wrong
    BadRequest(String),
    NotFound(String),
    /// Something failed on our side
    Failure(String),
}

/// Serves the control API of one node: registration of new peers,
/// transaction submission and read-only views of the ledger
pub struct ControlServer<T: Transport> {
    gossip: Gossip<T>,
    key_pair: Arc<KeyPair>,
}

impl<T: Transport> Clone for ControlServer<T> {
    fn clone(&self) -> Self {
        ControlServer {
            gossip: self.gossip.clone(),
            key_pair: Arc::clone(&self.key_pair),
        }
    }
}

impl<T: Transport> ControlServer<T> {
    pub fn new(gossip: Gossip<T>, key_pair: Arc<KeyPair>) -> Self {
        ControlServer { gossip, key_pair }
    }

    pub fn bind(addr: &str) -> Result<TcpListener> {
        TcpListener::bind(addr)
            .map_err(|e| LedgerError::Network(format!("Failed to bind to {addr}: {e}")))
    }

    /// Run the server
    pub fn serve(&self, listener: TcpListener) -> Result<()> {
        info!("Control API listening on {}", listener.local_addr()?);
        for stream in listener.incoming() {
            match stream {
                Ok(stream) => {
                    let peer_addr = match stream.peer_addr() {
                        Ok(addr) => addr,
                        Err(e) => {
                            error!("Failed to get peer address: {e}");
                            continue;
                        }
                    };
                    let server = self.clone();
                    let spawned = thread::Builder::new()
                        .name(format!("control-{peer_addr}"))
                        .spawn(move || {
                            if let Err(e) = server.handle_connection(stream, peer_addr) {
                                error!("Error handling connection from {peer_addr}: {e}");
                            }
                        });
                    if let Err(e) = spawned {
                        error!("Failed to spawn handler for {peer_addr}: {e}");
                    }
                }
                Err(e) => {
                    error!("Error accepting connection: {e}");
                }
            }
        }
        Ok(())
    }

    /// Bind and serve on a background thread; returns the bound address
    pub fn spawn(&self, addr: &str) -> Result<SocketAddr> {
        let listener = Self::bind(addr)?;
        let local_addr = listener.local_addr()?;
        let server = self.clone();
        thread::Builder::new()
            .name("control".to_string())
            .spawn(move || {
                if let Err(e) = server.serve(listener) {
                    error!("Control API stopped: {e}");
                }
            })?;
        Ok(local_addr)
    }

    fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) -> Result<()> {
        stream
            .set_read_timeout(Some(Duration::from_millis(TCP_READ_TIMEOUT)))
            .map_err(|e| LedgerError::Network(format!("Failed to set read timeout: {e}")))?;
        stream
            .set_write_timeout(Some(Duration::from_millis(TCP_WRITE_TIMEOUT)))
            .map_err(|e| LedgerError::Network(format!("Failed to set write timeout: {e}")))?;

        let reader = BufReader::new(&stream);
        let request = Deserializer::from_reader(reader)
            .into_iter::<ControlRequest>()
            .next();

        let response = match request {
            Some(Ok(request)) => {
                info!("Received request from {peer_addr}: {request:?}");
                self.process_request(request)
            }
            Some(Err(e)) => ControlResponse::BadRequest(format!("Malformed request: {e}")),
            None => ControlResponse::BadRequest("Empty request".to_string()),
        };

        let mut writer = &stream;
        serde_json::to_writer(&mut writer, &response)
            .map_err(|e| LedgerError::Network(format!("Failed to send response: {e}")))?;
        writer.flush()?;
        let _ = stream.shutdown(Shutdown::Both);
        Ok(())
    }

    pub fn process_request(&self, request: ControlRequest) -> ControlResponse {
        let result = match request {
            ControlRequest::AddNode { node_address } => self.add_node(node_address),
            ControlRequest::SubmitTransaction {
                full_names,
                practice_number,
                notes,
            } => self.submit_transaction(full_names, practice_number, notes),
            ControlRequest::GetNodes => self.gossip.registry().nodes().map(ControlResponse::Nodes),
            ControlRequest::GetBlocks => self
                .gossip
                .blockchain()
                .export_chain()
                .map(ControlResponse::Blocks),
            ControlRequest::GetBlock { id } => {
                self.gossip
                    .blockchain()
                    .get_block(id)
                    .map(|block| match block {
                        Some(block) => ControlResponse::Block(block),
                        None => ControlResponse::NotFound(format!("Block {id} not found")),
                    })
            }
            ControlRequest::GetTransactions => self
                .gossip
                .blockchain()
                .pending_transactions()
                .map(ControlResponse::Transactions),
            ControlRequest::GetTransaction { id } => self
                .gossip
                .blockchain()
                .get_transaction(id)
                .map(|transaction| match transaction {
                    Some(transaction) => ControlResponse::Transaction(transaction),
                    None => ControlResponse::NotFound(format!("Transaction {id} not found")),
                }),
        };

        result.unwrap_or_else(|e| {
            error!("Request failed: {e}");
            ControlResponse::Failure(e.to_string())
        })
    }

    fn add_node(&self, address: String) -> Result<ControlResponse> {
        let registry = self.gossip.registry();
        if registry.is_this_node(&address) {
            return Ok(ControlResponse::BadRequest(format!(
                "{address} sent a request to itself {}!!!",
                registry.this_node()
            )));
        }
        if address.trim().is_empty() {
            return Ok(ControlResponse::BadRequest("Empty node address".to_string()));
        }

        let node = match registry.add_node(&Node::new(address.as_str()))? {
            Registration::Added(node) => node,
            Registration::AlreadyKnown => {
                return Ok(ControlResponse::BadRequest(format!(
                    "{} already knows {address}!",
                    registry.this_node()
                )))
            }
        };
        if !self.gossip.transport().subscribe_to_node(&node) {
            warn!("{} could not subscribe to {address}", registry.this_node());
        }
        self.gossip.announce_node(&node)?;
        Ok(ControlResponse::Message(format!(
            "{} now knows node {address}!",
            registry.this_node()
        )))
    }

    fn submit_transaction(
        &self,
        full_names: String,
        practice_number: String,
        notes: String,
    ) -> Result<ControlResponse> {
        let data = json!({
            "full_names": full_names,
            "practice_number": practice_number,
            "notes": notes,
        });
        let transaction = self.gossip.submit_transaction(&self.key_pair, data)?;
        Ok(ControlResponse::Message(
            transaction.get_transaction_data_string().to_string(),
        ))
    }
}

/// Client side of the control API
#[derive(Debug, Clone)]
pub struct ControlClient {
    control_port: u16,
    timeout: Duration,
}

impl ControlClient {
    pub fn new(control_port: u16) -> ControlClient {
        ControlClient {
            control_port,
            timeout: Duration::from_millis(TCP_WRITE_TIMEOUT),
        }
    }

    /// Send one request to `addr` ("host:port") and wait for the answer
    pub fn call(&self, addr: &str, request: &ControlRequest) -> Result<ControlResponse> {
        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| LedgerError::Network(format!("Invalid address {addr}: {e}")))?
            .next()
            .ok_or_else(|| LedgerError::Network(format!("No address found for {addr}")))?;

        let stream = TcpStream::connect_timeout(&socket_addr, self.timeout)
            .map_err(|e| LedgerError::Network(format!("Failed to connect to {addr}: {e}")))?;
        stream
            .set_write_timeout(Some(self.timeout))
            .map_err(|e| LedgerError::Network(format!("Failed to set write timeout: {e}")))?;
        stream
            .set_read_timeout(Some(Duration::from_millis(TCP_READ_TIMEOUT)))
            .map_err(|e| LedgerError::Network(format!("Failed to set read timeout: {e}")))?;

        serde_json::to_writer(&stream, request)
            .map_err(|e| LedgerError::Network(format!("Failed to send data: {e}")))?;
        stream.shutdown(Shutdown::Write)?;

        serde_json::from_reader(BufReader::new(&stream))
            .map_err(|e| LedgerError::Network(format!("Bad response from {addr}: {e}")))
    }

    fn peer_addr(&self, peer: &Node) -> String {
        format!("{}:{}", peer.get_address(), self.control_port)
    }
}

impl PeerClient for ControlClient {
    fn join(&self, peer: &Node, new_node: &Node) -> Result<()> {
        let request = ControlRequest::AddNode {
            node_address: new_node.get_address().to_string(),
        };
        match self.call(&self.peer_addr(peer), &request)? {
            ControlResponse::Message(message) => {
                info!("Result of adding {} in {}: {message}", new_node.get_address(), peer.get_address());
                Ok(())
            }
            // The peer is alive and already has us, e.g. after a restart
            ControlResponse::BadRequest(message) => {
                warn!("{} declined the join: {message}", peer.get_address());
                Ok(())
            }
            other => Err(LedgerError::Network(format!(
                "Unexpected join response from {}: {other:?}",
                peer.get_address()
            ))),
        }
    }

    fn nodes(&self, peer: &Node) -> Result<Vec<Node>> {
        match self.call(&self.peer_addr(peer), &ControlRequest::GetNodes)? {
            ControlResponse::Nodes(nodes) => Ok(nodes),
            other => Err(LedgerError::Network(format!(
                "Unexpected nodes response from {}: {other:?}",
                peer.get_address()
            ))),
        }
    }

    fn block(&self, peer: &Node, id: u64) -> Result<Option<Block>> {
        match self.call(&self.peer_addr(peer), &ControlRequest::GetBlock { id })? {
            ControlResponse::Block(block) => Ok(Some(block)),
            ControlResponse::NotFound(_) => Ok(None),
            other => Err(LedgerError::Network(format!(
                "Unexpected block response from {}: {other:?}",
                peer.get_address()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::mesh::{MeshPorts, MeshTransport};
    use crate::network::NodeRegistry;
    use crate::testnet::test_utils::{create_test_blockchain, test_key_pair, THIS_NODE};

    fn create_test_server(threshold: usize) -> ControlServer<MeshTransport> {
        let blockchain = create_test_blockchain(threshold);
        blockchain.create_genesis_block().unwrap();
        let registry = NodeRegistry::new(blockchain.get_store().clone(), THIS_NODE);
        let ports = MeshPorts {
            nodes: 0,
            chain: 0,
            transaction: 0,
        };
        let transport = MeshTransport::bind(THIS_NODE, "127.0.0.1", ports).unwrap();
        let gossip = Gossip::new(blockchain, registry, Arc::new(transport));
        ControlServer::new(gossip, Arc::new(test_key_pair()))
    }

    #[test]
    fn test_request_serialization() {
        let request = ControlRequest::AddNode {
            node_address: "172.17.0.3".to_string(),
        };
        let encoded = serde_json::to_string(&request).unwrap();
        assert_eq!(encoded, r#"{"AddNode":{"node_address":"172.17.0.3"}}"#);
        let decoded: ControlRequest = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(
            serde_json::to_string(&ControlRequest::GetNodes).unwrap(),
            r#""GetNodes""#
        );
    }

    #[test]
    fn test_add_node_rules() {
        let server = create_test_server(4);
        let this = server.process_request(
            ControlRequest::AddNode {
                node_address: THIS_NODE.to_string(),
            },
        );
        assert!(matches!(this, ControlResponse::BadRequest(_)));

        // Unreachable peers are still registered and announced
        let add = ControlRequest::AddNode {
            node_address: "127.0.0.2".to_string(),
        };
        assert!(matches!(
            server.process_request(add.clone()),
            ControlResponse::Message(_)
        ));
        assert!(matches!(
            server.process_request(add),
            ControlResponse::BadRequest(_)
        ));
    }

    #[test]
    fn test_submit_buffers_locally_on_mesh() {
        let server = create_test_server(4);
        let response = server.process_request(
            ControlRequest::SubmitTransaction {
                full_names: "fullNames Test String".to_string(),
                practice_number: "1234567890".to_string(),
                notes: "notes Test String".to_string(),
            },
        );
        let data_string = match response {
            ControlResponse::Message(message) => message,
            other => panic!("unexpected {other:?}"),
        };
        assert!(data_string.contains("1234567890"));

        match server.process_request(ControlRequest::GetTransactions) {
            ControlResponse::Transactions(transactions) => {
                assert_eq!(transactions.len(), 1);
                assert_eq!(transactions[0].get_transaction_data_string(), data_string);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            server.process_request(ControlRequest::GetTransaction { id: 1 }),
            ControlResponse::Transaction(_)
        ));
        assert!(matches!(
            server.process_request(ControlRequest::GetTransaction { id: 9 }),
            ControlResponse::NotFound(_)
        ));
    }

    #[test]
    fn test_client_round_trip_over_tcp() {
        let server = create_test_server(4);
        let addr = server.spawn("127.0.0.1:0").unwrap();
        let client = ControlClient::new(addr.port());
        let peer = Node::new("127.0.0.1");

        let genesis = client.block(&peer, 1).unwrap().unwrap();
        assert!(genesis.is_genesis());
        assert_eq!(client.block(&peer, 2).unwrap(), None);

        client.join(&peer, &Node::new("127.0.0.3")).unwrap();
        let nodes = client.nodes(&peer).unwrap();
        assert!(nodes.iter().any(|n| n.get_address() == "127.0.0.3"));

        match client.call(&addr.to_string(), &ControlRequest::GetBlocks).unwrap() {
            ControlResponse::Blocks(blocks) => assert_eq!(blocks, vec![genesis]),
            other => panic!("unexpected {other:?}"),
        }
    }
}
