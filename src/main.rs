// Entry point of the node binary
use clap::Parser;
use gossip_ledger::{
    bootstrap, Blockchain, BrokerTransport, Command, ControlClient, ControlRequest,
    ControlResponse, ControlServer, Gossip, KeyPair, LogBroker, MeshTransport, NodeRegistry, Opt,
    Settings, Store, Transport, TransportKind,
};
use log::{error, info, LevelFilter};
use std::process;
use std::sync::Arc;

fn main() {
    // Info by default, RUST_LOG still wins
    env_logger::builder()
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();

    let opt = Opt::parse();

    if let Err(e) = run_command(opt) {
        error!("Error: {e}");
        process::exit(1);
    }
}

fn run_command(opt: Opt) -> Result<(), Box<dyn std::error::Error>> {
    let settings = Settings::load(opt.config.as_deref())?;
    match opt.command {
        Command::StartNode => {
            let key_pair = KeyPair::load_or_generate(&settings.key_file)?;
            match settings.transport {
                TransportKind::Mesh => {
                    let transport = MeshTransport::bind(
                        &settings.this_node,
                        &settings.bind_host,
                        settings.mesh_ports(),
                    )?;
                    run_node(&settings, transport, key_pair)?
                }
                TransportKind::Broker => {
                    let transport = BrokerTransport::connect(&settings.broker_address)?;
                    run_node(&settings, transport, key_pair)?
                }
            }
        }
        Command::Broker { listen } => {
            let listener = LogBroker::bind(&listen)?;
            LogBroker::new().serve(listener)?
        }
        Command::Keygen { force } => {
            if settings.key_file.exists() && !force {
                return Err(format!(
                    "{} already exists, use --force to replace it",
                    settings.key_file.display()
                )
                .into());
            }
            let key_pair = KeyPair::generate();
            key_pair.save(&settings.key_file)?;
            println!("Public key: {}", key_pair.public_key());
        }
        Command::Submit {
            full_names,
            practice_number,
            notes,
            node,
        } => {
            let request = ControlRequest::SubmitTransaction {
                full_names,
                practice_number,
                notes,
            };
            match call_node(&settings, node, &request)? {
                ControlResponse::Message(data) => println!("Submitted: {data}"),
                other => return Err(describe(other).into()),
            }
        }
        Command::PrintChain { node } => match call_node(&settings, node, &ControlRequest::GetBlocks)? {
            ControlResponse::Blocks(blocks) => {
                for block in blocks {
                    println!("Block {}", block.get_id());
                    println!("Prev hash: {}", block.get_prev_hash());
                    println!("Hash: {}", block.get_hash());
                    println!("Nonce: {}", block.get_nonce());
                    println!("Timestamp: {}", block.get_timestamp());
                    println!("Data: {}", block.get_data());
                    println!()
                }
            }
            other => return Err(describe(other).into()),
        },
        Command::ListNodes { node } => match call_node(&settings, node, &ControlRequest::GetNodes)? {
            ControlResponse::Nodes(nodes) => {
                for node in nodes {
                    match node.get_id() {
                        Some(id) => println!("{id}: {}", node.get_address()),
                        None => println!("-: {}", node.get_address()),
                    }
                }
            }
            other => return Err(describe(other).into()),
        },
    }
    Ok(())
}

/// Wire a node over `transport`, join the network and serve until killed
fn run_node<T: Transport>(
    settings: &Settings,
    transport: T,
    key_pair: KeyPair,
) -> Result<(), Box<dyn std::error::Error>> {
    let store = Store::open(settings.store_path())?;
    let blockchain = Blockchain::new(store.clone(), settings.chain_settings());
    let registry = NodeRegistry::new(store, settings.this_node.as_str());
    let gossip = Gossip::new(blockchain, registry, Arc::new(transport));

    // Bind first so a busy port fails before we announce ourselves
    let listener = ControlServer::<T>::bind(&settings.control_address())?;
    let peers = ControlClient::new(settings.ports.control);
    let outcome = bootstrap(&gossip, &peers)?;
    info!(
        "{} is up over {}: {outcome:?}",
        settings.this_node,
        gossip.transport().name()
    );

    let _listeners = gossip.spawn_listeners()?;
    ControlServer::new(gossip, Arc::new(key_pair)).serve(listener)?;
    Ok(())
}

fn call_node(
    settings: &Settings,
    node: Option<String>,
    request: &ControlRequest,
) -> Result<ControlResponse, Box<dyn std::error::Error>> {
    let host = node.unwrap_or_else(|| settings.this_node.clone());
    let client = ControlClient::new(settings.ports.control);
    Ok(client.call(&format!("{host}:{}", settings.ports.control), request)?)
}

fn describe(response: ControlResponse) -> String {
    match response {
        ControlResponse::BadRequest(message) => format!("Rejected: {message}"),
        ControlResponse::NotFound(message) => format!("Not found: {message}"),
        ControlResponse::Failure(message) => format!("Node failed: {message}"),
        other => format!("Unexpected response: {other:?}"),
    }
}
