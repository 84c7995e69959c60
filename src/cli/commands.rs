use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "gossip-ledger", about = "A gossiping proof-of-work ledger node")]
pub struct Opt {
    #[arg(
        long = "config",
        global = true,
        help = "TOML settings file; environment variables override it"
    )]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(
        name = "start-node",
        about = "Bootstrap into the network and serve until stopped"
    )]
    StartNode,
    #[command(name = "broker", about = "Run the shared topic broker")]
    Broker {
        #[arg(long, default_value = "0.0.0.0:9092", help = "Address to listen on")]
        listen: String,
    },
    #[command(name = "keygen", about = "Write a new node key pair to the key file")]
    Keygen {
        #[arg(long, help = "Replace an existing key file")]
        force: bool,
    },
    #[command(name = "submit", about = "Submit a transaction through a node")]
    Submit {
        #[arg(help = "Full names")]
        full_names: String,
        #[arg(help = "Practice number")]
        practice_number: String,
        #[arg(help = "Notes")]
        notes: String,
        #[arg(long, help = "Node to submit to (defaults to this node)")]
        node: Option<String>,
    },
    #[command(name = "print-chain", about = "Print every block a node holds")]
    PrintChain {
        #[arg(long, help = "Node to query (defaults to this node)")]
        node: Option<String>,
    },
    #[command(name = "list-nodes", about = "Print the nodes a node knows")]
    ListNodes {
        #[arg(long, help = "Node to query (defaults to this node)")]
        node: Option<String>,
    },
}
