use crate::core::{ChainPolicy, ChainSettings, Difficulty};
use crate::error::{LedgerError, Result};
use crate::network::MeshPorts;
use log::info;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const THIS_NODE_KEY: &str = "THIS_NODE";
const FIRST_NODE_KEY: &str = "FIRST_NODE";
const COMM_KEY: &str = "COMM";
const NONCE_ZEROES_KEY: &str = "NONCE_ZEROES";
const TRANSACTIONS_AMOUNT_KEY: &str = "TRANSACTIONS_AMOUNT";
const CHAIN_POLICY_KEY: &str = "CHAIN_POLICY";
const NODES_PORT_KEY: &str = "NODES_PORT";
const CHAIN_PORT_KEY: &str = "CHAIN_PORT";
const TRANSACTION_PORT_KEY: &str = "TRANSACTION_PORT";
const CONTROL_PORT_KEY: &str = "CONTROL_PORT";
const BROKER_ADDRESS_KEY: &str = "BROKER_ADDRESS";
const DATA_DIR_KEY: &str = "DATA_DIR";
const KEY_FILE_KEY: &str = "KEY_FILE";

/// Which gossip backend a node runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Mesh,
    Broker,
}

impl FromStr for TransportKind {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "mesh" | "zmq" => Ok(TransportKind::Mesh),
            "broker" | "kafka" => Ok(TransportKind::Broker),
            _ => Err(LedgerError::Config(format!(
                "Invalid transport: {s}. Valid options: mesh, broker"
            ))),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Mesh => write!(f, "mesh"),
            TransportKind::Broker => write!(f, "broker"),
        }
    }
}

/// Ports shared by every node of the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ports {
    pub nodes: u16,
    pub chain: u16,
    pub transaction: u16,
    pub control: u16,
}

impl Default for Ports {
    fn default() -> Self {
        Ports {
            nodes: 20344,
            chain: 21344,
            transaction: 22344,
            control: 5000,
        }
    }
}

/// Node settings. Built from defaults, then an optional TOML file, then
/// environment variables; [`Settings::load`] does all three and validates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub this_node: String,
    pub first_node: String,
    pub transport: TransportKind,
    pub difficulty: Difficulty,
    pub mining_threshold: usize,
    pub chain_policy: ChainPolicy,
    pub ports: Ports,
    /// Interface the publishers and the control API listen on
    pub bind_host: String,
    pub broker_address: String,
    pub data_dir: PathBuf,
    pub key_file: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            this_node: "127.0.0.1".to_string(),
            first_node: "127.0.0.1".to_string(),
            transport: TransportKind::default(),
            difficulty: Difficulty::default(),
            mining_threshold: 4,
            chain_policy: ChainPolicy::default(),
            ports: Ports::default(),
            bind_host: "0.0.0.0".to_string(),
            broker_address: "127.0.0.1:9092".to_string(),
            data_dir: PathBuf::from("data"),
            key_file: PathBuf::from("node.key"),
        }
    }
}

impl Settings {
    pub fn load(config_file: Option<&Path>) -> Result<Settings> {
        let mut settings = match config_file {
            Some(path) => Settings::from_file(path)?,
            None => Settings::default(),
        };
        settings.apply_overrides(|key| std::env::var(key).ok())?;
        settings.validate()?;
        info!(
            "Settings loaded: node {} (first node {}), {} transport",
            settings.this_node, settings.first_node, settings.transport
        );
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Settings> {
        let text = fs::read_to_string(path).map_err(|e| {
            LedgerError::Config(format!("Cannot read {}: {e}", path.display()))
        })?;
        Settings::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Settings> {
        Ok(toml::from_str(text)?)
    }

    /// Override fields from the variables `lookup` knows about
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(THIS_NODE_KEY) {
            self.this_node = value;
        }
        if let Some(value) = lookup(FIRST_NODE_KEY) {
            self.first_node = value;
        }
        if let Some(value) = lookup(COMM_KEY) {
            self.transport = value.parse()?;
        }
        if let Some(value) = lookup(NONCE_ZEROES_KEY) {
            self.difficulty = value.parse()?;
        }
        if let Some(value) = lookup(TRANSACTIONS_AMOUNT_KEY) {
            self.mining_threshold = parse_number(TRANSACTIONS_AMOUNT_KEY, &value)?;
        }
        if let Some(value) = lookup(CHAIN_POLICY_KEY) {
            self.chain_policy = value.parse()?;
        }
        if let Some(value) = lookup(NODES_PORT_KEY) {
            self.ports.nodes = parse_number(NODES_PORT_KEY, &value)?;
        }
        if let Some(value) = lookup(CHAIN_PORT_KEY) {
            self.ports.chain = parse_number(CHAIN_PORT_KEY, &value)?;
        }
        if let Some(value) = lookup(TRANSACTION_PORT_KEY) {
            self.ports.transaction = parse_number(TRANSACTION_PORT_KEY, &value)?;
        }
        if let Some(value) = lookup(CONTROL_PORT_KEY) {
            self.ports.control = parse_number(CONTROL_PORT_KEY, &value)?;
        }
        if let Some(value) = lookup(BROKER_ADDRESS_KEY) {
            self.broker_address = value;
        }
        if let Some(value) = lookup(DATA_DIR_KEY) {
            self.data_dir = PathBuf::from(value);
        }
        if let Some(value) = lookup(KEY_FILE_KEY) {
            self.key_file = PathBuf::from(value);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        // Difficulty is checked when it is parsed
        if self.mining_threshold == 0 {
            return Err(LedgerError::Config(
                "mining_threshold must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("this_node", &self.this_node),
            ("first_node", &self.first_node),
            ("bind_host", &self.bind_host),
            ("broker_address", &self.broker_address),
        ] {
            if value.trim().is_empty() {
                return Err(LedgerError::Config(format!("{name} must not be empty")));
            }
        }

        let ports = [
            self.ports.nodes,
            self.ports.chain,
            self.ports.transaction,
            self.ports.control,
        ];
        for (i, port) in ports.iter().enumerate() {
            if *port != 0 && ports[i + 1..].contains(port) {
                return Err(LedgerError::Config(format!(
                    "Port {port} is configured twice"
                )));
            }
        }
        Ok(())
    }

    pub fn chain_settings(&self) -> ChainSettings {
        ChainSettings {
            this_node: self.this_node.clone(),
            first_node: self.first_node.clone(),
            difficulty: self.difficulty.clone(),
            mining_threshold: self.mining_threshold,
            policy: self.chain_policy,
        }
    }

    pub fn mesh_ports(&self) -> MeshPorts {
        MeshPorts {
            nodes: self.ports.nodes,
            chain: self.ports.chain,
            transaction: self.ports.transaction,
        }
    }

    pub fn control_address(&self) -> String {
        format!("{}:{}", self.bind_host, self.ports.control)
    }

    /// Each node gets its own database, so several can share a data dir
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(format!("ledger-{}", self.this_node))
    }
}

fn parse_number<N: FromStr>(key: &str, value: &str) -> Result<N> {
    value
        .trim()
        .parse()
        .map_err(|_| LedgerError::Config(format!("{key} must be a number, got {value:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.ports.nodes, 20344);
        assert_eq!(settings.ports.chain, 21344);
        assert_eq!(settings.ports.transaction, 22344);
        assert_eq!(settings.ports.control, 5000);
        assert_eq!(settings.difficulty.as_str(), "0000");
        assert_eq!(settings.mining_threshold, 4);
        assert_eq!(settings.transport, TransportKind::Mesh);
        assert_eq!(settings.chain_policy, ChainPolicy::Longest);
        assert!(settings.validate().is_ok());
        assert!(settings.chain_settings().is_first_node());
    }

    #[test]
    fn test_toml_then_environment() {
        let mut settings = Settings::from_toml_str(
            r#"
            this_node = "172.17.0.3"
            first_node = "172.17.0.2"
            transport = "broker"
            difficulty = "000"

            [ports]
            control = 5001
            "#,
        )
        .unwrap();
        assert_eq!(settings.transport, TransportKind::Broker);
        assert_eq!(settings.ports.control, 5001);
        assert_eq!(settings.ports.nodes, 20344);
        assert_eq!(settings.mining_threshold, 4);

        settings
            .apply_overrides(lookup_from(&[
                ("COMM", "zmq"),
                ("NONCE_ZEROES", "0"),
                ("TRANSACTIONS_AMOUNT", "3"),
                ("CHAIN_POLICY", "Verified"),
                ("NODES_PORT", "30000"),
            ]))
            .unwrap();
        settings.validate().unwrap();

        assert_eq!(settings.transport, TransportKind::Mesh);
        assert_eq!(settings.this_node, "172.17.0.3");
        let chain = settings.chain_settings();
        assert!(!chain.is_first_node());
        assert_eq!(chain.difficulty.as_str(), "0");
        assert_eq!(chain.mining_threshold, 3);
        assert_eq!(chain.policy, ChainPolicy::Verified);
        assert_eq!(settings.mesh_ports().nodes, 30000);
        assert_eq!(settings.control_address(), "0.0.0.0:5001");
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(Settings::from_toml_str(r#"difficulty = "zz""#).is_err());
        assert!(Settings::from_toml_str(r#"transport = "carrier-pigeon""#).is_err());

        let mut settings = Settings::default();
        assert!(settings
            .apply_overrides(lookup_from(&[("TRANSACTIONS_AMOUNT", "four")]))
            .is_err());
        assert!(settings
            .apply_overrides(lookup_from(&[("NONCE_ZEROES", "00Z")]))
            .is_err());

        let mut settings = Settings::default();
        settings.mining_threshold = 0;
        assert!(matches!(settings.validate(), Err(LedgerError::Config(_))));

        let mut settings = Settings::default();
        settings.ports.chain = settings.ports.nodes;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.ports = Ports {
            nodes: 0,
            chain: 0,
            transaction: 0,
            control: 0,
        };
        assert!(settings.validate().is_ok());

        let mut settings = Settings::default();
        settings.this_node = " ".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        fs::write(&path, "this_node = \"10.0.0.5\"\nmining_threshold = 2\n").unwrap();
        let settings = Settings::from_file(&path).unwrap();
        assert_eq!(settings.this_node, "10.0.0.5");
        assert_eq!(settings.mining_threshold, 2);
        assert!(settings.store_path().ends_with("ledger-10.0.0.5"));

        assert!(Settings::from_file(&dir.path().join("missing.toml")).is_err());
    }
}
