// The repository every component shares: one sled database, one tree per entity
// class, keys are big-endian ids so iteration order is id order

use crate::core::{Block, Transaction};
use crate::error::{LedgerError, Result};
use crate::network::Node;
use crate::utils::{deserialize, serialize};
use sled::transaction::TransactionError;
use sled::{Db, IVec, Transactional, Tree};
use std::path::Path;

const BLOCKS_TREE: &str = "blocks";
const TRANSACTIONS_TREE: &str = "transactions";
const NODES_TREE: &str = "nodes";

#[derive(Clone)]
pub struct Store {
    db: Db,
    blocks: Tree,
    transactions: Tree,
    nodes: Tree,
}

fn key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

fn decode_all<T>(tree: &Tree) -> Result<Vec<T>>
where
    T: for<'de> serde::Deserialize<'de> + bincode::Decode<()>,
{
    let mut items = vec![];
    for item in tree.iter() {
        let (_, value) = item
            .map_err(|e| LedgerError::Database(format!("Failed to iterate tree: {e}")))?;
        items.push(deserialize(value.as_ref())?);
    }
    Ok(items)
}

fn decode_one<T>(tree: &Tree, id: u64) -> Result<Option<T>>
where
    T: for<'de> serde::Deserialize<'de> + bincode::Decode<()>,
{
    match tree.get(key(id))? {
        Some(value) => Ok(Some(deserialize(value.as_ref())?)),
        None => Ok(None),
    }
}

// Keep a proposed id when it is free, otherwise take the one after the highest
fn free_id(tree: &Tree, proposed: Option<u64>) -> Result<u64> {
    if let Some(id) = proposed {
        if !tree.contains_key(key(id))? {
            return Ok(id);
        }
    }
    let next = match tree.last()? {
        Some((last, _)) => id_from_key(&last)?
            .checked_add(1)
            .ok_or_else(|| LedgerError::Database("No free id left after u64::MAX".to_string()))?,
        None => 1,
    };
    Ok(next)
}

fn id_from_key(raw: &IVec) -> Result<u64> {
    let bytes: [u8; 8] = raw
        .as_ref()
        .try_into()
        .map_err(|_| LedgerError::Database(format!("Malformed key of {} bytes", raw.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

fn all_keys(tree: &Tree) -> Result<Vec<IVec>> {
    tree.iter()
        .keys()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| LedgerError::Database(format!("Failed to list keys: {e}")))
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Store> {
        let db = sled::open(path.as_ref()).map_err(|e| {
            LedgerError::Database(format!(
                "Failed to open database at {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_db(db)
    }

    /// In-memory store removed on drop
    pub fn temporary() -> Result<Store> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| LedgerError::Database(format!("Failed to open temporary database: {e}")))?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Store> {
        let open = |name: &str| {
            db.open_tree(name)
                .map_err(|e| LedgerError::Database(format!("Failed to open {name} tree: {e}")))
        };
        Ok(Store {
            blocks: open(BLOCKS_TREE)?,
            transactions: open(TRANSACTIONS_TREE)?,
            nodes: open(NODES_TREE)?,
            db,
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    // Blocks

    pub fn blocks(&self) -> Result<Vec<Block>> {
        decode_all(&self.blocks)
    }

    pub fn block(&self, id: u64) -> Result<Option<Block>> {
        decode_one(&self.blocks, id)
    }

    /// Highest-id block, the chain head
    pub fn last_block(&self) -> Result<Option<Block>> {
        match self.blocks.last()? {
            Some((_, value)) => Ok(Some(deserialize(value.as_ref())?)),
            None => Ok(None),
        }
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn insert_block(&self, block: &Block) -> Result<()> {
        let encoded = serialize(block)?;
        self.blocks.insert(key(block.get_id()), encoded)?;
        Ok(())
    }

    /// Persist a mined block and drop the transactions it consumed, atomically
    pub fn commit_block(&self, block: &Block, consumed: &[u64]) -> Result<()> {
        let encoded = serialize(block)?;
        (&self.blocks, &self.transactions)
            .transaction(|(blocks, transactions)| {
                blocks.insert(&key(block.get_id())[..], encoded.as_slice())?;
                for id in consumed {
                    transactions.remove(&key(*id)[..])?;
                }
                Ok(())
            })
            .map_err(|e: TransactionError| {
                LedgerError::Database(format!("Failed to commit block {}: {e}", block.get_id()))
            })?;
        Ok(())
    }

    /// Swap the whole chain for `blocks` and empty the transaction buffer.
    ///
    /// Either everything is replaced or nothing is. Returns how many stored
    /// blocks were removed.
    pub fn replace_blocks(&self, blocks: &[Block]) -> Result<usize> {
        let stale_blocks = all_keys(&self.blocks)?;
        let stale_transactions = all_keys(&self.transactions)?;
        let encoded = blocks
            .iter()
            .map(|block| Ok((key(block.get_id()), serialize(block)?)))
            .collect::<Result<Vec<_>>>()?;

        (&self.blocks, &self.transactions)
            .transaction(|(tx_blocks, tx_transactions)| {
                for stale in &stale_blocks {
                    tx_blocks.remove(stale.clone())?;
                }
                for stale in &stale_transactions {
                    tx_transactions.remove(stale.clone())?;
                }
                for (id, data) in &encoded {
                    tx_blocks.insert(&id[..], data.as_slice())?;
                }
                Ok(())
            })
            .map_err(|e: TransactionError| {
                LedgerError::Database(format!("Failed to replace chain: {e}"))
            })?;
        Ok(stale_blocks.len())
    }

    // Transactions

    pub fn transactions(&self) -> Result<Vec<Transaction>> {
        decode_all(&self.transactions)
    }

    pub fn transaction(&self, id: u64) -> Result<Option<Transaction>> {
        decode_one(&self.transactions, id)
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.len()
    }

    /// Store a transaction under its own id, or a fresh one if that is
    /// missing or taken. Returns the stored record.
    pub fn insert_transaction(&self, transaction: &Transaction) -> Result<Transaction> {
        let id = free_id(&self.transactions, transaction.get_id())?;
        let mut stored = transaction.clone();
        stored.set_id(id);
        self.transactions.insert(key(id), serialize(&stored)?)?;
        Ok(stored)
    }

    pub fn clear_transactions(&self) -> Result<usize> {
        let count = self.transactions.len();
        self.transactions.clear()?;
        Ok(count)
    }

    // Nodes

    pub fn nodes(&self) -> Result<Vec<Node>> {
        decode_all(&self.nodes)
    }

    pub fn node_by_address(&self, address: &str) -> Result<Option<Node>> {
        Ok(self
            .nodes()?
            .into_iter()
            .find(|node| node.get_address() == address))
    }

    /// Store a node, reassigning its id when missing or already taken
    pub fn insert_node(&self, node: &Node) -> Result<Node> {
        let id = free_id(&self.nodes, node.get_id())?;
        let stored = node.with_id(id);
        self.nodes.insert(key(id), serialize(&stored)?)?;
        Ok(stored)
    }

    /// Remove every record holding `address`; returns whether any existed
    pub fn remove_nodes_by_address(&self, address: &str) -> Result<bool> {
        let mut removed = false;
        for item in self.nodes.iter() {
            let (raw_key, value) = item
                .map_err(|e| LedgerError::Database(format!("Failed to iterate nodes: {e}")))?;
            let node: Node = deserialize(value.as_ref())?;
            if node.get_address() == address {
                self.nodes.remove(raw_key)?;
                removed = true;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testnet::test_utils::{fixed_time, signed_transaction, test_key_pair};
    use tempfile::tempdir;

    fn block(id: u64, prev_hash: &str) -> Block {
        let mut block = Block::new(id, prev_hash.to_string(), 456, format!("block {id}"), &fixed_time());
        block.seal().unwrap();
        block
    }

    #[test]
    fn test_blocks_come_back_in_id_order() {
        let store = Store::temporary().unwrap();
        // ids above 255 would sort wrong with little-endian keys
        for id in [300, 2, 1] {
            store.insert_block(&block(id, "x")).unwrap();
        }
        let ids: Vec<u64> = store.blocks().unwrap().iter().map(Block::get_id).collect();
        assert_eq!(ids, vec![1, 2, 300]);
        assert_eq!(store.last_block().unwrap().unwrap().get_id(), 300);
        assert_eq!(store.block_count(), 3);
        assert!(store.block(7).unwrap().is_none());
    }

    #[test]
    fn test_transaction_ids_are_assigned() {
        let store = Store::temporary().unwrap();
        let key_pair = test_key_pair();

        let first = store.insert_transaction(&signed_transaction(&key_pair, "a")).unwrap();
        assert_eq!(first.get_id(), Some(1));

        let mut claimed = signed_transaction(&key_pair, "b");
        claimed.set_id(1);
        let second = store.insert_transaction(&claimed).unwrap();
        assert_eq!(second.get_id(), Some(2));

        let mut free = signed_transaction(&key_pair, "c");
        free.set_id(10);
        assert_eq!(store.insert_transaction(&free).unwrap().get_id(), Some(10));
        assert_eq!(store.transaction_count(), 3);

        assert_eq!(store.clear_transactions().unwrap(), 3);
        assert_eq!(store.transaction_count(), 0);
    }

    #[test]
    fn test_transaction_ids_run_out_at_max() {
        let store = Store::temporary().unwrap();
        let key_pair = test_key_pair();

        let mut last = signed_transaction(&key_pair, "a");
        last.set_id(u64::MAX);
        assert_eq!(store.insert_transaction(&last).unwrap().get_id(), Some(u64::MAX));

        let mut again = signed_transaction(&key_pair, "b");
        again.set_id(u64::MAX);
        assert!(matches!(
            store.insert_transaction(&again),
            Err(LedgerError::Database(_))
        ));
        assert!(store.insert_transaction(&signed_transaction(&key_pair, "c")).is_err());
        assert_eq!(store.transaction_count(), 1);
    }

    #[test]
    fn test_replace_blocks_swaps_everything() {
        let store = Store::temporary().unwrap();
        for id in 1..=3 {
            store.insert_block(&block(id, "old")).unwrap();
        }
        store
            .insert_transaction(&signed_transaction(&test_key_pair(), "pending"))
            .unwrap();

        let replacement: Vec<Block> = (1..=2).map(|id| block(id, "new")).collect();
        let removed = store.replace_blocks(&replacement).unwrap();

        assert_eq!(removed, 3);
        assert_eq!(store.blocks().unwrap(), replacement);
        assert_eq!(store.transaction_count(), 0);
    }

    #[test]
    fn test_commit_block_consumes_transactions() {
        let store = Store::temporary().unwrap();
        let key_pair = test_key_pair();
        let kept = store.insert_transaction(&signed_transaction(&key_pair, "a")).unwrap();
        let mined = store.insert_transaction(&signed_transaction(&key_pair, "b")).unwrap();

        store
            .commit_block(&block(2, "x"), &[mined.get_id().unwrap()])
            .unwrap();
        assert_eq!(store.block_count(), 1);
        assert_eq!(store.transactions().unwrap(), vec![kept]);
    }

    #[test]
    fn test_nodes_by_address() {
        let store = Store::temporary().unwrap();
        let stored = store.insert_node(&Node::new("10.0.0.1")).unwrap();
        assert_eq!(stored.get_id(), Some(1));
        store.insert_node(&Node::new("10.0.0.2")).unwrap();

        assert_eq!(store.node_by_address("10.0.0.1").unwrap(), Some(stored));
        assert!(store.remove_nodes_by_address("10.0.0.1").unwrap());
        assert!(!store.remove_nodes_by_address("10.0.0.1").unwrap());
        assert_eq!(store.nodes().unwrap().len(), 1);
    }

    #[test]
    fn test_store_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger");
        {
            let store = Store::open(&path).unwrap();
            store.insert_block(&block(1, "x")).unwrap();
            store.flush().unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert_eq!(store.block_count(), 1);
    }
}
