// The ledger engine: genesis, append, mining and the chain replacement rule.
// Every chain mutation takes the same write lock, so a listener mining a block
// and another one replacing the chain never interleave.

use crate::core::block::NONCE_SEED;
use crate::core::{Block, Difficulty, ProofOfWork, Transaction};
use crate::error::{LedgerError, Result};
use crate::storage::Store;
use crate::utils::canonical_json;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// How a strictly longer candidate chain is judged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainPolicy {
    /// Length alone decides; mismatches with the local prefix are only logged
    #[default]
    Longest,
    /// The candidate must extend the local chain and pass `validate_chain`
    Verified,
}

impl FromStr for ChainPolicy {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "longest" => Ok(ChainPolicy::Longest),
            "verified" => Ok(ChainPolicy::Verified),
            other => Err(LedgerError::Config(format!("Unknown chain policy: {other}"))),
        }
    }
}

impl fmt::Display for ChainPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainPolicy::Longest => write!(f, "longest"),
            ChainPolicy::Verified => write!(f, "verified"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChainSettings {
    pub this_node: String,
    pub first_node: String,
    pub difficulty: Difficulty,
    pub mining_threshold: usize,
    pub policy: ChainPolicy,
}

impl ChainSettings {
    pub fn is_first_node(&self) -> bool {
        self.this_node == self.first_node
    }
}

/// What happened to a transaction handed to [`Blockchain::ingest_transaction`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingested {
    /// Stored in the buffer; `pending` counts the buffer after the insert
    Buffered { transaction: Transaction, pending: usize },
    /// The buffer reached the threshold and was folded into this block
    Mined(Block),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainDecision {
    /// Local chain swapped for the candidate. `inconsistencies` lists the ids
    /// of local blocks that differed from the candidate at the same position.
    Replaced { removed: usize, inconsistencies: Vec<u64> },
    /// Candidate was not longer than the local chain
    Kept { local: usize, candidate: usize },
    Rejected(String),
}

impl ChainDecision {
    pub fn is_replaced(&self) -> bool {
        matches!(self, ChainDecision::Replaced { .. })
    }
}

#[derive(Clone)]
pub struct Blockchain {
    store: Store,
    settings: Arc<ChainSettings>,
    pow: Arc<ProofOfWork>,
    write_lock: Arc<Mutex<()>>,
}

fn next_block_id(head: &Block) -> Result<u64> {
    head.get_id().checked_add(1).ok_or_else(|| {
        LedgerError::InvalidBlock(format!("No block id left after {}", head.get_id()))
    })
}

impl Blockchain {
    pub fn new(store: Store, settings: ChainSettings) -> Blockchain {
        let pow = ProofOfWork::new(settings.difficulty.clone());
        Blockchain {
            store,
            settings: Arc::new(settings),
            pow: Arc::new(pow),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn get_store(&self) -> &Store {
        &self.store
    }

    pub fn get_settings(&self) -> &ChainSettings {
        &self.settings
    }

    // A panic while holding the lock leaves no half-written state behind:
    // every store write below is a single sled operation or transaction.
    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the genesis block if this is the first node and nothing is
    /// stored yet. `Ok(false)` means nothing was done.
    pub fn create_genesis_block(&self) -> Result<bool> {
        self.create_genesis_block_at(&Utc::now())
    }

    pub fn create_genesis_block_at(&self, timestamp: &DateTime<Utc>) -> Result<bool> {
        if !self.settings.is_first_node() {
            return Ok(false);
        }
        let _guard = self.lock();
        if self.store.block_count() > 0 {
            return Ok(false);
        }
        let genesis = Block::genesis(timestamp)?;
        self.store.insert_block(&genesis)?;
        info!("Genesis block created: {}", genesis.get_hash());
        Ok(true)
    }

    /// Store a genesis block fetched from a peer, unless a chain exists
    pub fn adopt_genesis(&self, block: Block) -> Result<bool> {
        if !block.is_genesis() || !block.has_valid_hash() {
            return Err(LedgerError::InvalidBlock(format!(
                "Block {} is not a well-formed genesis block",
                block.get_id()
            )));
        }
        let _guard = self.lock();
        if self.store.block_count() > 0 {
            return Ok(false);
        }
        self.store.insert_block(&block)?;
        info!("Genesis block adopted: {}", block.get_hash());
        Ok(true)
    }

    /// Append `data` as a new block on top of the current head
    pub fn append_block(&self, data: &str) -> Result<Block> {
        let _guard = self.lock();
        let head = self
            .store
            .last_block()?
            .ok_or(LedgerError::ChainNotBootstrapped)?;
        let mut block = Block::new(
            next_block_id(&head)?,
            head.get_hash().to_string(),
            NONCE_SEED,
            data.to_string(),
            &Utc::now(),
        );
        self.pow.run(&mut block)?;
        self.store.insert_block(&block)?;
        Ok(block)
    }

    /// Mine a block over everything currently buffered. The block is not
    /// persisted and the buffer is left untouched.
    pub fn mine(&self) -> Result<Block> {
        let head = self
            .store
            .last_block()?
            .ok_or(LedgerError::ChainNotBootstrapped)?;
        let transactions = self.store.transactions()?;
        self.mine_on(&head, &transactions)
    }

    fn mine_on(&self, head: &Block, transactions: &[Transaction]) -> Result<Block> {
        let data = canonical_json(&transactions)?;
        let mut block = Block::new(
            next_block_id(head)?,
            head.get_hash().to_string(),
            NONCE_SEED,
            data,
            &Utc::now(),
        );
        info!(
            "Mining block {} with {} transactions",
            block.get_id(),
            transactions.len()
        );
        self.pow.run(&mut block)?;
        Ok(block)
    }

    /// Buffer a locally verified transaction; mine, persist and empty the
    /// buffer once it holds `mining_threshold` transactions.
    pub fn ingest_transaction(&self, transaction: &Transaction) -> Result<Ingested> {
        if !transaction.is_valid() {
            return Err(LedgerError::InvalidTransaction(
                "Only verified transactions can be buffered".to_string(),
            ));
        }
        let _guard = self.lock();
        let stored = self.store.insert_transaction(transaction)?;
        let pending = self.store.transaction_count();
        info!("Transaction: {:?} added ({pending} pending)", stored.get_id());

        if pending < self.settings.mining_threshold {
            return Ok(Ingested::Buffered {
                transaction: stored,
                pending,
            });
        }

        let head = match self.store.last_block()? {
            Some(head) => head,
            None => {
                warn!("Mining threshold reached but there is no chain to build on yet");
                return Ok(Ingested::Buffered {
                    transaction: stored,
                    pending,
                });
            }
        };
        let transactions = self.store.transactions()?;
        let block = self.mine_on(&head, &transactions)?;
        let consumed: Vec<u64> = transactions.iter().filter_map(Transaction::get_id).collect();
        self.store.commit_block(&block, &consumed)?;
        Ok(Ingested::Mined(block))
    }

    /// Ordered snapshot of the local chain
    pub fn export_chain(&self) -> Result<Vec<Block>> {
        self.store.blocks()
    }

    /// Apply the longer chain wins rule to a candidate chain
    pub fn replace_chain(&self, candidate: &[Block]) -> Result<ChainDecision> {
        let _guard = self.lock();
        let local = self.store.blocks()?;
        if candidate.len() <= local.len() {
            return Ok(ChainDecision::Kept {
                local: local.len(),
                candidate: candidate.len(),
            });
        }

        // The store keys blocks by id, so ids must run 1..=n in order
        if let Some((position, block)) = candidate
            .iter()
            .enumerate()
            .find(|(position, block)| block.get_id() != *position as u64 + 1)
        {
            return Ok(ChainDecision::Rejected(format!(
                "block at position {} carries id {}",
                position + 1,
                block.get_id()
            )));
        }

        let inconsistencies: Vec<u64> = local
            .iter()
            .zip(candidate)
            .filter(|(ours, theirs)| ours != theirs)
            .map(|(ours, _)| ours.get_id())
            .collect();
        for id in &inconsistencies {
            warn!("Inconsistency in the received chain at block {id} compared with the local one");
        }

        if self.settings.policy == ChainPolicy::Verified {
            if !inconsistencies.is_empty() {
                return Ok(ChainDecision::Rejected(format!(
                    "candidate diverges from the local chain at {} blocks",
                    inconsistencies.len()
                )));
            }
            if let Err(e) = self.validate_chain(candidate) {
                return Ok(ChainDecision::Rejected(e.to_string()));
            }
        }

        let removed = self.store.replace_blocks(candidate)?;
        info!(
            "Updating chain: {removed} blocks deleted, {} stored",
            candidate.len()
        );
        Ok(ChainDecision::Replaced {
            removed,
            inconsistencies,
        })
    }

    /// Check genesis marker, linkage, hash integrity and proof-of-work
    pub fn validate_chain(&self, blocks: &[Block]) -> Result<()> {
        let genesis = blocks
            .first()
            .ok_or_else(|| LedgerError::InvalidBlock("Chain is empty".to_string()))?;
        if !genesis.is_genesis() || !genesis.has_valid_hash() {
            return Err(LedgerError::InvalidBlock(
                "First block is not a valid genesis block".to_string(),
            ));
        }

        for pair in blocks.windows(2) {
            let (prev, block) = (&pair[0], &pair[1]);
            if prev.get_id().checked_add(1) != Some(block.get_id()) {
                return Err(LedgerError::InvalidBlock(format!(
                    "Block {} follows block {}",
                    block.get_id(),
                    prev.get_id()
                )));
            }
            if block.get_prev_hash() != prev.get_hash() {
                return Err(LedgerError::InvalidBlock(format!(
                    "Block {} does not link to its predecessor",
                    block.get_id()
                )));
            }
            if !self.pow.validate(block) {
                return Err(LedgerError::InvalidBlock(format!(
                    "Block {} fails proof-of-work",
                    block.get_id()
                )));
            }
        }
        Ok(())
    }

    pub fn get_block(&self, id: u64) -> Result<Option<Block>> {
        self.store.block(id)
    }

    pub fn get_last_block(&self) -> Result<Option<Block>> {
        self.store.last_block()
    }

    pub fn block_count(&self) -> usize {
        self.store.block_count()
    }

    pub fn pending_transactions(&self) -> Result<Vec<Transaction>> {
        self.store.transactions()
    }

    pub fn get_transaction(&self, id: u64) -> Result<Option<Transaction>> {
        self.store.transaction(id)
    }
}
