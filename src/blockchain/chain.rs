use log::{info, warn};
use serde::Serialize;
use thiserror::Error;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard};

use super::block::{Block, GENESIS_PREVIOUS_HASH};
use super::crypto::{Address, CryptoError};
use super::economics::ChainParams;
use super::ledger::{Ledger, LedgerError};
use super::mempool::{partition_considered, Mempool, MempoolError};
use super::miner::{assemble, mine, BlockTemplate, MinerError};
use super::storage::{BlockchainStorage, ChainCommit, StorageError};
use super::transaction::{SignedTransaction, Transaction, TransactionError, TransactionIntent};
use super::validator::{validate_block, validate_chain, ValidationError};
use super::wallet::{WalletRecord, WalletTable};

/// Errors that can occur during blockchain operations
#[derive(Debug, Error)]
pub enum BlockchainError {
    #[error("{0}")]
    Validation(#[from] ValidationError),

    #[error("{0}")]
    Mempool(#[from] MempoolError),

    #[error("{0}")]
    Miner(#[from] MinerError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Consensus conflict: {0}")]
    ConsensusConflict(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("System error: {0}")]
    SystemError(String),
}

impl BlockchainError {
    /// Error kind reported to RPC clients
    pub fn kind(&self) -> &'static str {
        match self {
            BlockchainError::Validation(_)
            | BlockchainError::Mempool(_)
            | BlockchainError::Miner(_)
            | BlockchainError::Transaction(_)
            | BlockchainError::Crypto(_)
            | BlockchainError::Ledger(_) => "ValidationError",
            BlockchainError::ConsensusConflict(_) => "ConsensusConflict",
            BlockchainError::Storage(_) => "PersistenceError",
            BlockchainError::NotFound(_) => "NotFound",
            BlockchainError::SystemError(_) => "InternalError",
        }
    }
}

/// A freshly mined block and what it paid out
#[derive(Debug, Clone, Serialize)]
pub struct MinedBlock {
    pub block: Block,
    pub reward: u64,
}

/// Result of offering a block from a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    AlreadyKnown,
}

/// Where a transaction was found
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionLocation {
    pub transaction: Transaction,

    /// `None` while pending
    pub block_index: Option<u64>,
}

/// Chain and the balances derived from it, always swapped together
#[derive(Debug, Default)]
struct ChainState {
    chain: Vec<Block>,
    ledger: Ledger,
}

/// How a commit changes the chain
enum ChainUpdate {
    /// One block on top of the current head
    Extend(Block),

    /// A whole new chain; blocks before `fork_point` are shared with ours
    Replace { chain: Vec<Block>, fork_point: usize },
}

/// The process-wide state store.
///
/// Every mutation (admission, local mining, sync append, chain replacement)
/// runs under the single `writer` lock and goes load -> validate -> persist ->
/// swap, so readers of `state` never see a chain whose persisted balances
/// differ from it.
#[derive(Debug, Clone)]
pub struct Blockchain {
    state: Arc<RwLock<ChainState>>,

    writer: Arc<Mutex<()>>,

    /// Pending transactions to be included in the next block
    mempool: Arc<Mempool>,

    wallets: WalletTable,

    /// Storage for blockchain data
    storage: Option<Arc<BlockchainStorage>>,

    params: ChainParams,
}

impl Blockchain {
    /// Creates an in-memory node with an empty chain; genesis is mined like any block
    pub fn new(params: ChainParams) -> Self {
        Blockchain {
            state: Arc::new(RwLock::new(ChainState::default())),
            writer: Arc::new(Mutex::new(())),
            mempool: Arc::new(Mempool::new()),
            wallets: WalletTable::new(),
            storage: None,
            params,
        }
    }

    /// Opens persistent storage and restores chain, wallets and mempool.
    ///
    /// Balances are recomputed from the chain; cached wallet balances on disk
    /// are not trusted.
    pub fn with_storage<P: AsRef<Path>>(storage_path: P, params: ChainParams) -> Result<Self, BlockchainError> {
        let storage = BlockchainStorage::new(storage_path)?;

        let chain = storage.get_all_blocks()?;
        let ledger = if chain.is_empty() {
            info!("No existing blockchain found in storage, starting empty");
            Ledger::new()
        } else {
            let ledger = validate_chain(&chain, &params)?;
            info!("Loaded {} blocks from storage", chain.len());
            ledger
        };

        let wallets = WalletTable::from_records(storage.get_all_wallets()?);
        wallets.apply_refresh(wallets.refreshed(&ledger));

        let recorded = storage.get_block_height()?;
        if recorded != chain.len() as u64 {
            warn!("Recorded height {} differs from {} stored blocks", recorded, chain.len());
        }

        let mempool = Mempool::from_transactions(storage.load_mempool()?);
        let pruned = mempool.prune(&ledger);
        if pruned > 0 {
            info!("Pruned {} already mined transactions from the mempool", pruned);
        }

        Ok(Blockchain {
            state: Arc::new(RwLock::new(ChainState { chain, ledger })),
            writer: Arc::new(Mutex::new(())),
            mempool: Arc::new(mempool),
            wallets,
            storage: Some(Arc::new(storage)),
            params,
        })
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn storage(&self) -> Option<&Arc<BlockchainStorage>> {
        self.storage.as_ref()
    }

    fn read_state(&self) -> RwLockReadGuard<'_, ChainState> {
        self.state.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_writer(&self) -> Result<MutexGuard<'_, ()>, BlockchainError> {
        self.writer
            .lock()
            .map_err(|_| BlockchainError::SystemError("writer lock poisoned".to_string()))
    }

    /// Number of blocks in the chain
    pub fn height(&self) -> u64 {
        self.read_state().chain.len() as u64
    }

    /// Gets the entire blockchain
    pub fn get_chain(&self) -> Vec<Block> {
        self.read_state().chain.clone()
    }

    pub fn get_block(&self, index: u64) -> Option<Block> {
        self.read_state().chain.get(index as usize).cloned()
    }

    pub fn contains_block(&self, hash: &str) -> bool {
        self.read_state().chain.iter().any(|block| block.hash == hash)
    }

    /// Ledger balance of an address
    pub fn balance_of(&self, address: &Address) -> u64 {
        self.read_state().ledger.balance_of(address)
    }

    pub fn ledger_snapshot(&self) -> Ledger {
        self.read_state().ledger.clone()
    }

    pub fn circulating_supply(&self) -> u64 {
        self.read_state().ledger.circulating_supply()
    }

    /// Gets all pending transactions
    pub fn get_pending_transactions(&self) -> Vec<SignedTransaction> {
        self.mempool.snapshot()
    }

    /// Looks a transaction up by id, on chain first, then in the mempool
    pub fn find_transaction(&self, id: &str) -> Option<TransactionLocation> {
        {
            let state = self.read_state();
            for block in &state.chain {
                for transaction in &block.transactions {
                    if transaction.id().ok().as_deref() == Some(id) {
                        return Some(TransactionLocation {
                            transaction: transaction.clone(),
                            block_index: Some(block.index),
                        });
                    }
                }
            }
        }

        self.mempool
            .snapshot()
            .into_iter()
            .find(|tx| tx.id().ok().as_deref() == Some(id))
            .map(|tx| TransactionLocation {
                transaction: Transaction::Signed(tx),
                block_index: None,
            })
    }

    /// Validates the blockchain and checks the held balances against a
    /// fresh replay; an empty chain is trivially valid
    pub fn is_valid(&self) -> bool {
        let (chain, ledger) = {
            let state = self.read_state();
            (state.chain.clone(), state.ledger.clone())
        };
        if chain.is_empty() {
            return true;
        }

        validate_chain(&chain, &self.params).is_ok()
            && Ledger::recompute(&chain).map(|replayed| replayed == ledger).unwrap_or(false)
    }

    /// Admits a signed transaction to the mempool. Returns its id and fee.
    pub fn add_transaction(&self, transaction: SignedTransaction) -> Result<(String, u64), BlockchainError> {
        let _writer = self.lock_writer()?;
        let ledger = self.ledger_snapshot();

        let (stored, fee) = self.mempool.admit(transaction, &self.wallets, &ledger, &self.params)?;
        let id = stored.id()?;

        if let Some(storage) = &self.storage {
            if let Err(err) = storage.save_mempool(&self.mempool.snapshot()) {
                let mut pending = self.mempool.drain();
                pending.retain(|tx| tx.id().ok().as_deref() != Some(id.as_str()));
                self.mempool.restore(pending);
                return Err(err.into());
            }
        }

        info!("Admitted transaction {} from {} (fee {})", id, stored.from, fee);
        Ok((id, fee))
    }

    /// Generates a keypair held by this node
    pub fn create_wallet(&self, alias: Option<String>) -> Result<WalletRecord, BlockchainError> {
        let keypair = super::crypto::KeyPair::generate();
        self.store_wallet(WalletRecord::local(&keypair, alias))
    }

    /// Registers a public key whose private half lives with the client
    pub fn register_wallet(&self, public_key: &str, alias: Option<String>) -> Result<WalletRecord, BlockchainError> {
        let record = WalletRecord::external(public_key, alias)?;
        if let Some(existing) = self.wallets.public_key_of(&record.address) {
            if !existing.eq_ignore_ascii_case(public_key.trim()) {
                return Err(MempoolError::PublicKeyMismatch(record.address.0.clone()).into());
            }
        }

        self.store_wallet(record)
    }

    fn store_wallet(&self, mut record: WalletRecord) -> Result<WalletRecord, BlockchainError> {
        let _writer = self.lock_writer()?;
        record.cached_balance = self.balance_of(&record.address);
        let stored = self.wallets.upsert(record);

        if let Some(storage) = &self.storage {
            storage.save_wallet(&stored)?;
        }

        Ok(stored)
    }

    /// Wallet records with private keys removed
    pub fn list_wallets(&self) -> Vec<WalletRecord> {
        self.wallets.all().iter().map(WalletRecord::redacted).collect()
    }

    pub fn wallets(&self) -> &WalletTable {
        &self.wallets
    }

    /// Signs a transfer with a key held by this node and admits it
    pub fn send_from_wallet(&self, from: &Address, to: Address, value: u64) -> Result<(String, u64), BlockchainError> {
        let keypair = self
            .wallets
            .get(from)
            .and_then(|record| record.keypair())
            .ok_or_else(|| BlockchainError::NotFound(format!("no private key held for {}", from)))??;

        let transaction = SignedTransaction::from_intent(&keypair, TransactionIntent::new(to, value))?;
        self.add_transaction(transaction)
    }

    /// Assembles the next block from a snapshot of chain, ledger and mempool
    pub fn prepare_block(&self, miners: &[Address]) -> Result<BlockTemplate, BlockchainError> {
        let (chain, ledger) = {
            let state = self.read_state();
            (state.chain.clone(), state.ledger.clone())
        };
        let pending = self.mempool.snapshot();

        Ok(assemble(miners, &pending, &chain, &ledger, &self.params)?)
    }

    /// Mines a new block with the pending transactions.
    ///
    /// The proof-of-work search runs without any lock held and blocks the
    /// calling thread. If the chain moved on meanwhile the block is discarded
    /// with a `ConsensusConflict` and the mempool is left as it was.
    pub fn mine_block(&self, miners: &[Address]) -> Result<MinedBlock, BlockchainError> {
        let template = self.prepare_block(miners)?;
        let reward = template.reward;
        let block = mine(template.block);

        self.commit_mined(block.clone(), &template.considered)?;
        info!(
            "Mined block {} with hash {} (difficulty {}, reward {})",
            block.index, block.hash, block.difficulty, reward
        );

        Ok(MinedBlock { block, reward })
    }

    fn commit_mined(&self, block: Block, considered: &[String]) -> Result<(), BlockchainError> {
        let writer = self.lock_writer()?;
        let (ledger, previous_len) = self.validate_extension(&block)?;

        let drained = self.mempool.drain();
        let (_, carried) = partition_considered(drained.clone(), considered);
        let carried: Vec<SignedTransaction> = carried
            .into_iter()
            .filter(|tx| tx.id().map(|id| !ledger.contains_transaction(&id)).unwrap_or(false))
            .collect();

        if let Err(err) = self.commit(&writer, ChainUpdate::Extend(block), ledger, previous_len, &carried) {
            self.mempool.restore(drained);
            return Err(err);
        }

        self.mempool.restore(carried);
        Ok(())
    }

    /// Validates a block received from a peer and appends it if it extends the head
    pub fn append_block(&self, block: Block) -> Result<AppendOutcome, BlockchainError> {
        let writer = self.lock_writer()?;
        if self.contains_block(&block.hash) {
            return Ok(AppendOutcome::AlreadyKnown);
        }

        let (ledger, previous_len) = self.validate_extension(&block)?;
        let remaining = self.pending_after(&ledger);
        self.commit(&writer, ChainUpdate::Extend(block), ledger, previous_len, &remaining)?;
        self.mempool.prune(&self.read_state().ledger);

        Ok(AppendOutcome::Appended)
    }

    /// Adopts a validated candidate chain if it is still longer than ours.
    /// Returns whether the chain was replaced.
    pub fn replace_chain(&self, candidate: Vec<Block>, ledger: Ledger) -> Result<bool, BlockchainError> {
        let writer = self.lock_writer()?;
        let (previous_len, fork_point) = {
            let state = self.read_state();
            if candidate.len() <= state.chain.len() {
                return Ok(false);
            }

            let fork_point = state
                .chain
                .iter()
                .zip(candidate.iter())
                .take_while(|(ours, theirs)| ours.hash == theirs.hash)
                .count();
            (state.chain.len(), fork_point)
        };

        let remaining = self.pending_after(&ledger);
        let update = ChainUpdate::Replace {
            chain: candidate,
            fork_point,
        };
        self.commit(&writer, update, ledger, previous_len, &remaining)?;
        self.mempool.prune(&self.read_state().ledger);

        Ok(true)
    }

    /// Validates `block` on top of the current head. Returns the balances
    /// after it and the current chain length.
    fn validate_extension(&self, block: &Block) -> Result<(Ledger, usize), BlockchainError> {
        let state = self.read_state();
        let (expected_index, expected_previous) = match state.chain.last() {
            Some(last) => (last.index + 1, last.hash.as_str()),
            None => (0, GENESIS_PREVIOUS_HASH),
        };

        if block.index != expected_index || block.previous_hash != expected_previous {
            return Err(BlockchainError::ConsensusConflict(format!(
                "block {} does not extend the local head (height {})",
                block.index,
                state.chain.len()
            )));
        }

        let ledger = validate_block(block, &state.chain, &state.ledger, &self.params)?;
        Ok((ledger, state.chain.len()))
    }

    fn pending_after(&self, ledger: &Ledger) -> Vec<SignedTransaction> {
        self.mempool
            .snapshot()
            .into_iter()
            .filter(|tx| tx.id().map(|id| !ledger.contains_transaction(&id)).unwrap_or(false))
            .collect()
    }

    /// Persists and then publishes a new chain with its ledger. Requires the
    /// writer lock, witnessed by the guard.
    fn commit(
        &self,
        _writer: &MutexGuard<'_, ()>,
        update: ChainUpdate,
        ledger: Ledger,
        previous_len: usize,
        mempool: &[SignedTransaction],
    ) -> Result<(), BlockchainError> {
        let wallets = self.wallets.refreshed(&ledger);

        if let Some(storage) = &self.storage {
            let (blocks, new_len) = match &update {
                ChainUpdate::Extend(block) => (std::slice::from_ref(block), previous_len + 1),
                ChainUpdate::Replace { chain, fork_point } => (&chain[*fork_point..], chain.len()),
            };

            storage
                .commit_chain(&ChainCommit {
                    blocks,
                    new_len,
                    previous_len,
                    wallets: &wallets,
                    mempool,
                })
                .map_err(|err| {
                    warn!("Failed to persist chain mutation: {}", err);
                    err
                })?;
        }

        {
            let mut state = self
                .state
                .write()
                .map_err(|_| BlockchainError::SystemError("chain state lock poisoned".to_string()))?;
            match update {
                ChainUpdate::Extend(block) => state.chain.push(block),
                ChainUpdate::Replace { chain, .. } => state.chain = chain,
            }
            state.ledger = ledger;
        }
        self.wallets.apply_refresh(wallets);

        Ok(())
    }
}
