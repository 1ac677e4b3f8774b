use std::path::Path;

use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{Db, Transactional, Tree};
use thiserror::Error;

use super::block::Block;
use super::transaction::SignedTransaction;
use super::wallet::WalletRecord;

const MEMPOOL_KEY: &str = "mempool";
const PEERS_KEY: &str = "peers";
const HEIGHT_KEY: &str = "block_height";

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sled::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    #[error("Transaction aborted: {0}")]
    Aborted(String),
}

/// One chain mutation written atomically: new blocks, the refreshed wallet
/// table and the mempool that remains
pub struct ChainCommit<'a> {
    /// Blocks (re)written, keyed by their own index
    pub blocks: &'a [Block],

    /// Chain length after the mutation
    pub new_len: usize,

    /// Length of the persisted chain before the mutation; entries past the new
    /// length are removed
    pub previous_len: usize,

    pub wallets: &'a [WalletRecord],

    pub mempool: &'a [SignedTransaction],
}

/// Storage for blockchain data
pub struct BlockchainStorage {
    /// The database instance
    db: Db,

    /// Index (big-endian) -> block
    blocks: Tree,

    /// Address -> wallet record
    wallets: Tree,

    /// Mempool, peer set and chain height documents
    metadata: Tree,
}

impl std::fmt::Debug for BlockchainStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockchainStorage").finish()
    }
}

fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec(value).map_err(|e| StorageError::SerializationError(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    serde_json::from_slice(bytes).map_err(|e| StorageError::DeserializationError(e.to_string()))
}

fn block_key(index: u64) -> [u8; 8] {
    index.to_be_bytes()
}

impl BlockchainStorage {
    /// Opens (or creates) the database at `path`
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;

        let blocks = db.open_tree("blocks")?;
        let wallets = db.open_tree("wallets")?;
        let metadata = db.open_tree("metadata")?;

        Ok(Self {
            db,
            blocks,
            wallets,
            metadata,
        })
    }

    /// Writes a chain mutation in one transaction across all trees
    pub fn commit_chain(&self, commit: &ChainCommit<'_>) -> Result<(), StorageError> {
        let mut block_entries = Vec::with_capacity(commit.blocks.len());
        for block in commit.blocks {
            block_entries.push((block_key(block.index), encode(block)?));
        }

        let stale_keys: Vec<[u8; 8]> = (commit.new_len..commit.previous_len)
            .map(|index| block_key(index as u64))
            .collect();

        let mut wallet_entries = Vec::with_capacity(commit.wallets.len());
        for record in commit.wallets {
            wallet_entries.push((record.address.0.as_bytes().to_vec(), encode(record)?));
        }

        let mempool = encode(commit.mempool)?;
        let height = bincode::serialize(&(commit.new_len as u64))
            .map_err(|e| StorageError::SerializationError(e.to_string()))?;

        let result: Result<(), TransactionError<()>> = (&self.blocks, &self.wallets, &self.metadata)
            .transaction(|(blocks, wallets, metadata)| {
                for (key, value) in &block_entries {
                    blocks.insert(&key[..], value.as_slice())?;
                }
                for key in &stale_keys {
                    blocks.remove(&key[..])?;
                }
                for (key, value) in &wallet_entries {
                    wallets.insert(key.as_slice(), value.as_slice())?;
                }
                metadata.insert(MEMPOOL_KEY, mempool.as_slice())?;
                metadata.insert(HEIGHT_KEY, height.as_slice())?;
                Ok::<(), ConflictableTransactionError<()>>(())
            });

        match result {
            Ok(()) => self.flush(),
            Err(TransactionError::Storage(e)) => Err(StorageError::DatabaseError(e)),
            Err(TransactionError::Abort(())) => Err(StorageError::Aborted("chain commit".to_string())),
        }
    }

    /// Gets all blocks in the chain, ordered by index
    pub fn get_all_blocks(&self) -> Result<Vec<Block>, StorageError> {
        let mut blocks = Vec::new();
        // Big-endian keys iterate in index order
        for result in self.blocks.iter() {
            let (_, value) = result?;
            blocks.push(decode::<Block>(&value)?);
        }

        Ok(blocks)
    }

    /// Gets every stored wallet record, skipping unreadable ones
    pub fn get_all_wallets(&self) -> Result<Vec<WalletRecord>, StorageError> {
        let mut wallets = Vec::new();
        let mut deserialization_errors = Vec::new();

        for result in self.wallets.iter() {
            let (key, value) = result?;
            match decode::<WalletRecord>(&value) {
                Ok(record) => wallets.push(record),
                Err(e) => {
                    let key_str = String::from_utf8_lossy(key.as_ref()).to_string();
                    deserialization_errors.push(format!("{}: {}", key_str, e));
                }
            }
        }

        if !deserialization_errors.is_empty() {
            warn!(
                "Some wallet records could not be deserialized: {}",
                deserialization_errors.join(", ")
            );
        }

        Ok(wallets)
    }

    /// Saves a single wallet record
    pub fn save_wallet(&self, record: &WalletRecord) -> Result<(), StorageError> {
        self.wallets.insert(record.address.0.as_bytes(), encode(record)?)?;
        self.flush()
    }

    pub fn load_mempool(&self) -> Result<Vec<SignedTransaction>, StorageError> {
        self.load_document(MEMPOOL_KEY)
    }

    pub fn save_mempool(&self, pending: &[SignedTransaction]) -> Result<(), StorageError> {
        self.metadata.insert(MEMPOOL_KEY, encode(pending)?)?;
        self.flush()
    }

    pub fn load_peers(&self) -> Result<Vec<String>, StorageError> {
        self.load_document(PEERS_KEY)
    }

    pub fn save_peers(&self, peers: &[String]) -> Result<(), StorageError> {
        self.metadata.insert(PEERS_KEY, encode(peers)?)?;
        self.flush()
    }

    /// Gets the persisted chain length
    pub fn get_block_height(&self) -> Result<u64, StorageError> {
        match self.metadata.get(HEIGHT_KEY)? {
            Some(value) => bincode::deserialize(&value)
                .map_err(|e| StorageError::DeserializationError(e.to_string())),
            None => Ok(0),
        }
    }

    fn load_document<T: DeserializeOwned>(&self, key: &str) -> Result<Vec<T>, StorageError> {
        match self.metadata.get(key)? {
            Some(value) => decode(&value),
            None => Ok(Vec::new()),
        }
    }

    /// Flushes all pending writes to disk
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::KeyPair;
    use crate::blockchain::transaction::{CoinbaseTransaction, Transaction};
    use tempfile::tempdir;

    fn block(index: u64) -> Block {
        let miner = KeyPair::generate();
        Block::new(
            index,
            String::new(),
            vec![Transaction::Coinbase(CoinbaseTransaction::new(miner.address().clone(), 5, 0))],
            1,
        )
    }

    fn bare_commit(chain: &[Block], previous_len: usize) -> ChainCommit<'_> {
        ChainCommit {
            blocks: chain,
            new_len: chain.len(),
            previous_len,
            wallets: &[],
            mempool: &[],
        }
    }

    #[test]
    fn test_commit_and_reload() {
        let dir = tempdir().unwrap();
        let storage = BlockchainStorage::new(dir.path()).unwrap();
        let chain: Vec<Block> = (0..3).map(block).collect();
        let keypair = KeyPair::generate();
        let wallets = vec![WalletRecord::local(&keypair, Some("me".into()))];

        storage
            .commit_chain(&ChainCommit {
                blocks: &chain,
                new_len: chain.len(),
                previous_len: 0,
                wallets: &wallets,
                mempool: &[],
            })
            .unwrap();

        assert_eq!(storage.get_all_blocks().unwrap(), chain);
        assert_eq!(storage.get_all_wallets().unwrap(), wallets);
        assert_eq!(storage.get_block_height().unwrap(), 3);
        assert!(storage.load_mempool().unwrap().is_empty());
    }

    #[test]
    fn test_replacement_removes_stale_blocks() {
        let dir = tempdir().unwrap();
        let storage = BlockchainStorage::new(dir.path()).unwrap();
        let long: Vec<Block> = (0..5).map(block).collect();
        let short: Vec<Block> = (0..2).map(block).collect();

        storage.commit_chain(&bare_commit(&long, 0)).unwrap();
        storage.commit_chain(&bare_commit(&short, 5)).unwrap();

        assert_eq!(storage.get_all_blocks().unwrap(), short);
    }

    #[test]
    fn test_append_writes_only_the_new_block() {
        let dir = tempdir().unwrap();
        let storage = BlockchainStorage::new(dir.path()).unwrap();
        let chain: Vec<Block> = (0..3).map(block).collect();

        storage.commit_chain(&bare_commit(&chain[..2], 0)).unwrap();
        storage
            .commit_chain(&ChainCommit {
                blocks: &chain[2..],
                new_len: 3,
                previous_len: 2,
                wallets: &[],
                mempool: &[],
            })
            .unwrap();

        assert_eq!(storage.get_all_blocks().unwrap(), chain);
        assert_eq!(storage.get_block_height().unwrap(), 3);
    }

    #[test]
    fn test_peers_and_mempool_documents() {
        let dir = tempdir().unwrap();
        let storage = BlockchainStorage::new(dir.path()).unwrap();
        let peers = vec!["http://a:8000".to_string(), "http://b:8000".to_string()];
        storage.save_peers(&peers).unwrap();

        let sender = KeyPair::generate();
        let tx = SignedTransaction::new(&sender, KeyPair::generate().address().clone(), 3).unwrap();
        storage.save_mempool(&[tx.clone()]).unwrap();

        assert_eq!(storage.load_peers().unwrap(), peers);
        assert_eq!(storage.load_mempool().unwrap(), vec![tx]);
    }
}
