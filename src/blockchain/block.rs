use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::canonical::to_canonical_string;
use super::transaction::Transaction;

/// `previousHash` of the genesis block
pub const GENESIS_PREVIOUS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Represents a block in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Index of the block in the chain
    pub index: u64,

    /// Hash of the previous block
    pub previous_hash: String,

    /// Unix timestamp (seconds) when the block was assembled
    pub timestamp: i64,

    /// Transactions included in this block, signed transfers first
    pub transactions: Vec<Transaction>,

    /// Proof of work
    pub nonce: u64,

    /// Required number of leading zero hex digits
    pub difficulty: u32,

    /// Hash of the block (calculated)
    pub hash: String,
}

impl Block {
    /// Creates an unmined block with nonce 0
    pub fn new(
        index: u64,
        previous_hash: String,
        transactions: Vec<Transaction>,
        difficulty: u32,
    ) -> Self {
        let mut block = Block {
            index,
            previous_hash,
            timestamp: Utc::now().timestamp(),
            transactions,
            nonce: 0,
            difficulty,
            hash: String::new(),
        };

        block.hash = block.calculate_hash();
        block
    }

    /// Calculates the hash of the block over its canonical header
    pub fn calculate_hash(&self) -> String {
        HashPreimage::new(self).hash(self.nonce)
    }
}

/// Whether a hex hash starts with at least `difficulty` zeros
pub fn meets_difficulty(hash: &str, difficulty: u32) -> bool {
    let difficulty = difficulty as usize;
    hash.len() >= difficulty && hash.bytes().take(difficulty).all(|b| b == b'0')
}

/// Canonical header of a block split around the nonce.
///
/// Keys of the canonical header sort as `difficulty, index, nonce,
/// previousHash, timestamp, transactions`, so everything except the nonce can
/// be serialized once and the nonce spliced in per attempt.
pub struct HashPreimage {
    prefix: Sha256,
    suffix: String,
}

impl HashPreimage {
    pub fn new(block: &Block) -> Self {
        let prefix = format!(
            "{{\"difficulty\":{},\"index\":{},\"nonce\":",
            block.difficulty, block.index
        );

        // Only strings and integers live here, serialization cannot fail
        let previous_hash = to_canonical_string(&block.previous_hash).unwrap_or_default();
        let transactions = to_canonical_string(&block.transactions).unwrap_or_default();
        let suffix = format!(
            ",\"previousHash\":{},\"timestamp\":{},\"transactions\":{}}}",
            previous_hash, block.timestamp, transactions
        );

        let mut hasher = Sha256::new();
        hasher.update(prefix.as_bytes());

        HashPreimage { prefix: hasher, suffix }
    }

    /// Hex SHA-256 of the canonical header with the given nonce
    pub fn hash(&self, nonce: u64) -> String {
        let mut hasher = self.prefix.clone();
        hasher.update(nonce.to_string().as_bytes());
        hasher.update(self.suffix.as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::canonical::sha256_hex;
    use crate::blockchain::crypto::Address;
    use crate::blockchain::transaction::CoinbaseTransaction;

    fn coinbase(value: u64) -> Transaction {
        Transaction::Coinbase(CoinbaseTransaction::new(Address("Wminer".to_string()), value, 7))
    }

    #[test]
    fn test_new_block() {
        let block = Block::new(1, "previous_hash".to_string(), vec![coinbase(10), coinbase(20)], 1);

        assert_eq!(block.index, 1);
        assert_eq!(block.nonce, 0);
        assert_eq!(block.previous_hash, "previous_hash");
        assert_eq!(block.hash.len(), 64); // SHA-256 hash is 64 characters in hex
    }

    #[test]
    fn test_hash_matches_canonical_header() {
        let mut block = Block::new(3, GENESIS_PREVIOUS_HASH.to_string(), vec![coinbase(10)], 2);
        block.nonce = 4242;

        let header = serde_json::json!({
            "index": block.index,
            "previousHash": block.previous_hash,
            "timestamp": block.timestamp,
            "transactions": block.transactions,
            "nonce": block.nonce,
            "difficulty": block.difficulty,
        });
        let expected = sha256_hex(to_canonical_string(&header).unwrap().as_bytes());

        assert_eq!(block.calculate_hash(), expected);
    }

    #[test]
    fn test_hash_covers_every_field() {
        let block = Block::new(1, "p".to_string(), vec![coinbase(10)], 1);

        let mut changed = block.clone();
        changed.difficulty = 2;
        assert_ne!(block.calculate_hash(), changed.calculate_hash());

        let mut changed = block.clone();
        changed.transactions = vec![coinbase(11)];
        assert_ne!(block.calculate_hash(), changed.calculate_hash());

        let mut changed = block.clone();
        changed.nonce = 1;
        assert_ne!(block.calculate_hash(), changed.calculate_hash());
    }

    #[test]
    fn test_meets_difficulty() {
        assert!(meets_difficulty("00ab", 2));
        assert!(meets_difficulty("00ab", 0));
        assert!(!meets_difficulty("0a0b", 2));
        assert!(!meets_difficulty("00", 3));
    }
}
