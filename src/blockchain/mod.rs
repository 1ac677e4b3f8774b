// Blockchain module
//
// This module contains the core chain implementation including:
// - Block and transaction structures
// - Cryptography utilities and canonical encoding
// - Ledger, wallet table and mempool
// - Economics, difficulty and proof of work
// - Validation and persistent storage

pub mod block;
pub mod canonical;
pub mod chain;
pub mod crypto;
pub mod difficulty;
pub mod economics;
pub mod ledger;
pub mod mempool;
pub mod miner;
pub mod storage;
pub mod transaction;
pub mod validator;
pub mod wallet;

// Re-export main components for easier access
pub use block::Block;
pub use chain::{AppendOutcome, Blockchain, BlockchainError};
pub use crypto::Address;
pub use economics::ChainParams;
pub use transaction::SignedTransaction;
pub use validator::validate_chain;
