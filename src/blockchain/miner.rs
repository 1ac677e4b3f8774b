use log::debug;
use thiserror::Error;

use super::block::{Block, HashPreimage, GENESIS_PREVIOUS_HASH};
use super::crypto::Address;
use super::difficulty::adjust_difficulty;
use super::economics::{split_reward, ChainParams};
use super::ledger::Ledger;
use super::transaction::{CoinbaseTransaction, SignedTransaction, Transaction};
use super::validator::validate_transaction;

/// Errors that can occur while assembling a block
#[derive(Debug, Error)]
pub enum MinerError {
    #[error("At least one miner address is required")]
    NoMinerAddresses,

    #[error("Invalid miner address: {0}")]
    InvalidMinerAddress(String),
}

/// An assembled, not yet mined block
#[derive(Debug, Clone)]
pub struct BlockTemplate {
    pub block: Block,

    /// Total reward minted by the coinbase transactions
    pub reward: u64,

    /// Ids of every pending transaction looked at, included or dropped
    pub considered: Vec<String>,
}

/// Builds the next block on top of `chain`.
///
/// Pending transactions are taken in order and re-checked against a copy of
/// `ledger` that already carries the earlier picks; any that fail are dropped.
/// One coinbase per miner follows, each paying an equal share of subsidy plus
/// fees (remainder unpaid).
pub fn assemble(
    miners: &[Address],
    pending: &[SignedTransaction],
    chain: &[Block],
    ledger: &Ledger,
    params: &ChainParams,
) -> Result<BlockTemplate, MinerError> {
    if miners.is_empty() {
        return Err(MinerError::NoMinerAddresses);
    }
    if let Some(bad) = miners.iter().find(|address| !address.is_well_formed()) {
        return Err(MinerError::InvalidMinerAddress(bad.0.clone()));
    }

    let mut simulated = ledger.clone();
    let mut transactions = Vec::with_capacity(pending.len() + miners.len());
    let mut considered = Vec::with_capacity(pending.len());
    let mut total_fees: u64 = 0;

    for tx in pending {
        if let Ok(id) = tx.id() {
            considered.push(id);
        }

        if let Err(err) = validate_transaction(tx, &simulated, params) {
            debug!("Dropping pending transaction from {}: {}", tx.from, err);
            continue;
        }

        let transaction = Transaction::Signed(tx.clone());
        if let Err(err) = simulated.apply(&transaction) {
            debug!("Dropping pending transaction from {}: {}", tx.from, err);
            continue;
        }

        total_fees = total_fees.saturating_add(tx.fee);
        transactions.push(transaction);
    }

    let (index, previous_hash) = match chain.last() {
        Some(last) => (last.index + 1, last.hash.clone()),
        None => (0, GENESIS_PREVIOUS_HASH.to_string()),
    };

    let reward = params.block_reward(index, ledger.circulating_supply(), total_fees);
    let share = split_reward(reward, miners.len());

    let mut block = Block::new(index, previous_hash, Vec::new(), adjust_difficulty(chain, params));
    for miner in miners {
        transactions.push(Transaction::Coinbase(CoinbaseTransaction::new(
            miner.clone(),
            share,
            block.timestamp,
        )));
    }
    block.transactions = transactions;

    Ok(BlockTemplate {
        block,
        reward: share * miners.len() as u64,
        considered,
    })
}

/// Searches nonces from 0 until the hash meets the block's difficulty.
///
/// Blocks the calling thread; expected work grows as 16^difficulty.
pub fn mine(mut block: Block) -> Block {
    let preimage = HashPreimage::new(&block);
    let target = "0".repeat(block.difficulty as usize);

    let mut nonce: u64 = 0;
    loop {
        let hash = preimage.hash(nonce);
        if hash.starts_with(&target) {
            block.nonce = nonce;
            block.hash = hash;
            return block;
        }

        nonce += 1;
    }
}
