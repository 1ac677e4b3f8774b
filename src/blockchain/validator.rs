use thiserror::Error;

use super::block::{meets_difficulty, Block, GENESIS_PREVIOUS_HASH};
use super::difficulty::adjust_difficulty;
use super::economics::ChainParams;
use super::ledger::{Ledger, LedgerError};
use super::transaction::{SignedTransaction, Transaction, TransactionError, COINBASE_SENDER};

/// Reasons a transaction, block or chain is rejected
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Block {index}: stored hash {stored} does not match computed {computed}")]
    HashMismatch {
        index: u64,
        stored: String,
        computed: String,
    },

    #[error("Block {index}: hash does not meet difficulty {difficulty}")]
    InsufficientWork { index: u64, difficulty: u32 },

    #[error("Block {index}: declared difficulty {declared}, expected {expected}")]
    UnexpectedDifficulty {
        index: u64,
        declared: u32,
        expected: u32,
    },

    #[error("Block {index}: {reason}")]
    BrokenLink { index: u64, reason: String },

    #[error("Invalid transaction: {0}")]
    InvalidTransaction(#[from] TransactionError),

    #[error("Fee mismatch: declared {declared}, expected {expected}")]
    FeeMismatch { declared: u64, expected: u64 },

    #[error("Transaction {0} is already included in the chain")]
    DuplicateTransaction(String),

    #[error("Invalid coinbase: {0}")]
    InvalidCoinbase(String),

    #[error("Block {index}: coinbase pays {paid}, at most {allowed} allowed")]
    ExcessiveReward { index: u64, paid: u64, allowed: u64 },

    #[error("{0}")]
    Ledger(#[from] LedgerError),

    #[error("Chain is empty")]
    EmptyChain,
}

/// Stateless and replay checks for a signed transaction against a ledger:
/// sender binding, signature, size-derived fee and inclusion.
pub fn validate_transaction(
    tx: &SignedTransaction,
    ledger: &Ledger,
    params: &ChainParams,
) -> Result<(), ValidationError> {
    tx.verify()?;

    let expected = params.fee_for(tx)?;
    if tx.fee != expected {
        return Err(ValidationError::FeeMismatch {
            declared: tx.fee,
            expected,
        });
    }

    let id = tx.id()?;
    if ledger.contains_transaction(&id) {
        return Err(ValidationError::DuplicateTransaction(id));
    }

    Ok(())
}

/// Validates `block` as the successor of `prefix`, where `ledger` holds the
/// balances after `prefix`. Returns the balances after `block`; nothing is
/// modified on failure.
pub fn validate_block(
    block: &Block,
    prefix: &[Block],
    ledger: &Ledger,
    params: &ChainParams,
) -> Result<Ledger, ValidationError> {
    let mut next = ledger.clone();
    apply_block(block, prefix, &mut next, params)?;
    Ok(next)
}

/// Validates a whole chain from genesis, replaying balances from zero.
/// Returns the resulting ledger.
pub fn validate_chain(chain: &[Block], params: &ChainParams) -> Result<Ledger, ValidationError> {
    if chain.is_empty() {
        return Err(ValidationError::EmptyChain);
    }

    // One running ledger; a failure discards it along with the candidate
    let mut ledger = Ledger::new();
    for (i, block) in chain.iter().enumerate() {
        apply_block(block, &chain[..i], &mut ledger, params)?;
    }

    Ok(ledger)
}

/// Checks `block` against `prefix` and applies it to `ledger` in place.
/// On error `ledger` may hold part of the block.
fn apply_block(
    block: &Block,
    prefix: &[Block],
    ledger: &mut Ledger,
    params: &ChainParams,
) -> Result<(), ValidationError> {
    let computed = block.calculate_hash();
    if computed != block.hash {
        return Err(ValidationError::HashMismatch {
            index: block.index,
            stored: block.hash.clone(),
            computed,
        });
    }

    if !meets_difficulty(&block.hash, block.difficulty) {
        return Err(ValidationError::InsufficientWork {
            index: block.index,
            difficulty: block.difficulty,
        });
    }

    let expected = adjust_difficulty(prefix, params);
    if block.difficulty != expected {
        return Err(ValidationError::UnexpectedDifficulty {
            index: block.index,
            declared: block.difficulty,
            expected,
        });
    }

    check_link(block, prefix.last())?;

    let minted_before = ledger.circulating_supply();
    let mut fees: u64 = 0;
    let mut paid: u64 = 0;

    for transaction in &block.transactions {
        match transaction {
            Transaction::Signed(signed) => {
                validate_transaction(signed, ledger, params)?;
                fees = fees.saturating_add(signed.fee);
            }
            Transaction::Coinbase(coinbase) => {
                if coinbase.from != COINBASE_SENDER {
                    return Err(ValidationError::InvalidCoinbase(format!(
                        "sender must be {}, got {}",
                        COINBASE_SENDER, coinbase.from
                    )));
                }
                if !coinbase.to.is_well_formed() {
                    return Err(ValidationError::InvalidCoinbase(format!(
                        "malformed recipient {}",
                        coinbase.to
                    )));
                }
                paid = paid.saturating_add(coinbase.value);
            }
        }

        // Transactions are ordered: later ones may spend what earlier ones credited
        ledger.apply(transaction)?;
    }

    let allowed = params.block_reward(block.index, minted_before, fees);
    if paid > allowed {
        return Err(ValidationError::ExcessiveReward {
            index: block.index,
            paid,
            allowed,
        });
    }

    Ok(())
}

fn check_link(block: &Block, previous: Option<&Block>) -> Result<(), ValidationError> {
    match previous {
        None => {
            if block.index != 0 {
                return Err(ValidationError::BrokenLink {
                    index: block.index,
                    reason: "genesis must have index 0".to_string(),
                });
            }
            if block.previous_hash != GENESIS_PREVIOUS_HASH {
                return Err(ValidationError::BrokenLink {
                    index: block.index,
                    reason: "genesis previousHash must be all zeros".to_string(),
                });
            }
        }
        Some(previous) => {
            if block.index != previous.index + 1 {
                return Err(ValidationError::BrokenLink {
                    index: block.index,
                    reason: format!("expected index {}", previous.index + 1),
                });
            }
            if block.previous_hash != previous.hash {
                return Err(ValidationError::BrokenLink {
                    index: block.index,
                    reason: "previousHash does not match the previous block".to_string(),
                });
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::{Address, DigitalSignature, KeyPair};
    use crate::blockchain::miner::{assemble, mine};

    fn params() -> ChainParams {
        ChainParams {
            initial_reward: 1_000_000,
            fee_rate: 1,
            ..ChainParams::default()
        }
    }

    fn mine_on(chain: &mut Vec<Block>, miner: &Address, pending: &[SignedTransaction], params: &ChainParams) {
        let ledger = Ledger::recompute(chain).unwrap();
        let template = assemble(&[miner.clone()], pending, chain, &ledger, params).unwrap();
        chain.push(mine(template.block));
    }

    fn signed(from: &KeyPair, to: &Address, value: u64, params: &ChainParams) -> SignedTransaction {
        let mut tx = SignedTransaction::new(from, to.clone(), value).unwrap();
        tx.fee = params.fee_for(&tx).unwrap();
        tx
    }

    #[test]
    fn test_valid_chain() {
        let params = params();
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mut chain = Vec::new();
        mine_on(&mut chain, alice.address(), &[], &params);
        mine_on(&mut chain, bob.address(), &[signed(&alice, bob.address(), 1_000, &params)], &params);

        let ledger = validate_chain(&chain, &params).unwrap();
        assert_eq!(ledger, Ledger::recompute(&chain).unwrap());
    }

    #[test]
    fn test_empty_chain_is_not_a_candidate() {
        assert!(matches!(validate_chain(&[], &params()), Err(ValidationError::EmptyChain)));
    }

    #[test]
    fn test_tampered_transaction_breaks_hash() {
        let params = params();
        let alice = KeyPair::generate();
        let mut chain = Vec::new();
        mine_on(&mut chain, alice.address(), &[], &params);

        if let Transaction::Coinbase(coinbase) = &mut chain[0].transactions[0] {
            coinbase.value += 1;
        }

        assert!(matches!(
            validate_chain(&chain, &params),
            Err(ValidationError::HashMismatch { .. })
        ));
    }

    #[test]
    fn test_insufficient_work_is_rejected() {
        let params = params();
        let miner = KeyPair::generate();
        let ledger = Ledger::new();
        let template = assemble(&[miner.address().clone()], &[], &[], &ledger, &params).unwrap();

        // Find a nonce whose hash does not start with zero; hash stays consistent
        let mut block = template.block;
        loop {
            block.hash = block.calculate_hash();
            if !block.hash.starts_with('0') {
                break;
            }
            block.nonce += 1;
        }

        assert!(matches!(
            validate_block(&block, &[], &ledger, &params),
            Err(ValidationError::InsufficientWork { .. })
        ));
    }

    #[test]
    fn test_declared_difficulty_must_match_schedule() {
        let params = params();
        let miner = KeyPair::generate();
        let ledger = Ledger::new();
        let mut template = assemble(&[miner.address().clone()], &[], &[], &ledger, &params).unwrap();
        template.block.difficulty = 2;
        let block = mine(template.block);

        assert!(matches!(
            validate_block(&block, &[], &ledger, &params),
            Err(ValidationError::UnexpectedDifficulty { declared: 2, expected: 1, .. })
        ));
    }

    /// Mines the next block with a fixed timestamp
    fn mine_at(chain: &mut Vec<Block>, miner: &Address, timestamp: i64, params: &ChainParams) {
        let ledger = Ledger::recompute(chain).unwrap();
        let mut template = assemble(&[miner.clone()], &[], chain, &ledger, params).unwrap();
        template.block.timestamp = timestamp;
        chain.push(mine(template.block));
    }

    #[test]
    fn test_declared_difficulty_checked_after_retarget() {
        let params = ChainParams {
            block_time: 60,
            adjustment_interval: 2,
            ..params()
        };
        let miner = KeyPair::generate();
        let mut chain = Vec::new();
        for second in 0..3 {
            mine_at(&mut chain, miner.address(), 1_000 + second, &params);
        }
        assert_eq!(adjust_difficulty(&chain, &params), 2);

        let ledger = validate_chain(&chain, &params).unwrap();
        let mut template = assemble(&[miner.address().clone()], &[], &chain, &ledger, &params).unwrap();
        assert_eq!(template.block.difficulty, 2);

        template.block.difficulty = 1;
        let understated = mine(template.block);
        assert!(matches!(
            validate_block(&understated, &chain, &ledger, &params),
            Err(ValidationError::UnexpectedDifficulty { declared: 1, expected: 2, .. })
        ));

        mine_at(&mut chain, miner.address(), 1_003, &params);
        assert_eq!(chain[3].difficulty, 2);
        assert!(validate_chain(&chain, &params).is_ok());
    }

    #[test]
    fn test_extreme_peer_timestamps_are_validated() {
        let params = ChainParams {
            adjustment_interval: 2,
            ..params()
        };
        let miner = KeyPair::generate();
        let mut chain = Vec::new();
        for timestamp in [i64::MIN, 0, i64::MAX, i64::MIN] {
            mine_at(&mut chain, miner.address(), timestamp, &params);
        }

        assert!(validate_chain(&chain, &params).is_ok());
    }

    #[test]
    fn test_broken_link_is_rejected() {
        let params = params();
        let miner = KeyPair::generate();
        let mut chain = Vec::new();
        mine_on(&mut chain, miner.address(), &[], &params);
        mine_on(&mut chain, miner.address(), &[], &params);

        let ledger = Ledger::recompute(&chain[..1]).unwrap();
        let mut orphan = chain[1].clone();
        orphan.previous_hash = "f".repeat(64);
        let orphan = mine(orphan);

        assert!(matches!(
            validate_block(&orphan, &chain[..1], &ledger, &params),
            Err(ValidationError::BrokenLink { .. })
        ));
    }

    #[test]
    fn test_forged_signature_is_rejected() {
        let params = params();
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mut tx = signed(&alice, bob.address(), 10, &params);
        tx.signature = DigitalSignature(hex::encode([7u8; 64]));

        assert!(validate_transaction(&tx, &Ledger::new(), &params).is_err());
    }

    #[test]
    fn test_spending_earlier_credit_in_same_block() {
        let params = params();
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let carol = KeyPair::generate();
        let mut chain = Vec::new();
        mine_on(&mut chain, alice.address(), &[], &params);

        // Bob starts at zero and forwards what Alice sends him
        let pending = vec![
            signed(&alice, bob.address(), 50_000, &params),
            signed(&bob, carol.address(), 10_000, &params),
        ];
        mine_on(&mut chain, alice.address(), &pending, &params);

        assert_eq!(chain[1].transactions.len(), 3);
        let ledger = validate_chain(&chain, &params).unwrap();
        assert_eq!(ledger.balance_of(carol.address()), 10_000);
    }

    #[test]
    fn test_inflated_coinbase_is_rejected() {
        let params = params();
        let miner = KeyPair::generate();
        let ledger = Ledger::new();
        let mut template = assemble(&[miner.address().clone()], &[], &[], &ledger, &params).unwrap();
        if let Transaction::Coinbase(coinbase) = &mut template.block.transactions[0] {
            coinbase.value += 1;
        }
        let block = mine(template.block);

        assert!(matches!(
            validate_block(&block, &[], &ledger, &params),
            Err(ValidationError::ExcessiveReward { .. })
        ));
    }

    #[test]
    fn test_replayed_transaction_is_rejected() {
        let params = params();
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let mut chain = Vec::new();
        mine_on(&mut chain, alice.address(), &[], &params);
        let tx = signed(&alice, bob.address(), 10, &params);
        mine_on(&mut chain, alice.address(), &[tx.clone()], &params);

        let ledger = Ledger::recompute(&chain).unwrap();
        assert!(matches!(
            validate_transaction(&tx, &ledger, &params),
            Err(ValidationError::DuplicateTransaction(_))
        ));
    }
}
