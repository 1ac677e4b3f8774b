//! Consensus constants and the fee/reward arithmetic that depends on them.
//!
//! Every node on a network must run with identical [`ChainParams`]; fee and
//! reward amounts are part of block validity.

use super::transaction::{SignedTransaction, TransactionError};

/// Minor units per coin
pub const UNITS_PER_COIN: u64 = 100_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainParams {
    /// Target seconds between blocks
    pub block_time: i64,

    /// Number of blocks between difficulty comparisons
    pub adjustment_interval: usize,

    /// Difficulty of every block before the first adjustment
    pub initial_difficulty: u32,

    /// Block subsidy at height 0, in minor units
    pub initial_reward: u64,

    /// Blocks between subsidy halvings
    pub halving_interval: u64,

    /// Supply cap, in minor units
    pub max_supply: u64,

    /// Fee per byte of the canonical transaction body
    pub fee_rate: u64,
}

impl Default for ChainParams {
    fn default() -> Self {
        ChainParams {
            block_time: 600,
            adjustment_interval: 2016,
            initial_difficulty: 1,
            initial_reward: 50 * UNITS_PER_COIN,
            halving_interval: 210_000,
            max_supply: 20_000_000 * UNITS_PER_COIN,
            fee_rate: 10,
        }
    }
}

impl ChainParams {
    /// Fee owed by a signed transaction: canonical body size times the fee rate
    pub fn fee_for(&self, tx: &SignedTransaction) -> Result<u64, TransactionError> {
        let size = tx.body_bytes()?.len() as u64;
        size.checked_mul(self.fee_rate)
            .ok_or_else(|| TransactionError::InvalidAmount("fee overflows".to_string()))
    }

    /// Newly minted coins for a block at `height`, given what is already in circulation
    pub fn subsidy(&self, height: u64, minted: u64) -> u64 {
        if minted >= self.max_supply {
            return 0;
        }

        let halvings = height / self.halving_interval.max(1);
        let scheduled = if halvings >= 64 {
            0
        } else {
            self.initial_reward >> halvings
        };

        scheduled.min(self.max_supply - minted)
    }

    /// Total reward (subsidy plus collected fees) for a block at `height`
    pub fn block_reward(&self, height: u64, minted: u64, total_fees: u64) -> u64 {
        self.subsidy(height, minted).saturating_add(total_fees)
    }
}

/// Splits a reward evenly; the remainder of the division is not paid out
pub fn split_reward(reward: u64, miners: usize) -> u64 {
    if miners == 0 {
        return 0;
    }

    reward / miners as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::KeyPair;

    #[test]
    fn test_subsidy_halves() {
        let params = ChainParams::default();

        assert_eq!(params.subsidy(0, 0), 50 * UNITS_PER_COIN);
        assert_eq!(params.subsidy(209_999, 0), 50 * UNITS_PER_COIN);
        assert_eq!(params.subsidy(210_000, 0), 25 * UNITS_PER_COIN);
        assert_eq!(params.subsidy(420_000, 0), 1_250_000_000);
        assert_eq!(params.subsidy(210_000 * 64, 0), 0);
    }

    #[test]
    fn test_subsidy_respects_supply_cap() {
        let params = ChainParams::default();

        assert_eq!(params.subsidy(0, params.max_supply - 10), 10);
        assert_eq!(params.subsidy(0, params.max_supply), 0);
        assert_eq!(params.block_reward(0, params.max_supply, 700), 700);
        assert_eq!(params.block_reward(0, 0, 700), 50 * UNITS_PER_COIN + 700);
    }

    #[test]
    fn test_split_rounds_down() {
        assert_eq!(split_reward(10, 3), 3);
        assert_eq!(split_reward(10, 1), 10);
        assert_eq!(split_reward(10, 0), 0);
    }

    #[test]
    fn test_fee_is_size_derived() {
        let params = ChainParams::default();
        let sender = KeyPair::generate();
        let tx = SignedTransaction::new(&sender, KeyPair::generate().address().clone(), 5).unwrap();

        let size = tx.body_bytes().unwrap().len() as u64;
        assert_eq!(params.fee_for(&tx).unwrap(), size * 10);

        let mut charged = tx.clone();
        charged.fee = 99;
        assert_eq!(params.fee_for(&charged).unwrap(), size * 10);
    }
}
