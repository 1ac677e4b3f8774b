use serde::Serialize;
use thiserror::Error;

use std::collections::{BTreeMap, HashSet};

use super::block::Block;
use super::crypto::Address;
use super::transaction::{Transaction, TransactionError};

/// Errors that can occur while applying transactions to balances
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Insufficient funds for {address}: required {required}, available {available}")]
    InsufficientFunds {
        address: String,
        required: u64,
        available: u64,
    },

    #[error("Balance overflow for {0}")]
    Overflow(String),

    #[error("Transaction error: {0}")]
    TransactionError(#[from] TransactionError),
}

/// Authoritative address -> balance table, derived from the chain
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Ledger {
    balances: BTreeMap<Address, u64>,

    /// Coinbase value minted so far
    #[serde(skip)]
    coinbase_total: u64,

    /// Fees paid so far; recycled to miners rather than minted
    #[serde(skip)]
    fees_total: u64,

    /// Ids of every signed transaction applied
    #[serde(skip)]
    applied: HashSet<String>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replays the chain from genesis; the only way authoritative balances are produced
    pub fn recompute(chain: &[Block]) -> Result<Self, LedgerError> {
        let mut ledger = Ledger::new();
        for block in chain {
            ledger.apply_block(block)?;
        }

        Ok(ledger)
    }

    /// Balance of an address; unseen addresses hold 0
    pub fn balance_of(&self, address: &Address) -> u64 {
        self.balances.get(address).copied().unwrap_or(0)
    }

    /// Whether a signed transaction with this id is already on chain
    pub fn contains_transaction(&self, id: &str) -> bool {
        self.applied.contains(id)
    }

    pub fn balances(&self) -> &BTreeMap<Address, u64> {
        &self.balances
    }

    /// Coins in circulation: minted coinbase value minus fees taken out of balances
    pub fn circulating_supply(&self) -> u64 {
        self.coinbase_total.saturating_sub(self.fees_total)
    }

    pub fn apply_block(&mut self, block: &Block) -> Result<(), LedgerError> {
        for transaction in &block.transactions {
            self.apply(transaction)?;
        }

        Ok(())
    }

    /// Applies one transaction; on error the ledger is left untouched
    pub fn apply(&mut self, transaction: &Transaction) -> Result<(), LedgerError> {
        match transaction {
            Transaction::Coinbase(coinbase) => {
                let minted = self
                    .coinbase_total
                    .checked_add(coinbase.value)
                    .ok_or_else(|| LedgerError::Overflow("supply".to_string()))?;
                self.credit(&coinbase.to, coinbase.value)?;
                self.coinbase_total = minted;
            }
            Transaction::Signed(signed) => {
                let required = signed
                    .total_debit()
                    .ok_or_else(|| LedgerError::Overflow(signed.from.0.clone()))?;

                let available = self.balance_of(&signed.from);
                if available < required {
                    return Err(LedgerError::InsufficientFunds {
                        address: signed.from.0.clone(),
                        required,
                        available,
                    });
                }

                let recipient_balance = if signed.data.to == signed.from {
                    available - required
                } else {
                    self.balance_of(&signed.data.to)
                };
                recipient_balance
                    .checked_add(signed.data.value)
                    .ok_or_else(|| LedgerError::Overflow(signed.data.to.0.clone()))?;

                let id = signed.id()?;
                self.balances.insert(signed.from.clone(), available - required);
                self.credit(&signed.data.to, signed.data.value)?;
                self.fees_total = self.fees_total.saturating_add(signed.fee);
                self.applied.insert(id);
            }
        }

        Ok(())
    }

    fn credit(&mut self, address: &Address, amount: u64) -> Result<(), LedgerError> {
        let balance = self.balances.entry(address.clone()).or_insert(0);
        *balance = balance
            .checked_add(amount)
            .ok_or_else(|| LedgerError::Overflow(address.0.clone()))?;
        Ok(())
    }
}
