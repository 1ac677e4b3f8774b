use log::warn;
use thiserror::Error;

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use super::economics::ChainParams;
use super::ledger::Ledger;
use super::transaction::{SignedTransaction, TransactionError};
use super::validator::{validate_transaction, ValidationError};
use super::wallet::WalletTable;

/// Reasons a transaction is refused admission
#[derive(Debug, Error)]
pub enum MempoolError {
    #[error("Unknown sender wallet: {0}")]
    UnknownSender(String),

    #[error("Public key does not match the key on record for {0}")]
    PublicKeyMismatch(String),

    #[error("Transaction {0} is already pending")]
    AlreadyPending(String),

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("{0}")]
    Invalid(#[from] ValidationError),
}

impl From<TransactionError> for MempoolError {
    fn from(err: TransactionError) -> Self {
        MempoolError::Invalid(ValidationError::InvalidTransaction(err))
    }
}

/// Admitted but unmined transactions, in admission order
#[derive(Debug, Default)]
pub struct Mempool {
    pending: Mutex<Vec<SignedTransaction>>,
}

impl Mempool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_transactions(transactions: Vec<SignedTransaction>) -> Self {
        Mempool {
            pending: Mutex::new(transactions),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<SignedTransaction>> {
        self.pending.lock().unwrap_or_else(|poisoned| {
            warn!("Mempool lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Checks a transaction and, if it passes, stores it with its computed fee.
    /// Returns the stored transaction and the fee charged.
    pub fn admit(
        &self,
        mut tx: SignedTransaction,
        wallets: &WalletTable,
        ledger: &Ledger,
        params: &ChainParams,
    ) -> Result<(SignedTransaction, u64), MempoolError> {
        let on_record = wallets
            .public_key_of(&tx.from)
            .ok_or_else(|| MempoolError::UnknownSender(tx.from.0.clone()))?;
        if !on_record.eq_ignore_ascii_case(tx.public_key.trim()) {
            return Err(MempoolError::PublicKeyMismatch(tx.from.0.clone()));
        }

        tx.fee = params.fee_for(&tx)?;
        validate_transaction(&tx, ledger, params)?;

        let required = tx
            .total_debit()
            .ok_or_else(|| TransactionError::InvalidAmount("value overflows".to_string()))?;
        let available = ledger.balance_of(&tx.from);
        if available < required {
            return Err(MempoolError::InsufficientFunds {
                required,
                available,
            });
        }

        let id = tx.id()?;
        let mut pending = self.lock();
        if pending.iter().any(|existing| existing.id().ok().as_deref() == Some(id.as_str())) {
            return Err(MempoolError::AlreadyPending(id));
        }

        let fee = tx.fee;
        pending.push(tx.clone());
        Ok((tx, fee))
    }

    /// Copy of the pending set
    pub fn snapshot(&self) -> Vec<SignedTransaction> {
        self.lock().clone()
    }

    /// Returns every pending transaction and leaves the pool empty
    pub fn drain(&self) -> Vec<SignedTransaction> {
        std::mem::take(&mut *self.lock())
    }

    /// Puts transactions back at the front of the pool, ahead of anything
    /// admitted since they were drained
    pub fn restore(&self, transactions: Vec<SignedTransaction>) {
        let mut pending = self.lock();
        let newer = std::mem::replace(&mut *pending, transactions);
        pending.extend(newer);
    }

    /// Drops pending transactions that the chain now contains
    pub fn prune(&self, ledger: &Ledger) -> usize {
        let mut pending = self.lock();
        let before = pending.len();
        pending.retain(|tx| match tx.id() {
            Ok(id) => !ledger.contains_transaction(&id),
            Err(_) => false,
        });
        before - pending.len()
    }
}

/// Splits drained transactions into those a mined block looked at and the rest
pub fn partition_considered(
    drained: Vec<SignedTransaction>,
    considered: &[String],
) -> (Vec<SignedTransaction>, Vec<SignedTransaction>) {
    let considered: HashSet<&str> = considered.iter().map(String::as_str).collect();
    drained
        .into_iter()
        .partition(|tx| tx.id().map(|id| considered.contains(id.as_str())).unwrap_or(true))
}
