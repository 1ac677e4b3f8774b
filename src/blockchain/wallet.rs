use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use std::sync::Arc;

use super::crypto::{Address, CryptoError, KeyPair};
use super::ledger::Ledger;

/// A wallet known to this node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletRecord {
    pub address: Address,

    /// Hex public point, absent for addresses only seen on chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,

    /// Hex private scalar, present only for wallets generated on this node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,

    /// Copy of the ledger balance at the last chain mutation; never authoritative
    #[serde(default)]
    pub cached_balance: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl WalletRecord {
    /// Record for a keypair held by this node
    pub fn local(keypair: &KeyPair, alias: Option<String>) -> Self {
        WalletRecord {
            address: keypair.address().clone(),
            public_key: Some(keypair.public_key_hex()),
            private_key: Some(keypair.private_key_hex()),
            cached_balance: 0,
            alias,
        }
    }

    /// Record for a public key whose private half lives elsewhere
    pub fn external(public_key: &str, alias: Option<String>) -> Result<Self, CryptoError> {
        let address = Address::from_public_key_hex(public_key)?;

        Ok(WalletRecord {
            address,
            public_key: Some(public_key.to_string()),
            private_key: None,
            cached_balance: 0,
            alias,
        })
    }

    fn observed(address: Address) -> Self {
        WalletRecord {
            address,
            public_key: None,
            private_key: None,
            cached_balance: 0,
            alias: None,
        }
    }

    /// Copy safe to hand out over RPC
    pub fn redacted(&self) -> Self {
        WalletRecord {
            private_key: None,
            ..self.clone()
        }
    }

    pub fn keypair(&self) -> Option<Result<KeyPair, CryptoError>> {
        self.private_key.as_deref().map(KeyPair::from_private_hex)
    }
}

/// The node's wallet table
#[derive(Debug, Clone, Default)]
pub struct WalletTable {
    wallets: Arc<DashMap<Address, WalletRecord>>,
}

impl WalletTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<WalletRecord>) -> Self {
        let table = WalletTable::new();
        for record in records {
            table.wallets.insert(record.address.clone(), record);
        }
        table
    }

    pub fn get(&self, address: &Address) -> Option<WalletRecord> {
        self.wallets.get(address).map(|entry| entry.value().clone())
    }

    /// On-record public key of an address, if any
    pub fn public_key_of(&self, address: &Address) -> Option<String> {
        self.wallets
            .get(address)
            .and_then(|entry| entry.value().public_key.clone())
    }

    /// Inserts a record, keeping key material already on file
    pub fn upsert(&self, record: WalletRecord) -> WalletRecord {
        let mut entry = self
            .wallets
            .entry(record.address.clone())
            .or_insert_with(|| WalletRecord::observed(record.address.clone()));

        let existing = entry.value_mut();
        if existing.public_key.is_none() {
            existing.public_key = record.public_key;
        }
        if existing.private_key.is_none() {
            existing.private_key = record.private_key;
        }
        if record.alias.is_some() {
            existing.alias = record.alias;
        }

        existing.clone()
    }

    /// Table as it would look with balances refreshed from `ledger`, without
    /// touching the live table. Addresses seen on chain get a record.
    pub fn refreshed(&self, ledger: &Ledger) -> Vec<WalletRecord> {
        let mut records: Vec<WalletRecord> = self
            .wallets
            .iter()
            .map(|entry| {
                let mut record = entry.value().clone();
                record.cached_balance = ledger.balance_of(&record.address);
                record
            })
            .collect();

        for (address, balance) in ledger.balances() {
            if !self.wallets.contains_key(address) {
                let mut record = WalletRecord::observed(address.clone());
                record.cached_balance = *balance;
                records.push(record);
            }
        }

        records.sort_by(|a, b| a.address.cmp(&b.address));
        records
    }

    /// Replaces cached balances with a table produced by [`WalletTable::refreshed`]
    pub fn apply_refresh(&self, records: Vec<WalletRecord>) {
        for record in records {
            match self.wallets.get_mut(&record.address) {
                Some(mut entry) => entry.value_mut().cached_balance = record.cached_balance,
                None => {
                    self.wallets.insert(record.address.clone(), record);
                }
            }
        }
    }

    pub fn all(&self) -> Vec<WalletRecord> {
        let mut records: Vec<WalletRecord> =
            self.wallets.iter().map(|entry| entry.value().clone()).collect();
        records.sort_by(|a, b| a.address.cmp(&b.address));
        records
    }
}
