use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::canonical::{canonical_hash, to_canonical_bytes};
use super::crypto::{verify_signature, Address, CryptoError, DigitalSignature, KeyPair};

/// Sender tag carried by every coinbase transaction
pub const COINBASE_SENDER: &str = "COINBASE";

/// Errors that can occur during transaction operations
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Sender {from} does not match the address of its public key ({derived})")]
    SenderMismatch { from: String, derived: String },

    #[error("Invalid recipient address: {0}")]
    InvalidRecipientAddress(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Crypto error: {0}")]
    CryptoError(#[from] CryptoError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// The signed part of a transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionIntent {
    pub to: Address,
    pub value: u64,
    pub timestamp: i64,
}

impl TransactionIntent {
    pub fn new(to: Address, value: u64) -> Self {
        TransactionIntent {
            to,
            value,
            timestamp: Utc::now().timestamp(),
        }
    }

    /// The bytes covered by the signature
    pub fn signing_bytes(&self) -> Result<Vec<u8>, TransactionError> {
        Ok(to_canonical_bytes(self)?)
    }
}

/// A user transfer signed by the sender
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedTransaction {
    pub from: Address,
    pub data: TransactionIntent,
    pub signature: DigitalSignature,
    pub public_key: String,
    /// Set by the admitting node from the transaction size
    #[serde(default)]
    pub fee: u64,
}

/// Everything in a signed transaction except the fee
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignedBody<'a> {
    from: &'a Address,
    data: &'a TransactionIntent,
    signature: &'a DigitalSignature,
    public_key: &'a str,
}

impl SignedTransaction {
    /// Creates and signs a transfer from the keypair's address
    pub fn new(keypair: &KeyPair, to: Address, value: u64) -> Result<Self, TransactionError> {
        Self::from_intent(keypair, TransactionIntent::new(to, value))
    }

    pub fn from_intent(keypair: &KeyPair, data: TransactionIntent) -> Result<Self, TransactionError> {
        let signature = keypair.sign(&data.signing_bytes()?);

        Ok(SignedTransaction {
            from: keypair.address().clone(),
            data,
            signature,
            public_key: keypair.public_key_hex(),
            fee: 0,
        })
    }

    fn body(&self) -> SignedBody<'_> {
        SignedBody {
            from: &self.from,
            data: &self.data,
            signature: &self.signature,
            public_key: &self.public_key,
        }
    }

    /// Canonical bytes of the fee-less body; the fee is charged per byte of it
    pub fn body_bytes(&self) -> Result<Vec<u8>, TransactionError> {
        Ok(to_canonical_bytes(&self.body())?)
    }

    /// Content identity, stable under fee rewriting
    pub fn id(&self) -> Result<String, TransactionError> {
        Ok(canonical_hash(&self.body())?)
    }

    /// Checks that `from` is the address of `publicKey`
    pub fn verify_sender(&self) -> Result<(), TransactionError> {
        let derived = Address::from_public_key_hex(&self.public_key)?;
        if derived != self.from {
            return Err(TransactionError::SenderMismatch {
                from: self.from.0.clone(),
                derived: derived.0,
            });
        }

        Ok(())
    }

    /// Verifies the signature over `data`
    pub fn verify_signature(&self) -> Result<bool, TransactionError> {
        let message = self.data.signing_bytes()?;
        Ok(verify_signature(&message, &self.signature, &self.public_key))
    }

    /// Runs every stateless check: shape, sender binding and signature
    pub fn verify(&self) -> Result<(), TransactionError> {
        if self.data.value == 0 {
            return Err(TransactionError::InvalidAmount("value must be positive".to_string()));
        }

        if !self.data.to.is_well_formed() {
            return Err(TransactionError::InvalidRecipientAddress(self.data.to.0.clone()));
        }

        self.verify_sender()?;

        if !self.verify_signature()? {
            return Err(TransactionError::InvalidSignature);
        }

        Ok(())
    }

    /// Amount debited from the sender
    pub fn total_debit(&self) -> Option<u64> {
        self.data.value.checked_add(self.fee)
    }
}

/// Reward minted to a miner during block assembly
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinbaseTransaction {
    pub from: String,
    pub to: Address,
    pub value: u64,
    pub timestamp: i64,
}

impl CoinbaseTransaction {
    pub fn new(to: Address, value: u64, timestamp: i64) -> Self {
        CoinbaseTransaction {
            from: COINBASE_SENDER.to_string(),
            to,
            value,
            timestamp,
        }
    }
}

/// Represents a transaction in the blockchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transaction {
    Coinbase(CoinbaseTransaction),
    Signed(SignedTransaction),
}

impl Transaction {
    pub fn id(&self) -> Result<String, TransactionError> {
        match self {
            Transaction::Coinbase(coinbase) => Ok(canonical_hash(coinbase)?),
            Transaction::Signed(signed) => signed.id(),
        }
    }
}
