use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use std::fmt;
use std::str::FromStr;

/// Prefix of every account address
pub const ADDRESS_PREFIX: char = 'W';

/// Number of hex characters of the public key digest kept in an address
const ADDRESS_DIGEST_LEN: usize = 40;

/// Length of an uncompressed public point without its SEC1 tag (X || Y)
const PUBLIC_POINT_LEN: usize = 64;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Decoding error: {0}")]
    DecodingError(String),
}

/// Represents an account address: `W` followed by the first 40 hex
/// characters of SHA-256 over the public point
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub String);

impl Address {
    /// Derives the address of a public key
    pub fn from_public_key(public_key: &VerifyingKey) -> Self {
        Self::from_public_point(&public_point_bytes(public_key))
    }

    /// Derives the address of a hex encoded public point
    pub fn from_public_key_hex(public_key: &str) -> Result<Self, CryptoError> {
        let key = parse_public_key(public_key)?;
        Ok(Self::from_public_key(&key))
    }

    fn from_public_point(point: &[u8]) -> Self {
        let digest = hex::encode(Sha256::digest(point));
        Address(format!("{}{}", ADDRESS_PREFIX, &digest[..ADDRESS_DIGEST_LEN]))
    }

    /// Checks the `W` + 40 lowercase hex shape
    pub fn is_well_formed(&self) -> bool {
        let mut chars = self.0.chars();
        chars.next() == Some(ADDRESS_PREFIX)
            && self.0.len() == ADDRESS_DIGEST_LEN + 1
            && chars.all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Address {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let address = Address(s.to_string());
        if !address.is_well_formed() {
            return Err(CryptoError::InvalidAddress(s.to_string()));
        }

        Ok(address)
    }
}

/// Represents a hex encoded 64-byte `r || s` ECDSA signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigitalSignature(pub String);

impl DigitalSignature {
    /// Creates a new digital signature from a signature
    pub fn from_signature(signature: &Signature) -> Self {
        DigitalSignature(hex::encode(signature.to_bytes()))
    }

    /// Converts the digital signature to a signature
    pub fn to_signature(&self) -> Result<Signature, CryptoError> {
        let bytes = hex::decode(&self.0).map_err(|e| CryptoError::DecodingError(e.to_string()))?;

        Signature::from_slice(&bytes).map_err(|e| CryptoError::DecodingError(e.to_string()))
    }
}

/// A secp256k1 keypair
#[derive(Debug, Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    address: Address,
}

impl KeyPair {
    /// Generates a new keypair from the OS random source
    pub fn generate() -> Self {
        let signing_key = SigningKey::random(&mut OsRng);
        Self::from_signing_key(signing_key)
    }

    /// Restores a keypair from a hex encoded private scalar
    pub fn from_private_hex(private_key: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(private_key.trim())
            .map_err(|e| CryptoError::InvalidKey(format!("private key is not hex: {}", e)))?;

        let signing_key =
            SigningKey::from_slice(&bytes).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

        Ok(Self::from_signing_key(signing_key))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = VerifyingKey::from(&signing_key);
        let address = Address::from_public_key(&verifying_key);

        KeyPair {
            signing_key,
            verifying_key,
            address,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Hex of the 64-byte public point
    pub fn public_key_hex(&self) -> String {
        hex::encode(public_point_bytes(&self.verifying_key))
    }

    /// Hex of the 32-byte private scalar
    pub fn private_key_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    /// Signs a message (ECDSA over SHA-256)
    pub fn sign(&self, message: &[u8]) -> DigitalSignature {
        let signature: Signature = self.signing_key.sign(message);
        DigitalSignature::from_signature(&signature)
    }
}

/// Signs a message with a hex encoded private key
pub fn sign(private_key: &str, message: &[u8]) -> Result<DigitalSignature, CryptoError> {
    Ok(KeyPair::from_private_hex(private_key)?.sign(message))
}

/// Verifies a signature against a message and hex encoded public point.
///
/// Malformed keys or signatures never error, they simply fail verification.
pub fn verify_signature(message: &[u8], signature: &DigitalSignature, public_key: &str) -> bool {
    let public_key = match parse_public_key(public_key) {
        Ok(key) => key,
        Err(_) => return false,
    };

    let signature = match signature.to_signature() {
        Ok(signature) => signature,
        Err(_) => return false,
    };

    public_key.verify(message, &signature).is_ok()
}

/// Parses a hex encoded 64-byte public point
pub fn parse_public_key(public_key: &str) -> Result<VerifyingKey, CryptoError> {
    let bytes = hex::decode(public_key.trim())
        .map_err(|e| CryptoError::InvalidKey(format!("public key is not hex: {}", e)))?;

    if bytes.len() != PUBLIC_POINT_LEN {
        return Err(CryptoError::InvalidKey(format!(
            "public key must be {} bytes, got {}",
            PUBLIC_POINT_LEN,
            bytes.len()
        )));
    }

    let mut sec1 = Vec::with_capacity(PUBLIC_POINT_LEN + 1);
    sec1.push(0x04);
    sec1.extend_from_slice(&bytes);

    VerifyingKey::from_sec1_bytes(&sec1).map_err(|e| CryptoError::InvalidKey(e.to_string()))
}

fn public_point_bytes(public_key: &VerifyingKey) -> Vec<u8> {
    let encoded = public_key.as_affine().to_encoded_point(false);
    encoded.as_bytes()[1..].to_vec()
}
