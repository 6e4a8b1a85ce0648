//! # Identity and Keypairs
//!
//! This module defines the identity types used throughout Causeway:
//!
//! - [`Keypair`]: Ed25519 signing keypair (secret + public key)
//! - [`Identity`]: 32-byte public key serving as the peer's unique identifier
//!
//! ## Identity Model
//!
//! Causeway uses a simple identity model: **Identity = Ed25519 Public Key**.
//! Peers are addressed, compared, and logged by their public key bytes, and
//! the relay handshake transmits identities as the raw 32-byte key.
//!
//! ## Security Invariants
//!
//! - P1: `Identity::decode(id.encode()) == id` for every keypair-derived identity
//! - P2: `Identity::decode` rejects any input that is not a valid Ed25519 point;
//!   malformed bytes can never silently produce a wrong identity

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Length of an encoded identity: the raw Ed25519 public key.
pub const IDENTITY_LENGTH: usize = 32;

// ============================================================================
// Errors
// ============================================================================

/// Error type for identity decoding failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityError {
    /// Input is not exactly [`IDENTITY_LENGTH`] bytes.
    InvalidLength(usize),
    /// The bytes do not form a valid Ed25519 public key point.
    InvalidPublicKey,
}

impl std::fmt::Display for IdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityError::InvalidLength(len) => {
                write!(f, "invalid identity length: {} bytes (expected {})", len, IDENTITY_LENGTH)
            }
            IdentityError::InvalidPublicKey => {
                write!(f, "bytes do not encode a valid Ed25519 public key")
            }
        }
    }
}

impl std::error::Error for IdentityError {}

// ============================================================================
// Keypair
// ============================================================================

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    /// Generate a new keypair from the OS CSPRNG.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn identity(&self) -> Identity {
        Identity::from_bytes(self.public_key_bytes())
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &hex::encode(self.identity().as_bytes()))
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Identity
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    /// Wrap raw public key bytes without validation.
    ///
    /// Use this for bytes that are already known to be a public key
    /// (keypair-derived). Bytes received from the wire go through
    /// [`Identity::decode`] instead.
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Encode for transmission: the raw public key bytes.
    #[inline]
    pub fn encode(&self) -> [u8; 32] {
        self.0
    }

    /// Decode an identity received from the wire.
    ///
    /// Rejects any input that is not exactly 32 bytes forming a valid
    /// Ed25519 public key point. Remote peers control this input, so the
    /// error path is a routinely-taken path, not an exceptional one.
    pub fn decode(bytes: &[u8]) -> Result<Self, IdentityError> {
        if bytes.len() != IDENTITY_LENGTH {
            return Err(IdentityError::InvalidLength(bytes.len()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        let identity = Self(arr);
        if !identity.is_valid() {
            return Err(IdentityError::InvalidPublicKey);
        }
        Ok(identity)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Check if this identity is valid.
    ///
    /// Validates that the identity:
    /// 1. Is not all zeros or all 0xFF (trivially invalid)
    /// 2. Represents a valid Ed25519 public key point
    #[inline]
    pub fn is_valid(&self) -> bool {
        // Fast-path rejection for trivially invalid identities
        if self.0.iter().all(|&b| b == 0) {
            return false;
        }
        if self.0.iter().all(|&b| b == 0xFF) {
            return false;
        }
        VerifyingKey::try_from(self.0.as_slice()).is_ok()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", hex::encode(&self.0[..8]))
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_round_trip() {
        let keypair = Keypair::generate();
        let identity = keypair.identity();

        let encoded = identity.encode();
        let decoded = Identity::decode(&encoded).expect("keypair-derived identity must decode");

        assert_eq!(decoded, identity);
        assert_eq!(decoded.as_bytes(), identity.as_bytes());
    }

    #[test]
    fn decode_rejects_wrong_length() {
        assert_eq!(Identity::decode(&[]), Err(IdentityError::InvalidLength(0)));
        assert_eq!(Identity::decode(&[1, 2, 3]), Err(IdentityError::InvalidLength(3)));
        assert_eq!(Identity::decode(&[0u8; 33]), Err(IdentityError::InvalidLength(33)));
    }

    #[test]
    fn decode_rejects_trivially_invalid_keys() {
        assert_eq!(Identity::decode(&[0u8; 32]), Err(IdentityError::InvalidPublicKey));
        assert_eq!(Identity::decode(&[0xFFu8; 32]), Err(IdentityError::InvalidPublicKey));
    }

    #[test]
    fn hex_round_trip() {
        let identity = Keypair::generate().identity();
        let hex = identity.to_hex();
        assert_eq!(Identity::from_hex(&hex).unwrap(), identity);
    }

    #[test]
    fn from_hex_rejects_bad_input() {
        assert!(Identity::from_hex("abcd").is_err());
        assert!(Identity::from_hex("zz").is_err());
    }

    #[test]
    fn keypair_secret_round_trip() {
        let keypair = Keypair::generate();
        let restored = Keypair::from_secret_key_bytes(&keypair.secret_key_bytes());
        assert_eq!(restored.identity(), keypair.identity());
    }
}
