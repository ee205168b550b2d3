//! Cryptographic primitives for the skipchain
//!
//! Forward links are signed collectively by the roster of the block they
//! leave from. The collective-signing protocol itself lives outside this
//! crate; what the chain consumes is captured by two seams:
//!
//! - [`CollectiveSigner`] produces a [`CollectiveSignature`] over a message
//!   for a given set of public keys.
//! - [`SignatureVerifier`] checks such a signature against a set of public
//!   keys.
//!
//! [`LocalSigner`] and [`ThresholdVerifier`] are the in-process
//! implementations: every member signs with secp256k1 ECDSA and the
//! signature is accepted once a byzantine-fault-tolerant quorum of the
//! roster has signed.

use crate::error::ChainError;
use once_cell::sync::Lazy;
use rand::rngs::OsRng;
use secp256k1::{
    constants::{COMPACT_SIGNATURE_SIZE, PUBLIC_KEY_SIZE, SECRET_KEY_SIZE},
    ecdsa::Signature,
    All, Message, PublicKey, Secp256k1, SecretKey,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// A thread-safe, lazily initialized Secp256k1 context.
static SECP256K1_CONTEXT: Lazy<Secp256k1<All>> = Lazy::new(Secp256k1::new);

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub secret_key: SecretKey,
    pub public_key: PublicKey,
}

impl KeyPair {
    /// Generates a new random KeyPair using the OS random number generator.
    pub fn generate() -> Self {
        let secret_key = SecretKey::new(&mut OsRng);
        Self::from_secret_key(secret_key)
    }

    pub fn from_secret_key(secret_key: SecretKey) -> Self {
        let public_key = PublicKey::from_secret_key(&SECP256K1_CONTEXT, &secret_key);
        KeyPair {
            secret_key,
            public_key,
        }
    }

    /// Creates a KeyPair from raw secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, ChainError> {
        let secret_key = SecretKey::from_slice(bytes).map_err(|e| {
            if bytes.len() != SECRET_KEY_SIZE {
                ChainError::CryptoError(format!(
                    "Secret key must be {} bytes, got {}",
                    SECRET_KEY_SIZE,
                    bytes.len()
                ))
            } else {
                ChainError::CryptoError(format!("Invalid secret key bytes: {}", e))
            }
        })?;

        Ok(Self::from_secret_key(secret_key))
    }

    /// Returns the KeyPair's public key as a compressed byte array.
    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        self.public_key.serialize()
    }

    /// Signs the SHA-256 digest of `message` and returns the compact signature bytes.
    pub fn sign(&self, message: &[u8]) -> [u8; COMPACT_SIGNATURE_SIZE] {
        let digest: [u8; 32] = Sha256::digest(message).into();
        let message = Message::from_digest(digest);
        SECP256K1_CONTEXT
            .sign_ecdsa(&message, &self.secret_key)
            .serialize_compact()
    }
}

/// Verifies an ECDSA signature given the raw public key bytes, message, and signature bytes.
pub fn verify_signature(
    public_key_bytes: &[u8],
    message: &[u8],
    signature_bytes: &[u8],
) -> Result<(), ChainError> {
    if public_key_bytes.len() != PUBLIC_KEY_SIZE {
        return Err(ChainError::CryptoError(format!(
            "Public key must be exactly {} bytes (compressed), got {}",
            PUBLIC_KEY_SIZE,
            public_key_bytes.len()
        )));
    }
    if signature_bytes.len() != COMPACT_SIGNATURE_SIZE {
        return Err(ChainError::CryptoError(format!(
            "Signature must be exactly {} bytes (compact), got {}",
            COMPACT_SIGNATURE_SIZE,
            signature_bytes.len()
        )));
    }

    let public_key = PublicKey::from_slice(public_key_bytes)
        .map_err(|e| ChainError::CryptoError(format!("Invalid public key: {}", e)))?;

    let digest: [u8; 32] = Sha256::digest(message).into();
    let message = Message::from_digest(digest);

    let signature = Signature::from_compact(signature_bytes)
        .map_err(|e| ChainError::CryptoError(format!("Invalid signature: {}", e)))?;

    SECP256K1_CONTEXT
        .verify_ecdsa(&message, &signature, &public_key)
        .map_err(|_| ChainError::CryptoError("Signature verification failed".to_string()))
}

/// One roster member's contribution to a collective signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureShare {
    /// Position of the signer in the roster the signature was made for.
    pub signer: u32,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

/// Aggregate of the shares a roster produced over a single message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectiveSignature {
    pub shares: Vec<SignatureShare>,
}

impl CollectiveSignature {
    pub fn signer_count(&self) -> usize {
        self.shares.len()
    }
}

/// Minimum number of signers out of `n` so that up to `(n - 1) / 3`
/// byzantine members cannot forge a collective signature.
pub fn bft_threshold(n: usize) -> usize {
    n - n.saturating_sub(1) / 3
}

/// Produces collective signatures. Implemented outside the core by the
/// signing protocol; [`LocalSigner`] does it in-process.
pub trait CollectiveSigner: Send + Sync {
    fn sign(&self, publics: &[Vec<u8>], message: &[u8]) -> Result<CollectiveSignature, ChainError>;
}

/// Checks a collective signature over `message` against the ordered public
/// keys of the roster that was supposed to produce it.
pub trait SignatureVerifier: Send + Sync {
    fn verify(
        &self,
        message: &[u8],
        signature: &CollectiveSignature,
        publics: &[Vec<u8>],
    ) -> Result<(), ChainError>;
}

/// Accepts a collective signature once at least `bft_threshold(n)` distinct
/// members of the roster produced a valid share.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThresholdVerifier;

impl SignatureVerifier for ThresholdVerifier {
    fn verify(
        &self,
        message: &[u8],
        signature: &CollectiveSignature,
        publics: &[Vec<u8>],
    ) -> Result<(), ChainError> {
        if publics.is_empty() {
            return Err(ChainError::CryptoError("Empty public key set".to_string()));
        }

        let mut seen = HashSet::new();
        for share in &signature.shares {
            let idx = share.signer as usize;
            let public = publics.get(idx).ok_or_else(|| {
                ChainError::CryptoError(format!(
                    "Signer {} outside of a roster of {} members",
                    idx,
                    publics.len()
                ))
            })?;
            if !seen.insert(idx) {
                return Err(ChainError::CryptoError(format!(
                    "Signer {} contributed twice",
                    idx
                )));
            }
            verify_signature(public, message, &share.signature).map_err(|e| {
                ChainError::CryptoError(format!("Share of signer {}: {}", idx, e))
            })?;
        }

        let threshold = bft_threshold(publics.len());
        if seen.len() < threshold {
            return Err(ChainError::CryptoError(format!(
                "Only {} of {} members signed, {} required",
                seen.len(),
                publics.len(),
                threshold
            )));
        }
        Ok(())
    }
}

/// Holds the secret keys of some roster members and signs on their behalf.
#[derive(Debug, Clone, Default)]
pub struct LocalSigner {
    keys: Vec<KeyPair>,
}

impl LocalSigner {
    pub fn new(keys: Vec<KeyPair>) -> Self {
        Self { keys }
    }

    /// Generates `n` fresh key pairs.
    pub fn generate(n: usize) -> Self {
        Self::new((0..n).map(|_| KeyPair::generate()).collect())
    }

    pub fn keys(&self) -> &[KeyPair] {
        &self.keys
    }

    /// A signer limited to the first `n` keys.
    pub fn truncated(&self, n: usize) -> Self {
        Self::new(self.keys.iter().take(n).cloned().collect())
    }
}

impl CollectiveSigner for LocalSigner {
    fn sign(&self, publics: &[Vec<u8>], message: &[u8]) -> Result<CollectiveSignature, ChainError> {
        let shares: Vec<SignatureShare> = publics
            .iter()
            .enumerate()
            .filter_map(|(i, public)| {
                self.keys
                    .iter()
                    .find(|k| k.public_key_bytes().as_slice() == public.as_slice())
                    .map(|k| SignatureShare {
                        signer: i as u32,
                        signature: k.sign(message).to_vec(),
                    })
            })
            .collect();

        if shares.is_empty() {
            return Err(ChainError::CryptoError(
                "No roster member key available to sign".to_string(),
            ));
        }
        Ok(CollectiveSignature { shares })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn publics(signer: &LocalSigner) -> Vec<Vec<u8>> {
        signer
            .keys()
            .iter()
            .map(|k| k.public_key_bytes().to_vec())
            .collect()
    }

    #[test]
    fn test_signing_and_verification() {
        let keypair = KeyPair::generate();
        let message = b"Hello, skipchain!";

        let signature = keypair.sign(message);
        let result = verify_signature(&keypair.public_key_bytes(), message, &signature);
        assert!(result.is_ok());
        assert_eq!(signature.len(), COMPACT_SIGNATURE_SIZE);
    }

    #[test]
    fn test_invalid_signature() {
        let keypair1 = KeyPair::generate();
        let keypair2 = KeyPair::generate();

        let signature = keypair1.sign(b"Test message");
        let result = verify_signature(&keypair2.public_key_bytes(), b"Test message", &signature);
        assert_eq!(
            result.unwrap_err().to_string(),
            "Cryptographic error: Signature verification failed"
        );
    }

    #[test]
    fn test_invalid_key_or_sig_length_check() {
        let keypair = KeyPair::generate();
        let signature = keypair.sign(b"Test");
        let pubkey_bytes = keypair.public_key_bytes();

        let result = verify_signature(&pubkey_bytes[1..], b"Test", &signature);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Public key must be exactly"));

        let result = verify_signature(&pubkey_bytes, b"Test", &signature[1..]);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Signature must be exactly"));
    }

    #[test]
    fn test_from_secret_bytes_invalid_length() {
        let short_bytes = [0u8; SECRET_KEY_SIZE - 1];
        let result = KeyPair::from_secret_bytes(&short_bytes);
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Secret key must be"));
    }

    #[test]
    fn test_bft_threshold() {
        assert_eq!(bft_threshold(1), 1);
        assert_eq!(bft_threshold(3), 3);
        assert_eq!(bft_threshold(4), 3);
        assert_eq!(bft_threshold(7), 5);
    }

    #[test]
    fn test_collective_signature_full_roster() {
        let signer = LocalSigner::generate(4);
        let publics = publics(&signer);
        let sig = signer.sign(&publics, b"from|to").unwrap();
        assert_eq!(sig.signer_count(), 4);
        assert!(ThresholdVerifier.verify(b"from|to", &sig, &publics).is_ok());
        assert!(ThresholdVerifier.verify(b"other", &sig, &publics).is_err());
    }

    #[test]
    fn test_collective_signature_tolerates_one_faulty_of_four() {
        let signer = LocalSigner::generate(4);
        let publics = publics(&signer);
        let sig = signer.truncated(3).sign(&publics, b"msg").unwrap();
        assert!(ThresholdVerifier.verify(b"msg", &sig, &publics).is_ok());
    }

    #[test]
    fn test_collective_signature_below_threshold() {
        let signer = LocalSigner::generate(3);
        let publics = publics(&signer);
        let sig = signer.truncated(2).sign(&publics, b"msg").unwrap();
        let err = ThresholdVerifier.verify(b"msg", &sig, &publics).unwrap_err();
        assert!(err.to_string().contains("Only 2 of 3 members signed"));
    }

    #[test]
    fn test_duplicate_share_rejected() {
        let signer = LocalSigner::generate(1);
        let publics = publics(&signer);
        let mut sig = signer.sign(&publics, b"msg").unwrap();
        sig.shares.push(sig.shares[0].clone());
        assert!(ThresholdVerifier.verify(b"msg", &sig, &publics).is_err());
    }

    #[test]
    fn test_signer_without_roster_keys() {
        let signer = LocalSigner::generate(2);
        let outsiders = publics(&LocalSigner::generate(2));
        assert!(signer.sign(&outsiders, b"msg").is_err());
    }
}
