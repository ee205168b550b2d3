use super::block::BlockId;
use crate::crypto::{CollectiveSignature, CollectiveSigner, SignatureVerifier};
use crate::error::ChainError;
use serde::{Deserialize, Serialize};

/// Signed pointer from an earlier block to a later one at a given level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardLink {
    pub from: BlockId,
    pub to: BlockId,
    pub signature: CollectiveSignature,
}

impl ForwardLink {
    /// The message a roster signs: source identity followed by target identity.
    pub fn message(from: &BlockId, to: &BlockId) -> Vec<u8> {
        let mut msg = Vec::with_capacity(64);
        msg.extend_from_slice(from);
        msg.extend_from_slice(to);
        msg
    }

    /// Asks the roster owning `from` (given by `publics`) to sign the link.
    pub fn sign(
        from: BlockId,
        to: BlockId,
        publics: &[Vec<u8>],
        signer: &dyn CollectiveSigner,
    ) -> Result<Self, ChainError> {
        let signature = signer.sign(publics, &Self::message(&from, &to))?;
        Ok(Self { from, to, signature })
    }

    pub fn verify(&self, publics: &[Vec<u8>], verifier: &dyn SignatureVerifier) -> Result<(), ChainError> {
        verifier.verify(&Self::message(&self.from, &self.to), &self.signature, publics)
    }
}
