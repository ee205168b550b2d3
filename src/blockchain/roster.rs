use crate::crypto::KeyPair;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A member of the authority that signs forward links.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerIdentity {
    /// Compressed secp256k1 public key.
    #[serde(with = "serde_bytes")]
    pub public_key: Vec<u8>,
    pub address: String,
}

impl ServerIdentity {
    pub fn new(public_key: Vec<u8>, address: impl Into<String>) -> Self {
        Self {
            public_key,
            address: address.into(),
        }
    }
}

/// Ordered set of authority members responsible for a block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roster {
    pub list: Vec<ServerIdentity>,
}

impl Roster {
    pub fn new(list: Vec<ServerIdentity>) -> Self {
        Self { list }
    }

    /// Builds a roster out of local key pairs, addressing members as `local://<i>`.
    pub fn from_keys(keys: &[KeyPair]) -> Self {
        Self::new(
            keys.iter()
                .enumerate()
                .map(|(i, k)| ServerIdentity::new(k.public_key_bytes().to_vec(), format!("local://{}", i)))
                .collect(),
        )
    }

    /// Public keys in roster order.
    pub fn publics(&self) -> Vec<Vec<u8>> {
        self.list.iter().map(|s| s.public_key.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// A roster made of the first `n` members.
    pub fn truncated(&self, n: usize) -> Self {
        Self::new(self.list.iter().take(n).cloned().collect())
    }

    pub fn id(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        self.hash_into(&mut hasher);
        hasher.finalize().into()
    }

    pub(crate) fn hash_into(&self, hasher: &mut Sha256) {
        hasher.update((self.list.len() as u64).to_le_bytes());
        for member in &self.list {
            hasher.update((member.public_key.len() as u64).to_le_bytes());
            hasher.update(&member.public_key);
            hasher.update((member.address.len() as u64).to_le_bytes());
            hasher.update(member.address.as_bytes());
        }
    }
}
