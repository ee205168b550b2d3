//! Chain verification.
//!
//! Signatures live on forward links: a block cannot know its successor when
//! it is created, so the link from an ancestor to a newer block is signed by
//! the ancestor's roster once the newer block exists. Verification therefore
//! walks towards genesis through back-links and, at every hop, checks the
//! forward link the ancestor holds for the current block.

use super::block::{BlockId, SkipBlock};
use crate::crypto::SignatureVerifier;
use crate::error::ChainError;
use crate::store::BlockLookup;
use tracing::debug;

impl SkipBlock {
    /// Checks every populated forward link against this block's own roster.
    pub fn verify_forward_signatures(&self, verifier: &dyn SignatureVerifier) -> Result<(), ChainError> {
        if self.forward_links.is_empty() {
            return Ok(());
        }
        let publics = self.roster.publics();
        for (level, link) in self.forward_links.iter().enumerate() {
            if link.from != self.hash {
                return Err(ChainError::BadSignature {
                    level,
                    reason: format!(
                        "link leaves from {} instead of {}",
                        hex::encode(link.from),
                        hex::encode(self.hash)
                    ),
                });
            }
            link.verify(&publics, verifier)
                .map_err(|e| ChainError::BadSignature {
                    level,
                    reason: e.to_string(),
                })?;
        }
        Ok(())
    }
}

/// Validates blocks against the rest of the chain held by a [`BlockLookup`].
pub struct ChainVerifier<'a, L: BlockLookup + ?Sized> {
    lookup: &'a L,
    verifier: &'a dyn SignatureVerifier,
}

impl<'a, L: BlockLookup + ?Sized> ChainVerifier<'a, L> {
    pub fn new(lookup: &'a L, verifier: &'a dyn SignatureVerifier) -> Self {
        Self { lookup, verifier }
    }

    fn fetch(&self, id: &BlockId) -> Result<SkipBlock, ChainError> {
        self.lookup
            .get(id)
            .ok_or_else(|| ChainError::BlockNotFound(hex::encode(id)))
    }

    /// Finds the block whose roster governs `block`: the block itself for a
    /// root genesis, the parent-chain block for a child-chain genesis, and the
    /// level-0 predecessor otherwise.
    pub fn get_responsible(&self, block: &SkipBlock) -> Result<SkipBlock, ChainError> {
        if block.roster.is_empty() {
            return Err(ChainError::InvalidBlock(format!(
                "Block {} doesn't have a roster",
                hex::encode(block.hash)
            )));
        }
        if block.is_genesis() {
            return match &block.parent_block_id {
                None => Ok(block.clone()),
                Some(parent) => self.fetch(parent),
            };
        }
        self.fetch(&block.back_link_ids[0])
    }

    /// Verifies `block` and the forward-link trail leading to it from genesis.
    pub fn verify_links(&self, block: &SkipBlock) -> Result<(), ChainError> {
        if let Some(parent_id) = &block.parent_block_id {
            let parent = self.fetch(parent_id)?;
            parent.verify_forward_signatures(self.verifier)?;
            let chain_id = block.skipchain_id();
            if !parent.child_sl.contains(&chain_id) {
                return Err(ChainError::InvalidBlock(format!(
                    "Parent {} doesn't know about chain {}",
                    hex::encode(parent.hash),
                    hex::encode(chain_id)
                )));
            }
        }

        let mut current = block.clone();
        loop {
            self.check_self(&current)?;
            if current.is_genesis() {
                return Ok(());
            }
            current = self.check_hop(&current)?;
        }
    }

    fn check_self(&self, block: &SkipBlock) -> Result<(), ChainError> {
        if block.calculate_hash() != block.hash {
            return Err(ChainError::HashMismatch(hex::encode(block.hash)));
        }
        if block.roster.is_empty() {
            return Err(ChainError::InvalidBlock(format!(
                "Block {} doesn't have a roster",
                hex::encode(block.hash)
            )));
        }
        if block.is_genesis() && block.index != 0 {
            return Err(ChainError::InvalidBlock(format!(
                "Block {} at index {} has no back-links",
                hex::encode(block.hash),
                block.index
            )));
        }
        block.verify_forward_signatures(self.verifier)
    }

    /// Checks every back-link of `block` and returns the ancestor at its
    /// highest level, from where the walk continues.
    fn check_hop(&self, block: &SkipBlock) -> Result<SkipBlock, ChainError> {
        if block.back_link_ids.len() != block.height as usize {
            return Err(ChainError::InvalidBlock(format!(
                "Block {} has height {} but {} back-links",
                hex::encode(block.hash),
                block.height,
                block.back_link_ids.len()
            )));
        }

        let mut last: Option<SkipBlock> = None;
        for (level, id) in block.back_link_ids.iter().enumerate() {
            let ancestor = self.lookup.get(id).ok_or_else(|| ChainError::MissingAncestor {
                level,
                id: hex::encode(id),
            })?;

            let expected_order = match &last {
                None => block.index.checked_sub(1) == Some(ancestor.index),
                Some(prev) => ancestor.index <= prev.index,
            };
            if !expected_order {
                return Err(ChainError::BrokenLink {
                    level,
                    reason: format!(
                        "ancestor index {} out of order for block index {}",
                        ancestor.index, block.index
                    ),
                });
            }

            let link = ancestor.forward_link(level).ok_or_else(|| ChainError::BrokenLink {
                level,
                reason: format!("ancestor {} has no forward link", hex::encode(ancestor.hash)),
            })?;
            if link.to != block.hash {
                return Err(ChainError::BrokenLink {
                    level,
                    reason: format!(
                        "ancestor {} points to {} instead of {}",
                        hex::encode(ancestor.hash),
                        hex::encode(link.to),
                        hex::encode(block.hash)
                    ),
                });
            }
            link.verify(&ancestor.roster.publics(), self.verifier)
                .map_err(|e| ChainError::BadSignature {
                    level,
                    reason: e.to_string(),
                })?;

            debug!(level, index = ancestor.index, "verified forward link");
            last = Some(ancestor);
        }

        last.ok_or_else(|| ChainError::InvalidBlock("Non-genesis block without back-links".to_string()))
    }
}
