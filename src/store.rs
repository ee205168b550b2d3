//! Block store: the arena every other component reads blocks from.
//!
//! Blocks are owned by value and keyed by their content hash. Once stored a
//! block only changes in two ways: a forward-link slot is filled (exactly once
//! per level) when a later block at that level is appended, or a child chain
//! is registered in `child_sl`.

use crate::blockchain::{height_for_index, BlockId, ChainVerifier, ForwardLink, Roster, SkipBlock};
use crate::crypto::{CollectiveSigner, SignatureVerifier, ThresholdVerifier};
use crate::error::ChainError;
use crate::persistence::{InMemoryPersistence, Persistence};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Read access to stored blocks by identity.
pub trait BlockLookup: Send + Sync {
    fn get(&self, id: &BlockId) -> Option<SkipBlock>;
}

impl<T: BlockLookup + ?Sized> BlockLookup for Arc<T> {
    fn get(&self, id: &BlockId) -> Option<SkipBlock> {
        (**self).get(id)
    }
}

#[derive(Default)]
struct StoreInner {
    blocks: HashMap<BlockId, SkipBlock>,
    /// Skipchain id -> hash of the latest block of that chain.
    tips: HashMap<BlockId, BlockId>,
}

impl StoreInner {
    fn fetch(&self, id: &BlockId) -> Result<&SkipBlock, ChainError> {
        self.blocks
            .get(id)
            .ok_or_else(|| ChainError::BlockNotFound(hex::encode(id)))
    }

    fn track_tip(&mut self, block: &SkipBlock) {
        let chain_id = block.skipchain_id();
        let newer = match self.tips.get(&chain_id).and_then(|t| self.blocks.get(t)) {
            Some(tip) => block.index > tip.index,
            None => true,
        };
        if newer {
            self.tips.insert(chain_id, block.hash);
        }
    }
}

pub struct BlockStore {
    inner: RwLock<StoreInner>,
    persistence: Box<dyn Persistence>,
    /// Checks every forward link before it is committed.
    signatures: Arc<dyn SignatureVerifier>,
}

impl Default for BlockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockStore {
    /// Create an empty store backed by in-memory persistence.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            persistence: Box::new(InMemoryPersistence::new()),
            signatures: Arc::new(ThresholdVerifier),
        }
    }

    /// Create a store on top of `persistence`, replaying every saved block.
    pub fn open(persistence: Box<dyn Persistence>) -> Result<Self, ChainError> {
        let mut inner = StoreInner::default();
        for block in persistence.load_blocks()? {
            if block.calculate_hash() != block.hash {
                return Err(ChainError::HashMismatch(hex::encode(block.hash)));
            }
            inner.blocks.insert(block.hash, block);
        }
        let hashes: Vec<BlockId> = inner.blocks.keys().copied().collect();
        for hash in hashes {
            if let Some(block) = inner.blocks.get(&hash).cloned() {
                inner.track_tip(&block);
            }
        }
        info!(blocks = inner.blocks.len(), chains = inner.tips.len(), "Block store opened");

        Ok(Self {
            inner: RwLock::new(inner),
            persistence,
            signatures: Arc::new(ThresholdVerifier),
        })
    }

    /// Replaces the verifier new forward links are checked with.
    pub fn with_verifier(mut self, signatures: Arc<dyn SignatureVerifier>) -> Self {
        self.signatures = signatures;
        self
    }

    pub fn len(&self) -> usize {
        self.inner.read().blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &BlockId) -> bool {
        self.inner.read().blocks.contains_key(id)
    }

    /// Latest block of the chain identified by its genesis hash.
    pub fn latest(&self, chain_id: &BlockId) -> Option<SkipBlock> {
        let inner = self.inner.read();
        inner
            .tips
            .get(chain_id)
            .and_then(|tip| inner.blocks.get(tip))
            .cloned()
    }

    /// Stores an externally built block. A block already present keeps its
    /// filled forward-link slots; only missing levels are taken over.
    pub fn store(&self, block: SkipBlock) -> Result<BlockId, ChainError> {
        if block.calculate_hash() != block.hash {
            return Err(ChainError::HashMismatch(hex::encode(block.hash)));
        }

        let mut inner = self.inner.write();
        let merged = match inner.blocks.get(&block.hash) {
            Some(existing) => {
                let mut merged = existing.clone();
                for (level, link) in block.forward_links.iter().enumerate() {
                    match merged.forward_link(level) {
                        Some(present) if present == link => {}
                        Some(_) => {
                            return Err(ChainError::ForwardLinkOccupied {
                                level,
                                id: hex::encode(block.hash),
                            })
                        }
                        None => merged.add_forward_link(level, link.clone())?,
                    }
                }
                merged
            }
            None => block,
        };

        self.persistence.save_block(&merged)?;
        let hash = merged.hash;
        inner.track_tip(&merged);
        inner.blocks.insert(hash, merged);
        Ok(hash)
    }

    /// Creates and stores a genesis block. When `parent` is given the new
    /// chain is registered as a child chain of that block.
    pub fn create_genesis(
        &self,
        roster: Roster,
        base_height: u32,
        maximum_height: u32,
        data: Vec<u8>,
        parent: Option<BlockId>,
    ) -> Result<SkipBlock, ChainError> {
        if roster.is_empty() {
            return Err(ChainError::InvalidBlock("Genesis block needs a roster".to_string()));
        }

        let mut genesis = SkipBlock::genesis(roster, base_height, maximum_height, data);
        genesis.parent_block_id = parent;
        genesis.update_hash();

        let mut inner = self.inner.write();
        if let Some(parent_id) = parent {
            let mut parent_block = inner.fetch(&parent_id)?.clone();
            parent_block.child_sl.push(genesis.hash);
            self.persistence.save_block(&genesis)?;
            self.persistence.save_block(&parent_block)?;
            inner.blocks.insert(parent_id, parent_block);
        } else {
            self.persistence.save_block(&genesis)?;
        }

        inner.track_tip(&genesis);
        inner.blocks.insert(genesis.hash, genesis.clone());
        info!(chain = %hex::encode(genesis.hash), "Created skipchain");
        Ok(genesis)
    }

    /// Appends a successor to the chain `chain_id`. The back-link targets sign
    /// their new forward links with their own rosters through `signer`; the
    /// new block carries `roster` for the links it will sign later. A link
    /// whose signature does not verify fails the append with nothing stored.
    pub fn append(
        &self,
        chain_id: &BlockId,
        roster: Roster,
        data: Vec<u8>,
        signer: &dyn CollectiveSigner,
    ) -> Result<SkipBlock, ChainError> {
        if roster.is_empty() {
            return Err(ChainError::InvalidBlock("Block needs a roster".to_string()));
        }

        let mut inner = self.inner.write();
        let tip_id = *inner
            .tips
            .get(chain_id)
            .ok_or_else(|| ChainError::BlockNotFound(hex::encode(chain_id)))?;
        let tip = inner.fetch(&tip_id)?;

        let index = tip.index.checked_add(1).ok_or_else(|| {
            ChainError::InvalidBlock(format!("Chain {} has no index left", hex::encode(chain_id)))
        })?;
        let height = height_for_index(index, tip.base_height, tip.maximum_height);

        let mut back_link_ids = Vec::with_capacity(height as usize);
        let mut pos = tip;
        for level in 0..height {
            while pos.height <= level {
                let top = pos.back_link_ids.last().ok_or_else(|| {
                    ChainError::InvalidBlock(format!(
                        "Block {} is too low for level {} and has no back-links",
                        hex::encode(pos.hash),
                        level
                    ))
                })?;
                pos = inner.fetch(top)?;
            }
            back_link_ids.push(pos.hash);
        }

        let mut block = SkipBlock {
            index,
            height,
            base_height: tip.base_height,
            maximum_height: tip.maximum_height,
            back_link_ids,
            roster,
            data,
            genesis_id: Some(*chain_id),
            ..SkipBlock::new()
        };
        block.update_hash();

        // Sign and fill every slot on copies first so a failure leaves the
        // stored ancestors untouched.
        let mut updated: Vec<SkipBlock> = Vec::with_capacity(block.back_link_ids.len());
        for (level, source_id) in block.back_link_ids.iter().enumerate() {
            // with base height 1 several levels leave from the same ancestor
            let mut source = match updated.iter().position(|b| &b.hash == source_id) {
                Some(i) => updated.remove(i),
                None => inner.fetch(source_id)?.clone(),
            };
            let publics = source.roster.publics();
            let link = ForwardLink::sign(source.hash, block.hash, &publics, signer)?;
            link.verify(&publics, self.signatures.as_ref())
                .map_err(|e| ChainError::BadSignature {
                    level,
                    reason: e.to_string(),
                })?;
            source.add_forward_link(level, link)?;
            updated.push(source);
        }

        self.persistence.save_block(&block)?;
        for source in &updated {
            self.persistence.save_block(source)?;
        }
        for source in updated {
            inner.blocks.insert(source.hash, source);
        }
        inner.track_tip(&block);
        inner.blocks.insert(block.hash, block.clone());

        debug!(index = block.index, height = block.height, "Appended block");
        Ok(block)
    }

    /// Verifier reading ancestors from this store.
    pub fn verifier<'a>(&'a self, signatures: &'a dyn SignatureVerifier) -> ChainVerifier<'a, Self> {
        ChainVerifier::new(self, signatures)
    }
}

impl BlockLookup for BlockStore {
    fn get(&self, id: &BlockId) -> Option<SkipBlock> {
        self.inner.read().blocks.get(id).cloned()
    }
}
