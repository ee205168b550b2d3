use super::link::ForwardLink;
use super::roster::Roster;
use crate::error::ChainError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Content identity of a block: SHA-256 over its immutable fields.
pub type BlockId = [u8; 32];

pub const DEFAULT_BASE_HEIGHT: u32 = 4;
pub const DEFAULT_MAXIMUM_HEIGHT: u32 = 3;

/// Which link a walk along the chain follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Follow `forward_links[0]` towards newer blocks.
    Forward,
    /// Follow `back_link_ids[0]` towards genesis.
    Backward,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkipBlock {
    pub index: u64,
    /// Number of forward-link levels originating at this block.
    pub height: u32,
    pub base_height: u32,
    pub maximum_height: u32,
    /// One ancestor per level; index 0 is the immediate predecessor.
    pub back_link_ids: Vec<BlockId>,
    /// Filled once per level, in level order, after the block is stored.
    pub forward_links: Vec<ForwardLink>,
    pub roster: Roster,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    /// Hash of the chain's genesis block; `None` on the genesis block itself.
    pub genesis_id: Option<BlockId>,
    pub parent_block_id: Option<BlockId>,
    /// Genesis ids of the chains spawned from this block.
    pub child_sl: Vec<BlockId>,
    pub hash: BlockId,
}

impl Default for SkipBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl SkipBlock {
    /// An empty block at index 0 with a single level and no roster.
    pub fn new() -> Self {
        SkipBlock {
            index: 0,
            height: 1,
            base_height: DEFAULT_BASE_HEIGHT,
            maximum_height: DEFAULT_MAXIMUM_HEIGHT,
            back_link_ids: Vec::new(),
            forward_links: Vec::new(),
            roster: Roster::default(),
            data: Vec::new(),
            genesis_id: None,
            parent_block_id: None,
            child_sl: Vec::new(),
            hash: [0u8; 32],
        }
    }

    /// A hashed genesis block carrying every level of the chain.
    pub fn genesis(roster: Roster, base_height: u32, maximum_height: u32, data: Vec<u8>) -> Self {
        let mut block = SkipBlock {
            height: maximum_height.max(1),
            base_height,
            maximum_height: maximum_height.max(1),
            roster,
            data,
            ..SkipBlock::new()
        };
        block.update_hash();
        block
    }

    pub fn calculate_hash(&self) -> BlockId {
        let mut hasher = Sha256::new();
        hasher.update(self.index.to_le_bytes());
        hasher.update(self.height.to_le_bytes());
        hasher.update(self.base_height.to_le_bytes());
        hasher.update(self.maximum_height.to_le_bytes());
        hasher.update((self.back_link_ids.len() as u64).to_le_bytes());
        for id in &self.back_link_ids {
            hasher.update(id);
        }
        self.roster.hash_into(&mut hasher);
        hasher.update((self.data.len() as u64).to_le_bytes());
        hasher.update(&self.data);
        for linkage in [&self.genesis_id, &self.parent_block_id] {
            match linkage {
                Some(id) => {
                    hasher.update([1u8]);
                    hasher.update(id);
                }
                None => hasher.update([0u8]),
            }
        }
        hasher.finalize().into()
    }

    pub fn update_hash(&mut self) -> BlockId {
        self.hash = self.calculate_hash();
        self.hash
    }

    pub fn is_genesis(&self) -> bool {
        self.back_link_ids.is_empty()
    }

    /// Identity of the chain this block belongs to.
    pub fn skipchain_id(&self) -> BlockId {
        self.genesis_id.unwrap_or(self.hash)
    }

    pub fn forward_link(&self, level: usize) -> Option<&ForwardLink> {
        self.forward_links.get(level)
    }

    /// The neighbour at level 0 in the given direction, if it exists yet.
    pub fn next_id(&self, direction: Direction) -> Option<BlockId> {
        match direction {
            Direction::Forward => self.forward_links.first().map(|l| l.to),
            Direction::Backward => self.back_link_ids.first().copied(),
        }
    }

    /// Fills forward-link slot `level`. Each slot is written exactly once and
    /// slots are filled in level order.
    pub fn add_forward_link(&mut self, level: usize, link: ForwardLink) -> Result<(), ChainError> {
        if level >= self.height as usize {
            return Err(ChainError::InvalidBlock(format!(
                "Block {} has height {}, cannot link at level {}",
                hex::encode(self.hash),
                self.height,
                level
            )));
        }
        if level < self.forward_links.len() {
            return Err(ChainError::ForwardLinkOccupied {
                level,
                id: hex::encode(self.hash),
            });
        }
        if level > self.forward_links.len() {
            return Err(ChainError::InvalidBlock(format!(
                "Forward link level {} skips level {} of block {}",
                level,
                self.forward_links.len(),
                hex::encode(self.hash)
            )));
        }
        if link.from != self.hash {
            return Err(ChainError::InvalidBlock(format!(
                "Forward link leaves from {} but was offered to {}",
                hex::encode(link.from),
                hex::encode(self.hash)
            )));
        }
        self.forward_links.push(link);
        Ok(())
    }
}

impl PartialEq for SkipBlock {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for SkipBlock {}

/// Height of the block at `index`: one more than the largest `h` below
/// `maximum_height` for which `base_height^h` divides the index.
pub fn height_for_index(index: u64, base_height: u32, maximum_height: u32) -> u32 {
    let mut height = 1;
    let mut stride: u64 = 1;
    for h in 1..maximum_height.max(1) {
        stride = stride.saturating_mul(base_height as u64);
        if stride == 0 || index % stride != 0 {
            break;
        }
        height = h + 1;
    }
    height
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CollectiveSignature, KeyPair};

    fn roster(n: usize) -> Roster {
        let keys: Vec<KeyPair> = (0..n).map(|_| KeyPair::generate()).collect();
        Roster::from_keys(&keys)
    }

    #[test]
    fn test_update_hash_assigns() {
        let mut block = SkipBlock::new();
        block.data = b"1".to_vec();
        block.height = 4;
        let h1 = block.update_hash();
        assert_eq!(h1, block.hash);
        assert_eq!(block.calculate_hash(), block.hash);
    }

    #[test]
    fn test_hash_changes_with_each_field() {
        let mut base = SkipBlock::new();
        base.roster = roster(2);
        base.data = b"payload".to_vec();
        base.back_link_ids = vec![[7u8; 32]];
        let h = base.calculate_hash();

        let mut b = base.clone();
        b.index += 1;
        assert_ne!(h, b.calculate_hash());

        let mut b = base.clone();
        b.height = 2;
        assert_ne!(h, b.calculate_hash());

        let mut b = base.clone();
        b.roster = roster(2);
        assert_ne!(h, b.calculate_hash());

        let mut b = base.clone();
        b.data = b"other".to_vec();
        assert_ne!(h, b.calculate_hash());

        let mut b = base.clone();
        b.back_link_ids[0] = [8u8; 32];
        assert_ne!(h, b.calculate_hash());

        let mut b = base.clone();
        b.parent_block_id = Some([1u8; 32]);
        assert_ne!(h, b.calculate_hash());
    }

    #[test]
    fn test_hash_ignores_forward_links_and_children() {
        let mut block = SkipBlock::genesis(roster(1), 2, 2, vec![]);
        let h = block.hash;
        block.child_sl.push([3u8; 32]);
        block
            .add_forward_link(
                0,
                ForwardLink {
                    from: h,
                    to: [9u8; 32],
                    signature: CollectiveSignature::default(),
                },
            )
            .unwrap();
        assert_eq!(block.calculate_hash(), h);
    }

    #[test]
    fn test_clone_is_deep() {
        let mut sb1 = SkipBlock::new();
        sb1.child_sl.push([3u8; 32]);
        sb1.back_link_ids.push([4u8; 32]);
        sb1.forward_links.push(ForwardLink {
            from: [0u8; 32],
            to: [5u8; 32],
            signature: CollectiveSignature::default(),
        });
        let mut sb2 = sb1.clone();

        sb1.child_sl[0] = [1u8; 32];
        sb2.child_sl[0] = [2u8; 32];
        assert_ne!(sb1.child_sl[0], sb2.child_sl[0]);

        sb2.back_link_ids[0] = [6u8; 32];
        assert_eq!(sb1.back_link_ids[0], [4u8; 32]);

        sb2.forward_links[0].to = [7u8; 32];
        assert_eq!(sb1.forward_links[0].to, [5u8; 32]);

        sb1.height = 10;
        sb2.height = 20;
        assert_ne!(sb1.height, sb2.height);
    }

    #[test]
    fn test_equality_is_by_hash() {
        let mut a = SkipBlock::new();
        a.update_hash();
        let mut b = a.clone();
        b.data = b"changed without rehash".to_vec();
        assert_eq!(a, b);
        b.update_hash();
        assert_ne!(a, b);
    }

    #[test]
    fn test_forward_link_slots_are_write_once() {
        let mut block = SkipBlock::genesis(roster(1), 2, 2, vec![]);
        let link = |to: u8| ForwardLink {
            from: block.hash,
            to: [to; 32],
            signature: CollectiveSignature::default(),
        };
        let (l0, l0b, l1) = (link(1), link(2), link(3));

        assert!(matches!(
            block.add_forward_link(1, l1.clone()),
            Err(ChainError::InvalidBlock(_))
        ));
        block.add_forward_link(0, l0).unwrap();
        assert!(matches!(
            block.add_forward_link(0, l0b),
            Err(ChainError::ForwardLinkOccupied { level: 0, .. })
        ));
        block.add_forward_link(1, l1).unwrap();
        assert_eq!(block.next_id(Direction::Forward), Some([1u8; 32]));
    }

    #[test]
    fn test_height_for_index() {
        assert_eq!(height_for_index(1, 2, 3), 1);
        assert_eq!(height_for_index(2, 2, 3), 2);
        assert_eq!(height_for_index(4, 2, 3), 3);
        assert_eq!(height_for_index(8, 2, 3), 3);
        assert_eq!(height_for_index(6, 2, 3), 2);
        assert_eq!(height_for_index(5, 4, 1), 1);
    }
}
