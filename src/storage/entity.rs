use std::fmt;
use std::ops::{Deref, DerefMut};

pub const DEFAULT_BLOCK_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct BlockId(pub u64);
impl BlockId {
    pub const INVALID_BLOCK_ID: BlockId = BlockId(u64::MAX);

    pub fn to_u64(self) -> u64 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID_BLOCK_ID
    }
}

impl Default for BlockId {
    fn default() -> Self {
        Self::INVALID_BLOCK_ID
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Owned storage for one block image.
///
/// The length is fixed at construction; every block handled by one cache has the same size.
#[derive(Clone, PartialEq, Eq)]
pub struct BlockData {
    bytes: Box<[u8]>,
}

impl BlockData {
    pub fn zeroed(block_size: usize) -> Self {
        Self {
            bytes: vec![0u8; block_size].into_boxed_slice(),
        }
    }
}

impl From<Vec<u8>> for BlockData {
    fn from(bytes: Vec<u8>) -> Self {
        Self {
            bytes: bytes.into_boxed_slice(),
        }
    }
}

impl fmt::Debug for BlockData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockData")
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl Deref for BlockData {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.bytes
    }
}

impl DerefMut for BlockData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.bytes
    }
}
