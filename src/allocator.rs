use crate::error::Error;
use crate::storage::entity::BlockId;

/// Hands out block ids above everything already present on disk.
#[derive(Debug)]
pub struct BlockIdAllocator {
    // 採番するブロックを決めるカウンタ
    next_block_id: u64,
}

impl BlockIdAllocator {
    pub fn new(next_block_id: u64) -> Self {
        Self { next_block_id }
    }

    pub fn peek(&self) -> BlockId {
        BlockId(self.next_block_id)
    }

    pub fn allocate(&mut self) -> Result<BlockId, Error> {
        let block_id = BlockId(self.next_block_id);
        if !block_id.is_valid() {
            return Err(Error::AllocatorExhausted);
        }
        self.next_block_id += 1;
        Ok(block_id)
    }
}
